//! Component B: per-instance ring-buffer registry, seq assignment, and
//! long-poll reads.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::frame::{Filter, TetherFrame};
use super::ring_buffer::{RingBuffer, Subscription, DEFAULT_CAPACITY, DEFAULT_SUBSCRIBER_CAPACITY};

struct Entry {
    ring: RingBuffer,
    seq_counter: AtomicU64,
    notify: Notify,
}

/// Result of a [`TetherStore::poll`] call.
pub struct PollResult {
    pub frames: Vec<TetherFrame>,
    pub next_seq: u64,
    pub timed_out: bool,
}

/// Keyed by instance id, maps to a [`RingBuffer`] plus the monotonic seq
/// counter for that instance. The counter never resets and never goes
/// backward within one process lifetime.
pub struct TetherStore {
    capacity: usize,
    subscriber_capacity: usize,
    entries: Mutex<HashMap<String, Arc<Entry>>>,
}

impl Default for TetherStore {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_SUBSCRIBER_CAPACITY)
    }
}

impl TetherStore {
    pub fn new(capacity: usize, subscriber_capacity: usize) -> Self {
        Self { capacity, subscriber_capacity, entries: Mutex::new(HashMap::new()) }
    }

    fn entry_for(&self, instance_id: &str) -> Arc<Entry> {
        let mut entries = self.entries.lock();
        entries
            .entry(instance_id.to_string())
            .or_insert_with(|| {
                Arc::new(Entry {
                    ring: RingBuffer::with_subscriber_capacity(self.capacity, self.subscriber_capacity),
                    seq_counter: AtomicU64::new(0),
                    notify: Notify::new(),
                })
            })
            .clone()
    }

    /// Assign the next seq for `instance_id` and store the frame.
    pub fn append(&self, instance_id: &str, mut frame: TetherFrame) -> u64 {
        let entry = self.entry_for(instance_id);
        let seq = entry.seq_counter.fetch_add(1, Ordering::SeqCst) + 1;
        frame.seq = seq;
        entry.ring.append(frame);
        entry.notify.notify_waiters();
        seq
    }

    pub fn subscribe(&self, instance_id: &str) -> Subscription {
        self.entry_for(instance_id).ring.subscribe()
    }

    pub fn recent(&self, instance_id: &str, n: usize) -> Vec<TetherFrame> {
        self.entry_for(instance_id).ring.recent(n)
    }

    /// Up to `limit` frames with `seq > after_seq` matching `filter`,
    /// blocking up to `wait` if nothing matches yet and `wait > 0`.
    pub async fn poll(
        &self,
        instance_id: &str,
        filter: &Filter,
        after_seq: u64,
        limit: usize,
        wait: Duration,
    ) -> PollResult {
        let entry = self.entry_for(instance_id);
        let deadline = Instant::now() + wait;
        loop {
            // Register interest before checking, so an append landing in
            // the gap between the check and the await below still wakes
            // this poll instead of being missed.
            let notified = entry.notify.notified();
            let matched = Self::matching(&entry, filter, after_seq, limit);
            if !matched.is_empty() {
                let next_seq = matched.last().map(|f| f.seq).unwrap_or(after_seq);
                return PollResult { frames: matched, next_seq, timed_out: false };
            }
            if wait.is_zero() {
                return PollResult { frames: Vec::new(), next_seq: after_seq, timed_out: false };
            }
            tokio::select! {
                _ = notified => continue,
                _ = tokio::time::sleep_until(deadline) => {
                    return PollResult { frames: Vec::new(), next_seq: after_seq, timed_out: true };
                }
            }
        }
    }

    fn matching(entry: &Entry, filter: &Filter, after_seq: u64, limit: usize) -> Vec<TetherFrame> {
        entry
            .ring
            .all()
            .into_iter()
            .filter(|f| f.seq > after_seq && filter.matches(f))
            .take(limit)
            .collect()
    }

    /// Close subscribers and drop the ring for `instance_id`. The seq
    /// counter is dropped with it — restart of tether state for an
    /// instance id is not guaranteed to continue the old sequence (this
    /// is documented as an open caveat, not a stronger guarantee).
    pub fn remove(&self, instance_id: &str) {
        let removed = self.entries.lock().remove(instance_id);
        if let Some(entry) = removed {
            entry.ring.close_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tether::frame::Session;

    fn frame(ty: &str, channel: &str, session: &str) -> TetherFrame {
        TetherFrame::new(ty, Session { channel: channel.into(), id: session.into() }, None, Vec::new())
    }

    #[test]
    fn seq_is_strictly_increasing_and_gap_free_per_instance() {
        let store = TetherStore::default();
        let mut seqs = Vec::new();
        for _ in 0..5 {
            seqs.push(store.append("i1", frame("assistant.delta", "host", "s1")));
        }
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn seq_counters_are_independent_per_instance() {
        let store = TetherStore::default();
        store.append("i1", frame("assistant.delta", "host", "s1"));
        let first_i2 = store.append("i2", frame("assistant.delta", "host", "s1"));
        assert_eq!(first_i2, 1);
    }

    #[tokio::test]
    async fn poll_returns_immediately_when_frames_already_present() {
        let store = TetherStore::default();
        store.append("i1", frame("assistant.delta", "host", "s1"));
        let result = store.poll("i1", &Filter::default(), 0, 10, Duration::ZERO).await;
        assert_eq!(result.frames.len(), 1);
        assert!(!result.timed_out);
        assert_eq!(result.next_seq, 1);
    }

    #[tokio::test]
    async fn poll_times_out_when_nothing_matches() {
        let store = TetherStore::default();
        let result = store.poll("i1", &Filter::default(), 0, 10, Duration::from_millis(20)).await;
        assert!(result.frames.is_empty());
        assert!(result.timed_out);
        assert_eq!(result.next_seq, 0);
    }

    #[tokio::test]
    async fn poll_wakes_on_matching_append() {
        let store = Arc::new(TetherStore::default());
        let store2 = store.clone();
        let handle = tokio::spawn(async move {
            store2.poll("i1", &Filter::default(), 0, 10, Duration::from_secs(5)).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        store.append("i1", frame("assistant.done", "host", "s1"));
        let result = handle.await.unwrap();
        assert_eq!(result.frames.len(), 1);
        assert!(!result.timed_out);
    }

    #[test]
    fn remove_drops_buffer() {
        let store = TetherStore::default();
        store.append("i1", frame("assistant.delta", "host", "s1"));
        store.remove("i1");
        assert_eq!(store.recent("i1", 10).len(), 0);
    }
}
