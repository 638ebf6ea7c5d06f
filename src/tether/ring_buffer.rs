//! Component A: a bounded FIFO of tether frames with live subscribers.
//!
//! Appenders must never block on subscribers — a stuck consumer must not
//! stall a VM's log path. Notification happens against a snapshot of the
//! subscriber list taken under the structural lock, then delivered
//! unlocked, so subscribe/unsubscribe during notification never deadlocks
//! and a full subscriber channel silently drops that one frame instead of
//! blocking the appender or other subscribers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::frame::TetherFrame;

pub const DEFAULT_CAPACITY: usize = 1000;
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 100;

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<TetherFrame>,
}

struct Inner {
    capacity: usize,
    frames: VecDeque<TetherFrame>,
    subscribers: Vec<Subscriber>,
}

/// A handle that cancels its subscription on drop.
pub struct Subscription {
    id: u64,
    ring: Arc<RingBufferInner>,
    pub rx: mpsc::Receiver<TetherFrame>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.ring.unsubscribe(self.id);
    }
}

struct RingBufferInner {
    inner: Mutex<Inner>,
    next_sub_id: AtomicU64,
    subscriber_capacity: usize,
}

impl RingBufferInner {
    fn unsubscribe(&self, id: u64) {
        let mut inner = self.inner.lock();
        inner.subscribers.retain(|s| s.id != id);
    }
}

/// Fixed-capacity circular buffer of [`TetherFrame`], cloneable handle over
/// shared state.
#[derive(Clone)]
pub struct RingBuffer {
    shared: Arc<RingBufferInner>,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self::with_subscriber_capacity(capacity, DEFAULT_SUBSCRIBER_CAPACITY)
    }

    pub fn with_subscriber_capacity(capacity: usize, subscriber_capacity: usize) -> Self {
        Self {
            shared: Arc::new(RingBufferInner {
                inner: Mutex::new(Inner {
                    capacity: capacity.max(1),
                    frames: VecDeque::with_capacity(capacity.max(1)),
                    subscribers: Vec::new(),
                }),
                next_sub_id: AtomicU64::new(1),
                subscriber_capacity,
            }),
        }
    }

    /// Append a frame, evicting the oldest if at capacity, then notify
    /// subscribers outside the lock.
    pub fn append(&self, frame: TetherFrame) {
        let snapshot = {
            let mut inner = self.shared.inner.lock();
            if inner.frames.len() >= inner.capacity {
                inner.frames.pop_front();
            }
            inner.frames.push_back(frame.clone());
            inner.subscribers.iter().map(|s| s.tx.clone()).collect::<Vec<_>>()
        };
        for tx in snapshot {
            // `try_send`: never blocks the appender. A full channel means
            // a slow subscriber; we drop the frame for that subscriber
            // only.
            let _ = tx.try_send(frame.clone());
        }
    }

    /// Snapshot of the last `min(n, count)` frames, in append order.
    pub fn recent(&self, n: usize) -> Vec<TetherFrame> {
        let inner = self.shared.inner.lock();
        let len = inner.frames.len();
        let skip = len.saturating_sub(n);
        inner.frames.iter().skip(skip).cloned().collect()
    }

    /// All frames currently retained, in append order.
    pub fn all(&self) -> Vec<TetherFrame> {
        let inner = self.shared.inner.lock();
        inner.frames.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.shared.inner.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register a new subscriber; only frames appended after this call are
    /// delivered to it.
    pub fn subscribe(&self) -> Subscription {
        let id = self.shared.next_sub_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(self.shared.subscriber_capacity);
        self.shared.inner.lock().subscribers.push(Subscriber { id, tx });
        Subscription { id, ring: Arc::clone(&self.shared), rx }
    }

    /// Close every subscriber channel and empty the subscriber set.
    pub fn close_all(&self) {
        let mut inner = self.shared.inner.lock();
        inner.subscribers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tether::frame::Session;

    fn frame(seq: u64) -> TetherFrame {
        let mut f = TetherFrame::new(
            "assistant.delta",
            Session { channel: "host".into(), id: "s1".into() },
            None,
            vec![seq as u8],
        );
        f.seq = seq;
        f
    }

    #[test]
    fn bounded_capacity_evicts_oldest() {
        let rb = RingBuffer::new(3);
        for i in 0..5 {
            rb.append(frame(i));
        }
        assert_eq!(rb.len(), 3);
        let recent = rb.recent(10);
        assert_eq!(recent.iter().map(|f| f.seq).collect::<Vec<_>>(), vec![2, 3, 4]);
    }

    #[test]
    fn recent_is_suffix_of_append_history() {
        let rb = RingBuffer::new(10);
        for i in 0..5 {
            rb.append(frame(i));
        }
        let recent = rb.recent(2);
        assert_eq!(recent.iter().map(|f| f.seq).collect::<Vec<_>>(), vec![3, 4]);
    }

    #[tokio::test]
    async fn subscriber_sees_only_frames_after_subscription() {
        let rb = RingBuffer::new(10);
        rb.append(frame(0));
        let mut sub = rb.subscribe();
        rb.append(frame(1));
        let received = sub.rx.recv().await.unwrap();
        assert_eq!(received.seq, 1);
    }

    #[tokio::test]
    async fn slow_subscriber_drops_without_blocking_appender() {
        let rb = RingBuffer::with_subscriber_capacity(100, 1);
        let sub = rb.subscribe();
        // Fill the bounded channel, then keep appending: must not block.
        for i in 0..10 {
            rb.append(frame(i));
        }
        drop(sub);
    }

    #[test]
    fn close_all_empties_subscribers() {
        let rb = RingBuffer::new(10);
        let _sub = rb.subscribe();
        assert_eq!(rb.shared.inner.lock().subscribers.len(), 1);
        rb.close_all();
        assert_eq!(rb.shared.inner.lock().subscribers.len(), 0);
    }
}
