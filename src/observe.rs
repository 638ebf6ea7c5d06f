//! Structured log capture: guest `log` notifications (stdout/stderr lines,
//! optionally tagged with an exec id) land here before being exposed
//! through the `GET /v1/instances/{id}/logs` endpoint and `tracing`.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

const LIVE_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub ts: DateTime<Utc>,
    pub stream: LogStream,
    pub line: String,
    pub exec_id: Option<String>,
}

struct Inner {
    capacity: usize,
    entries: VecDeque<LogEntry>,
}

/// A per-instance bounded log tail, independent of the tether ring buffer
/// (tether carries arbitrary frames; this carries only stdout/stderr text
/// for the human-facing logs endpoint). `live` additionally fans each
/// pushed line out to anyone streaming a running `exec` in real time; a
/// lagging or absent subscriber never blocks `push`.
#[derive(Clone)]
pub struct LogStore {
    inner: Arc<Mutex<Inner>>,
    live: broadcast::Sender<LogEntry>,
}

impl LogStore {
    pub fn new(capacity: usize) -> Self {
        let (live, _) = broadcast::channel(LIVE_CHANNEL_CAPACITY);
        Self { inner: Arc::new(Mutex::new(Inner { capacity, entries: VecDeque::with_capacity(capacity) })), live }
    }

    pub fn push(&self, stream: LogStream, line: String, exec_id: Option<String>) {
        let entry = LogEntry { ts: Utc::now(), stream, line, exec_id };
        tracing::debug!(stream = ?entry.stream, exec_id = ?entry.exec_id, "guest log line");
        let _ = self.live.send(entry.clone());
        let mut inner = self.inner.lock();
        if inner.entries.len() == inner.capacity {
            inner.entries.pop_front();
        }
        inner.entries.push_back(entry);
    }

    pub fn tail(&self, n: usize) -> Vec<LogEntry> {
        let inner = self.inner.lock();
        let skip = inner.entries.len().saturating_sub(n);
        inner.entries.iter().skip(skip).cloned().collect()
    }

    /// Subscribe to lines as they're pushed. Only lines pushed after this
    /// call are delivered; a subscriber that falls behind observes a
    /// `Lagged` error rather than blocking the pusher.
    pub fn subscribe_live(&self) -> broadcast::Receiver<LogEntry> {
        self.live.subscribe()
    }
}

impl Default for LogStore {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_returns_most_recent_n() {
        let store = LogStore::new(10);
        for i in 0..5 {
            store.push(LogStream::Stdout, format!("line {i}"), None);
        }
        let tail = store.tail(2);
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].line, "line 3");
        assert_eq!(tail[1].line, "line 4");
    }

    #[test]
    fn bounded_capacity_evicts_oldest() {
        let store = LogStore::new(3);
        for i in 0..5 {
            store.push(LogStream::Stdout, format!("line {i}"), None);
        }
        let all = store.tail(10);
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].line, "line 2");
    }
}
