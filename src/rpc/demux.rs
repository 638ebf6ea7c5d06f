//! Component C: one persistent reader over a single VM's duplex control
//! stream, routing JSON-RPC responses to callers, notifications to a
//! handler, and guest-originated requests to a handler.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use aegisvm_protocol::{
    classify, decode_line, encode_line, new_error_response, new_request, new_response, Classified,
    RpcErrorObject,
};
use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{oneshot, Mutex as AsyncMutex};

use super::message::{IdGenerator, PendingMap};
use crate::error::{Error, Result};

/// Invoked synchronously for every notification; must not block — the
/// expectation (per the wire contract) is that implementations re-dispatch
/// onto store/log/waiter channels rather than doing work inline.
pub trait NotificationHandler: Send + Sync {
    fn handle(&self, method: &str, params: Option<Value>);
}

impl<F> NotificationHandler for F
where
    F: Fn(&str, Option<Value>) + Send + Sync,
{
    fn handle(&self, method: &str, params: Option<Value>) {
        self(method, params)
    }
}

/// Services RPC calls originated by the guest. Invoked in a freshly spawned
/// task per call; the reply is written back on the same stream with the
/// same id.
#[async_trait]
pub trait GuestRequestHandler: Send + Sync {
    async fn handle(
        &self,
        method: String,
        params: Option<Value>,
    ) -> std::result::Result<Value, RpcErrorObject>;
}

struct WriteState<W> {
    writer: W,
    pending: PendingMap,
}

/// Owns one duplex stream to a single VM's control channel.
pub struct Demultiplexer<W> {
    write_state: Arc<AsyncMutex<WriteState<W>>>,
    ids: IdGenerator,
    stopped: Arc<AtomicBool>,
    reader_task: Option<tokio::task::JoinHandle<()>>,
}

impl<W> Demultiplexer<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    /// Spawn the reader loop over `reader`/`writer` halves of one duplex
    /// stream. `notification_handler` and `guest_handler` are installed
    /// before the first line is read.
    pub fn spawn<R>(
        reader: R,
        writer: W,
        notification_handler: Arc<dyn NotificationHandler>,
        guest_handler: Arc<dyn GuestRequestHandler>,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let write_state = Arc::new(AsyncMutex::new(WriteState { writer, pending: PendingMap::new() }));
        let stopped = Arc::new(AtomicBool::new(false));

        let reader_task = {
            let write_state = write_state.clone();
            let stopped = stopped.clone();
            tokio::spawn(async move {
                reader_loop(reader, write_state, notification_handler, guest_handler).await;
                stopped.store(true, Ordering::SeqCst);
            })
        };

        Self { write_state, ids: IdGenerator::new(), stopped, reader_task: Some(reader_task) }
    }

    /// Issue an outbound call and wait for its response, a transport
    /// failure, or `timeout`, whichever comes first.
    pub async fn call(&self, method: &str, params: Option<Value>, timeout: Duration) -> Result<Value> {
        let id = self.ids.next();
        let (tx, rx) = oneshot::channel();

        {
            let mut state = self.write_state.lock().await;
            state.pending.insert(id.clone(), tx);
            let msg = new_request(id.clone(), method, params);
            let line = encode_line(&msg)?;
            if let Err(e) = state.writer.write_all(&line).await {
                state.pending.remove(&id);
                return Err(Error::Transport(format!("write failed: {e}")));
            }
        }

        let outcome = tokio::time::timeout(timeout, rx).await;
        match outcome {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(rpc_err))) => Err(Error::Transport(format!(
                "guest error {}: {}",
                rpc_err.code, rpc_err.message
            ))),
            Ok(Err(_recv_err)) => Err(Error::Transport("demuxer stopped".into())),
            Err(_elapsed) => {
                self.write_state.lock().await.pending.remove(&id);
                Err(Error::Timeout(format!("call to {method} timed out")))
            }
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Cancel the reader, close pending waiters, and wait for the reader
    /// task to exit. Idempotent.
    pub async fn stop(&mut self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            if let Some(task) = self.reader_task.take() {
                let _ = task.await;
            }
            return;
        }
        if let Some(task) = self.reader_task.take() {
            task.abort();
            let _ = task.await;
        }
        let mut state = self.write_state.lock().await;
        for (_, tx) in state.pending.drain() {
            let _ = tx.send(Err(RpcErrorObject::new(-32000, "demuxer stopped")));
        }
    }
}

async fn reader_loop<R, W>(
    reader: R,
    write_state: Arc<AsyncMutex<WriteState<W>>>,
    notification_handler: Arc<dyn NotificationHandler>,
    guest_handler: Arc<dyn GuestRequestHandler>,
) where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    use tokio::io::AsyncBufReadExt;
    let mut lines = BufReader::new(reader).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break, // EOF
            Err(e) => {
                tracing::warn!(error = %e, "control stream read error");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let raw = match decode_line(line.as_bytes()) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(error = %e, "dropping malformed control-stream line");
                continue;
            }
        };

        match classify(&raw) {
            Classified::Response { id, result, error } => {
                let mut state = write_state.lock().await;
                if let Some(tx) = state.pending.remove(&id) {
                    let payload = match error {
                        Some(e) => Err(e),
                        None => Ok(result.unwrap_or(Value::Null)),
                    };
                    let _ = tx.send(payload);
                }
            }
            Classified::GuestRequest { id, method, params } => {
                let write_state = write_state.clone();
                let guest_handler = guest_handler.clone();
                tokio::spawn(async move {
                    let reply = match guest_handler.handle(method, params).await {
                        Ok(result) => new_response(id, result),
                        Err(err) => new_error_response(id, err),
                    };
                    if let Ok(line) = encode_line(&reply) {
                        let mut state = write_state.lock().await;
                        let _ = state.writer.write_all(&line).await;
                    }
                });
            }
            Classified::Notification { method, params } => {
                notification_handler.handle(&method, params);
            }
            Classified::Unrecognized => {
                tracing::warn!(line = %line, "dropping unrecognized control-stream message");
            }
        }
    }

    // Reader exiting terminates every in-flight call.
    let mut state = write_state.lock().await;
    for (_, tx) in state.pending.drain() {
        let _ = tx.send(Err(RpcErrorObject::new(-32000, "control stream closed")));
    }
}
