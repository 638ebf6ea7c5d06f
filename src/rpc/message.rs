//! Thin host-side wrapper around the wire types in `aegisvm-protocol`:
//! outbound call-id generation and the pending-response map keyed by a
//! normalized [`RpcId`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

use aegisvm_protocol::{RpcErrorObject, RpcId};
use serde_json::Value;
use tokio::sync::oneshot;

pub type PendingResult = Result<Value, RpcErrorObject>;
pub type PendingMap = HashMap<RpcId, oneshot::Sender<PendingResult>>;

/// Generates fresh numeric call ids, one per outbound `Call`.
#[derive(Default)]
pub struct IdGenerator {
    next: AtomicI64,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self { next: AtomicI64::new(1) }
    }

    pub fn next(&self) -> RpcId {
        RpcId::Num(self.next.fetch_add(1, Ordering::SeqCst))
    }
}
