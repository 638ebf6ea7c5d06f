//! Component D: the instance state machine. A passive data record with its
//! own mutex — all mutations are performed by the `LifecycleManager`; this
//! module only guarantees that the fields it protects cannot be observed
//! half-updated.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Mutex, MutexGuard};
use tokio::task::JoinHandle;

use crate::backend::{BackendHandle, ExposePortSpec, HostEndpoint};
use crate::rpc::Demultiplexer;

/// A boxed write half, since different backends hand back different
/// concrete stream types.
pub type BoxedDemux = Demultiplexer<Box<dyn tokio::io::AsyncWrite + Unpin + Send>>;

/// `STOPPED | STARTING | RUNNING | PAUSED` — no other value is legal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum State {
    Stopped,
    Starting,
    Running,
    Paused,
}

impl State {
    pub fn is_runtime_active(self) -> bool {
        matches!(self, State::Starting | State::Running | State::Paused)
    }
}

/// The immutable desired spec, per §3: set at creation, survives `STOPPED`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DesiredSpec {
    pub command: Vec<String>,
    pub expose_ports: Vec<ExposePortSpec>,
    pub image_ref: Option<String>,
    pub workspace_path: Option<String>,
    pub env: Vec<(String, String)>,
    pub memory_mb: u32,
    pub vcpus: u32,
}

/// Mutable runtime fields, all guarded by one mutex (I1: non-zero iff
/// `state` is a runtime-active state).
pub struct InstanceInner {
    pub state: State,
    pub enabled: bool,
    pub stopped_at: Option<DateTime<Utc>>,
    pub backend_handle: Option<BackendHandle>,
    pub demux: Option<Arc<Mutex<BoxedDemux>>>,
    pub endpoints: Vec<HostEndpoint>,
    pub active_conns: i64,
    pub last_activity: Instant,
    pub idle_timer: Option<JoinHandle<()>>,
    pub stop_timer: Option<JoinHandle<()>>,
    pub exec_waiters: HashMap<String, oneshot::Sender<i32>>,
}

impl InstanceInner {
    fn new() -> Self {
        Self {
            state: State::Stopped,
            enabled: true,
            stopped_at: Some(Utc::now()),
            backend_handle: None,
            demux: None,
            endpoints: Vec::new(),
            active_conns: 0,
            last_activity: Instant::now(),
            idle_timer: None,
            stop_timer: None,
            exec_waiters: HashMap::new(),
        }
    }

    /// Cancel and drop both idle timers (I3: timers only exist while
    /// running or paused).
    pub fn clear_timers(&mut self) {
        if let Some(t) = self.idle_timer.take() {
            t.abort();
        }
        if let Some(t) = self.stop_timer.take() {
            t.abort();
        }
    }

    /// I5: deliver `-1` to every remaining exec waiter on a terminal
    /// transition, then clear the map.
    pub fn fail_all_exec_waiters(&mut self) {
        for (_, tx) in self.exec_waiters.drain() {
            let _ = tx.send(-1);
        }
    }
}

pub struct Instance {
    pub id: String,
    pub handle_alias: Option<String>,
    pub parent_id: Option<String>,
    pub spec: DesiredSpec,
    pub created_at: DateTime<Utc>,
    inner: Mutex<InstanceInner>,
}

impl Instance {
    pub fn new(
        id: String,
        handle_alias: Option<String>,
        parent_id: Option<String>,
        spec: DesiredSpec,
    ) -> Self {
        Self {
            id,
            handle_alias,
            parent_id,
            spec,
            created_at: Utc::now(),
            inner: Mutex::new(InstanceInner::new()),
        }
    }

    pub async fn lock(&self) -> MutexGuard<'_, InstanceInner> {
        self.inner.lock().await
    }

    /// `FirstGuestPort()` per §4.D.
    pub fn first_guest_port(&self) -> u16 {
        self.spec.expose_ports.first().map(|p| p.guest_port).unwrap_or(0)
    }

    pub async fn snapshot(&self) -> InstanceSnapshot {
        let inner = self.inner.lock().await;
        InstanceSnapshot {
            id: self.id.clone(),
            handle_alias: self.handle_alias.clone(),
            parent_id: self.parent_id.clone(),
            state: inner.state,
            enabled: inner.enabled,
            stopped_at: inner.stopped_at,
            created_at: self.created_at,
            active_conns: inner.active_conns,
            image_ref: self.spec.image_ref.clone(),
            workspace_path: self.spec.workspace_path.clone(),
            endpoints: inner.endpoints.clone(),
        }
    }

    /// Register a single-slot exec waiter *before* issuing the RPC, per
    /// the exec-completion-race note in §9.
    pub async fn register_exec_waiter(&self, exec_id: String) -> oneshot::Receiver<i32> {
        let (tx, rx) = oneshot::channel();
        self.inner.lock().await.exec_waiters.insert(exec_id, tx);
        rx
    }

    pub async fn resolve_exec_waiter(&self, exec_id: &str, exit_code: i32) {
        if let Some(tx) = self.inner.lock().await.exec_waiters.remove(exec_id) {
            let _ = tx.send(exit_code);
        }
    }
}

/// A read-only, owned view of an instance's state, safe to hand out over
/// HTTP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceSnapshot {
    pub id: String,
    pub handle_alias: Option<String>,
    pub parent_id: Option<String>,
    pub state: State,
    pub enabled: bool,
    pub stopped_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub active_conns: i64,
    pub image_ref: Option<String>,
    pub workspace_path: Option<String>,
    pub endpoints: Vec<HostEndpoint>,
}
