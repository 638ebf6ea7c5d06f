//! Component E: `LifecycleManager` owns every instance and is the only
//! collaborator allowed to drive its state machine. Lock ordering is
//! Manager mutex -> Instance mutex -> (RingBuffer | Demultiplexer) mutex,
//! and this module never climbs back upward.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::Mutex;

use aegisvm_protocol::RunParams;

use crate::backend::{Backend, ExposePortSpec, RootfsSpec, VmConfig};
use crate::capability::TokenCodec;
use crate::config::DaemonConfig;
use crate::error::{Error, Result};
use crate::instance::{BoxedDemux, DesiredSpec, Instance, State};
use crate::observe::{LogStore, LogStream};
use crate::registry::{InstanceRegistry, PersistedInstance};
use crate::rpc::Demultiplexer;
use crate::tether::TetherStore;

/// Request shape for [`LifecycleManager::create`].
pub struct CreateRequest {
    pub handle_alias: Option<String>,
    pub parent_id: Option<String>,
    pub command: Vec<String>,
    pub expose_ports: Vec<ExposePortSpec>,
    pub image_ref: Option<String>,
    pub workspace_path: Option<String>,
    pub env: Vec<(String, String)>,
    pub memory_mb: Option<u32>,
    pub vcpus: Option<u32>,
}

/// Returned by [`LifecycleManager::exec_stream`]: an in-flight exec the
/// caller can follow line by line.
pub struct ExecStreamHandle {
    pub exec_id: String,
    pub log_rx: tokio::sync::broadcast::Receiver<crate::observe::LogEntry>,
    pub waiter: tokio::sync::oneshot::Receiver<i32>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct StateChange {
    pub instance_id: String,
    pub state: State,
}

/// A single observer slot, per the observer-callback design note: it must
/// not perform long-running work, only re-dispatch.
pub type StateObserver = Arc<dyn Fn(StateChange) + Send + Sync>;

pub struct LifecycleManager {
    config: DaemonConfig,
    backend: Arc<dyn Backend>,
    tether: Arc<TetherStore>,
    registry: Arc<dyn InstanceRegistry>,
    capability_codec: Arc<TokenCodec>,
    instances: Mutex<HashMap<String, Arc<Instance>>>,
    handle_aliases: Mutex<HashMap<String, String>>,
    log_stores: Mutex<HashMap<String, LogStore>>,
    observer: Mutex<Option<StateObserver>>,
    /// Set once, after the `Router` is constructed over this manager, so
    /// guest-initiated `expose_port`/`unexpose_port` requests can reach
    /// the public port-forwarding table.
    router: Mutex<Option<Arc<crate::router::Router>>>,
}

impl LifecycleManager {
    pub fn new(
        config: DaemonConfig,
        backend: Arc<dyn Backend>,
        tether: Arc<TetherStore>,
        registry: Arc<dyn InstanceRegistry>,
        capability_codec: Arc<TokenCodec>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            backend,
            tether,
            registry,
            capability_codec,
            instances: Mutex::new(HashMap::new()),
            handle_aliases: Mutex::new(HashMap::new()),
            log_stores: Mutex::new(HashMap::new()),
            observer: Mutex::new(None),
            router: Mutex::new(None),
        })
    }

    pub async fn set_router(&self, router: Arc<crate::router::Router>) {
        *self.router.lock().await = Some(router);
    }

    pub async fn router(&self) -> Option<Arc<crate::router::Router>> {
        self.router.lock().await.clone()
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    pub fn tether(&self) -> &Arc<TetherStore> {
        &self.tether
    }

    pub fn capability_codec(&self) -> &Arc<TokenCodec> {
        &self.capability_codec
    }

    pub async fn set_observer(&self, observer: StateObserver) {
        *self.observer.lock().await = Some(observer);
    }

    async fn notify_state(&self, instance_id: &str, state: State) {
        if let Some(observer) = self.observer.lock().await.as_ref() {
            observer(StateChange { instance_id: instance_id.to_string(), state });
        }
    }

    async fn log_store_for(&self, id: &str) -> LogStore {
        self.log_stores.lock().await.entry(id.to_string()).or_insert_with(LogStore::default).clone()
    }

    /// The per-instance log store, for callers that need to subscribe to
    /// live lines (e.g. a streaming `exec`) rather than just tail it.
    pub async fn log_store(&self, id: &str) -> LogStore {
        self.log_store_for(id).await
    }

    pub async fn log_tail(&self, id: &str, n: usize) -> Vec<crate::observe::LogEntry> {
        self.log_store_for(id).await.tail(n)
    }

    /// Repopulate the in-memory instance table from the registry at
    /// startup. Every restored instance starts `STOPPED`; nothing is
    /// re-booted until the next `Ensure` call reaches it.
    pub async fn restore(self: &Arc<Self>) -> Result<()> {
        let persisted = self.registry.load_all().await?;
        let mut instances = self.instances.lock().await;
        let mut aliases = self.handle_aliases.lock().await;
        for p in persisted {
            let spec = DesiredSpec {
                command: p.command,
                expose_ports: p.expose_ports,
                image_ref: p.image_ref,
                workspace_path: p.workspace_path,
                env: p.env,
                memory_mb: p.memory_mb,
                vcpus: p.vcpus,
            };
            let instance = Arc::new(Instance::new(p.id.clone(), p.handle_alias.clone(), p.parent_id, spec));
            instance.lock().await.enabled = p.enabled;
            if let Some(alias) = &p.handle_alias {
                aliases.insert(alias.clone(), p.id.clone());
            }
            instances.insert(p.id, instance);
        }
        Ok(())
    }

    pub async fn create(self: &Arc<Self>, req: CreateRequest) -> Result<Arc<Instance>> {
        let id = uuid::Uuid::new_v4().to_string();
        let spec = DesiredSpec {
            command: req.command,
            expose_ports: req.expose_ports,
            image_ref: req.image_ref,
            workspace_path: req.workspace_path,
            env: req.env,
            memory_mb: req.memory_mb.unwrap_or(self.config.default_memory_mb),
            vcpus: req.vcpus.unwrap_or(self.config.default_vcpus),
        };
        let instance = Arc::new(Instance::new(id.clone(), req.handle_alias.clone(), req.parent_id.clone(), spec));

        {
            let mut instances = self.instances.lock().await;
            let mut aliases = self.handle_aliases.lock().await;
            if let Some(alias) = &req.handle_alias {
                if aliases.contains_key(alias) {
                    return Err(Error::Conflict(format!("handle alias already in use: {alias}")));
                }
                aliases.insert(alias.clone(), id.clone());
            }
            instances.insert(id.clone(), instance.clone());
        }

        self.persist(&instance).await?;
        Ok(instance)
    }

    async fn persist(&self, instance: &Instance) -> Result<()> {
        let inner = instance.lock().await;
        let persisted = PersistedInstance {
            id: instance.id.clone(),
            handle_alias: instance.handle_alias.clone(),
            parent_id: instance.parent_id.clone(),
            image_ref: instance.spec.image_ref.clone(),
            workspace_path: instance.spec.workspace_path.clone(),
            command: instance.spec.command.clone(),
            env: instance.spec.env.clone(),
            expose_ports: instance.spec.expose_ports.clone(),
            last_known_public_ports: Vec::new(),
            enabled: inner.enabled,
            memory_mb: instance.spec.memory_mb,
            vcpus: instance.spec.vcpus,
            created_at: instance.created_at,
        };
        self.registry.save(&persisted).await
    }

    pub async fn lookup(&self, id: &str) -> Option<Arc<Instance>> {
        self.instances.lock().await.get(id).cloned()
    }

    pub async fn lookup_by_handle(&self, alias: &str) -> Option<Arc<Instance>> {
        let id = self.handle_aliases.lock().await.get(alias).cloned()?;
        self.lookup(&id).await
    }

    pub async fn list(&self) -> Vec<Arc<Instance>> {
        self.instances.lock().await.values().cloned().collect()
    }

    pub async fn children_of(&self, parent_id: &str) -> Vec<Arc<Instance>> {
        self.instances
            .lock()
            .await
            .values()
            .filter(|i| i.parent_id.as_deref() == Some(parent_id))
            .cloned()
            .collect()
    }

    fn require(&self, instance: Option<Arc<Instance>>, id: &str) -> Result<Arc<Instance>> {
        instance.ok_or_else(|| Error::NotFound(id.to_string()))
    }

    /// `Ensure(id)`: the router's wake-on-connect entry point. Boots from
    /// `STOPPED`, resumes from `PAUSED`, waits out an in-flight `STARTING`,
    /// and is a no-op when already `RUNNING`.
    pub async fn ensure(self: &Arc<Self>, id: &str) -> Result<Arc<Instance>> {
        let instance = self.require(self.lookup(id).await, id)?;
        let deadline = Instant::now() + self.config.ensure_timeout;
        // Once this call has observed STARTING, it is waiting out someone
        // else's boot (`WaitForRunning`), not starting one of its own: if
        // that boot then fails and the instance lands back on STOPPED, this
        // call must report the failure rather than silently kick off a
        // fresh `Boot` of its own.
        let mut waiting_for_running = false;

        loop {
            let state = {
                let inner = instance.lock().await;
                if !inner.enabled {
                    return Err(Error::Disabled);
                }
                inner.state
            };
            match state {
                State::Running => return Ok(instance),
                State::Paused => {
                    self.resume(&instance).await?;
                    return Ok(instance);
                }
                State::Stopped => {
                    if waiting_for_running {
                        return Err(Error::Backend("instance failed to boot".into()));
                    }
                    self.boot(&instance).await?;
                    return Ok(instance);
                }
                State::Starting => {
                    waiting_for_running = true;
                    if Instant::now() >= deadline {
                        return Err(Error::Starting);
                    }
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }
    }

    /// Boot sequence (§4.E): mark `STARTING`, create and start the VM,
    /// wire the demultiplexer, run the boot command, collect host
    /// endpoints, mark `RUNNING`, and arm the idle timer.
    async fn boot(self: &Arc<Self>, instance: &Arc<Instance>) -> Result<()> {
        {
            let mut inner = instance.lock().await;
            inner.state = State::Starting;
        }
        self.notify_state(&instance.id, State::Starting).await;

        let cfg = VmConfig {
            rootfs: instance
                .spec
                .image_ref
                .clone()
                .map(|image_ref| RootfsSpec::Image { image_ref })
                .unwrap_or(RootfsSpec::None),
            memory_mb: instance.spec.memory_mb,
            vcpus: instance.spec.vcpus,
            expose_ports: instance.spec.expose_ports.clone(),
            workspace_path: instance.spec.workspace_path.clone(),
            kernel_args: Vec::new(),
            command: instance.spec.command.clone(),
            env: instance.spec.env.clone(),
        };

        let boot_result = self.boot_inner(instance, &cfg).await;
        if let Err(e) = boot_result {
            let mut inner = instance.lock().await;
            inner.state = State::Stopped;
            inner.stopped_at = Some(chrono::Utc::now());
            self.notify_state(&instance.id, State::Stopped).await;
            return Err(e);
        }
        Ok(())
    }

    async fn boot_inner(self: &Arc<Self>, instance: &Arc<Instance>, cfg: &VmConfig) -> Result<()> {
        let handle = self.backend.create_vm(cfg).await?;
        let control = self.backend.start_vm(&handle).await?;

        let notification_handler = Arc::new(InstanceNotifications {
            manager: self.clone(),
            instance: instance.clone(),
            log_store: self.log_store_for(&instance.id).await,
        });
        let guest_handler = Arc::new(crate::guest_request::InstanceGuestRequests {
            manager: self.clone(),
            instance: instance.clone(),
        });

        let demux: BoxedDemux = Demultiplexer::spawn(control.read, control.write, notification_handler, guest_handler);
        let demux = Arc::new(tokio::sync::Mutex::new(demux));

        let run_params = RunParams { command: cfg.command.clone(), env: cfg.env.clone() };
        let run_value = serde_json::to_value(&run_params).map_err(Error::Serde)?;
        {
            let demux = demux.lock().await;
            demux.call("run", Some(run_value), self.config.boot_timeout).await?;
        }

        let endpoints = self.backend.host_endpoints(&handle).await?;

        let mut inner = instance.lock().await;
        inner.backend_handle = Some(handle);
        inner.demux = Some(demux);
        inner.endpoints = endpoints;
        inner.state = State::Running;
        inner.last_activity = Instant::now();
        inner.clear_timers();
        drop(inner);
        self.schedule_idle_timer(instance);
        self.notify_state(&instance.id, State::Running).await;
        Ok(())
    }

    async fn resume(self: &Arc<Self>, instance: &Arc<Instance>) -> Result<()> {
        let handle = {
            let inner = instance.lock().await;
            inner.backend_handle.clone().ok_or_else(|| Error::Internal("paused instance missing backend handle".into()))?
        };
        self.backend.resume_vm(&handle).await?;
        let mut inner = instance.lock().await;
        inner.state = State::Running;
        inner.last_activity = Instant::now();
        inner.clear_timers();
        drop(inner);
        self.schedule_idle_timer(instance);
        self.notify_state(&instance.id, State::Running).await;
        Ok(())
    }

    /// Explicit, user-triggered pause (distinct from the idle-driven
    /// auto-pause fired by the idle timer).
    pub async fn pause(self: &Arc<Self>, id: &str) -> Result<()> {
        let instance = self.require(self.lookup(id).await, id)?;
        let caps = self.backend.capabilities();
        if !caps.supports_pause {
            return Err(Error::BackendUnsupported("backend does not support pause".into()));
        }
        let handle = {
            let inner = instance.lock().await;
            if inner.state != State::Running {
                return Err(Error::Conflict("instance is not running".into()));
            }
            inner.backend_handle.clone().ok_or_else(|| Error::Internal("running instance missing backend handle".into()))?
        };
        self.backend.pause_vm(&handle).await?;
        let mut inner = instance.lock().await;
        inner.clear_timers();
        inner.state = State::Paused;
        drop(inner);
        self.schedule_stop_timer(&instance);
        self.notify_state(id, State::Paused).await;
        Ok(())
    }

    fn schedule_idle_timer(self: &Arc<Self>, instance: &Arc<Instance>) {
        let manager = self.clone();
        let instance = instance.clone();
        let instance_for_timer = instance.clone();
        let delay = self.config.pause_after_idle;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            manager.fire_idle_pause(&instance).await;
        });
        tokio::spawn(stash_idle_timer(instance_for_timer, handle));
    }

    fn schedule_stop_timer(self: &Arc<Self>, instance: &Arc<Instance>) {
        let manager = self.clone();
        let instance_clone = instance.clone();
        let delay = self.config.stop_after_idle;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            manager.fire_idle_stop(&instance_clone).await;
        });
        tokio::spawn(stash_stop_timer(instance.clone(), handle));
    }

    /// Fires when the pause timer elapses. Must recheck state under the
    /// instance mutex before acting: a connection may have arrived and
    /// reset activity in the meantime.
    async fn fire_idle_pause(self: &Arc<Self>, instance: &Arc<Instance>) {
        let caps = self.backend.capabilities();
        let should_pause = {
            let inner = instance.lock().await;
            inner.state == State::Running && inner.active_conns == 0 && caps.supports_pause
        };
        if !should_pause {
            return;
        }
        let handle = {
            let inner = instance.lock().await;
            inner.backend_handle.clone()
        };
        let Some(handle) = handle else { return };
        if self.backend.pause_vm(&handle).await.is_err() {
            return;
        }
        let mut inner = instance.lock().await;
        if inner.state != State::Running {
            return;
        }
        inner.state = State::Paused;
        drop(inner);
        self.schedule_stop_timer(instance);
        self.notify_state(&instance.id, State::Paused).await;
    }

    async fn fire_idle_stop(self: &Arc<Self>, instance: &Arc<Instance>) {
        let still_idle_paused = {
            let inner = instance.lock().await;
            inner.state == State::Paused && inner.active_conns == 0
        };
        if !still_idle_paused {
            return;
        }
        let _ = self.stop(&instance.id).await;
    }

    /// Connection accounting feeding the idle timers: activity cancels any
    /// pending timers, and the count dropping back to zero while running
    /// re-arms the idle-pause timer.
    pub async fn on_connection_open(self: &Arc<Self>, id: &str) {
        if let Some(instance) = self.lookup(id).await {
            let mut inner = instance.lock().await;
            inner.active_conns += 1;
            inner.last_activity = Instant::now();
            inner.clear_timers();
        }
    }

    pub async fn on_connection_close(self: &Arc<Self>, id: &str) {
        if let Some(instance) = self.lookup(id).await {
            let should_rearm = {
                let mut inner = instance.lock().await;
                inner.active_conns = (inner.active_conns - 1).max(0);
                inner.last_activity = Instant::now();
                inner.active_conns == 0 && inner.state == State::Running
            };
            if should_rearm {
                self.schedule_idle_timer(&instance);
            }
        }
    }

    pub async fn handle_process_exited(self: &Arc<Self>, id: &str, exit_code: i32) {
        let Some(instance) = self.lookup(id).await else { return };
        tracing::info!(instance = %id, exit_code, "guest process exited");
        let mut inner = instance.lock().await;
        inner.clear_timers();
        inner.state = State::Stopped;
        inner.stopped_at = Some(chrono::Utc::now());
        inner.backend_handle = None;
        inner.demux = None;
        inner.fail_all_exec_waiters();
        drop(inner);
        self.notify_state(id, State::Stopped).await;
    }

    /// Shared setup for both `exec` and `exec_stream`: requires the
    /// instance already be `RUNNING` (unlike the HTTP/proxy surfaces,
    /// `Exec` does not implicitly `Ensure`, so a stopped instance's exec
    /// fails with `Error::Stopped` (409) rather than silently rebooting
    /// it), registers the exec waiter before issuing the RPC — per the
    /// exec-completion race note, so a fast guest reply can never resolve
    /// before the host starts listening for it — and returns the assigned
    /// `exec_id` plus a receiver that resolves with the exit code.
    async fn begin_exec(
        self: &Arc<Self>,
        id: &str,
        command: Vec<String>,
        env: Vec<(String, String)>,
        timeout: Duration,
    ) -> Result<(String, tokio::sync::oneshot::Receiver<i32>)> {
        let instance = self.require(self.lookup(id).await, id)?;
        {
            let inner = instance.lock().await;
            if inner.state != State::Running {
                return Err(Error::Stopped);
            }
        }
        let exec_id = uuid::Uuid::new_v4().to_string();
        let waiter = instance.register_exec_waiter(exec_id.clone()).await;

        let demux = {
            let inner = instance.lock().await;
            inner.demux.clone().ok_or(Error::Stopped)?
        };
        let params = aegisvm_protocol::ExecParams { command, env, exec_id: exec_id.clone() };
        let value = serde_json::to_value(&params).map_err(Error::Serde)?;
        {
            let demux = demux.lock().await;
            demux.call("exec", Some(value), timeout).await?;
        }
        Ok((exec_id, waiter))
    }

    /// `Exec`: blocks until the guest reports completion or `timeout`
    /// elapses, returning only the final exit code. See [`Self::exec_stream`]
    /// for the line-by-line variant the HTTP surface streams.
    pub async fn exec(
        self: &Arc<Self>,
        id: &str,
        command: Vec<String>,
        env: Vec<(String, String)>,
        timeout: Duration,
    ) -> Result<i32> {
        let (exec_id, waiter) = self.begin_exec(id, command, env, timeout).await?;
        match tokio::time::timeout(timeout, waiter).await {
            Ok(Ok(code)) => Ok(code),
            Ok(Err(_)) => Err(Error::Transport("exec waiter dropped".into())),
            Err(_) => Err(Error::Timeout(format!("exec {exec_id} timed out"))),
        }
    }

    /// Like [`Self::exec`], but returns as soon as the guest has accepted
    /// the command: the exec id, a live subscription to this instance's
    /// log lines (the caller filters by `exec_id`), and a receiver that
    /// resolves with the exit code once the guest reports completion. The
    /// log subscription is created before the RPC is sent so no output
    /// line can be missed.
    pub async fn exec_stream(
        self: &Arc<Self>,
        id: &str,
        command: Vec<String>,
        env: Vec<(String, String)>,
        timeout: Duration,
    ) -> Result<ExecStreamHandle> {
        let log_store = self.log_store(id).await;
        let log_rx = log_store.subscribe_live();
        let (exec_id, waiter) = self.begin_exec(id, command, env, timeout).await?;
        Ok(ExecStreamHandle { exec_id, log_rx, waiter, timeout })
    }

    /// Idempotent: stopping an already-`STOPPED` instance is a no-op.
    pub async fn stop(self: &Arc<Self>, id: &str) -> Result<()> {
        let instance = self.require(self.lookup(id).await, id)?;
        let handle = {
            let inner = instance.lock().await;
            if inner.state == State::Stopped {
                return Ok(());
            }
            inner.backend_handle.clone()
        };

        if let Some(demux) = {
            let inner = instance.lock().await;
            inner.demux.clone()
        } {
            let mut demux = demux.lock().await;
            // Best-effort: a graceful shutdown RPC, bounded by the same
            // deadline as boot's `run` call.
            let _ = demux.call("shutdown", None, self.config.shutdown_timeout).await;
            demux.stop().await;
        }

        if let Some(handle) = handle {
            self.backend.stop_vm(&handle).await?;
        }

        let mut inner = instance.lock().await;
        inner.clear_timers();
        inner.state = State::Stopped;
        inner.stopped_at = Some(chrono::Utc::now());
        inner.backend_handle = None;
        inner.demux = None;
        inner.fail_all_exec_waiters();
        drop(inner);
        self.notify_state(id, State::Stopped).await;

        // I6: a parent transitioning to STOPPED must cascade to every
        // instance with parent_id == id. Boxed to break the recursive
        // async-fn cycle.
        for child in self.children_of(id).await {
            Box::pin(self.stop(&child.id)).await?;
        }

        Ok(())
    }

    pub async fn disable(self: &Arc<Self>, id: &str) -> Result<()> {
        self.stop(id).await?;
        let instance = self.require(self.lookup(id).await, id)?;
        instance.lock().await.enabled = false;
        self.persist(&instance).await
    }

    pub async fn delete(self: &Arc<Self>, id: &str) -> Result<()> {
        let instance = self.require(self.lookup(id).await, id)?;
        self.stop(id).await?;
        self.instances.lock().await.remove(id);
        if let Some(alias) = &instance.handle_alias {
            self.handle_aliases.lock().await.remove(alias);
        }
        self.log_stores.lock().await.remove(id);
        self.tether.remove(id);
        self.registry.delete(id).await
    }
}

// Helper bodies kept free-standing to avoid holding the instance mutex
// across an `.await` inside the spawning closures above.

async fn stash_idle_timer(instance: Arc<Instance>, handle: tokio::task::JoinHandle<()>) {
    let mut inner = instance.lock().await;
    if let Some(old) = inner.idle_timer.replace(handle) {
        old.abort();
    }
}

async fn stash_stop_timer(instance: Arc<Instance>, handle: tokio::task::JoinHandle<()>) {
    let mut inner = instance.lock().await;
    if let Some(old) = inner.stop_timer.replace(handle) {
        old.abort();
    }
}

/// Routes guest notifications (`log`, `processExited`, `execDone`) to the
/// instance's log store, the lifecycle manager's exit handling, and exec
/// waiters, respectively. Tether egress frames (`assistant.*`, `status.*`,
/// `event.*`, `control.*`) are appended to the tether store so they survive
/// for later `Poll`/`Subscribe` reads — ingress (host-to-guest) frames are
/// fire-and-forget and never land here. Installed once per boot as the
/// demultiplexer's notification handler; per the wire contract, this must
/// not block.
struct InstanceNotifications {
    manager: Arc<LifecycleManager>,
    instance: Arc<Instance>,
    log_store: LogStore,
}

const TETHER_FRAME_PREFIXES: &[&str] = &["assistant.", "status.", "event.", "control."];

impl crate::rpc::NotificationHandler for InstanceNotifications {
    fn handle(&self, method: &str, params: Option<Value>) {
        match method {
            "log" => {
                let Some(params) = params else { return };
                let Ok(payload) = serde_json::from_value::<aegisvm_protocol::LogPayload>(params) else {
                    return;
                };
                let stream = if payload.stream == "stderr" { LogStream::Stderr } else { LogStream::Stdout };
                self.log_store.push(stream, payload.line, payload.exec_id);
            }
            "processExited" => {
                let Some(params) = params else { return };
                let Ok(payload) = serde_json::from_value::<aegisvm_protocol::ProcessExitedPayload>(params)
                else {
                    return;
                };
                let manager = self.manager.clone();
                let id = self.instance.id.clone();
                tokio::spawn(async move {
                    manager.handle_process_exited(&id, payload.exit_code).await;
                });
            }
            "execDone" => {
                let Some(params) = params else { return };
                let Ok(payload) = serde_json::from_value::<aegisvm_protocol::ExecDonePayload>(params) else {
                    return;
                };
                let instance = self.instance.clone();
                tokio::spawn(async move {
                    instance.resolve_exec_waiter(&payload.exec_id, payload.exit_code).await;
                });
            }
            other if TETHER_FRAME_PREFIXES.iter().any(|p| other.starts_with(p)) => {
                let Some(params) = params else { return };
                let Ok(wire) = serde_json::from_value::<aegisvm_protocol::WireTetherFrame>(params) else {
                    return;
                };
                let session = crate::tether::Session { channel: wire.channel, id: wire.session_id };
                let payload = serde_json::to_vec(&wire.payload).unwrap_or_default();
                let frame = crate::tether::TetherFrame::new(wire.frame_type, session, wire.msg_id, payload);
                self.manager.tether().append(&self.instance.id, frame);
            }
            other => {
                tracing::debug!(method = other, "unhandled notification");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::process::ProcessBackend;
    use crate::backend::Protocol;
    use crate::registry::MemoryRegistry;

    fn manager() -> Arc<LifecycleManager> {
        let mut config = DaemonConfig::default();
        config.pause_after_idle = Duration::from_millis(50);
        config.stop_after_idle = Duration::from_millis(50);
        config.boot_timeout = Duration::from_secs(5);
        LifecycleManager::new(
            config,
            Arc::new(ProcessBackend::new()),
            Arc::new(TetherStore::default()),
            Arc::new(MemoryRegistry::default()),
            Arc::new(TokenCodec::generate()),
        )
    }

    fn req(command: Vec<&str>) -> CreateRequest {
        CreateRequest {
            handle_alias: None,
            parent_id: None,
            command: command.into_iter().map(String::from).collect(),
            expose_ports: vec![ExposePortSpec { guest_port: 9000, protocol: Protocol::Tcp }],
            image_ref: None,
            workspace_path: None,
            env: vec![],
            memory_mb: None,
            vcpus: None,
        }
    }

    #[tokio::test]
    async fn ensure_boots_a_stopped_instance() {
        let manager = manager();
        let instance = manager.create(req(vec!["sleep", "5"])).await.unwrap();
        let ensured = manager.ensure(&instance.id).await.unwrap();
        assert_eq!(ensured.lock().await.state, State::Running);
        manager.stop(&instance.id).await.unwrap();
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let manager = manager();
        let instance = manager.create(req(vec!["sleep", "5"])).await.unwrap();
        manager.ensure(&instance.id).await.unwrap();
        manager.stop(&instance.id).await.unwrap();
        manager.stop(&instance.id).await.unwrap();
        assert_eq!(instance.lock().await.state, State::Stopped);
    }

    #[tokio::test]
    async fn process_exit_transitions_to_stopped_and_sets_stopped_at() {
        let manager = manager();
        let instance = manager.create(req(vec!["true"])).await.unwrap();
        manager.ensure(&instance.id).await.unwrap();
        // The `true` command exits almost immediately; wait for the
        // `processExited` notification to land.
        for _ in 0..50 {
            if instance.lock().await.state == State::Stopped {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let inner = instance.lock().await;
        assert_eq!(inner.state, State::Stopped);
        assert!(inner.stopped_at.is_some());
    }

    #[tokio::test]
    async fn disable_prevents_ensure() {
        let manager = manager();
        let instance = manager.create(req(vec!["sleep", "5"])).await.unwrap();
        manager.disable(&instance.id).await.unwrap();
        let result = manager.ensure(&instance.id).await;
        assert!(matches!(result, Err(Error::Disabled)));
    }

    #[tokio::test]
    async fn delete_removes_instance_from_lookup() {
        let manager = manager();
        let instance = manager.create(req(vec!["sleep", "5"])).await.unwrap();
        let id = instance.id.clone();
        manager.delete(&id).await.unwrap();
        assert!(manager.lookup(&id).await.is_none());
    }

    #[tokio::test]
    async fn stop_cascades_to_children() {
        let manager = manager();
        let parent = manager.create(req(vec!["sleep", "5"])).await.unwrap();
        let mut child_req = req(vec!["sleep", "5"]);
        child_req.parent_id = Some(parent.id.clone());
        let child = manager.create(child_req).await.unwrap();
        manager.ensure(&parent.id).await.unwrap();
        manager.ensure(&child.id).await.unwrap();

        manager.stop(&parent.id).await.unwrap();

        assert_eq!(parent.lock().await.state, State::Stopped);
        assert_eq!(child.lock().await.state, State::Stopped);
    }

    fn notifications_for(manager: &Arc<LifecycleManager>, instance: &Arc<Instance>, log_store: LogStore) -> InstanceNotifications {
        InstanceNotifications { manager: manager.clone(), instance: instance.clone(), log_store }
    }

    #[tokio::test]
    async fn tether_egress_notifications_are_appended_to_tether_store() {
        use crate::rpc::NotificationHandler;

        let manager = manager();
        let instance = manager.create(req(vec!["sleep", "5"])).await.unwrap();
        let log_store = manager.log_store(&instance.id).await;
        let notifications = notifications_for(&manager, &instance, log_store);

        let wire = aegisvm_protocol::WireTetherFrame {
            version: 1,
            frame_type: "assistant.delta".into(),
            ts_ms: 0,
            channel: "host".into(),
            session_id: "s1".into(),
            msg_id: Some("m1".into()),
            payload: serde_json::json!({ "text": "hi" }),
        };
        notifications.handle("assistant.delta", Some(serde_json::to_value(&wire).unwrap()));

        let result =
            manager.tether().poll(&instance.id, &crate::tether::Filter::default(), 0, 10, Duration::ZERO).await;
        assert_eq!(result.frames.len(), 1);
        assert_eq!(result.frames[0].frame_type, "assistant.delta");
        assert_eq!(result.frames[0].msg_id, Some("m1".to_string()));
    }

    #[tokio::test]
    async fn unrecognized_notification_methods_are_not_appended_to_tether() {
        use crate::rpc::NotificationHandler;

        let manager = manager();
        let instance = manager.create(req(vec!["sleep", "5"])).await.unwrap();
        let log_store = manager.log_store(&instance.id).await;
        let notifications = notifications_for(&manager, &instance, log_store);

        notifications.handle("some.unknown.thing", None);

        let result =
            manager.tether().poll(&instance.id, &crate::tether::Filter::default(), 0, 10, Duration::ZERO).await;
        assert!(result.frames.is_empty());
    }
}
