//! `ProcessBackend`: a reference [`Backend`] that runs the declared command
//! as a real host OS process, plus an in-process task ("the harness
//! simulator") speaking the same newline-delimited JSON-RPC protocol a
//! real in-guest supervisor would speak. It is not a production VMM — no
//! isolation is provided, ports are not remapped — but it drives the
//! `LifecycleManager` through exactly the same control-stream contract a
//! real backend would, which is what makes the lifecycle end-to-end tests
//! meaningful without a kernel image or hypervisor.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use aegisvm_protocol::{
    classify, decode_line, encode_line, new_error_response, new_notification, new_response,
    Classified, RpcErrorObject,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::Mutex as AsyncMutex;

use super::{
    Backend, BackendCapabilities, BackendHandle, ControlStream, HostEndpoint, Protocol, VmConfig,
};
use crate::error::{Error, Result};

struct VmState {
    main_pid: Option<u32>,
    paused: bool,
    endpoints: Vec<HostEndpoint>,
}

/// A process-based reference `Backend`. Shared across the daemon; each
/// `create_vm` call allocates a fresh logical handle.
pub struct ProcessBackend {
    next_id: AtomicU64,
    vms: Mutex<HashMap<String, Arc<AsyncMutex<VmState>>>>,
}

impl Default for ProcessBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessBackend {
    pub fn new() -> Self {
        Self { next_id: AtomicU64::new(1), vms: Mutex::new(HashMap::new()) }
    }

    fn handle_state(&self, handle: &BackendHandle) -> Result<Arc<AsyncMutex<VmState>>> {
        self.vms
            .lock()
            .get(&handle.0)
            .cloned()
            .ok_or_else(|| Error::Backend(format!("unknown handle {}", handle.0)))
    }
}

#[async_trait]
impl Backend for ProcessBackend {
    async fn create_vm(&self, cfg: &VmConfig) -> Result<BackendHandle> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let handle = BackendHandle(format!("proc-{id}"));
        let endpoints = cfg
            .expose_ports
            .iter()
            .map(|p| HostEndpoint { guest_port: p.guest_port, host_port: p.guest_port, protocol: p.protocol })
            .collect();
        self.vms.lock().insert(
            handle.0.clone(),
            Arc::new(AsyncMutex::new(VmState { main_pid: None, paused: false, endpoints })),
        );
        Ok(handle)
    }

    async fn start_vm(&self, handle: &BackendHandle) -> Result<ControlStream> {
        let state = self.handle_state(handle)?;
        let (host_side, harness_side) = tokio::io::duplex(1 << 20);
        let (host_read, host_write) = tokio::io::split(host_side);

        tokio::spawn(harness_loop(harness_side, state));

        Ok(ControlStream { read: Box::new(host_read), write: Box::new(host_write) })
    }

    async fn pause_vm(&self, handle: &BackendHandle) -> Result<()> {
        let state = self.handle_state(handle)?;
        let mut state = state.lock().await;
        let Some(pid) = state.main_pid else {
            return Err(Error::Backend("no running process to pause".into()));
        };
        nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), nix::sys::signal::Signal::SIGSTOP)
            .map_err(|e| Error::Backend(format!("SIGSTOP failed: {e}")))?;
        state.paused = true;
        Ok(())
    }

    async fn resume_vm(&self, handle: &BackendHandle) -> Result<()> {
        let state = self.handle_state(handle)?;
        let mut state = state.lock().await;
        let Some(pid) = state.main_pid else {
            return Err(Error::Backend("no running process to resume".into()));
        };
        nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), nix::sys::signal::Signal::SIGCONT)
            .map_err(|e| Error::Backend(format!("SIGCONT failed: {e}")))?;
        state.paused = false;
        Ok(())
    }

    async fn stop_vm(&self, handle: &BackendHandle) -> Result<()> {
        let state = self.handle_state(handle)?;
        {
            let state = state.lock().await;
            if let Some(pid) = state.main_pid {
                let _ = nix::sys::signal::kill(
                    nix::unistd::Pid::from_raw(pid as i32),
                    nix::sys::signal::Signal::SIGKILL,
                );
            }
        }
        self.vms.lock().remove(&handle.0);
        Ok(())
    }

    async fn host_endpoints(&self, handle: &BackendHandle) -> Result<Vec<HostEndpoint>> {
        let state = self.handle_state(handle)?;
        let endpoints = state.lock().await.endpoints.clone();
        Ok(endpoints)
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            name: "process".to_string(),
            supports_pause: true,
            rootfs_type: "none".to_string(),
            guest_arch: std::env::consts::ARCH.to_string(),
            network_backend: "host-loopback".to_string(),
        }
    }
}

/// The harness simulator: speaks the same protocol a real in-guest
/// supervisor would, backed by a real OS child process.
async fn harness_loop(stream: tokio::io::DuplexStream, state: Arc<AsyncMutex<VmState>>) {
    let (read_half, write_half) = tokio::io::split(stream);
    let writer = Arc::new(AsyncMutex::new(write_half));
    let mut lines = BufReader::new(read_half).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(l)) => l,
            Ok(None) | Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }
        let raw = match decode_line(line.as_bytes()) {
            Ok(r) => r,
            Err(_) => continue,
        };
        match classify(&raw) {
            Classified::GuestRequest { id, method, params } => {
                let writer = writer.clone();
                let state = state.clone();
                tokio::spawn(async move {
                    handle_method(id, method, params, writer, state).await;
                });
            }
            Classified::Response { .. } | Classified::Notification { .. } | Classified::Unrecognized => {
                // The harness never issues outbound calls of its own in
                // this reference implementation, so nothing else is
                // expected on this stream.
            }
        }
    }
}

async fn handle_method(
    id: Value,
    method: String,
    params: Option<Value>,
    writer: Arc<AsyncMutex<tokio::io::WriteHalf<tokio::io::DuplexStream>>>,
    state: Arc<AsyncMutex<VmState>>,
) {
    match method.as_str() {
        "run" => {
            let command: Vec<String> = params
                .as_ref()
                .and_then(|p| p.get("command"))
                .and_then(|c| serde_json::from_value(c.clone()).ok())
                .unwrap_or_default();
            if command.is_empty() {
                reply_err(&writer, id, "run requires a non-empty command").await;
                return;
            }
            match spawn_main(command, &writer, &state).await {
                Ok(()) => reply_ok(&writer, id, Value::Null).await,
                Err(e) => reply_err(&writer, id, &e.to_string()).await,
            }
        }
        "exec" => {
            let exec_id = params
                .as_ref()
                .and_then(|p| p.get("exec_id"))
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let command: Vec<String> = params
                .as_ref()
                .and_then(|p| p.get("command"))
                .and_then(|c| serde_json::from_value(c.clone()).ok())
                .unwrap_or_default();
            reply_ok(&writer, id, Value::Null).await;
            run_exec(exec_id, command, writer.clone()).await;
        }
        "shutdown" => {
            let state = state.lock().await;
            if let Some(pid) = state.main_pid {
                let _ = nix::sys::signal::kill(
                    nix::unistd::Pid::from_raw(pid as i32),
                    nix::sys::signal::Signal::SIGTERM,
                );
            }
            reply_ok(&writer, id, Value::Null).await;
        }
        other => {
            reply_err(&writer, id, &format!("unknown method: {other}")).await;
        }
    }
}

async fn spawn_main(
    command: Vec<String>,
    writer: &Arc<AsyncMutex<tokio::io::WriteHalf<tokio::io::DuplexStream>>>,
    state: &Arc<AsyncMutex<VmState>>,
) -> Result<()> {
    let mut cmd = Command::new(&command[0]);
    cmd.args(&command[1..]).stdout(Stdio::piped()).stderr(Stdio::piped()).kill_on_drop(true);
    let mut child = cmd.spawn().map_err(|e| Error::Backend(format!("spawn failed: {e}")))?;
    let pid = child.id().ok_or_else(|| Error::Backend("process exited immediately".into()))?;
    state.lock().await.main_pid = Some(pid);

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let writer_out = writer.clone();
    if let Some(stdout) = stdout {
        tokio::spawn(pump_log(stdout, "stdout".to_string(), None, writer_out));
    }
    let writer_err = writer.clone();
    if let Some(stderr) = stderr {
        tokio::spawn(pump_log(stderr, "stderr".to_string(), None, writer_err));
    }

    let writer = writer.clone();
    tokio::spawn(async move {
        let exit_status = child.wait().await;
        let code = exit_status.ok().and_then(|s| s.code()).unwrap_or(-1);
        let note = new_notification("processExited", Some(serde_json::json!({ "exit_code": code })));
        if let Ok(line) = encode_line(&note) {
            let mut w = writer.lock().await;
            let _ = w.write_all(&line).await;
        }
    });

    Ok(())
}

async fn run_exec(
    exec_id: String,
    command: Vec<String>,
    writer: Arc<AsyncMutex<tokio::io::WriteHalf<tokio::io::DuplexStream>>>,
) {
    if command.is_empty() {
        send_exec_done(&writer, exec_id, -1).await;
        return;
    }
    let mut cmd = Command::new(&command[0]);
    cmd.args(&command[1..]).stdout(Stdio::piped()).stderr(Stdio::piped());
    let code = match cmd.spawn() {
        Ok(mut child) => {
            if let Some(stdout) = child.stdout.take() {
                tokio::spawn(pump_log(stdout, "stdout".to_string(), Some(exec_id.clone()), writer.clone()));
            }
            if let Some(stderr) = child.stderr.take() {
                tokio::spawn(pump_log(stderr, "stderr".to_string(), Some(exec_id.clone()), writer.clone()));
            }
            child.wait().await.ok().and_then(|s| s.code()).unwrap_or(-1)
        }
        Err(_) => -1,
    };
    send_exec_done(&writer, exec_id, code).await;
}

async fn send_exec_done(
    writer: &Arc<AsyncMutex<tokio::io::WriteHalf<tokio::io::DuplexStream>>>,
    exec_id: String,
    exit_code: i32,
) {
    let note = new_notification(
        "execDone",
        Some(serde_json::json!({ "exec_id": exec_id, "exit_code": exit_code })),
    );
    if let Ok(line) = encode_line(&note) {
        let mut w = writer.lock().await;
        let _ = w.write_all(&line).await;
    }
}

async fn pump_log<R: tokio::io::AsyncRead + Unpin>(
    stream: R,
    stream_name: String,
    exec_id: Option<String>,
    writer: Arc<AsyncMutex<tokio::io::WriteHalf<tokio::io::DuplexStream>>>,
) {
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let mut payload = serde_json::json!({ "stream": stream_name, "line": line });
        if let Some(exec_id) = &exec_id {
            payload["exec_id"] = Value::String(exec_id.clone());
        }
        let note = new_notification("log", Some(payload));
        if let Ok(encoded) = encode_line(&note) {
            let mut w = writer.lock().await;
            if w.write_all(&encoded).await.is_err() {
                break;
            }
        }
    }
}

async fn reply_ok(
    writer: &Arc<AsyncMutex<tokio::io::WriteHalf<tokio::io::DuplexStream>>>,
    id: Value,
    result: Value,
) {
    let msg = new_response(id, result);
    if let Ok(line) = encode_line(&msg) {
        let mut w = writer.lock().await;
        let _ = w.write_all(&line).await;
    }
}

async fn reply_err(
    writer: &Arc<AsyncMutex<tokio::io::WriteHalf<tokio::io::DuplexStream>>>,
    id: Value,
    message: &str,
) {
    let msg = new_error_response(id, RpcErrorObject::new(-32000, message));
    if let Ok(line) = encode_line(&msg) {
        let mut w = writer.lock().await;
        let _ = w.write_all(&line).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ExposePortSpec, RootfsSpec};

    fn cfg(command: Vec<&str>) -> VmConfig {
        VmConfig {
            rootfs: RootfsSpec::None,
            memory_mb: 128,
            vcpus: 1,
            expose_ports: vec![ExposePortSpec { guest_port: 9, protocol: Protocol::Tcp }],
            workspace_path: None,
            kernel_args: vec![],
            command: command.into_iter().map(String::from).collect(),
            env: vec![],
        }
    }

    #[tokio::test]
    async fn create_and_stop_vm() {
        let backend = ProcessBackend::new();
        let handle = backend.create_vm(&cfg(vec!["true"])).await.unwrap();
        let endpoints = backend.host_endpoints(&handle).await.unwrap();
        assert_eq!(endpoints.len(), 1);
        backend.stop_vm(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn run_and_receive_process_exited() {
        use tokio::io::AsyncBufReadExt;
        let backend = ProcessBackend::new();
        let handle = backend.create_vm(&cfg(vec!["echo", "hi"])).await.unwrap();
        let stream = backend.start_vm(&handle).await.unwrap();
        let mut writer = stream.write;
        let mut lines = BufReader::new(stream.read).lines();

        let req = aegisvm_protocol::new_request(
            aegisvm_protocol::RpcId::Num(1),
            "run",
            Some(serde_json::json!({"command": ["echo", "hi"], "env": []})),
        );
        writer.write_all(&encode_line(&req).unwrap()).await.unwrap();

        let mut saw_exit = false;
        for _ in 0..20 {
            let Some(line) = lines.next_line().await.unwrap() else { break };
            let raw = decode_line(line.as_bytes()).unwrap();
            if raw.method.as_deref() == Some("processExited") {
                saw_exit = true;
                break;
            }
        }
        assert!(saw_exit, "expected a processExited notification");
    }
}
