//! The `Backend` trait: the single extension point a real VMM driver must
//! implement. Everything downstream of §6 treats this as an opaque
//! capability object — creating/starting/pausing/stopping VMs, and
//! reporting the host-side endpoints a guest's declared ports landed on.

pub mod process;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::Result;

/// Opaque handle returned by `create_vm`; backends may stuff whatever they
/// need to find the VM again into the string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BackendHandle(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExposePortSpec {
    pub guest_port: u16,
    pub protocol: Protocol,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RootfsSpec {
    Image { image_ref: String },
    Path { path: String },
    None,
}

/// Parameters for `create_vm`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmConfig {
    pub rootfs: RootfsSpec,
    pub memory_mb: u32,
    pub vcpus: u32,
    pub expose_ports: Vec<ExposePortSpec>,
    pub workspace_path: Option<String>,
    pub kernel_args: Vec<String>,
    pub command: Vec<String>,
    pub env: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostEndpoint {
    pub guest_port: u16,
    pub host_port: u16,
    pub protocol: Protocol,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendCapabilities {
    pub name: String,
    pub supports_pause: bool,
    pub rootfs_type: String,
    pub guest_arch: String,
    pub network_backend: String,
}

/// One half of a duplex byte stream, type-erased so different backends can
/// hand back sockets, pipes, or in-process channels uniformly.
pub type BoxedRead = Box<dyn AsyncRead + Unpin + Send>;
pub type BoxedWrite = Box<dyn AsyncWrite + Unpin + Send>;

pub struct ControlStream {
    pub read: BoxedRead,
    pub write: BoxedWrite,
}

/// The VMM driver boundary. A production implementation talks to
/// KVM/hypervisor internals; this crate carries only [`process::ProcessBackend`]
/// as a reference implementation for tests and local development.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn create_vm(&self, cfg: &VmConfig) -> Result<BackendHandle>;

    /// Start a created VM and return its control stream.
    async fn start_vm(&self, handle: &BackendHandle) -> Result<ControlStream>;

    /// May return `Err(Error::BackendUnsupported(..))`; the lifecycle
    /// manager must refrain from auto-pause when so.
    async fn pause_vm(&self, handle: &BackendHandle) -> Result<()>;

    async fn resume_vm(&self, handle: &BackendHandle) -> Result<()>;

    /// Irrevocable; frees all resources associated with `handle`.
    async fn stop_vm(&self, handle: &BackendHandle) -> Result<()>;

    async fn host_endpoints(&self, handle: &BackendHandle) -> Result<Vec<HostEndpoint>>;

    fn capabilities(&self) -> BackendCapabilities;
}
