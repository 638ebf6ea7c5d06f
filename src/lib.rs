//! aegisvm: host-side control plane for a fleet of microVM-isolated
//! workloads.
//!
//! An [`LifecycleManager`](lifecycle::LifecycleManager) owns the
//! [`Instance`](instance::Instance) state machine (create, start, pause,
//! resume, stop) and drives a pluggable [`Backend`](backend::Backend) to
//! actually spawn a VM. Each running instance carries a JSON-RPC control
//! stream (demultiplexed by [`rpc`]), an egress event history (the
//! [`tether`] fabric), and an optional spawn [`capability`] that lets it
//! create bounded child instances of its own. A [`Router`](router::Router)
//! wakes stopped instances on first connection and forwards HTTP/WebSocket
//! traffic; [`http_api`] exposes the same lifecycle operations as a REST
//! control surface over a Unix socket.
//!
//! # Example
//!
//! ```no_run
//! use aegisvm::backend::process::ProcessBackend;
//! use aegisvm::capability::TokenCodec;
//! use aegisvm::config::DaemonConfig;
//! use aegisvm::lifecycle::LifecycleManager;
//! use aegisvm::lifecycle::manager::CreateRequest;
//! use aegisvm::registry::DiskRegistry;
//! use aegisvm::tether::TetherStore;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = DaemonConfig::default();
//!     let registry = Arc::new(DiskRegistry::new(config.state_dir.join("instances")));
//!     let manager = LifecycleManager::new(
//!         config,
//!         Arc::new(ProcessBackend::new()),
//!         Arc::new(TetherStore::default()),
//!         registry,
//!         Arc::new(TokenCodec::generate()),
//!     );
//!
//!     let instance = manager
//!         .create(CreateRequest {
//!             handle_alias: Some("demo".into()),
//!             parent_id: None,
//!             command: vec!["sleep".into(), "30".into()],
//!             expose_ports: vec![],
//!             image_ref: None,
//!             workspace_path: None,
//!             env: vec![],
//!             memory_mb: None,
//!             vcpus: None,
//!         })
//!         .await?;
//!     manager.ensure(&instance.id).await?;
//!     manager.stop(&instance.id).await?;
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod capability;
pub mod config;
pub mod error;
pub mod guest_request;
pub mod http_api;
pub mod instance;
pub mod lifecycle;
pub mod observe;
pub mod registry;
pub mod router;
pub mod rpc;
pub mod tether;

pub use error::{Error, Result};
pub use lifecycle::LifecycleManager;

/// Common imports for wiring a daemon process together.
pub mod prelude {
    pub use crate::backend::Backend;
    pub use crate::capability::{CapabilityToken, TokenCodec};
    pub use crate::config::DaemonConfig;
    pub use crate::error::{Error, Result};
    pub use crate::instance::{Instance, State};
    pub use crate::lifecycle::{LifecycleManager, StateChange};
    pub use crate::registry::InstanceRegistry;
    pub use crate::router::Router;
    pub use crate::tether::TetherStore;
}
