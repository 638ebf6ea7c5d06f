//! Component F: the wake-on-connect reverse proxy. `proxy` holds the axum
//! handler that resolves a request to an instance, calls `Ensure`, and
//! forwards the request (including WebSocket upgrades); this module owns
//! the explicit port-forwarding table used by the guest-facing
//! `expose_port`/`unexpose_port` operations.

pub mod proxy;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::lifecycle::LifecycleManager;

const EPHEMERAL_PORT_START: u16 = 40000;

/// `(instance_id, guest_port) -> public_port`, the table a guest's
/// `expose_port` call populates. Independent of the backend's own
/// guest-port-to-host-port mapping, which the lifecycle manager already
/// tracks per instance.
#[derive(Default)]
struct PortTable {
    assignments: Mutex<HashMap<(String, u16), u16>>,
    next_ephemeral: AtomicU16,
}

impl PortTable {
    fn new() -> Self {
        Self { assignments: Mutex::new(HashMap::new()), next_ephemeral: AtomicU16::new(EPHEMERAL_PORT_START) }
    }

    fn lookup(&self, instance_id: &str, guest_port: u16) -> Option<u16> {
        self.assignments.lock().get(&(instance_id.to_string(), guest_port)).copied()
    }

    fn assign(&self, instance_id: &str, guest_port: u16) -> u16 {
        let public = self.next_ephemeral.fetch_add(1, Ordering::SeqCst);
        self.assignments.lock().insert((instance_id.to_string(), guest_port), public);
        public
    }

    fn remove(&self, instance_id: &str, guest_port: u16) {
        self.assignments.lock().remove(&(instance_id.to_string(), guest_port));
    }
}

/// Owns the public port-forwarding table and the background TCP
/// forwarders it drives; the HTTP reverse proxy itself lives in
/// [`proxy`] as a plain axum handler closed over an `Arc<Router>`.
pub struct Router {
    manager: Arc<LifecycleManager>,
    ports: PortTable,
    listeners: Mutex<HashMap<(String, u16), JoinHandle<()>>>,
}

impl Router {
    pub fn new(manager: Arc<LifecycleManager>) -> Arc<Self> {
        Arc::new(Self { manager, ports: PortTable::new(), listeners: Mutex::new(HashMap::new()) })
    }

    pub fn manager(&self) -> &Arc<LifecycleManager> {
        &self.manager
    }

    pub fn exposed_port(&self, instance_id: &str, guest_port: u16) -> Option<u16> {
        self.ports.lookup(instance_id, guest_port)
    }

    /// Idempotent: a repeat call for the same `(instance_id, guest_port)`
    /// returns the already-assigned public port without starting a second
    /// listener.
    pub async fn expose_port(self: &Arc<Self>, instance_id: &str, guest_port: u16) -> Result<u16> {
        if let Some(existing) = self.ports.lookup(instance_id, guest_port) {
            return Ok(existing);
        }
        let public_port = self.ports.assign(instance_id, guest_port);
        if let Err(e) = self.spawn_forwarder(instance_id.to_string(), guest_port, public_port).await {
            self.ports.remove(instance_id, guest_port);
            return Err(e);
        }
        Ok(public_port)
    }

    pub fn unexpose_port(&self, instance_id: &str, guest_port: u16) {
        self.ports.remove(instance_id, guest_port);
        if let Some(handle) = self.listeners.lock().remove(&(instance_id.to_string(), guest_port)) {
            handle.abort();
        }
    }

    async fn spawn_forwarder(
        self: &Arc<Self>,
        instance_id: String,
        guest_port: u16,
        public_port: u16,
    ) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", public_port)).await.map_err(Error::Io)?;
        let manager = self.manager.clone();
        let listener_instance_id = instance_id.clone();
        let handle = tokio::spawn(async move {
            let instance_id = listener_instance_id;
            loop {
                let (mut inbound, _) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!(error = %e, "port-forward listener accept failed");
                        break;
                    }
                };
                let manager = manager.clone();
                let instance_id = instance_id.clone();
                tokio::spawn(async move {
                    let Ok(instance) = manager.ensure(&instance_id).await else { return };
                    manager.on_connection_open(&instance_id).await;
                    let host_port = {
                        let inner = instance.lock().await;
                        inner.endpoints.iter().find(|e| e.guest_port == guest_port).map(|e| e.host_port)
                    };
                    if let Some(host_port) = host_port {
                        if let Ok(mut outbound) = tokio::net::TcpStream::connect(("127.0.0.1", host_port)).await {
                            let _ = tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await;
                        }
                    }
                    manager.on_connection_close(&instance_id).await;
                });
            }
        });
        self.listeners.lock().insert((instance_id, guest_port), handle);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::process::ProcessBackend;
    use crate::backend::{ExposePortSpec, Protocol};
    use crate::capability::TokenCodec;
    use crate::config::DaemonConfig;
    use crate::lifecycle::manager::CreateRequest;
    use crate::registry::MemoryRegistry;
    use crate::tether::TetherStore;

    fn manager() -> Arc<LifecycleManager> {
        LifecycleManager::new(
            DaemonConfig::default(),
            Arc::new(ProcessBackend::new()),
            Arc::new(TetherStore::default()),
            Arc::new(MemoryRegistry::default()),
            Arc::new(TokenCodec::generate()),
        )
    }

    #[tokio::test]
    async fn expose_port_is_idempotent() {
        let manager = manager();
        let instance = manager
            .create(CreateRequest {
                handle_alias: None,
                parent_id: None,
                command: vec!["sleep".into(), "5".into()],
                expose_ports: vec![ExposePortSpec { guest_port: 80, protocol: Protocol::Tcp }],
                image_ref: None,
                workspace_path: None,
                env: vec![],
                memory_mb: None,
                vcpus: None,
            })
            .await
            .unwrap();
        let router = Router::new(manager);
        let first = router.expose_port(&instance.id, 80).await.unwrap();
        let second = router.expose_port(&instance.id, 80).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn unexpose_port_clears_mapping() {
        let manager = manager();
        let instance = manager
            .create(CreateRequest {
                handle_alias: None,
                parent_id: None,
                command: vec!["sleep".into(), "5".into()],
                expose_ports: vec![ExposePortSpec { guest_port: 80, protocol: Protocol::Tcp }],
                image_ref: None,
                workspace_path: None,
                env: vec![],
                memory_mb: None,
                vcpus: None,
            })
            .await
            .unwrap();
        let router = Router::new(manager);
        router.expose_port(&instance.id, 80).await.unwrap();
        router.unexpose_port(&instance.id, 80);
        assert!(router.exposed_port(&instance.id, 80).is_none());
    }
}
