//! Component G: services RPCs the guest originates on its own control
//! stream — `self_info`, `list_children`, `expose_port`, `unexpose_port`
//! are self-scoped and need no capability; `spawn` and `stop_child` act on
//! (or create) other instances and are gated on a `_token` parameter
//! carrying a [`CapabilityToken`].

use std::sync::Arc;
use std::time::Duration;

use aegisvm_protocol::RpcErrorObject;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::backend::{ExposePortSpec, Protocol};
use crate::capability::CapabilityToken;
use crate::instance::Instance;
use crate::lifecycle::manager::CreateRequest;
use crate::lifecycle::LifecycleManager;
use crate::rpc::GuestRequestHandler;

const CHILD_TOKEN_TTL_MINUTES: i64 = 60;

fn rpc_err(code: i64, message: impl Into<String>) -> RpcErrorObject {
    RpcErrorObject::new(code, message)
}

fn bad_params(message: impl Into<String>) -> RpcErrorObject {
    rpc_err(-32602, message)
}

const WORKSPACE_VIRTUAL_PREFIX: &str = "/workspace";

/// `/workspace/foo` is a virtual path relative to the calling instance's
/// own workspace; translate it to `parent.workspace_path + "/foo"` before
/// handing it to the child. Anything else (an absolute host path, or no
/// workspace_path at all) passes through unchanged.
fn translate_workspace_path(requested: Option<String>, parent_workspace: Option<&str>) -> Option<String> {
    let requested = requested?;
    let Some(suffix) = requested.strip_prefix(WORKSPACE_VIRTUAL_PREFIX) else {
        return Some(requested);
    };
    let Some(parent_workspace) = parent_workspace else {
        return Some(requested);
    };
    Some(format!("{parent_workspace}{suffix}"))
}

#[derive(Deserialize)]
struct SpawnParams {
    #[serde(rename = "_token")]
    token: String,
    command: Vec<String>,
    #[serde(default)]
    image_ref: Option<String>,
    #[serde(default)]
    workspace_path: Option<String>,
    #[serde(default)]
    env: Vec<(String, String)>,
    #[serde(default)]
    memory_mb: Option<u32>,
    #[serde(default)]
    vcpus: Option<u32>,
    #[serde(default)]
    expose_ports: Vec<ExposePortSpec>,
}

#[derive(Serialize, Deserialize)]
struct SpawnResult {
    instance_id: String,
    token: String,
}

#[derive(Deserialize)]
struct StopChildParams {
    #[serde(rename = "_token")]
    token: String,
    child_id: String,
}

#[derive(Deserialize)]
struct PortParams {
    guest_port: u16,
    #[serde(default)]
    protocol: Option<Protocol>,
}

/// Installed as the per-instance [`GuestRequestHandler`] once its boot
/// sequence wires up the demultiplexer.
pub struct InstanceGuestRequests {
    pub manager: Arc<LifecycleManager>,
    pub instance: Arc<Instance>,
}

impl InstanceGuestRequests {
    fn decode_token(&self, encoded: &str) -> Result<CapabilityToken, RpcErrorObject> {
        let token = self
            .manager
            .capability_codec()
            .decode(encoded)
            .map_err(|e| rpc_err(-32001, format!("capability error: {e}")))?;
        if token.parent_instance_id != self.instance.id {
            return Err(rpc_err(-32001, "token does not authorize this instance"));
        }
        if !token.spawn || token.spawn_depth == 0 {
            return Err(rpc_err(-32001, "token does not grant spawn rights"));
        }
        Ok(token)
    }

    async fn spawn(&self, params: SpawnParams) -> Result<Value, RpcErrorObject> {
        let token = self.decode_token(&params.token)?;

        if let Some(image_ref) = &params.image_ref {
            if !token.ceilings.allowed_images.is_empty() && !token.ceilings.allowed_images.contains(image_ref) {
                return Err(rpc_err(-32001, format!("image not allowed by capability: {image_ref}")));
            }
        }

        // max_children == 0 is the "no limit" sentinel, not "no children".
        let existing_children = self.manager.children_of(&self.instance.id).await.len() as u32;
        if token.ceilings.max_children > 0 && existing_children >= token.ceilings.max_children {
            return Err(rpc_err(-32001, "max_children ceiling reached"));
        }

        // Ceilings are clamped down, never expanded: a child may request
        // less than its ceiling but never more.
        let memory_mb = params.memory_mb.unwrap_or(token.ceilings.max_memory_mb).min(token.ceilings.max_memory_mb);
        let vcpus = params.vcpus.unwrap_or(token.ceilings.max_vcpus).min(token.ceilings.max_vcpus);
        let mut expose_ports = params.expose_ports;
        expose_ports.truncate(token.ceilings.max_expose_ports as usize);

        let workspace_path = translate_workspace_path(params.workspace_path, self.instance.spec.workspace_path.as_deref());

        let child = self
            .manager
            .create(CreateRequest {
                handle_alias: None,
                parent_id: Some(self.instance.id.clone()),
                command: params.command,
                expose_ports,
                image_ref: params.image_ref,
                workspace_path,
                env: params.env,
                memory_mb: Some(memory_mb),
                vcpus: Some(vcpus),
            })
            .await
            .map_err(|e| rpc_err(-32000, e.to_string()))?;

        self.manager.ensure(&child.id).await.map_err(|e| rpc_err(-32000, e.to_string()))?;

        let child_token = token.derive_child(&child.id, chrono::Duration::minutes(CHILD_TOKEN_TTL_MINUTES));
        let encoded = self
            .manager
            .capability_codec()
            .encode(&child_token)
            .map_err(|e| rpc_err(-32000, e.to_string()))?;

        let result = SpawnResult { instance_id: child.id.clone(), token: encoded };
        serde_json::to_value(result).map_err(|e| rpc_err(-32000, e.to_string()))
    }

    async fn stop_child(&self, params: StopChildParams) -> Result<Value, RpcErrorObject> {
        self.decode_token(&params.token)?;
        let child = self
            .manager
            .lookup(&params.child_id)
            .await
            .ok_or_else(|| rpc_err(-32001, "no such child instance"))?;
        if child.parent_id.as_deref() != Some(self.instance.id.as_str()) {
            return Err(rpc_err(-32001, "not a child of the calling instance"));
        }
        self.manager.stop(&params.child_id).await.map_err(|e| rpc_err(-32000, e.to_string()))?;
        Ok(Value::Null)
    }

    async fn list_children(&self) -> Result<Value, RpcErrorObject> {
        let children = self.manager.children_of(&self.instance.id).await;
        let mut snapshots = Vec::with_capacity(children.len());
        for child in children {
            snapshots.push(child.snapshot().await);
        }
        serde_json::to_value(snapshots).map_err(|e| rpc_err(-32000, e.to_string()))
    }

    async fn self_info(&self) -> Result<Value, RpcErrorObject> {
        let snapshot = self.instance.snapshot().await;
        serde_json::to_value(snapshot).map_err(|e| rpc_err(-32000, e.to_string()))
    }

    async fn expose_port(&self, params: PortParams) -> Result<Value, RpcErrorObject> {
        let Some(router) = self.manager.router().await else {
            return Err(rpc_err(-32000, "router not attached"));
        };
        let public_port = router
            .expose_port(&self.instance.id, params.guest_port)
            .await
            .map_err(|e| rpc_err(-32000, e.to_string()))?;
        Ok(serde_json::json!({ "guest_port": params.guest_port, "public_port": public_port }))
    }

    async fn unexpose_port(&self, params: PortParams) -> Result<Value, RpcErrorObject> {
        let Some(router) = self.manager.router().await else {
            return Err(rpc_err(-32000, "router not attached"));
        };
        router.unexpose_port(&self.instance.id, params.guest_port);
        Ok(Value::Null)
    }
}

#[async_trait]
impl GuestRequestHandler for InstanceGuestRequests {
    async fn handle(&self, method: String, params: Option<Value>) -> Result<Value, RpcErrorObject> {
        let params = params.unwrap_or(Value::Null);
        match method.as_str() {
            "self_info" => self.self_info().await,
            "list_children" => self.list_children().await,
            "spawn" => {
                let parsed: SpawnParams = serde_json::from_value(params)
                    .map_err(|e| bad_params(format!("invalid spawn params: {e}")))?;
                self.spawn(parsed).await
            }
            "stop_child" => {
                let parsed: StopChildParams = serde_json::from_value(params)
                    .map_err(|e| bad_params(format!("invalid stop_child params: {e}")))?;
                self.stop_child(parsed).await
            }
            "expose_port" => {
                let parsed: PortParams = serde_json::from_value(params)
                    .map_err(|e| bad_params(format!("invalid expose_port params: {e}")))?;
                self.expose_port(parsed).await
            }
            "unexpose_port" => {
                let parsed: PortParams = serde_json::from_value(params)
                    .map_err(|e| bad_params(format!("invalid unexpose_port params: {e}")))?;
                self.unexpose_port(parsed).await
            }
            other => Err(rpc_err(-32601, format!("unknown guest method: {other}"))),
        }
    }
}
