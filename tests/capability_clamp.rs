//! End-to-end scenario 6: capability clamping and spawn-depth decay.

use std::sync::Arc;

use aegisvm::backend::process::ProcessBackend;
use aegisvm::capability::{Ceilings, CapabilityToken, TokenCodec};
use aegisvm::config::DaemonConfig;
use aegisvm::guest_request::InstanceGuestRequests;
use aegisvm::lifecycle::manager::CreateRequest;
use aegisvm::lifecycle::LifecycleManager;
use aegisvm::registry::MemoryRegistry;
use aegisvm::router::Router;
use aegisvm::rpc::GuestRequestHandler;
use aegisvm::tether::TetherStore;

async fn setup() -> (Arc<LifecycleManager>, Arc<aegisvm::instance::Instance>, CapabilityToken) {
    let manager = LifecycleManager::new(
        DaemonConfig::default(),
        Arc::new(ProcessBackend::new()),
        Arc::new(TetherStore::default()),
        Arc::new(MemoryRegistry::default()),
        Arc::new(TokenCodec::generate()),
    );
    let router = Router::new(manager.clone());
    manager.set_router(router).await;

    let parent = manager
        .create(CreateRequest {
            handle_alias: None,
            parent_id: None,
            command: vec!["sleep".into(), "10".into()],
            expose_ports: vec![],
            image_ref: None,
            workspace_path: None,
            env: vec![],
            memory_mb: None,
            vcpus: None,
        })
        .await
        .unwrap();

    let token = CapabilityToken {
        parent_instance_id: parent.id.clone(),
        issued_at: chrono::Utc::now(),
        expires_at: chrono::Utc::now() + chrono::Duration::minutes(10),
        spawn: true,
        spawn_depth: 2,
        ceilings: Ceilings {
            max_children: 4,
            allowed_images: vec![],
            max_memory_mb: 1024,
            max_vcpus: 2,
            allowed_secrets: vec![],
            max_expose_ports: 2,
        },
    };
    (manager, parent, token)
}

#[tokio::test]
async fn spawn_over_memory_ceiling_is_clamped_not_rejected() {
    let (manager, parent, token) = setup().await;
    let encoded = manager.capability_codec().encode(&token).unwrap();
    let handler = InstanceGuestRequests { manager: manager.clone(), instance: parent };

    let params = serde_json::json!({
        "_token": encoded,
        "command": ["sleep", "5"],
        "memory_mb": 2048,
    });
    let result = handler.handle("spawn".to_string(), Some(params)).await.unwrap();
    let child_id = result["instance_id"].as_str().unwrap().to_string();
    let child = manager.lookup(&child_id).await.unwrap();
    assert_eq!(child.spec.memory_mb, 1024, "memory_mb must be clamped to the parent ceiling, not rejected");
    manager.stop(&child_id).await.unwrap();
}

#[tokio::test]
async fn spawn_depth_decays_and_grandchild_cannot_spawn() {
    let (manager, parent, token) = setup().await;
    let encoded = manager.capability_codec().encode(&token).unwrap();
    let handler = InstanceGuestRequests { manager: manager.clone(), instance: parent };

    let params = serde_json::json!({ "_token": encoded, "command": ["sleep", "5"] });
    let result = handler.handle("spawn".to_string(), Some(params)).await.unwrap();
    let child_id = result["instance_id"].as_str().unwrap().to_string();
    let child_token_encoded = result["token"].as_str().unwrap().to_string();

    let child_token = manager.capability_codec().decode(&child_token_encoded).unwrap();
    assert_eq!(child_token.spawn_depth, 1);
    assert!(child_token.spawn);

    let child = manager.lookup(&child_id).await.unwrap();
    let child_handler = InstanceGuestRequests { manager: manager.clone(), instance: child };
    let grandchild_params = serde_json::json!({ "_token": child_token_encoded, "command": ["sleep", "5"] });
    let grandchild_result =
        child_handler.handle("spawn".to_string(), Some(grandchild_params)).await.unwrap();
    let grandchild_token_encoded = grandchild_result["token"].as_str().unwrap().to_string();
    let grandchild_token = manager.capability_codec().decode(&grandchild_token_encoded).unwrap();
    assert_eq!(grandchild_token.spawn_depth, 0);
    assert!(!grandchild_token.spawn, "grandchild token must not grant further spawn rights");

    manager.stop(&child_id).await.unwrap();
    manager.stop(grandchild_result["instance_id"].as_str().unwrap()).await.unwrap();
}
