//! aegisvmd - host daemon: wires the backend, lifecycle manager, router,
//! and control API together and serves them until signaled to stop.

use std::path::PathBuf;
use std::sync::Arc;

use aegisvm::backend::process::ProcessBackend;
use aegisvm::capability::TokenCodec;
use aegisvm::config::DaemonConfig;
use aegisvm::http_api::{self, AppState};
use aegisvm::lifecycle::LifecycleManager;
use aegisvm::registry::DiskRegistry;
use aegisvm::router::{proxy, Router};
use aegisvm::tether::TetherStore;
use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "aegisvmd", version, about = "Host control plane for a fleet of microVM-isolated workloads")]
struct Args {
    /// Override the daemon's state directory (default: $AEGISVM_STATE_DIR or ~/.local/state/aegisvm).
    #[arg(long)]
    state_dir: Option<PathBuf>,
    /// Address the wake-on-connect reverse proxy listens on.
    #[arg(long)]
    proxy_addr: Option<std::net::SocketAddr>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_logging();

    let mut config = DaemonConfig::from_env();
    if let Some(dir) = args.state_dir {
        config.control_socket_path = dir.join("control.sock");
        config.state_dir = dir;
    }
    if let Some(addr) = args.proxy_addr {
        config.proxy_addr = addr;
    }
    config.ensure_dirs()?;

    let registry = Arc::new(DiskRegistry::new(config.runs_dir()));
    let backend = Arc::new(ProcessBackend::new());
    let tether = Arc::new(TetherStore::new(config.tether_buffer_capacity, config.tether_subscriber_capacity));
    let capability_codec = Arc::new(TokenCodec::generate());

    let manager = LifecycleManager::new(config.clone(), backend, tether, registry, capability_codec);
    manager.restore().await?;

    let router = Router::new(manager.clone());
    manager.set_router(router.clone()).await;

    manager.set_observer(Arc::new(|change| {
        tracing::info!(instance_id = %change.instance_id, state = ?change.state, "instance state changed");
    }))
    .await;

    let control_socket = config.control_socket_path.clone();
    if control_socket.exists() {
        std::fs::remove_file(&control_socket)?;
    }
    let control_listener = tokio::net::UnixListener::bind(&control_socket)?;
    tracing::info!(path = %control_socket.display(), "control API listening");
    let control_app = http_api::app(AppState { manager: manager.clone(), router: router.clone() });
    let control_server = tokio::spawn(async move {
        if let Err(e) = axum::serve(control_listener, control_app).await {
            tracing::error!(error = %e, "control API server exited");
        }
    });

    let proxy_listener = tokio::net::TcpListener::bind(config.proxy_addr).await?;
    tracing::info!(addr = %config.proxy_addr, "wake-on-connect proxy listening");
    let proxy_app = proxy::app(router.clone());
    let proxy_server = tokio::spawn(async move {
        if let Err(e) = axum::serve(proxy_listener, proxy_app).await {
            tracing::error!(error = %e, "reverse proxy server exited");
        }
    });

    wait_for_shutdown_signal().await;
    tracing::info!("shutting down, stopping all instances");

    control_server.abort();
    proxy_server.abort();
    for instance in manager.list().await {
        if let Err(e) = manager.stop(&instance.id).await {
            tracing::warn!(instance_id = %instance.id, error = %e, "failed to stop instance during shutdown");
        }
    }
    let _ = std::fs::remove_file(&control_socket);

    Ok(())
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive("aegisvm=info".parse().unwrap()))
        .init();
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
