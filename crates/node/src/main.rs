use std::net::SocketAddr;

use midrender_mesh::poller::PeerPoller;
use midrender_mesh::udp::UdpTransport;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use midrender_node::bootstrap;
use midrender_node::config::NodeConfig;
use midrender_node::{engine, leader, reports, routes, submissions};

/// UDP heartbeat cadence.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(3);

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "midrender=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // --- Configuration + state ---
    let config = NodeConfig::from_env();
    tracing::info!(
        sync_root = %config.sync_root.display(),
        http_port = config.http_port,
        "Loaded node configuration",
    );

    let cancel = CancellationToken::new();
    let state = bootstrap::build_state(config, cancel.clone())
        .await
        .expect("Failed to initialise node state");

    // --- HTTP mesh service ---
    let addr = SocketAddr::from(([0, 0, 0, 0], state.config.http_port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind HTTP mesh port");
    tracing::info!(%addr, endpoint = %state.registry.local_endpoint(), "HTTP mesh listening");

    // --- UDP multicast ---
    let udp = if state.config.udp_enabled {
        match UdpTransport::bind(state.config.udp_port).await {
            Ok(udp) => {
                tracing::info!(port = state.config.udp_port, "UDP multicast active");
                let udp = Arc::new(udp);
                udp.spawn_receiver(Arc::clone(&state.registry), cancel.clone());

                // Heartbeat sender: announce immediately, then every ~3s.
                let heartbeat_udp = Arc::clone(&udp);
                let heartbeat_registry = Arc::clone(&state.registry);
                let heartbeat_cancel = cancel.clone();
                tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
                    loop {
                        tokio::select! {
                            _ = heartbeat_cancel.cancelled() => break,
                            _ = ticker.tick() => {
                                heartbeat_udp.send_heartbeat(&heartbeat_registry).await;
                            }
                        }
                    }
                });
                Some(udp)
            }
            Err(e) => {
                tracing::warn!(error = %e, "UDP multicast failed to start, running HTTP-only");
                None
            }
        }
    } else {
        None
    };

    // --- Background tasks ---
    let poller = PeerPoller::new(Arc::clone(&state.registry), state.farm.root().to_path_buf());
    let poller_handle = tokio::spawn(poller.run(cancel.clone()));

    tokio::spawn(leader::run_transition_watcher(state.clone(), cancel.clone()));
    tokio::spawn(engine::run_dispatch_loop(state.clone(), cancel.clone()));
    tokio::spawn(reports::run_report_flusher(state.clone(), cancel.clone()));
    tokio::spawn(submissions::run_submission_watcher(state.clone(), cancel.clone()));

    // --- Serve ---
    let app = routes::build_router(state.clone());
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("HTTP mesh server error");

    // --- Post-shutdown cleanup ---
    tracing::info!("Shutting down");

    if let Some(udp) = &udp {
        udp.send_goodbye(state.registry.node_id()).await;
    }

    cancel.cancel();
    // The poller removes our endpoint file on its way out.
    let _ = tokio::time::timeout(Duration::from_secs(5), poller_handle).await;

    state.agent.shutdown().await;
    state.leader.close_store().await;
    tracing::info!("Graceful shutdown complete");
}

/// Wait for SIGINT or SIGTERM so the node shuts down cleanly whether
/// stopped interactively or by a process manager.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
