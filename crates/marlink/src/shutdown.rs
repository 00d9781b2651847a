use marlink_forwarder::ControlPlane;
use tracing::info;

/// Wait for SIGTERM or ctrl-c, then stop every engine before the server exits
pub async fn wait_for_shutdown(plane: ControlPlane) {
    shutdown_signal().await;
    info!("shutdown signal received");
    plane.stop_all().await;
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = sigterm.recv() => info!("SIGTERM received"),
                _ = tokio::signal::ctrl_c() => info!("ctrl-c received"),
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "failed to listen for SIGTERM, waiting for ctrl-c only");
            tokio::signal::ctrl_c().await.ok();
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    tokio::signal::ctrl_c().await.ok();
}
