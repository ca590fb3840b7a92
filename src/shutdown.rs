//! Cooperative shutdown: installs a SIGINT/SIGTERM listener that cancels
//! the backup's shared cancel token rather than killing the process.

use tokio_util::sync::CancellationToken;
use tracing::info;

/// Spawns a task that waits for SIGINT (Ctrl+C) or SIGTERM and cancels
/// `cancel` when either arrives. Cancellation is idempotent (spec §5),
/// so a second signal during an already-cancelled run is harmless.
pub fn install(cancel: CancellationToken) {
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received, cancelling backup");
        cancel.cancel();
    });
}

async fn wait_for_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
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
        _ = ctrl_c => info!("received SIGINT"),
        _ = terminate => info!("received SIGTERM"),
    }
}
