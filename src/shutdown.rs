use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// Cancel `token` when SIGTERM or SIGINT arrives.
///
/// Daemons and workers share this: the daemon stops its gRPC server, a worker
/// stops polling at its next idle point and deregisters.
pub fn install_shutdown_handler(token: CancellationToken) -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, initiating graceful shutdown");
            }
            _ = token.cancelled() => return,
        }

        token.cancel();
    });

    Ok(())
}
