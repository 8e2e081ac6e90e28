//! Background maintenance sweep.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::service::Orchestrator;

/// Periodic maintenance: requeue jobs orphaned by silent workers,
/// then purge old terminal jobs and released tombstones. Runs until
/// the token is cancelled.
pub async fn run_sweep(
    orchestrator: Arc<Orchestrator>,
    config: Arc<ServerConfig>,
    cancel: CancellationToken,
) {
    let mut interval =
        tokio::time::interval(Duration::from_secs(config.sweep_interval_secs.max(1)));
    // The immediate first tick would purge during startup; skip it.
    interval.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("maintenance sweep stopped");
                return;
            }
            _ = interval.tick() => {
                let stale_after = Duration::from_secs(config.stale_after_secs);
                if let Err(e) = orchestrator.requeue_stale(stale_after).await {
                    tracing::error!(error = %e, "stale-job sweep failed");
                }
                if let Err(e) = orchestrator.purge(config.purge_after_hours).await {
                    tracing::error!(error = %e, "purge sweep failed");
                }
            }
        }
    }
}
