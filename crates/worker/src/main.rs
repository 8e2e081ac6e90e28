use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use elara_worker::client::ApiClient;
use elara_worker::config::WorkerConfig;
use elara_worker::runner;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "elara_worker=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = WorkerConfig::from_env();
    tracing::info!(server = %config.server_url, name = %config.name, "Starting worker");

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Received SIGINT, shutting down");
                cancel.cancel();
            }
        });
    }

    let Some(client) =
        ApiClient::register(&config.server_url, &config.name, &config.join_secret, &cancel).await
    else {
        return;
    };

    // Claim loop: one job at a time, poll when the queue is empty.
    while !cancel.is_cancelled() {
        match client.claim().await {
            Ok(Some(job)) => {
                let job_id = job.id;
                if let Err(e) = runner::run_job(&client, &config, job, &cancel).await {
                    // Transport failure mid-job. Dropping the runner
                    // killed the render; the server requeues the job
                    // once it goes stale.
                    tracing::error!(job_id, error = %e, "lost contact with orchestrator during job");
                }
            }
            Ok(None) => {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(config.poll_interval) => {}
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "claim failed, backing off");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(config.poll_interval) => {}
                }
            }
        }
    }

    tracing::info!("Worker stopped");
}
