//! HTTP client for the orchestrator API.

use std::time::Duration;

use elara_core::types::DbId;
use elara_db::models::frame::FrameReport;
use elara_db::models::job::{Job, ProgressReport, ReportOutcome};
use reqwest::StatusCode;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

/// Registration backoff: starts at 1 s, doubles per failure, capped
/// at 30 s. Registration retries until it succeeds or the worker is
/// shut down; a farm node must survive the orchestrator being down.
const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Server returned {status}: {message}")]
    Status {
        status: StatusCode,
        message: String,
    },
}

/// Every response body is a `{ "data": ... }` envelope.
#[derive(Debug, Deserialize)]
struct Data<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct Registered {
    worker_id: DbId,
    credential: String,
}

pub struct ApiClient {
    http: reqwest::Client,
    base: String,
    worker_id: DbId,
    credential: String,
}

impl ApiClient {
    /// Register with the orchestrator, retrying with exponential
    /// backoff until it succeeds. Returns `None` only if `cancel`
    /// fires first.
    pub async fn register(
        server_url: &str,
        name: &str,
        join_secret: &str,
        cancel: &CancellationToken,
    ) -> Option<Self> {
        let http = reqwest::Client::new();
        let base = server_url.trim_end_matches('/').to_string();
        let url = format!("{base}/api/v1/workers/register");
        let mut delay = BACKOFF_INITIAL;

        loop {
            let attempt = async {
                let response = http
                    .post(&url)
                    .json(&serde_json::json!({
                        "name": name,
                        "join_secret": join_secret,
                    }))
                    .send()
                    .await?;
                let response = check_status(response).await?;
                Ok::<_, ClientError>(response.json::<Data<Registered>>().await?.data)
            };

            tokio::select! {
                _ = cancel.cancelled() => return None,
                result = attempt => match result {
                    Ok(registered) => {
                        tracing::info!(worker_id = registered.worker_id, "registered with orchestrator");
                        return Some(Self {
                            http,
                            base,
                            worker_id: registered.worker_id,
                            credential: registered.credential,
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, delay_ms = delay.as_millis() as u64, "registration failed, retrying");
                    }
                },
            }

            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }
            delay = (delay * 2).min(BACKOFF_MAX);
        }
    }

    fn authed(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .header("x-worker-id", self.worker_id.to_string())
            .header("x-worker-key", &self.credential)
    }

    /// Claim the next queued job; `None` means the queue is empty.
    pub async fn claim(&self) -> Result<Option<Job>, ClientError> {
        let url = format!("{}/api/v1/workers/claim", self.base);
        let response = self.authed(self.http.post(&url)).send().await?;
        let response = check_status(response).await?;
        Ok(response.json::<Data<Option<Job>>>().await?.data)
    }

    /// Send a progress report; the response carries the resolved
    /// status and the pending cancel directive.
    pub async fn report_progress(
        &self,
        job_id: DbId,
        report: &ProgressReport,
    ) -> Result<ReportOutcome, ClientError> {
        let url = format!("{}/api/v1/jobs/{job_id}/progress", self.base);
        let response = self.authed(self.http.post(&url)).json(report).send().await?;
        let response = check_status(response).await?;
        Ok(response.json::<Data<ReportOutcome>>().await?.data)
    }

    /// Send a batch of frame outcomes.
    pub async fn report_frames(
        &self,
        job_id: DbId,
        report: &FrameReport,
    ) -> Result<(), ClientError> {
        let url = format!("{}/api/v1/jobs/{job_id}/frames", self.base);
        let response = self.authed(self.http.post(&url)).json(report).send().await?;
        check_status(response).await?;
        Ok(())
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(ClientError::Status { status, message })
}
