//! Handlers for the `/jobs` resource.
//!
//! Operator endpoints require [`OperatorAuth`]; the progress and
//! frame-report endpoints are worker-facing and require [`WorkerAuth`].

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use elara_core::types::{DbId, FrameNumber};
use elara_db::models::frame::FrameReport;
use elara_db::models::job::ProgressReport;
use elara_db::models::status::CancelState;
use serde::Deserialize;

use crate::auth::{OperatorAuth, WorkerAuth};
use crate::error::AppResult;
use crate::response::DataResponse;
use crate::service::SubmitJob;
use crate::state::AppState;

/// POST /api/v1/jobs
///
/// Submit a render. Returns 201 with the created job(s); a chunked
/// submission returns every part.
pub async fn submit_job(
    _auth: OperatorAuth,
    State(state): State<AppState>,
    Json(input): Json<SubmitJob>,
) -> AppResult<impl IntoResponse> {
    let jobs = state.orchestrator.submit(input).await?;
    Ok((StatusCode::CREATED, Json(DataResponse { data: jobs })))
}

/// GET /api/v1/jobs
///
/// Job list with group parts rolled up.
pub async fn list_jobs(
    _auth: OperatorAuth,
    State(state): State<AppState>,
) -> AppResult<impl IntoResponse> {
    let overview = state.orchestrator.overview().await?;
    Ok(Json(DataResponse { data: overview }))
}

/// GET /api/v1/jobs/{id}
pub async fn get_job(
    _auth: OperatorAuth,
    State(state): State<AppState>,
    Path(id): Path<DbId>,
) -> AppResult<impl IntoResponse> {
    let job = state.orchestrator.job(id).await?;
    Ok(Json(DataResponse { data: job }))
}

/// GET /api/v1/jobs/{id}/frames
pub async fn get_frames(
    _auth: OperatorAuth,
    State(state): State<AppState>,
    Path(id): Path<DbId>,
) -> AppResult<impl IntoResponse> {
    let view = state.orchestrator.frames_view(id).await?;
    Ok(Json(DataResponse { data: view }))
}

/// GET /api/v1/jobs/{id}/log
pub async fn get_log(
    _auth: OperatorAuth,
    State(state): State<AppState>,
    Path(id): Path<DbId>,
) -> AppResult<impl IntoResponse> {
    let tail = state.orchestrator.log_tail(id).await?;
    Ok(Json(DataResponse { data: tail }))
}

#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    pub mode: CancelState,
}

/// POST /api/v1/jobs/{id}/cancel
///
/// Request cancellation. Queued jobs finish immediately; running jobs
/// get the directive on their next progress report.
pub async fn cancel_job(
    _auth: OperatorAuth,
    State(state): State<AppState>,
    Path(id): Path<DbId>,
    Json(input): Json<CancelRequest>,
) -> AppResult<impl IntoResponse> {
    let job = state.orchestrator.cancel_job(id, input.mode).await?;
    Ok((StatusCode::ACCEPTED, Json(DataResponse { data: job })))
}

/// POST /api/v1/jobs/{id}/retry
///
/// Clone a finished job into a fresh queued one.
pub async fn retry_job(
    _auth: OperatorAuth,
    State(state): State<AppState>,
    Path(id): Path<DbId>,
) -> AppResult<impl IntoResponse> {
    let job = state.orchestrator.retry_job(id).await?;
    Ok((StatusCode::CREATED, Json(DataResponse { data: job })))
}

#[derive(Debug, Deserialize)]
pub struct ResubmitRequest {
    pub frames: Vec<FrameNumber>,
}

/// POST /api/v1/jobs/{id}/resubmit
///
/// Re-render specific frames as new high-priority jobs.
pub async fn resubmit_frames(
    _auth: OperatorAuth,
    State(state): State<AppState>,
    Path(id): Path<DbId>,
    Json(input): Json<ResubmitRequest>,
) -> AppResult<impl IntoResponse> {
    let jobs = state.orchestrator.resubmit_frames(id, &input.frames).await?;
    Ok((StatusCode::CREATED, Json(DataResponse { data: jobs })))
}

#[derive(Debug, Default, Deserialize)]
pub struct SplitRequest {
    #[serde(default)]
    pub only_missing: bool,
}

/// POST /api/v1/jobs/{id}/split
///
/// Explode a job into single-frame jobs, optionally skipping frames
/// already done.
pub async fn split_job(
    _auth: OperatorAuth,
    State(state): State<AppState>,
    Path(id): Path<DbId>,
    Json(input): Json<SplitRequest>,
) -> AppResult<impl IntoResponse> {
    let jobs = state
        .orchestrator
        .split_to_frames(id, input.only_missing)
        .await?;
    Ok((StatusCode::CREATED, Json(DataResponse { data: jobs })))
}

/// DELETE /api/v1/jobs/{id}
pub async fn delete_job(
    _auth: OperatorAuth,
    State(state): State<AppState>,
    Path(id): Path<DbId>,
) -> AppResult<impl IntoResponse> {
    state.orchestrator.delete_job(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/v1/jobs/{id}/progress
///
/// Worker progress report. The response carries the job's resolved
/// status and the pending cancel directive.
pub async fn report_progress(
    auth: WorkerAuth,
    State(state): State<AppState>,
    Path(id): Path<DbId>,
    Json(report): Json<ProgressReport>,
) -> AppResult<impl IntoResponse> {
    let outcome = state
        .orchestrator
        .report_progress(auth.worker_id, id, report)
        .await?;
    Ok(Json(DataResponse { data: outcome }))
}

/// POST /api/v1/jobs/{id}/frames
///
/// Worker frame-outcome batch from a filesystem rescan.
pub async fn report_frames(
    auth: WorkerAuth,
    State(state): State<AppState>,
    Path(id): Path<DbId>,
    Json(report): Json<FrameReport>,
) -> AppResult<impl IntoResponse> {
    state
        .orchestrator
        .report_frames(auth.worker_id, id, report)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
