//! Handlers for group-wide operations. A group id addresses every
//! non-deleted part created by one chunked submission, split, or
//! frame resubmission.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;

use crate::auth::OperatorAuth;
use crate::error::AppResult;
use crate::handlers::jobs::CancelRequest;
use crate::response::DataResponse;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct AffectedResponse {
    pub affected: usize,
}

/// GET /api/v1/groups/{id}
///
/// The group's parts plus the derived roll-up.
pub async fn get_group(
    _auth: OperatorAuth,
    State(state): State<AppState>,
    Path(group_id): Path<String>,
) -> AppResult<impl IntoResponse> {
    let group = state.orchestrator.group(&group_id).await?;
    Ok(Json(DataResponse { data: group }))
}

/// POST /api/v1/groups/{id}/cancel
///
/// Cancel every part that has not already finished.
pub async fn cancel_group(
    _auth: OperatorAuth,
    State(state): State<AppState>,
    Path(group_id): Path<String>,
    Json(input): Json<CancelRequest>,
) -> AppResult<impl IntoResponse> {
    let affected = state.orchestrator.cancel_group(&group_id, input.mode).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(DataResponse {
            data: AffectedResponse { affected },
        }),
    ))
}

/// POST /api/v1/groups/{id}/retry-failed
///
/// Retry the failed and cancelled parts; finished parts are kept.
pub async fn retry_failed(
    _auth: OperatorAuth,
    State(state): State<AppState>,
    Path(group_id): Path<String>,
) -> AppResult<impl IntoResponse> {
    let jobs = state.orchestrator.retry_group_failed(&group_id).await?;
    Ok((StatusCode::CREATED, Json(DataResponse { data: jobs })))
}

/// DELETE /api/v1/groups/{id}
pub async fn delete_group(
    _auth: OperatorAuth,
    State(state): State<AppState>,
    Path(group_id): Path<String>,
) -> AppResult<impl IntoResponse> {
    state.orchestrator.delete_group(&group_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
