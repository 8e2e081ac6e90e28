//! Maintenance handlers.

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::auth::OperatorAuth;
use crate::error::{AppError, AppResult};
use crate::response::DataResponse;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct PurgeRequest {
    /// Overrides the configured retention window for this run.
    pub older_than_hours: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct PurgeResponse {
    pub removed: u64,
}

/// POST /api/v1/maintenance/purge
///
/// Remove finished jobs older than the retention window, plus any
/// released tombstones. The background sweep does the same thing on a
/// timer; this endpoint forces a pass.
pub async fn purge(
    _auth: OperatorAuth,
    State(state): State<AppState>,
    Json(input): Json<PurgeRequest>,
) -> AppResult<impl IntoResponse> {
    let hours = input
        .older_than_hours
        .unwrap_or(state.config.purge_after_hours);
    if hours < 0 {
        return Err(AppError::BadRequest(
            "older_than_hours must not be negative".into(),
        ));
    }
    let removed = state.orchestrator.purge(hours).await?;
    Ok(Json(DataResponse {
        data: PurgeResponse { removed },
    }))
}
