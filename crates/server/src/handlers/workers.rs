//! Worker-facing handlers: registration and claiming.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use elara_core::error::CoreError;
use elara_core::types::DbId;
use serde::{Deserialize, Serialize};

use crate::auth::WorkerAuth;
use crate::error::{AppError, AppResult};
use crate::response::DataResponse;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub name: String,
    pub join_secret: String,
}

/// What a successful registration hands back. The credential is only
/// ever shown here; the worker stores it and presents it as the
/// `x-worker-key` header from then on.
#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub worker_id: DbId,
    pub credential: String,
}

/// POST /api/v1/workers/register
///
/// Exchange the shared join secret for a per-worker credential.
/// Re-registering under the same name rotates the credential, which
/// lets a reinstalled node recover its identity.
pub async fn register(
    State(state): State<AppState>,
    Json(input): Json<RegisterRequest>,
) -> AppResult<impl IntoResponse> {
    if input.join_secret != state.config.join_secret {
        return Err(AppError::Core(CoreError::Unauthorized(
            "Bad join secret".into(),
        )));
    }
    let worker = state.orchestrator.register_worker(&input.name).await?;
    Ok((
        StatusCode::CREATED,
        Json(DataResponse {
            data: RegisterResponse {
                worker_id: worker.id,
                credential: worker.credential,
            },
        }),
    ))
}

/// POST /api/v1/workers/claim
///
/// Atomically claim the next queued job. Returns `data: null` when
/// the queue is empty; the worker polls again later.
pub async fn claim(auth: WorkerAuth, State(state): State<AppState>) -> AppResult<impl IntoResponse> {
    let job = state.orchestrator.claim(auth.worker_id).await?;
    Ok(Json(DataResponse { data: job }))
}
