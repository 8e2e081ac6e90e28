//! Request authentication extractors.
//!
//! Two caller populations, two extractors:
//!
//! - [`WorkerAuth`] — render nodes, identified by the `x-worker-id` /
//!   `x-worker-key` header pair issued at registration.
//! - [`OperatorAuth`] — humans and dashboards, gated by the static
//!   `x-operator-key` header when `ELARA_OPERATOR_KEY` is configured.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use elara_core::error::CoreError;
use elara_core::types::DbId;

use crate::error::AppError;
use crate::state::AppState;

/// Authenticated worker extracted from the credential headers.
#[derive(Debug, Clone, Copy)]
pub struct WorkerAuth {
    pub worker_id: DbId,
}

fn header<'a>(parts: &'a Parts, name: &'static str) -> Result<&'a str, AppError> {
    parts
        .headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::Core(CoreError::Unauthorized(format!("Missing {name} header"))))
}

impl FromRequestParts<AppState> for WorkerAuth {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let worker_id: DbId = header(parts, "x-worker-id")?.parse().map_err(|_| {
            AppError::Core(CoreError::Unauthorized("Invalid x-worker-id header".into()))
        })?;
        let key = header(parts, "x-worker-key")?;

        let ok = state
            .orchestrator
            .store()
            .authenticate_worker(worker_id, key)
            .await?;
        if !ok {
            return Err(AppError::Core(CoreError::Unauthorized(
                "Unknown worker or bad credential".into(),
            )));
        }
        Ok(WorkerAuth { worker_id })
    }
}

/// Operator gate. When no operator key is configured the deployment
/// is treated as a trusted network and every request passes.
#[derive(Debug, Clone, Copy)]
pub struct OperatorAuth;

impl FromRequestParts<AppState> for OperatorAuth {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let Some(expected) = &state.config.operator_key else {
            return Ok(OperatorAuth);
        };
        let presented = header(parts, "x-operator-key")?;
        if presented != expected {
            return Err(AppError::Core(CoreError::Unauthorized(
                "Bad operator key".into(),
            )));
        }
        Ok(OperatorAuth)
    }
}
