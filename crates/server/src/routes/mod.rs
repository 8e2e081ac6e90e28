//! Route tree.
//!
//! ```text
//! GET    /health                          liveness probe
//!
//! POST   /api/v1/workers/register         join-secret exchange (public)
//! POST   /api/v1/workers/claim            claim next job (worker)
//! POST   /api/v1/jobs/{id}/progress       progress report (worker)
//! POST   /api/v1/jobs/{id}/frames         frame outcomes (worker)
//!
//! GET    /api/v1/jobs                     overview (operator)
//! POST   /api/v1/jobs                     submit (operator)
//! GET    /api/v1/jobs/{id}                job detail
//! GET    /api/v1/jobs/{id}/frames         per-frame view
//! GET    /api/v1/jobs/{id}/log            stored log tail
//! POST   /api/v1/jobs/{id}/cancel         cancel (immediate | graceful)
//! POST   /api/v1/jobs/{id}/retry          retry a finished job
//! POST   /api/v1/jobs/{id}/resubmit       re-render specific frames
//! POST   /api/v1/jobs/{id}/split          split job to single-frame jobs
//! DELETE /api/v1/jobs/{id}                tombstone a job
//!
//! GET    /api/v1/groups/{id}              group parts with roll-up
//! POST   /api/v1/groups/{id}/cancel       cancel all unfinished parts
//! POST   /api/v1/groups/{id}/retry-failed retry failed/cancelled parts
//! DELETE /api/v1/groups/{id}              tombstone every part
//!
//! POST   /api/v1/maintenance/purge        force a purge pass
//! GET    /api/v1/events                   live event WebSocket
//! ```

use axum::routing::{get, post};
use axum::Json;
use axum::Router;
use serde_json::json;

use crate::handlers::{events, groups, jobs, maintenance, workers};
use crate::state::AppState;

/// Routes mounted at the root.
pub fn root_routes() -> Router<AppState> {
    Router::new().route("/health", get(health))
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

/// Build the `/api/v1` route tree.
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route(
            "/workers/register",
            post(workers::register),
        )
        .route("/workers/claim", post(workers::claim))
        .route("/jobs", get(jobs::list_jobs).post(jobs::submit_job))
        .route("/jobs/{id}", get(jobs::get_job).delete(jobs::delete_job))
        .route("/jobs/{id}/frames", get(jobs::get_frames).post(jobs::report_frames))
        .route("/jobs/{id}/log", get(jobs::get_log))
        .route("/jobs/{id}/progress", post(jobs::report_progress))
        .route("/jobs/{id}/cancel", post(jobs::cancel_job))
        .route("/jobs/{id}/retry", post(jobs::retry_job))
        .route("/jobs/{id}/resubmit", post(jobs::resubmit_frames))
        .route("/jobs/{id}/split", post(jobs::split_job))
        .route("/groups/{id}/cancel", post(groups::cancel_group))
        .route("/groups/{id}/retry-failed", post(groups::retry_failed))
        .route(
            "/groups/{id}",
            get(groups::get_group).delete(groups::delete_group),
        )
        .route("/maintenance/purge", post(maintenance::purge))
        .route("/events", get(events::events_ws))
}
