//! Per-frame outcome rows, keyed by `(job_id, frame)`.

use elara_core::types::{DbId, FrameNumber, Timestamp};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::status::FrameStatus;

/// A row from the `job_frames` table.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Frame {
    pub job_id: DbId,
    pub frame: FrameNumber,
    pub status: FrameStatus,
    pub tries: i32,
    pub updated: Timestamp,
}

/// Batch of frame outcomes reported by a worker after a rescan.
/// Upserts are idempotent; re-reporting a frame is harmless.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FrameReport {
    #[serde(default)]
    pub done: Vec<FrameNumber>,
    #[serde(default)]
    pub failed: Vec<FrameNumber>,
    /// Frame the render tool is currently working on, if known. Only
    /// echoed into the live event stream, never persisted.
    pub current_frame: Option<FrameNumber>,
}
