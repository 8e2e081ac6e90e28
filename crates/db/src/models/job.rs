//! Job row model and the DTOs exchanged with the orchestrator.

use elara_core::range::FrameRange;
use elara_core::types::{DbId, FrameNumber, Timestamp};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::status::{CancelState, JobStatus};

/// Maximum stored log tail, in bytes. Reports carrying a longer tail
/// are truncated to this suffix before persisting.
pub const LOG_TAIL_MAX: usize = 4000;

/// What the external render tool is asked to produce: scene, project
/// root, output location, and render settings. Opaque to the
/// orchestrator; the worker turns it into command-line arguments.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct RenderTarget {
    pub scene: String,
    pub project: String,
    pub output_dir: String,
    pub camera: Option<String>,
    pub layer: Option<String>,
    pub renderer: String,
    pub width: i32,
    pub height: i32,
}

/// A row from the `jobs` table.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Job {
    pub id: DbId,
    pub status: JobStatus,
    pub created: Timestamp,
    pub updated: Timestamp,
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub target: RenderTarget,
    pub start_frame: FrameNumber,
    pub end_frame: FrameNumber,
    pub by_step: i64,
    pub group_id: Option<String>,
    pub part_index: Option<i32>,
    pub part_count: Option<i32>,
    pub frame_total: i64,
    pub frame_done: i64,
    pub frame_failed: i64,
    pub frame_running: i64,
    pub eta_seconds: Option<f64>,
    pub error_count: i64,
    pub priority: i32,
    pub retries: i32,
    pub max_retries: i32,
    pub cancel_state: CancelState,
    pub worker_id: Option<DbId>,
    pub log_tail: Option<String>,
    pub deleted: bool,
}

impl Job {
    /// The job's frame lattice.
    pub fn range(&self) -> FrameRange {
        FrameRange {
            start: self.start_frame,
            end: self.end_frame,
            step: self.by_step,
        }
    }
}

/// Grouping slot for a job created by chunking, splitting, or frame
/// resubmission.
#[derive(Debug, Clone)]
pub struct GroupSlot {
    pub group_id: String,
    pub part_index: i32,
    pub part_count: i32,
}

/// Payload for inserting a new queued job. `frame_total` is derived
/// from the range at insert time and never changes afterwards.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub target: RenderTarget,
    pub range: FrameRange,
    pub group: Option<GroupSlot>,
    pub priority: i32,
    pub max_retries: i32,
}

/// A worker progress report. Every field is optional; omitted fields
/// leave the current value untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProgressReport {
    /// Only applied while the job is `running`; see the transition
    /// table on [`JobStatus`].
    pub status: Option<JobStatus>,
    pub frame_done: Option<i64>,
    pub frame_failed: Option<i64>,
    pub frame_running: Option<i64>,
    pub log_tail: Option<String>,
    pub eta_seconds: Option<f64>,
    pub error_delta: Option<i64>,
}

/// What a progress report produced: the job's status after the update
/// and the cancel directive the worker must honor. Returned from the
/// same round trip that carried the report.
#[derive(Debug, Clone, Copy, FromRow, Serialize, Deserialize)]
pub struct ReportOutcome {
    pub status: JobStatus,
    pub cancel: CancelState,
}

/// Truncate `tail` to its last `max` bytes on a char boundary.
pub fn truncate_tail(tail: &str, max: usize) -> &str {
    if tail.len() <= max {
        return tail;
    }
    let mut cut = tail.len() - max;
    while !tail.is_char_boundary(cut) {
        cut += 1;
    }
    &tail[cut..]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_tail_keeps_suffix() {
        assert_eq!(truncate_tail("abcdef", 3), "def");
        assert_eq!(truncate_tail("abc", 10), "abc");
    }

    #[test]
    fn truncate_tail_respects_char_boundaries() {
        // 'é' is two bytes; a cut landing inside it must shift forward.
        let s = "aéb";
        assert_eq!(truncate_tail(s, 2), "b");
    }
}
