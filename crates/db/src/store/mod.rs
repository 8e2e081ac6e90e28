//! The `JobStore` trait — the storage contract the orchestrator is
//! written against.
//!
//! Every method is one linearizable mutation (or read) against the
//! store. In particular:
//!
//! - [`JobStore::claim_next`] is an atomic conditional transition
//!   keyed on `status = queued`; concurrent claims never return the
//!   same job.
//! - [`JobStore::apply_report`] clamps counters, applies the status
//!   transition rules, and executes the automatic retry-requeue in
//!   the same atomic step, then returns the job's cancel directive.
//!
//! Backings must not split these into separate read-then-write pairs.

use async_trait::async_trait;
use chrono::Utc;
use elara_core::types::{DbId, FrameNumber, Timestamp};

use crate::models::frame::Frame;
use crate::models::job::{truncate_tail, Job, NewJob, ProgressReport, ReportOutcome, LOG_TAIL_MAX};
use crate::models::status::{CancelState, JobStatus};
use crate::models::worker::Worker;

pub mod memory;
pub mod postgres;

/// Errors surfaced by store backings.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Store error: {0}")]
    Internal(String),
}

/// Storage contract for jobs, frames, and worker identities.
#[async_trait]
pub trait JobStore: Send + Sync {
    // ── Jobs ─────────────────────────────────────────────────────────

    /// Insert a batch of new queued jobs, returning them with ids
    /// assigned. A chunked submission inserts all its parts through
    /// one call.
    async fn insert_jobs(&self, jobs: &[NewJob]) -> Result<Vec<Job>, StoreError>;

    /// Fetch a job by id, tombstoned rows included.
    async fn job(&self, id: DbId) -> Result<Option<Job>, StoreError>;

    /// List non-deleted jobs, newest first.
    async fn list_jobs(&self) -> Result<Vec<Job>, StoreError>;

    /// Non-deleted parts of a group, ordered by start frame.
    async fn group_parts(&self, group_id: &str) -> Result<Vec<Job>, StoreError>;

    /// Atomically claim the next eligible job for `worker_id`.
    ///
    /// Eligible: non-deleted and `queued`; ordered by priority
    /// descending, then id ascending. The claim stamps the worker,
    /// moves the job to `running`, and clears any stale cancel state.
    async fn claim_next(&self, worker_id: DbId) -> Result<Option<Job>, StoreError>;

    /// Apply a progress report. Returns `None` for an unknown job.
    async fn apply_report(
        &self,
        job_id: DbId,
        report: &ProgressReport,
    ) -> Result<Option<ReportOutcome>, StoreError>;

    /// Request cancellation. Queued jobs transition to `cancelled`
    /// directly; running jobs get `cancel_state` set and the directive
    /// is delivered on their next report. Unknown ids and jobs already
    /// terminal are no-ops (the existing terminal state wins).
    async fn request_cancel(&self, job_id: DbId, mode: CancelState) -> Result<(), StoreError>;

    /// Soft-delete: set the tombstone and, on a running job, flag an
    /// immediate cancel so the owning worker lets go.
    async fn mark_deleted(&self, job_id: DbId) -> Result<(), StoreError>;

    /// Hard-delete a job and its frame rows. Idempotent.
    async fn delete_job(&self, job_id: DbId) -> Result<(), StoreError>;

    /// Return running jobs with no report since `cutoff` to the queue
    /// (their worker is presumed dead). A job with a cancel pending is
    /// cancelled instead. Returns the number of jobs touched.
    async fn requeue_stale(&self, cutoff: Timestamp) -> Result<u64, StoreError>;

    /// Hard-delete terminal jobs last touched before `cutoff`, plus
    /// orphaned frame rows. Returns the number of jobs removed.
    async fn purge_terminal_before(&self, cutoff: Timestamp) -> Result<u64, StoreError>;

    /// Hard-delete tombstoned jobs no longer held by a worker (i.e.
    /// not `running`), plus orphaned frame rows.
    async fn purge_tombstones(&self) -> Result<u64, StoreError>;

    // ── Frames ───────────────────────────────────────────────────────

    /// Idempotent per-frame upsert; last write wins.
    async fn upsert_frames(
        &self,
        job_id: DbId,
        done: &[FrameNumber],
        failed: &[FrameNumber],
    ) -> Result<(), StoreError>;

    /// All known frame rows for a job, ordered by frame number.
    async fn frames(&self, job_id: DbId) -> Result<Vec<Frame>, StoreError>;

    // ── Workers ──────────────────────────────────────────────────────

    /// Register a worker, upserting by unique name. An existing name
    /// gets its credential rotated and `last_seen` touched.
    async fn register_worker(&self, name: &str, credential: &str) -> Result<Worker, StoreError>;

    /// Check a worker credential; touches `last_seen` on success.
    async fn authenticate_worker(
        &self,
        worker_id: DbId,
        credential: &str,
    ) -> Result<bool, StoreError>;
}

/// Reference semantics for [`JobStore::apply_report`], shared by the
/// in-memory backing and mirrored by the SQL in [`postgres::PgStore`].
///
/// Counter clamping happens before the status rules so a malformed
/// report can never corrupt the aggregates. The failure rules pick the
/// destination state (the automatic retry requeues in the same step,
/// and a failed report with a cancel pending materializes `cancelled`
/// instead of `failed`); [`JobStatus::can_enter`] then has the final
/// say, which is what keeps terminal and queued rows from moving on a
/// straggler report.
pub(crate) fn apply_report_in_place(job: &mut Job, report: &ProgressReport) -> ReportOutcome {
    job.updated = Utc::now();

    let clamp = |v: i64, total: i64| v.clamp(0, total);
    if let Some(done) = report.frame_done {
        job.frame_done = clamp(done, job.frame_total);
    }
    if let Some(failed) = report.frame_failed {
        job.frame_failed = clamp(failed, job.frame_total);
    }
    if let Some(running) = report.frame_running {
        job.frame_running = clamp(running, job.frame_total);
    }
    if let Some(tail) = &report.log_tail {
        job.log_tail = Some(truncate_tail(tail, LOG_TAIL_MAX).to_string());
    }
    if let Some(eta) = report.eta_seconds {
        job.eta_seconds = Some(eta);
    }
    if let Some(delta) = report.error_delta {
        job.error_count = (job.error_count + delta).max(0);
    }

    if let Some(reported) = report.status {
        // Workers only report `done` or `failed`; anything else just
        // refreshes the counters.
        let next = match reported {
            JobStatus::Done => Some(JobStatus::Done),
            JobStatus::Failed => Some(if job.cancel_state != CancelState::None {
                // The stop was induced; record it as cancelled.
                JobStatus::Cancelled
            } else if job.retries < job.max_retries {
                JobStatus::Queued
            } else {
                JobStatus::Failed
            }),
            _ => None,
        };
        if let Some(next) = next {
            if job.status.can_enter(next) {
                if next == JobStatus::Queued {
                    job.retries += 1;
                    job.worker_id = None;
                    job.frame_running = 0;
                }
                job.status = next;
            }
        }
    }

    ReportOutcome {
        status: job.status,
        cancel: job.cancel_state,
    }
}
