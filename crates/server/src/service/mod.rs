//! The orchestration service.
//!
//! [`Orchestrator`] owns every job lifecycle decision: submission and
//! chunking, claiming, progress bookkeeping, cancellation, retries,
//! and the aggregate views operators see. HTTP handlers stay thin and
//! delegate here; the store enforces atomicity, this layer enforces
//! policy.

use std::sync::Arc;

use elara_core::error::CoreError;
use elara_core::range::{coalesce_runs, FrameRange};
use elara_core::types::{DbId, FrameNumber};
use elara_db::models::frame::{Frame, FrameReport};
use elara_db::models::job::{
    truncate_tail, GroupSlot, Job, NewJob, ProgressReport, RenderTarget, ReportOutcome,
    LOG_TAIL_MAX,
};
use elara_db::models::status::{CancelState, FrameStatus, JobStatus};
use elara_db::models::worker::Worker;
use elara_db::JobStore;
use elara_events::{LiveBus, LiveEvent};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};

/// Priority assigned to jobs created by frame resubmission and
/// splitting, so repair work jumps ahead of the normal queue.
const REPAIR_PRIORITY: i32 = 10;

fn default_step() -> i64 {
    1
}

fn default_max_retries() -> i32 {
    2
}

/// Operator job submission payload.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitJob {
    #[serde(flatten)]
    pub target: RenderTarget,
    pub start_frame: FrameNumber,
    pub end_frame: FrameNumber,
    #[serde(default = "default_step")]
    pub by_step: i64,
    /// When set, the range is partitioned into parts of at most this
    /// many frames and submitted as a group.
    #[serde(default)]
    pub chunk_size: Option<i64>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_max_retries")]
    pub max_retries: i32,
}

/// Aggregate view over the parts of one group.
#[derive(Debug, Clone, Serialize)]
pub struct GroupSummary {
    pub group_id: String,
    /// Derived from the parts; see [`derive_group_status`].
    pub status: JobStatus,
    pub frame_total: i64,
    pub frame_done: i64,
    pub frame_failed: i64,
    pub frame_running: i64,
    /// Largest part ETA, if any part reported one.
    pub eta_seconds: Option<f64>,
    pub parts: Vec<Job>,
}

/// Everything the job list endpoint returns: grouped parts rolled up,
/// ungrouped jobs as-is.
#[derive(Debug, Clone, Serialize)]
pub struct JobsOverview {
    pub jobs: Vec<Job>,
    pub groups: Vec<GroupSummary>,
}

/// Per-frame view of one job, with the lattice frames nothing has
/// been recorded for listed as `missing`.
#[derive(Debug, Clone, Serialize)]
pub struct FramesView {
    pub frames: Vec<Frame>,
    pub missing: Vec<FrameNumber>,
}

pub struct Orchestrator {
    store: Arc<dyn JobStore>,
    bus: Arc<LiveBus>,
}

impl Orchestrator {
    pub fn new(store: Arc<dyn JobStore>, bus: Arc<LiveBus>) -> Self {
        Self { store, bus }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    async fn publish_job(&self, job: Job) {
        self.bus.publish(LiveEvent::Job { job }).await;
    }

    async fn fetch_job(&self, id: DbId) -> AppResult<Job> {
        self.store
            .job(id)
            .await?
            .ok_or_else(|| AppError::not_found("Job", id))
    }

    // ── Submission ───────────────────────────────────────────────────

    /// Validate and insert a submission, chunking it into a group when
    /// `chunk_size` is set and yields more than one part.
    pub async fn submit(&self, input: SubmitJob) -> AppResult<Vec<Job>> {
        validate_target(&input.target)?;
        if input.max_retries < 0 {
            return Err(AppError::Core(CoreError::Validation(
                "max_retries must not be negative".into(),
            )));
        }
        let range = FrameRange::new(input.start_frame, input.end_frame, input.by_step)
            .map_err(AppError::Core)?;

        let chunks = match input.chunk_size {
            Some(size) if size > 0 => range.chunks(size),
            Some(size) => {
                return Err(AppError::Core(CoreError::Validation(format!(
                    "chunk_size must be positive, got {size}"
                ))));
            }
            None => vec![range],
        };

        let new_jobs: Vec<NewJob> = if chunks.len() > 1 {
            let group_id = uuid::Uuid::new_v4().to_string();
            let part_count = chunks.len() as i32;
            chunks
                .into_iter()
                .enumerate()
                .map(|(i, part)| NewJob {
                    target: input.target.clone(),
                    range: part,
                    group: Some(GroupSlot {
                        group_id: group_id.clone(),
                        part_index: i as i32 + 1,
                        part_count,
                    }),
                    priority: input.priority,
                    max_retries: input.max_retries,
                })
                .collect()
        } else {
            vec![NewJob {
                target: input.target.clone(),
                range,
                group: None,
                priority: input.priority,
                max_retries: input.max_retries,
            }]
        };

        let jobs = self.store.insert_jobs(&new_jobs).await?;
        tracing::info!(
            count = jobs.len(),
            scene = %input.target.scene,
            "jobs submitted"
        );
        for job in &jobs {
            self.publish_job(job.clone()).await;
        }
        Ok(jobs)
    }

    // ── Worker flow ──────────────────────────────────────────────────

    pub async fn register_worker(&self, name: &str) -> AppResult<Worker> {
        if name.trim().is_empty() {
            return Err(AppError::Core(CoreError::Validation(
                "worker name must not be empty".into(),
            )));
        }
        let credential = uuid::Uuid::new_v4().to_string();
        let worker = self.store.register_worker(name, &credential).await?;
        tracing::info!(worker_id = worker.id, name, "worker registered");
        Ok(worker)
    }

    /// Claim the next queued job for a worker, if any.
    pub async fn claim(&self, worker_id: DbId) -> AppResult<Option<Job>> {
        let claimed = self.store.claim_next(worker_id).await?;
        if let Some(job) = &claimed {
            tracing::info!(job_id = job.id, worker_id, "job claimed");
            self.publish_job(job.clone()).await;
        }
        Ok(claimed)
    }

    /// Apply a worker progress report and hand back the directive.
    ///
    /// Only the owning worker may report; a straggler whose job was
    /// requeued or reassigned gets a conflict.
    pub async fn report_progress(
        &self,
        worker_id: DbId,
        job_id: DbId,
        mut report: ProgressReport,
    ) -> AppResult<ReportOutcome> {
        let job = self.fetch_job(job_id).await?;
        if job.worker_id != Some(worker_id) {
            return Err(AppError::Core(CoreError::Conflict(format!(
                "job {job_id} is not held by worker {worker_id}"
            ))));
        }
        // Bound the tail here so every store backing persists the
        // same truncated suffix.
        if let Some(tail) = report.log_tail.take() {
            report.log_tail = Some(truncate_tail(&tail, LOG_TAIL_MAX).to_string());
        }
        let outcome = self
            .store
            .apply_report(job_id, &report)
            .await?
            .ok_or_else(|| AppError::not_found("Job", job_id))?;
        if let Some(status) = report.status {
            if status != outcome.status {
                tracing::info!(
                    job_id,
                    reported = ?status,
                    resolved = ?outcome.status,
                    "report status resolved"
                );
            }
        }
        let job = self.fetch_job(job_id).await?;
        self.publish_job(job).await;
        Ok(outcome)
    }

    /// Record per-frame outcomes from a worker rescan.
    pub async fn report_frames(
        &self,
        worker_id: DbId,
        job_id: DbId,
        report: FrameReport,
    ) -> AppResult<()> {
        let job = self.fetch_job(job_id).await?;
        if job.worker_id != Some(worker_id) {
            return Err(AppError::Core(CoreError::Conflict(format!(
                "job {job_id} is not held by worker {worker_id}"
            ))));
        }
        let range = job.range();
        for &frame in report.done.iter().chain(report.failed.iter()) {
            if !range.contains_lattice(frame) {
                return Err(AppError::Core(CoreError::Validation(format!(
                    "frame {frame} is outside the job's range"
                ))));
            }
        }
        self.store
            .upsert_frames(job_id, &report.done, &report.failed)
            .await?;
        self.bus
            .publish(LiveEvent::Frames {
                job_id,
                done: report.done,
                failed: report.failed,
                current_frame: report.current_frame,
            })
            .await;
        Ok(())
    }

    // ── Cancellation ─────────────────────────────────────────────────

    pub async fn cancel_job(&self, job_id: DbId, mode: CancelState) -> AppResult<Job> {
        if mode == CancelState::None {
            return Err(AppError::BadRequest(
                "cancel mode must be immediate or graceful".into(),
            ));
        }
        self.fetch_job(job_id).await?;
        self.store.request_cancel(job_id, mode).await?;
        let job = self.fetch_job(job_id).await?;
        tracing::info!(job_id, ?mode, status = ?job.status, "cancel requested");
        self.publish_job(job.clone()).await;
        Ok(job)
    }

    pub async fn cancel_group(&self, group_id: &str, mode: CancelState) -> AppResult<usize> {
        let parts = self.group_parts_or_404(group_id).await?;
        let mut affected = 0;
        for part in &parts {
            if !part.status.is_terminal() {
                self.cancel_job(part.id, mode).await?;
                affected += 1;
            }
        }
        Ok(affected)
    }

    // ── Retry and repair ─────────────────────────────────────────────

    /// Operator retry: clone a terminal job into a fresh queued one
    /// and drop the old row. Terminal states never re-enter the
    /// machine; a retry is always a new job.
    pub async fn retry_job(&self, job_id: DbId) -> AppResult<Job> {
        let job = self.fetch_job(job_id).await?;
        if !job.status.is_terminal() {
            return Err(AppError::Core(CoreError::Conflict(format!(
                "job {job_id} is {:?}, only finished jobs can be retried",
                job.status
            ))));
        }
        let group = match (&job.group_id, job.part_index, job.part_count) {
            (Some(group_id), Some(part_index), Some(part_count)) => Some(GroupSlot {
                group_id: group_id.clone(),
                part_index,
                part_count,
            }),
            _ => None,
        };
        let new = NewJob {
            target: job.target.clone(),
            range: job.range(),
            group,
            priority: job.priority,
            max_retries: job.max_retries,
        };
        let mut inserted = self.store.insert_jobs(std::slice::from_ref(&new)).await?;
        let fresh = inserted.remove(0);
        self.store.delete_job(job_id).await?;

        tracing::info!(old_id = job_id, new_id = fresh.id, "job retried");
        self.bus.publish(LiveEvent::Deleted { job_id }).await;
        self.publish_job(fresh.clone()).await;
        Ok(fresh)
    }

    /// Retry every failed or cancelled part of a group. Finished
    /// parts are left alone.
    pub async fn retry_group_failed(&self, group_id: &str) -> AppResult<Vec<Job>> {
        let parts = self.group_parts_or_404(group_id).await?;
        let mut fresh = Vec::new();
        for part in parts {
            if matches!(part.status, JobStatus::Failed | JobStatus::Cancelled) {
                fresh.push(self.retry_job(part.id).await?);
            }
        }
        Ok(fresh)
    }

    /// Resubmit specific frames of a job as new high-priority jobs,
    /// one per contiguous run, under a fresh group. The source job is
    /// left untouched.
    pub async fn resubmit_frames(
        &self,
        job_id: DbId,
        frames: &[FrameNumber],
    ) -> AppResult<Vec<Job>> {
        if frames.is_empty() {
            return Err(AppError::Core(CoreError::Validation(
                "no frames given to resubmit".into(),
            )));
        }
        let job = self.fetch_job(job_id).await?;
        let range = job.range();
        for &frame in frames {
            if !range.contains_lattice(frame) {
                return Err(AppError::Core(CoreError::Validation(format!(
                    "frame {frame} is outside the job's range"
                ))));
            }
        }

        let runs = coalesce_runs(frames);
        let group_id = uuid::Uuid::new_v4().to_string();
        let part_count = runs.len() as i32;
        let new_jobs: Vec<NewJob> = runs
            .iter()
            .enumerate()
            .map(|(i, &(start, end))| NewJob {
                target: job.target.clone(),
                range: FrameRange {
                    start,
                    end,
                    step: 1,
                },
                group: Some(GroupSlot {
                    group_id: group_id.clone(),
                    part_index: i as i32 + 1,
                    part_count,
                }),
                priority: REPAIR_PRIORITY,
                max_retries: job.max_retries,
            })
            .collect();

        let jobs = self.store.insert_jobs(&new_jobs).await?;
        tracing::info!(job_id, runs = jobs.len(), "frames resubmitted");
        for job in &jobs {
            self.publish_job(job.clone()).await;
        }
        Ok(jobs)
    }

    /// Explode a job into one single-frame job per lattice frame,
    /// replacing the original. With `only_missing`, frames already
    /// recorded as done are left out, so a partially-finished job is
    /// only re-rendered where it has holes.
    pub async fn split_to_frames(&self, job_id: DbId, only_missing: bool) -> AppResult<Vec<Job>> {
        let job = self.fetch_job(job_id).await?;
        if job.status == JobStatus::Running {
            return Err(AppError::Core(CoreError::Conflict(format!(
                "job {job_id} is running and cannot be split"
            ))));
        }
        let frames: Vec<FrameNumber> = if only_missing {
            let done: std::collections::HashSet<FrameNumber> = self
                .store
                .frames(job_id)
                .await?
                .iter()
                .filter(|row| row.status == FrameStatus::Done)
                .map(|row| row.frame)
                .collect();
            job.range().frames().filter(|f| !done.contains(f)).collect()
        } else {
            job.range().frames().collect()
        };
        if frames.is_empty() {
            return Err(AppError::Core(CoreError::Validation(
                "every frame is already done, nothing to split".into(),
            )));
        }
        if !only_missing && frames.len() < 2 {
            return Err(AppError::Core(CoreError::Validation(
                "job has a single frame, nothing to split".into(),
            )));
        }

        let group_id = uuid::Uuid::new_v4().to_string();
        let part_count = frames.len() as i32;
        let new_jobs: Vec<NewJob> = frames
            .iter()
            .enumerate()
            .map(|(i, &frame)| NewJob {
                target: job.target.clone(),
                range: FrameRange {
                    start: frame,
                    end: frame,
                    step: 1,
                },
                group: Some(GroupSlot {
                    group_id: group_id.clone(),
                    part_index: i as i32 + 1,
                    part_count,
                }),
                priority: REPAIR_PRIORITY,
                max_retries: job.max_retries,
            })
            .collect();

        let jobs = self.store.insert_jobs(&new_jobs).await?;
        self.store.delete_job(job_id).await?;
        tracing::info!(job_id, parts = jobs.len(), "job split to frames");
        self.bus.publish(LiveEvent::Deleted { job_id }).await;
        for job in &jobs {
            self.publish_job(job.clone()).await;
        }
        Ok(jobs)
    }

    // ── Deletion and maintenance ─────────────────────────────────────

    /// Tombstone a job. A running job keeps its row until the worker
    /// acknowledges the immediate cancel; the background sweep reaps
    /// the tombstone afterwards.
    pub async fn delete_job(&self, job_id: DbId) -> AppResult<()> {
        self.fetch_job(job_id).await?;
        self.store.mark_deleted(job_id).await?;
        tracing::info!(job_id, "job deleted");
        self.bus.publish(LiveEvent::Deleted { job_id }).await;
        Ok(())
    }

    pub async fn delete_group(&self, group_id: &str) -> AppResult<usize> {
        let parts = self.group_parts_or_404(group_id).await?;
        for part in &parts {
            self.delete_job(part.id).await?;
        }
        Ok(parts.len())
    }

    /// Requeue running jobs whose worker has gone silent for longer
    /// than `stale_after`. Returns the number of jobs touched.
    pub async fn requeue_stale(&self, stale_after: std::time::Duration) -> AppResult<u64> {
        let cutoff = chrono::Utc::now()
            - chrono::Duration::from_std(stale_after).unwrap_or(chrono::Duration::zero());
        let touched = self.store.requeue_stale(cutoff).await?;
        if touched > 0 {
            tracing::warn!(touched, "requeued jobs from silent workers");
        }
        Ok(touched)
    }

    /// Purge terminal jobs older than `hours` plus any released
    /// tombstones. Returns the number of jobs removed.
    pub async fn purge(&self, hours: i64) -> AppResult<u64> {
        let cutoff = chrono::Utc::now() - chrono::Duration::hours(hours);
        let mut removed = self.store.purge_terminal_before(cutoff).await?;
        removed += self.store.purge_tombstones().await?;
        if removed > 0 {
            tracing::info!(removed, hours, "purged old jobs");
        }
        Ok(removed)
    }

    // ── Views ────────────────────────────────────────────────────────

    pub async fn job(&self, job_id: DbId) -> AppResult<Job> {
        self.fetch_job(job_id).await
    }

    /// Job list with grouped parts rolled up into [`GroupSummary`]s.
    pub async fn overview(&self) -> AppResult<JobsOverview> {
        let all = self.store.list_jobs().await?;
        let mut jobs = Vec::new();
        let mut grouped: Vec<(String, Vec<Job>)> = Vec::new();
        for job in all {
            match job.group_id.clone() {
                None => jobs.push(job),
                Some(gid) => {
                    if let Some((_, parts)) = grouped.iter_mut().find(|(g, _)| *g == gid) {
                        parts.push(job);
                    } else {
                        grouped.push((gid, vec![job]));
                    }
                }
            }
        }
        let groups = grouped
            .into_iter()
            .map(|(gid, parts)| summarize_group(gid, parts))
            .collect();
        Ok(JobsOverview { jobs, groups })
    }

    /// One group's parts with the derived roll-up.
    pub async fn group(&self, group_id: &str) -> AppResult<GroupSummary> {
        let parts = self.group_parts_or_404(group_id).await?;
        Ok(summarize_group(group_id.to_string(), parts))
    }

    /// Per-frame outcomes plus the lattice frames with no row yet.
    pub async fn frames_view(&self, job_id: DbId) -> AppResult<FramesView> {
        let job = self.fetch_job(job_id).await?;
        let frames = self.store.frames(job_id).await?;
        let known: std::collections::HashSet<FrameNumber> =
            frames.iter().map(|row| row.frame).collect();
        let missing = job
            .range()
            .frames()
            .filter(|f| !known.contains(f))
            .collect();
        Ok(FramesView { frames, missing })
    }

    pub async fn log_tail(&self, job_id: DbId) -> AppResult<Option<String>> {
        Ok(self.fetch_job(job_id).await?.log_tail)
    }

    async fn group_parts_or_404(&self, group_id: &str) -> AppResult<Vec<Job>> {
        let parts = self.store.group_parts(group_id).await?;
        if parts.is_empty() {
            return Err(AppError::Core(CoreError::Validation(format!(
                "group {group_id} has no jobs"
            ))));
        }
        Ok(parts)
    }
}

fn validate_target(target: &RenderTarget) -> AppResult<()> {
    for (field, value) in [
        ("scene", &target.scene),
        ("project", &target.project),
        ("output_dir", &target.output_dir),
        ("renderer", &target.renderer),
    ] {
        if value.trim().is_empty() {
            return Err(AppError::Core(CoreError::Validation(format!(
                "{field} must not be empty"
            ))));
        }
    }
    if target.width <= 0 || target.height <= 0 {
        return Err(AppError::Core(CoreError::Validation(
            "render resolution must be positive".into(),
        )));
    }
    Ok(())
}

fn summarize_group(group_id: String, mut parts: Vec<Job>) -> GroupSummary {
    parts.sort_by_key(|j| j.start_frame);
    let mut summary = GroupSummary {
        group_id,
        status: derive_group_status(&parts),
        frame_total: 0,
        frame_done: 0,
        frame_failed: 0,
        frame_running: 0,
        eta_seconds: None,
        parts: Vec::new(),
    };
    for part in &parts {
        summary.frame_total += part.frame_total;
        summary.frame_done += part.frame_done;
        summary.frame_failed += part.frame_failed;
        summary.frame_running += part.frame_running;
        if let Some(eta) = part.eta_seconds {
            summary.eta_seconds = Some(summary.eta_seconds.map_or(eta, |e: f64| e.max(eta)));
        }
    }
    summary.parts = parts;
    summary
}

/// Roll the statuses of a group's parts up into one:
/// running beats failed beats queued beats cancelled beats done.
/// Any in-flight part makes the group running; once nothing is
/// running a failed part surfaces immediately; the group only counts
/// as done when every part is.
pub fn derive_group_status(parts: &[Job]) -> JobStatus {
    let mut status = JobStatus::Done;
    for part in parts {
        let rank = |s: JobStatus| match s {
            JobStatus::Running => 4,
            JobStatus::Failed => 3,
            JobStatus::Queued => 2,
            JobStatus::Cancelled => 1,
            JobStatus::Done => 0,
        };
        if rank(part.status) > rank(status) {
            status = part.status;
        }
    }
    status
}
