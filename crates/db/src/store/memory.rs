//! In-memory [`JobStore`] backing.
//!
//! Used by the test suite and by single-node deployments that run
//! without a database. Everything lives behind one mutex, which makes
//! each trait method trivially atomic.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use elara_core::types::{DbId, FrameNumber, Timestamp};

use crate::models::frame::Frame;
use crate::models::job::{Job, NewJob, ProgressReport, ReportOutcome};
use crate::models::status::{CancelState, FrameStatus, JobStatus};
use crate::models::worker::Worker;

use super::{apply_report_in_place, JobStore, StoreError};

#[derive(Default)]
struct Inner {
    jobs: BTreeMap<DbId, Job>,
    frames: BTreeMap<(DbId, FrameNumber), Frame>,
    workers: BTreeMap<DbId, Worker>,
    next_job_id: DbId,
    next_worker_id: DbId,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned mutex means a panic mid-update; propagating the
        // panic is the only sane option here.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Inner {
    fn remove_job_and_frames(&mut self, id: DbId) {
        self.jobs.remove(&id);
        self.frames.retain(|(job_id, _), _| *job_id != id);
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn insert_jobs(&self, jobs: &[NewJob]) -> Result<Vec<Job>, StoreError> {
        let mut inner = self.lock();
        let now = Utc::now();
        let mut out = Vec::with_capacity(jobs.len());
        for new in jobs {
            inner.next_job_id += 1;
            let id = inner.next_job_id;
            let (group_id, part_index, part_count) = match &new.group {
                Some(g) => (
                    Some(g.group_id.clone()),
                    Some(g.part_index),
                    Some(g.part_count),
                ),
                None => (None, None, None),
            };
            let job = Job {
                id,
                status: JobStatus::Queued,
                created: now,
                updated: now,
                target: new.target.clone(),
                start_frame: new.range.start,
                end_frame: new.range.end,
                by_step: new.range.step,
                group_id,
                part_index,
                part_count,
                frame_total: new.range.frame_total(),
                frame_done: 0,
                frame_failed: 0,
                frame_running: 0,
                eta_seconds: None,
                error_count: 0,
                priority: new.priority,
                retries: 0,
                max_retries: new.max_retries,
                cancel_state: CancelState::None,
                worker_id: None,
                log_tail: None,
                deleted: false,
            };
            inner.jobs.insert(id, job.clone());
            out.push(job);
        }
        Ok(out)
    }

    async fn job(&self, id: DbId) -> Result<Option<Job>, StoreError> {
        Ok(self.lock().jobs.get(&id).cloned())
    }

    async fn list_jobs(&self) -> Result<Vec<Job>, StoreError> {
        let inner = self.lock();
        let mut jobs: Vec<Job> = inner.jobs.values().filter(|j| !j.deleted).cloned().collect();
        jobs.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(jobs)
    }

    async fn group_parts(&self, group_id: &str) -> Result<Vec<Job>, StoreError> {
        let inner = self.lock();
        let mut parts: Vec<Job> = inner
            .jobs
            .values()
            .filter(|j| !j.deleted && j.group_id.as_deref() == Some(group_id))
            .cloned()
            .collect();
        parts.sort_by_key(|j| j.start_frame);
        Ok(parts)
    }

    async fn claim_next(&self, worker_id: DbId) -> Result<Option<Job>, StoreError> {
        let mut inner = self.lock();
        let pick = inner
            .jobs
            .values()
            .filter(|j| !j.deleted && j.status == JobStatus::Queued)
            .min_by_key(|j| (std::cmp::Reverse(j.priority), j.id))
            .map(|j| j.id);
        let Some(id) = pick else { return Ok(None) };
        let job = inner.jobs.get_mut(&id).ok_or_else(|| {
            StoreError::Internal(format!("claimed job {id} vanished under the lock"))
        })?;
        job.status = JobStatus::Running;
        job.worker_id = Some(worker_id);
        job.cancel_state = CancelState::None;
        job.updated = Utc::now();
        Ok(Some(job.clone()))
    }

    async fn apply_report(
        &self,
        job_id: DbId,
        report: &ProgressReport,
    ) -> Result<Option<ReportOutcome>, StoreError> {
        let mut inner = self.lock();
        let Some(job) = inner.jobs.get_mut(&job_id) else {
            return Ok(None);
        };
        Ok(Some(apply_report_in_place(job, report)))
    }

    async fn request_cancel(&self, job_id: DbId, mode: CancelState) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let Some(job) = inner.jobs.get_mut(&job_id) else {
            return Ok(());
        };
        match job.status {
            JobStatus::Queued => {
                job.status = JobStatus::Cancelled;
                job.cancel_state = CancelState::None;
                job.updated = Utc::now();
            }
            JobStatus::Running => {
                job.cancel_state = mode;
                job.updated = Utc::now();
            }
            // Already terminal; the existing state wins.
            _ => {}
        }
        Ok(())
    }

    async fn mark_deleted(&self, job_id: DbId) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let Some(job) = inner.jobs.get_mut(&job_id) else {
            return Ok(());
        };
        job.deleted = true;
        if job.status == JobStatus::Running {
            job.cancel_state = CancelState::Immediate;
        }
        job.updated = Utc::now();
        Ok(())
    }

    async fn delete_job(&self, job_id: DbId) -> Result<(), StoreError> {
        self.lock().remove_job_and_frames(job_id);
        Ok(())
    }

    async fn requeue_stale(&self, cutoff: Timestamp) -> Result<u64, StoreError> {
        let mut inner = self.lock();
        let now = Utc::now();
        let mut touched = 0;
        for job in inner.jobs.values_mut() {
            if job.status == JobStatus::Running && job.updated < cutoff {
                job.status = if job.cancel_state == CancelState::None {
                    JobStatus::Queued
                } else {
                    JobStatus::Cancelled
                };
                job.worker_id = None;
                job.frame_running = 0;
                job.cancel_state = CancelState::None;
                job.updated = now;
                touched += 1;
            }
        }
        Ok(touched)
    }

    async fn purge_terminal_before(&self, cutoff: Timestamp) -> Result<u64, StoreError> {
        let mut inner = self.lock();
        let ids: Vec<DbId> = inner
            .jobs
            .values()
            .filter(|j| j.status.is_terminal() && j.updated < cutoff)
            .map(|j| j.id)
            .collect();
        for id in &ids {
            inner.remove_job_and_frames(*id);
        }
        Ok(ids.len() as u64)
    }

    async fn purge_tombstones(&self) -> Result<u64, StoreError> {
        let mut inner = self.lock();
        let ids: Vec<DbId> = inner
            .jobs
            .values()
            .filter(|j| j.deleted && j.status != JobStatus::Running)
            .map(|j| j.id)
            .collect();
        for id in &ids {
            inner.remove_job_and_frames(*id);
        }
        Ok(ids.len() as u64)
    }

    async fn upsert_frames(
        &self,
        job_id: DbId,
        done: &[FrameNumber],
        failed: &[FrameNumber],
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let now = Utc::now();
        for (frames, status) in [(done, FrameStatus::Done), (failed, FrameStatus::Failed)] {
            for &frame in frames {
                inner
                    .frames
                    .entry((job_id, frame))
                    .and_modify(|f| {
                        f.status = status;
                        f.tries += 1;
                        f.updated = now;
                    })
                    .or_insert(Frame {
                        job_id,
                        frame,
                        status,
                        tries: 1,
                        updated: now,
                    });
            }
        }
        Ok(())
    }

    async fn frames(&self, job_id: DbId) -> Result<Vec<Frame>, StoreError> {
        let inner = self.lock();
        Ok(inner
            .frames
            .range((job_id, FrameNumber::MIN)..=(job_id, FrameNumber::MAX))
            .map(|(_, f)| f.clone())
            .collect())
    }

    async fn register_worker(&self, name: &str, credential: &str) -> Result<Worker, StoreError> {
        let mut inner = self.lock();
        let now = Utc::now();
        if let Some(existing) = inner.workers.values_mut().find(|w| w.name == name) {
            existing.credential = credential.to_string();
            existing.last_seen = now;
            return Ok(existing.clone());
        }
        inner.next_worker_id += 1;
        let worker = Worker {
            id: inner.next_worker_id,
            name: name.to_string(),
            credential: credential.to_string(),
            last_seen: now,
        };
        inner.workers.insert(worker.id, worker.clone());
        Ok(worker)
    }

    async fn authenticate_worker(
        &self,
        worker_id: DbId,
        credential: &str,
    ) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        let Some(worker) = inner.workers.get_mut(&worker_id) else {
            return Ok(false);
        };
        if worker.credential != credential {
            return Ok(false);
        }
        worker.last_seen = Utc::now();
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use assert_matches::assert_matches;
    use chrono::Duration;
    use elara_core::range::FrameRange;

    use crate::models::job::{GroupSlot, RenderTarget};

    use super::*;

    fn target() -> RenderTarget {
        RenderTarget {
            scene: "/srv/scenes/shot010.mb".into(),
            project: "/srv/projects/shot010".into(),
            output_dir: "/srv/out/shot010".into(),
            camera: Some("renderCam".into()),
            layer: None,
            renderer: "arnold".into(),
            width: 1920,
            height: 1080,
        }
    }

    fn new_job(start: i64, end: i64) -> NewJob {
        NewJob {
            target: target(),
            range: FrameRange::new(start, end, 1).unwrap(),
            group: None,
            priority: 0,
            max_retries: 2,
        }
    }

    async fn one_job(store: &MemoryStore) -> Job {
        store.insert_jobs(&[new_job(1, 10)]).await.unwrap().remove(0)
    }

    // ── Claiming ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn claim_moves_queued_to_running_and_stamps_worker() {
        let store = MemoryStore::new();
        let job = one_job(&store).await;

        let claimed = store.claim_next(7).await.unwrap().unwrap();
        assert_eq!(claimed.id, job.id);
        assert_eq!(claimed.status, JobStatus::Running);
        assert_eq!(claimed.worker_id, Some(7));

        // Nothing left to claim.
        assert_matches!(store.claim_next(8).await.unwrap(), None);
    }

    #[tokio::test]
    async fn claim_prefers_higher_priority_then_older_id() {
        let store = MemoryStore::new();
        let mut low = new_job(1, 10);
        low.priority = 0;
        let mut high = new_job(1, 10);
        high.priority = 10;
        let jobs = store.insert_jobs(&[low, high]).await.unwrap();

        let first = store.claim_next(1).await.unwrap().unwrap();
        assert_eq!(first.id, jobs[1].id);
        let second = store.claim_next(1).await.unwrap().unwrap();
        assert_eq!(second.id, jobs[0].id);
    }

    #[tokio::test]
    async fn concurrent_claims_never_hand_out_the_same_job() {
        let store = Arc::new(MemoryStore::new());
        let jobs: Vec<NewJob> = (0..8).map(|_| new_job(1, 5)).collect();
        store.insert_jobs(&jobs).await.unwrap();

        let mut handles = Vec::new();
        for worker_id in 0..16i64 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.claim_next(worker_id).await.unwrap().map(|j| j.id)
            }));
        }
        let mut claimed: Vec<DbId> = Vec::new();
        for handle in handles {
            if let Some(id) = handle.await.unwrap() {
                claimed.push(id);
            }
        }
        claimed.sort_unstable();
        let before = claimed.len();
        claimed.dedup();
        assert_eq!(before, 8, "exactly the 8 queued jobs get claimed");
        assert_eq!(claimed.len(), 8, "no job claimed twice");
    }

    #[tokio::test]
    async fn claim_skips_tombstoned_jobs() {
        let store = MemoryStore::new();
        let job = one_job(&store).await;
        store.mark_deleted(job.id).await.unwrap();
        assert_matches!(store.claim_next(1).await.unwrap(), None);
    }

    // ── Progress reports ─────────────────────────────────────────────

    #[tokio::test]
    async fn counters_clamp_to_frame_total() {
        let store = MemoryStore::new();
        let job = one_job(&store).await;
        store.claim_next(1).await.unwrap();

        let report = ProgressReport {
            frame_done: Some(job.frame_total + 50),
            frame_failed: Some(-3),
            ..Default::default()
        };
        store.apply_report(job.id, &report).await.unwrap().unwrap();

        let job = store.job(job.id).await.unwrap().unwrap();
        assert_eq!(job.frame_done, job.frame_total);
        assert_eq!(job.frame_failed, 0);
    }

    #[tokio::test]
    async fn failure_requeues_until_the_retry_budget_runs_out() {
        let store = MemoryStore::new();
        let job = one_job(&store).await; // max_retries = 2

        let failed = ProgressReport {
            status: Some(JobStatus::Failed),
            ..Default::default()
        };
        for expected_retries in 1..=2 {
            store.claim_next(1).await.unwrap().unwrap();
            let outcome = store.apply_report(job.id, &failed).await.unwrap().unwrap();
            assert_eq!(outcome.status, JobStatus::Queued);
            let job = store.job(job.id).await.unwrap().unwrap();
            assert_eq!(job.retries, expected_retries);
            assert_eq!(job.worker_id, None);
        }

        // Third failure exhausts the budget.
        store.claim_next(1).await.unwrap().unwrap();
        let outcome = store.apply_report(job.id, &failed).await.unwrap().unwrap();
        assert_eq!(outcome.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn report_on_terminal_job_only_refreshes_counters() {
        let store = MemoryStore::new();
        let job = one_job(&store).await;
        store.claim_next(1).await.unwrap();
        let done = ProgressReport {
            status: Some(JobStatus::Done),
            ..Default::default()
        };
        store.apply_report(job.id, &done).await.unwrap();

        // A straggling report cannot resurrect the job.
        let late = ProgressReport {
            status: Some(JobStatus::Failed),
            frame_done: Some(4),
            ..Default::default()
        };
        let outcome = store.apply_report(job.id, &late).await.unwrap().unwrap();
        assert_eq!(outcome.status, JobStatus::Done);
        assert_eq!(store.job(job.id).await.unwrap().unwrap().frame_done, 4);
    }

    #[tokio::test]
    async fn duplicate_failure_on_a_requeued_job_burns_no_extra_retry() {
        let store = MemoryStore::new();
        let job = one_job(&store).await;
        store.claim_next(1).await.unwrap().unwrap();

        let failed = ProgressReport {
            status: Some(JobStatus::Failed),
            ..Default::default()
        };
        store.apply_report(job.id, &failed).await.unwrap();

        // The old worker repeats its failure after the requeue.
        let outcome = store.apply_report(job.id, &failed).await.unwrap().unwrap();
        assert_eq!(outcome.status, JobStatus::Queued);
        let job = store.job(job.id).await.unwrap().unwrap();
        assert_eq!(job.retries, 1);
        assert_eq!(job.status, JobStatus::Queued);
    }

    // ── Cancellation ─────────────────────────────────────────────────

    #[tokio::test]
    async fn cancelling_a_queued_job_is_final() {
        let store = MemoryStore::new();
        let job = one_job(&store).await;
        store
            .request_cancel(job.id, CancelState::Immediate)
            .await
            .unwrap();
        let job = store.job(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert_matches!(store.claim_next(1).await.unwrap(), None);
    }

    #[tokio::test]
    async fn running_cancel_is_delivered_via_the_report_outcome() {
        let store = MemoryStore::new();
        let job = one_job(&store).await;
        store.claim_next(1).await.unwrap();
        store
            .request_cancel(job.id, CancelState::Graceful)
            .await
            .unwrap();

        let outcome = store
            .apply_report(job.id, &ProgressReport::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome.cancel, CancelState::Graceful);
        assert_eq!(outcome.status, JobStatus::Running);
    }

    #[tokio::test]
    async fn induced_failure_materializes_cancelled_not_failed() {
        let store = MemoryStore::new();
        let job = one_job(&store).await;
        store.claim_next(1).await.unwrap();
        store
            .request_cancel(job.id, CancelState::Immediate)
            .await
            .unwrap();

        let report = ProgressReport {
            status: Some(JobStatus::Failed),
            ..Default::default()
        };
        let outcome = store.apply_report(job.id, &report).await.unwrap().unwrap();
        assert_eq!(outcome.status, JobStatus::Cancelled);
        // No retry is burned on a cancelled job.
        assert_eq!(store.job(job.id).await.unwrap().unwrap().retries, 0);
    }

    #[tokio::test]
    async fn cancel_racing_a_done_report_leaves_done_in_place() {
        let store = MemoryStore::new();
        let job = one_job(&store).await;
        store.claim_next(1).await.unwrap();
        store
            .request_cancel(job.id, CancelState::Graceful)
            .await
            .unwrap();

        let report = ProgressReport {
            status: Some(JobStatus::Done),
            ..Default::default()
        };
        store.apply_report(job.id, &report).await.unwrap();

        // The late cancel request is a no-op.
        store
            .request_cancel(job.id, CancelState::Immediate)
            .await
            .unwrap();
        assert_eq!(
            store.job(job.id).await.unwrap().unwrap().status,
            JobStatus::Done
        );
    }

    #[tokio::test]
    async fn reclaim_after_requeue_clears_stale_cancel_state() {
        let store = MemoryStore::new();
        let job = one_job(&store).await;
        store.claim_next(1).await.unwrap();
        store
            .request_cancel(job.id, CancelState::Graceful)
            .await
            .unwrap();

        // Force a requeue by hand to simulate operator intervention.
        {
            let mut inner = store.lock();
            let job = inner.jobs.get_mut(&job.id).unwrap();
            job.status = JobStatus::Queued;
            job.worker_id = None;
        }
        let claimed = store.claim_next(2).await.unwrap().unwrap();
        assert_eq!(claimed.cancel_state, CancelState::None);
    }

    #[tokio::test]
    async fn stale_running_jobs_go_back_to_the_queue() {
        let store = MemoryStore::new();
        let job = one_job(&store).await;
        store.claim_next(1).await.unwrap();

        // A fresh job is not stale.
        let past = Utc::now() - Duration::minutes(10);
        assert_eq!(store.requeue_stale(past).await.unwrap(), 0);

        let future = Utc::now() + Duration::seconds(1);
        assert_eq!(store.requeue_stale(future).await.unwrap(), 1);

        let job = store.job(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.worker_id, None);
        // No retry is burned; the worker died, the job did not fail.
        assert_eq!(job.retries, 0);
    }

    #[tokio::test]
    async fn stale_job_with_pending_cancel_is_cancelled() {
        let store = MemoryStore::new();
        let job = one_job(&store).await;
        store.claim_next(1).await.unwrap();
        store
            .request_cancel(job.id, CancelState::Graceful)
            .await
            .unwrap();

        let future = Utc::now() + Duration::seconds(1);
        assert_eq!(store.requeue_stale(future).await.unwrap(), 1);
        let job = store.job(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
    }

    // ── Deletion and purging ─────────────────────────────────────────

    #[tokio::test]
    async fn tombstoned_running_job_gets_an_immediate_cancel() {
        let store = MemoryStore::new();
        let job = one_job(&store).await;
        store.claim_next(1).await.unwrap();
        store.mark_deleted(job.id).await.unwrap();

        let job = store.job(job.id).await.unwrap().unwrap();
        assert!(job.deleted);
        assert_eq!(job.cancel_state, CancelState::Immediate);
        assert!(store.list_jobs().await.unwrap().is_empty());

        // Still running, so the tombstone purge leaves it alone.
        assert_eq!(store.purge_tombstones().await.unwrap(), 0);

        let report = ProgressReport {
            status: Some(JobStatus::Failed),
            ..Default::default()
        };
        store.apply_report(job.id, &report).await.unwrap();
        assert_eq!(store.purge_tombstones().await.unwrap(), 1);
        assert_matches!(store.job(job.id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn purge_removes_old_terminal_jobs_and_their_frames() {
        let store = MemoryStore::new();
        let job = one_job(&store).await;
        store.claim_next(1).await.unwrap();
        store.upsert_frames(job.id, &[1, 2], &[]).await.unwrap();
        let done = ProgressReport {
            status: Some(JobStatus::Done),
            ..Default::default()
        };
        store.apply_report(job.id, &done).await.unwrap();

        // A cutoff in the past spares the freshly updated job.
        let past = Utc::now() - Duration::hours(1);
        assert_eq!(store.purge_terminal_before(past).await.unwrap(), 0);

        let future = Utc::now() + Duration::hours(1);
        assert_eq!(store.purge_terminal_before(future).await.unwrap(), 1);
        assert_matches!(store.job(job.id).await.unwrap(), None);
        assert!(store.frames(job.id).await.unwrap().is_empty());
    }

    // ── Frames and workers ───────────────────────────────────────────

    #[tokio::test]
    async fn frame_upserts_are_idempotent_and_count_tries() {
        let store = MemoryStore::new();
        let job = one_job(&store).await;

        store.upsert_frames(job.id, &[], &[3]).await.unwrap();
        store.upsert_frames(job.id, &[3], &[]).await.unwrap();

        let frames = store.frames(job.id).await.unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].status, FrameStatus::Done);
        assert_eq!(frames[0].tries, 2);
    }

    #[tokio::test]
    async fn reregistering_a_worker_rotates_its_credential() {
        let store = MemoryStore::new();
        let first = store.register_worker("node-01", "key-a").await.unwrap();
        let second = store.register_worker("node-01", "key-b").await.unwrap();

        assert_eq!(first.id, second.id);
        assert!(!store.authenticate_worker(first.id, "key-a").await.unwrap());
        assert!(store.authenticate_worker(first.id, "key-b").await.unwrap());
        assert!(!store.authenticate_worker(999, "key-b").await.unwrap());
    }

    #[tokio::test]
    async fn group_parts_come_back_in_frame_order() {
        let store = MemoryStore::new();
        let slot = |i| GroupSlot {
            group_id: "g-1".into(),
            part_index: i,
            part_count: 2,
        };
        let mut late = new_job(11, 20);
        late.group = Some(slot(1));
        let mut early = new_job(1, 10);
        early.group = Some(slot(0));
        store.insert_jobs(&[late, early]).await.unwrap();

        let parts = store.group_parts("g-1").await.unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].start_frame, 1);
        assert_eq!(parts[1].start_frame, 11);
    }
}
