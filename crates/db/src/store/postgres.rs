//! Postgres [`JobStore`] backing.
//!
//! Every mutation is a single statement (or one transaction), so the
//! atomicity the trait promises falls out of row-level locking.
//! Status and cancel values are stored as SMALLINT; the numeric
//! mapping lives on the enums in `models::status` and is repeated in
//! the SQL below:
//!
//! ```text
//! status: 1 queued, 2 running, 3 done, 4 failed, 5 cancelled
//! cancel: 0 none, 1 immediate, 2 graceful
//! ```

use async_trait::async_trait;
use elara_core::types::{DbId, FrameNumber, Timestamp};
use sqlx::PgPool;

use crate::models::frame::Frame;
use crate::models::job::{Job, NewJob, ProgressReport, ReportOutcome};
use crate::models::status::{CancelState, FrameStatus};
use crate::models::worker::Worker;

use super::{JobStore, StoreError};

/// Column list for jobs queries.
const JOB_COLUMNS: &str = "id, status, created, updated, \
    scene, project, output_dir, camera, layer, renderer, width, height, \
    start_frame, end_frame, by_step, group_id, part_index, part_count, \
    frame_total, frame_done, frame_failed, frame_running, eta_seconds, \
    error_count, priority, retries, max_retries, cancel_state, worker_id, \
    log_tail, deleted";

/// Column list for workers queries.
const WORKER_COLUMNS: &str = "id, name, credential, last_seen";

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobStore for PgStore {
    async fn insert_jobs(&self, jobs: &[NewJob]) -> Result<Vec<Job>, StoreError> {
        let query = format!(
            "INSERT INTO jobs
                (status, scene, project, output_dir, camera, layer, renderer,
                 width, height, start_frame, end_frame, by_step,
                 group_id, part_index, part_count, frame_total,
                 priority, max_retries)
             VALUES (1, $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11,
                     $12, $13, $14, $15, $16, $17)
             RETURNING {JOB_COLUMNS}"
        );
        let mut tx = self.pool.begin().await?;
        let mut out = Vec::with_capacity(jobs.len());
        for new in jobs {
            let group = new.group.as_ref();
            let job = sqlx::query_as::<_, Job>(&query)
                .bind(&new.target.scene)
                .bind(&new.target.project)
                .bind(&new.target.output_dir)
                .bind(&new.target.camera)
                .bind(&new.target.layer)
                .bind(&new.target.renderer)
                .bind(new.target.width)
                .bind(new.target.height)
                .bind(new.range.start)
                .bind(new.range.end)
                .bind(new.range.step)
                .bind(group.map(|g| g.group_id.as_str()))
                .bind(group.map(|g| g.part_index))
                .bind(group.map(|g| g.part_count))
                .bind(new.range.frame_total())
                .bind(new.priority)
                .bind(new.max_retries)
                .fetch_one(&mut *tx)
                .await?;
            out.push(job);
        }
        tx.commit().await?;
        Ok(out)
    }

    async fn job(&self, id: DbId) -> Result<Option<Job>, StoreError> {
        let query = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1");
        Ok(sqlx::query_as::<_, Job>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn list_jobs(&self) -> Result<Vec<Job>, StoreError> {
        let query = format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE deleted = FALSE ORDER BY id DESC"
        );
        Ok(sqlx::query_as::<_, Job>(&query)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn group_parts(&self, group_id: &str) -> Result<Vec<Job>, StoreError> {
        let query = format!(
            "SELECT {JOB_COLUMNS} FROM jobs
             WHERE deleted = FALSE AND group_id = $1
             ORDER BY start_frame ASC"
        );
        Ok(sqlx::query_as::<_, Job>(&query)
            .bind(group_id)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn claim_next(&self, worker_id: DbId) -> Result<Option<Job>, StoreError> {
        // SKIP LOCKED keeps concurrent claimers from blocking on (or
        // double-claiming) the same row.
        let query = format!(
            "UPDATE jobs
             SET status = 2, worker_id = $1, cancel_state = 0, updated = now()
             WHERE id = (
                 SELECT id FROM jobs
                 WHERE deleted = FALSE AND status = 1
                 ORDER BY priority DESC, id ASC
                 LIMIT 1
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING {JOB_COLUMNS}"
        );
        Ok(sqlx::query_as::<_, Job>(&query)
            .bind(worker_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn apply_report(
        &self,
        job_id: DbId,
        report: &ProgressReport,
    ) -> Result<Option<ReportOutcome>, StoreError> {
        // Single statement; every SET expression reads the pre-update
        // row, which is exactly the reference semantics in
        // `apply_report_in_place`. The requeue predicate (running,
        // failure reported, no cancel pending, budget remaining) is
        // repeated verbatim where it gates a column. The `status = 2`
        // guards are the SQL mirror of `JobStatus::can_enter`, and the
        // log tail arrives already bounded by the service.
        let outcome = sqlx::query_as::<_, ReportOutcome>(
            "UPDATE jobs SET
                updated = now(),
                frame_done = CASE WHEN $2 IS NULL THEN frame_done
                    ELSE LEAST(GREATEST($2, 0), frame_total) END,
                frame_failed = CASE WHEN $3 IS NULL THEN frame_failed
                    ELSE LEAST(GREATEST($3, 0), frame_total) END,
                frame_running = CASE
                    WHEN status = 2 AND $5 = 4 AND cancel_state = 0
                         AND retries < max_retries THEN 0
                    WHEN $4 IS NULL THEN frame_running
                    ELSE LEAST(GREATEST($4, 0), frame_total)
                END,
                log_tail = COALESCE($6, log_tail),
                eta_seconds = COALESCE($7, eta_seconds),
                error_count = GREATEST(error_count + COALESCE($8, 0), 0),
                retries = CASE
                    WHEN status = 2 AND $5 = 4 AND cancel_state = 0
                         AND retries < max_retries THEN retries + 1
                    ELSE retries
                END,
                worker_id = CASE
                    WHEN status = 2 AND $5 = 4 AND cancel_state = 0
                         AND retries < max_retries THEN NULL
                    ELSE worker_id
                END,
                status = CASE
                    WHEN status = 2 AND $5 = 3 THEN 3
                    WHEN status = 2 AND $5 = 4 AND cancel_state <> 0 THEN 5
                    WHEN status = 2 AND $5 = 4 AND retries < max_retries THEN 1
                    WHEN status = 2 AND $5 = 4 THEN 4
                    ELSE status
                END
             WHERE id = $1
             RETURNING status, cancel_state AS cancel",
        )
        .bind(job_id)
        .bind(report.frame_done)
        .bind(report.frame_failed)
        .bind(report.frame_running)
        .bind(report.status)
        .bind(&report.log_tail)
        .bind(report.eta_seconds)
        .bind(report.error_delta)
        .fetch_optional(&self.pool)
        .await?;
        Ok(outcome)
    }

    async fn request_cancel(&self, job_id: DbId, mode: CancelState) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE jobs SET
                cancel_state = CASE
                    WHEN status = 1 THEN 0
                    WHEN status = 2 THEN $2
                    ELSE cancel_state
                END,
                updated = CASE WHEN status IN (1, 2) THEN now() ELSE updated END,
                status = CASE WHEN status = 1 THEN 5 ELSE status END
             WHERE id = $1",
        )
        .bind(job_id)
        .bind(mode)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_deleted(&self, job_id: DbId) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE jobs SET
                deleted = TRUE,
                cancel_state = CASE WHEN status = 2 THEN 1 ELSE cancel_state END,
                updated = now()
             WHERE id = $1",
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_job(&self, job_id: DbId) -> Result<(), StoreError> {
        // job_frames rows go with the job via ON DELETE CASCADE.
        sqlx::query("DELETE FROM jobs WHERE id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn requeue_stale(&self, cutoff: Timestamp) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE jobs SET
                status = CASE WHEN cancel_state = 0 THEN 1 ELSE 5 END,
                worker_id = NULL,
                frame_running = 0,
                cancel_state = 0,
                updated = now()
             WHERE status = 2 AND updated < $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn purge_terminal_before(&self, cutoff: Timestamp) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM jobs WHERE status IN (3, 4, 5) AND updated < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn purge_tombstones(&self) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM jobs WHERE deleted = TRUE AND status <> 2")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn upsert_frames(
        &self,
        job_id: DbId,
        done: &[FrameNumber],
        failed: &[FrameNumber],
    ) -> Result<(), StoreError> {
        let query = "INSERT INTO job_frames (job_id, frame, status, tries, updated)
             SELECT $1, f, $3, 1, now() FROM UNNEST($2::bigint[]) AS f
             ON CONFLICT (job_id, frame) DO UPDATE SET
                status = EXCLUDED.status,
                tries = job_frames.tries + 1,
                updated = now()";
        let mut tx = self.pool.begin().await?;
        for (frames, status) in [(done, FrameStatus::Done), (failed, FrameStatus::Failed)] {
            if frames.is_empty() {
                continue;
            }
            sqlx::query(query)
                .bind(job_id)
                .bind(frames)
                .bind(status)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn frames(&self, job_id: DbId) -> Result<Vec<Frame>, StoreError> {
        Ok(sqlx::query_as::<_, Frame>(
            "SELECT job_id, frame, status, tries, updated
             FROM job_frames WHERE job_id = $1 ORDER BY frame ASC",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn register_worker(&self, name: &str, credential: &str) -> Result<Worker, StoreError> {
        let query = format!(
            "INSERT INTO workers (name, credential, last_seen)
             VALUES ($1, $2, now())
             ON CONFLICT (name) DO UPDATE SET
                credential = EXCLUDED.credential,
                last_seen = now()
             RETURNING {WORKER_COLUMNS}"
        );
        Ok(sqlx::query_as::<_, Worker>(&query)
            .bind(name)
            .bind(credential)
            .fetch_one(&self.pool)
            .await?)
    }

    async fn authenticate_worker(
        &self,
        worker_id: DbId,
        credential: &str,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE workers SET last_seen = now() WHERE id = $1 AND credential = $2")
            .bind(worker_id)
            .bind(credential)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }
}
