//! End-to-end orchestration tests against the in-memory store.

use std::sync::Arc;

use assert_matches::assert_matches;
use elara_db::models::job::{ProgressReport, RenderTarget, LOG_TAIL_MAX};
use elara_db::models::status::{CancelState, JobStatus};
use elara_db::MemoryStore;
use elara_events::LiveBus;
use elara_server::error::AppError;
use elara_server::service::{Orchestrator, SubmitJob};

fn orchestrator() -> Orchestrator {
    Orchestrator::new(Arc::new(MemoryStore::new()), Arc::new(LiveBus::new()))
}

fn submission(start: i64, end: i64, chunk_size: Option<i64>) -> SubmitJob {
    SubmitJob {
        target: RenderTarget {
            scene: "/srv/scenes/shot010.mb".into(),
            project: "/srv/projects/shot010".into(),
            output_dir: "/srv/out/shot010".into(),
            camera: Some("renderCam".into()),
            layer: None,
            renderer: "arnold".into(),
            width: 1920,
            height: 1080,
        },
        start_frame: start,
        end_frame: end,
        by_step: 1,
        chunk_size,
        priority: 0,
        max_retries: 2,
    }
}

// ---------------------------------------------------------------------------
// Submission and chunking
// ---------------------------------------------------------------------------

#[tokio::test]
async fn plain_submission_creates_one_queued_job() {
    let orch = orchestrator();
    let jobs = orch.submit(submission(1, 10, None)).await.unwrap();

    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].status, JobStatus::Queued);
    assert_eq!(jobs[0].frame_total, 10);
    assert_eq!(jobs[0].group_id, None);
}

#[tokio::test]
async fn chunked_submission_partitions_without_gap_or_overlap() {
    let orch = orchestrator();
    let jobs = orch.submit(submission(1, 10, Some(4))).await.unwrap();

    assert_eq!(jobs.len(), 3);
    let group_id = jobs[0].group_id.clone().unwrap();
    assert!(jobs.iter().all(|j| j.group_id.as_deref() == Some(&*group_id)));
    assert_eq!(jobs.iter().map(|j| j.frame_total).sum::<i64>(), 10);

    // Parts are numbered 1..N.
    let indexes: Vec<i32> = jobs.iter().map(|j| j.part_index.unwrap()).collect();
    assert_eq!(indexes, vec![1, 2, 3]);
    assert!(jobs.iter().all(|j| j.part_count == Some(3)));

    // Consecutive parts line up exactly.
    for pair in jobs.windows(2) {
        assert_eq!(pair[1].start_frame, pair[0].end_frame + 1);
    }
    assert_eq!(jobs[0].start_frame, 1);
    assert_eq!(jobs[2].end_frame, 10);
}

#[tokio::test]
async fn chunk_size_covering_the_range_stays_a_single_job() {
    let orch = orchestrator();
    let jobs = orch.submit(submission(1, 10, Some(100))).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].group_id, None);
}

#[tokio::test]
async fn reversed_range_is_rejected() {
    let orch = orchestrator();
    let err = orch.submit(submission(10, 1, None)).await.unwrap_err();
    assert_matches!(err, AppError::Core(_));
}

// ---------------------------------------------------------------------------
// Worker lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn claim_report_done_runs_the_happy_path() {
    let orch = orchestrator();
    orch.submit(submission(1, 10, None)).await.unwrap();
    let worker = orch.register_worker("node-01").await.unwrap();

    let job = orch.claim(worker.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Running);

    let outcome = orch
        .report_progress(
            worker.id,
            job.id,
            ProgressReport {
                frame_done: Some(4),
                frame_running: Some(1),
                eta_seconds: Some(120.0),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(outcome.status, JobStatus::Running);
    assert_eq!(outcome.cancel, CancelState::None);

    let outcome = orch
        .report_progress(
            worker.id,
            job.id,
            ProgressReport {
                status: Some(JobStatus::Done),
                frame_done: Some(10),
                frame_running: Some(0),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(outcome.status, JobStatus::Done);

    let job = orch.job(job.id).await.unwrap();
    assert_eq!(job.frame_done, 10);
}

#[tokio::test]
async fn report_from_a_non_owning_worker_is_rejected() {
    let orch = orchestrator();
    orch.submit(submission(1, 10, None)).await.unwrap();
    let owner = orch.register_worker("node-01").await.unwrap();
    let other = orch.register_worker("node-02").await.unwrap();

    let job = orch.claim(owner.id).await.unwrap().unwrap();
    let err = orch
        .report_progress(other.id, job.id, ProgressReport::default())
        .await
        .unwrap_err();
    assert_matches!(err, AppError::Core(_));
}

#[tokio::test]
async fn frame_reports_track_lattice_outcomes() {
    let orch = orchestrator();
    orch.submit(submission(1, 5, None)).await.unwrap();
    let worker = orch.register_worker("node-01").await.unwrap();
    let job = orch.claim(worker.id).await.unwrap().unwrap();

    orch.report_frames(
        worker.id,
        job.id,
        elara_db::models::frame::FrameReport {
            done: vec![1, 2],
            failed: vec![4],
            current_frame: Some(3),
        },
    )
    .await
    .unwrap();

    let view = orch.frames_view(job.id).await.unwrap();
    assert_eq!(view.frames.len(), 3);
    assert_eq!(view.missing, vec![3, 5]);

    // Out-of-lattice frames are rejected.
    let err = orch
        .report_frames(
            worker.id,
            job.id,
            elara_db::models::frame::FrameReport {
                done: vec![99],
                failed: vec![],
                current_frame: None,
            },
        )
        .await
        .unwrap_err();
    assert_matches!(err, AppError::Core(_));
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn graceful_cancel_reaches_the_worker_and_materializes() {
    let orch = orchestrator();
    orch.submit(submission(1, 10, None)).await.unwrap();
    let worker = orch.register_worker("node-01").await.unwrap();
    let job = orch.claim(worker.id).await.unwrap().unwrap();

    let cancelled = orch.cancel_job(job.id, CancelState::Graceful).await.unwrap();
    assert_eq!(cancelled.status, JobStatus::Running);

    // Next report carries the directive.
    let outcome = orch
        .report_progress(worker.id, job.id, ProgressReport::default())
        .await
        .unwrap();
    assert_eq!(outcome.cancel, CancelState::Graceful);

    // Worker stops and reports the induced failure.
    let outcome = orch
        .report_progress(
            worker.id,
            job.id,
            ProgressReport {
                status: Some(JobStatus::Failed),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(outcome.status, JobStatus::Cancelled);
}

#[tokio::test]
async fn group_cancel_skips_finished_parts() {
    let orch = orchestrator();
    let parts = orch.submit(submission(1, 10, Some(5))).await.unwrap();
    let group_id = parts[0].group_id.clone().unwrap();
    let worker = orch.register_worker("node-01").await.unwrap();

    // Finish the first part.
    let first = orch.claim(worker.id).await.unwrap().unwrap();
    orch.report_progress(
        worker.id,
        first.id,
        ProgressReport {
            status: Some(JobStatus::Done),
            frame_done: Some(5),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    let affected = orch
        .cancel_group(&group_id, CancelState::Immediate)
        .await
        .unwrap();
    assert_eq!(affected, 1);

    let overview = orch.overview().await.unwrap();
    let group = &overview.groups[0];
    let statuses: Vec<JobStatus> = group.parts.iter().map(|p| p.status).collect();
    assert!(statuses.contains(&JobStatus::Done));
    assert!(statuses.contains(&JobStatus::Cancelled));
}

// ---------------------------------------------------------------------------
// Retry and repair
// ---------------------------------------------------------------------------

#[tokio::test]
async fn retry_replaces_a_terminal_job_with_a_fresh_one() {
    let orch = orchestrator();
    orch.submit(submission(1, 10, None)).await.unwrap();
    let worker = orch.register_worker("node-01").await.unwrap();
    let job = orch.claim(worker.id).await.unwrap().unwrap();
    orch.cancel_job(job.id, CancelState::Immediate).await.unwrap();
    orch.report_progress(
        worker.id,
        job.id,
        ProgressReport {
            status: Some(JobStatus::Failed),
            frame_done: Some(3),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    let fresh = orch.retry_job(job.id).await.unwrap();
    assert_ne!(fresh.id, job.id);
    assert_eq!(fresh.status, JobStatus::Queued);
    assert_eq!(fresh.frame_done, 0);
    assert_eq!(fresh.retries, 0);
    assert_eq!((fresh.start_frame, fresh.end_frame), (1, 10));

    // The old row is gone.
    let err = orch.job(job.id).await.unwrap_err();
    assert_matches!(err, AppError::Core(_));
}

#[tokio::test]
async fn retry_of_a_running_job_is_a_conflict() {
    let orch = orchestrator();
    orch.submit(submission(1, 10, None)).await.unwrap();
    let worker = orch.register_worker("node-01").await.unwrap();
    let job = orch.claim(worker.id).await.unwrap().unwrap();

    let err = orch.retry_job(job.id).await.unwrap_err();
    assert_matches!(err, AppError::Core(_));
}

#[tokio::test]
async fn resubmit_coalesces_frames_into_runs() {
    let orch = orchestrator();
    let jobs = orch.submit(submission(1, 20, None)).await.unwrap();

    let parts = orch
        .resubmit_frames(jobs[0].id, &[3, 4, 5, 9])
        .await
        .unwrap();
    assert_eq!(parts.len(), 2);
    assert_eq!((parts[0].start_frame, parts[0].end_frame), (3, 5));
    assert_eq!((parts[1].start_frame, parts[1].end_frame), (9, 9));
    assert!(parts.iter().all(|p| p.priority == 10));
    assert!(parts.iter().all(|p| p.by_step == 1));

    // One shared group, parts numbered from 1.
    let gid = parts[0].group_id.clone().unwrap();
    assert!(parts.iter().all(|p| p.group_id.as_deref() == Some(&*gid)));
    assert_eq!(parts[0].part_index, Some(1));
    assert_eq!(parts[1].part_index, Some(2));
}

#[tokio::test]
async fn resubmit_mints_a_fresh_group_even_for_grouped_sources() {
    let orch = orchestrator();
    let sources = orch.submit(submission(1, 10, Some(5))).await.unwrap();
    let source_gid = sources[0].group_id.clone().unwrap();

    let parts = orch.resubmit_frames(sources[0].id, &[2, 3]).await.unwrap();
    assert_eq!(parts.len(), 1);
    let new_gid = parts[0].group_id.clone().unwrap();
    assert_ne!(new_gid, source_gid);

    // The source group's part accounting is untouched.
    let group = orch.group(&source_gid).await.unwrap();
    assert_eq!(group.parts.len(), 2);
}

#[tokio::test]
async fn split_explodes_a_queued_job_into_single_frames() {
    let orch = orchestrator();
    let jobs = orch.submit(submission(1, 4, None)).await.unwrap();

    let parts = orch.split_to_frames(jobs[0].id, false).await.unwrap();
    assert_eq!(parts.len(), 4);
    for (i, part) in parts.iter().enumerate() {
        assert_eq!(part.start_frame, 1 + i as i64);
        assert_eq!(part.end_frame, part.start_frame);
        assert_eq!(part.frame_total, 1);
    }

    // Original is gone; only the parts remain.
    let overview = orch.overview().await.unwrap();
    assert!(overview.jobs.is_empty());
    assert_eq!(overview.groups.len(), 1);
    assert_eq!(overview.groups[0].parts.len(), 4);
}

#[tokio::test]
async fn split_only_missing_skips_frames_already_done() {
    let orch = orchestrator();
    let jobs = orch.submit(submission(1, 5, None)).await.unwrap();
    let worker = orch.register_worker("node-01").await.unwrap();
    let job = orch.claim(worker.id).await.unwrap().unwrap();
    assert_eq!(job.id, jobs[0].id);

    orch.report_frames(
        worker.id,
        job.id,
        elara_db::models::frame::FrameReport {
            done: vec![2, 4],
            failed: vec![],
            current_frame: None,
        },
    )
    .await
    .unwrap();
    orch.report_progress(
        worker.id,
        job.id,
        ProgressReport {
            status: Some(JobStatus::Failed),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    // Retry budget kicked the job back to queued; split what is left.
    let parts = orch.split_to_frames(job.id, true).await.unwrap();

    let starts: Vec<i64> = parts.iter().map(|p| p.start_frame).collect();
    assert_eq!(starts, vec![1, 3, 5]);
    assert!(parts.iter().all(|p| p.frame_total == 1));
}

// ---------------------------------------------------------------------------
// Overview and maintenance
// ---------------------------------------------------------------------------

#[tokio::test]
async fn failed_part_outranks_queued_in_the_group_rollup() {
    let orch = orchestrator();
    let mut input = submission(1, 10, Some(5));
    input.max_retries = 0;
    let parts = orch.submit(input).await.unwrap();
    let group_id = parts[0].group_id.clone().unwrap();
    let worker = orch.register_worker("node-01").await.unwrap();

    // Fail the first part for good; the second never starts.
    let first = orch.claim(worker.id).await.unwrap().unwrap();
    orch.report_progress(
        worker.id,
        first.id,
        ProgressReport {
            status: Some(JobStatus::Failed),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    let group = orch.group(&group_id).await.unwrap();
    assert_eq!(group.status, JobStatus::Failed);
}

#[tokio::test]
async fn oversized_log_tails_are_truncated_before_persisting() {
    let orch = orchestrator();
    orch.submit(submission(1, 10, None)).await.unwrap();
    let worker = orch.register_worker("node-01").await.unwrap();
    let job = orch.claim(worker.id).await.unwrap().unwrap();

    let tail = "x".repeat(LOG_TAIL_MAX + 2000) + "END";
    orch.report_progress(
        worker.id,
        job.id,
        ProgressReport {
            log_tail: Some(tail),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    let stored = orch.log_tail(job.id).await.unwrap().unwrap();
    assert_eq!(stored.len(), LOG_TAIL_MAX);
    assert!(stored.ends_with("END"));
}

#[tokio::test]
async fn overview_rolls_groups_up_with_derived_status() {
    let orch = orchestrator();
    orch.submit(submission(1, 10, Some(5))).await.unwrap();
    let worker = orch.register_worker("node-01").await.unwrap();
    orch.claim(worker.id).await.unwrap().unwrap();

    let overview = orch.overview().await.unwrap();
    assert_eq!(overview.groups.len(), 1);
    let group = &overview.groups[0];
    // One part running, one still queued: the group reads as running.
    assert_eq!(group.status, JobStatus::Running);
    assert_eq!(group.frame_total, 10);
}

#[tokio::test]
async fn deleted_running_job_survives_until_the_worker_lets_go() {
    let orch = orchestrator();
    orch.submit(submission(1, 10, None)).await.unwrap();
    let worker = orch.register_worker("node-01").await.unwrap();
    let job = orch.claim(worker.id).await.unwrap().unwrap();

    orch.delete_job(job.id).await.unwrap();
    assert!(orch.overview().await.unwrap().jobs.is_empty());

    // The worker is told to stop on its next report.
    let outcome = orch
        .report_progress(worker.id, job.id, ProgressReport::default())
        .await
        .unwrap();
    assert_eq!(outcome.cancel, CancelState::Immediate);

    orch.report_progress(
        worker.id,
        job.id,
        ProgressReport {
            status: Some(JobStatus::Failed),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    // Released tombstones disappear on the next purge pass.
    let removed = orch.purge(24).await.unwrap();
    assert_eq!(removed, 1);
}
