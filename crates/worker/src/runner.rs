//! Drives one claimed job: launches the render tool, reconciles its
//! output against the filesystem on a timer, reports progress, and
//! honors cancel directives.

use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use elara_db::models::frame::FrameReport;
use elara_db::models::job::{truncate_tail, Job, ProgressReport, LOG_TAIL_MAX};
use elara_db::models::status::{CancelState, JobStatus};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::client::{ApiClient, ClientError};
use crate::config::WorkerConfig;
use crate::scan::scan_output;

/// Command line for the render tool, Maya batch style. Rendering
/// starts at `start` rather than the job's own start frame so a
/// restarted job resumes where the output left off.
pub fn build_render_args(job: &Job, start: i64) -> Vec<String> {
    let target = &job.target;
    let mut args = vec![
        "-r".into(),
        target.renderer.clone(),
        "-s".into(),
        start.to_string(),
        "-e".into(),
        job.end_frame.to_string(),
        "-b".into(),
        job.by_step.to_string(),
        "-proj".into(),
        target.project.clone(),
        "-rd".into(),
        target.output_dir.clone(),
        "-x".into(),
        target.width.to_string(),
        "-y".into(),
        target.height.to_string(),
    ];
    if let Some(camera) = &target.camera {
        args.push("-cam".into());
        args.push(camera.clone());
    }
    if let Some(layer) = &target.layer {
        args.push("-rl".into());
        args.push(layer.clone());
    }
    args.push(target.scene.clone());
    args
}

/// State of an armed graceful stop. The render is allowed to finish
/// the frame it is on; the safety timeout catches a frame that never
/// finishes.
#[derive(Debug, Clone, Copy)]
pub struct GracefulStop {
    pub done_when_armed: usize,
    pub armed_for: Duration,
}

impl GracefulStop {
    /// Stop once any further frame completes, or once the safety
    /// timeout elapses.
    pub fn should_stop(&self, done_now: usize, timeout: Duration) -> bool {
        done_now > self.done_when_armed || self.armed_for >= timeout
    }
}

/// Seconds remaining, extrapolated from the pace so far. `None` until
/// at least one frame has completed under this run.
pub fn estimate_eta(completed: usize, elapsed: Duration, remaining: usize) -> Option<f64> {
    if completed == 0 {
        return None;
    }
    let per_frame = elapsed.as_secs_f64() / completed as f64;
    Some(per_frame * remaining as f64)
}

/// Accumulates the log tail and an error-line count from the render
/// tool's output streams.
#[derive(Default)]
struct LogCollector {
    tail: Mutex<String>,
    error_lines: AtomicI64,
}

impl LogCollector {
    fn append(&self, line: &str) {
        if line.to_ascii_lowercase().contains("error") {
            self.error_lines.fetch_add(1, Ordering::Relaxed);
        }
        let mut tail = self.tail.lock().unwrap_or_else(|e| e.into_inner());
        tail.push_str(line);
        tail.push('\n');
        if tail.len() > LOG_TAIL_MAX {
            let cut = truncate_tail(&tail, LOG_TAIL_MAX).to_string();
            *tail = cut;
        }
    }

    fn snapshot(&self) -> String {
        self.tail
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

fn spawn_line_reader(
    stream: Option<impl AsyncRead + Unpin + Send + 'static>,
    collector: Arc<LogCollector>,
) {
    let Some(stream) = stream else { return };
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            collector.append(&line);
        }
    });
}

/// Run one claimed job to completion. Returns early only on transport
/// errors talking to the orchestrator; render failures are reported,
/// not returned.
pub async fn run_job(
    client: &ApiClient,
    config: &WorkerConfig,
    job: Job,
    cancel: &CancellationToken,
) -> Result<(), ClientError> {
    let range = job.range();
    let output_dir = Path::new(&job.target.output_dir);

    // Reconcile before launching anything. A requeued job may already
    // have most of its frames on disk.
    let initial = scan_output(output_dir, &range, config.quiet_period);
    if !initial.done.is_empty() {
        client
            .report_frames(
                job.id,
                &FrameReport {
                    done: initial.done.iter().copied().collect(),
                    failed: vec![],
                    current_frame: None,
                },
            )
            .await?;
    }
    let Some(resume) = initial.resume_frame_or_reported(&range, job.frame_done) else {
        tracing::info!(job_id = job.id, "output already complete, skipping render");
        client
            .report_progress(
                job.id,
                &ProgressReport {
                    status: Some(JobStatus::Done),
                    frame_done: Some(initial.aligned_prefix(&range) as i64),
                    frame_running: Some(0),
                    ..Default::default()
                },
            )
            .await?;
        return Ok(());
    };

    let args = build_render_args(&job, resume);
    tracing::info!(
        job_id = job.id,
        exe = %config.render_exe,
        resume,
        "launching render"
    );

    let collector = Arc::new(LogCollector::default());
    let mut child = match Command::new(&config.render_exe)
        .args(&args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            tracing::error!(job_id = job.id, error = %e, "failed to launch render tool");
            collector.append(&format!("failed to launch {}: {e}", config.render_exe));
            client
                .report_progress(
                    job.id,
                    &ProgressReport {
                        status: Some(JobStatus::Failed),
                        log_tail: Some(collector.snapshot()),
                        error_delta: Some(1),
                        ..Default::default()
                    },
                )
                .await?;
            return Ok(());
        }
    };
    spawn_line_reader(child.stdout.take(), Arc::clone(&collector));
    spawn_line_reader(child.stderr.take(), Arc::clone(&collector));

    let started = Instant::now();
    let initial_done = initial.done.len();
    let mut done = initial.done;
    let mut errors_reported: i64 = 0;
    let mut graceful: Option<(Instant, usize)> = None;
    let mut killed = false;
    let mut ticker = tokio::time::interval(config.tick_interval);
    ticker.tick().await;

    let exit = loop {
        tokio::select! {
            status = child.wait() => break status,
            _ = cancel.cancelled(), if !killed => {
                tracing::info!(job_id = job.id, "worker shutting down, killing render");
                let _ = child.start_kill();
                killed = true;
            }
            _ = ticker.tick() => {
                let scan = scan_output(output_dir, &range, config.quiet_period);
                let fresh: Vec<i64> = scan.done.difference(&done).copied().collect();
                if !fresh.is_empty() {
                    client
                        .report_frames(job.id, &FrameReport {
                            done: fresh,
                            failed: vec![],
                            current_frame: scan.resume_frame(&range),
                        })
                        .await?;
                }
                let prefix = scan.aligned_prefix(&range);
                done = scan.done;

                let total_errors = collector.error_lines.load(Ordering::Relaxed);
                let remaining = (range.frame_total() as usize).saturating_sub(done.len());
                let report = ProgressReport {
                    frame_done: Some(prefix as i64),
                    frame_running: Some(1),
                    log_tail: Some(collector.snapshot()),
                    eta_seconds: estimate_eta(
                        done.len().saturating_sub(initial_done),
                        started.elapsed(),
                        remaining,
                    ),
                    error_delta: Some(total_errors - errors_reported),
                    ..Default::default()
                };
                errors_reported = total_errors;

                let outcome = client.report_progress(job.id, &report).await?;
                match outcome.cancel {
                    CancelState::Immediate => {
                        if !killed {
                            tracing::info!(job_id = job.id, "immediate cancel, killing render");
                            let _ = child.start_kill();
                            killed = true;
                        }
                    }
                    CancelState::Graceful => {
                        if graceful.is_none() {
                            tracing::info!(job_id = job.id, "graceful cancel armed");
                            graceful = Some((Instant::now(), done.len()));
                        }
                    }
                    CancelState::None => {}
                }

                if let Some((armed_at, done_when_armed)) = graceful {
                    let stop = GracefulStop {
                        done_when_armed,
                        armed_for: armed_at.elapsed(),
                    };
                    if !killed && stop.should_stop(done.len(), config.graceful_timeout) {
                        tracing::info!(job_id = job.id, "graceful stop point reached, killing render");
                        let _ = child.start_kill();
                        killed = true;
                    }
                }
            }
        }
    };

    // Let the last frame's file settle before the final reconcile.
    tokio::time::sleep(config.quiet_period).await;
    let last = scan_output(output_dir, &range, config.quiet_period);
    let fresh: Vec<i64> = last.done.difference(&done).copied().collect();
    let clean_exit = matches!(&exit, Ok(status) if status.success()) && !killed;
    let complete = last.is_lattice_complete(&range);

    // Frames the tool ran past without producing output are failures;
    // a killed render's missing frames were simply never attempted.
    let failed: Vec<i64> = if !killed && !complete {
        last.missing(&range)
    } else {
        vec![]
    };
    if !fresh.is_empty() || !failed.is_empty() {
        client
            .report_frames(
                job.id,
                &FrameReport {
                    done: fresh,
                    failed: failed.clone(),
                    current_frame: None,
                },
            )
            .await?;
    }

    let status = if clean_exit && complete {
        JobStatus::Done
    } else {
        JobStatus::Failed
    };
    tracing::info!(
        job_id = job.id,
        ?status,
        done = last.done.len(),
        failed = failed.len(),
        "render finished"
    );
    client
        .report_progress(
            job.id,
            &ProgressReport {
                status: Some(status),
                frame_done: Some(last.aligned_prefix(&range) as i64),
                frame_failed: Some(failed.len() as i64),
                frame_running: Some(0),
                log_tail: Some(collector.snapshot()),
                ..Default::default()
            },
        )
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use elara_db::models::job::RenderTarget;
    use elara_db::models::status::{CancelState, JobStatus};

    use super::*;

    fn job() -> Job {
        Job {
            id: 1,
            status: JobStatus::Running,
            created: chrono::Utc::now(),
            updated: chrono::Utc::now(),
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
            start_frame: 1,
            end_frame: 100,
            by_step: 1,
            group_id: None,
            part_index: None,
            part_count: None,
            frame_total: 100,
            frame_done: 0,
            frame_failed: 0,
            frame_running: 0,
            eta_seconds: None,
            error_count: 0,
            priority: 0,
            retries: 0,
            max_retries: 2,
            cancel_state: CancelState::None,
            worker_id: Some(7),
            log_tail: None,
            deleted: false,
        }
    }

    #[test]
    fn render_args_resume_mid_range() {
        let args = build_render_args(&job(), 40);
        let joined = args.join(" ");
        assert!(joined.starts_with("-r arnold -s 40 -e 100 -b 1"));
        assert!(joined.contains("-cam renderCam"));
        assert!(!joined.contains("-rl"));
        assert_eq!(args.last().unwrap(), "/srv/scenes/shot010.mb");
    }

    #[test]
    fn render_args_include_layer_when_set() {
        let mut job = job();
        job.target.layer = Some("beauty".into());
        let args = build_render_args(&job, 1);
        assert!(args.join(" ").contains("-rl beauty"));
    }

    #[test]
    fn graceful_stop_waits_for_the_current_frame() {
        let armed = GracefulStop {
            done_when_armed: 10,
            armed_for: Duration::from_secs(30),
        };
        let timeout = Duration::from_secs(600);

        // Same frame count, timeout not reached: keep rendering.
        assert!(!armed.should_stop(10, timeout));
        // A frame finished after arming: stop now.
        assert!(armed.should_stop(11, timeout));
    }

    #[test]
    fn graceful_stop_safety_timeout_fires() {
        let armed = GracefulStop {
            done_when_armed: 10,
            armed_for: Duration::from_secs(601),
        };
        assert!(armed.should_stop(10, Duration::from_secs(600)));
    }

    #[test]
    fn eta_needs_at_least_one_completed_frame() {
        assert_eq!(estimate_eta(0, Duration::from_secs(60), 90), None);
        let eta = estimate_eta(10, Duration::from_secs(100), 90).unwrap();
        assert!((eta - 900.0).abs() < 1e-9);
    }

    #[test]
    fn log_collector_keeps_a_bounded_tail_and_counts_errors() {
        let collector = LogCollector::default();
        collector.append("starting render");
        collector.append("ERROR: missing texture");
        for _ in 0..200 {
            collector.append(&"x".repeat(80));
        }

        assert_eq!(collector.error_lines.load(Ordering::Relaxed), 1);
        let tail = collector.snapshot();
        assert!(tail.len() <= LOG_TAIL_MAX);
        assert!(!tail.contains("starting render"));
    }
}
