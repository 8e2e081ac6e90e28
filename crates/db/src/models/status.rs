//! Closed status enums stored as SMALLINT, with the central job
//! transition table.
//!
//! Status is never compared as a free-form string anywhere in the
//! codebase; every transition goes through [`JobStatus::can_enter`]
//! (or the equivalent SQL guard in the Postgres backing), which is
//! what keeps e.g. `done` from re-entering `running`.

use serde::{Deserialize, Serialize};

/// Job lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[repr(i16)]
pub enum JobStatus {
    Queued = 1,
    Running = 2,
    Done = 3,
    Failed = 4,
    Cancelled = 5,
}

impl JobStatus {
    /// Terminal states only leave via a new job (retry/resubmit).
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Cancelled)
    }

    /// The job state machine, in one place.
    ///
    /// ```text
    /// queued  -> running            (claim)
    /// queued  -> cancelled          (cancel request)
    /// running -> done               (clean exit, lattice complete)
    /// running -> failed             (budget exhausted)
    /// running -> queued             (automatic retry-requeue)
    /// running -> cancelled          (cancel materialized by a report)
    /// ```
    pub fn can_enter(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Queued, Running)
                | (Queued, Cancelled)
                | (Running, Done)
                | (Running, Failed)
                | (Running, Queued)
                | (Running, Cancelled)
        )
    }
}

/// Pending cancellation directive on a job. `Immediate` terminates
/// the render now; `Graceful` lets the current frame finish first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[repr(i16)]
pub enum CancelState {
    None = 0,
    Immediate = 1,
    Graceful = 2,
}

/// Per-frame outcome. Absence of a row means the frame's state is not
/// yet known.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[repr(i16)]
pub enum FrameStatus {
    Done = 1,
    Failed = 2,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_never_self_transition() {
        for terminal in [JobStatus::Done, JobStatus::Failed, JobStatus::Cancelled] {
            for next in [
                JobStatus::Queued,
                JobStatus::Running,
                JobStatus::Done,
                JobStatus::Failed,
                JobStatus::Cancelled,
            ] {
                assert!(!terminal.can_enter(next), "{terminal:?} -> {next:?}");
            }
        }
    }

    #[test]
    fn done_cannot_reenter_running() {
        assert!(!JobStatus::Done.can_enter(JobStatus::Running));
    }

    #[test]
    fn claim_and_requeue_paths_are_allowed() {
        assert!(JobStatus::Queued.can_enter(JobStatus::Running));
        assert!(JobStatus::Running.can_enter(JobStatus::Queued));
        assert!(JobStatus::Running.can_enter(JobStatus::Done));
        assert!(JobStatus::Running.can_enter(JobStatus::Failed));
    }

    #[test]
    fn status_serializes_as_snake_case() {
        assert_eq!(
            serde_json::to_string(&JobStatus::Queued).unwrap(),
            "\"queued\""
        );
        assert_eq!(
            serde_json::to_string(&CancelState::Graceful).unwrap(),
            "\"graceful\""
        );
    }
}
