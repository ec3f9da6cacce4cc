//! Build status enum shared by builds, stages, containers and tasks.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Execution status shared across every level of a build.
///
/// Not every value is meaningful at every level: `StageSuccess` is only
/// written to stages and paused builds, `Reviewing` only to stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuildStatus {
    /// Waiting to be scheduled.
    Queue,
    /// Queued behind a mutex group or concurrency limit.
    QueueCache,
    /// A build environment is being prepared for a container.
    PrepareEnv,
    /// Actively executing.
    Running,
    /// Waiting inside a loop-controlled container.
    LoopWaiting,
    /// Waiting on a sub-pipeline call.
    CallWaiting,
    /// Waiting on a stage review.
    Reviewing,
    /// Paused by a review gate or manual-start stage.
    Pause,
    /// The stage's run is over; at build level this marks a paused build.
    StageSuccess,
    /// Completed successfully.
    Succeed,
    /// Completed with failure.
    Failed,
    /// Cancelled by a user or by the engine.
    Canceled,
    /// Forcibly terminated.
    Terminate,
    /// Review was rejected.
    ReviewAbort,
    /// Review was approved and the gate processed.
    ReviewProcessed,
    /// Timed out while queued.
    QueueTimeout,
    /// Timed out while executing.
    ExecTimeout,
    /// The worker stopped sending heartbeats.
    HeartbeatTimeout,
    /// Skipped.
    Skip,
    /// Never executed because an earlier step ended the container.
    Unexec,
}

impl Default for BuildStatus {
    fn default() -> Self {
        Self::Queue
    }
}

impl BuildStatus {
    /// All statuses, in declaration order.
    pub const ALL: [Self; 20] = [
        Self::Queue,
        Self::QueueCache,
        Self::PrepareEnv,
        Self::Running,
        Self::LoopWaiting,
        Self::CallWaiting,
        Self::Reviewing,
        Self::Pause,
        Self::StageSuccess,
        Self::Succeed,
        Self::Failed,
        Self::Canceled,
        Self::Terminate,
        Self::ReviewAbort,
        Self::ReviewProcessed,
        Self::QueueTimeout,
        Self::ExecTimeout,
        Self::HeartbeatTimeout,
        Self::Skip,
        Self::Unexec,
    ];

    /// Returns the canonical upper-case name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Queue => "QUEUE",
            Self::QueueCache => "QUEUE_CACHE",
            Self::PrepareEnv => "PREPARE_ENV",
            Self::Running => "RUNNING",
            Self::LoopWaiting => "LOOP_WAITING",
            Self::CallWaiting => "CALL_WAITING",
            Self::Reviewing => "REVIEWING",
            Self::Pause => "PAUSE",
            Self::StageSuccess => "STAGE_SUCCESS",
            Self::Succeed => "SUCCEED",
            Self::Failed => "FAILED",
            Self::Canceled => "CANCELED",
            Self::Terminate => "TERMINATE",
            Self::ReviewAbort => "REVIEW_ABORT",
            Self::ReviewProcessed => "REVIEW_PROCESSED",
            Self::QueueTimeout => "QUEUE_TIMEOUT",
            Self::ExecTimeout => "EXEC_TIMEOUT",
            Self::HeartbeatTimeout => "HEARTBEAT_TIMEOUT",
            Self::Skip => "SKIP",
            Self::Unexec => "UNEXEC",
        }
    }

    /// Returns true for statuses that ended successfully.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(
            self,
            Self::Succeed | Self::Skip | Self::ReviewProcessed | Self::StageSuccess
        )
    }

    /// Returns true for statuses that ended in failure.
    #[must_use]
    pub const fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::Failed
                | Self::Terminate
                | Self::HeartbeatTimeout
                | Self::QueueTimeout
                | Self::ExecTimeout
        )
    }

    /// Returns true for statuses that ended by cancellation.
    #[must_use]
    pub const fn is_cancel(&self) -> bool {
        matches!(self, Self::Canceled | Self::ReviewAbort)
    }

    /// Returns true for terminal statuses.
    #[must_use]
    pub const fn is_finish(&self) -> bool {
        self.is_success() || self.is_failure() || self.is_cancel() || matches!(self, Self::Unexec)
    }

    /// Returns true for statuses that hold execution resources.
    #[must_use]
    pub const fn is_running(&self) -> bool {
        matches!(
            self,
            Self::Running | Self::PrepareEnv | Self::LoopWaiting | Self::CallWaiting | Self::Reviewing
        )
    }

    /// Returns true for statuses still waiting to run.
    #[must_use]
    pub const fn is_ready_to_run(&self) -> bool {
        matches!(self, Self::Queue | Self::QueueCache)
    }

    /// Returns true for the paused status.
    #[must_use]
    pub const fn is_pause(&self) -> bool {
        matches!(self, Self::Pause)
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown status name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown build status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for BuildStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        Self::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == upper)
            .ok_or(UnknownStatus(s.to_string()))
    }
}

/// Maps a current status to the status it becomes under an operation.
///
/// Finished statuses always map to themselves, so applying a switch twice
/// is the same as applying it once.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatusSwitcher;

impl StatusSwitcher {
    /// Cancel mapping for containers (jobs).
    #[must_use]
    pub const fn job_cancel(current: BuildStatus) -> BuildStatus {
        if current.is_finish() {
            return current;
        }
        match current {
            BuildStatus::Reviewing => BuildStatus::ReviewAbort,
            _ => BuildStatus::Canceled,
        }
    }

    /// Cancel mapping for tasks. Tasks that never started become `Unexec`.
    #[must_use]
    pub const fn task_cancel(current: BuildStatus) -> BuildStatus {
        if current.is_finish() {
            return current;
        }
        if current.is_ready_to_run() {
            return BuildStatus::Unexec;
        }
        BuildStatus::Canceled
    }

    /// Terminate mapping used when a build is forcibly finished.
    #[must_use]
    pub const fn job_terminate(current: BuildStatus) -> BuildStatus {
        if current.is_finish() {
            return current;
        }
        BuildStatus::Terminate
    }

    /// Aggregates the final statuses of a stage's containers.
    ///
    /// Any cancel wins over any failure, which wins over success.
    #[must_use]
    pub fn aggregate<I>(statuses: I) -> BuildStatus
    where
        I: IntoIterator<Item = BuildStatus>,
    {
        let mut result = BuildStatus::Succeed;
        for status in statuses {
            if status.is_cancel() {
                return BuildStatus::Canceled;
            }
            if status.is_failure() {
                result = BuildStatus::Failed;
            }
        }
        result
    }
}
