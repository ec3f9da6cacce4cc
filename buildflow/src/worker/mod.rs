//! Worker task protocol.
//!
//! The engine side ([`EngineBuildService`]) answers `set_started`,
//! `claim_task`, `complete_task`, `heartbeat`, `timeout` and `end_build`
//! under the build lock. The worker side ([`WorkerSession`]) drives those
//! calls with bounded retry and runs each task in its own [`TaskAttempt`].

mod attempt;
mod protocol_tests;
pub mod retry;
mod service;
mod session;
pub mod task_util;

pub use attempt::TaskAttempt;
pub use retry::{with_retry, BackoffStrategy, JitterStrategy, RetryConfig, RetryState};
#[cfg(test)]
pub use service::MockBuildService;
pub use service::{BuildService, BuildVariables, EngineBuildService, WorkerKey};
pub use session::{SessionSummary, TaskExecutor, WorkerSession};
