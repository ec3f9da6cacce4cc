//! Worker side of the task protocol.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use super::retry::{with_retry, RetryConfig};
use super::{task_util, BuildService, BuildVariables, TaskAttempt, WorkerKey};
use crate::config::WorkerConfig;
use crate::engine::{ClaimOutcome, TaskResult};
use crate::errors::EngineError;

/// Runs one task attempt.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Executes the attempt's task. `Err` carries the failure message.
    async fn execute(&self, attempt: &mut TaskAttempt) -> Result<(), String>;
}

/// Counts of what a session did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionSummary {
    /// Tasks that reported success.
    pub succeeded: usize,
    /// Tasks that reported failure.
    pub failed: usize,
    /// Tasks that hit their timeout.
    pub timed_out: usize,
}

/// A worker's conversation with the engine about one container.
///
/// Every call goes through bounded exponential backoff; only retryable
/// errors are retried.
pub struct WorkerSession {
    service: Arc<dyn BuildService>,
    key: WorkerKey,
    config: WorkerConfig,
}

impl std::fmt::Debug for WorkerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerSession")
            .field("key", &self.key)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl WorkerSession {
    /// Creates a session.
    #[must_use]
    pub fn new(service: Arc<dyn BuildService>, key: WorkerKey, config: WorkerConfig) -> Self {
        Self {
            service,
            key,
            config,
        }
    }

    fn retry(&self) -> &RetryConfig {
        &self.config.retry
    }

    /// Reports the container started.
    pub async fn set_started(&self) -> Result<BuildVariables, EngineError> {
        with_retry(self.retry(), "set_started", || self.service.set_started(&self.key)).await
    }

    /// Claims the next task.
    pub async fn claim_task(&self) -> Result<ClaimOutcome, EngineError> {
        with_retry(self.retry(), "claim_task", || self.service.claim_task(&self.key)).await
    }

    /// Reports a task result.
    pub async fn complete_task(&self, result: &TaskResult) -> Result<(), EngineError> {
        with_retry(self.retry(), "complete_task", || {
            self.service.complete_task(&self.key, result)
        })
        .await
    }

    /// Reports liveness.
    pub async fn heartbeat(&self) -> Result<bool, EngineError> {
        with_retry(self.retry(), "heartbeat", || self.service.heartbeat(&self.key)).await
    }

    /// Reports a task timeout.
    pub async fn timeout(&self) -> Result<(), EngineError> {
        with_retry(self.retry(), "timeout", || self.service.timeout(&self.key)).await
    }

    /// Reports the worker is exiting.
    pub async fn end_build(&self) -> Result<(), EngineError> {
        with_retry(self.retry(), "end_build", || self.service.end_build(&self.key)).await
    }

    /// Runs the container to completion: start, claim and execute tasks
    /// until the engine answers `End`, then end the build.
    pub async fn run(&self, executor: &dyn TaskExecutor) -> Result<SessionSummary, EngineError> {
        let variables = self.set_started().await?;
        tracing::info!(
            build_id = %variables.build_id,
            container_id = %variables.container_id,
            execute_count = variables.execute_count,
            "Worker started"
        );
        let poll = Duration::from_millis(self.config.claim_poll_ms);
        let mut summary = SessionSummary::default();

        loop {
            let task = match self.claim_task().await? {
                ClaimOutcome::Task(task) => *task,
                ClaimOutcome::Wait => {
                    tokio::time::sleep(poll).await;
                    continue;
                }
                ClaimOutcome::End => break,
            };
            let task_id = task.task_id.clone();
            let limit = task_util::timeout(&task);
            let mut attempt = TaskAttempt::new(task, &variables);

            let outcome = match limit {
                Some(limit) => tokio::time::timeout(limit, executor.execute(&mut attempt)).await.ok(),
                None => Some(executor.execute(&mut attempt).await),
            };
            match outcome {
                Some(outcome) => {
                    if outcome.is_ok() {
                        summary.succeeded += 1;
                    } else {
                        summary.failed += 1;
                    }
                    let result = attempt.into_result(outcome);
                    self.complete_task(&result).await?;
                }
                None => {
                    tracing::warn!(task_id = %task_id, "Task exceeded its timeout");
                    summary.timed_out += 1;
                    self.timeout().await?;
                    break;
                }
            }
        }

        self.end_build().await?;
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{BuildStatus, Container, ContainerKind, EventMeta, Task};
    use crate::errors::MutexError;
    use crate::worker::retry::JitterStrategy;
    use crate::worker::MockBuildService;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn key() -> WorkerKey {
        WorkerKey::new(EventMeta::new("worker", "p", "pipe", "b-1", "agent"), "s-1", "1")
    }

    fn config() -> WorkerConfig {
        WorkerConfig {
            retry: RetryConfig::new()
                .with_base_delay_ms(1)
                .with_max_attempts(3)
                .with_jitter(JitterStrategy::None),
            claim_poll_ms: 1,
        }
    }

    fn variables() -> BuildVariables {
        BuildVariables {
            build_id: "b-1".to_string(),
            project_id: "p".to_string(),
            pipeline_id: "pipe".to_string(),
            stage_id: "s-1".to_string(),
            container_id: "1".to_string(),
            execute_count: 1,
            variables: HashMap::new(),
        }
    }

    fn task(id: &str) -> Task {
        let container = Container::new("b-1", "s-1", "1", ContainerKind::Normal);
        let mut t = Task::new(&container, id, 1, "linuxScript");
        t.status = BuildStatus::Running;
        t
    }

    struct Succeeds;

    #[async_trait]
    impl TaskExecutor for Succeeds {
        async fn execute(&self, attempt: &mut TaskAttempt) -> Result<(), String> {
            attempt.add_env("DONE", "1");
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_set_started_retries_queued_mutex() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let mut service = MockBuildService::new();
        service.expect_set_started().times(2).returning(move |_| {
            if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(MutexError::Queued {
                    group: "deploy".to_string(),
                    position: 1,
                }
                .into())
            } else {
                Ok(variables())
            }
        });

        let session = WorkerSession::new(Arc::new(service), key(), config());
        let vars = session.set_started().await.unwrap();
        assert_eq!(vars.container_id, "1");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_non_retryable_error_is_not_retried() {
        let mut service = MockBuildService::new();
        service
            .expect_end_build()
            .times(1)
            .returning(|_| Err(EngineError::remote("end_build", "container gone", false)));

        let session = WorkerSession::new(Arc::new(service), key(), config());
        assert!(session.end_build().await.is_err());
    }

    #[tokio::test]
    async fn test_run_claims_until_end() {
        let claims = Arc::new(AtomicUsize::new(0));
        let seen = claims.clone();
        let mut service = MockBuildService::new();
        service.expect_set_started().returning(|_| Ok(variables()));
        service.expect_claim_task().returning(move |_| {
            Ok(match seen.fetch_add(1, Ordering::SeqCst) {
                0 => ClaimOutcome::Wait,
                1 => ClaimOutcome::Task(Box::new(task("t-1"))),
                2 => ClaimOutcome::Task(Box::new(task("t-2"))),
                _ => ClaimOutcome::End,
            })
        });
        service
            .expect_complete_task()
            .times(2)
            .withf(|_, result| result.success)
            .returning(|_, _| Ok(()));
        service.expect_end_build().times(1).returning(|_| Ok(()));

        let session = WorkerSession::new(Arc::new(service), key(), config());
        let summary = session.run(&Succeeds).await.unwrap();
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.failed, 0);
        assert_eq!(claims.load(Ordering::SeqCst), 4);
    }
}
