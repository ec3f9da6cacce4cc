//! Worker sessions against an in-process engine.

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    use crate::config::WorkerConfig;
    use crate::core::{BuildCancelEvent, BuildStatus, PipelineEvent};
    use crate::engine::{ClaimOutcome, TaskResult};
    use crate::testing::{finish_events, BuildFixture, EngineHarness};
    use crate::worker::{
        JitterStrategy, RetryConfig, TaskAttempt, TaskExecutor, WorkerKey, WorkerSession,
    };

    /// Fails tasks whose id starts with `fail`, records what it ran.
    #[derive(Default)]
    struct ScriptedExecutor {
        ran: Mutex<Vec<(String, Option<String>)>>,
    }

    impl ScriptedExecutor {
        fn ran(&self) -> Vec<String> {
            self.ran.lock().iter().map(|(id, _)| id.clone()).collect()
        }
    }

    #[async_trait]
    impl TaskExecutor for ScriptedExecutor {
        async fn execute(&self, attempt: &mut TaskAttempt) -> Result<(), String> {
            let task_id = attempt.task().task_id.clone();
            let region = attempt.env("REGION").map(str::to_string);
            self.ran.lock().push((task_id.clone(), region));
            if task_id.starts_with("fail") {
                Err(format!("{task_id} exited with 1"))
            } else {
                Ok(())
            }
        }
    }

    /// Never finishes.
    struct Hangs;

    #[async_trait]
    impl TaskExecutor for Hangs {
        async fn execute(&self, _attempt: &mut TaskAttempt) -> Result<(), String> {
            std::future::pending::<()>().await;
            Ok(())
        }
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

    async fn session(harness: &EngineHarness, fixture: BuildFixture) -> WorkerSession {
        let key = WorkerKey::new(fixture.meta("worker"), "s-1", "c-1");
        harness.seed(fixture).await.unwrap();
        WorkerSession::new(Arc::new(harness.build_service()), key, config())
    }

    fn single_container(tasks: &[&str]) -> BuildFixture {
        let mut fixture = BuildFixture::new("b-1")
            .with_variable("REGION", "eu")
            .stage("s-1", BuildStatus::Running)
            .container("s-1", "c-1", BuildStatus::Queue)
            .stage("s-2", BuildStatus::Queue);
        for task in tasks {
            fixture = fixture.task("c-1", task);
        }
        fixture
    }

    async fn task_status(harness: &EngineHarness, task_id: &str) -> BuildStatus {
        harness
            .tasks("b-1", "c-1")
            .await
            .into_iter()
            .find(|t| t.task_id == task_id)
            .map(|t| t.status)
            .unwrap()
    }

    #[tokio::test]
    async fn test_session_runs_container_to_completion() {
        let harness = EngineHarness::new();
        let worker = session(&harness, single_container(&["t-1", "t-2"])).await;
        let executor = ScriptedExecutor::default();

        let summary = worker.run(&executor).await.unwrap();
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.failed, 0);
        assert_eq!(executor.ran(), vec!["t-1", "t-2"]);
        assert!(executor.ran.lock().iter().all(|(_, region)| region.as_deref() == Some("eu")));

        let container = harness.container("b-1", "s-1", "c-1").await;
        assert_eq!(container.status, BuildStatus::Succeed);
        assert_eq!(task_status(&harness, "t-2").await, BuildStatus::Succeed);
        assert!(!worker.heartbeat().await.unwrap());

        let handled = harness.pump(32).await;
        assert_eq!(harness.stage("b-1", "s-1").await.status, BuildStatus::Succeed);
        // s-2 has no containers and succeeds on refresh.
        assert_eq!(finish_events(&handled), vec![BuildStatus::Succeed]);
        let build = harness.build("b-1").await;
        assert_eq!(build.status, BuildStatus::Succeed);
        assert_eq!(build.running_count, 0);
        assert_eq!(harness.lock_backend.live_count(), 0);
    }

    #[tokio::test]
    async fn test_continued_failure_does_not_fail_container() {
        let harness = EngineHarness::new();
        let fixture = single_container(&["fail-1", "t-2"])
            .edit_task("fail-1", |t| t.additional_options.continue_when_failed = true);
        let worker = session(&harness, fixture).await;

        let summary = worker.run(&ScriptedExecutor::default()).await.unwrap();
        assert_eq!((summary.succeeded, summary.failed), (1, 1));
        assert_eq!(task_status(&harness, "fail-1").await, BuildStatus::Failed);
        assert_eq!(
            harness.container("b-1", "s-1", "c-1").await.status,
            BuildStatus::Succeed
        );
    }

    #[tokio::test]
    async fn test_blocking_failure_fails_build() {
        let harness = EngineHarness::new();
        let worker = session(&harness, single_container(&["fail-1", "t-2"])).await;
        let executor = ScriptedExecutor::default();

        let summary = worker.run(&executor).await.unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(executor.ran(), vec!["fail-1"]);
        assert_eq!(task_status(&harness, "t-2").await, BuildStatus::Unexec);
        assert_eq!(harness.container("b-1", "s-1", "c-1").await.status, BuildStatus::Failed);

        harness.pump(32).await;
        assert_eq!(harness.stage("b-1", "s-1").await.status, BuildStatus::Failed);
        assert_eq!(harness.stage("b-1", "s-2").await.status, BuildStatus::Canceled);
        assert_eq!(harness.build("b-1").await.status, BuildStatus::Failed);
    }

    #[tokio::test]
    async fn test_disabled_task_is_skipped() {
        let harness = EngineHarness::new();
        let fixture = single_container(&["t-1", "t-2", "t-3"])
            .edit_task("t-2", |t| t.additional_options.enable = false);
        let worker = session(&harness, fixture).await;
        let executor = ScriptedExecutor::default();

        worker.run(&executor).await.unwrap();
        assert_eq!(executor.ran(), vec!["t-1", "t-3"]);
        assert_eq!(task_status(&harness, "t-2").await, BuildStatus::Skip);
    }

    #[tokio::test]
    async fn test_redelivered_calls_are_idempotent() {
        let harness = EngineHarness::new();
        let worker = session(&harness, single_container(&["t-1", "t-2"])).await;

        worker.set_started().await.unwrap();
        worker.set_started().await.unwrap();
        assert_eq!(harness.build("b-1").await.running_count, 2);

        let ClaimOutcome::Task(first) = worker.claim_task().await.unwrap() else {
            panic!("expected a task");
        };
        let ClaimOutcome::Task(again) = worker.claim_task().await.unwrap() else {
            panic!("expected a task");
        };
        assert_eq!(first.task_id, "t-1");
        assert_eq!(again.task_id, "t-1");
        assert!(worker.heartbeat().await.unwrap());
    }

    #[tokio::test]
    async fn test_cancel_while_running_ends_session() {
        let harness = EngineHarness::new();
        let fixture = single_container(&["t-1", "t-2"]);
        let cancel = PipelineEvent::CancelBuild(BuildCancelEvent {
            meta: fixture.meta("user_cancel"),
            status: BuildStatus::Canceled,
        });
        let worker = session(&harness, fixture).await;

        worker.set_started().await.unwrap();
        let ClaimOutcome::Task(task) = worker.claim_task().await.unwrap() else {
            panic!("expected a task");
        };
        harness.handle(cancel).await;

        // A late result is accepted and ignored.
        worker
            .complete_task(&TaskResult::success(task.task_id.clone()))
            .await
            .unwrap();
        assert_eq!(worker.claim_task().await.unwrap(), ClaimOutcome::End);
        assert!(!worker.heartbeat().await.unwrap());
        assert_eq!(harness.container("b-1", "s-1", "c-1").await.status, BuildStatus::Canceled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_timeout_fails_container() {
        let harness = EngineHarness::new();
        let fixture = single_container(&["t-1", "t-2"])
            .edit_task("t-1", |t| t.additional_options.timeout = Some(1));
        let worker = session(&harness, fixture).await;

        let summary = worker.run(&Hangs).await.unwrap();
        assert_eq!(summary.timed_out, 1);
        assert_eq!(task_status(&harness, "t-1").await, BuildStatus::ExecTimeout);
        assert_eq!(task_status(&harness, "t-2").await, BuildStatus::Unexec);
        assert_eq!(
            harness.container("b-1", "s-1", "c-1").await.status,
            BuildStatus::ExecTimeout
        );
    }

    #[test]
    fn test_empty_container_claims_end() {
        let harness = EngineHarness::new();
        let outcome = tokio_test::block_on(async {
            let worker = session(&harness, single_container(&[])).await;
            worker.set_started().await.unwrap();
            worker.claim_task().await.unwrap()
        });
        assert_eq!(outcome, ClaimOutcome::End);
    }
}
