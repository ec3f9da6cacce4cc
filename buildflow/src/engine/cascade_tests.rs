//! End-to-end cancellation scenarios through the handlers.

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;

    use crate::core::{
        ActionType, BuildCancelEvent, BuildStatus, PipelineEvent, StageCommand, StageCommandEvent,
    };
    use crate::dispatch::MockEventDispatcher;
    use crate::engine::{Continuation, Engine, Transition};
    use crate::errors::{DispatchError, StoreError};
    use crate::handlers::HandleOutcome;
    use crate::measure::MockMeasureService;
    use crate::mutex::{MutexGroupController, MutexOwner};
    use crate::store::{InMemoryStateStore, StateStore};
    use crate::testing::{
        assert_applied, assert_no_mutex_held, assert_no_stage_event, assert_stage_event,
        finish_events, BuildFixture, EngineHarness, FIXTURE_PROJECT,
    };

    fn cancel(fixture: &BuildFixture) -> PipelineEvent {
        PipelineEvent::CancelBuild(BuildCancelEvent {
            meta: fixture.meta("user_cancel"),
            status: BuildStatus::Canceled,
        })
    }

    /// S1 running with two containers (c-1 holding "M"), S2 queued.
    fn two_stage_build() -> BuildFixture {
        BuildFixture::new("b-1")
            .stage("s-1", BuildStatus::Running)
            .container("s-1", "c-1", BuildStatus::Running)
            .with_mutex("c-1", "M")
            .container("s-1", "c-2", BuildStatus::Running)
            .stage("s-2", BuildStatus::Queue)
            .with_running_count(3)
    }

    async fn hold_group(harness: &EngineHarness, build_id: &str, stage_id: &str, container_id: &str) {
        let container = harness.container(build_id, stage_id, container_id).await;
        let build = harness.build(build_id).await;
        let spec = container.mutex_group.clone().unwrap();
        let group = harness.mutex.decorate(&spec, &build.variables);
        harness
            .mutex
            .try_acquire(&MutexOwner::of(FIXTURE_PROJECT, &container), &group)
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancel_ends_running_stage_and_targets_next() {
        let harness = EngineHarness::new();
        let fixture = two_stage_build();
        let event = cancel(&fixture);
        harness.seed(fixture).await.unwrap();
        hold_group(&harness, "b-1", "s-1", "c-1").await;
        assert!(harness.mutex.build_holds_any("b-1"));

        let PipelineEvent::CancelBuild(request) = &event else {
            unreachable!()
        };
        let transition = harness.engine().cancel_build(request).await.unwrap();
        let Transition::Applied(report) = transition else {
            panic!("cancel should apply");
        };
        assert_eq!(report.continuation, Continuation::EndStage("s-2".to_string()));
        assert_eq!(report.cancelled_containers, vec!["c-1".to_string(), "c-2".to_string()]);
        assert_eq!(report.released_mutexes, vec!["c-1".to_string()]);
        assert_eq!(report.ended_stages, vec!["s-1".to_string()]);

        assert_no_mutex_held(&harness.mutex, "b-1");
        assert_eq!(harness.container("b-1", "s-1", "c-1").await.status, BuildStatus::Canceled);
        assert_eq!(harness.container("b-1", "s-1", "c-2").await.status, BuildStatus::Canceled);
        assert_eq!(harness.stage("b-1", "s-1").await.status, BuildStatus::StageSuccess);
        // -1 per running container, +1 for the ended stage.
        assert_eq!(harness.build("b-1").await.running_count, 2);

        let events = harness.dispatcher.events();
        assert_stage_event(&events, "s-2", ActionType::End);
        assert!(finish_events(&events).is_empty());
        assert_eq!(harness.dispatcher.events_of_kind("buildless.shutdown").len(), 2);
    }

    #[tokio::test]
    async fn test_cancel_cascade_finishes_build_after_pump() {
        let harness = EngineHarness::new();
        let fixture = two_stage_build();
        let event = cancel(&fixture);
        harness.seed(fixture).await.unwrap();

        assert_eq!(harness.handle(event).await, HandleOutcome::Applied);
        harness.pump(64).await;

        let build = harness.build("b-1").await;
        assert_eq!(build.status, BuildStatus::Canceled);
        assert!(build.end_time.is_some());
        assert_eq!(build.running_count, 0);
        assert_eq!(harness.stage("b-1", "s-2").await.status, BuildStatus::Canceled);
        assert_eq!(harness.lock_backend.live_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_with_only_finally_left_runs_finally_first() {
        let harness = EngineHarness::new();
        let fixture = BuildFixture::new("b-1")
            .stage("s-1", BuildStatus::Running)
            .vm_container("s-1", "c-1", BuildStatus::Running)
            .finally_stage("f", BuildStatus::Queue)
            .container("f", "f-1", BuildStatus::Queue);
        let meta = fixture.meta("worker");
        let event = cancel(&fixture);
        harness.seed(fixture).await.unwrap();

        assert_eq!(harness.handle(event).await, HandleOutcome::Applied);
        let events = harness.dispatcher.events();
        assert_eq!(finish_events(&events), vec![BuildStatus::Canceled]);
        assert_no_stage_event(&events, "f", ActionType::End);
        assert_eq!(harness.dispatcher.events_of_kind("agent.shutdown").len(), 1);

        // Build finish defers to the finally stage, which starts running.
        harness.pump(64).await;
        assert_eq!(harness.stage("b-1", "f").await.status, BuildStatus::Running);
        assert!(!harness.build("b-1").await.is_finished());

        let engine = harness.engine();
        assert_applied(&engine.start_container(&meta, "f", "f-1").await.unwrap());
        assert_applied(
            &engine
                .finish_container(&meta, "f", "f-1", BuildStatus::Succeed)
                .await
                .unwrap(),
        );
        harness.pump(64).await;

        assert_eq!(harness.stage("b-1", "f").await.status, BuildStatus::Succeed);
        let build = harness.build("b-1").await;
        assert_eq!(build.status, BuildStatus::Canceled);
        assert!(build.end_time.is_some());
        assert_eq!(build.running_count, 0);
    }

    #[tokio::test]
    async fn test_failed_commit_keeps_mutex_holds() {
        let harness = EngineHarness::new();
        let fixture = two_stage_build();
        let event = cancel(&fixture);
        harness.seed(fixture).await.unwrap();
        hold_group(&harness, "b-1", "s-1", "c-1").await;

        harness
            .store
            .fail_next_apply(StoreError::Unavailable("disk".to_string()));
        assert!(matches!(harness.handle(event).await, HandleOutcome::Failed(_)));

        assert_eq!(harness.mutex.holders("M").len(), 1);
        assert_eq!(harness.container("b-1", "s-1", "c-1").await.status, BuildStatus::Running);
        assert!(harness.dispatcher.is_empty());
        assert_eq!(harness.lock_backend.live_count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_cancel_is_discarded_and_measured_once() {
        let mut measure = MockMeasureService::new();
        measure.expect_record_cancel().times(1).returning(|m| {
            assert_eq!(m.cancelled_containers, 2);
            Ok(())
        });
        let harness = EngineHarness::with_measure(Arc::new(measure));
        let fixture = two_stage_build();
        let event = cancel(&fixture);
        harness.seed(fixture).await.unwrap();
        hold_group(&harness, "b-1", "s-1", "c-1").await;

        assert_eq!(harness.handle(event.clone()).await, HandleOutcome::Applied);
        let dispatched = harness.dispatcher.len();
        let second = harness.handle(event).await;
        assert!(matches!(second, HandleOutcome::Discarded(_)));
        assert_eq!(harness.dispatcher.len(), dispatched);
        assert_no_mutex_held(&harness.mutex, "b-1");
    }

    #[tokio::test]
    async fn test_cancel_after_finish_is_discarded() {
        let harness = EngineHarness::new();
        let fixture = BuildFixture::new("b-1")
            .with_status(BuildStatus::Succeed)
            .stage("s-1", BuildStatus::Succeed);
        let event = cancel(&fixture);
        harness.seed(fixture).await.unwrap();

        assert!(matches!(harness.handle(event).await, HandleOutcome::Discarded(_)));
        assert!(harness.dispatcher.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_releases_decorated_group() {
        let harness = EngineHarness::new();
        let fixture = BuildFixture::new("b-1")
            .with_variable("REGION", "eu")
            .stage("s-1", BuildStatus::Running)
            .container("s-1", "c-1", BuildStatus::Running)
            .with_mutex("c-1", "deploy-${REGION}")
            .stage("s-2", BuildStatus::Queue);
        let event = cancel(&fixture);
        harness.seed(fixture).await.unwrap();
        hold_group(&harness, "b-1", "s-1", "c-1").await;
        assert_eq!(harness.mutex.holders("deploy-eu").len(), 1);

        harness.handle(event).await;
        assert!(harness.mutex.holders("deploy-eu").is_empty());
    }

    #[tokio::test]
    async fn test_cancel_and_pause_are_serialized() {
        let harness = EngineHarness::new();
        let fixture = BuildFixture::new("b-1")
            .stage("s-1", BuildStatus::Running)
            .container("s-1", "c-1", BuildStatus::Running)
            .stage("s-2", BuildStatus::Queue);
        let cancel_event = cancel(&fixture);
        let pause_event = PipelineEvent::StageCommand(StageCommandEvent {
            meta: fixture.meta("user_pause"),
            stage_id: "s-2".to_string(),
            command: StageCommand::Pause,
        });
        harness.seed(fixture).await.unwrap();

        let (cancelled, paused) =
            tokio::join!(harness.handle(cancel_event), harness.handle(pause_event));
        for outcome in [&cancelled, &paused] {
            assert!(
                matches!(outcome, HandleOutcome::Applied | HandleOutcome::Discarded(_)),
                "unexpected outcome {outcome:?}"
            );
        }
        assert_eq!(cancelled, HandleOutcome::Applied);
        assert_eq!(harness.lock_backend.live_count(), 0);

        harness.pump(64).await;
        let build = harness.build("b-1").await;
        assert_eq!(build.status, BuildStatus::Canceled);
        assert_eq!(build.running_count, 0);
        assert_eq!(harness.container("b-1", "s-1", "c-1").await.status, BuildStatus::Canceled);
        assert_eq!(harness.store.clamped_total(), 0);
    }

    #[tokio::test]
    async fn test_cancel_keeps_decorated_group_of_other_builds() {
        let harness = EngineHarness::new();
        for (build_id, region) in [("b-1", "eu"), ("b-2", "us")] {
            let fixture = BuildFixture::new(build_id)
                .with_variable("REGION", region)
                .stage("s-1", BuildStatus::Running)
                .container("s-1", "c-1", BuildStatus::Running)
                .with_mutex("c-1", "deploy-${REGION}");
            harness.seed(fixture).await.unwrap();
            hold_group(&harness, build_id, "s-1", "c-1").await;
        }

        let event = cancel(&BuildFixture::new("b-1"));
        harness.handle(event).await;

        assert_no_mutex_held(&harness.mutex, "b-1");
        assert!(harness.mutex.build_holds_any("b-2"));
        assert_eq!(harness.mutex.holders("deploy-us").len(), 1);
    }

    #[tokio::test]
    async fn test_dispatch_failures_do_not_stop_cascade() {
        let store = Arc::new(InMemoryStateStore::new());
        let mutex = Arc::new(MutexGroupController::default());
        let mut dispatcher = MockEventDispatcher::new();
        dispatcher.expect_dispatch().returning(|event| {
            Err(DispatchError::Rejected {
                kind: event.kind().to_string(),
                reason: "bus unavailable".to_string(),
            })
        });
        let engine = Engine::new(store.clone(), Arc::new(dispatcher), mutex.clone());

        let fixture = two_stage_build();
        let PipelineEvent::CancelBuild(request) = cancel(&fixture) else {
            unreachable!()
        };
        fixture.seed(store.as_ref()).await.unwrap();

        let transition = engine.cancel_build(&request).await.unwrap();
        assert_applied(&transition);
        for container_id in ["c-1", "c-2"] {
            let container = store
                .get_container("b-1", "s-1", container_id)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(container.status, BuildStatus::Canceled);
        }
        assert_no_mutex_held(&mutex, "b-1");
    }
}
