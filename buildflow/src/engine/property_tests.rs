//! Randomized operation sequences against one build.

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use std::collections::HashMap;

    use crate::core::{
        ActionType, BuildCancelEvent, BuildStatus, PipelineEvent, StageCommand, StageCommandEvent,
    };
    use crate::handlers::HandleOutcome;
    use crate::testing::{assert_no_mutex_held, BuildFixture, EngineHarness};

    const STAGES: [&str; 3] = ["s-1", "s-2", "f"];
    const CONTAINERS: [(&str, &str); 3] = [("s-1", "c-1"), ("s-2", "c-2"), ("f", "c-f")];

    #[derive(Debug, Clone)]
    enum Op {
        StartContainer(usize),
        FinishContainer(usize, bool),
        Command(usize, StageCommand),
        Refresh(usize),
        CancelBuild,
        Pump,
    }

    fn command() -> impl Strategy<Value = StageCommand> {
        prop_oneof![
            Just(StageCommand::Start),
            Just(StageCommand::Pause),
            Just(StageCommand::Skip),
            Just(StageCommand::Cancel),
        ]
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            3 => (0..3usize).prop_map(Op::StartContainer),
            3 => (0..3usize, any::<bool>()).prop_map(|(i, ok)| Op::FinishContainer(i, ok)),
            2 => (0..3usize, command()).prop_map(|(i, c)| Op::Command(i, c)),
            2 => (0..3usize).prop_map(Op::Refresh),
            1 => Just(Op::CancelBuild),
            2 => Just(Op::Pump),
        ]
    }

    fn fixture() -> BuildFixture {
        BuildFixture::new("b-1")
            .stage("s-1", BuildStatus::Running)
            .container("s-1", "c-1", BuildStatus::Queue)
            .with_mutex("c-1", "M")
            .stage("s-2", BuildStatus::Queue)
            .container("s-2", "c-2", BuildStatus::Queue)
            .finally_stage("f", BuildStatus::Queue)
            .container("f", "c-f", BuildStatus::Queue)
    }

    fn cancel_event(fixture: &BuildFixture) -> PipelineEvent {
        PipelineEvent::CancelBuild(BuildCancelEvent {
            meta: fixture.meta("user_cancel"),
            status: BuildStatus::Canceled,
        })
    }

    async fn apply(harness: &EngineHarness, fixture: &BuildFixture, op: &Op) -> Option<HandleOutcome> {
        let meta = fixture.meta("property");
        let engine = harness.engine();
        match op {
            Op::StartContainer(i) => {
                let (stage_id, container_id) = CONTAINERS[*i];
                // Busy groups and idle stages are expected refusals here.
                let _ = engine.start_container(&meta, stage_id, container_id).await;
                None
            }
            Op::FinishContainer(i, ok) => {
                let (stage_id, container_id) = CONTAINERS[*i];
                let status = if *ok { BuildStatus::Succeed } else { BuildStatus::Failed };
                let _ = engine.finish_container(&meta, stage_id, container_id, status).await;
                None
            }
            Op::Command(i, command) => Some(
                harness
                    .handle(PipelineEvent::StageCommand(StageCommandEvent {
                        meta,
                        stage_id: STAGES[*i].to_string(),
                        command: *command,
                    }))
                    .await,
            ),
            Op::Refresh(i) => Some(
                harness
                    .handle(PipelineEvent::stage(meta, STAGES[*i], ActionType::Refresh))
                    .await,
            ),
            Op::CancelBuild => Some(harness.handle(cancel_event(fixture)).await),
            Op::Pump => {
                harness.pump(64).await;
                None
            }
        }
    }

    async fn check_invariants(harness: &EngineHarness, finished: &mut HashMap<&'static str, BuildStatus>) {
        for (stage_id, container_id) in CONTAINERS {
            let status = harness.container("b-1", stage_id, container_id).await.status;
            match finished.get(container_id) {
                Some(previous) => assert_eq!(status, *previous, "{container_id} left a terminal status"),
                None if status.is_finish() => {
                    finished.insert(container_id, status);
                }
                None => {}
            }
        }

        assert_eq!(harness.store.clamped_total(), 0, "running count went below zero");

        let mut running_stages = Vec::new();
        for stage_id in &STAGES[..2] {
            if harness.stage("b-1", stage_id).await.status == BuildStatus::Running {
                running_stages.push(*stage_id);
            }
        }
        assert!(running_stages.len() <= 1, "stages running together: {running_stages:?}");

        let build = harness.build("b-1").await;
        if build.is_finished() {
            assert_eq!(build.running_count, 0, "finished build keeps a running count");
            assert_no_mutex_held(&harness.mutex, "b-1");
        } else {
            let mut running = u32::from(build.status == BuildStatus::Running);
            for (stage_id, container_id) in CONTAINERS {
                if harness.container("b-1", stage_id, container_id).await.status.is_running() {
                    running += 1;
                }
            }
            assert!(
                build.running_count >= running,
                "running count {} below run slot and running containers {running}",
                build.running_count
            );
        }
        assert_eq!(harness.lock_backend.live_count(), 0, "build lock leaked");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn prop_operation_sequences_keep_build_consistent(ops in prop::collection::vec(op(), 1..24)) {
            tokio_test::block_on(async {
                let harness = EngineHarness::new();
                let fixture = fixture();
                harness.seed(fixture.clone()).await.unwrap();
                let mut finished = HashMap::new();

                for op in &ops {
                    if let Some(outcome) = apply(&harness, &fixture, op).await {
                        assert!(
                            !matches!(outcome, HandleOutcome::Failed(_) | HandleOutcome::Dropped(_)),
                            "{op:?} gave {outcome:?}"
                        );
                    }
                    check_invariants(&harness, &mut finished).await;
                }

                harness.handle(cancel_event(&fixture)).await;
                harness.pump(128).await;
                check_invariants(&harness, &mut finished).await;

                for (stage_id, container_id) in &CONTAINERS[..2] {
                    let container = harness.container("b-1", stage_id, container_id).await;
                    assert!(container.status.is_finish(), "{container_id} still {}", container.status);
                }
                assert_no_mutex_held(&harness.mutex, "b-1");
            });
        }
    }
}
