//! Build orchestration: stage state machine, cancellation cascade, stage
//! control, container and task lifecycle, build finish.
//!
//! Every `Engine` operation assumes the caller holds the build lock for
//! the target build (see [`crate::handlers`]). Operations re-read current
//! state first and return [`Transition::Discarded`] for stale or duplicate
//! requests instead of failing. State changes of one operation are
//! committed as a single [`WriteBatch`]; follow-up events are dispatched
//! only after the commit succeeds.

mod cancel;
mod cascade_tests;
mod container;
mod finish;
mod property_tests;
mod stage;
mod stage_control;
mod task;

pub use cancel::{CascadeReport, Continuation};
pub use container::ContainerStart;
pub use task::{ClaimOutcome, TaskResult};

use std::collections::HashSet;
use std::sync::Arc;

use crate::core::{
    AgentShutdownEvent, Build, BuildLessShutdownEvent, BuildStatus, Container, ContainerKind,
    EventMeta, PipelineEvent, Stage, StatusSwitcher,
};
use crate::dispatch::EventDispatcher;
use crate::errors::{EngineError, StoreError};
use crate::mutex::{MutexGroupController, MutexOwner};
use crate::store::{BuildDetail, BuildSnapshot, StateStore, WriteBatch};

/// Outcome of an engine operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition<T = ()> {
    /// State changed.
    Applied(T),
    /// Nothing changed; the request was stale, duplicate or not applicable.
    Discarded(String),
}

impl Transition<()> {
    /// The unit `Applied` outcome.
    pub const APPLIED: Self = Self::Applied(());
}

impl<T> Transition<T> {
    /// Creates a discard outcome.
    #[must_use]
    pub fn discarded(reason: impl Into<String>) -> Self {
        Self::Discarded(reason.into())
    }

    /// Returns true if state changed.
    #[must_use]
    pub const fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }

    /// Returns the discard reason, if discarded.
    #[must_use]
    pub fn discard_reason(&self) -> Option<&str> {
        match self {
            Self::Applied(_) => None,
            Self::Discarded(reason) => Some(reason),
        }
    }
}

/// The orchestration core, wired with its collaborators.
#[derive(Clone)]
pub struct Engine {
    store: Arc<dyn StateStore>,
    dispatcher: Arc<dyn EventDispatcher>,
    mutex: Arc<MutexGroupController>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine").finish_non_exhaustive()
    }
}

impl Engine {
    /// Creates an engine.
    #[must_use]
    pub fn new(
        store: Arc<dyn StateStore>,
        dispatcher: Arc<dyn EventDispatcher>,
        mutex: Arc<MutexGroupController>,
    ) -> Self {
        Self {
            store,
            dispatcher,
            mutex,
        }
    }

    /// The state store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// The mutex group controller.
    #[must_use]
    pub fn mutex(&self) -> &Arc<MutexGroupController> {
        &self.mutex
    }

    async fn load_build(&self, build_id: &str) -> Result<Build, EngineError> {
        self.store
            .get_build(build_id)
            .await?
            .ok_or_else(|| StoreError::not_found("build", build_id).into())
    }

    async fn load_stage(&self, build_id: &str, stage_id: &str) -> Result<Stage, EngineError> {
        self.store
            .get_stage(build_id, stage_id)
            .await?
            .ok_or_else(|| StoreError::not_found("stage", format!("{build_id}/{stage_id}")).into())
    }

    async fn load_detail(&self, build_id: &str) -> Result<BuildDetail, EngineError> {
        Ok(self
            .store
            .get_detail(build_id)
            .await?
            .unwrap_or_else(|| BuildDetail::new(build_id)))
    }

    async fn commit(&self, batch: WriteBatch) -> Result<(), EngineError> {
        if batch.is_empty() {
            return Ok(());
        }
        let report = self.store.apply(batch).await?;
        if report.clamped > 0 {
            tracing::warn!(clamped = report.clamped, "Running count drift detected");
        }
        Ok(())
    }

    /// Publishes an event; a failure is logged and reported as `false`.
    async fn publish(&self, event: PipelineEvent) -> bool {
        let kind = event.kind();
        let build_id = event.build_id().to_string();
        match self.dispatcher.dispatch(event).await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(build_id = %build_id, kind, error = %e, "Event dispatch failed");
                false
            }
        }
    }

    /// Releases the container's mutex group. No-op without a declared group.
    fn release_container_mutex(&self, build: &Build, container: &Container) -> bool {
        let Some(spec) = container.mutex_group.as_ref() else {
            return false;
        };
        let group = self.mutex.decorate(spec, &build.variables);
        self.mutex
            .release(&MutexOwner::of(&build.project_id, container), &group)
    }

    /// Stages `job_cancel` writes for the unfinished containers of a stage.
    ///
    /// Returns the containers as they were before cancellation.
    fn cancel_stage_containers(
        snapshot: &BuildSnapshot,
        stage_id: &str,
        batch: &mut WriteBatch,
    ) -> Vec<Container> {
        let now = chrono::Utc::now();
        let mut cancelled = Vec::new();
        for container in snapshot.containers_in(stage_id) {
            if container.status.is_finish() {
                continue;
            }
            let mut updated = container.clone();
            updated.status = StatusSwitcher::job_cancel(container.status);
            updated.end_time = Some(now);
            if container.status.is_running() {
                batch.running_delta(&snapshot.build.build_id, -1);
            }
            batch.put_container(updated);
            cancelled.push(container.clone());
        }
        cancelled
    }

    /// Post-commit side effects for cancelled containers: mutex release,
    /// shutdown signal and log markers. Failures are logged and skipped.
    async fn stop_cancelled_containers(
        &self,
        build: &Build,
        containers: &[Container],
        meta: &EventMeta,
        released: &mut HashSet<String>,
    ) {
        for container in containers {
            if self.release_container_mutex(build, container) {
                released.insert(container.container_id.clone());
            }

            let follow = meta.follow_up("cancel_build");
            let shutdown = match &container.kind {
                ContainerKind::Vm { dispatch } => PipelineEvent::AgentShutdown(AgentShutdownEvent {
                    meta: follow,
                    vm_seq_id: container.container_id.clone(),
                    route_key_suffix: dispatch.route_key_suffix.clone(),
                    execute_count: build.execute_count,
                    build_result: true,
                }),
                ContainerKind::Normal => {
                    PipelineEvent::BuildLessShutdown(BuildLessShutdownEvent {
                        meta: follow,
                        vm_seq_id: container.container_id.clone(),
                        execute_count: build.execute_count,
                        build_result: true,
                    })
                }
            };
            self.publish(shutdown).await;

            tracing::info!(
                build_id = %build.build_id,
                container_id = %container.container_id,
                tag = %container.start_vm_tag(),
                execute_count = build.execute_count,
                user_id = %meta.user_id,
                "[{}] cancelled the job; log stream closed",
                meta.user_id
            );
        }
    }
}

/// Final build status from stage outcomes, or the recorded cancel status.
fn final_status(stages: &[Stage], detail: &BuildDetail) -> BuildStatus {
    if let Some(info) = &detail.cancel_info {
        return info.status;
    }
    StatusSwitcher::aggregate(
        stages
            .iter()
            .filter(|s| s.status.is_finish())
            .map(|s| s.status),
    )
}

/// True once the build can only proceed to `finally` stages.
fn is_broken(stages: &[Stage], detail: &BuildDetail) -> bool {
    detail.cancel_info.is_some()
        || stages
            .iter()
            .any(|s| !s.finally && (s.status.is_cancel() || s.status.is_failure()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_helpers() {
        let applied: Transition = Transition::APPLIED;
        assert!(applied.is_applied());
        assert_eq!(applied.discard_reason(), None);

        let discarded: Transition = Transition::discarded("build already finished");
        assert!(!discarded.is_applied());
        assert_eq!(discarded.discard_reason(), Some("build already finished"));
    }
}
