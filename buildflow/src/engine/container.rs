//! Container lifecycle: start under its mutex group, finish and release.

use chrono::Utc;

use super::{Engine, Transition};
use crate::core::{ActionType, Build, BuildStatus, Container, EventMeta, PipelineEvent};
use crate::errors::{EngineError, MutexError, StoreError};
use crate::mutex::{MutexAcquire, MutexOwner};
use crate::store::WriteBatch;

/// How a start request was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStart {
    /// The container moved to RUNNING.
    Started,
    /// The container was already running; nothing changed.
    AlreadyRunning,
}

impl Engine {
    pub(super) async fn load_container(
        &self,
        build_id: &str,
        stage_id: &str,
        container_id: &str,
    ) -> Result<Container, EngineError> {
        self.store
            .get_container(build_id, stage_id, container_id)
            .await?
            .ok_or_else(|| {
                StoreError::not_found("container", format!("{build_id}/{stage_id}/{container_id}"))
                    .into()
            })
    }

    /// Moves a queued container to RUNNING once its mutex group is held.
    ///
    /// A busy group surfaces as [`MutexError::Queued`] so the worker retries;
    /// a group wait that timed out fails the container with `QUEUE_TIMEOUT`.
    pub async fn start_container(
        &self,
        meta: &EventMeta,
        stage_id: &str,
        container_id: &str,
    ) -> Result<Transition<ContainerStart>, EngineError> {
        let build = self.load_build(&meta.build_id).await?;
        if build.is_finished() {
            return Ok(Transition::discarded(format!("build already {}", build.status)));
        }
        let stage = self.load_stage(&meta.build_id, stage_id).await?;
        if stage.status != BuildStatus::Running {
            return Ok(Transition::discarded(format!(
                "stage {stage_id} is {}, container cannot start",
                stage.status
            )));
        }
        let container = self.load_container(&meta.build_id, stage_id, container_id).await?;
        if container.status.is_running() {
            return Ok(Transition::Applied(ContainerStart::AlreadyRunning));
        }
        if container.status.is_finish() {
            return Ok(Transition::discarded(format!(
                "container {container_id} already {}",
                container.status
            )));
        }

        let group = container
            .mutex_group
            .as_ref()
            .map(|spec| self.mutex.decorate(spec, &build.variables));
        if let Some(group) = &group {
            let owner = MutexOwner::of(&build.project_id, &container);
            match self.mutex.try_acquire(&owner, group) {
                Ok(MutexAcquire::Granted | MutexAcquire::NotRequired) => {}
                Ok(MutexAcquire::Queued(position)) => {
                    return Err(MutexError::Queued {
                        group: group.name.clone(),
                        position,
                    }
                    .into());
                }
                Err(err @ MutexError::Timeout { .. }) => {
                    tracing::warn!(
                        build_id = %build.build_id,
                        container_id,
                        group = %group.name,
                        "Mutex group wait timed out"
                    );
                    self.finish_container(meta, stage_id, container_id, BuildStatus::QueueTimeout)
                        .await?;
                    return Err(err.into());
                }
                Err(err) => return Err(err.into()),
            }
        }

        let now = Utc::now();
        let mut running = container.clone();
        running.status = BuildStatus::Running;
        running.start_time = Some(now);
        running.last_heartbeat = Some(now);
        let mut batch = WriteBatch::new();
        batch
            .put_container(running)
            .running_delta(&build.build_id, 1);

        if let Err(err) = self.commit(batch).await {
            // A container that never started must not hold the group.
            self.release_container_mutex(&build, &container);
            return Err(err);
        }
        tracing::info!(build_id = %build.build_id, stage_id, container_id, "Container started");
        Ok(Transition::Applied(ContainerStart::Started))
    }

    /// Finishes a container with `status`, releases its mutex and refreshes its stage.
    pub async fn finish_container(
        &self,
        meta: &EventMeta,
        stage_id: &str,
        container_id: &str,
        status: BuildStatus,
    ) -> Result<Transition, EngineError> {
        let build = self.load_build(&meta.build_id).await?;
        if build.is_finished() {
            return Ok(Transition::discarded(format!("build already {}", build.status)));
        }
        let container = self.load_container(&meta.build_id, stage_id, container_id).await?;
        if container.status.is_finish() {
            return Ok(Transition::discarded(format!(
                "container {container_id} already {}",
                container.status
            )));
        }

        self.close_container(meta, &build, &container, status, WriteBatch::new(), "container_finish")
            .await?;
        Ok(Transition::APPLIED)
    }

    /// Commits the container's end together with `batch`, then releases its
    /// mutex and asks stage control to refresh the stage.
    pub(super) async fn close_container(
        &self,
        meta: &EventMeta,
        build: &Build,
        container: &Container,
        status: BuildStatus,
        mut batch: WriteBatch,
        source: &str,
    ) -> Result<(), EngineError> {
        let mut done = container.clone();
        done.status = status;
        done.end_time = Some(Utc::now());
        batch.put_container(done);
        if container.status.is_running() {
            batch.running_delta(&build.build_id, -1);
        }
        self.commit(batch).await?;
        self.release_container_mutex(build, container);
        tracing::info!(
            build_id = %build.build_id,
            stage_id = %container.stage_id,
            container_id = %container.container_id,
            status = %status,
            "Container finished"
        );

        self.publish(PipelineEvent::stage(
            meta.follow_up(source),
            &container.stage_id,
            ActionType::Refresh,
        ))
        .await;
        Ok(())
    }
}
