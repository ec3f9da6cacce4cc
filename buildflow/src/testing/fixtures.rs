//! Build tree fixtures.

use crate::core::{
    Build, BuildStatus, Container, ContainerKind, DispatchInfo, EventMeta, MutexGroupSpec, Stage,
    Task,
};
use crate::errors::EngineError;
use crate::store::{StateStore, StoreOp, WriteBatch};

/// Project id used by fixtures.
pub const FIXTURE_PROJECT: &str = "proj";
/// Pipeline id used by fixtures.
pub const FIXTURE_PIPELINE: &str = "pipe";

/// Builder for a build with its stages, containers and tasks.
///
/// Stages get sequence numbers in the order they are added. Unless set
/// explicitly, the build's running count is its run slot (one while the
/// build is RUNNING) plus its running containers.
#[derive(Debug, Clone)]
pub struct BuildFixture {
    build: Build,
    stages: Vec<Stage>,
    containers: Vec<Container>,
    tasks: Vec<Task>,
    running_count: Option<u32>,
}

impl BuildFixture {
    /// Starts a running build.
    #[must_use]
    pub fn new(build_id: impl Into<String>) -> Self {
        Self {
            build: Build::new(FIXTURE_PROJECT, FIXTURE_PIPELINE, build_id),
            stages: Vec::new(),
            containers: Vec::new(),
            tasks: Vec::new(),
            running_count: None,
        }
    }

    /// Sets the build status.
    #[must_use]
    pub fn with_status(mut self, status: BuildStatus) -> Self {
        self.build.status = status;
        self
    }

    /// Adds a build variable.
    #[must_use]
    pub fn with_variable(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.build.variables.insert(key.into(), value.into());
        self
    }

    /// Overrides the running count.
    #[must_use]
    pub fn with_running_count(mut self, count: u32) -> Self {
        self.running_count = Some(count);
        self
    }

    /// Adds a stage.
    #[must_use]
    pub fn stage(mut self, stage_id: &str, status: BuildStatus) -> Self {
        let seq = u32::try_from(self.stages.len() + 1).unwrap_or(u32::MAX);
        let mut stage = Stage::new(&self.build.build_id, stage_id, seq);
        stage.status = status;
        if status.is_running() {
            stage.start_time = Some(chrono::Utc::now());
        }
        self.stages.push(stage);
        self
    }

    /// Adds a `finally` stage.
    #[must_use]
    pub fn finally_stage(self, stage_id: &str, status: BuildStatus) -> Self {
        self.stage(stage_id, status).edit_stage(stage_id, |s| s.finally = true)
    }

    /// Adds a queued stage waiting for a manual start.
    #[must_use]
    pub fn manual_stage(self, stage_id: &str) -> Self {
        self.stage(stage_id, BuildStatus::Queue)
            .edit_stage(stage_id, |s| s.control_option.manual_trigger = true)
    }

    /// Changes an added stage.
    #[must_use]
    pub fn edit_stage(mut self, stage_id: &str, edit: impl FnOnce(&mut Stage)) -> Self {
        if let Some(stage) = self.stages.iter_mut().find(|s| s.stage_id == stage_id) {
            edit(stage);
        }
        self
    }

    /// Adds an environment-less container.
    #[must_use]
    pub fn container(self, stage_id: &str, container_id: &str, status: BuildStatus) -> Self {
        self.push_container(stage_id, container_id, status, ContainerKind::Normal)
    }

    /// Adds a VM-backed container.
    #[must_use]
    pub fn vm_container(self, stage_id: &str, container_id: &str, status: BuildStatus) -> Self {
        let kind = ContainerKind::Vm {
            dispatch: DispatchInfo {
                dispatch_type: "DOCKER".to_string(),
                route_key_suffix: Some(".docker".to_string()),
            },
        };
        self.push_container(stage_id, container_id, status, kind)
    }

    fn push_container(
        mut self,
        stage_id: &str,
        container_id: &str,
        status: BuildStatus,
        kind: ContainerKind,
    ) -> Self {
        let mut container = Container::new(&self.build.build_id, stage_id, container_id, kind);
        container.status = status;
        if status.is_running() {
            container.start_time = Some(chrono::Utc::now());
        }
        self.containers.push(container);
        self
    }

    /// Declares a mutex group on an added container.
    #[must_use]
    pub fn with_mutex(mut self, container_id: &str, group_name: &str) -> Self {
        if let Some(container) = self
            .containers
            .iter_mut()
            .find(|c| c.container_id == container_id)
        {
            container.mutex_group = Some(MutexGroupSpec {
                enable: true,
                mutex_group_name: Some(group_name.to_string()),
                ..MutexGroupSpec::default()
            });
        }
        self
    }

    /// Changes an added container.
    #[must_use]
    pub fn edit_container(mut self, container_id: &str, edit: impl FnOnce(&mut Container)) -> Self {
        if let Some(container) = self
            .containers
            .iter_mut()
            .find(|c| c.container_id == container_id)
        {
            edit(container);
        }
        self
    }

    /// Adds a queued task to an added container.
    #[must_use]
    pub fn task(mut self, container_id: &str, task_id: &str) -> Self {
        if let Some(container) = self.containers.iter().find(|c| c.container_id == container_id) {
            let seq = self
                .tasks
                .iter()
                .filter(|t| t.container_id == container_id)
                .count();
            let seq = u32::try_from(seq + 1).unwrap_or(u32::MAX);
            self.tasks
                .push(Task::new(container, task_id, seq, "linuxScript"));
        }
        self
    }

    /// Changes an added task.
    #[must_use]
    pub fn edit_task(mut self, task_id: &str, edit: impl FnOnce(&mut Task)) -> Self {
        if let Some(task) = self.tasks.iter_mut().find(|t| t.task_id == task_id) {
            edit(task);
        }
        self
    }

    /// The build id.
    #[must_use]
    pub fn build_id(&self) -> &str {
        &self.build.build_id
    }

    /// Event metadata addressing this build.
    #[must_use]
    pub fn meta(&self, source: &str) -> EventMeta {
        EventMeta::new(
            source,
            &self.build.project_id,
            &self.build.pipeline_id,
            &self.build.build_id,
            "alice",
        )
    }

    /// The writes that create the whole tree.
    #[must_use]
    pub fn into_batch(self) -> WriteBatch {
        let mut build = self.build;
        build.running_count = self.running_count.unwrap_or_else(|| {
            let slot = usize::from(build.status == BuildStatus::Running);
            let running = self.containers.iter().filter(|c| c.status.is_running()).count();
            u32::try_from(slot + running).unwrap_or(u32::MAX)
        });

        let mut batch = WriteBatch::new();
        batch.push(StoreOp::PutBuild(build));
        for stage in self.stages {
            batch.put_stage(stage);
        }
        for container in self.containers {
            batch.put_container(container);
        }
        for task in self.tasks {
            batch.put_task(task);
        }
        batch
    }

    /// Writes the tree into `store`.
    pub async fn seed(self, store: &dyn StateStore) -> Result<(), EngineError> {
        store.apply(self.into_batch()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stages_are_sequenced_in_order() {
        let fixture = BuildFixture::new("b-1")
            .stage("s-1", BuildStatus::Running)
            .stage("s-2", BuildStatus::Queue)
            .finally_stage("f", BuildStatus::Queue);
        let seqs: Vec<_> = fixture.stages.iter().map(|s| (s.stage_id.as_str(), s.seq, s.finally)).collect();
        assert_eq!(seqs, vec![("s-1", 1, false), ("s-2", 2, false), ("f", 3, true)]);
    }

    #[test]
    fn test_running_count_defaults_to_slot_and_running_containers() {
        let tree = |status| {
            BuildFixture::new("b-1")
                .with_status(status)
                .stage("s-1", BuildStatus::Running)
                .container("s-1", "1", BuildStatus::Running)
                .container("s-1", "2", BuildStatus::Queue)
                .into_batch()
        };
        for (status, expected) in [(BuildStatus::Running, 2), (BuildStatus::StageSuccess, 1)] {
            let batch = tree(status);
            let StoreOp::PutBuild(build) = &batch.ops()[0] else {
                panic!("first op must create the build");
            };
            assert_eq!(build.running_count, expected, "{status}");
        }
    }
}
