//! State store boundary.
//!
//! The store is the record of truth for builds. The engine reads freely but
//! writes only through [`StateStore::apply`], which commits a [`WriteBatch`]
//! atomically: either every operation lands or none does. Build status
//! updates may carry an expected prior status, turning them into
//! compare-and-swap writes that silently skip on mismatch.

mod memory;

pub use memory::InMemoryStateStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{Build, BuildStatus, Container, Stage, Task};
use crate::errors::StoreError;

/// Status of one stage as shown on the build detail page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageStatusEntry {
    /// Stage id.
    pub stage_id: String,
    /// Stage sequence.
    pub seq: u32,
    /// Last recorded status.
    pub status: BuildStatus,
}

/// Who cancelled a build and when.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelInfo {
    /// Cancelling user.
    pub user_id: String,
    /// Requested final status.
    pub status: BuildStatus,
    /// When the cascade ran.
    pub at: DateTime<Utc>,
}

/// Denormalized view of a build for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildDetail {
    /// Build id.
    pub build_id: String,
    /// Per-stage status summary, ordered by sequence.
    pub stage_status: Vec<StageStatusEntry>,
    /// Set once a cancellation cascade ran.
    pub cancel_info: Option<CancelInfo>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
}

impl BuildDetail {
    /// Creates an empty detail record.
    #[must_use]
    pub fn new(build_id: impl Into<String>) -> Self {
        Self {
            build_id: build_id.into(),
            stage_status: Vec::new(),
            cancel_info: None,
            updated_at: Utc::now(),
        }
    }

    /// Returns the recorded status of a stage.
    #[must_use]
    pub fn stage_status_of(&self, stage_id: &str) -> Option<BuildStatus> {
        self.stage_status
            .iter()
            .find(|e| e.stage_id == stage_id)
            .map(|e| e.status)
    }

    pub(crate) fn record_stage(&mut self, stage_id: &str, seq: u32, status: BuildStatus) {
        match self.stage_status.iter_mut().find(|e| e.stage_id == stage_id) {
            Some(entry) => entry.status = status,
            None => {
                self.stage_status.push(StageStatusEntry {
                    stage_id: stage_id.to_string(),
                    seq,
                    status,
                });
                self.stage_status.sort_by_key(|e| e.seq);
            }
        }
        self.updated_at = Utc::now();
    }
}

/// Per-pipeline summary row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildSummary {
    /// Owning project.
    pub project_id: String,
    /// Pipeline id.
    pub pipeline_id: String,
    /// Running containers across the pipeline's builds.
    pub running_count: u32,
    /// Most recently created build.
    pub latest_build_id: Option<String>,
    /// Status of the most recent build.
    pub latest_status: Option<BuildStatus>,
}

impl BuildSummary {
    /// Creates an empty summary.
    #[must_use]
    pub fn new(project_id: impl Into<String>, pipeline_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            pipeline_id: pipeline_id.into(),
            running_count: 0,
            latest_build_id: None,
            latest_status: None,
        }
    }
}

/// A single write inside a [`WriteBatch`].
#[derive(Debug, Clone, PartialEq)]
pub enum StoreOp {
    /// Inserts or replaces a build.
    PutBuild(Build),
    /// Sets the build status, only if the current status equals `expected` when given.
    UpdateBuildStatus {
        /// Target build.
        build_id: String,
        /// Required current status.
        expected: Option<BuildStatus>,
        /// New status.
        status: BuildStatus,
    },
    /// Adds `delta` to the build's and its pipeline summary's running count, clamped at zero.
    AdjustRunningCount {
        /// Target build.
        build_id: String,
        /// Signed change.
        delta: i32,
    },
    /// Overwrites the build's running count, moving the pipeline summary by the difference.
    SetRunningCount {
        /// Target build.
        build_id: String,
        /// New count.
        count: u32,
    },
    /// Marks a build finished.
    FinishBuild {
        /// Target build.
        build_id: String,
        /// Final status.
        status: BuildStatus,
        /// Finish time.
        end_time: DateTime<Utc>,
    },
    /// Inserts or replaces a stage.
    PutStage(Stage),
    /// Inserts or replaces a container.
    PutContainer(Container),
    /// Inserts or replaces a task.
    PutTask(Task),
    /// Records a stage status in the build detail summary.
    RecordStageStatus {
        /// Target build.
        build_id: String,
        /// Stage id.
        stage_id: String,
        /// Stage sequence.
        seq: u32,
        /// Status to record.
        status: BuildStatus,
    },
    /// Records cancellation on the build detail.
    RecordCancel {
        /// Target build.
        build_id: String,
        /// Cancellation info.
        info: CancelInfo,
    },
}

impl StoreOp {
    /// The build this operation touches.
    #[must_use]
    pub fn build_id(&self) -> &str {
        match self {
            Self::PutBuild(b) => &b.build_id,
            Self::PutStage(s) => &s.build_id,
            Self::PutContainer(c) => &c.build_id,
            Self::PutTask(t) => &t.build_id,
            Self::UpdateBuildStatus { build_id, .. }
            | Self::AdjustRunningCount { build_id, .. }
            | Self::SetRunningCount { build_id, .. }
            | Self::FinishBuild { build_id, .. }
            | Self::RecordStageStatus { build_id, .. }
            | Self::RecordCancel { build_id, .. } => build_id,
        }
    }
}

/// An ordered set of writes committed atomically.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    ops: Vec<StoreOp>,
}

impl WriteBatch {
    /// Creates an empty batch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an operation.
    pub fn push(&mut self, op: StoreOp) -> &mut Self {
        self.ops.push(op);
        self
    }

    /// Appends a stage write together with its detail summary entry.
    pub fn put_stage(&mut self, stage: Stage) -> &mut Self {
        self.ops.push(StoreOp::RecordStageStatus {
            build_id: stage.build_id.clone(),
            stage_id: stage.stage_id.clone(),
            seq: stage.seq,
            status: stage.status,
        });
        self.ops.push(StoreOp::PutStage(stage));
        self
    }

    /// Appends a container write.
    pub fn put_container(&mut self, container: Container) -> &mut Self {
        self.push(StoreOp::PutContainer(container))
    }

    /// Appends a task write.
    pub fn put_task(&mut self, task: Task) -> &mut Self {
        self.push(StoreOp::PutTask(task))
    }

    /// Appends a conditional build status write.
    pub fn build_status(
        &mut self,
        build_id: &str,
        expected: Option<BuildStatus>,
        status: BuildStatus,
    ) -> &mut Self {
        self.push(StoreOp::UpdateBuildStatus {
            build_id: build_id.to_string(),
            expected,
            status,
        })
    }

    /// Appends a running-count change; a zero delta is dropped.
    pub fn running_delta(&mut self, build_id: &str, delta: i32) -> &mut Self {
        if delta != 0 {
            self.ops.push(StoreOp::AdjustRunningCount {
                build_id: build_id.to_string(),
                delta,
            });
        }
        self
    }

    /// The queued operations.
    #[must_use]
    pub fn ops(&self) -> &[StoreOp] {
        &self.ops
    }

    /// Number of queued operations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Returns true if the batch has no operations.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Consumes the batch.
    #[must_use]
    pub fn into_ops(self) -> Vec<StoreOp> {
        self.ops
    }
}

/// What a committed batch actually changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    /// Operations committed.
    pub applied: usize,
    /// Conditional status writes skipped because the current status differed.
    pub cas_skipped: usize,
    /// Running-count changes that would have gone negative.
    pub clamped: usize,
}

/// Full state of one build, read in one go.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildSnapshot {
    /// The build.
    pub build: Build,
    /// Stages ordered by sequence.
    pub stages: Vec<Stage>,
    /// Containers ordered by stage sequence, then id.
    pub containers: Vec<Container>,
}

impl BuildSnapshot {
    /// Looks up a stage.
    #[must_use]
    pub fn stage(&self, stage_id: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.stage_id == stage_id)
    }

    /// Containers of one stage.
    pub fn containers_in<'a>(&'a self, stage_id: &'a str) -> impl Iterator<Item = &'a Container> + 'a {
        self.containers.iter().filter(move |c| c.stage_id == stage_id)
    }

    /// Number of running containers.
    #[must_use]
    pub fn running_containers(&self) -> usize {
        self.containers.iter().filter(|c| c.status.is_running()).count()
    }
}

/// Transactional storage for build records.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Loads a build.
    async fn get_build(&self, build_id: &str) -> Result<Option<Build>, StoreError>;

    /// Loads a stage.
    async fn get_stage(&self, build_id: &str, stage_id: &str) -> Result<Option<Stage>, StoreError>;

    /// Lists a build's stages ordered by sequence.
    async fn list_stages(&self, build_id: &str) -> Result<Vec<Stage>, StoreError>;

    /// Loads a container.
    async fn get_container(
        &self,
        build_id: &str,
        stage_id: &str,
        container_id: &str,
    ) -> Result<Option<Container>, StoreError>;

    /// Lists containers of a build, optionally restricted to one stage.
    async fn list_containers(
        &self,
        build_id: &str,
        stage_id: Option<&str>,
    ) -> Result<Vec<Container>, StoreError>;

    /// Lists a container's tasks ordered by sequence.
    async fn list_tasks(&self, build_id: &str, container_id: &str) -> Result<Vec<Task>, StoreError>;

    /// Loads the build detail.
    async fn get_detail(&self, build_id: &str) -> Result<Option<BuildDetail>, StoreError>;

    /// Loads a pipeline summary.
    async fn get_summary(&self, pipeline_id: &str) -> Result<Option<BuildSummary>, StoreError>;

    /// Commits a batch atomically.
    async fn apply(&self, batch: WriteBatch) -> Result<ApplyReport, StoreError>;

    /// Loads the build with all its stages and containers.
    async fn snapshot(&self, build_id: &str) -> Result<BuildSnapshot, StoreError> {
        let build = self
            .get_build(build_id)
            .await?
            .ok_or_else(|| StoreError::not_found("build", build_id))?;
        let stages = self.list_stages(build_id).await?;
        let mut containers = self.list_containers(build_id, None).await?;
        containers.sort_by(|a, b| {
            let seq = |c: &Container| {
                stages
                    .iter()
                    .find(|s| s.stage_id == c.stage_id)
                    .map_or(u32::MAX, |s| s.seq)
            };
            seq(a)
                .cmp(&seq(b))
                .then_with(|| a.container_id.cmp(&b.container_id))
        });
        Ok(BuildSnapshot {
            build,
            stages,
            containers,
        })
    }
}
