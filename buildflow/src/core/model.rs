//! Persisted build records: builds, stages, containers and tasks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::BuildStatus;

/// One execution of a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Build {
    /// Build identifier.
    pub build_id: String,
    /// Owning pipeline.
    pub pipeline_id: String,
    /// Owning project.
    pub project_id: String,
    /// Overall build status.
    pub status: BuildStatus,
    /// Number of containers currently holding a run slot.
    pub running_count: u32,
    /// How many times the build has been (re)executed.
    pub execute_count: u32,
    /// Build variables, exposed to workers and mutex-name decoration.
    #[serde(default)]
    pub variables: HashMap<String, String>,
    /// When the build started.
    pub start_time: Option<DateTime<Utc>>,
    /// When the build finished.
    pub end_time: Option<DateTime<Utc>>,
}

impl Build {
    /// Creates a new running build with no stages accounted yet.
    #[must_use]
    pub fn new(
        project_id: impl Into<String>,
        pipeline_id: impl Into<String>,
        build_id: impl Into<String>,
    ) -> Self {
        Self {
            build_id: build_id.into(),
            pipeline_id: pipeline_id.into(),
            project_id: project_id.into(),
            status: BuildStatus::Running,
            running_count: 0,
            execute_count: 1,
            variables: HashMap::new(),
            start_time: Some(Utc::now()),
            end_time: None,
        }
    }

    /// Returns true once the build reached a terminal state.
    ///
    /// A build in `StageSuccess` is paused on a stage gate, not finished.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.end_time.is_some()
            || (self.status.is_finish() && self.status != BuildStatus::StageSuccess)
    }
}

/// Stage-level control options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageControlOption {
    /// Whether the stage runs at all.
    #[serde(default = "default_true")]
    pub enable: bool,
    /// Stage waits for a manual start before running.
    #[serde(default)]
    pub manual_trigger: bool,
    /// Set once a manual-trigger stage has been started.
    #[serde(default)]
    pub triggered: bool,
    /// Review timeout in hours, if the stage is a review gate.
    #[serde(default)]
    pub timeout_hours: Option<u32>,
}

const fn default_true() -> bool {
    true
}

impl Default for StageControlOption {
    fn default() -> Self {
        Self {
            enable: true,
            manual_trigger: false,
            triggered: false,
            timeout_hours: None,
        }
    }
}

/// An ordered phase of a build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stage {
    /// Owning build.
    pub build_id: String,
    /// Stage identifier, unique within the build.
    pub stage_id: String,
    /// Position within the build; stages run in ascending order.
    pub seq: u32,
    /// Current status.
    pub status: BuildStatus,
    /// Control options.
    #[serde(default)]
    pub control_option: StageControlOption,
    /// Runs regardless of cancellation or failure of earlier stages.
    #[serde(default)]
    pub finally: bool,
    /// When the stage started.
    pub start_time: Option<DateTime<Utc>>,
    /// When the stage ended.
    pub end_time: Option<DateTime<Utc>>,
}

impl Stage {
    /// Creates a queued stage.
    #[must_use]
    pub fn new(build_id: impl Into<String>, stage_id: impl Into<String>, seq: u32) -> Self {
        Self {
            build_id: build_id.into(),
            stage_id: stage_id.into(),
            seq,
            status: BuildStatus::Queue,
            control_option: StageControlOption::default(),
            finally: false,
            start_time: None,
            end_time: None,
        }
    }
}

/// Routing info used to address a VM-backed container's agent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchInfo {
    /// Build-resource type (docker, pool, third-party agent...).
    pub dispatch_type: String,
    /// Message-queue route suffix for the dispatcher owning this type.
    pub route_key_suffix: Option<String>,
}

/// How a container gets its build environment.
///
/// Shutdown on cancellation differs per kind, so the routing payload is
/// carried on the variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ContainerKind {
    /// Runs on a build machine that must be shut down through its agent.
    Vm {
        /// Dispatch routing for the agent.
        dispatch: DispatchInfo,
    },
    /// Runs without a build environment.
    Normal,
}

/// Raw mutex-group settings declared on a container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutexGroupSpec {
    /// Whether the mutex is enforced.
    pub enable: bool,
    /// Group name; may contain `${var}` references.
    pub mutex_group_name: Option<String>,
    /// Whether containers may queue when the group is busy.
    #[serde(default)]
    pub queue_enable: bool,
    /// Maximum queue length.
    #[serde(default)]
    pub queue: u32,
    /// Queue wait timeout in minutes; engine default when unset.
    #[serde(default)]
    pub timeout_minutes: Option<u32>,
}

/// A parallel unit of work inside a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    /// Owning build.
    pub build_id: String,
    /// Owning stage.
    pub stage_id: String,
    /// Container sequence id, unique within the build.
    pub container_id: String,
    /// Environment kind.
    pub kind: ContainerKind,
    /// Current status.
    pub status: BuildStatus,
    /// Declared mutex group, if any.
    #[serde(default)]
    pub mutex_group: Option<MutexGroupSpec>,
    /// When the container started.
    pub start_time: Option<DateTime<Utc>>,
    /// When the container ended.
    pub end_time: Option<DateTime<Utc>>,
    /// Last heartbeat received from the worker.
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl Container {
    /// Creates a queued container of the given kind.
    #[must_use]
    pub fn new(
        build_id: impl Into<String>,
        stage_id: impl Into<String>,
        container_id: impl Into<String>,
        kind: ContainerKind,
    ) -> Self {
        Self {
            build_id: build_id.into(),
            stage_id: stage_id.into(),
            container_id: container_id.into(),
            kind,
            status: BuildStatus::Queue,
            mutex_group: None,
            start_time: None,
            end_time: None,
            last_heartbeat: None,
        }
    }

    /// Returns the log tag of the container's start-VM step.
    #[must_use]
    pub fn start_vm_tag(&self) -> String {
        format!("startVM-{}", self.container_id)
    }
}

/// Per-element options controlling failure and timeout handling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementAdditionalOptions {
    /// Whether the element runs.
    #[serde(default = "default_true")]
    pub enable: bool,
    /// Keep going when the element fails.
    #[serde(default)]
    pub continue_when_failed: bool,
    /// With `continue_when_failed`, wait for a manual skip instead of continuing.
    #[serde(default)]
    pub manual_skip: Option<bool>,
    /// Allow a manual retry after failure.
    #[serde(default = "default_true")]
    pub manual_retry: bool,
    /// Timeout in minutes.
    #[serde(default = "default_task_timeout")]
    pub timeout: Option<u64>,
    /// Overlay `custom_env` onto build variables.
    #[serde(default)]
    pub enable_custom_env: bool,
    /// Custom environment overlay.
    #[serde(default)]
    pub custom_env: Vec<(String, String)>,
}

#[allow(clippy::unnecessary_wraps)]
const fn default_task_timeout() -> Option<u64> {
    Some(100)
}

impl Default for ElementAdditionalOptions {
    fn default() -> Self {
        Self {
            enable: true,
            continue_when_failed: false,
            manual_skip: None,
            manual_retry: true,
            timeout: default_task_timeout(),
            enable_custom_env: false,
            custom_env: Vec::new(),
        }
    }
}

/// A single step inside a container, executed by a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Owning build.
    pub build_id: String,
    /// Owning stage.
    pub stage_id: String,
    /// Owning container.
    pub container_id: String,
    /// Task identifier, unique within the build.
    pub task_id: String,
    /// Model element this task was created from.
    pub element_id: String,
    /// Position within the container; tasks run strictly in order.
    pub seq: u32,
    /// Element type, e.g. `linuxScript` or a market atom code.
    pub task_type: String,
    /// Element parameters handed to the worker.
    #[serde(default)]
    pub params: HashMap<String, serde_json::Value>,
    /// Failure and timeout handling.
    #[serde(default)]
    pub additional_options: ElementAdditionalOptions,
    /// Current status.
    pub status: BuildStatus,
    /// Error message reported by the worker, if any.
    pub error_msg: Option<String>,
    /// When the task started.
    pub start_time: Option<DateTime<Utc>>,
    /// When the task ended.
    pub end_time: Option<DateTime<Utc>>,
}

impl Task {
    /// Creates a queued task.
    #[must_use]
    pub fn new(
        container: &Container,
        task_id: impl Into<String>,
        seq: u32,
        task_type: impl Into<String>,
    ) -> Self {
        let task_id = task_id.into();
        Self {
            build_id: container.build_id.clone(),
            stage_id: container.stage_id.clone(),
            container_id: container.container_id.clone(),
            element_id: format!("e-{task_id}"),
            task_id,
            seq,
            task_type: task_type.into(),
            params: HashMap::new(),
            additional_options: ElementAdditionalOptions::default(),
            status: BuildStatus::Queue,
            error_msg: None,
            start_time: None,
            end_time: None,
        }
    }
}
