//! Engine events: inbound commands and outbound notifications.
//!
//! Events are commands and triggers, never the record of truth; the state
//! store holds the authoritative build state. Every event carries an
//! [`EventMeta`] so handlers can derive the build lock key and log with
//! full context.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::BuildStatus;

/// What a stage event asks the stage controller to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionType {
    /// Advance the stage according to its current state.
    Refresh,
    /// Bring the stage to an end and move on (runs `finally` stages).
    End,
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Refresh => write!(f, "REFRESH"),
            Self::End => write!(f, "END"),
        }
    }
}

/// Which UI views a websocket push should refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RefreshType {
    /// Build detail page.
    Detail,
    /// Build history list.
    History,
    /// Build status badge.
    Status,
}

/// Correlation fields shared by every event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMeta {
    /// Component or action that produced the event.
    pub source: String,
    /// Owning project.
    pub project_id: String,
    /// Owning pipeline.
    pub pipeline_id: String,
    /// Target build.
    pub build_id: String,
    /// User on whose behalf the event was produced.
    pub user_id: String,
    /// Request-scoped trace id, propagated to follow-up events.
    pub trace_id: String,
}

impl EventMeta {
    /// Creates metadata with a fresh trace id.
    #[must_use]
    pub fn new(
        source: impl Into<String>,
        project_id: impl Into<String>,
        pipeline_id: impl Into<String>,
        build_id: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            project_id: project_id.into(),
            pipeline_id: pipeline_id.into(),
            build_id: build_id.into(),
            user_id: user_id.into(),
            trace_id: crate::utils::generate_trace_id(),
        }
    }

    /// Derives metadata for a follow-up event, keeping ids and trace id.
    #[must_use]
    pub fn follow_up(&self, source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            ..self.clone()
        }
    }
}

/// Request to cancel a whole build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildCancelEvent {
    /// Correlation fields.
    pub meta: EventMeta,
    /// Status the build should end with (usually `Canceled`).
    pub status: BuildStatus,
}

/// Operator command against one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageCommand {
    /// Start a paused or manual-trigger stage.
    Start,
    /// Pause a stage on its review gate.
    Pause,
    /// Skip a paused stage.
    Skip,
    /// Cancel a stage and let `finally` stages run.
    Cancel,
}

impl fmt::Display for StageCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start => write!(f, "start"),
            Self::Pause => write!(f, "pause"),
            Self::Skip => write!(f, "skip"),
            Self::Cancel => write!(f, "cancel"),
        }
    }
}

/// Inbound stage command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageCommandEvent {
    /// Correlation fields.
    pub meta: EventMeta,
    /// Target stage.
    pub stage_id: String,
    /// What to do with it.
    pub command: StageCommand,
}

/// Stage advancement trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageEvent {
    /// Correlation fields.
    pub meta: EventMeta,
    /// Target stage.
    pub stage_id: String,
    /// Requested action.
    pub action_type: ActionType,
}

/// Request to finish a build with the given status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildFinishEvent {
    /// Correlation fields.
    pub meta: EventMeta,
    /// Final status requested.
    pub status: BuildStatus,
}

/// Shutdown signal for the agent of a VM-backed container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentShutdownEvent {
    /// Correlation fields.
    pub meta: EventMeta,
    /// Container sequence id.
    pub vm_seq_id: String,
    /// Dispatcher route suffix.
    pub route_key_suffix: Option<String>,
    /// Build execution count.
    pub execute_count: u32,
    /// Whether the build result should be reported.
    pub build_result: bool,
}

/// Shutdown signal for an environment-less container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildLessShutdownEvent {
    /// Correlation fields.
    pub meta: EventMeta,
    /// Container sequence id.
    pub vm_seq_id: String,
    /// Build execution count.
    pub execute_count: u32,
    /// Whether the build result should be reported.
    pub build_result: bool,
}

/// Best-effort UI refresh hint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebSocketPushEvent {
    /// Correlation fields.
    pub meta: EventMeta,
    /// Views to refresh.
    pub refresh_type: RefreshType,
}

/// Every event the engine consumes or publishes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineEvent {
    /// Cancel a build.
    CancelBuild(BuildCancelEvent),
    /// Operator stage command.
    StageCommand(StageCommandEvent),
    /// Stage advancement trigger.
    Stage(StageEvent),
    /// Finish a build.
    BuildFinish(BuildFinishEvent),
    /// Shut down a VM agent.
    AgentShutdown(AgentShutdownEvent),
    /// Shut down an environment-less container.
    BuildLessShutdown(BuildLessShutdownEvent),
    /// UI refresh hint.
    WebSocketPush(WebSocketPushEvent),
}

impl PipelineEvent {
    /// Returns the event's correlation fields.
    #[must_use]
    pub const fn meta(&self) -> &EventMeta {
        match self {
            Self::CancelBuild(e) => &e.meta,
            Self::StageCommand(e) => &e.meta,
            Self::Stage(e) => &e.meta,
            Self::BuildFinish(e) => &e.meta,
            Self::AgentShutdown(e) => &e.meta,
            Self::BuildLessShutdown(e) => &e.meta,
            Self::WebSocketPush(e) => &e.meta,
        }
    }

    /// Returns the target build id.
    #[must_use]
    pub fn build_id(&self) -> &str {
        &self.meta().build_id
    }

    /// Returns a short, stable name for logging.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::CancelBuild(_) => "build.cancel",
            Self::StageCommand(_) => "stage.command",
            Self::Stage(_) => "stage.event",
            Self::BuildFinish(_) => "build.finish",
            Self::AgentShutdown(_) => "agent.shutdown",
            Self::BuildLessShutdown(_) => "buildless.shutdown",
            Self::WebSocketPush(_) => "websocket.push",
        }
    }

    /// Creates a stage event.
    #[must_use]
    pub fn stage(meta: EventMeta, stage_id: impl Into<String>, action_type: ActionType) -> Self {
        Self::Stage(StageEvent {
            meta,
            stage_id: stage_id.into(),
            action_type,
        })
    }

    /// Creates a build-finish event.
    #[must_use]
    pub const fn build_finish(meta: EventMeta, status: BuildStatus) -> Self {
        Self::BuildFinish(BuildFinishEvent { meta, status })
    }

    /// Creates a websocket push hint.
    #[must_use]
    pub const fn websocket_push(meta: EventMeta, refresh_type: RefreshType) -> Self {
        Self::WebSocketPush(WebSocketPushEvent { meta, refresh_type })
    }
}
