//! Core domain model types for buildflow.
//!
//! This module contains the fundamental types used throughout the engine:
//! - The shared build status enum and its switch policy
//! - Build, stage, container and task records
//! - Inbound commands and outbound events

mod event;
mod model;
mod status;

pub use event::{
    ActionType, AgentShutdownEvent, BuildCancelEvent, BuildFinishEvent, BuildLessShutdownEvent,
    EventMeta, PipelineEvent, RefreshType, StageCommand, StageCommandEvent, StageEvent,
    WebSocketPushEvent,
};
pub use model::{
    Build, Container, ContainerKind, DispatchInfo, ElementAdditionalOptions, MutexGroupSpec,
    Stage, StageControlOption, Task,
};
pub use status::{BuildStatus, StatusSwitcher, UnknownStatus};
