//! # Buildflow
//!
//! The orchestration core of a CI/CD build engine.
//!
//! Buildflow drives a build through its stages and containers and keeps
//! its persisted state consistent under concurrent, reordered and
//! duplicated events:
//!
//! - **Stage state machine**: start, pause, skip and cancel with
//!   status-conditional build updates and running-count accounting
//! - **Cancellation cascade**: stops every container of a build, releases
//!   mutex groups and still runs `finally` stages
//! - **Build lock**: a per-build lease serializing every state mutation
//! - **Mutex groups**: cross-build exclusion with FIFO queueing
//! - **Worker protocol**: idempotent task claim and completion
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use buildflow::prelude::*;
//!
//! let harness = EngineHarness::new();
//! harness
//!     .seed(
//!         BuildFixture::new("b-1")
//!             .stage("s-1", BuildStatus::Running)
//!             .container("s-1", "1", BuildStatus::Running),
//!     )
//!     .await?;
//!
//! let cancel = BuildCancelEvent {
//!     meta: EventMeta::new("user", "proj", "pipe", "b-1", "alice"),
//!     status: BuildStatus::Canceled,
//! };
//! harness.handle(PipelineEvent::CancelBuild(cancel)).await;
//! harness.pump(64).await;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod config;
pub mod core;
pub mod dispatch;
pub mod engine;
pub mod errors;
pub mod handlers;
pub mod lock;
pub mod measure;
pub mod mutex;
pub mod observability;
pub mod store;
pub mod testing;
pub mod utils;
pub mod worker;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{EngineConfig, HandlerConfig, LockConfig, LogConfig, MutexConfig};
    pub use crate::core::{
        ActionType, Build, BuildCancelEvent, BuildFinishEvent, BuildStatus, Container,
        ContainerKind, EventMeta, PipelineEvent, RefreshType, Stage, StageCommand,
        StageCommandEvent, StageEvent, StatusSwitcher, Task,
    };
    pub use crate::dispatch::{
        ChannelDispatcher, CollectingDispatcher, EventDispatcher, LoggingDispatcher,
    };
    pub use crate::engine::{CascadeReport, ClaimOutcome, Continuation, Engine, TaskResult, Transition};
    pub use crate::errors::{DispatchError, EngineError, LockError, MutexError, StoreError};
    pub use crate::handlers::{EngineHandlers, HandleOutcome};
    pub use crate::lock::{BuildIdLock, InMemoryLockBackend, LockBackend, LockToken};
    pub use crate::measure::{LoggingMeasureService, MeasureService, NoOpMeasureService};
    pub use crate::mutex::{MutexAcquire, MutexGroup, MutexGroupController, MutexOwner};
    pub use crate::observability::{init_logging, Watcher};
    pub use crate::store::{InMemoryStateStore, StateStore, WriteBatch};
    pub use crate::testing::{BuildFixture, EngineHarness};
    pub use crate::utils::generate_trace_id;
    pub use crate::worker::{
        BuildService, BuildVariables, EngineBuildService, RetryConfig, TaskAttempt, TaskExecutor,
        WorkerKey, WorkerSession,
    };
}
