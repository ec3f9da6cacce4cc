//! Idempotent message handlers.
//!
//! Every inbound event is handled under the build lock of its target build.
//! A handler never fails its caller: lock contention drops the event for
//! redelivery, engine errors are logged with context and swallowed, and the
//! lock is released on every path that returns.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::config::HandlerConfig;
use crate::core::PipelineEvent;
use crate::engine::{CascadeReport, Engine, Transition};
use crate::errors::EngineError;
use crate::lock::BuildIdLock;
use crate::measure::{report_cancel, MeasureService};
use crate::observability::Watcher;

/// What happened to one inbound event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandleOutcome {
    /// The engine changed state.
    Applied,
    /// The engine re-checked state and ignored the event.
    Discarded(String),
    /// The build lock could not be acquired; the event was dropped.
    Dropped(String),
    /// The operation failed; the error was logged and swallowed.
    Failed(String),
    /// The event is outbound-only and has no handler here.
    Ignored,
}

impl HandleOutcome {
    fn from_transition<T>(transition: &Transition<T>) -> Self {
        match transition.discard_reason() {
            None => Self::Applied,
            Some(reason) => Self::Discarded(reason.to_string()),
        }
    }
}

/// Routes inbound events to the engine, one build lock per event.
#[derive(Clone)]
pub struct EngineHandlers {
    engine: Engine,
    lock: BuildIdLock,
    measure: Arc<dyn MeasureService>,
    config: HandlerConfig,
}

impl std::fmt::Debug for EngineHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHandlers")
            .field("lock", &self.lock)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl EngineHandlers {
    /// Creates handlers around an engine.
    #[must_use]
    pub fn new(
        engine: Engine,
        lock: BuildIdLock,
        measure: Arc<dyn MeasureService>,
        config: HandlerConfig,
    ) -> Self {
        Self {
            engine,
            lock,
            measure,
            config,
        }
    }

    /// The wrapped engine.
    #[must_use]
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// The build lock used by every handler.
    #[must_use]
    pub fn lock(&self) -> &BuildIdLock {
        &self.lock
    }

    /// Handles one event. Never returns an error.
    pub async fn handle(&self, event: PipelineEvent) -> HandleOutcome {
        let build_id = event.build_id().to_string();
        let kind = event.kind();
        let mut watcher = Watcher::new(format!("{kind}:{build_id}"));

        let outcome = match &event {
            PipelineEvent::CancelBuild(cancel) => {
                let result = self
                    .with_build_lock(&build_id, &mut watcher, || self.engine.cancel_build(cancel))
                    .await;
                // Reported outside the lock; failures never reach the caller.
                if let Ok(Transition::Applied(CascadeReport { measure, .. })) = &result {
                    report_cancel(self.measure.as_ref(), measure.clone()).await;
                }
                Self::settle(&event, result)
            }
            PipelineEvent::StageCommand(command) => {
                let result = self
                    .with_build_lock(&build_id, &mut watcher, || {
                        self.engine.handle_stage_command(command)
                    })
                    .await;
                Self::settle(&event, result)
            }
            PipelineEvent::Stage(stage) => {
                let result = self
                    .with_build_lock(&build_id, &mut watcher, || self.engine.handle_stage_event(stage))
                    .await;
                Self::settle(&event, result)
            }
            PipelineEvent::BuildFinish(finish) => {
                let result = self
                    .with_build_lock(&build_id, &mut watcher, || self.engine.finish_build(finish))
                    .await;
                Self::settle(&event, result)
            }
            PipelineEvent::AgentShutdown(_)
            | PipelineEvent::BuildLessShutdown(_)
            | PipelineEvent::WebSocketPush(_) => {
                tracing::debug!(build_id = %build_id, kind, "Outbound event has no engine handler");
                HandleOutcome::Ignored
            }
        };

        watcher.finish(Duration::from_millis(self.config.slow_handler_ms));
        outcome
    }

    /// Runs `operation` while holding the build lock for `build_id`.
    ///
    /// The lock is released whether the operation succeeds or fails. A
    /// future dropped mid-operation leaves the lease to expire on its own.
    pub async fn with_build_lock<T, F, Fut>(
        &self,
        build_id: &str,
        watcher: &mut Watcher,
        operation: F,
    ) -> Result<T, EngineError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        watcher.start("lock");
        let token = self.lock.acquire(build_id).await?;

        watcher.start("execute");
        let result = operation().await;
        watcher.stop();

        if let Err(e) = self.lock.release(&token).await {
            tracing::error!(build_id, error = %e, "Failed to release build lock");
        }
        result
    }

    fn settle<T>(
        event: &PipelineEvent,
        result: Result<Transition<T>, EngineError>,
    ) -> HandleOutcome {
        let meta = event.meta();
        match result {
            Ok(transition) => {
                if let Some(reason) = transition.discard_reason() {
                    tracing::info!(
                        build_id = %meta.build_id,
                        kind = event.kind(),
                        source = %meta.source,
                        reason,
                        "Event discarded"
                    );
                }
                HandleOutcome::from_transition(&transition)
            }
            Err(EngineError::Lock(e)) => {
                tracing::warn!(
                    build_id = %meta.build_id,
                    kind = event.kind(),
                    source = %meta.source,
                    error = %e,
                    "Build lock unavailable, event dropped"
                );
                HandleOutcome::Dropped(e.to_string())
            }
            Err(e) => {
                tracing::error!(
                    build_id = %meta.build_id,
                    kind = event.kind(),
                    source = %meta.source,
                    user_id = %meta.user_id,
                    status = ?event_status(event),
                    retryable = e.is_retryable(),
                    error = %e,
                    "Event handling failed"
                );
                HandleOutcome::Failed(e.to_string())
            }
        }
    }

    /// Consumes events until the channel closes. Returns how many were handled.
    pub async fn run_event_loop(&self, mut receiver: mpsc::Receiver<PipelineEvent>) -> usize {
        let mut handled = 0;
        while let Some(event) = receiver.recv().await {
            self.handle(event).await;
            handled += 1;
        }
        tracing::info!(handled, "Event loop stopped");
        handled
    }
}

fn event_status(event: &PipelineEvent) -> Option<crate::core::BuildStatus> {
    match event {
        PipelineEvent::CancelBuild(e) => Some(e.status),
        PipelineEvent::BuildFinish(e) => Some(e.status),
        _ => None,
    }
}
