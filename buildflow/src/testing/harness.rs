//! In-process engine wiring for tests.

use std::sync::Arc;

use crate::config::{HandlerConfig, LockConfig, MutexConfig};
use crate::core::{Build, Container, PipelineEvent, Stage, Task};
use crate::dispatch::CollectingDispatcher;
use crate::engine::Engine;
use crate::errors::EngineError;
use crate::handlers::{EngineHandlers, HandleOutcome};
use crate::lock::{BuildIdLock, InMemoryLockBackend};
use crate::measure::{MeasureService, NoOpMeasureService};
use crate::mutex::MutexGroupController;
use crate::store::{InMemoryStateStore, StateStore};
use crate::worker::EngineBuildService;

use super::BuildFixture;

/// An engine wired to in-memory collaborators.
///
/// Published events are collected instead of delivered; [`Self::pump`]
/// feeds them back through the handlers until none remain.
#[derive(Debug, Clone)]
pub struct EngineHarness {
    /// The state store.
    pub store: Arc<InMemoryStateStore>,
    /// Collected outbound events.
    pub dispatcher: Arc<CollectingDispatcher>,
    /// The mutex group controller.
    pub mutex: Arc<MutexGroupController>,
    /// The lock backend.
    pub lock_backend: Arc<InMemoryLockBackend>,
    /// Handlers routing events to the engine.
    pub handlers: EngineHandlers,
}

impl Default for EngineHarness {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineHarness {
    /// Creates a harness with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::with_measure(Arc::new(NoOpMeasureService))
    }

    /// Creates a harness reporting cancellations to `measure`.
    #[must_use]
    pub fn with_measure(measure: Arc<dyn MeasureService>) -> Self {
        let store = Arc::new(InMemoryStateStore::new());
        let dispatcher = Arc::new(CollectingDispatcher::new());
        let mutex = Arc::new(MutexGroupController::new(MutexConfig::default()));
        let lock_backend = Arc::new(InMemoryLockBackend::new());
        let engine = Engine::new(store.clone(), dispatcher.clone(), mutex.clone());
        let lock = BuildIdLock::new(lock_backend.clone(), LockConfig::default());
        let handlers = EngineHandlers::new(engine, lock, measure, HandlerConfig::default());
        Self {
            store,
            dispatcher,
            mutex,
            lock_backend,
            handlers,
        }
    }

    /// The engine.
    #[must_use]
    pub fn engine(&self) -> &Engine {
        self.handlers.engine()
    }

    /// A worker-protocol service over this engine.
    #[must_use]
    pub fn build_service(&self) -> EngineBuildService {
        EngineBuildService::new(self.handlers.clone())
    }

    /// Seeds a fixture into the store.
    pub async fn seed(&self, fixture: BuildFixture) -> Result<(), EngineError> {
        fixture.seed(self.store.as_ref()).await
    }

    /// Handles one event.
    pub async fn handle(&self, event: PipelineEvent) -> HandleOutcome {
        self.handlers.handle(event).await
    }

    /// Handles collected events until none remain, returning every event handled.
    ///
    /// Stops after `limit` events to catch dispatch loops.
    pub async fn pump(&self, limit: usize) -> Vec<PipelineEvent> {
        let mut handled = Vec::new();
        while handled.len() < limit {
            let pending = self.dispatcher.drain();
            if pending.is_empty() {
                break;
            }
            for event in pending {
                self.handlers.handle(event.clone()).await;
                handled.push(event);
            }
        }
        handled
    }

    /// Loads a build.
    pub async fn build(&self, build_id: &str) -> Build {
        self.store
            .get_build(build_id)
            .await
            .ok()
            .flatten()
            .unwrap_or_else(|| panic!("build {build_id} not seeded"))
    }

    /// Loads a stage.
    pub async fn stage(&self, build_id: &str, stage_id: &str) -> Stage {
        self.store
            .get_stage(build_id, stage_id)
            .await
            .ok()
            .flatten()
            .unwrap_or_else(|| panic!("stage {build_id}/{stage_id} not seeded"))
    }

    /// Loads a container.
    pub async fn container(&self, build_id: &str, stage_id: &str, container_id: &str) -> Container {
        self.store
            .get_container(build_id, stage_id, container_id)
            .await
            .ok()
            .flatten()
            .unwrap_or_else(|| panic!("container {build_id}/{stage_id}/{container_id} not seeded"))
    }

    /// Loads a container's tasks in sequence order.
    pub async fn tasks(&self, build_id: &str, container_id: &str) -> Vec<Task> {
        self.store
            .list_tasks(build_id, container_id)
            .await
            .unwrap_or_default()
    }
}
