//! Engine side of the worker task protocol.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use crate::core::EventMeta;
use crate::engine::{ClaimOutcome, ContainerStart, TaskResult, Transition};
use crate::errors::EngineError;
use crate::handlers::EngineHandlers;
use crate::observability::Watcher;

/// Identifies the container a worker runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerKey {
    /// Correlation fields of the build.
    pub meta: EventMeta,
    /// Owning stage.
    pub stage_id: String,
    /// The container.
    pub container_id: String,
}

impl WorkerKey {
    /// Creates a key.
    #[must_use]
    pub fn new(meta: EventMeta, stage_id: impl Into<String>, container_id: impl Into<String>) -> Self {
        Self {
            meta,
            stage_id: stage_id.into(),
            container_id: container_id.into(),
        }
    }

    fn build_id(&self) -> &str {
        &self.meta.build_id
    }
}

/// What a worker needs to know once its container started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildVariables {
    /// Build being executed.
    pub build_id: String,
    /// Owning project.
    pub project_id: String,
    /// Owning pipeline.
    pub pipeline_id: String,
    /// Owning stage.
    pub stage_id: String,
    /// The started container.
    pub container_id: String,
    /// Build execution count.
    pub execute_count: u32,
    /// Build variables.
    pub variables: HashMap<String, String>,
}

/// The calls a worker makes against the engine.
///
/// Every call is safe to repeat.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BuildService: Send + Sync {
    /// Reports the container started; returns its build variables.
    async fn set_started(&self, key: &WorkerKey) -> Result<BuildVariables, EngineError>;

    /// Claims the next task.
    async fn claim_task(&self, key: &WorkerKey) -> Result<ClaimOutcome, EngineError>;

    /// Reports a task result.
    async fn complete_task(&self, key: &WorkerKey, result: &TaskResult) -> Result<(), EngineError>;

    /// Reports liveness. Returns false once the container no longer runs.
    async fn heartbeat(&self, key: &WorkerKey) -> Result<bool, EngineError>;

    /// Reports that the running task exceeded its timeout.
    async fn timeout(&self, key: &WorkerKey) -> Result<(), EngineError>;

    /// Reports that the worker is exiting.
    async fn end_build(&self, key: &WorkerKey) -> Result<(), EngineError>;
}

/// [`BuildService`] backed by an in-process engine.
///
/// Each call runs under the build lock, like any other engine operation.
#[derive(Debug, Clone)]
pub struct EngineBuildService {
    handlers: EngineHandlers,
    slow: Duration,
}

impl EngineBuildService {
    /// Creates the service.
    #[must_use]
    pub fn new(handlers: EngineHandlers) -> Self {
        Self {
            handlers,
            slow: Duration::from_secs(1),
        }
    }

    async fn locked<T, F, Fut>(&self, operation: &str, key: &WorkerKey, f: F) -> Result<T, EngineError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        let mut watcher = Watcher::new(format!("worker.{operation}:{}", key.build_id()));
        let result = self.handlers.with_build_lock(key.build_id(), &mut watcher, f).await;
        watcher.finish(self.slow);
        if let Err(e) = &result {
            tracing::warn!(
                build_id = %key.build_id(),
                container_id = %key.container_id,
                operation,
                retryable = e.is_retryable(),
                error = %e,
                "Worker call failed"
            );
        }
        result
    }
}

#[async_trait]
impl BuildService for EngineBuildService {
    async fn set_started(&self, key: &WorkerKey) -> Result<BuildVariables, EngineError> {
        let engine = self.handlers.engine();
        let started = self
            .locked("set_started", key, || {
                engine.start_container(&key.meta, &key.stage_id, &key.container_id)
            })
            .await?;
        if let Transition::Discarded(reason) = &started {
            return Err(EngineError::remote("set_started", reason.clone(), false));
        }
        if started == Transition::Applied(ContainerStart::AlreadyRunning) {
            tracing::debug!(build_id = %key.build_id(), container_id = %key.container_id, "Container start redelivered");
        }

        let build = engine
            .store()
            .get_build(key.build_id())
            .await?
            .ok_or_else(|| crate::errors::StoreError::not_found("build", key.build_id()))?;
        Ok(BuildVariables {
            build_id: build.build_id,
            project_id: build.project_id,
            pipeline_id: build.pipeline_id,
            stage_id: key.stage_id.clone(),
            container_id: key.container_id.clone(),
            execute_count: build.execute_count,
            variables: build.variables,
        })
    }

    async fn claim_task(&self, key: &WorkerKey) -> Result<ClaimOutcome, EngineError> {
        let engine = self.handlers.engine();
        self.locked("claim_task", key, || {
            engine.claim_task(&key.meta, &key.stage_id, &key.container_id)
        })
        .await
    }

    async fn complete_task(&self, key: &WorkerKey, result: &TaskResult) -> Result<(), EngineError> {
        let engine = self.handlers.engine();
        let transition = self
            .locked("complete_task", key, || {
                engine.complete_task(&key.meta, &key.stage_id, &key.container_id, result)
            })
            .await?;
        if let Some(reason) = transition.discard_reason() {
            tracing::debug!(build_id = %key.build_id(), task_id = %result.task_id, reason, "Task result ignored");
        }
        Ok(())
    }

    async fn heartbeat(&self, key: &WorkerKey) -> Result<bool, EngineError> {
        let engine = self.handlers.engine();
        let transition = self
            .locked("heartbeat", key, || {
                engine.heartbeat(&key.meta, &key.stage_id, &key.container_id)
            })
            .await?;
        Ok(transition.is_applied())
    }

    async fn timeout(&self, key: &WorkerKey) -> Result<(), EngineError> {
        let engine = self.handlers.engine();
        self.locked("timeout", key, || {
            engine.timeout_container(&key.meta, &key.stage_id, &key.container_id)
        })
        .await?;
        Ok(())
    }

    async fn end_build(&self, key: &WorkerKey) -> Result<(), EngineError> {
        let engine = self.handlers.engine();
        self.locked("end_build", key, || {
            engine.end_container(&key.meta, &key.stage_id, &key.container_id)
        })
        .await?;
        Ok(())
    }
}
