//! Task protocol transitions: claim, complete, heartbeat, timeout, end.
//!
//! Workers call these through [`crate::worker::EngineBuildService`], which
//! holds the build lock. Redelivered calls re-read task state and become
//! no-ops, so a worker may retry any of them.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::{Engine, Transition};
use crate::core::{BuildStatus, Container, EventMeta, Task, StatusSwitcher};
use crate::errors::{EngineError, StoreError};
use crate::store::WriteBatch;
use crate::worker::task_util;

/// Answer to a worker asking for its next task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "task", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClaimOutcome {
    /// Run this task.
    Task(Box<Task>),
    /// Nothing runnable yet; ask again later.
    Wait,
    /// The container is done; the worker should end the build.
    End,
}

/// Result a worker reports for one task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    /// Task the result belongs to.
    pub task_id: String,
    /// Whether the task succeeded.
    pub success: bool,
    /// Failure message.
    #[serde(default)]
    pub error_msg: Option<String>,
    /// Monitor data collected during the attempt.
    #[serde(default)]
    pub monitor_data: HashMap<String, serde_json::Value>,
}

impl TaskResult {
    /// A successful result.
    #[must_use]
    pub fn success(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            success: true,
            ..Self::default()
        }
    }

    /// A failed result.
    #[must_use]
    pub fn failure(task_id: impl Into<String>, error_msg: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            success: false,
            error_msg: Some(error_msg.into()),
            ..Self::default()
        }
    }
}

/// Status a container ends with once none of its tasks can run.
///
/// Failures of continue-on-failure tasks do not fail the container.
fn container_outcome(tasks: &[Task]) -> BuildStatus {
    let blocking = tasks
        .iter()
        .find(|t| (t.status.is_failure() || t.status.is_cancel()) && !task_util::is_continue_when_failed(t));
    blocking.map_or(BuildStatus::Succeed, |t| t.status)
}

/// Marks every task that never ran as `Unexec`.
fn unexec_remaining(tasks: &[Task], batch: &mut WriteBatch) {
    for task in tasks.iter().filter(|t| !t.status.is_finish()) {
        let mut skipped = task.clone();
        skipped.status = StatusSwitcher::task_cancel(task.status);
        skipped.end_time = Some(Utc::now());
        batch.put_task(skipped);
    }
}

impl Engine {
    async fn load_worker_container(
        &self,
        meta: &EventMeta,
        stage_id: &str,
        container_id: &str,
    ) -> Result<Result<(crate::core::Build, Container), String>, EngineError> {
        let build = self.load_build(&meta.build_id).await?;
        if build.is_finished() {
            return Ok(Err(format!("build already {}", build.status)));
        }
        let container = self.load_container(&meta.build_id, stage_id, container_id).await?;
        if container.status.is_finish() {
            return Ok(Err(format!(
                "container {container_id} already {}",
                container.status
            )));
        }
        Ok(Ok((build, container)))
    }

    /// Hands the worker its next task, in sequence order.
    ///
    /// A task already RUNNING is handed out again, so a redelivered claim
    /// returns the same task. Disabled tasks are skipped on the way.
    pub async fn claim_task(
        &self,
        meta: &EventMeta,
        stage_id: &str,
        container_id: &str,
    ) -> Result<ClaimOutcome, EngineError> {
        let (build, container) = match self.load_worker_container(meta, stage_id, container_id).await? {
            Ok(pair) => pair,
            Err(reason) => {
                tracing::debug!(build_id = %meta.build_id, container_id, reason, "Claim ended");
                return Ok(ClaimOutcome::End);
            }
        };
        if !container.status.is_running() {
            return Ok(ClaimOutcome::Wait);
        }

        let tasks = self.store.list_tasks(&build.build_id, container_id).await?;
        if let Some(running) = tasks.iter().find(|t| t.status.is_running()) {
            return Ok(ClaimOutcome::Task(Box::new(running.clone())));
        }

        let mut batch = WriteBatch::new();
        let now = Utc::now();
        let mut claimed = None;
        for task in tasks.iter().filter(|t| t.status.is_ready_to_run()) {
            if !task.additional_options.enable {
                let mut skipped = task.clone();
                skipped.status = BuildStatus::Skip;
                skipped.end_time = Some(now);
                batch.put_task(skipped);
                continue;
            }
            let mut running = task.clone();
            running.status = BuildStatus::Running;
            running.start_time = Some(now);
            batch.put_task(running.clone());
            claimed = Some(running);
            break;
        }
        self.commit(batch).await?;

        match claimed {
            Some(task) => {
                tracing::info!(
                    build_id = %build.build_id,
                    container_id,
                    task_id = %task.task_id,
                    "Task claimed"
                );
                Ok(ClaimOutcome::Task(Box::new(task)))
            }
            None => Ok(ClaimOutcome::End),
        }
    }

    /// Records a task result and finishes the container once no task can run.
    pub async fn complete_task(
        &self,
        meta: &EventMeta,
        stage_id: &str,
        container_id: &str,
        result: &TaskResult,
    ) -> Result<Transition, EngineError> {
        let (build, container) = match self.load_worker_container(meta, stage_id, container_id).await? {
            Ok(pair) => pair,
            Err(reason) => return Ok(Transition::Discarded(reason)),
        };
        let mut tasks = self.store.list_tasks(&build.build_id, container_id).await?;
        let Some(index) = tasks.iter().position(|t| t.task_id == result.task_id) else {
            return Err(StoreError::not_found("task", format!("{}/{}", build.build_id, result.task_id)).into());
        };
        if tasks[index].status.is_finish() {
            return Ok(Transition::discarded(format!(
                "task {} already {}",
                result.task_id, tasks[index].status
            )));
        }

        let task = &mut tasks[index];
        task.status = if result.success {
            BuildStatus::Succeed
        } else {
            BuildStatus::Failed
        };
        task.error_msg.clone_from(&result.error_msg);
        task.end_time = Some(Utc::now());
        let blocked = !result.success && !task_util::is_continue_when_failed(task);

        let mut batch = WriteBatch::new();
        batch.put_task(task.clone());
        tracing::info!(
            build_id = %build.build_id,
            container_id,
            task_id = %result.task_id,
            status = %task.status,
            monitor_keys = result.monitor_data.len(),
            "Task completed"
        );

        let runnable = tasks.iter().any(|t| t.status.is_ready_to_run());
        if blocked || !runnable {
            unexec_remaining(&tasks, &mut batch);
            let status = container_outcome(&tasks);
            self.close_container(meta, &build, &container, status, batch, "task_complete")
                .await?;
        } else {
            self.commit(batch).await?;
        }
        Ok(Transition::APPLIED)
    }

    /// Stamps the container's liveness.
    pub async fn heartbeat(
        &self,
        meta: &EventMeta,
        stage_id: &str,
        container_id: &str,
    ) -> Result<Transition, EngineError> {
        let (_, container) = match self.load_worker_container(meta, stage_id, container_id).await? {
            Ok(pair) => pair,
            Err(reason) => return Ok(Transition::Discarded(reason)),
        };
        let mut alive = container;
        alive.last_heartbeat = Some(Utc::now());
        let mut batch = WriteBatch::new();
        batch.put_container(alive);
        self.commit(batch).await?;
        Ok(Transition::APPLIED)
    }

    /// Fails the running task and its container with `EXEC_TIMEOUT`.
    pub async fn timeout_container(
        &self,
        meta: &EventMeta,
        stage_id: &str,
        container_id: &str,
    ) -> Result<Transition, EngineError> {
        let (build, container) = match self.load_worker_container(meta, stage_id, container_id).await? {
            Ok(pair) => pair,
            Err(reason) => return Ok(Transition::Discarded(reason)),
        };
        let mut tasks = self.store.list_tasks(&build.build_id, container_id).await?;
        let now = Utc::now();
        for task in tasks.iter_mut().filter(|t| t.status.is_running()) {
            task.status = BuildStatus::ExecTimeout;
            task.end_time = Some(now);
        }

        let mut batch = WriteBatch::new();
        for task in tasks.iter().filter(|t| t.status == BuildStatus::ExecTimeout) {
            batch.put_task(task.clone());
        }
        unexec_remaining(&tasks, &mut batch);
        tracing::warn!(build_id = %build.build_id, container_id, "Container execution timed out");
        self.close_container(meta, &build, &container, BuildStatus::ExecTimeout, batch, "task_timeout")
            .await?;
        Ok(Transition::APPLIED)
    }

    /// Ends the container when its worker exits.
    ///
    /// Tasks still unfinished are marked `Unexec`; the container status is
    /// derived from the tasks that ran.
    pub async fn end_container(
        &self,
        meta: &EventMeta,
        stage_id: &str,
        container_id: &str,
    ) -> Result<Transition, EngineError> {
        let (build, container) = match self.load_worker_container(meta, stage_id, container_id).await? {
            Ok(pair) => pair,
            Err(reason) => return Ok(Transition::Discarded(reason)),
        };
        let tasks = self.store.list_tasks(&build.build_id, container_id).await?;
        let mut batch = WriteBatch::new();
        let status = if tasks.iter().any(|t| t.status.is_running()) {
            BuildStatus::Failed
        } else {
            container_outcome(&tasks)
        };
        unexec_remaining(&tasks, &mut batch);
        self.close_container(meta, &build, &container, status, batch, "worker_end")
            .await?;
        Ok(Transition::APPLIED)
    }
}
