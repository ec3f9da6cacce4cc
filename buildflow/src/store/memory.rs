//! In-memory state store.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use super::{
    ApplyReport, BuildDetail, BuildSummary, StateStore, StoreOp, WriteBatch,
};
use crate::core::{Build, Container, Stage, Task};
use crate::errors::StoreError;

type StageKey = (String, String);
type ContainerKey = (String, String, String);
type TaskKey = (String, String);

#[derive(Debug, Default)]
struct Tables {
    builds: HashMap<String, Build>,
    stages: HashMap<StageKey, Stage>,
    containers: HashMap<ContainerKey, Container>,
    tasks: HashMap<TaskKey, Task>,
    details: HashMap<String, BuildDetail>,
    summaries: HashMap<String, BuildSummary>,
}

impl Tables {
    fn adjust_summary(&mut self, project_id: &str, pipeline_id: &str, change: i64) {
        let summary = self
            .summaries
            .entry(pipeline_id.to_string())
            .or_insert_with(|| BuildSummary::new(project_id, pipeline_id));
        summary.running_count = clamp_count(i64::from(summary.running_count) + change);
    }

    fn apply_op(&mut self, op: StoreOp, report: &mut ApplyReport) {
        match op {
            StoreOp::PutBuild(build) => {
                let previous = self
                    .builds
                    .get(&build.build_id)
                    .map_or(0, |b| i64::from(b.running_count));
                self.adjust_summary(
                    &build.project_id,
                    &build.pipeline_id,
                    i64::from(build.running_count) - previous,
                );
                if let Some(summary) = self.summaries.get_mut(&build.pipeline_id) {
                    summary.latest_build_id = Some(build.build_id.clone());
                    summary.latest_status = Some(build.status);
                }
                self.details
                    .entry(build.build_id.clone())
                    .or_insert_with(|| BuildDetail::new(&build.build_id));
                self.builds.insert(build.build_id.clone(), build);
            }
            StoreOp::UpdateBuildStatus {
                build_id,
                expected,
                status,
            } => {
                let Some(build) = self.builds.get_mut(&build_id) else {
                    return;
                };
                if expected.is_some_and(|e| e != build.status) {
                    tracing::debug!(
                        build_id = %build_id,
                        current = %build.status,
                        expected = ?expected,
                        "Conditional build status update skipped"
                    );
                    report.cas_skipped += 1;
                    return;
                }
                build.status = status;
                if let Some(summary) = self.summaries.get_mut(&build.pipeline_id) {
                    if summary.latest_build_id.as_deref() == Some(build_id.as_str()) {
                        summary.latest_status = Some(status);
                    }
                }
            }
            StoreOp::AdjustRunningCount { build_id, delta } => {
                let Some(build) = self.builds.get_mut(&build_id) else {
                    return;
                };
                let old = i64::from(build.running_count);
                let wanted = old + i64::from(delta);
                if wanted < 0 {
                    tracing::warn!(
                        build_id = %build_id,
                        running_count = old,
                        delta,
                        "Running count would go negative, clamped at zero"
                    );
                    report.clamped += 1;
                }
                build.running_count = clamp_count(wanted);
                let change = i64::from(build.running_count) - old;
                let (project_id, pipeline_id) = (build.project_id.clone(), build.pipeline_id.clone());
                self.adjust_summary(&project_id, &pipeline_id, change);
            }
            StoreOp::SetRunningCount { build_id, count } => {
                let Some(build) = self.builds.get_mut(&build_id) else {
                    return;
                };
                let change = i64::from(count) - i64::from(build.running_count);
                build.running_count = count;
                let (project_id, pipeline_id) = (build.project_id.clone(), build.pipeline_id.clone());
                self.adjust_summary(&project_id, &pipeline_id, change);
            }
            StoreOp::FinishBuild {
                build_id,
                status,
                end_time,
            } => {
                if let Some(build) = self.builds.get_mut(&build_id) {
                    build.status = status;
                    build.end_time = Some(end_time);
                    if let Some(summary) = self.summaries.get_mut(&build.pipeline_id) {
                        if summary.latest_build_id.as_deref() == Some(build_id.as_str()) {
                            summary.latest_status = Some(status);
                        }
                    }
                }
            }
            StoreOp::PutStage(stage) => {
                self.stages
                    .insert((stage.build_id.clone(), stage.stage_id.clone()), stage);
            }
            StoreOp::PutContainer(container) => {
                self.containers.insert(
                    (
                        container.build_id.clone(),
                        container.stage_id.clone(),
                        container.container_id.clone(),
                    ),
                    container,
                );
            }
            StoreOp::PutTask(task) => {
                self.tasks
                    .insert((task.build_id.clone(), task.task_id.clone()), task);
            }
            StoreOp::RecordStageStatus {
                build_id,
                stage_id,
                seq,
                status,
            } => {
                self.details
                    .entry(build_id.clone())
                    .or_insert_with(|| BuildDetail::new(&build_id))
                    .record_stage(&stage_id, seq, status);
            }
            StoreOp::RecordCancel { build_id, info } => {
                let detail = self
                    .details
                    .entry(build_id.clone())
                    .or_insert_with(|| BuildDetail::new(&build_id));
                detail.updated_at = info.at;
                detail.cancel_info = Some(info);
            }
        }
        report.applied += 1;
    }
}

fn clamp_count(value: i64) -> u32 {
    u32::try_from(value.max(0)).unwrap_or(u32::MAX)
}

/// A [`StateStore`] held in process memory.
///
/// Batches are validated in full before any write lands, and the whole
/// batch commits under one write lock.
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    tables: RwLock<Tables>,
    fail_next: Mutex<Option<StoreError>>,
    commits: AtomicU64,
    clamped: AtomicU64,
}

impl InMemoryStateStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `apply` fail with `error` without writing anything.
    pub fn fail_next_apply(&self, error: StoreError) {
        *self.fail_next.lock() = Some(error);
    }

    /// Number of batches committed.
    #[must_use]
    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }

    /// Running-count changes clamped at zero since the store was created.
    ///
    /// Anything above zero means the count drifted below the containers
    /// and run slots it should hold.
    #[must_use]
    pub fn clamped_total(&self) -> u64 {
        self.clamped.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn get_build(&self, build_id: &str) -> Result<Option<Build>, StoreError> {
        Ok(self.tables.read().builds.get(build_id).cloned())
    }

    async fn get_stage(&self, build_id: &str, stage_id: &str) -> Result<Option<Stage>, StoreError> {
        Ok(self
            .tables
            .read()
            .stages
            .get(&(build_id.to_string(), stage_id.to_string()))
            .cloned())
    }

    async fn list_stages(&self, build_id: &str) -> Result<Vec<Stage>, StoreError> {
        let mut stages: Vec<Stage> = self
            .tables
            .read()
            .stages
            .values()
            .filter(|s| s.build_id == build_id)
            .cloned()
            .collect();
        stages.sort_by_key(|s| s.seq);
        Ok(stages)
    }

    async fn get_container(
        &self,
        build_id: &str,
        stage_id: &str,
        container_id: &str,
    ) -> Result<Option<Container>, StoreError> {
        Ok(self
            .tables
            .read()
            .containers
            .get(&(
                build_id.to_string(),
                stage_id.to_string(),
                container_id.to_string(),
            ))
            .cloned())
    }

    async fn list_containers(
        &self,
        build_id: &str,
        stage_id: Option<&str>,
    ) -> Result<Vec<Container>, StoreError> {
        let mut containers: Vec<Container> = self
            .tables
            .read()
            .containers
            .values()
            .filter(|c| c.build_id == build_id && stage_id.map_or(true, |s| c.stage_id == s))
            .cloned()
            .collect();
        containers.sort_by(|a, b| a.container_id.cmp(&b.container_id));
        Ok(containers)
    }

    async fn list_tasks(&self, build_id: &str, container_id: &str) -> Result<Vec<Task>, StoreError> {
        let mut tasks: Vec<Task> = self
            .tables
            .read()
            .tasks
            .values()
            .filter(|t| t.build_id == build_id && t.container_id == container_id)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.seq);
        Ok(tasks)
    }

    async fn get_detail(&self, build_id: &str) -> Result<Option<BuildDetail>, StoreError> {
        Ok(self.tables.read().details.get(build_id).cloned())
    }

    async fn get_summary(&self, pipeline_id: &str) -> Result<Option<BuildSummary>, StoreError> {
        Ok(self.tables.read().summaries.get(pipeline_id).cloned())
    }

    async fn apply(&self, batch: WriteBatch) -> Result<ApplyReport, StoreError> {
        let mut tables = self.tables.write();
        if let Some(error) = self.fail_next.lock().take() {
            return Err(error);
        }

        let ops = batch.into_ops();
        let mut created: HashSet<String> = HashSet::new();
        for op in &ops {
            let build_id = op.build_id();
            if let StoreOp::PutBuild(_) = op {
                created.insert(build_id.to_string());
            } else if !tables.builds.contains_key(build_id) && !created.contains(build_id) {
                return Err(StoreError::not_found("build", build_id));
            }
        }

        let mut report = ApplyReport::default();
        for op in ops {
            tables.apply_op(op, &mut report);
        }
        drop(tables);
        self.commits.fetch_add(1, Ordering::Relaxed);
        self.clamped
            .fetch_add(u64::try_from(report.clamped).unwrap_or(u64::MAX), Ordering::Relaxed);
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::BuildStatus;
    use pretty_assertions::assert_eq;

    async fn seeded() -> InMemoryStateStore {
        let store = InMemoryStateStore::new();
        let mut batch = WriteBatch::new();
        batch.push(StoreOp::PutBuild(Build::new("proj", "pipe", "b-1")));
        batch.put_stage(Stage::new("b-1", "s-2", 2));
        batch.put_stage(Stage::new("b-1", "s-1", 1));
        store.apply(batch).await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_stages_are_listed_in_sequence() {
        let store = seeded().await;
        let ids: Vec<_> = store
            .list_stages("b-1")
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.stage_id)
            .collect();
        assert_eq!(ids, vec!["s-1", "s-2"]);
    }

    #[tokio::test]
    async fn test_conditional_status_update() {
        let store = seeded().await;
        let mut batch = WriteBatch::new();
        batch.build_status("b-1", Some(BuildStatus::StageSuccess), BuildStatus::Running);
        let report = store.apply(batch).await.unwrap();
        assert_eq!(report.cas_skipped, 1);

        let mut batch = WriteBatch::new();
        batch.build_status("b-1", Some(BuildStatus::Running), BuildStatus::StageSuccess);
        let report = store.apply(batch).await.unwrap();
        assert_eq!(report.cas_skipped, 0);

        let build = store.get_build("b-1").await.unwrap().unwrap();
        assert_eq!(build.status, BuildStatus::StageSuccess);
    }

    #[tokio::test]
    async fn test_running_count_clamps_and_tracks_summary() {
        let store = seeded().await;
        let mut batch = WriteBatch::new();
        batch.running_delta("b-1", 2);
        store.apply(batch).await.unwrap();
        assert_eq!(store.get_summary("pipe").await.unwrap().unwrap().running_count, 2);

        let mut batch = WriteBatch::new();
        batch.running_delta("b-1", -5);
        let report = store.apply(batch).await.unwrap();
        assert_eq!(report.clamped, 1);
        assert_eq!(store.clamped_total(), 1);

        let build = store.get_build("b-1").await.unwrap().unwrap();
        assert_eq!(build.running_count, 0);
        assert_eq!(store.get_summary("pipe").await.unwrap().unwrap().running_count, 0);
    }

    #[tokio::test]
    async fn test_batch_for_unknown_build_writes_nothing() {
        let store = seeded().await;
        let mut batch = WriteBatch::new();
        batch.running_delta("b-1", 1);
        batch.running_delta("b-missing", 1);

        let err = store.apply(batch).await.unwrap_err();
        assert_eq!(err, StoreError::not_found("build", "b-missing"));
        assert_eq!(store.get_build("b-1").await.unwrap().unwrap().running_count, 0);
    }

    #[tokio::test]
    async fn test_injected_failure_aborts_batch() {
        let store = seeded().await;
        let commits = store.commit_count();
        store.fail_next_apply(StoreError::Unavailable("disk".to_string()));

        let mut batch = WriteBatch::new();
        batch.build_status("b-1", None, BuildStatus::Canceled);
        assert!(store.apply(batch).await.is_err());
        assert_eq!(store.commit_count(), commits);
        assert_eq!(
            store.get_build("b-1").await.unwrap().unwrap().status,
            BuildStatus::Running
        );
    }

    #[tokio::test]
    async fn test_snapshot_orders_containers_by_stage() {
        use crate::core::ContainerKind;
        let store = seeded().await;
        let mut batch = WriteBatch::new();
        batch.put_container(Container::new("b-1", "s-2", "1", ContainerKind::Normal));
        batch.put_container(Container::new("b-1", "s-1", "2", ContainerKind::Normal));
        store.apply(batch).await.unwrap();

        let snapshot = store.snapshot("b-1").await.unwrap();
        let order: Vec<_> = snapshot
            .containers
            .iter()
            .map(|c| c.stage_id.as_str())
            .collect();
        assert_eq!(order, vec!["s-1", "s-2"]);
        assert_eq!(snapshot.containers_in("s-2").count(), 1);
    }
}
