//! Stage control: advances a stage on `StageEvent(REFRESH | END)`.
//!
//! REFRESH starts a queued stage (or parks it on its manual-trigger gate),
//! completes a running stage once its containers are done, and moves the
//! build to the next stage. END stops the stage's containers and routes
//! the build to its remaining `finally` stages.

use chrono::Utc;
use std::collections::HashSet;

use super::stage::{earlier_unfinished, pause_writes, resume_writes};
use super::{final_status, is_broken, Engine, Transition};
use crate::core::{
    ActionType, BuildStatus, EventMeta, PipelineEvent, Stage, StageEvent, StatusSwitcher,
};
use crate::errors::{EngineError, StoreError};
use crate::store::{BuildDetail, BuildSnapshot, WriteBatch};

impl Engine {
    /// Handles a stage advancement trigger.
    pub async fn handle_stage_event(&self, event: &StageEvent) -> Result<Transition, EngineError> {
        let build_id = event.meta.build_id.as_str();
        let snapshot = self.store.snapshot(build_id).await?;
        if snapshot.build.is_finished() {
            return Ok(Transition::discarded(format!(
                "build already {}",
                snapshot.build.status
            )));
        }
        let stage = snapshot
            .stage(&event.stage_id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("stage", format!("{build_id}/{}", event.stage_id)))?;
        let detail = self.load_detail(build_id).await?;

        match event.action_type {
            ActionType::End => self.end_stage(&snapshot, &detail, &stage, &event.meta).await,
            ActionType::Refresh => self.refresh_stage(&snapshot, &detail, &stage, &event.meta).await,
        }
    }

    async fn end_stage(
        &self,
        snapshot: &BuildSnapshot,
        detail: &BuildDetail,
        stage: &Stage,
        meta: &EventMeta,
    ) -> Result<Transition, EngineError> {
        let mut batch = WriteBatch::new();
        let cancelled = Self::cancel_stage_containers(snapshot, &stage.stage_id, &mut batch);
        if !stage.status.is_finish() {
            let mut ended = stage.clone();
            ended.status = StatusSwitcher::job_cancel(stage.status);
            ended.end_time = Some(Utc::now());
            batch.put_stage(ended);
        }
        self.commit(batch).await?;

        let mut released = HashSet::new();
        self.stop_cancelled_containers(&snapshot.build, &cancelled, meta, &mut released)
            .await;
        tracing::info!(
            build_id = %snapshot.build.build_id,
            stage_id = %stage.stage_id,
            cancelled = cancelled.len(),
            "Stage ended"
        );

        let stages = self.store.list_stages(&snapshot.build.build_id).await?;
        let next = stages
            .iter()
            .filter(|s| s.finally && !s.status.is_finish() && s.stage_id != stage.stage_id)
            .min_by_key(|s| s.seq);
        match next {
            Some(finally) => {
                self.publish(PipelineEvent::stage(
                    meta.follow_up("stage_end"),
                    &finally.stage_id,
                    ActionType::Refresh,
                ))
                .await;
            }
            None => {
                let status = detail
                    .cancel_info
                    .as_ref()
                    .map_or(BuildStatus::Canceled, |info| info.status);
                self.publish(PipelineEvent::build_finish(meta.follow_up("stage_end"), status))
                    .await;
            }
        }
        Ok(Transition::APPLIED)
    }

    async fn refresh_stage(
        &self,
        snapshot: &BuildSnapshot,
        detail: &BuildDetail,
        stage: &Stage,
        meta: &EventMeta,
    ) -> Result<Transition, EngineError> {
        let build = &snapshot.build;

        if stage.status.is_finish() {
            return self.advance(build.build_id.as_str(), detail, stage, meta).await;
        }
        if !stage.finally && is_broken(&snapshot.stages, detail) {
            return Ok(Transition::discarded(format!(
                "build is stopping, stage {} will not run",
                stage.stage_id
            )));
        }

        match stage.status {
            BuildStatus::Queue => {
                if !stage.finally {
                    if let Some(earlier) = earlier_unfinished(&snapshot.stages, stage) {
                        return Ok(Transition::discarded(format!(
                            "stage {} waits for stage {} ({})",
                            stage.stage_id, earlier.stage_id, earlier.status
                        )));
                    }
                }

                let mut batch = WriteBatch::new();
                let mut next = stage.clone();

                if !stage.control_option.enable {
                    next.status = BuildStatus::Skip;
                    next.end_time = Some(Utc::now());
                    batch.put_stage(next.clone());
                    self.commit(batch).await?;
                    tracing::info!(build_id = %build.build_id, stage_id = %stage.stage_id, "Disabled stage skipped");
                    return self.advance(&build.build_id, detail, &next, meta).await;
                }

                if stage.control_option.manual_trigger && !stage.control_option.triggered {
                    pause_writes(build, stage, &mut batch);
                    self.commit(batch).await?;
                    tracing::info!(
                        build_id = %build.build_id,
                        stage_id = %stage.stage_id,
                        "Stage waiting for manual trigger"
                    );
                    return Ok(Transition::APPLIED);
                }

                let containers: Vec<_> = snapshot.containers_in(&stage.stage_id).collect();
                next.start_time = Some(Utc::now());
                if containers.iter().any(|c| !c.status.is_finish()) {
                    next.status = BuildStatus::Running;
                } else {
                    // Nothing left to run: an empty stage succeeds.
                    next.status = StatusSwitcher::aggregate(containers.iter().map(|c| c.status));
                    next.end_time = next.start_time;
                }
                batch.put_stage(next.clone());
                resume_writes(build, &mut batch);
                self.commit(batch).await?;
                tracing::info!(
                    build_id = %build.build_id,
                    stage_id = %stage.stage_id,
                    status = %next.status,
                    "Stage left the queue"
                );

                if next.status == BuildStatus::Running {
                    Ok(Transition::APPLIED)
                } else {
                    self.advance(&build.build_id, detail, &next, meta).await
                }
            }
            BuildStatus::Running => {
                let containers: Vec<_> = snapshot.containers_in(&stage.stage_id).collect();
                let unfinished = containers.iter().filter(|c| !c.status.is_finish()).count();
                if unfinished > 0 {
                    return Ok(Transition::discarded(format!(
                        "stage {} waiting for {unfinished} containers",
                        stage.stage_id
                    )));
                }

                let mut done = stage.clone();
                done.status = StatusSwitcher::aggregate(containers.iter().map(|c| c.status));
                done.end_time = Some(Utc::now());
                let mut batch = WriteBatch::new();
                batch.put_stage(done.clone());
                self.commit(batch).await?;
                tracing::info!(
                    build_id = %build.build_id,
                    stage_id = %stage.stage_id,
                    status = %done.status,
                    "Stage completed"
                );
                self.advance(&build.build_id, detail, &done, meta).await
            }
            other => Ok(Transition::discarded(format!(
                "stage {} is {other}, nothing to advance",
                stage.stage_id
            ))),
        }
    }

    /// Moves the build past a finished stage.
    async fn advance(
        &self,
        build_id: &str,
        detail: &BuildDetail,
        finished: &Stage,
        meta: &EventMeta,
    ) -> Result<Transition, EngineError> {
        let stages = self.store.list_stages(build_id).await?;
        let broken = is_broken(&stages, detail);
        if !broken && !finished.finally {
            if let Some(earlier) = earlier_unfinished(&stages, finished) {
                // The earlier stage advances the build when it completes.
                tracing::debug!(
                    build_id,
                    stage_id = %finished.stage_id,
                    waiting_on = %earlier.stage_id,
                    "Stage finished ahead of an earlier stage"
                );
                return Ok(Transition::APPLIED);
            }
        }
        let next = if broken {
            stages
                .iter()
                .filter(|s| s.finally && !s.status.is_finish())
                .min_by_key(|s| s.seq)
        } else {
            stages
                .iter()
                .filter(|s| s.seq > finished.seq && !s.status.is_finish())
                .min_by_key(|s| s.seq)
        };

        match next {
            Some(stage) => {
                self.publish(PipelineEvent::stage(
                    meta.follow_up("stage_control"),
                    &stage.stage_id,
                    ActionType::Refresh,
                ))
                .await;
            }
            None => {
                let status = final_status(&stages, detail);
                self.publish(PipelineEvent::build_finish(
                    meta.follow_up("stage_control"),
                    status,
                ))
                .await;
            }
        }
        Ok(Transition::APPLIED)
    }
}
