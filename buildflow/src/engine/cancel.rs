//! Cancellation cascade.
//!
//! Stops every non-`finally` container of a build, ends the active stage
//! and hands control either to the next pending stage (with `END`, so
//! `finally` stages still run) or straight to build finish.

use chrono::Utc;
use std::collections::HashSet;
use std::time::Instant;

use super::stage::{cancel_writes, pending_stage_of};
use super::{Engine, Transition};
use crate::core::{ActionType, BuildCancelEvent, PipelineEvent};
use crate::errors::EngineError;
use crate::measure::CancelMeasure;
use crate::store::{CancelInfo, StoreOp, WriteBatch};

/// Where a cascade sent the build next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Continuation {
    /// `StageEvent(END)` was dispatched to this stage.
    EndStage(String),
    /// `BuildFinish` was dispatched.
    FinishBuild,
}

/// Summary of a completed cascade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CascadeReport {
    /// Containers moved to a cancelled status.
    pub cancelled_containers: Vec<String>,
    /// Containers whose mutex hold was released.
    pub released_mutexes: Vec<String>,
    /// Active stages ended by the cascade.
    pub ended_stages: Vec<String>,
    /// Where the build went next.
    pub continuation: Continuation,
    /// Measurement to report once the build lock is released.
    pub measure: CancelMeasure,
}

impl Engine {
    /// Cancels a build.
    ///
    /// A finished build, or one already cancelled, is discarded. The caller
    /// must hold the build lock and report `measure` after releasing it.
    ///
    /// Container and stage writes commit first; mutex groups are released
    /// only after the commit, so a failed commit leaves every hold in place.
    pub async fn cancel_build(
        &self,
        event: &BuildCancelEvent,
    ) -> Result<Transition<CascadeReport>, EngineError> {
        let started = Instant::now();
        let meta = &event.meta;
        let build_id = meta.build_id.as_str();

        let Some(build) = self.store.get_build(build_id).await? else {
            return Ok(Transition::discarded(format!("build {build_id} not found")));
        };
        if build.is_finished() {
            tracing::info!(build_id, status = %build.status, "Build already finished, cancel discarded");
            return Ok(Transition::discarded(format!("build already {}", build.status)));
        }
        let detail = self.load_detail(build_id).await?;
        if let Some(info) = &detail.cancel_info {
            tracing::info!(build_id, cancelled_by = %info.user_id, "Build already cancelled, duplicate discarded");
            return Ok(Transition::discarded("build already cancelled"));
        }

        let snapshot = self.store.snapshot(build_id).await?;
        let mut batch = WriteBatch::new();
        let mut cancelled = Vec::new();
        let mut ended_stages = Vec::new();

        for stage in snapshot.stages.iter().filter(|s| !s.finally) {
            cancelled.extend(Self::cancel_stage_containers(&snapshot, &stage.stage_id, &mut batch));

            if stage.status.is_running() || stage.status.is_pause() {
                cancel_writes(&snapshot.build, stage, &mut batch);
                ended_stages.push(stage.stage_id.clone());
            }
        }

        batch.push(StoreOp::RecordCancel {
            build_id: build_id.to_string(),
            info: CancelInfo {
                user_id: meta.user_id.clone(),
                status: event.status,
                at: Utc::now(),
            },
        });
        self.commit(batch).await?;

        // No non-finally container may keep a mutex hold past this point.
        let mut released = HashSet::new();
        self.stop_cancelled_containers(&snapshot.build, &cancelled, meta, &mut released)
            .await;
        for container in snapshot
            .stages
            .iter()
            .filter(|s| !s.finally)
            .flat_map(|s| snapshot.containers_in(&s.stage_id))
        {
            if self.release_container_mutex(&snapshot.build, container) {
                released.insert(container.container_id.clone());
            }
        }

        let stages = self.store.list_stages(build_id).await?;
        let continuation = match pending_stage_of(&stages) {
            Some(next) => {
                self.publish(PipelineEvent::stage(
                    meta.follow_up("cancel_build"),
                    &next.stage_id,
                    ActionType::End,
                ))
                .await;
                Continuation::EndStage(next.stage_id.clone())
            }
            None => {
                self.publish(PipelineEvent::build_finish(
                    meta.follow_up("cancel_build"),
                    event.status,
                ))
                .await;
                Continuation::FinishBuild
            }
        };

        let cancelled_containers: Vec<String> =
            cancelled.into_iter().map(|c| c.container_id).collect();
        let mut released_mutexes: Vec<String> = released.into_iter().collect();
        released_mutexes.sort();

        tracing::info!(
            build_id,
            user_id = %meta.user_id,
            source = %meta.source,
            cancelled = cancelled_containers.len(),
            released = released_mutexes.len(),
            continuation = ?continuation,
            "Build cancel cascade complete"
        );

        let measure = CancelMeasure {
            project_id: build.project_id.clone(),
            pipeline_id: build.pipeline_id.clone(),
            build_id: build_id.to_string(),
            user_id: meta.user_id.clone(),
            status: event.status,
            cancelled_containers: cancelled_containers.len(),
            elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            trace_id: meta.trace_id.clone(),
        };

        Ok(Transition::Applied(CascadeReport {
            cancelled_containers,
            released_mutexes,
            ended_stages,
            continuation,
            measure,
        }))
    }
}
