//! Stage state machine: operator start, pause, skip and cancel.
//!
//! Each command writes the stage, a status-conditional build update and the
//! running-count delta in one batch. The running count holds one slot for
//! a RUNNING build plus one per running container; pause and resume move
//! the build's slot, so they only touch the count when the build status
//! actually changes.

use chrono::Utc;

use super::{Engine, Transition};
use crate::core::{
    ActionType, Build, BuildStatus, EventMeta, PipelineEvent, Stage, StageCommand,
    StageCommandEvent,
};
use crate::errors::EngineError;
use crate::store::WriteBatch;

/// Event source for stages started by an operator.
pub(crate) const SOURCE_MANUAL_START: &str = "BS_MANUAL_START_STAGE";

/// Picks the stage a cancelled build should continue with.
///
/// RUNNING wins over QUEUE; `finally` stages never qualify.
pub(crate) fn pending_stage_of(stages: &[Stage]) -> Option<&Stage> {
    let mut candidates: Vec<&Stage> = stages.iter().filter(|s| !s.finally).collect();
    candidates.sort_by_key(|s| s.seq);
    candidates
        .iter()
        .find(|s| s.status == BuildStatus::Running)
        .or_else(|| candidates.iter().find(|s| s.status == BuildStatus::Queue))
        .copied()
}

/// Returns the first unfinished non-`finally` stage sequenced before `stage`.
pub(crate) fn earlier_unfinished<'a>(stages: &'a [Stage], stage: &Stage) -> Option<&'a Stage> {
    stages
        .iter()
        .filter(|s| !s.finally && s.seq < stage.seq && !s.status.is_finish())
        .min_by_key(|s| s.seq)
}

/// Writes that put a paused build back to RUNNING and restore its slot.
pub(crate) fn resume_writes(build: &Build, batch: &mut WriteBatch) {
    if build.status == BuildStatus::StageSuccess {
        batch
            .build_status(&build.build_id, Some(BuildStatus::StageSuccess), BuildStatus::Running)
            .running_delta(&build.build_id, 1);
    }
}

/// Writes for `start`: trigger the stage and resume the build.
pub(crate) fn start_writes(build: &Build, stage: &Stage, batch: &mut WriteBatch) {
    let mut stage = stage.clone();
    stage.control_option.triggered = true;
    stage.status = BuildStatus::Queue;
    batch.put_stage(stage);
    resume_writes(build, batch);
}

/// Writes for `pause`: park the stage and release the build's run slot.
pub(crate) fn pause_writes(build: &Build, stage: &Stage, batch: &mut WriteBatch) {
    let mut stage = stage.clone();
    stage.status = BuildStatus::Pause;
    batch.put_stage(stage);
    if build.status == BuildStatus::Running {
        batch
            .build_status(&build.build_id, Some(BuildStatus::Running), BuildStatus::StageSuccess)
            .running_delta(&build.build_id, -1);
    }
}

/// Writes for `cancel`: end the stage's run and compensate the count.
pub(crate) fn cancel_writes(build: &Build, stage: &Stage, batch: &mut WriteBatch) {
    let mut stage = stage.clone();
    stage.status = BuildStatus::StageSuccess;
    stage.end_time = Some(Utc::now());
    batch
        .put_stage(stage)
        .build_status(&build.build_id, Some(BuildStatus::StageSuccess), BuildStatus::Running)
        .running_delta(&build.build_id, 1);
}

impl Engine {
    /// Applies an operator stage command.
    pub async fn handle_stage_command(
        &self,
        event: &StageCommandEvent,
    ) -> Result<Transition, EngineError> {
        match event.command {
            StageCommand::Start => self.start_stage(&event.meta, &event.stage_id).await,
            StageCommand::Pause => self.pause_stage(&event.meta, &event.stage_id).await,
            StageCommand::Skip => self.skip_stage(&event.meta, &event.stage_id).await,
            StageCommand::Cancel => self.cancel_stage(&event.meta, &event.stage_id).await,
        }
    }

    /// Starts a paused or manual-trigger stage, then asks stage control to run it.
    pub async fn start_stage(&self, meta: &EventMeta, stage_id: &str) -> Result<Transition, EngineError> {
        let (build, stage) = match self.load_for_command(meta, stage_id).await? {
            Ok(pair) => pair,
            Err(reason) => return Ok(Transition::Discarded(reason)),
        };
        if !matches!(stage.status, BuildStatus::Pause | BuildStatus::Queue) {
            return Ok(Transition::discarded(format!(
                "stage {stage_id} is {}, cannot start",
                stage.status
            )));
        }

        let mut batch = WriteBatch::new();
        start_writes(&build, &stage, &mut batch);
        self.commit(batch).await?;
        tracing::info!(build_id = %build.build_id, stage_id, user_id = %meta.user_id, "Stage started");

        self.publish(PipelineEvent::stage(
            meta.follow_up(SOURCE_MANUAL_START),
            stage_id,
            ActionType::Refresh,
        ))
        .await;
        Ok(Transition::APPLIED)
    }

    /// Parks a queued stage on its review gate.
    ///
    /// A running stage cannot be paused: its containers keep going and
    /// nothing would complete the stage on resume.
    pub async fn pause_stage(&self, meta: &EventMeta, stage_id: &str) -> Result<Transition, EngineError> {
        let (build, stage) = match self.load_for_command(meta, stage_id).await? {
            Ok(pair) => pair,
            Err(reason) => return Ok(Transition::Discarded(reason)),
        };
        if stage.status != BuildStatus::Queue {
            return Ok(Transition::discarded(format!(
                "stage {stage_id} is {}, cannot pause",
                stage.status
            )));
        }

        let mut batch = WriteBatch::new();
        pause_writes(&build, &stage, &mut batch);
        self.commit(batch).await?;
        tracing::info!(build_id = %build.build_id, stage_id, "Stage paused");
        Ok(Transition::APPLIED)
    }

    /// Skips a paused or queued stage and lets the build move on.
    pub async fn skip_stage(&self, meta: &EventMeta, stage_id: &str) -> Result<Transition, EngineError> {
        let (build, stage) = match self.load_for_command(meta, stage_id).await? {
            Ok(pair) => pair,
            Err(reason) => return Ok(Transition::Discarded(reason)),
        };
        if !matches!(stage.status, BuildStatus::Pause | BuildStatus::Queue) {
            return Ok(Transition::discarded(format!(
                "stage {stage_id} is {}, cannot skip",
                stage.status
            )));
        }

        let mut skipped = stage.clone();
        skipped.status = BuildStatus::Skip;
        skipped.end_time = Some(Utc::now());
        let mut batch = WriteBatch::new();
        batch.put_stage(skipped);
        self.commit(batch).await?;
        tracing::info!(build_id = %build.build_id, stage_id, "Stage skipped");

        self.publish(PipelineEvent::websocket_push(
            meta.follow_up("skip_stage"),
            crate::core::RefreshType::History,
        ))
        .await;
        self.publish(PipelineEvent::stage(
            meta.follow_up("skip_stage"),
            stage_id,
            ActionType::Refresh,
        ))
        .await;
        Ok(Transition::APPLIED)
    }

    /// Cancels one stage; stage control then ends it and runs `finally` stages.
    pub async fn cancel_stage(&self, meta: &EventMeta, stage_id: &str) -> Result<Transition, EngineError> {
        let (build, stage) = match self.load_for_command(meta, stage_id).await? {
            Ok(pair) => pair,
            Err(reason) => return Ok(Transition::Discarded(reason)),
        };
        if stage.status.is_finish() {
            return Ok(Transition::discarded(format!(
                "stage {stage_id} already {}",
                stage.status
            )));
        }

        let mut batch = WriteBatch::new();
        cancel_writes(&build, &stage, &mut batch);
        self.commit(batch).await?;
        tracing::info!(build_id = %build.build_id, stage_id, user_id = %meta.user_id, "Stage cancelled");

        self.publish(PipelineEvent::stage(
            meta.follow_up("cancel_stage"),
            stage_id,
            ActionType::End,
        ))
        .await;
        Ok(Transition::APPLIED)
    }

    /// Returns the stage a cancelled build continues with, if any.
    pub async fn pending_stage(&self, build_id: &str) -> Result<Option<Stage>, EngineError> {
        let stages = self.store.list_stages(build_id).await?;
        Ok(pending_stage_of(&stages).cloned())
    }

    /// Loads build and stage; the inner `Err` carries a discard reason.
    async fn load_for_command(
        &self,
        meta: &EventMeta,
        stage_id: &str,
    ) -> Result<Result<(Build, Stage), String>, EngineError> {
        let build = self.load_build(&meta.build_id).await?;
        if build.is_finished() {
            return Ok(Err(format!("build already {}", build.status)));
        }
        let stage = self.load_stage(&meta.build_id, stage_id).await?;
        Ok(Ok((build, stage)))
    }
}
