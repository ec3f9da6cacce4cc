//! Build finish.

use chrono::Utc;

use super::{Engine, Transition};
use crate::core::{ActionType, BuildFinishEvent, PipelineEvent, RefreshType, StatusSwitcher};
use crate::errors::EngineError;
use crate::store::{StoreOp, WriteBatch};

impl Engine {
    /// Marks a build finished, unless a `finally` stage still has to run.
    ///
    /// Leftover unfinished stages and containers are cancelled and the
    /// running count is reset to zero. Any mutex hold left by the build is
    /// released.
    pub async fn finish_build(&self, event: &BuildFinishEvent) -> Result<Transition, EngineError> {
        let meta = &event.meta;
        let build_id = meta.build_id.as_str();
        let snapshot = self.store.snapshot(build_id).await?;
        if snapshot.build.is_finished() {
            return Ok(Transition::discarded(format!(
                "build already {}",
                snapshot.build.status
            )));
        }

        if let Some(finally) = snapshot
            .stages
            .iter()
            .filter(|s| s.finally && !s.status.is_finish())
            .min_by_key(|s| s.seq)
        {
            tracing::info!(
                build_id,
                stage_id = %finally.stage_id,
                "Finish deferred until finally stage completes"
            );
            if finally.status.is_ready_to_run() {
                self.publish(PipelineEvent::stage(
                    meta.follow_up("build_finish"),
                    &finally.stage_id,
                    ActionType::Refresh,
                ))
                .await;
            }
            return Ok(Transition::discarded(format!(
                "waiting for finally stage {}",
                finally.stage_id
            )));
        }

        let status = if event.status.is_finish() {
            event.status
        } else {
            StatusSwitcher::job_terminate(event.status)
        };
        let now = Utc::now();
        let mut batch = WriteBatch::new();

        for stage in snapshot.stages.iter().filter(|s| !s.status.is_finish()) {
            let mut swept = stage.clone();
            swept.status = StatusSwitcher::job_cancel(stage.status);
            swept.end_time = Some(now);
            batch.put_stage(swept);
        }
        for container in snapshot.containers.iter().filter(|c| !c.status.is_finish()) {
            let mut swept = container.clone();
            swept.status = StatusSwitcher::job_cancel(container.status);
            swept.end_time = Some(now);
            batch.put_container(swept);
        }

        // Every container is finished and the run slot is given up.
        tracing::debug!(
            build_id,
            running_count = snapshot.build.running_count,
            "Running count reset on finish"
        );
        batch
            .push(StoreOp::SetRunningCount {
                build_id: build_id.to_string(),
                count: 0,
            })
            .push(StoreOp::FinishBuild {
                build_id: build_id.to_string(),
                status,
                end_time: now,
            });
        self.commit(batch).await?;

        self.mutex.release_all_for_build(build_id);
        tracing::info!(build_id, status = %status, source = %meta.source, "Build finished");

        self.publish(PipelineEvent::websocket_push(
            meta.follow_up("build_finish"),
            RefreshType::History,
        ))
        .await;
        Ok(Transition::APPLIED)
    }
}
