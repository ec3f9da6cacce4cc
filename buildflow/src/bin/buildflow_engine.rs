//! Runs a demo build through the engine: one stage, two containers
//! sharing a mutex group, each driven by an in-process worker.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures::future::join_all;

use buildflow::prelude::*;
use buildflow::worker::SessionSummary;

struct EchoExecutor;

#[async_trait]
impl TaskExecutor for EchoExecutor {
    async fn execute(&self, attempt: &mut TaskAttempt) -> Result<(), String> {
        tracing::info!(
            task_id = %attempt.task().task_id,
            region = attempt.env("REGION").unwrap_or("-"),
            "Executing task"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = EngineConfig::from_env().context("loading engine config")?;
    init_logging(&config.logging).context("initialising logging")?;

    let store = Arc::new(InMemoryStateStore::new());
    let (dispatcher, receiver) = ChannelDispatcher::new(config.handler.channel_capacity);
    let mutex = Arc::new(MutexGroupController::new(config.mutex.clone()));
    let engine = Engine::new(store.clone(), Arc::new(dispatcher), mutex);
    let lock = BuildIdLock::new(Arc::new(InMemoryLockBackend::new()), config.lock.clone());
    let handlers = EngineHandlers::new(
        engine,
        lock,
        Arc::new(LoggingMeasureService),
        config.handler.clone(),
    );

    let fixture = BuildFixture::new("demo-build")
        .with_variable("REGION", "eu")
        .stage("deploy", BuildStatus::Queue)
        .container("deploy", "1", BuildStatus::Queue)
        .container("deploy", "2", BuildStatus::Queue)
        .with_mutex("1", "deploy-${REGION}")
        .with_mutex("2", "deploy-${REGION}")
        .edit_container("2", |c| {
            if let Some(group) = c.mutex_group.as_mut() {
                group.queue_enable = true;
                group.queue = 5;
            }
        })
        .task("1", "1-build")
        .task("1", "1-push")
        .task("2", "2-build");
    let meta = fixture.meta("demo");
    fixture.seed(store.as_ref()).await?;

    let event_loop = {
        let handlers = handlers.clone();
        tokio::spawn(async move { handlers.run_event_loop(receiver).await })
    };

    handlers
        .handle(PipelineEvent::stage(meta.clone(), "deploy", ActionType::Refresh))
        .await;

    let service: Arc<dyn BuildService> = Arc::new(EngineBuildService::new(handlers.clone()));
    let sessions: Vec<_> = ["1", "2"]
        .into_iter()
        .map(|container_id| {
            WorkerSession::new(
                service.clone(),
                WorkerKey::new(meta.clone(), "deploy", container_id),
                config.worker.clone(),
            )
        })
        .collect();
    let results = join_all(sessions.iter().map(|s| s.run(&EchoExecutor))).await;
    let summaries: Vec<SessionSummary> = results.into_iter().collect::<Result<_, _>>()?;
    tracing::info!(?summaries, "Workers finished");

    let mut build = None;
    for _ in 0..50 {
        let current = store.get_build("demo-build").await?;
        if current.as_ref().is_some_and(Build::is_finished) {
            build = current;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    event_loop.abort();

    let Some(build) = build else {
        bail!("demo build did not finish");
    };
    tracing::info!(status = %build.status, running_count = build.running_count, "Demo build finished");
    Ok(())
}
