//! Cancellation measurement reporting.
//!
//! Measurement is fire-and-forget: [`report_cancel`] swallows every
//! failure so telemetry can never affect build correctness.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::core::BuildStatus;
use crate::errors::EngineError;

/// Facts about one cancellation cascade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelMeasure {
    /// Owning project.
    pub project_id: String,
    /// Owning pipeline.
    pub pipeline_id: String,
    /// Cancelled build.
    pub build_id: String,
    /// Cancelling user.
    pub user_id: String,
    /// Requested status.
    pub status: BuildStatus,
    /// Containers moved to a cancelled status.
    pub cancelled_containers: usize,
    /// Time spent inside the build lock.
    pub elapsed_ms: u64,
    /// Trace id of the cancel request.
    pub trace_id: String,
}

/// Receives measurement events.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MeasureService: Send + Sync {
    /// Records a completed cancellation cascade.
    async fn record_cancel(&self, measure: CancelMeasure) -> Result<(), EngineError>;
}

/// Discards all measurements.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpMeasureService;

#[async_trait]
impl MeasureService for NoOpMeasureService {
    async fn record_cancel(&self, _measure: CancelMeasure) -> Result<(), EngineError> {
        Ok(())
    }
}

/// Logs measurements through tracing.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingMeasureService;

#[async_trait]
impl MeasureService for LoggingMeasureService {
    async fn record_cancel(&self, measure: CancelMeasure) -> Result<(), EngineError> {
        info!(
            build_id = %measure.build_id,
            pipeline_id = %measure.pipeline_id,
            user_id = %measure.user_id,
            status = %measure.status,
            cancelled_containers = measure.cancelled_containers,
            elapsed_ms = measure.elapsed_ms,
            trace_id = %measure.trace_id,
            "Build cancel measured"
        );
        Ok(())
    }
}

/// Reports a cancellation, logging and discarding any failure.
pub async fn report_cancel(service: &dyn MeasureService, measure: CancelMeasure) {
    let build_id = measure.build_id.clone();
    if let Err(e) = service.record_cancel(measure).await {
        warn!(build_id = %build_id, error = %e, "Cancel measurement failed, ignored");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn measure() -> CancelMeasure {
        CancelMeasure {
            project_id: "proj".to_string(),
            pipeline_id: "pipe".to_string(),
            build_id: "b-1".to_string(),
            user_id: "alice".to_string(),
            status: BuildStatus::Canceled,
            cancelled_containers: 2,
            elapsed_ms: 12,
            trace_id: "t".to_string(),
        }
    }

    #[tokio::test]
    async fn test_failure_is_swallowed() {
        let mut mock = MockMeasureService::new();
        mock.expect_record_cancel()
            .times(1)
            .returning(|_| Err(EngineError::Measure("collector down".to_string())));

        report_cancel(&mock, measure()).await;
    }

    #[tokio::test]
    async fn test_builtin_services_accept() {
        assert!(NoOpMeasureService.record_cancel(measure()).await.is_ok());
        assert!(LoggingMeasureService.record_cancel(measure()).await.is_ok());
    }

    #[test]
    fn test_measure_serializes_camel_case() {
        let json = serde_json::to_value(measure()).unwrap();
        assert_eq!(json["cancelledContainers"], 2);
        assert_eq!(json["status"], "CANCELED");
    }
}
