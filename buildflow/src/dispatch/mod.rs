//! Event dispatch boundary.
//!
//! The engine publishes follow-up events through an [`EventDispatcher`]
//! and never consumes them synchronously. Delivery is at-least-once and
//! unordered; retries belong to the bus, not to the engine.

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, info, Level};

use crate::core::PipelineEvent;
use crate::errors::DispatchError;

/// Publishes engine events to the message bus.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EventDispatcher: Send + Sync {
    /// Publishes one event.
    async fn dispatch(&self, event: PipelineEvent) -> Result<(), DispatchError>;
}

/// A dispatcher that only logs events.
#[derive(Debug, Clone)]
pub struct LoggingDispatcher {
    level: Level,
}

impl Default for LoggingDispatcher {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingDispatcher {
    /// Creates a logging dispatcher at the given level.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }
}

#[async_trait]
impl EventDispatcher for LoggingDispatcher {
    async fn dispatch(&self, event: PipelineEvent) -> Result<(), DispatchError> {
        if self.level == Level::DEBUG {
            debug!(kind = event.kind(), build_id = %event.build_id(), event = ?event, "Dispatch");
        } else {
            info!(kind = event.kind(), build_id = %event.build_id(), "Dispatch");
        }
        Ok(())
    }
}

/// Records dispatched events in memory.
#[derive(Debug, Default)]
pub struct CollectingDispatcher {
    events: RwLock<Vec<PipelineEvent>>,
}

impl CollectingDispatcher {
    /// Creates an empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every event dispatched so far.
    #[must_use]
    pub fn events(&self) -> Vec<PipelineEvent> {
        self.events.read().clone()
    }

    /// Returns the events of one kind, in dispatch order.
    #[must_use]
    pub fn events_of_kind(&self, kind: &str) -> Vec<PipelineEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.kind() == kind)
            .cloned()
            .collect()
    }

    /// Removes and returns every recorded event.
    pub fn drain(&self) -> Vec<PipelineEvent> {
        std::mem::take(&mut *self.events.write())
    }

    /// Number of recorded events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if nothing was dispatched.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }
}

#[async_trait]
impl EventDispatcher for CollectingDispatcher {
    async fn dispatch(&self, event: PipelineEvent) -> Result<(), DispatchError> {
        self.events.write().push(event);
        Ok(())
    }
}

/// In-process bus feeding the handler loop.
#[derive(Debug, Clone)]
pub struct ChannelDispatcher {
    sender: mpsc::Sender<PipelineEvent>,
}

impl ChannelDispatcher {
    /// Creates a bounded bus and returns its receiving end.
    #[must_use]
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<PipelineEvent>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl EventDispatcher for ChannelDispatcher {
    async fn dispatch(&self, event: PipelineEvent) -> Result<(), DispatchError> {
        self.sender
            .send(event)
            .await
            .map_err(|_| DispatchError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ActionType, BuildStatus, EventMeta};

    fn meta() -> EventMeta {
        EventMeta::new("test", "proj", "pipe", "b-1", "alice")
    }

    #[tokio::test]
    async fn test_collecting_dispatcher_records_in_order() {
        let dispatcher = CollectingDispatcher::new();
        dispatcher
            .dispatch(PipelineEvent::stage(meta(), "s-2", ActionType::End))
            .await
            .unwrap();
        dispatcher
            .dispatch(PipelineEvent::build_finish(meta(), BuildStatus::Canceled))
            .await
            .unwrap();

        assert_eq!(dispatcher.len(), 2);
        assert_eq!(dispatcher.events_of_kind("build.finish").len(), 1);
        assert_eq!(dispatcher.drain().len(), 2);
        assert!(dispatcher.is_empty());
    }

    #[tokio::test]
    async fn test_channel_dispatcher_delivers_and_reports_closed() {
        let (dispatcher, mut receiver) = ChannelDispatcher::new(4);
        let event = PipelineEvent::stage(meta(), "s-1", ActionType::Refresh);
        dispatcher.dispatch(event.clone()).await.unwrap();
        assert_eq!(receiver.recv().await, Some(event.clone()));

        drop(receiver);
        assert_eq!(dispatcher.dispatch(event).await, Err(DispatchError::Closed));
    }

    #[tokio::test]
    async fn test_logging_dispatcher_never_fails() {
        let dispatcher = LoggingDispatcher::new(Level::DEBUG);
        let event = PipelineEvent::build_finish(meta(), BuildStatus::Succeed);
        assert!(dispatcher.dispatch(event).await.is_ok());
    }

    #[tokio::test]
    async fn test_mock_dispatcher_expectations() {
        let mut mock = MockEventDispatcher::new();
        mock.expect_dispatch()
            .withf(|e| e.kind() == "stage.event")
            .times(1)
            .returning(|_| Ok(()));

        mock.dispatch(PipelineEvent::stage(meta(), "s-1", ActionType::End))
            .await
            .unwrap();
    }
}
