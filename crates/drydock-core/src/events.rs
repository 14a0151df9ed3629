//! Best-effort event fan-out for run progress.
//!
//! Real-time transport (websocket fan-out etc.) is a collaborator; the
//! engine only publishes through the `EventSink` contract.

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::model::{Run, ServerRecord};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum RunEvent {
    RunCreated { run: Run },
    RunStarted { run: Run },
    RunProgress { run: Run },
    ServerProgress { run_id: Uuid, server: ServerRecord },
    RunFinished { run: Run },
    RunDeleted { run_ids: Vec<Uuid> },
}

impl RunEvent {
    pub fn name(&self) -> &'static str {
        match self {
            RunEvent::RunCreated { .. } => "run-created",
            RunEvent::RunStarted { .. } => "run-started",
            RunEvent::RunProgress { .. } => "run-progress",
            RunEvent::ServerProgress { .. } => "server-progress",
            RunEvent::RunFinished { .. } => "run-finished",
            RunEvent::RunDeleted { .. } => "run-deleted",
        }
    }
}

/// Fire-and-forget publication; delivery is best effort.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: RunEvent);
}

/// Sink that drops every event. Used when no transport is attached.
pub struct NullSink;

#[async_trait]
impl EventSink for NullSink {
    async fn publish(&self, _event: RunEvent) {}
}

/// Sink backed by a tokio broadcast channel so transport adapters can
/// subscribe.
pub struct BroadcastSink {
    tx: broadcast::Sender<RunEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl EventSink for BroadcastSink {
    async fn publish(&self, event: RunEvent) {
        // A send error only means nobody is listening right now.
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn broadcast_sink_delivers_to_subscribers() {
        let sink = BroadcastSink::new(8);
        let mut rx = sink.subscribe();
        let run = Run::new(Uuid::new_v4());
        sink.publish(RunEvent::RunCreated { run: run.clone() }).await;

        let event = rx.recv().await.unwrap();
        assert_eq!(event.name(), "run-created");
        match event {
            RunEvent::RunCreated { run: received } => assert_eq!(received.id, run.id),
            other => panic!("unexpected event: {}", other.name()),
        }
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_silent() {
        let sink = BroadcastSink::new(8);
        sink.publish(RunEvent::RunDeleted { run_ids: vec![] }).await;
    }
}
