//! Lifecycle event fan-out
//!
//! In-process broadcast hub with at-least-once local delivery (slow
//! subscribers drop, they are never blocked on), plus a background
//! forwarder that pushes every event to the external streaming
//! collaborator. Forwarding failures are logged and never touch core state.

use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

use maestro_core::hooks::EventSink;
use maestro_core::models::TaskEvent;

const DEFAULT_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct EventHub {
    tx: broadcast::Sender<TaskEvent>,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.tx.subscribe()
    }

    /// Publish an event to all local subscribers. Having no subscribers is
    /// not an error.
    pub fn publish(&self, event: TaskEvent) {
        let kind = event.kind;
        let task_id = event.task_id;
        if self.tx.send(event).is_err() {
            tracing::trace!(task_id = %task_id, kind = ?kind, "Event published with no subscribers");
        }
    }

    /// Spawn the best-effort forwarder to an external sink. Returns a
    /// shutdown sender; dropping it (or sending) stops the loop.
    pub fn spawn_forwarder(&self, sink: Arc<dyn EventSink>) -> mpsc::Sender<()> {
        let mut rx = self.subscribe();
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        tracing::debug!("Event forwarder shutting down");
                        break;
                    }
                    received = rx.recv() => match received {
                        Ok(event) => {
                            let room = format!("task:{}", event.task_id);
                            let name = event.kind.as_str();
                            let data = match serde_json::to_value(&event) {
                                Ok(data) => data,
                                Err(e) => {
                                    tracing::error!(error = %e, "Failed to serialize event for forwarding");
                                    continue;
                                }
                            };
                            if let Err(e) = sink.emit(&room, name, &data).await {
                                tracing::warn!(
                                    task_id = %event.task_id,
                                    event = name,
                                    error = %e,
                                    "Event forward failed"
                                );
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped = skipped, "Event forwarder lagged, events dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        });

        shutdown_tx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;
    use uuid::Uuid;

    #[derive(Default)]
    struct CapturingSink {
        emitted: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl EventSink for CapturingSink {
        async fn emit(
            &self,
            room: &str,
            event: &str,
            _data: &serde_json::Value,
        ) -> Result<(), String> {
            self.emitted
                .lock()
                .unwrap()
                .push((room.to_string(), event.to_string()));
            Ok(())
        }
    }

    struct FailingSink;

    #[async_trait]
    impl EventSink for FailingSink {
        async fn emit(
            &self,
            _room: &str,
            _event: &str,
            _data: &serde_json::Value,
        ) -> Result<(), String> {
            Err("collaborator down".to_string())
        }
    }

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let hub = EventHub::default();
        let mut rx = hub.subscribe();
        let id = Uuid::new_v4();
        hub.publish(TaskEvent::started(id));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.task_id, id);
    }

    #[tokio::test]
    async fn forwarder_pushes_to_sink_with_task_room() {
        let hub = EventHub::default();
        let sink = Arc::new(CapturingSink::default());
        let _shutdown = hub.spawn_forwarder(sink.clone());

        let id = Uuid::new_v4();
        hub.publish(TaskEvent::completed(id, serde_json::json!("ok")));

        tokio::time::sleep(Duration::from_millis(50)).await;
        let emitted = sink.emitted.lock().unwrap();
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].0, format!("task:{id}"));
        assert_eq!(emitted[0].1, "completed");
    }

    #[tokio::test]
    async fn sink_failures_do_not_stop_the_forwarder() {
        let hub = EventHub::default();
        let _shutdown = hub.spawn_forwarder(Arc::new(FailingSink));
        let mut rx = hub.subscribe();

        let id = Uuid::new_v4();
        hub.publish(TaskEvent::started(id));
        hub.publish(TaskEvent::progress(id, 50));

        // Local subscribers still get every event even while forwarding fails.
        assert_eq!(rx.recv().await.unwrap().task_id, id);
        assert_eq!(rx.recv().await.unwrap().progress, Some(50));
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_fine() {
        let hub = EventHub::default();
        hub.publish(TaskEvent::started(Uuid::new_v4()));
    }
}
