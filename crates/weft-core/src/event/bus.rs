//! Broadcast event bus for run and task state changes.
//!
//! Built on `tokio::sync::broadcast`. Publishing never blocks the scheduler:
//! with no subscribers the event is dropped, and a slow subscriber observes
//! `RecvError::Lagged` instead of applying back-pressure.

use tokio::sync::broadcast;
use weft_types::event::EngineEvent;

/// Multi-consumer bus for engine events.
///
/// Cloning the bus clones the sender, so every run driver can publish into
/// the same channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    /// Create a bus with the given channel capacity (see
    /// `EngineConfig::event_capacity`).
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    /// Publish to all current subscribers. Never blocks or fails.
    pub fn publish(&self, event: EngineEvent) {
        let _ = self.sender.send(event);
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receiver_count", &self.sender.receiver_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;
    use weft_types::workflow::{RunStatus, TaskStatus};

    fn transition(task: &str) -> EngineEvent {
        EngineEvent::TaskTransition {
            run_id: Uuid::now_v7(),
            task_name: task.to_string(),
            from: TaskStatus::Pending,
            to: TaskStatus::Ready,
            attempt: 0,
            at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn every_subscriber_receives_event() {
        let bus = EventBus::new(16);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.publish(transition("build"));

        for rx in [&mut rx1, &mut rx2] {
            let received = rx.recv().await.unwrap();
            assert!(matches!(
                received,
                EngineEvent::TaskTransition { ref task_name, .. } if task_name == "build"
            ));
        }
    }

    #[test]
    fn publish_without_subscribers_is_dropped() {
        let bus = EventBus::new(16);
        bus.publish(transition("a"));
        assert_eq!(bus.receiver_count(), 0);
    }

    #[test]
    fn slow_subscriber_lags_instead_of_blocking() {
        let bus = EventBus::new(4);
        let mut rx = bus.subscribe();

        for i in 0..10 {
            bus.publish(transition(&format!("t{i}")));
        }

        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Lagged(6))
        ));
        // After the lag notice the newest events are still delivered.
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn clone_shares_channel() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        bus.clone().publish(EngineEvent::RunFinished {
            run_id: Uuid::now_v7(),
            status: RunStatus::Succeeded,
            at: Utc::now(),
        });
        assert!(rx.try_recv().is_ok());
        assert!(format!("{bus:?}").contains("receiver_count"));
    }
}
