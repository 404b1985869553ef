//! Structured logging of engine events.
//!
//! Subscribes to the engine [`EventBus`] and turns every event into a
//! `tracing` record, so run progress shows up in logs (and OTel, when
//! enabled) without the scheduler knowing about either.

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use weft_core::event::EventBus;
use weft_types::event::EngineEvent;
use weft_types::workflow::{RunStatus, TaskStatus};

/// Spawn a task that logs every event published on `bus`.
///
/// The task ends once every sender is dropped and returns the number of
/// events it logged.
pub fn spawn_event_logger(bus: &EventBus) -> JoinHandle<u64> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        let mut logged = 0u64;
        loop {
            match rx.recv().await {
                Ok(event) => {
                    log_event(&event);
                    logged += 1;
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event logger lagged, events dropped");
                }
                Err(RecvError::Closed) => break,
            }
        }
        tracing::debug!(logged, "event logger stopped");
        logged
    })
}

/// Emit one tracing record for `event`.
pub fn log_event(event: &EngineEvent) {
    match event {
        EngineEvent::RunStarted {
            run_id,
            workflow_name,
            ..
        } => {
            tracing::info!(run_id = %run_id, workflow = %workflow_name, "run started");
        }
        EngineEvent::TaskTransition {
            run_id,
            task_name,
            from,
            to,
            attempt,
            ..
        } => match to {
            TaskStatus::Failed => tracing::warn!(
                run_id = %run_id, task = %task_name, from = %from, attempt, "task failed"
            ),
            TaskStatus::Retrying => tracing::info!(
                run_id = %run_id, task = %task_name, attempt, "task retrying"
            ),
            TaskStatus::Succeeded | TaskStatus::Skipped | TaskStatus::Cancelled => tracing::info!(
                run_id = %run_id, task = %task_name, status = %to, attempt, "task finished"
            ),
            _ => tracing::debug!(
                run_id = %run_id, task = %task_name, from = %from, to = %to, attempt, "task transition"
            ),
        },
        EngineEvent::RunFinished { run_id, status, .. } => match status {
            RunStatus::Succeeded => tracing::info!(run_id = %run_id, "run succeeded"),
            RunStatus::Errored => tracing::error!(run_id = %run_id, "run errored"),
            _ => tracing::warn!(run_id = %run_id, status = %status, "run finished"),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    #[tokio::test]
    async fn logger_counts_events_and_stops_when_bus_dropped() {
        let bus = EventBus::new(16);
        let handle = spawn_event_logger(&bus);
        let run_id = Uuid::now_v7();

        bus.publish(EngineEvent::RunStarted {
            run_id,
            workflow_name: "release".into(),
            at: Utc::now(),
        });
        bus.publish(EngineEvent::TaskTransition {
            run_id,
            task_name: "build".into(),
            from: TaskStatus::Running,
            to: TaskStatus::Failed,
            attempt: 1,
            at: Utc::now(),
        });
        bus.publish(EngineEvent::RunFinished {
            run_id,
            status: RunStatus::Failed,
            at: Utc::now(),
        });
        drop(bus);

        assert_eq!(handle.await.unwrap(), 3);
    }

    #[tokio::test]
    async fn logger_survives_lag() {
        let bus = EventBus::new(1);
        let handle = spawn_event_logger(&bus);
        let run_id = Uuid::now_v7();
        for _ in 0..5 {
            bus.publish(EngineEvent::RunFinished {
                run_id,
                status: RunStatus::Succeeded,
                at: Utc::now(),
            });
        }
        drop(bus);

        // Capacity 1: everything but the newest event is skipped.
        assert_eq!(handle.await.unwrap(), 1);
    }
}
