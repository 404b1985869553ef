//! Event types for the weft engine event bus.
//!
//! `EngineEvent` is broadcast for every run start, task state transition,
//! and run completion. All variants are Clone + Send + Sync for use with
//! tokio broadcast channels.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::workflow::{RunStatus, TaskStatus};

/// Events emitted while runs execute.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// A run was accepted and its driver started.
    RunStarted {
        run_id: Uuid,
        workflow_name: String,
        at: DateTime<Utc>,
    },

    /// A task instance changed state.
    TaskTransition {
        run_id: Uuid,
        task_name: String,
        from: TaskStatus,
        to: TaskStatus,
        /// Attempt number at the time of the transition.
        attempt: u32,
        at: DateTime<Utc>,
    },

    /// A run reached a terminal status.
    RunFinished {
        run_id: Uuid,
        status: RunStatus,
        at: DateTime<Utc>,
    },
}

impl EngineEvent {
    /// The run this event belongs to.
    pub fn run_id(&self) -> Uuid {
        match self {
            EngineEvent::RunStarted { run_id, .. }
            | EngineEvent::TaskTransition { run_id, .. }
            | EngineEvent::RunFinished { run_id, .. } => *run_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_transition_serde_shape() {
        let run_id = Uuid::now_v7();
        let event = EngineEvent::TaskTransition {
            run_id,
            task_name: "build".into(),
            from: TaskStatus::Ready,
            to: TaskStatus::Dispatching,
            attempt: 1,
            at: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "task_transition");
        assert_eq!(json["from"], "ready");
        assert_eq!(json["to"], "dispatching");

        let back: EngineEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back.run_id(), run_id);
    }

    #[test]
    fn test_run_finished_run_id() {
        let run_id = Uuid::now_v7();
        let event = EngineEvent::RunFinished {
            run_id,
            status: RunStatus::Failed,
            at: Utc::now(),
        };
        assert_eq!(event.run_id(), run_id);
    }
}
