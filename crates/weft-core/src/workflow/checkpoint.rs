//! Checkpoint manager for run and task instance state.
//!
//! Wraps `RunRepository` with the higher-level operations the scheduler and
//! coordinator need. Every task transition is written through here so that
//! `status` can answer from storage once the in-memory driver is gone.
//! Checkpoints record state; they are not used to resume scheduling.

use uuid::Uuid;
use weft_types::workflow::{RunRecord, RunSnapshot, TaskInstance};

use crate::repository::run::RunRepository;

/// Errors from checkpoint persistence.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("repository error: {0}")]
    Repository(String),
}

/// Persists run state through any `RunRepository` backend.
pub struct CheckpointManager<R: RunRepository> {
    repo: R,
}

impl<R: RunRepository> CheckpointManager<R> {
    pub fn new(repo: R) -> Self {
        Self { repo }
    }

    pub fn repo(&self) -> &R {
        &self.repo
    }

    /// Record a new run together with its initial (pending) instances.
    pub async fn checkpoint_run_created(
        &self,
        run: &RunRecord,
        instances: &[TaskInstance],
    ) -> Result<(), CheckpointError> {
        self.repo
            .create_run(run)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?;
        for instance in instances {
            self.checkpoint_task(instance).await?;
        }
        tracing::debug!(run_id = %run.id, tasks = instances.len(), "checkpointed run created");
        Ok(())
    }

    /// Record a run-level change (status, error, finish time).
    pub async fn checkpoint_run(&self, run: &RunRecord) -> Result<(), CheckpointError> {
        self.repo
            .update_run(run)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?;
        tracing::debug!(run_id = %run.id, status = %run.status, "checkpointed run status");
        Ok(())
    }

    /// Record a task instance transition.
    pub async fn checkpoint_task(&self, instance: &TaskInstance) -> Result<(), CheckpointError> {
        self.repo
            .upsert_task_instance(instance)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?;
        tracing::trace!(
            run_id = %instance.run_id,
            task = %instance.task_name,
            status = %instance.status,
            attempt = instance.attempt,
            "checkpointed task"
        );
        Ok(())
    }

    /// Rebuild a run snapshot from storage.
    pub async fn load_snapshot(&self, run_id: Uuid) -> Result<Option<RunSnapshot>, CheckpointError> {
        let Some(run) = self
            .repo
            .get_run(&run_id)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?
        else {
            return Ok(None);
        };
        let tasks = self
            .repo
            .list_task_instances(&run_id)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?;
        Ok(Some(RunSnapshot { run, tasks }))
    }

    /// Runs a previous process left in a non-terminal state.
    pub async fn interrupted_runs(&self) -> Result<Vec<RunRecord>, CheckpointError> {
        self.repo
            .list_interrupted_runs()
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))
    }
}
