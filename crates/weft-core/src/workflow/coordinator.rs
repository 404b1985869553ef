//! Run coordinator: the entry point for submitting, observing and
//! cancelling runs.
//!
//! `submit` validates parameters synchronously, persists nothing itself and
//! spawns one [`Scheduler`] per run. The coordinator keeps the run's
//! snapshot receiver and cancellation token so `status` and `cancel` never
//! touch the driver directly. Runs that are not in memory (for example after
//! a restart) are answered from the repository.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use weft_types::config::EngineConfig;
use weft_types::workflow::{
    RunRecord, RunSnapshot, RunStatus, TaskError, TaskErrorKind, TaskStatus, WorkflowDefinition,
};

use crate::event::bus::EventBus;
use crate::repository::run::RunRepository;

use super::checkpoint::{CheckpointError, CheckpointManager};
use super::dag::Workflow;
use super::definition::ValidationError;
use super::executor::BoxTaskExecutor;
use super::scheduler::{Scheduler, SchedulerSettings};

const INTERRUPTED: &str = "interrupted: engine stopped while the run was in progress";

/// Errors surfaced by the coordinator.
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("run not found: {0}")]
    RunNotFound(Uuid),

    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),
}

/// Caller's view of a submitted run.
#[derive(Debug, Clone)]
pub struct RunHandle {
    pub run_id: Uuid,
    snapshot: watch::Receiver<RunSnapshot>,
}

impl RunHandle {
    /// Latest published snapshot.
    pub fn snapshot(&self) -> RunSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Wait until the run reaches a terminal status.
    pub async fn wait(mut self) -> RunSnapshot {
        let finished = self
            .snapshot
            .wait_for(|s| s.run.status.is_terminal())
            .await
            .map(|s| s.clone());
        finished.unwrap_or_else(|_| self.snapshot.borrow().clone())
    }
}

struct ActiveRun {
    snapshot: watch::Receiver<RunSnapshot>,
    cancel: CancellationToken,
}

/// Submits runs and answers status queries.
pub struct RunCoordinator<R: RunRepository + 'static> {
    config: EngineConfig,
    executor: Arc<BoxTaskExecutor>,
    checkpoint: Arc<CheckpointManager<R>>,
    events: EventBus,
    runs: DashMap<Uuid, ActiveRun>,
}

impl<R: RunRepository + 'static> RunCoordinator<R> {
    pub fn new(config: EngineConfig, executor: BoxTaskExecutor, repo: R) -> Self {
        let events = EventBus::new(config.event_capacity);
        Self {
            config,
            executor: Arc::new(executor),
            checkpoint: Arc::new(CheckpointManager::new(repo)),
            events,
            runs: DashMap::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Event bus carrying every run and task transition.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn checkpoint(&self) -> &CheckpointManager<R> {
        &self.checkpoint
    }

    /// Validate and submit a raw definition.
    pub async fn submit_definition(
        &self,
        definition: WorkflowDefinition,
        params: BTreeMap<String, Value>,
    ) -> Result<RunHandle, CoordinatorError> {
        let workflow = Workflow::load(definition)?;
        self.submit(Arc::new(workflow), params).await
    }

    /// Start a run of a loaded workflow.
    ///
    /// Submitted parameters override the definition's defaults; parameters
    /// the definition does not declare are rejected.
    pub async fn submit(
        &self,
        workflow: Arc<Workflow>,
        params: BTreeMap<String, Value>,
    ) -> Result<RunHandle, CoordinatorError> {
        let mut effective = workflow.definition().params.clone();
        for (name, value) in params {
            if !effective.contains_key(&name) {
                return Err(ValidationError::UnknownParameter(name).into());
            }
            effective.insert(name, value);
        }

        let run = RunRecord {
            id: Uuid::now_v7(),
            workflow_name: workflow.name().to_string(),
            definition_hash: workflow.definition_hash().to_string(),
            params: effective,
            status: RunStatus::Pending,
            error: None,
            started_at: Utc::now(),
            finished_at: None,
        };
        let run_id = run.id;
        let settings = SchedulerSettings::resolve(&self.config, workflow.definition());
        let cancel = CancellationToken::new();

        let (scheduler, snapshot) = Scheduler::new(
            workflow,
            run,
            Arc::clone(&self.executor),
            Arc::clone(&self.checkpoint),
            self.events.clone(),
            settings,
            cancel.clone(),
        );
        self.runs.insert(
            run_id,
            ActiveRun {
                snapshot: snapshot.clone(),
                cancel,
            },
        );
        tokio::spawn(scheduler.run());

        tracing::info!(run_id = %run_id, "run submitted");
        Ok(RunHandle { run_id, snapshot })
    }

    /// Coherent snapshot of a run. Never fails because the run failed.
    pub async fn status(&self, run_id: Uuid) -> Result<RunSnapshot, CoordinatorError> {
        if let Some(active) = self.runs.get(&run_id) {
            return Ok(active.snapshot.borrow().clone());
        }
        self.checkpoint
            .load_snapshot(run_id)
            .await?
            .ok_or(CoordinatorError::RunNotFound(run_id))
    }

    /// Request cancellation. Cancelling a finished run is a no-op.
    pub fn cancel(&self, run_id: Uuid) -> Result<(), CoordinatorError> {
        let active = self
            .runs
            .get(&run_id)
            .ok_or(CoordinatorError::RunNotFound(run_id))?;
        if active.snapshot.borrow().run.status.is_terminal() {
            tracing::debug!(run_id = %run_id, "cancel ignored, run already finished");
            return Ok(());
        }
        active.cancel.cancel();
        tracing::info!(run_id = %run_id, "run cancelled");
        Ok(())
    }

    /// Runs recorded in the repository, newest first.
    pub async fn list_runs(
        &self,
        workflow_name: Option<&str>,
        limit: u32,
    ) -> Result<Vec<RunRecord>, CoordinatorError> {
        self.checkpoint
            .repo()
            .list_runs(workflow_name, limit)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()).into())
    }

    /// Drop finished runs from memory; their state stays in the repository.
    pub fn evict_finished(&self) -> usize {
        let before = self.runs.len();
        self.runs
            .retain(|_, active| !active.snapshot.borrow().run.status.is_terminal());
        before - self.runs.len()
    }

    /// Mark runs a previous process left `pending` or `running` as
    /// `errored`, cancelling their unfinished instances. Scheduling is not
    /// resumed. Returns the number of runs reconciled.
    pub async fn reconcile_interrupted(&self) -> Result<usize, CoordinatorError> {
        let mut reconciled = 0;
        for mut run in self.checkpoint.interrupted_runs().await? {
            if self.runs.contains_key(&run.id) {
                continue;
            }
            let now = Utc::now();
            let Some(snapshot) = self.checkpoint.load_snapshot(run.id).await? else {
                continue;
            };
            for mut instance in snapshot.tasks {
                if instance.status.is_terminal() {
                    continue;
                }
                instance.status = TaskStatus::Cancelled;
                instance.error = Some(TaskError::new(TaskErrorKind::Cancelled, INTERRUPTED));
                instance.finished_at = Some(now);
                self.checkpoint.checkpoint_task(&instance).await?;
            }

            run.status = RunStatus::Errored;
            run.error = Some(INTERRUPTED.to_string());
            run.finished_at = Some(now);
            self.checkpoint.checkpoint_run(&run).await?;

            tracing::warn!(run_id = %run.id, workflow = %run.workflow_name, "reconciled interrupted run");
            reconciled += 1;
        }
        Ok(reconciled)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
