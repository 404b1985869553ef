//! Per-run scheduler: the driver loop that moves task instances through
//! their state machine.
//!
//! One `Scheduler` runs as one tokio task per run and is the single writer
//! of the run's instance table, parameter store, frontier and delay heap.
//! Task attempts run concurrently in a `JoinSet`; the driver waits on
//! whichever comes first of an attempt completing, a retry deadline coming
//! due, or the run being cancelled.
//!
//! # Instance lifecycle
//!
//! ```text
//! Pending -> EvaluatingWhen -> Ready -> Dispatching -> Running -> Succeeded
//!                 |                                       |  \-> Failed
//!                 \-> Skipped                             \-> Retrying -> Ready
//! (any non-terminal) -> Cancelled
//! ```
//!
//! An instance leaves `Pending` only once every dependency is terminal. If
//! any dependency ended unsatisfied (failed and not optional, or cancelled)
//! the instance is cancelled with `upstream_failed` instead of being
//! evaluated. Retries are scheduled as `(deadline, instance)` entries on a
//! min-heap; nothing in the driver sleeps on behalf of a single task.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use weft_types::config::EngineConfig;
use weft_types::event::EngineEvent;
use weft_types::workflow::{
    RunRecord, RunSnapshot, RunStatus, SkipPolicy, StoredValue, TaskError, TaskErrorKind,
    TaskInstance, TaskStatus, WorkflowDefinition,
};

use crate::event::bus::EventBus;
use crate::repository::run::RunRepository;

use super::checkpoint::CheckpointManager;
use super::dag::{CompiledInput, Workflow};
use super::executor::{BoxTaskExecutor, DispatchRequest, ExecutionFailure, TaskOutputs};
use super::expression::{EvalError, VariableContext, evaluate_condition};
use super::retry::{RetryController, RetryDecision};
use super::store::{ParameterStore, StoreError};

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Effective scheduling settings for one run: engine config overridden by
/// the workflow definition.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerSettings {
    pub max_parallelism: usize,
    pub fail_fast: bool,
    pub skip_policy: SkipPolicy,
    pub default_task_timeout: Option<Duration>,
}

impl SchedulerSettings {
    pub fn resolve(config: &EngineConfig, def: &WorkflowDefinition) -> Self {
        let base = Self::from(config);
        Self {
            max_parallelism: def.max_parallelism.map_or(base.max_parallelism, |n| n.max(1)),
            fail_fast: def.fail_fast.unwrap_or(base.fail_fast),
            skip_policy: def.skip_policy.unwrap_or(base.skip_policy),
            ..base
        }
    }
}

impl From<&EngineConfig> for SchedulerSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            max_parallelism: config.max_parallelism.max(1),
            fail_fast: config.fail_fast,
            skip_policy: config.skip_policy,
            default_task_timeout: config.default_task_timeout_ms.map(Duration::from_millis),
        }
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Attempt results
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum AttemptError {
    Execution(ExecutionFailure),
    Timeout(Duration),
    Cancelled,
}

#[derive(Debug)]
struct AttemptOutcome {
    idx: usize,
    attempt: u32,
    result: Result<TaskOutputs, AttemptError>,
}

/// How a finished dependency affects its dependents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Release {
    Satisfied,
    Skipped,
    Unsatisfied,
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Driver for a single run.
pub struct Scheduler<R: RunRepository> {
    workflow: Arc<Workflow>,
    executor: Arc<BoxTaskExecutor>,
    checkpoint: Arc<CheckpointManager<R>>,
    events: EventBus,
    settings: SchedulerSettings,
    cancel: CancellationToken,
    snapshot_tx: watch::Sender<RunSnapshot>,

    run: RunRecord,
    instances: Vec<TaskInstance>,
    store: ParameterStore,
    /// Dependencies not yet terminal, per instance.
    remaining: Vec<usize>,
    /// First unsatisfied dependency, per instance.
    upstream_failed: Vec<Option<String>>,
    /// Whether some dependency was skipped, per instance.
    upstream_skipped: Vec<bool>,
    frontier: VecDeque<usize>,
    ready: VecDeque<usize>,
    delayed: BinaryHeap<Reverse<(Instant, u64, usize)>>,
    delay_seq: u64,
    in_flight: JoinSet<AttemptOutcome>,
    in_flight_ids: HashMap<tokio::task::Id, usize>,
    /// Set by fail-fast or an invariant violation: no further dispatch.
    halted: bool,
    cancelled: bool,
    invariant_violation: Option<String>,
    /// Some instance changed since the last published snapshot.
    dirty: bool,
}

impl<R: RunRepository + 'static> Scheduler<R> {
    /// Build a driver for `run`. The returned receiver observes every
    /// snapshot the driver publishes.
    pub fn new(
        workflow: Arc<Workflow>,
        run: RunRecord,
        executor: Arc<BoxTaskExecutor>,
        checkpoint: Arc<CheckpointManager<R>>,
        events: EventBus,
        settings: SchedulerSettings,
        cancel: CancellationToken,
    ) -> (Self, watch::Receiver<RunSnapshot>) {
        let n = workflow.len();
        let instances: Vec<TaskInstance> = workflow
            .tasks()
            .iter()
            .map(|t| TaskInstance::pending(run.id, t.name.clone()))
            .collect();
        let remaining = (0..n).map(|i| workflow.dependencies(i).len()).collect();
        let store = ParameterStore::new(run.params.clone());
        let (snapshot_tx, snapshot_rx) = watch::channel(RunSnapshot {
            run: run.clone(),
            tasks: instances.clone(),
        });

        let scheduler = Self {
            workflow,
            executor,
            checkpoint,
            events,
            settings,
            cancel,
            snapshot_tx,
            run,
            instances,
            store,
            remaining,
            upstream_failed: vec![None; n],
            upstream_skipped: vec![false; n],
            frontier: VecDeque::new(),
            ready: VecDeque::new(),
            delayed: BinaryHeap::new(),
            delay_seq: 0,
            in_flight: JoinSet::new(),
            in_flight_ids: HashMap::new(),
            halted: false,
            cancelled: false,
            invariant_violation: None,
            dirty: false,
        };
        (scheduler, snapshot_rx)
    }

    /// Drive the run to a terminal status and return the final snapshot.
    pub async fn run(mut self) -> RunSnapshot {
        self.start().await;

        let cancel = self.cancel.clone();
        loop {
            self.drain_frontier().await;
            self.dispatch_ready().await;

            if self.in_flight.is_empty()
                && self.delayed.is_empty()
                && self.frontier.is_empty()
                && self.ready.is_empty()
            {
                break;
            }
            self.publish_snapshot();

            let next_deadline = self.delayed.peek().map(|Reverse((at, _, _))| *at);
            tokio::select! {
                _ = cancel.cancelled(), if !self.cancelled => {
                    self.on_cancel().await;
                }
                Some(joined) = self.in_flight.join_next_with_id(), if !self.in_flight.is_empty() => {
                    match joined {
                        Ok((id, outcome)) => {
                            self.in_flight_ids.remove(&id);
                            self.on_attempt_finished(outcome).await;
                        }
                        Err(e) => {
                            if let Some(idx) = self.in_flight_ids.remove(&e.id()) {
                                let attempt = self.instances[idx].attempt;
                                let message = if e.is_panic() { "executor panicked" } else { "attempt aborted" };
                                self.on_attempt_finished(AttemptOutcome {
                                    idx,
                                    attempt,
                                    result: Err(AttemptError::Execution(ExecutionFailure::permanent(message))),
                                })
                                .await;
                            }
                        }
                    }
                }
                _ = tokio::time::sleep_until(next_deadline.unwrap_or_else(Instant::now)), if next_deadline.is_some() => {
                    self.release_due_retries().await;
                }
                else => break,
            }
        }

        self.finish().await
    }

    // -----------------------------------------------------------------------
    // Run lifecycle
    // -----------------------------------------------------------------------

    async fn start(&mut self) {
        self.run.status = RunStatus::Running;
        if let Err(e) = self
            .checkpoint
            .checkpoint_run_created(&self.run, &self.instances)
            .await
        {
            tracing::warn!(run_id = %self.run.id, error = %e, "failed to checkpoint run start");
        }
        self.events.publish(EngineEvent::RunStarted {
            run_id: self.run.id,
            workflow_name: self.run.workflow_name.clone(),
            at: Utc::now(),
        });
        tracing::info!(
            run_id = %self.run.id,
            workflow = %self.run.workflow_name,
            tasks = self.instances.len(),
            max_parallelism = self.settings.max_parallelism,
            fail_fast = self.settings.fail_fast,
            "starting run"
        );

        for idx in 0..self.instances.len() {
            if self.remaining[idx] == 0 {
                self.frontier.push_back(idx);
            }
        }
        self.dirty = true;
        self.publish_snapshot();
    }

    async fn finish(mut self) -> RunSnapshot {
        // Every instance should be terminal once the queues drain.
        let stuck: Vec<usize> = (0..self.instances.len())
            .filter(|&i| !self.instances[i].status.is_terminal())
            .collect();
        for idx in stuck {
            let name = self.instances[idx].task_name.clone();
            tracing::error!(run_id = %self.run.id, task = %name, "instance not terminal at end of run");
            self.invariant_violation
                .get_or_insert_with(|| format!("task '{name}' never reached a terminal state"));
            self.transition(
                idx,
                TaskStatus::Cancelled,
                Some(TaskError::new(TaskErrorKind::Cancelled, "run ended")),
            )
            .await;
        }

        let (status, error) = self.final_status();
        self.run.status = status;
        self.run.error = error;
        self.run.finished_at = Some(Utc::now());

        if let Err(e) = self.checkpoint.checkpoint_run(&self.run).await {
            tracing::warn!(run_id = %self.run.id, error = %e, "failed to checkpoint run completion");
        }
        self.events.publish(EngineEvent::RunFinished {
            run_id: self.run.id,
            status,
            at: Utc::now(),
        });

        match status {
            RunStatus::Succeeded => {
                tracing::info!(run_id = %self.run.id, workflow = %self.run.workflow_name, "run succeeded")
            }
            RunStatus::Errored => tracing::error!(
                run_id = %self.run.id,
                error = self.run.error.as_deref().unwrap_or(""),
                "run errored"
            ),
            _ => tracing::warn!(
                run_id = %self.run.id,
                status = %status,
                error = self.run.error.as_deref().unwrap_or(""),
                "run did not succeed"
            ),
        }

        self.dirty = true;
        self.publish_snapshot();
        self.snapshot()
    }

    fn final_status(&self) -> (RunStatus, Option<String>) {
        if let Some(violation) = &self.invariant_violation {
            return (RunStatus::Errored, Some(violation.clone()));
        }
        if self.cancelled {
            return (RunStatus::Cancelled, Some("run cancelled".to_string()));
        }
        let blocking = self.instances.iter().enumerate().find(|(i, inst)| {
            self.workflow.task(*i).is_mandatory()
                && !matches!(inst.status, TaskStatus::Succeeded | TaskStatus::Skipped)
        });
        match blocking {
            None => (RunStatus::Succeeded, None),
            Some(_) => {
                // Report the root cause rather than its cancelled dependents.
                let culprit = self
                    .instances
                    .iter()
                    .enumerate()
                    .find(|(i, inst)| {
                        self.workflow.task(*i).is_mandatory() && inst.status == TaskStatus::Failed
                    })
                    .or(blocking)
                    .map(|(_, inst)| inst);
                let message = culprit.map(|inst| match &inst.error {
                    Some(err) => format!("task '{}' {}: {}", inst.task_name, inst.status, err.message),
                    None => format!("task '{}' {}", inst.task_name, inst.status),
                });
                (RunStatus::Failed, message)
            }
        }
    }

    async fn on_cancel(&mut self) {
        self.cancelled = true;
        tracing::info!(run_id = %self.run.id, "run cancellation requested");
        self.cancel_waiting("run cancelled").await;
    }

    /// Stop dispatching after an unrecoverable failure. Attempts already
    /// running are left to finish.
    async fn halt(&mut self, reason: String) {
        if self.halted {
            return;
        }
        self.halted = true;
        tracing::warn!(run_id = %self.run.id, reason = %reason, "halting run");
        self.cancel_waiting(&reason).await;
    }

    /// Cancel every instance that is not running and not terminal.
    async fn cancel_waiting(&mut self, reason: &str) {
        self.frontier.clear();
        self.ready.clear();
        self.delayed.clear();
        for idx in 0..self.instances.len() {
            if matches!(
                self.instances[idx].status,
                TaskStatus::Pending | TaskStatus::EvaluatingWhen | TaskStatus::Ready | TaskStatus::Retrying
            ) {
                self.transition(
                    idx,
                    TaskStatus::Cancelled,
                    Some(TaskError::new(TaskErrorKind::Cancelled, reason)),
                )
                .await;
            }
        }
    }

    // -----------------------------------------------------------------------
    // Frontier: readiness, `when` gates and input resolution
    // -----------------------------------------------------------------------

    async fn drain_frontier(&mut self) {
        if self.frontier.is_empty() {
            return;
        }
        let workflow = Arc::clone(&self.workflow);
        // Outputs only change when an attempt completes, never during a pass.
        let ctx = self.store.context();
        while let Some(idx) = self.frontier.pop_front() {
            if self.instances[idx].status != TaskStatus::Pending {
                continue;
            }
            if self.halted || self.cancelled {
                let reason = if self.cancelled { "run cancelled" } else { "run halted" };
                self.transition(
                    idx,
                    TaskStatus::Cancelled,
                    Some(TaskError::new(TaskErrorKind::Cancelled, reason)),
                )
                .await;
                continue;
            }

            if let Some(dep) = self.upstream_failed[idx].clone() {
                self.transition(
                    idx,
                    TaskStatus::Cancelled,
                    Some(TaskError::new(
                        TaskErrorKind::UpstreamFailed,
                        format!("dependency '{dep}' did not succeed"),
                    )),
                )
                .await;
                self.release_dependents(idx, Release::Unsatisfied);
                continue;
            }

            self.transition(idx, TaskStatus::EvaluatingWhen, None).await;

            if self.upstream_skipped[idx] && self.settings.skip_policy == SkipPolicy::Propagate {
                self.transition(idx, TaskStatus::Skipped, None).await;
                self.release_dependents(idx, Release::Skipped);
                continue;
            }

            if let Some(condition) = workflow.condition(idx) {
                match evaluate_condition(condition, &ctx) {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::debug!(
                            run_id = %self.run.id,
                            task = %self.instances[idx].task_name,
                            "when gate is false, skipping"
                        );
                        self.transition(idx, TaskStatus::Skipped, None).await;
                        self.release_dependents(idx, Release::Skipped);
                        continue;
                    }
                    Err(e) => {
                        self.fail_task(idx, eval_task_error("when", &e)).await;
                        continue;
                    }
                }
            }

            match self.resolve_inputs(idx, &ctx) {
                Ok(inputs) => self.instances[idx].inputs = inputs,
                Err(err) => {
                    self.fail_task(idx, err).await;
                    continue;
                }
            }

            self.transition(idx, TaskStatus::Ready, None).await;
            self.ready.push_back(idx);
        }
    }

    fn resolve_inputs(
        &self,
        idx: usize,
        ctx: &VariableContext,
    ) -> Result<BTreeMap<String, StoredValue>, TaskError> {
        let mut resolved = BTreeMap::new();
        for (name, input) in self.workflow.inputs(idx) {
            let value = match input {
                CompiledInput::Literal(v) => StoredValue::Parameter(v.clone()),
                CompiledInput::Reference(path) => self.store.resolve(path).map_err(|e| match e {
                    StoreError::UnresolvedReference(r) => TaskError::new(
                        TaskErrorKind::UnresolvedReference,
                        format!("input '{name}': unresolved reference '{r}'"),
                    ),
                    other => TaskError::new(TaskErrorKind::Expression, other.to_string()),
                })?,
                CompiledInput::Template(t) => t
                    .render(ctx)
                    .map(|s| StoredValue::Parameter(s.into()))
                    .map_err(|e| eval_task_error(&format!("input '{name}'"), &e))?,
            };
            resolved.insert(name.clone(), value);
        }
        Ok(resolved)
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    async fn dispatch_ready(&mut self) {
        while !self.halted
            && !self.cancelled
            && self.in_flight.len() < self.settings.max_parallelism
        {
            let Some(idx) = self.ready.pop_front() else {
                break;
            };
            let attempt = self.instances[idx].attempt + 1;
            let workflow = Arc::clone(&self.workflow);
            let task = workflow.task(idx);
            let name = task.name.clone();

            self.store.begin_attempt(&name, attempt);
            self.instances[idx].attempt = attempt;
            self.transition(idx, TaskStatus::Dispatching, None).await;

            let timeout = task
                .timeout_ms
                .map(Duration::from_millis)
                .or(self.settings.default_task_timeout);
            let token = self.cancel.child_token();
            let request = DispatchRequest {
                run_id: self.run.id,
                task_name: name.clone(),
                attempt,
                spec: task.executor.clone(),
                inputs: self.instances[idx].inputs.clone(),
                cancel: token.clone(),
            };

            tracing::debug!(
                run_id = %self.run.id,
                task = %name,
                attempt,
                executor = task.executor.kind(),
                "dispatching task"
            );

            let executor = Arc::clone(&self.executor);
            let handle = self.in_flight.spawn(async move {
                let result = run_attempt(executor, request, timeout, token).await;
                AttemptOutcome {
                    idx,
                    attempt,
                    result,
                }
            });
            self.in_flight_ids.insert(handle.id(), idx);

            self.transition(idx, TaskStatus::Running, None).await;
        }
    }

    async fn release_due_retries(&mut self) {
        let now = Instant::now();
        while let Some(Reverse((at, _, idx))) = self.delayed.peek().copied() {
            if at > now {
                break;
            }
            self.delayed.pop();
            if self.instances[idx].status != TaskStatus::Retrying {
                continue;
            }
            self.transition(idx, TaskStatus::Ready, None).await;
            self.ready.push_back(idx);
        }
    }

    // -----------------------------------------------------------------------
    // Completion
    // -----------------------------------------------------------------------

    async fn on_attempt_finished(&mut self, outcome: AttemptOutcome) {
        let AttemptOutcome {
            idx,
            attempt,
            result,
        } = outcome;
        if self.instances[idx].status != TaskStatus::Running || self.instances[idx].attempt != attempt {
            tracing::warn!(
                run_id = %self.run.id,
                task = %self.instances[idx].task_name,
                attempt,
                "ignoring result of stale attempt"
            );
            return;
        }

        match result {
            Ok(outputs) => self.on_attempt_succeeded(idx, outputs).await,
            Err(AttemptError::Cancelled) => {
                self.transition(
                    idx,
                    TaskStatus::Cancelled,
                    Some(TaskError::new(TaskErrorKind::Cancelled, "attempt cancelled")),
                )
                .await;
                self.release_dependents(idx, Release::Unsatisfied);
            }
            Err(AttemptError::Timeout(after)) => {
                let err = TaskError::new(
                    TaskErrorKind::Timeout,
                    format!("attempt {attempt} timed out after {}ms", after.as_millis()),
                );
                self.on_attempt_failed(idx, err).await;
            }
            Err(AttemptError::Execution(failure)) => {
                let kind = if failure.retryable {
                    TaskErrorKind::ExecutionRetryable
                } else {
                    TaskErrorKind::ExecutionNonRetryable
                };
                self.on_attempt_failed(idx, TaskError::new(kind, failure.message)).await;
            }
        }
    }

    async fn on_attempt_succeeded(&mut self, idx: usize, outputs: TaskOutputs) {
        let workflow = Arc::clone(&self.workflow);
        let task = workflow.task(idx);
        let name = task.name.clone();
        for (output, value) in outputs {
            if task.output(&output).is_none() {
                tracing::debug!(run_id = %self.run.id, task = %name, output = %output, "ignoring undeclared output");
                continue;
            }
            match self.store.bind(&name, &output, value) {
                Ok(()) => {}
                Err(StoreError::DuplicateOutput { .. }) => {
                    let message = format!("output '{output}' of task '{name}' bound twice in one attempt");
                    tracing::error!(run_id = %self.run.id, task = %name, output = %output, "duplicate output binding");
                    self.fail_task(idx, TaskError::new(TaskErrorKind::DuplicateOutput, message))
                        .await;
                    return;
                }
                Err(e @ StoreError::OutputTooLarge { .. }) => {
                    self.fail_task(idx, TaskError::new(TaskErrorKind::OutputTooLarge, e.to_string()))
                        .await;
                    return;
                }
                Err(e) => {
                    self.fail_task(idx, TaskError::new(TaskErrorKind::Expression, e.to_string()))
                        .await;
                    return;
                }
            }
        }

        self.instances[idx].outputs = self.store.outputs_of(&name);
        self.instances[idx].error = None;
        self.transition(idx, TaskStatus::Succeeded, None).await;
        self.release_dependents(idx, Release::Satisfied);
    }

    async fn on_attempt_failed(&mut self, idx: usize, err: TaskError) {
        let attempt = self.instances[idx].attempt;
        let decision = if self.halted || self.cancelled {
            RetryDecision::GiveUp
        } else {
            RetryController::decide(self.workflow.task(idx).retry.as_ref(), attempt, &err)
        };

        match decision {
            RetryDecision::Retry { delay } => {
                tracing::warn!(
                    run_id = %self.run.id,
                    task = %self.instances[idx].task_name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err.message,
                    "attempt failed, retrying"
                );
                self.transition(idx, TaskStatus::Retrying, Some(err)).await;
                self.delay_seq += 1;
                self.delayed
                    .push(Reverse((Instant::now() + delay, self.delay_seq, idx)));
            }
            RetryDecision::GiveUp => self.fail_task(idx, err).await,
        }
    }

    /// Final failure of an instance. An invariant violation halts the run
    /// whether or not the task is optional.
    async fn fail_task(&mut self, idx: usize, err: TaskError) {
        let optional = self.workflow.task(idx).optional;
        let invariant = err.kind.is_invariant_violation();
        if invariant {
            self.invariant_violation
                .get_or_insert_with(|| err.message.clone());
        }
        tracing::warn!(
            run_id = %self.run.id,
            task = %self.instances[idx].task_name,
            attempt = self.instances[idx].attempt,
            kind = ?err.kind,
            optional,
            error = %err.message,
            "task failed"
        );
        self.transition(idx, TaskStatus::Failed, Some(err)).await;

        if optional && !invariant {
            self.release_dependents(idx, Release::Satisfied);
            return;
        }
        self.release_dependents(idx, Release::Unsatisfied);
        if invariant {
            let reason = format!("invariant violation in task '{}'", self.instances[idx].task_name);
            self.halt(reason).await;
        } else if self.settings.fail_fast {
            let reason = format!("fail-fast: task '{}' failed", self.instances[idx].task_name);
            self.halt(reason).await;
        }
    }

    /// Decrement dependents' counters and queue those that became ready.
    fn release_dependents(&mut self, idx: usize, release: Release) {
        let name = &self.instances[idx].task_name;
        for &d in self.workflow.dependents(idx) {
            if self.instances[d].status.is_terminal() {
                continue;
            }
            match release {
                Release::Satisfied => {}
                Release::Skipped => self.upstream_skipped[d] = true,
                Release::Unsatisfied => {
                    if self.upstream_failed[d].is_none() {
                        self.upstream_failed[d] = Some(name.clone());
                    }
                }
            }
            self.remaining[d] = self.remaining[d].saturating_sub(1);
            if self.remaining[d] == 0 {
                self.frontier.push_back(d);
            }
        }
    }

    // -----------------------------------------------------------------------
    // State publication
    // -----------------------------------------------------------------------

    async fn transition(&mut self, idx: usize, to: TaskStatus, error: Option<TaskError>) {
        let now = Utc::now();
        let instance = &mut self.instances[idx];
        let from = instance.status;
        instance.status = to;
        if error.is_some() {
            instance.error = error;
        }
        if to == TaskStatus::Dispatching && instance.started_at.is_none() {
            instance.started_at = Some(now);
        }
        if to.is_terminal() {
            instance.finished_at = Some(now);
        }

        tracing::debug!(
            run_id = %self.run.id,
            task = %instance.task_name,
            from = %from,
            to = %to,
            attempt = instance.attempt,
            "task transition"
        );
        self.events.publish(EngineEvent::TaskTransition {
            run_id: self.run.id,
            task_name: instance.task_name.clone(),
            from,
            to,
            attempt: instance.attempt,
            at: now,
        });

        if let Err(e) = self.checkpoint.checkpoint_task(&self.instances[idx]).await {
            tracing::warn!(run_id = %self.run.id, error = %e, "failed to checkpoint task transition");
        }
        self.dirty = true;
    }

    fn snapshot(&self) -> RunSnapshot {
        RunSnapshot {
            run: self.run.clone(),
            tasks: self.instances.clone(),
        }
    }

    /// Publish the current state to `watch` observers if anything changed.
    fn publish_snapshot(&mut self) {
        if std::mem::take(&mut self.dirty) {
            self.snapshot_tx.send_replace(self.snapshot());
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// How long an interrupted attempt may take to wind down after its cancel
/// token fires.
pub const CANCEL_GRACE: Duration = Duration::from_secs(30);

/// Run one attempt, bounded by its timeout and the run's cancellation.
///
/// On timeout or cancellation the attempt's token fires and the dispatch
/// future keeps being polled until the executor returns, for at most
/// [`CANCEL_GRACE`]. Only then is the attempt reported as interrupted.
async fn run_attempt(
    executor: Arc<BoxTaskExecutor>,
    request: DispatchRequest,
    timeout: Option<Duration>,
    token: CancellationToken,
) -> Result<TaskOutputs, AttemptError> {
    let run_id = request.run_id;
    let task = request.task_name.clone();
    let attempt = request.attempt;
    let deadline = timeout.map(|limit| (Instant::now() + limit, limit));

    let dispatch = executor.dispatch(request);
    tokio::pin!(dispatch);

    let interrupted = tokio::select! {
        biased;
        _ = token.cancelled() => AttemptError::Cancelled,
        result = &mut dispatch => return result.map_err(AttemptError::Execution),
        _ = sleep_until_deadline(deadline) => {
            AttemptError::Timeout(deadline.map_or(Duration::ZERO, |(_, limit)| limit))
        }
    };

    token.cancel();
    if tokio::time::timeout(CANCEL_GRACE, &mut dispatch).await.is_err() {
        tracing::warn!(
            run_id = %run_id,
            task = %task,
            attempt,
            grace_ms = CANCEL_GRACE.as_millis() as u64,
            "executor did not stop after cancellation, abandoning attempt"
        );
    }
    Err(interrupted)
}

async fn sleep_until_deadline(deadline: Option<(Instant, Duration)>) {
    match deadline {
        Some((at, _)) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

fn eval_task_error(context: &str, e: &EvalError) -> TaskError {
    let kind = match e {
        EvalError::UnresolvedReference(_) => TaskErrorKind::UnresolvedReference,
        EvalError::Type(_) => TaskErrorKind::TypeError,
        EvalError::Parse { .. } => TaskErrorKind::Expression,
    };
    TaskError::new(kind, format!("{context}: {e}"))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
