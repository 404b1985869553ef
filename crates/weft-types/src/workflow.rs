//! Workflow domain types for weft.
//!
//! Defines the static, reusable workflow definition (`WorkflowDefinition`,
//! `TaskTemplate`) and the per-run execution records (`RunRecord`,
//! `TaskInstance`) that the engine mutates while a run is in flight and
//! persists for status queries.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// A named DAG of task templates plus its global parameters.
///
/// Created and validated once, then shared read-only across many runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowDefinition {
    /// Workflow name (alphanumeric, `-` and `_`).
    pub name: String,
    /// Optional longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Optional semantic version of the definition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<semver::Version>,
    /// Global parameters: name -> default value.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, Value>,
    /// Task templates. Order is significant: it breaks ties between tasks
    /// that become ready at the same time.
    pub tasks: Vec<TaskTemplate>,
    /// Overrides the engine-wide fail-fast setting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fail_fast: Option<bool>,
    /// Overrides the engine-wide parallelism bound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_parallelism: Option<usize>,
    /// Overrides the engine-wide skip policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_policy: Option<SkipPolicy>,
    /// Free-form metadata, ignored by the engine.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

impl WorkflowDefinition {
    /// Look up a task template by name.
    pub fn task(&self, name: &str) -> Option<&TaskTemplate> {
        self.tasks.iter().find(|t| t.name == name)
    }
}

// ---------------------------------------------------------------------------
// Task Template
// ---------------------------------------------------------------------------

/// A single step in the workflow DAG.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskTemplate {
    /// Unique task name within the workflow.
    pub name: String,
    /// Names of tasks this task depends on (DAG edges).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    /// Optional boolean gate, e.g. `{{env}} == 'staging'`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,
    /// Input bindings passed to the executor.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inputs: BTreeMap<String, InputBinding>,
    /// Declared outputs. Only declared outputs are bound into the store.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<OutputDecl>,
    /// Retry configuration (no retries when absent).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    /// Maximum duration of a single attempt in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// A failed optional task does not fail the run and does not block
    /// its dependents.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub optional: bool,
    /// Opaque work description handed to the executor.
    pub executor: ExecutorSpec,
}

impl TaskTemplate {
    /// Create a task with the given name and executor spec and no edges.
    pub fn new(name: impl Into<String>, executor: ExecutorSpec) -> Self {
        Self {
            name: name.into(),
            depends_on: Vec::new(),
            when: None,
            inputs: BTreeMap::new(),
            outputs: Vec::new(),
            retry: None,
            timeout_ms: None,
            optional: false,
            executor,
        }
    }

    /// Whether the task must succeed (or be skipped) for the run to succeed.
    pub fn is_mandatory(&self) -> bool {
        !self.optional
    }

    /// Find an output declaration by name.
    pub fn output(&self, name: &str) -> Option<&OutputDecl> {
        self.outputs.iter().find(|o| o.name == name)
    }
}

/// How a task input obtains its value.
///
/// Untagged so YAML reads naturally:
/// ```yaml
/// inputs:
///   image: nginx:1.27                       # literal
///   tag: { from: tasks.build.outputs.tag }  # reference
///   msg: { template: "deploy to {{env}}" }  # interpolated string
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum InputBinding {
    /// Reference to a global parameter or an upstream output.
    Reference { from: String },
    /// String with `{{ }}` interpolation.
    Template { template: String },
    /// Literal JSON value.
    Literal(Value),
}

/// A declared task output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutputDecl {
    pub name: String,
    #[serde(default)]
    pub kind: OutputKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl OutputDecl {
    pub fn parameter(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: OutputKind::Parameter,
            description: None,
        }
    }

    pub fn artifact(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: OutputKind::Artifact,
            description: None,
        }
    }
}

/// Whether an output is a small inline value or a reference to bytes
/// stored elsewhere.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    #[default]
    Parameter,
    Artifact,
}

// ---------------------------------------------------------------------------
// Executor Spec
// ---------------------------------------------------------------------------

/// Opaque executor payload. The engine never interprets it; concrete
/// adapters (container runner, shell, cloud API) live outside the core.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutorSpec {
    /// Run a container image.
    Container {
        image: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        command: Vec<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        args: Vec<String>,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        env: BTreeMap<String, String>,
    },
    /// Run a shell script.
    Shell {
        script: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        shell: Option<String>,
    },
    /// Call an HTTP endpoint.
    Http {
        method: String,
        url: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        headers: BTreeMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<String>,
    },
    /// Anything else, identified by `kind`.
    Custom {
        kind: String,
        #[serde(default)]
        config: Value,
    },
}

impl ExecutorSpec {
    /// Short label for logs.
    pub fn kind(&self) -> &str {
        match self {
            ExecutorSpec::Container { .. } => "container",
            ExecutorSpec::Shell { .. } => "shell",
            ExecutorSpec::Http { .. } => "http",
            ExecutorSpec::Custom { kind, .. } => kind,
        }
    }
}

// ---------------------------------------------------------------------------
// Retry Policy
// ---------------------------------------------------------------------------

/// Retry configuration for a task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Number of retries after the first attempt.
    #[serde(default)]
    pub limit: u32,
    /// Exponential backoff parameters.
    #[serde(default)]
    pub backoff: Backoff,
    /// Which execution errors are retried.
    #[serde(default)]
    pub retry_on: RetryOn,
    /// Whether attempt timeouts count as retryable.
    #[serde(default)]
    pub retry_timeouts: bool,
}

impl RetryPolicy {
    /// Policy with `limit` retries and default backoff.
    pub fn with_limit(limit: u32) -> Self {
        Self {
            limit,
            ..Default::default()
        }
    }

    /// Total attempts allowed (first attempt plus retries).
    pub fn max_attempts(&self) -> u32 {
        self.limit.saturating_add(1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            limit: 0,
            backoff: Backoff::default(),
            retry_on: RetryOn::Retryable,
            retry_timeouts: false,
        }
    }
}

/// `delay = min(base * factor^retry, max)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Backoff {
    #[serde(default = "default_base_ms")]
    pub base_ms: u64,
    #[serde(default = "default_factor")]
    pub factor: f64,
    #[serde(default = "default_max_ms")]
    pub max_ms: u64,
}

fn default_base_ms() -> u64 {
    1_000
}

fn default_factor() -> f64 {
    2.0
}

fn default_max_ms() -> u64 {
    300_000
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base_ms: default_base_ms(),
            factor: default_factor(),
            max_ms: default_max_ms(),
        }
    }
}

/// Retryable-error predicate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryOn {
    /// Retry only errors the executor classified as retryable.
    #[default]
    Retryable,
    /// Retry every execution error.
    Any,
}

/// What happens to dependents of a skipped task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipPolicy {
    /// Dependents run normally; only those that reference the skipped
    /// task's outputs fail, with an unresolved reference.
    #[default]
    FailOnReference,
    /// Dependents of a skipped task are skipped as well.
    Propagate,
}

// ---------------------------------------------------------------------------
// Values
// ---------------------------------------------------------------------------

/// Symbolic pointer to bytes held by the artifact transfer collaborator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArtifactRef {
    /// Location, e.g. `file:///tmp/out.tar` or `s3://bucket/key`.
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

impl ArtifactRef {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            media_type: None,
            size_bytes: None,
            digest: None,
        }
    }
}

/// A value held in the per-run store: inline JSON or an artifact pointer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum StoredValue {
    Parameter(Value),
    Artifact(ArtifactRef),
}

impl StoredValue {
    /// The scalar view used by expressions: artifacts expose their URI.
    pub fn as_scalar(&self) -> Value {
        match self {
            StoredValue::Parameter(v) => v.clone(),
            StoredValue::Artifact(a) => Value::String(a.uri.clone()),
        }
    }
}

impl From<Value> for StoredValue {
    fn from(v: Value) -> Self {
        StoredValue::Parameter(v)
    }
}

impl From<ArtifactRef> for StoredValue {
    fn from(a: ArtifactRef) -> Self {
        StoredValue::Artifact(a)
    }
}

// ---------------------------------------------------------------------------
// Statuses
// ---------------------------------------------------------------------------

/// Lifecycle state of a task instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    EvaluatingWhen,
    Ready,
    Dispatching,
    Running,
    Retrying,
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Skipped | TaskStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::EvaluatingWhen => "evaluating_when",
            TaskStatus::Ready => "ready",
            TaskStatus::Dispatching => "dispatching",
            TaskStatus::Running => "running",
            TaskStatus::Retrying => "retrying",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::Skipped => "skipped",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "evaluating_when" => Ok(TaskStatus::EvaluatingWhen),
            "ready" => Ok(TaskStatus::Ready),
            "dispatching" => Ok(TaskStatus::Dispatching),
            "running" => Ok(TaskStatus::Running),
            "retrying" => Ok(TaskStatus::Retrying),
            "succeeded" => Ok(TaskStatus::Succeeded),
            "failed" => Ok(TaskStatus::Failed),
            "skipped" => Ok(TaskStatus::Skipped),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(format!("invalid task status: '{other}'")),
        }
    }
}

/// Overall status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    /// The engine hit an invariant violation (a defect, not a task failure).
    Errored,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Cancelled | RunStatus::Errored
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
            RunStatus::Errored => "errored",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "succeeded" => Ok(RunStatus::Succeeded),
            "failed" => Ok(RunStatus::Failed),
            "cancelled" => Ok(RunStatus::Cancelled),
            "errored" => Ok(RunStatus::Errored),
            other => Err(format!("invalid run status: '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Task errors
// ---------------------------------------------------------------------------

/// Classification of a task-level failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskErrorKind {
    /// A referenced parameter or upstream output is not bound.
    UnresolvedReference,
    /// An expression produced a value of the wrong type.
    TypeError,
    /// An expression failed for another reason.
    Expression,
    /// Executor failure the executor marked as retryable.
    ExecutionRetryable,
    /// Executor failure the executor marked as permanent.
    ExecutionNonRetryable,
    /// The attempt exceeded the task's timeout.
    Timeout,
    /// A dependency finished in an unsatisfied state.
    UpstreamFailed,
    /// The run was cancelled or halted by fail-fast.
    Cancelled,
    /// An output was bound twice within one attempt (engine defect).
    DuplicateOutput,
    /// An inline output exceeded the store's size limit.
    OutputTooLarge,
}

impl TaskErrorKind {
    /// Whether this kind signals an engine defect rather than a task failure.
    pub fn is_invariant_violation(self) -> bool {
        matches!(self, TaskErrorKind::DuplicateOutput)
    }
}

/// Error detail recorded on a task instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskError {
    pub kind: TaskErrorKind,
    pub message: String,
}

impl TaskError {
    pub fn new(kind: TaskErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

// ---------------------------------------------------------------------------
// Run / TaskInstance records
// ---------------------------------------------------------------------------

/// Durable record of a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunRecord {
    /// UUIDv7 run ID.
    pub id: Uuid,
    /// Name of the workflow (denormalized for display).
    pub workflow_name: String,
    /// SHA-256 of the canonical definition JSON.
    pub definition_hash: String,
    /// Effective global parameters (defaults merged with submitted values).
    pub params: BTreeMap<String, Value>,
    pub status: RunStatus,
    /// Run-level error summary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

/// Per-run materialization of a task template.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskInstance {
    pub run_id: Uuid,
    pub task_name: String,
    pub status: TaskStatus,
    /// 1-based attempt counter; 0 until first dispatch.
    pub attempt: u32,
    /// Snapshot of the resolved inputs of the latest attempt.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inputs: BTreeMap<String, StoredValue>,
    /// Outputs bound by the successful attempt.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, StoredValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskInstance {
    /// Fresh pending instance.
    pub fn pending(run_id: Uuid, task_name: impl Into<String>) -> Self {
        Self {
            run_id,
            task_name: task_name.into(),
            status: TaskStatus::Pending,
            attempt: 0,
            inputs: BTreeMap::new(),
            outputs: BTreeMap::new(),
            error: None,
            started_at: None,
            finished_at: None,
        }
    }
}

/// Coherent point-in-time view of a run and all its instances.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunSnapshot {
    pub run: RunRecord,
    /// Instances in definition order.
    pub tasks: Vec<TaskInstance>,
}

impl RunSnapshot {
    pub fn task(&self, name: &str) -> Option<&TaskInstance> {
        self.tasks.iter().find(|t| t.task_name == name)
    }

    pub fn status(&self) -> RunStatus {
        self.run.status
    }

    /// Number of instances in the given status.
    pub fn count(&self, status: TaskStatus) -> usize {
        self.tasks.iter().filter(|t| t.status == status).count()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
