//! Executor and artifact transfer ports.
//!
//! The engine hands each task attempt to an external `TaskExecutor` as an
//! opaque `DispatchRequest` and gets back the task's outputs or an
//! `ExecutionFailure`. Concrete executors (container runner, shell, cloud
//! API) live outside this crate. `ArtifactTransfer` moves artifact bytes on
//! behalf of executors; the engine itself only ever sees `ArtifactRef`s.
//!
//! Both traits use RPITIT, so `BoxTaskExecutor` provides the object-safe
//! wrapper the scheduler stores:
//! 1. `TaskExecutorDyn` has boxed futures
//! 2. a blanket impl covers every `T: TaskExecutor`
//! 3. `BoxTaskExecutor` wraps `Box<dyn TaskExecutorDyn>` and delegates

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use weft_types::workflow::{ArtifactRef, ExecutorSpec, StoredValue};

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

/// One task attempt handed to an executor.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub run_id: Uuid,
    pub task_name: String,
    /// 1-based attempt number.
    pub attempt: u32,
    pub spec: ExecutorSpec,
    /// Resolved inputs. Artifact inputs carry only their `ArtifactRef`.
    pub inputs: BTreeMap<String, StoredValue>,
    /// Fires when the run is cancelled or the attempt times out.
    pub cancel: CancellationToken,
}

/// Outputs emitted by a successful attempt, in emission order.
///
/// Kept as a list rather than a map so that an executor emitting the same
/// output twice is detected instead of silently overwritten.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskOutputs {
    entries: Vec<(String, StoredValue)>,
}

impl TaskOutputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<StoredValue>) -> Self {
        self.push(name, value);
        self
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<StoredValue>) {
        self.entries.push((name.into(), value.into()));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &StoredValue)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl IntoIterator for TaskOutputs {
    type Item = (String, StoredValue);
    type IntoIter = std::vec::IntoIter<(String, StoredValue)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

/// An attempt failed inside the executor.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ExecutionFailure {
    /// The executor's own classification: transient (retry may help) or not.
    pub retryable: bool,
    pub message: String,
}

impl ExecutionFailure {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            retryable: true,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            retryable: false,
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// TaskExecutor
// ---------------------------------------------------------------------------

/// Runs one task attempt.
///
/// Implementations should watch `request.cancel` and wind down once it
/// fires. The engine keeps awaiting the returned future after cancelling,
/// up to [`CANCEL_GRACE`](super::scheduler::CANCEL_GRACE), so teardown done
/// before returning completes before the run is reported stopped.
pub trait TaskExecutor: Send + Sync {
    fn dispatch(
        &self,
        request: DispatchRequest,
    ) -> impl Future<Output = Result<TaskOutputs, ExecutionFailure>> + Send;
}

/// Object-safe version of [`TaskExecutor`] with boxed futures.
pub trait TaskExecutorDyn: Send + Sync {
    fn dispatch_boxed<'a>(
        &'a self,
        request: DispatchRequest,
    ) -> Pin<Box<dyn Future<Output = Result<TaskOutputs, ExecutionFailure>> + Send + 'a>>;
}

impl<T: TaskExecutor> TaskExecutorDyn for T {
    fn dispatch_boxed<'a>(
        &'a self,
        request: DispatchRequest,
    ) -> Pin<Box<dyn Future<Output = Result<TaskOutputs, ExecutionFailure>> + Send + 'a>> {
        Box::pin(self.dispatch(request))
    }
}

/// Type-erased executor so one engine can be wired to any executor at runtime.
pub struct BoxTaskExecutor {
    inner: Box<dyn TaskExecutorDyn + Send + Sync>,
}

impl BoxTaskExecutor {
    pub fn new<T: TaskExecutor + 'static>(executor: T) -> Self {
        Self {
            inner: Box::new(executor),
        }
    }

    pub async fn dispatch(&self, request: DispatchRequest) -> Result<TaskOutputs, ExecutionFailure> {
        self.inner.dispatch_boxed(request).await
    }
}

// ---------------------------------------------------------------------------
// ArtifactTransfer
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("unsupported artifact uri: {0}")]
    UnsupportedUri(String),

    #[error("artifact not found: {0}")]
    NotFound(String),

    #[error("digest mismatch for {uri}: expected {expected}, got {actual}")]
    DigestMismatch {
        uri: String,
        expected: String,
        actual: String,
    },

    #[error("artifact I/O error: {0}")]
    Io(String),
}

/// Moves artifact bytes between executors and a backing store.
pub trait ArtifactTransfer: Send + Sync {
    /// Read the bytes an `ArtifactRef` points to.
    fn fetch(
        &self,
        artifact: &ArtifactRef,
    ) -> impl Future<Output = Result<Vec<u8>, ArtifactError>> + Send;

    /// Store the bytes of output `name` of `task` in `run_id` and return a
    /// reference to them.
    fn publish(
        &self,
        run_id: Uuid,
        task: &str,
        name: &str,
        bytes: Vec<u8>,
    ) -> impl Future<Output = Result<ArtifactRef, ArtifactError>> + Send;
}

// ---------------------------------------------------------------------------
// Test executor
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted executor used by the scheduler and coordinator tests.

    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use dashmap::DashMap;
    use serde_json::Value;
    use tokio::time::Instant;

    use super::*;

    /// What a task does when dispatched.
    #[derive(Debug, Clone)]
    pub enum Behavior {
        /// Succeed immediately with these outputs.
        Succeed(Vec<(String, Value)>),
        /// Fail the first `failures` attempts, then succeed with the outputs.
        FailThenSucceed {
            failures: u32,
            retryable: bool,
            outputs: Vec<(String, Value)>,
        },
        /// Always fail.
        Fail { retryable: bool },
        /// Sleep for the duration (or until cancelled), then succeed.
        Sleep(Duration),
        /// Emit the same output twice.
        Duplicate(String),
    }

    #[derive(Debug, Clone)]
    pub struct Dispatched {
        pub task: String,
        pub attempt: u32,
        pub at: Instant,
        pub inputs: BTreeMap<String, StoredValue>,
    }

    #[derive(Default)]
    pub struct ScriptedExecutor {
        behaviors: DashMap<String, Behavior>,
        log: std::sync::Mutex<Vec<Dispatched>>,
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    impl ScriptedExecutor {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn script(&self, task: &str, behavior: Behavior) {
            self.behaviors.insert(task.to_string(), behavior);
        }

        pub fn log(&self) -> Vec<Dispatched> {
            self.log.lock().map(|l| l.clone()).unwrap_or_default()
        }

        pub fn attempts(&self, task: &str) -> Vec<Dispatched> {
            self.log().into_iter().filter(|d| d.task == task).collect()
        }

        pub fn order(&self) -> Vec<String> {
            self.log().into_iter().map(|d| d.task).collect()
        }

        pub fn peak_concurrency(&self) -> usize {
            self.peak.load(Ordering::SeqCst)
        }
    }

    fn outputs(values: &[(String, Value)]) -> TaskOutputs {
        values
            .iter()
            .fold(TaskOutputs::new(), |o, (n, v)| o.with(n.clone(), v.clone()))
    }

    impl TaskExecutor for Arc<ScriptedExecutor> {
        async fn dispatch(&self, request: DispatchRequest) -> Result<TaskOutputs, ExecutionFailure> {
            self.log.lock().unwrap().push(Dispatched {
                task: request.task_name.clone(),
                attempt: request.attempt,
                at: Instant::now(),
                inputs: request.inputs.clone(),
            });
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);

            let behavior = self
                .behaviors
                .get(&request.task_name)
                .map(|b| b.value().clone())
                .unwrap_or(Behavior::Succeed(Vec::new()));

            let result = match behavior {
                Behavior::Succeed(values) => {
                    tokio::task::yield_now().await;
                    Ok(outputs(&values))
                }
                Behavior::FailThenSucceed {
                    failures,
                    retryable,
                    outputs: values,
                } => {
                    if request.attempt <= failures {
                        Err(ExecutionFailure {
                            retryable,
                            message: format!("attempt {} failed", request.attempt),
                        })
                    } else {
                        Ok(outputs(&values))
                    }
                }
                Behavior::Fail { retryable } => Err(ExecutionFailure {
                    retryable,
                    message: "scripted failure".to_string(),
                }),
                Behavior::Sleep(d) => {
                    tokio::select! {
                        _ = tokio::time::sleep(d) => Ok(TaskOutputs::new()),
                        _ = request.cancel.cancelled() => Err(ExecutionFailure::permanent("cancelled")),
                    }
                }
                Behavior::Duplicate(name) => Ok(TaskOutputs::new()
                    .with(name.clone(), Value::from(1))
                    .with(name, Value::from(2))),
            };

            self.running.fetch_sub(1, Ordering::SeqCst);
            result
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoExecutor;

    impl TaskExecutor for EchoExecutor {
        async fn dispatch(&self, request: DispatchRequest) -> Result<TaskOutputs, ExecutionFailure> {
            if request.attempt > 1 {
                return Err(ExecutionFailure::permanent("only one attempt"));
            }
            let mut out = TaskOutputs::new();
            for (name, value) in request.inputs {
                out.push(name, value);
            }
            Ok(out)
        }
    }

    fn request(attempt: u32) -> DispatchRequest {
        DispatchRequest {
            run_id: Uuid::now_v7(),
            task_name: "echo".into(),
            attempt,
            spec: ExecutorSpec::Custom {
                kind: "echo".into(),
                config: json!({}),
            },
            inputs: BTreeMap::from([("msg".to_string(), StoredValue::Parameter(json!("hi")))]),
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_box_executor_delegates() {
        let executor = BoxTaskExecutor::new(EchoExecutor);
        let out = executor.dispatch(request(1)).await.unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(
            out.iter().next(),
            Some(("msg", &StoredValue::Parameter(json!("hi"))))
        );

        let err = executor.dispatch(request(2)).await.unwrap_err();
        assert!(!err.retryable);
        assert_eq!(err.to_string(), "only one attempt");
    }

    #[test]
    fn test_task_outputs_keep_duplicates() {
        let out = TaskOutputs::new().with("a", json!(1)).with("a", json!(2));
        assert_eq!(out.len(), 2);
        let names: Vec<String> = out.into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["a", "a"]);
    }
}
