//! Run repository trait and in-memory implementation.
//!
//! Persists run records and their task instances so that `status` keeps
//! answering after the in-memory driver is gone (completed runs, process
//! restarts). The infrastructure layer (weft-infra) implements this trait
//! with SQLite.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use uuid::Uuid;
use weft_types::error::RepositoryError;
use weft_types::workflow::{RunRecord, RunStatus, TaskInstance};

/// Storage port for runs and task instances.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait RunRepository: Send + Sync {
    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    /// Insert a new run. Fails with `Conflict` if the ID already exists.
    fn create_run(
        &self,
        run: &RunRecord,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Overwrite a run's mutable fields (status, error, finished_at).
    fn update_run(
        &self,
        run: &RunRecord,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_run(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<RunRecord>, RepositoryError>> + Send;

    /// List runs, newest first, optionally filtered by workflow name.
    fn list_runs(
        &self,
        workflow_name: Option<&str>,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<RunRecord>, RepositoryError>> + Send;

    /// Runs persisted as `pending` or `running` (left behind by a previous
    /// process).
    fn list_interrupted_runs(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<RunRecord>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Task instances
    // -----------------------------------------------------------------------

    /// Insert or replace the instance identified by `(run_id, task_name)`.
    /// First insertion fixes its position in `list_task_instances`.
    fn upsert_task_instance(
        &self,
        instance: &TaskInstance,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// All instances of a run, in first-insertion order.
    fn list_task_instances(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<TaskInstance>, RepositoryError>> + Send;
}

// ---------------------------------------------------------------------------
// MemoryRunRepository
// ---------------------------------------------------------------------------

/// `DashMap`-backed repository. Nothing survives the process; clones share
/// the same maps.
#[derive(Debug, Default, Clone)]
pub struct MemoryRunRepository {
    runs: Arc<DashMap<Uuid, RunRecord>>,
    instances: Arc<DashMap<Uuid, Vec<TaskInstance>>>,
}

impl MemoryRunRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RunRepository for MemoryRunRepository {
    async fn create_run(&self, run: &RunRecord) -> Result<(), RepositoryError> {
        match self.runs.entry(run.id) {
            Entry::Occupied(_) => Err(RepositoryError::Conflict(format!(
                "run {} already exists",
                run.id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(run.clone());
                Ok(())
            }
        }
    }

    async fn update_run(&self, run: &RunRecord) -> Result<(), RepositoryError> {
        let mut existing = self.runs.get_mut(&run.id).ok_or(RepositoryError::NotFound)?;
        *existing = run.clone();
        Ok(())
    }

    async fn get_run(&self, run_id: &Uuid) -> Result<Option<RunRecord>, RepositoryError> {
        Ok(self.runs.get(run_id).map(|r| r.value().clone()))
    }

    async fn list_runs(
        &self,
        workflow_name: Option<&str>,
        limit: u32,
    ) -> Result<Vec<RunRecord>, RepositoryError> {
        let mut runs: Vec<RunRecord> = self
            .runs
            .iter()
            .filter(|r| workflow_name.is_none_or(|name| r.workflow_name == name))
            .map(|r| r.value().clone())
            .collect();
        // UUIDv7 sorts by creation time.
        runs.sort_by(|a, b| b.id.cmp(&a.id));
        runs.truncate(limit as usize);
        Ok(runs)
    }

    async fn list_interrupted_runs(&self) -> Result<Vec<RunRecord>, RepositoryError> {
        let mut runs: Vec<RunRecord> = self
            .runs
            .iter()
            .filter(|r| matches!(r.status, RunStatus::Pending | RunStatus::Running))
            .map(|r| r.value().clone())
            .collect();
        runs.sort_by_key(|r| r.id);
        Ok(runs)
    }

    async fn upsert_task_instance(&self, instance: &TaskInstance) -> Result<(), RepositoryError> {
        let mut list = self.instances.entry(instance.run_id).or_default();
        match list.iter_mut().find(|i| i.task_name == instance.task_name) {
            Some(existing) => *existing = instance.clone(),
            None => list.push(instance.clone()),
        }
        Ok(())
    }

    async fn list_task_instances(&self, run_id: &Uuid) -> Result<Vec<TaskInstance>, RepositoryError> {
        Ok(self
            .instances
            .get(run_id)
            .map(|l| l.value().clone())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::BTreeMap;
    use weft_types::workflow::TaskStatus;

    fn run(workflow: &str, status: RunStatus) -> RunRecord {
        RunRecord {
            id: Uuid::now_v7(),
            workflow_name: workflow.to_string(),
            definition_hash: "abc".to_string(),
            params: BTreeMap::new(),
            status,
            error: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    #[tokio::test]
    async fn create_get_update_run() {
        let repo = MemoryRunRepository::new();
        let mut r = run("wf", RunStatus::Running);
        repo.create_run(&r).await.unwrap();
        assert!(matches!(
            repo.create_run(&r).await,
            Err(RepositoryError::Conflict(_))
        ));

        r.status = RunStatus::Succeeded;
        r.finished_at = Some(Utc::now());
        repo.update_run(&r).await.unwrap();
        assert_eq!(repo.get_run(&r.id).await.unwrap(), Some(r.clone()));

        let missing = run("wf", RunStatus::Running);
        assert!(matches!(
            repo.update_run(&missing).await,
            Err(RepositoryError::NotFound)
        ));
    }

    #[tokio::test]
    async fn list_runs_newest_first_and_filtered() {
        let repo = MemoryRunRepository::new();
        let a = run("alpha", RunStatus::Succeeded);
        let b = run("beta", RunStatus::Running);
        let c = run("alpha", RunStatus::Failed);
        for r in [&a, &b, &c] {
            repo.create_run(r).await.unwrap();
        }

        let all = repo.list_runs(None, 10).await.unwrap();
        assert_eq!(all.iter().map(|r| r.id).collect::<Vec<_>>(), vec![c.id, b.id, a.id]);

        let alpha = repo.list_runs(Some("alpha"), 1).await.unwrap();
        assert_eq!(alpha.len(), 1);
        assert_eq!(alpha[0].id, c.id);

        let interrupted = repo.list_interrupted_runs().await.unwrap();
        assert_eq!(interrupted.len(), 1);
        assert_eq!(interrupted[0].id, b.id);
    }

    #[tokio::test]
    async fn upsert_keeps_first_insertion_order() {
        let repo = MemoryRunRepository::new();
        let run_id = Uuid::now_v7();
        for name in ["build", "test", "deploy"] {
            repo.upsert_task_instance(&TaskInstance::pending(run_id, name))
                .await
                .unwrap();
        }
        let mut test = TaskInstance::pending(run_id, "test");
        test.status = TaskStatus::Succeeded;
        test.attempt = 2;
        repo.upsert_task_instance(&test).await.unwrap();

        let list = repo.list_task_instances(&run_id).await.unwrap();
        let names: Vec<_> = list.iter().map(|i| i.task_name.as_str()).collect();
        assert_eq!(names, vec!["build", "test", "deploy"]);
        assert_eq!(list[1].status, TaskStatus::Succeeded);
        assert!(repo.list_task_instances(&Uuid::now_v7()).await.unwrap().is_empty());
    }
}
