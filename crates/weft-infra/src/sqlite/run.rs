//! SQLite run repository implementation.
//!
//! Implements `RunRepository` from `weft-core` using sqlx with split
//! read/write pools. Parameters, inputs, outputs and task errors are stored as
//! JSON text; statuses use their snake_case names.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use sqlx::Row;
use uuid::Uuid;
use weft_core::repository::run::RunRepository;
use weft_types::error::RepositoryError;
use weft_types::workflow::{RunRecord, RunStatus, StoredValue, TaskError, TaskInstance, TaskStatus};

use super::pool::DatabasePool;

/// SQLite-backed implementation of `RunRepository`.
pub struct SqliteRunRepository {
    pool: DatabasePool,
}

impl SqliteRunRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct RunRow {
    id: String,
    workflow_name: String,
    definition_hash: String,
    params: String,
    status: String,
    error: Option<String>,
    started_at: String,
    finished_at: Option<String>,
}

impl RunRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            workflow_name: row.try_get("workflow_name")?,
            definition_hash: row.try_get("definition_hash")?,
            params: row.try_get("params")?,
            status: row.try_get("status")?,
            error: row.try_get("error")?,
            started_at: row.try_get("started_at")?,
            finished_at: row.try_get("finished_at")?,
        })
    }

    fn into_run(self) -> Result<RunRecord, RepositoryError> {
        let status: RunStatus = self
            .status
            .parse()
            .map_err(|e: String| RepositoryError::Query(e))?;
        let params: BTreeMap<String, serde_json::Value> = serde_json::from_str(&self.params)
            .map_err(|e| RepositoryError::Query(format!("invalid params JSON: {e}")))?;

        Ok(RunRecord {
            id: parse_uuid(&self.id)?,
            workflow_name: self.workflow_name,
            definition_hash: self.definition_hash,
            params,
            status,
            error: self.error,
            started_at: parse_datetime(&self.started_at)?,
            finished_at: self.finished_at.as_deref().map(parse_datetime).transpose()?,
        })
    }
}

struct TaskInstanceRow {
    run_id: String,
    task_name: String,
    status: String,
    attempt: i64,
    inputs: String,
    outputs: String,
    error: Option<String>,
    started_at: Option<String>,
    finished_at: Option<String>,
}

impl TaskInstanceRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            run_id: row.try_get("run_id")?,
            task_name: row.try_get("task_name")?,
            status: row.try_get("status")?,
            attempt: row.try_get("attempt")?,
            inputs: row.try_get("inputs")?,
            outputs: row.try_get("outputs")?,
            error: row.try_get("error")?,
            started_at: row.try_get("started_at")?,
            finished_at: row.try_get("finished_at")?,
        })
    }

    fn into_instance(self) -> Result<TaskInstance, RepositoryError> {
        let status: TaskStatus = self
            .status
            .parse()
            .map_err(|e: String| RepositoryError::Query(e))?;
        let inputs: BTreeMap<String, StoredValue> = serde_json::from_str(&self.inputs)
            .map_err(|e| RepositoryError::Query(format!("invalid inputs JSON: {e}")))?;
        let outputs: BTreeMap<String, StoredValue> = serde_json::from_str(&self.outputs)
            .map_err(|e| RepositoryError::Query(format!("invalid outputs JSON: {e}")))?;
        let error: Option<TaskError> = self
            .error
            .as_deref()
            .map(|s| {
                serde_json::from_str(s)
                    .map_err(|e| RepositoryError::Query(format!("invalid task error JSON: {e}")))
            })
            .transpose()?;

        Ok(TaskInstance {
            run_id: parse_uuid(&self.run_id)?,
            task_name: self.task_name,
            status,
            attempt: u32::try_from(self.attempt)
                .map_err(|_| RepositoryError::Query(format!("invalid attempt: {}", self.attempt)))?,
            inputs,
            outputs,
            error,
            started_at: self.started_at.as_deref().map(parse_datetime).transpose()?,
            finished_at: self.finished_at.as_deref().map(parse_datetime).transpose()?,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, RepositoryError> {
    serde_json::to_string(value).map_err(|e| RepositoryError::Query(e.to_string()))
}

fn rows_to_runs(rows: &[sqlx::sqlite::SqliteRow]) -> Result<Vec<RunRecord>, RepositoryError> {
    let mut runs = Vec::with_capacity(rows.len());
    for row in rows {
        let r = RunRow::from_row(row).map_err(|e| RepositoryError::Query(e.to_string()))?;
        runs.push(r.into_run()?);
    }
    Ok(runs)
}

// ---------------------------------------------------------------------------
// RunRepository impl
// ---------------------------------------------------------------------------

impl RunRepository for SqliteRunRepository {
    async fn create_run(&self, run: &RunRecord) -> Result<(), RepositoryError> {
        let params = to_json(&run.params)?;

        sqlx::query(
            r#"INSERT INTO runs
               (id, workflow_name, definition_hash, params, status, error, started_at, finished_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(run.id.to_string())
        .bind(&run.workflow_name)
        .bind(&run.definition_hash)
        .bind(&params)
        .bind(run.status.as_str())
        .bind(&run.error)
        .bind(format_datetime(&run.started_at))
        .bind(run.finished_at.as_ref().map(format_datetime))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| match e.as_database_error() {
            Some(db) if db.is_unique_violation() => {
                RepositoryError::Conflict(format!("run {} already exists", run.id))
            }
            _ => RepositoryError::Query(e.to_string()),
        })?;

        Ok(())
    }

    async fn update_run(&self, run: &RunRecord) -> Result<(), RepositoryError> {
        let params = to_json(&run.params)?;

        let result = sqlx::query(
            "UPDATE runs SET params = ?, status = ?, error = ?, finished_at = ? WHERE id = ?",
        )
        .bind(&params)
        .bind(run.status.as_str())
        .bind(&run.error)
        .bind(run.finished_at.as_ref().map(format_datetime))
        .bind(run.id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn get_run(&self, run_id: &Uuid) -> Result<Option<RunRecord>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM runs WHERE id = ?")
            .bind(run_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match row {
            Some(row) => {
                let r = RunRow::from_row(&row).map_err(|e| RepositoryError::Query(e.to_string()))?;
                Ok(Some(r.into_run()?))
            }
            None => Ok(None),
        }
    }

    async fn list_runs(
        &self,
        workflow_name: Option<&str>,
        limit: u32,
    ) -> Result<Vec<RunRecord>, RepositoryError> {
        // UUIDv7 text sorts by creation time.
        let rows = match workflow_name {
            Some(name) => {
                sqlx::query("SELECT * FROM runs WHERE workflow_name = ? ORDER BY id DESC LIMIT ?")
                    .bind(name)
                    .bind(i64::from(limit))
                    .fetch_all(&self.pool.reader)
                    .await
            }
            None => {
                sqlx::query("SELECT * FROM runs ORDER BY id DESC LIMIT ?")
                    .bind(i64::from(limit))
                    .fetch_all(&self.pool.reader)
                    .await
            }
        }
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        rows_to_runs(&rows)
    }

    async fn list_interrupted_runs(&self) -> Result<Vec<RunRecord>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM runs WHERE status IN ('pending', 'running') ORDER BY id ASC",
        )
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        rows_to_runs(&rows)
    }

    async fn upsert_task_instance(&self, instance: &TaskInstance) -> Result<(), RepositoryError> {
        let inputs = to_json(&instance.inputs)?;
        let outputs = to_json(&instance.outputs)?;
        let error = instance.error.as_ref().map(to_json).transpose()?;

        sqlx::query(
            r#"INSERT INTO task_instances
               (run_id, task_name, status, attempt, inputs, outputs, error, started_at, finished_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(run_id, task_name) DO UPDATE SET
                 status = excluded.status,
                 attempt = excluded.attempt,
                 inputs = excluded.inputs,
                 outputs = excluded.outputs,
                 error = excluded.error,
                 started_at = excluded.started_at,
                 finished_at = excluded.finished_at"#,
        )
        .bind(instance.run_id.to_string())
        .bind(&instance.task_name)
        .bind(instance.status.as_str())
        .bind(i64::from(instance.attempt))
        .bind(&inputs)
        .bind(&outputs)
        .bind(&error)
        .bind(instance.started_at.as_ref().map(format_datetime))
        .bind(instance.finished_at.as_ref().map(format_datetime))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(())
    }

    async fn list_task_instances(&self, run_id: &Uuid) -> Result<Vec<TaskInstance>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM task_instances WHERE run_id = ? ORDER BY rowid ASC")
            .bind(run_id.to_string())
            .fetch_all(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let mut instances = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = TaskInstanceRow::from_row(row)
                .map_err(|e| RepositoryError::Query(e.to_string()))?;
            instances.push(r.into_instance()?);
        }
        Ok(instances)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use weft_types::workflow::{ArtifactRef, TaskErrorKind};

    async fn test_repo() -> (SqliteRunRepository, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("test.db").display());
        let pool = DatabasePool::new(&url).await.unwrap();
        (SqliteRunRepository::new(pool), dir)
    }

    fn sample_run(workflow: &str, status: RunStatus) -> RunRecord {
        RunRecord {
            id: Uuid::now_v7(),
            workflow_name: workflow.to_string(),
            definition_hash: "abc123".to_string(),
            params: BTreeMap::from([("env".to_string(), json!("staging"))]),
            status,
            error: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    // -- Runs --

    #[tokio::test]
    async fn test_create_get_update_run() {
        let (repo, _dir) = test_repo().await;
        let mut run = sample_run("release", RunStatus::Running);
        repo.create_run(&run).await.unwrap();

        let loaded = repo.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(loaded, run);

        run.status = RunStatus::Failed;
        run.error = Some("task 'build' failed".to_string());
        run.finished_at = Some(Utc::now());
        repo.update_run(&run).await.unwrap();

        let loaded = repo.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Failed);
        assert_eq!(loaded.error.as_deref(), Some("task 'build' failed"));
        assert_eq!(loaded.finished_at, run.finished_at);
    }

    #[tokio::test]
    async fn test_duplicate_run_conflicts_and_missing_update_not_found() {
        let (repo, _dir) = test_repo().await;
        let run = sample_run("release", RunStatus::Running);
        repo.create_run(&run).await.unwrap();

        let err = repo.create_run(&run).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));

        let missing = sample_run("release", RunStatus::Running);
        let err = repo.update_run(&missing).await.unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound));
        assert!(repo.get_run(&missing.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_runs_newest_first_and_filtered() {
        let (repo, _dir) = test_repo().await;
        let a = sample_run("a", RunStatus::Succeeded);
        let b = sample_run("b", RunStatus::Running);
        let c = sample_run("a", RunStatus::Pending);
        for r in [&a, &b, &c] {
            repo.create_run(r).await.unwrap();
        }

        let all = repo.list_runs(None, 10).await.unwrap();
        let ids: Vec<Uuid> = all.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![c.id, b.id, a.id]);

        let only_a = repo.list_runs(Some("a"), 10).await.unwrap();
        assert_eq!(only_a.len(), 2);
        assert_eq!(repo.list_runs(None, 1).await.unwrap()[0].id, c.id);

        let interrupted: Vec<Uuid> = repo
            .list_interrupted_runs()
            .await
            .unwrap()
            .iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(interrupted, vec![b.id, c.id]);
    }

    // -- Task instances --

    #[tokio::test]
    async fn test_upsert_task_instances_round_trip_and_order() {
        let (repo, _dir) = test_repo().await;
        let run = sample_run("release", RunStatus::Running);
        repo.create_run(&run).await.unwrap();

        for name in ["build", "test", "deploy"] {
            repo.upsert_task_instance(&TaskInstance::pending(run.id, name))
                .await
                .unwrap();
        }

        let mut deploy = TaskInstance::pending(run.id, "deploy");
        deploy.status = TaskStatus::Failed;
        deploy.attempt = 2;
        deploy.inputs.insert("target".into(), StoredValue::Parameter(json!("staging")));
        deploy.outputs.insert(
            "bundle".into(),
            StoredValue::Artifact(ArtifactRef::new("file:///tmp/bundle.tar")),
        );
        deploy.error = Some(TaskError::new(TaskErrorKind::Timeout, "attempt 2 timed out"));
        deploy.started_at = Some(Utc::now());
        deploy.finished_at = Some(Utc::now());
        repo.upsert_task_instance(&deploy).await.unwrap();

        let mut build = TaskInstance::pending(run.id, "build");
        build.status = TaskStatus::Succeeded;
        build.attempt = 1;
        repo.upsert_task_instance(&build).await.unwrap();

        let instances = repo.list_task_instances(&run.id).await.unwrap();
        let names: Vec<&str> = instances.iter().map(|i| i.task_name.as_str()).collect();
        assert_eq!(names, vec!["build", "test", "deploy"]);
        assert_eq!(instances[0].status, TaskStatus::Succeeded);
        assert_eq!(instances[2], deploy);
    }

    #[tokio::test]
    async fn test_instance_requires_existing_run() {
        let (repo, _dir) = test_repo().await;
        let orphan = TaskInstance::pending(Uuid::now_v7(), "build");
        let err = repo.upsert_task_instance(&orphan).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Query(_)));
        assert!(repo.list_task_instances(&orphan.run_id).await.unwrap().is_empty());
    }
}
