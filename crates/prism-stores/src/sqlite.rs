//! SQLite-backed TaskStore
//!
//! One database file per workspace (`orchestrator_results.db`) holding the
//! `worker_runs` and `task_outputs` relations plus the `task_plan` planning
//! table. All writes go through the pool and commit synchronously.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};

use prism_core::store::{
    PlanRecord, RunSummary, StoreError, TaskOutputRecord, TaskStatus, TaskStore, WorkerRunRecord,
};
use prism_core::types::TaskId;

/// TaskStore backed by a local SQLite database.
pub struct SqliteTaskStore {
    pool: SqlitePool,
}

impl SqliteTaskStore {
    /// Open (or create) the database file and initialize the schema.
    pub async fn connect(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| StoreError::Database(e.to_string()))?;
            }
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(db_err)?;
        let store = Self { pool };
        store.init_schema().await?;
        tracing::info!(path = %path.display(), "task store opened");
        Ok(store)
    }

    /// Fresh in-memory database, for tests.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(db_err)?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS worker_runs (
                run_id TEXT NOT NULL,
                task_id TEXT NOT NULL,
                agent_id TEXT NOT NULL,
                status TEXT NOT NULL,
                started_at TEXT NOT NULL,
                completed_at TEXT,
                duration_ms INTEGER,
                error TEXT,
                artifact_ref TEXT,
                PRIMARY KEY (run_id, task_id)
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS task_outputs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL,
                task_id TEXT NOT NULL,
                agent_id TEXT NOT NULL,
                output_json TEXT NOT NULL,
                metadata_json TEXT NOT NULL,
                created_at TEXT NOT NULL,
                FOREIGN KEY (run_id, task_id) REFERENCES worker_runs(run_id, task_id)
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS task_plan (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL,
                task_id TEXT NOT NULL,
                agent_id TEXT,
                agent_description TEXT NOT NULL,
                dependency_path TEXT NOT NULL,
                tools TEXT NOT NULL,
                tool_params TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        for statement in [
            "CREATE INDEX IF NOT EXISTS idx_worker_runs_run ON worker_runs(run_id)",
            "CREATE INDEX IF NOT EXISTS idx_worker_runs_task ON worker_runs(task_id)",
            "CREATE INDEX IF NOT EXISTS idx_task_outputs_run ON task_outputs(run_id)",
            "CREATE INDEX IF NOT EXISTS idx_task_outputs_task ON task_outputs(task_id)",
            "CREATE INDEX IF NOT EXISTS idx_task_plan_run ON task_plan(run_id)",
        ] {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(db_err)?;
        }

        Ok(())
    }
}

fn db_err(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

fn json_err(e: serde_json::Error) -> StoreError {
    StoreError::Serialization(e.to_string())
}

fn parse_ts(value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Serialization(format!("bad timestamp '{value}': {e}")))
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .map(|db| matches!(db.kind(), sqlx::error::ErrorKind::UniqueViolation))
        .unwrap_or(false)
}

fn decode_run_row(row: &sqlx::sqlite::SqliteRow) -> Result<WorkerRunRecord, StoreError> {
    let status: String = row.try_get("status").map_err(db_err)?;
    let started_at: String = row.try_get("started_at").map_err(db_err)?;
    let completed_at: Option<String> = row.try_get("completed_at").map_err(db_err)?;
    Ok(WorkerRunRecord {
        run_id: row.try_get("run_id").map_err(db_err)?,
        task_id: row.try_get("task_id").map_err(db_err)?,
        agent_id: row.try_get("agent_id").map_err(db_err)?,
        status: TaskStatus::parse(&status)?,
        started_at: parse_ts(&started_at)?,
        completed_at: completed_at.as_deref().map(parse_ts).transpose()?,
        duration_ms: row.try_get("duration_ms").map_err(db_err)?,
        error: row.try_get("error").map_err(db_err)?,
        artifact_ref: row.try_get("artifact_ref").map_err(db_err)?,
    })
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn start_task(
        &self,
        run_id: &str,
        task_id: &str,
        agent_id: &str,
        started_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "INSERT INTO worker_runs (run_id, task_id, agent_id, status, started_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(run_id)
        .bind(task_id)
        .bind(agent_id)
        .bind(TaskStatus::Running.as_str())
        .bind(started_at.to_rfc3339())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(StoreError::AlreadyStarted {
                run_id: run_id.to_string(),
                task_id: task_id.to_string(),
            }),
            Err(e) => Err(db_err(e)),
        }
    }

    async fn complete_task(
        &self,
        run_id: &str,
        task_id: &str,
        duration_ms: i64,
        artifact_ref: Option<&str>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE worker_runs
             SET status = ?, completed_at = ?, duration_ms = ?, artifact_ref = ?
             WHERE run_id = ? AND task_id = ? AND status = ?",
        )
        .bind(TaskStatus::Success.as_str())
        .bind(Utc::now().to_rfc3339())
        .bind(duration_ms)
        .bind(artifact_ref)
        .bind(run_id)
        .bind(task_id)
        .bind(TaskStatus::Running.as_str())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("running task '{task_id}'")));
        }
        Ok(())
    }

    async fn fail_task(
        &self,
        run_id: &str,
        task_id: &str,
        duration_ms: i64,
        error: &str,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE worker_runs
             SET status = ?, completed_at = ?, duration_ms = ?, error = ?
             WHERE run_id = ? AND task_id = ? AND status = ?",
        )
        .bind(TaskStatus::Failed.as_str())
        .bind(Utc::now().to_rfc3339())
        .bind(duration_ms)
        .bind(error)
        .bind(run_id)
        .bind(task_id)
        .bind(TaskStatus::Running.as_str())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("running task '{task_id}'")));
        }
        Ok(())
    }

    async fn record_failure(
        &self,
        run_id: &str,
        task_id: &str,
        agent_id: &str,
        error: &str,
    ) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            "INSERT INTO worker_runs
             (run_id, task_id, agent_id, status, started_at, completed_at, duration_ms, error)
             VALUES (?, ?, ?, ?, ?, ?, 0, ?)",
        )
        .bind(run_id)
        .bind(task_id)
        .bind(agent_id)
        .bind(TaskStatus::Failed.as_str())
        .bind(&now)
        .bind(&now)
        .bind(error)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(StoreError::AlreadyStarted {
                run_id: run_id.to_string(),
                task_id: task_id.to_string(),
            }),
            Err(e) => Err(db_err(e)),
        }
    }

    async fn store_output(
        &self,
        run_id: &str,
        task_id: &str,
        agent_id: &str,
        output: &Value,
        metadata: &Value,
    ) -> Result<(), StoreError> {
        let status = self.task_status(run_id, task_id).await?;
        if status != Some(TaskStatus::Success) {
            return Err(StoreError::Internal(format!(
                "output stored for task '{task_id}' before successful completion"
            )));
        }

        sqlx::query(
            "INSERT INTO task_outputs (run_id, task_id, agent_id, output_json, metadata_json, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(run_id)
        .bind(task_id)
        .bind(agent_id)
        .bind(serde_json::to_string(output).map_err(json_err)?)
        .bind(serde_json::to_string(metadata).map_err(json_err)?)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_output(
        &self,
        run_id: &str,
        task_id: &str,
    ) -> Result<Option<TaskOutputRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT run_id, task_id, agent_id, output_json, metadata_json, created_at
             FROM task_outputs
             WHERE run_id = ? AND task_id = ?
             ORDER BY id DESC LIMIT 1",
        )
        .bind(run_id)
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.map(|row| decode_output_row(&row)).transpose()
    }

    async fn all_outputs(&self, run_id: &str) -> Result<Vec<TaskOutputRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT run_id, task_id, agent_id, output_json, metadata_json, created_at
             FROM task_outputs
             WHERE run_id = ?
             ORDER BY id ASC",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(decode_output_row).collect()
    }

    async fn task_status(
        &self,
        run_id: &str,
        task_id: &str,
    ) -> Result<Option<TaskStatus>, StoreError> {
        let row = sqlx::query("SELECT status FROM worker_runs WHERE run_id = ? AND task_id = ?")
            .bind(run_id)
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        row.map(|row| {
            let status: String = row.try_get("status").map_err(db_err)?;
            TaskStatus::parse(&status)
        })
        .transpose()
    }

    async fn are_dependencies_complete(
        &self,
        run_id: &str,
        dependency_ids: &[TaskId],
    ) -> Result<bool, StoreError> {
        for dep in dependency_ids {
            if self.task_status(run_id, dep).await? != Some(TaskStatus::Success) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn run_summary(&self, run_id: &str) -> Result<RunSummary, StoreError> {
        let row = sqlx::query(
            "SELECT
                COUNT(*) AS total,
                SUM(CASE WHEN status = 'success' THEN 1 ELSE 0 END) AS successful,
                SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END) AS failed,
                SUM(CASE WHEN status = 'running' THEN 1 ELSE 0 END) AS running,
                AVG(duration_ms) AS avg_duration_ms,
                SUM(duration_ms) AS total_duration_ms
             FROM worker_runs
             WHERE run_id = ?",
        )
        .bind(run_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        let agent_rows = sqlx::query(
            "SELECT DISTINCT agent_id FROM worker_runs WHERE run_id = ? ORDER BY agent_id",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let agents_used = agent_rows
            .iter()
            .map(|r| r.try_get::<String, _>("agent_id").map_err(db_err))
            .collect::<Result<Vec<String>, StoreError>>()?;

        Ok(RunSummary {
            run_id: run_id.to_string(),
            total_tasks: row.try_get::<i64, _>("total").map_err(db_err)? as usize,
            successful: row
                .try_get::<Option<i64>, _>("successful")
                .map_err(db_err)?
                .unwrap_or(0) as usize,
            failed: row
                .try_get::<Option<i64>, _>("failed")
                .map_err(db_err)?
                .unwrap_or(0) as usize,
            running: row
                .try_get::<Option<i64>, _>("running")
                .map_err(db_err)?
                .unwrap_or(0) as usize,
            agents_used,
            avg_duration_ms: row.try_get("avg_duration_ms").map_err(db_err)?,
            total_duration_ms: row
                .try_get::<Option<i64>, _>("total_duration_ms")
                .map_err(db_err)?
                .map(|v| v as f64),
        })
    }

    async fn failed_tasks(&self, run_id: &str) -> Result<Vec<WorkerRunRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT run_id, task_id, agent_id, status, started_at, completed_at,
                    duration_ms, error, artifact_ref
             FROM worker_runs
             WHERE run_id = ? AND status = 'failed'
             ORDER BY task_id ASC",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(decode_run_row).collect()
    }

    async fn insert_plan_row(&self, run_id: &str, record: &PlanRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO task_plan
             (run_id, task_id, agent_id, agent_description, dependency_path, tools, tool_params, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(run_id)
        .bind(&record.task_id)
        .bind(&record.agent_id)
        .bind(&record.agent_description)
        .bind(serde_json::to_string(&record.dependency_path).map_err(json_err)?)
        .bind(serde_json::to_string(&record.tools).map_err(json_err)?)
        .bind(serde_json::to_string(&record.tool_params).map_err(json_err)?)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn update_plan_tools(
        &self,
        run_id: &str,
        task_id: &str,
        tools: &[String],
        tool_params: &Value,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE task_plan SET tools = ?, tool_params = ? WHERE run_id = ? AND task_id = ?")
            .bind(serde_json::to_string(tools).map_err(json_err)?)
            .bind(serde_json::to_string(tool_params).map_err(json_err)?)
            .bind(run_id)
            .bind(task_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn plan_rows(&self, run_id: &str) -> Result<Vec<PlanRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT task_id, agent_id, agent_description, dependency_path, tools, tool_params
             FROM task_plan
             WHERE run_id = ?
             ORDER BY id ASC",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter()
            .map(|row| {
                let dependency_path: String = row.try_get("dependency_path").map_err(db_err)?;
                let tools: String = row.try_get("tools").map_err(db_err)?;
                let tool_params: String = row.try_get("tool_params").map_err(db_err)?;
                Ok(PlanRecord {
                    task_id: row.try_get("task_id").map_err(db_err)?,
                    agent_id: row.try_get("agent_id").map_err(db_err)?,
                    agent_description: row.try_get("agent_description").map_err(db_err)?,
                    dependency_path: serde_json::from_str(&dependency_path).map_err(json_err)?,
                    tools: serde_json::from_str(&tools).map_err(json_err)?,
                    tool_params: serde_json::from_str(&tool_params).map_err(json_err)?,
                })
            })
            .collect()
    }
}

fn decode_output_row(row: &sqlx::sqlite::SqliteRow) -> Result<TaskOutputRecord, StoreError> {
    let output_json: String = row.try_get("output_json").map_err(db_err)?;
    let metadata_json: String = row.try_get("metadata_json").map_err(db_err)?;
    let created_at: String = row.try_get("created_at").map_err(db_err)?;
    Ok(TaskOutputRecord {
        run_id: row.try_get("run_id").map_err(db_err)?,
        task_id: row.try_get("task_id").map_err(db_err)?,
        agent_id: row.try_get("agent_id").map_err(db_err)?,
        output: serde_json::from_str(&output_json).map_err(json_err)?,
        metadata: serde_json::from_str(&metadata_json).map_err(json_err)?,
        created_at: parse_ts(&created_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_lifecycle_round_trip() {
        let store = SqliteTaskStore::in_memory().await.expect("store");
        store
            .start_task("r1", "t1", "market_data", Utc::now())
            .await
            .expect("start");
        assert_eq!(
            store.task_status("r1", "t1").await.expect("status"),
            Some(TaskStatus::Running)
        );

        store
            .complete_task("r1", "t1", 42, Some("agents/market_data/out/000001.json"))
            .await
            .expect("complete");

        let output = json!([{"symbol": "ZN", "price": 112.5}]);
        let metadata = json!({"row_count": 1});
        store
            .store_output("r1", "t1", "market_data", &output, &metadata)
            .await
            .expect("store output");

        let record = store
            .get_output("r1", "t1")
            .await
            .expect("get output")
            .expect("present");
        assert_eq!(record.output, output);
        assert_eq!(record.metadata, metadata);
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let store = SqliteTaskStore::in_memory().await.expect("store");
        store
            .start_task("r1", "t1", "a", Utc::now())
            .await
            .expect("first");
        let err = store
            .start_task("r1", "t1", "a", Utc::now())
            .await
            .expect_err("second");
        assert!(matches!(err, StoreError::AlreadyStarted { .. }));
    }

    #[tokio::test]
    async fn test_transitions_are_monotonic() {
        let store = SqliteTaskStore::in_memory().await.expect("store");
        store
            .start_task("r1", "t1", "a", Utc::now())
            .await
            .expect("start");
        store.fail_task("r1", "t1", 3, "boom").await.expect("fail");

        // A terminal task cannot transition again
        let err = store
            .complete_task("r1", "t1", 4, None)
            .await
            .expect_err("complete after fail");
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_stored_output_is_bit_identical() {
        let store = SqliteTaskStore::in_memory().await.expect("store");
        store
            .start_task("r1", "t1", "a", Utc::now())
            .await
            .expect("start");
        store
            .complete_task("r1", "t1", 1, None)
            .await
            .expect("complete");

        let output = json!({"nested": {"values": [1, 2.5, "three", null, true]}});
        store
            .store_output("r1", "t1", "a", &output, &json!({}))
            .await
            .expect("store");
        let read = store
            .get_output("r1", "t1")
            .await
            .expect("read")
            .expect("present");
        assert_eq!(read.output, output);
    }

    #[tokio::test]
    async fn test_plan_rows_enriched_by_stage2() {
        let store = SqliteTaskStore::in_memory().await.expect("store");
        let record = PlanRecord {
            task_id: "t1".to_string(),
            agent_id: Some("market_data".to_string()),
            agent_description: "SQL market data".to_string(),
            dependency_path: vec!["t1".to_string()],
            tools: Vec::new(),
            tool_params: json!({}),
        };
        store
            .insert_plan_row("r1", &record)
            .await
            .expect("insert");

        store
            .update_plan_tools(
                "r1",
                "t1",
                &["run_query".to_string()],
                &json!({"run_query": {"limit": 1}}),
            )
            .await
            .expect("update");

        let rows = store.plan_rows("r1").await.expect("rows");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].tools, vec!["run_query".to_string()]);
        assert_eq!(rows[0].tool_params["run_query"]["limit"], json!(1));
    }

    #[tokio::test]
    async fn test_summary_and_failed_tasks() {
        let store = SqliteTaskStore::in_memory().await.expect("store");
        store
            .start_task("r1", "t1", "a", Utc::now())
            .await
            .expect("start");
        store
            .complete_task("r1", "t1", 10, None)
            .await
            .expect("complete");
        store
            .record_failure("r1", "t2", "b", "upstream failure: t1")
            .await
            .expect("record");

        let summary = store.run_summary("r1").await.expect("summary");
        assert_eq!(summary.total_tasks, 2);
        assert_eq!(summary.successful, 1);
        assert_eq!(summary.failed, 1);

        let failed = store.failed_tasks("r1").await.expect("failed");
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].task_id, "t2");
        assert_eq!(failed[0].error.as_deref(), Some("upstream failure: t1"));
    }
}
