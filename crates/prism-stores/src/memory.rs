//! In-memory TaskStore for development and testing

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use prism_core::store::{
    PlanRecord, RunSummary, StoreError, TaskOutputRecord, TaskStatus, TaskStore, WorkerRunRecord,
};
use prism_core::types::TaskId;

/// In-memory implementation backed by `RwLock`-ed maps.
pub struct InMemoryTaskStore {
    runs: RwLock<HashMap<(String, String), WorkerRunRecord>>,
    outputs: RwLock<Vec<TaskOutputRecord>>,
    plans: RwLock<Vec<(String, PlanRecord)>>,
}

impl InMemoryTaskStore {
    /// Create a new empty store
    pub fn new() -> Self {
        Self {
            runs: RwLock::new(HashMap::new()),
            outputs: RwLock::new(Vec::new()),
            plans: RwLock::new(Vec::new()),
        }
    }
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

fn lock_err<T>(e: std::sync::PoisonError<T>) -> StoreError {
    StoreError::Internal(e.to_string())
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn start_task(
        &self,
        run_id: &str,
        task_id: &str,
        agent_id: &str,
        started_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut runs = self.runs.write().map_err(lock_err)?;
        let key = (run_id.to_string(), task_id.to_string());
        if runs.contains_key(&key) {
            return Err(StoreError::AlreadyStarted {
                run_id: run_id.to_string(),
                task_id: task_id.to_string(),
            });
        }
        runs.insert(
            key,
            WorkerRunRecord {
                run_id: run_id.to_string(),
                task_id: task_id.to_string(),
                agent_id: agent_id.to_string(),
                status: TaskStatus::Running,
                started_at,
                completed_at: None,
                duration_ms: None,
                error: None,
                artifact_ref: None,
            },
        );
        Ok(())
    }

    async fn complete_task(
        &self,
        run_id: &str,
        task_id: &str,
        duration_ms: i64,
        artifact_ref: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut runs = self.runs.write().map_err(lock_err)?;
        let record = runs
            .get_mut(&(run_id.to_string(), task_id.to_string()))
            .filter(|r| r.status == TaskStatus::Running)
            .ok_or_else(|| StoreError::NotFound(format!("running task '{task_id}'")))?;
        record.status = TaskStatus::Success;
        record.completed_at = Some(Utc::now());
        record.duration_ms = Some(duration_ms);
        record.artifact_ref = artifact_ref.map(|r| r.to_string());
        Ok(())
    }

    async fn fail_task(
        &self,
        run_id: &str,
        task_id: &str,
        duration_ms: i64,
        error: &str,
    ) -> Result<(), StoreError> {
        let mut runs = self.runs.write().map_err(lock_err)?;
        let record = runs
            .get_mut(&(run_id.to_string(), task_id.to_string()))
            .filter(|r| r.status == TaskStatus::Running)
            .ok_or_else(|| StoreError::NotFound(format!("running task '{task_id}'")))?;
        record.status = TaskStatus::Failed;
        record.completed_at = Some(Utc::now());
        record.duration_ms = Some(duration_ms);
        record.error = Some(error.to_string());
        Ok(())
    }

    async fn record_failure(
        &self,
        run_id: &str,
        task_id: &str,
        agent_id: &str,
        error: &str,
    ) -> Result<(), StoreError> {
        let mut runs = self.runs.write().map_err(lock_err)?;
        let key = (run_id.to_string(), task_id.to_string());
        if runs.contains_key(&key) {
            return Err(StoreError::AlreadyStarted {
                run_id: run_id.to_string(),
                task_id: task_id.to_string(),
            });
        }
        let now = Utc::now();
        runs.insert(
            key,
            WorkerRunRecord {
                run_id: run_id.to_string(),
                task_id: task_id.to_string(),
                agent_id: agent_id.to_string(),
                status: TaskStatus::Failed,
                started_at: now,
                completed_at: Some(now),
                duration_ms: Some(0),
                error: Some(error.to_string()),
                artifact_ref: None,
            },
        );
        Ok(())
    }

    async fn store_output(
        &self,
        run_id: &str,
        task_id: &str,
        agent_id: &str,
        output: &Value,
        metadata: &Value,
    ) -> Result<(), StoreError> {
        {
            let runs = self.runs.read().map_err(lock_err)?;
            let status = runs
                .get(&(run_id.to_string(), task_id.to_string()))
                .map(|r| r.status);
            if status != Some(TaskStatus::Success) {
                return Err(StoreError::Internal(format!(
                    "output stored for task '{task_id}' before successful completion"
                )));
            }
        }
        let mut outputs = self.outputs.write().map_err(lock_err)?;
        outputs.push(TaskOutputRecord {
            run_id: run_id.to_string(),
            task_id: task_id.to_string(),
            agent_id: agent_id.to_string(),
            output: output.clone(),
            metadata: metadata.clone(),
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn get_output(
        &self,
        run_id: &str,
        task_id: &str,
    ) -> Result<Option<TaskOutputRecord>, StoreError> {
        let outputs = self.outputs.read().map_err(lock_err)?;
        Ok(outputs
            .iter()
            .rev()
            .find(|o| o.run_id == run_id && o.task_id == task_id)
            .cloned())
    }

    async fn all_outputs(&self, run_id: &str) -> Result<Vec<TaskOutputRecord>, StoreError> {
        let outputs = self.outputs.read().map_err(lock_err)?;
        Ok(outputs
            .iter()
            .filter(|o| o.run_id == run_id)
            .cloned()
            .collect())
    }

    async fn task_status(
        &self,
        run_id: &str,
        task_id: &str,
    ) -> Result<Option<TaskStatus>, StoreError> {
        let runs = self.runs.read().map_err(lock_err)?;
        Ok(runs
            .get(&(run_id.to_string(), task_id.to_string()))
            .map(|r| r.status))
    }

    async fn are_dependencies_complete(
        &self,
        run_id: &str,
        dependency_ids: &[TaskId],
    ) -> Result<bool, StoreError> {
        let runs = self.runs.read().map_err(lock_err)?;
        Ok(dependency_ids.iter().all(|dep| {
            runs.get(&(run_id.to_string(), dep.clone()))
                .map(|r| r.status == TaskStatus::Success)
                .unwrap_or(false)
        }))
    }

    async fn run_summary(&self, run_id: &str) -> Result<RunSummary, StoreError> {
        let runs = self.runs.read().map_err(lock_err)?;
        let rows: Vec<&WorkerRunRecord> =
            runs.values().filter(|r| r.run_id == run_id).collect();

        let durations: Vec<i64> = rows.iter().filter_map(|r| r.duration_ms).collect();
        let total_duration: i64 = durations.iter().sum();
        let mut agents_used: Vec<String> = rows.iter().map(|r| r.agent_id.clone()).collect();
        agents_used.sort();
        agents_used.dedup();

        Ok(RunSummary {
            run_id: run_id.to_string(),
            total_tasks: rows.len(),
            successful: rows
                .iter()
                .filter(|r| r.status == TaskStatus::Success)
                .count(),
            failed: rows
                .iter()
                .filter(|r| r.status == TaskStatus::Failed)
                .count(),
            running: rows
                .iter()
                .filter(|r| r.status == TaskStatus::Running)
                .count(),
            agents_used,
            avg_duration_ms: if durations.is_empty() {
                None
            } else {
                Some(total_duration as f64 / durations.len() as f64)
            },
            total_duration_ms: if durations.is_empty() {
                None
            } else {
                Some(total_duration as f64)
            },
        })
    }

    async fn failed_tasks(&self, run_id: &str) -> Result<Vec<WorkerRunRecord>, StoreError> {
        let runs = self.runs.read().map_err(lock_err)?;
        let mut failed: Vec<WorkerRunRecord> = runs
            .values()
            .filter(|r| r.run_id == run_id && r.status == TaskStatus::Failed)
            .cloned()
            .collect();
        failed.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        Ok(failed)
    }

    async fn insert_plan_row(&self, run_id: &str, record: &PlanRecord) -> Result<(), StoreError> {
        let mut plans = self.plans.write().map_err(lock_err)?;
        plans.push((run_id.to_string(), record.clone()));
        Ok(())
    }

    async fn update_plan_tools(
        &self,
        run_id: &str,
        task_id: &str,
        tools: &[String],
        tool_params: &Value,
    ) -> Result<(), StoreError> {
        let mut plans = self.plans.write().map_err(lock_err)?;
        for (rid, record) in plans.iter_mut() {
            if rid == run_id && record.task_id == task_id {
                record.tools = tools.to_vec();
                record.tool_params = tool_params.clone();
            }
        }
        Ok(())
    }

    async fn plan_rows(&self, run_id: &str) -> Result<Vec<PlanRecord>, StoreError> {
        let plans = self.plans.read().map_err(lock_err)?;
        Ok(plans
            .iter()
            .filter(|(rid, _)| rid == run_id)
            .map(|(_, record)| record.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let store = InMemoryTaskStore::new();
        store
            .start_task("r1", "t1", "agent", Utc::now())
            .await
            .expect("first start");
        let err = store
            .start_task("r1", "t1", "agent", Utc::now())
            .await
            .expect_err("second start");
        assert!(matches!(err, StoreError::AlreadyStarted { .. }));
    }

    #[tokio::test]
    async fn test_output_requires_successful_completion() {
        let store = InMemoryTaskStore::new();
        store
            .start_task("r1", "t1", "agent", Utc::now())
            .await
            .expect("start");

        let err = store
            .store_output("r1", "t1", "agent", &json!([]), &json!({}))
            .await
            .expect_err("output before completion");
        assert!(matches!(err, StoreError::Internal(_)));

        store
            .complete_task("r1", "t1", 12, None)
            .await
            .expect("complete");
        store
            .store_output("r1", "t1", "agent", &json!([{"x": 1}]), &json!({}))
            .await
            .expect("output after completion");
    }

    #[tokio::test]
    async fn test_dependencies_complete_requires_success() {
        let store = InMemoryTaskStore::new();
        store
            .start_task("r1", "t1", "agent", Utc::now())
            .await
            .expect("start");

        let deps = vec!["t1".to_string()];
        assert!(!store
            .are_dependencies_complete("r1", &deps)
            .await
            .expect("check running"));

        store
            .fail_task("r1", "t1", 5, "boom")
            .await
            .expect("fail");
        assert!(!store
            .are_dependencies_complete("r1", &deps)
            .await
            .expect("check failed"));

        assert!(store
            .are_dependencies_complete("r1", &[])
            .await
            .expect("empty deps"));
    }

    #[tokio::test]
    async fn test_run_summary_counts() {
        let store = InMemoryTaskStore::new();
        store
            .start_task("r1", "t1", "a", Utc::now())
            .await
            .expect("start t1");
        store
            .complete_task("r1", "t1", 10, None)
            .await
            .expect("complete t1");
        store
            .start_task("r1", "t2", "b", Utc::now())
            .await
            .expect("start t2");
        store
            .fail_task("r1", "t2", 20, "err")
            .await
            .expect("fail t2");
        store
            .record_failure("r1", "t3", "b", "upstream failure: t2")
            .await
            .expect("skip t3");

        let summary = store.run_summary("r1").await.expect("summary");
        assert_eq!(summary.total_tasks, 3);
        assert_eq!(summary.successful, 1);
        assert_eq!(summary.failed, 2);
        assert_eq!(summary.running, 0);
        assert_eq!(summary.agents_used, vec!["a".to_string(), "b".to_string()]);
    }
}
