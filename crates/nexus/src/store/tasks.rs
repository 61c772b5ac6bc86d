//! Task persistence and the status transition gate.

use chrono::Utc;
use sqlx::FromRow;

use super::{parse_opt_ts, parse_ts, Store, StoreError, StoreResult};
use crate::error::ErrorKind;
use crate::model::{AggregationConfig, ResearchType, Task, TaskStatus};

/// Aggregate row counts surfaced alongside a task.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct TaskCounts {
    pub operations: i64,
    pub evidence: i64,
    pub sources: i64,
    pub summaries: i64,
    pub knowledge_nodes: i64,
    pub insights: i64,
    pub spiky_povs: i64,
    pub entities: i64,
}

impl Store {
    pub async fn insert_task(&self, task: &Task) -> StoreResult<()> {
        task.validate().map_err(StoreError::InvalidData)?;

        let aggregation_config = task
            .aggregation_config
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO tasks (
                id, title, research_query, research_type, status, project_id,
                aggregation_config, error_message, created_at, updated_at, completed_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&task.id)
        .bind(&task.title)
        .bind(&task.research_query)
        .bind(task.research_type.to_string())
        .bind(task.status.to_string())
        .bind(&task.project_id)
        .bind(&aggregation_config)
        .bind(&task.error_message)
        .bind(task.created_at.to_rfc3339())
        .bind(task.updated_at.to_rfc3339())
        .bind(task.completed_at.map(|t| t.to_rfc3339()))
        .execute(self.pool())
        .await?;

        Ok(())
    }

    pub async fn get_task(&self, task_id: &str) -> StoreResult<Option<Task>> {
        let row: Option<TaskRow> = sqlx::query_as("SELECT * FROM tasks WHERE id = ?")
            .bind(task_id)
            .fetch_optional(self.pool())
            .await?;

        row.map(TaskRow::into_task).transpose()
    }

    /// Advance a task's status. The transition set of the state machine is
    /// enforced here; an illegal move never reaches the database.
    pub async fn update_task_status(
        &self,
        task_id: &str,
        new_status: TaskStatus,
        error: Option<(&str, ErrorKind)>,
    ) -> StoreResult<Task> {
        let mut tx = self.pool().begin().await?;

        let row: Option<TaskRow> = sqlx::query_as("SELECT * FROM tasks WHERE id = ?")
            .bind(task_id)
            .fetch_optional(&mut *tx)
            .await?;
        let task = row
            .ok_or_else(|| StoreError::NotFound(format!("task {task_id}")))?
            .into_task()?;

        if !task.status.can_transition_to(new_status) {
            return Err(StoreError::InvalidTransition {
                from: task.status.to_string(),
                to: new_status.to_string(),
            });
        }

        let now = Utc::now();
        let completed_at = new_status.is_terminal().then_some(now);
        let error_message = error.map(|(msg, kind)| format!("{}: {msg}", kind.as_str()));

        sqlx::query(
            r#"
            UPDATE tasks
            SET status = ?, error_message = COALESCE(?, error_message),
                updated_at = ?, completed_at = ?
            WHERE id = ?
            "#,
        )
        .bind(new_status.to_string())
        .bind(&error_message)
        .bind(now.to_rfc3339())
        .bind(completed_at.map(|t| t.to_rfc3339()))
        .bind(task_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        let mut updated = task;
        updated.status = new_status;
        updated.updated_at = now;
        updated.completed_at = completed_at;
        if error_message.is_some() {
            updated.error_message = error_message;
        }
        Ok(updated)
    }

    pub async fn list_project_tasks(&self, project_id: &str) -> StoreResult<Vec<Task>> {
        let rows: Vec<TaskRow> =
            sqlx::query_as("SELECT * FROM tasks WHERE project_id = ? ORDER BY created_at")
                .bind(project_id)
                .fetch_all(self.pool())
                .await?;

        rows.into_iter().map(TaskRow::into_task).collect()
    }

    /// Cascade-delete a task and everything it owns. Shared sources survive;
    /// the task link rows do not.
    pub async fn delete_task(&self, task_id: &str) -> StoreResult<()> {
        let mut tx = self.pool().begin().await?;

        // Entities scoped to the task itself. Project-scoped rows belong to
        // the project and survive task deletion.
        sqlx::query("DELETE FROM aggregated_entities WHERE scope_id = ?")
            .bind(task_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(task_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn task_counts(&self, task_id: &str) -> StoreResult<TaskCounts> {
        let count = |sql: &'static str| {
            let pool = self.pool().clone();
            let task_id = task_id.to_string();
            async move {
                let (n,): (i64,) = sqlx::query_as(sql)
                    .bind(&task_id)
                    .fetch_one(&pool)
                    .await?;
                Ok::<i64, StoreError>(n)
            }
        };

        Ok(TaskCounts {
            operations: count("SELECT COUNT(*) FROM operations WHERE task_id = ?").await?,
            evidence: count("SELECT COUNT(*) FROM evidence WHERE task_id = ?").await?,
            sources: count("SELECT COUNT(*) FROM task_sources WHERE task_id = ?").await?,
            summaries: count("SELECT COUNT(*) FROM source_summaries WHERE task_id = ?").await?,
            knowledge_nodes: count("SELECT COUNT(*) FROM knowledge_nodes WHERE task_id = ?")
                .await?,
            insights: count("SELECT COUNT(*) FROM insights WHERE task_id = ?").await?,
            spiky_povs: count("SELECT COUNT(*) FROM spiky_povs WHERE task_id = ?").await?,
            entities: count("SELECT COUNT(*) FROM aggregated_entities WHERE scope_id = ?").await?,
        })
    }
}

#[derive(Debug, FromRow)]
struct TaskRow {
    id: String,
    title: String,
    research_query: String,
    research_type: String,
    status: String,
    project_id: Option<String>,
    aggregation_config: Option<String>,
    error_message: Option<String>,
    created_at: String,
    updated_at: String,
    completed_at: Option<String>,
}

impl TaskRow {
    fn into_task(self) -> StoreResult<Task> {
        let research_type: ResearchType = self
            .research_type
            .parse()
            .map_err(StoreError::InvalidData)?;
        let status: TaskStatus = self.status.parse().map_err(StoreError::InvalidData)?;
        let aggregation_config: Option<AggregationConfig> = self
            .aggregation_config
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;

        Ok(Task {
            id: self.id,
            title: self.title,
            research_query: self.research_query,
            research_type,
            status,
            project_id: self.project_id,
            aggregation_config,
            error_message: self.error_message,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
            completed_at: parse_opt_ts(&self.completed_at)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> Store {
        Store::in_memory().await.unwrap()
    }

    #[tokio::test]
    async fn test_insert_and_get_task() {
        let store = store().await;
        let task = Task::new("AI testing", "impact of AI agents", ResearchType::AnalyticalReport);
        store.insert_task(&task).await.unwrap();

        let loaded = store.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(loaded.research_query, "impact of AI agents");
        assert_eq!(loaded.status, TaskStatus::Pending);
        assert!(loaded.aggregation_config.is_none());
    }

    #[tokio::test]
    async fn test_status_transition_enforced() {
        let store = store().await;
        let task = Task::new("t", "q", ResearchType::AnalyticalReport);
        store.insert_task(&task).await.unwrap();

        store
            .update_task_status(&task.id, TaskStatus::Running, None)
            .await
            .unwrap();
        store
            .update_task_status(&task.id, TaskStatus::Searching, None)
            .await
            .unwrap();

        let err = store
            .update_task_status(&task.id, TaskStatus::Planning, None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));

        let updated = store
            .update_task_status(&task.id, TaskStatus::Failed, Some(("boom", ErrorKind::Timeout)))
            .await
            .unwrap();
        assert_eq!(updated.status, TaskStatus::Failed);
        assert!(updated.completed_at.is_some());
        assert!(updated.error_message.unwrap().starts_with("timeout:"));

        // Terminal means terminal.
        let err = store
            .update_task_status(&task.id, TaskStatus::Completed, None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_delete_task_is_idempotent() {
        let store = store().await;
        let task = Task::new("t", "q", ResearchType::AnalyticalReport);
        store.insert_task(&task).await.unwrap();

        store.delete_task(&task.id).await.unwrap();
        assert!(store.get_task(&task.id).await.unwrap().is_none());
        store.delete_task(&task.id).await.unwrap();
    }
}
