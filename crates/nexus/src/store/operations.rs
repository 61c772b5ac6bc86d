//! Operation ledger rows and their evidence.
//!
//! A transition, its evidence, and (on success) the output land in one
//! transaction; partial application is impossible. Terminal rows are
//! immutable apart from nothing — they are simply immutable.

use chrono::Utc;
use sqlx::FromRow;

use super::{parse_opt_ts, parse_ts, Store, StoreError, StoreResult};
use crate::error::ErrorKind;
use crate::model::{Evidence, OpOutput, OpSpec, Operation, OperationId, OperationStatus};

/// One atomic ledger write: the status move plus everything that must land
/// with it.
#[derive(Debug, Clone)]
pub struct OperationTransition {
    pub operation_id: OperationId,
    pub new_status: OperationStatus,
    pub retry_count: Option<u32>,
    pub output: Option<OpOutput>,
    pub error: Option<(String, ErrorKind)>,
    pub evidence: Vec<Evidence>,
}

impl OperationTransition {
    pub fn to(operation_id: impl Into<OperationId>, new_status: OperationStatus) -> Self {
        Self {
            operation_id: operation_id.into(),
            new_status,
            retry_count: None,
            output: None,
            error: None,
            evidence: Vec::new(),
        }
    }

    pub fn with_output(mut self, output: OpOutput) -> Self {
        self.output = Some(output);
        self
    }

    pub fn with_error(mut self, message: impl Into<String>, kind: ErrorKind) -> Self {
        self.error = Some((message.into(), kind));
        self
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = Some(retry_count);
        self
    }

    pub fn with_evidence(mut self, evidence: Vec<Evidence>) -> Self {
        self.evidence = evidence;
        self
    }
}

/// Aggregate view over a task's evidence.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct EvidenceAggregate {
    pub total_evidence_items: i64,
    pub search_providers_used: Vec<String>,
    pub operations_count: i64,
}

impl Store {
    pub async fn append_operation(&self, op: &Operation) -> StoreResult<()> {
        let input_data = serde_json::to_string(&op.spec)?;
        let output_data = op.output.as_ref().map(serde_json::to_string).transpose()?;

        sqlx::query(
            r#"
            INSERT INTO operations (
                id, task_id, parent_id, operation_type, agent_type, queue, priority,
                status, retry_count, input_data, output_data, error_message, error_kind,
                created_at, started_at, completed_at, duration_ms
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&op.id)
        .bind(&op.task_id)
        .bind(&op.parent_id)
        .bind(op.spec.operation_type())
        .bind(&op.agent_type)
        .bind(&op.queue)
        .bind(op.priority)
        .bind(op.status.to_string())
        .bind(op.retry_count as i64)
        .bind(&input_data)
        .bind(&output_data)
        .bind(&op.error_message)
        .bind(op.error_kind.map(|k| k.as_str()))
        .bind(op.created_at.to_rfc3339())
        .bind(op.started_at.map(|t| t.to_rfc3339()))
        .bind(op.completed_at.map(|t| t.to_rfc3339()))
        .bind(op.duration_ms)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// Apply one ledger transition atomically. Rejected when the row is
    /// already terminal, or when the output/status pairing breaks the
    /// `output iff completed` invariant.
    pub async fn apply_operation_transition(
        &self,
        transition: &OperationTransition,
    ) -> StoreResult<Operation> {
        match (&transition.output, transition.new_status) {
            (Some(_), status) if status != OperationStatus::Completed => {
                return Err(StoreError::InvalidData(format!(
                    "output_data is only valid on completed operations, got {status}"
                )));
            }
            (None, OperationStatus::Completed) => {
                return Err(StoreError::InvalidData(
                    "completed operations must carry output_data".to_string(),
                ));
            }
            _ => {}
        }

        let mut tx = self.pool().begin().await?;

        let row: Option<OperationRow> = sqlx::query_as("SELECT * FROM operations WHERE id = ?")
            .bind(&transition.operation_id)
            .fetch_optional(&mut *tx)
            .await?;
        let mut op = row
            .ok_or_else(|| {
                StoreError::NotFound(format!("operation {}", transition.operation_id))
            })?
            .into_operation()?;

        if op.status.is_terminal() {
            return Err(StoreError::InvalidTransition {
                from: op.status.to_string(),
                to: transition.new_status.to_string(),
            });
        }

        let now = Utc::now();
        op.status = transition.new_status;
        if let Some(retry_count) = transition.retry_count {
            op.retry_count = retry_count;
        }
        if transition.new_status == OperationStatus::InFlight && op.started_at.is_none() {
            op.started_at = Some(now);
        }
        if transition.new_status.is_terminal() {
            op.completed_at = Some(now);
            let began = op.started_at.unwrap_or(op.created_at);
            op.duration_ms = Some((now - began).num_milliseconds().max(0));
        }
        op.output = transition.output.clone();
        if let Some((message, kind)) = &transition.error {
            op.error_message = Some(message.clone());
            op.error_kind = Some(*kind);
        }

        let output_data = op.output.as_ref().map(serde_json::to_string).transpose()?;

        sqlx::query(
            r#"
            UPDATE operations
            SET status = ?, retry_count = ?, output_data = ?, error_message = ?,
                error_kind = ?, started_at = ?, completed_at = ?, duration_ms = ?
            WHERE id = ?
            "#,
        )
        .bind(op.status.to_string())
        .bind(op.retry_count as i64)
        .bind(&output_data)
        .bind(&op.error_message)
        .bind(op.error_kind.map(|k| k.as_str()))
        .bind(op.started_at.map(|t| t.to_rfc3339()))
        .bind(op.completed_at.map(|t| t.to_rfc3339()))
        .bind(op.duration_ms)
        .bind(&op.id)
        .execute(&mut *tx)
        .await?;

        for evidence in &transition.evidence {
            insert_evidence(&mut tx, evidence).await?;
        }

        tx.commit().await?;
        Ok(op)
    }

    pub async fn get_operation(&self, operation_id: &str) -> StoreResult<Option<Operation>> {
        let row: Option<OperationRow> = sqlx::query_as("SELECT * FROM operations WHERE id = ?")
            .bind(operation_id)
            .fetch_optional(self.pool())
            .await?;

        row.map(OperationRow::into_operation).transpose()
    }

    /// Ledger order: created_at ascending, insertion order as tiebreak.
    pub async fn list_operations(&self, task_id: &str) -> StoreResult<Vec<Operation>> {
        let rows: Vec<OperationRow> = sqlx::query_as(
            "SELECT * FROM operations WHERE task_id = ? ORDER BY created_at, rowid",
        )
        .bind(task_id)
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(OperationRow::into_operation).collect()
    }

    /// Operations with their evidence counts, in ledger order.
    pub async fn list_operations_with_evidence(
        &self,
        task_id: &str,
    ) -> StoreResult<Vec<(Operation, i64)>> {
        let ops = self.list_operations(task_id).await?;
        let counts: Vec<(String, i64)> = sqlx::query_as(
            "SELECT operation_id, COUNT(*) FROM evidence WHERE task_id = ? GROUP BY operation_id",
        )
        .bind(task_id)
        .fetch_all(self.pool())
        .await?;

        let by_op: std::collections::HashMap<String, i64> = counts.into_iter().collect();
        Ok(ops
            .into_iter()
            .map(|op| {
                let count = by_op.get(&op.id).copied().unwrap_or(0);
                (op, count)
            })
            .collect())
    }

    pub async fn append_evidence(&self, evidence: &Evidence) -> StoreResult<()> {
        let mut tx = self.pool().begin().await?;
        insert_evidence(&mut tx, evidence).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn list_evidence(&self, task_id: &str) -> StoreResult<Vec<Evidence>> {
        let rows: Vec<EvidenceRow> =
            sqlx::query_as("SELECT * FROM evidence WHERE task_id = ? ORDER BY created_at, rowid")
                .bind(task_id)
                .fetch_all(self.pool())
                .await?;

        rows.into_iter().map(EvidenceRow::into_evidence).collect()
    }

    pub async fn evidence_aggregate(&self, task_id: &str) -> StoreResult<EvidenceAggregate> {
        let (total_evidence_items,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM evidence WHERE task_id = ?")
                .bind(task_id)
                .fetch_one(self.pool())
                .await?;

        let providers: Vec<(String,)> = sqlx::query_as(
            "SELECT DISTINCT provider FROM evidence WHERE task_id = ? AND provider IS NOT NULL ORDER BY provider",
        )
        .bind(task_id)
        .fetch_all(self.pool())
        .await?;

        let (operations_count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM operations WHERE task_id = ?")
                .bind(task_id)
                .fetch_one(self.pool())
                .await?;

        Ok(EvidenceAggregate {
            total_evidence_items,
            search_providers_used: providers.into_iter().map(|(p,)| p).collect(),
            operations_count,
        })
    }
}

async fn insert_evidence(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    evidence: &Evidence,
) -> StoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO evidence (
            id, operation_id, task_id, evidence_type, evidence_data,
            source_url, provider, size_bytes, created_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&evidence.id)
    .bind(&evidence.operation_id)
    .bind(&evidence.task_id)
    .bind(&evidence.evidence_type)
    .bind(serde_json::to_string(&evidence.data)?)
    .bind(&evidence.source_url)
    .bind(evidence.provider.map(|p| p.as_str()))
    .bind(evidence.size_bytes)
    .bind(evidence.created_at.to_rfc3339())
    .execute(&mut **tx)
    .await?;

    Ok(())
}

#[derive(Debug, FromRow)]
struct OperationRow {
    id: String,
    task_id: String,
    parent_id: Option<String>,
    #[allow(dead_code)]
    operation_type: String,
    agent_type: String,
    queue: String,
    priority: i32,
    status: String,
    retry_count: i64,
    input_data: String,
    output_data: Option<String>,
    error_message: Option<String>,
    error_kind: Option<String>,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    duration_ms: Option<i64>,
}

impl OperationRow {
    fn into_operation(self) -> StoreResult<Operation> {
        let spec: OpSpec = serde_json::from_str(&self.input_data)?;
        let output: Option<OpOutput> = self
            .output_data
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;
        let status: OperationStatus = self
            .status
            .parse()
            .map_err(|_| StoreError::InvalidData(format!("bad operation status {}", self.status)))?;
        let error_kind: Option<ErrorKind> = self
            .error_kind
            .as_deref()
            .map(|k| {
                k.parse()
                    .map_err(|_| StoreError::InvalidData(format!("bad error kind {k}")))
            })
            .transpose()?;

        Ok(Operation {
            id: self.id,
            task_id: self.task_id,
            parent_id: self.parent_id,
            spec,
            status,
            agent_type: self.agent_type,
            queue: self.queue,
            priority: self.priority,
            retry_count: self.retry_count as u32,
            output,
            error_message: self.error_message,
            error_kind,
            created_at: parse_ts(&self.created_at)?,
            started_at: parse_opt_ts(&self.started_at)?,
            completed_at: parse_opt_ts(&self.completed_at)?,
            duration_ms: self.duration_ms,
        })
    }
}

#[derive(Debug, FromRow)]
struct EvidenceRow {
    id: String,
    operation_id: String,
    task_id: String,
    evidence_type: String,
    evidence_data: String,
    source_url: Option<String>,
    provider: Option<String>,
    size_bytes: i64,
    created_at: String,
}

impl EvidenceRow {
    fn into_evidence(self) -> StoreResult<Evidence> {
        let provider = self
            .provider
            .as_deref()
            .map(|p| {
                p.parse()
                    .map_err(|_| StoreError::InvalidData(format!("bad provider {p}")))
            })
            .transpose()?;

        Ok(Evidence {
            id: self.id,
            operation_id: self.operation_id,
            task_id: self.task_id,
            evidence_type: self.evidence_type,
            data: serde_json::from_str(&self.evidence_data)?,
            source_url: self.source_url,
            provider,
            size_bytes: self.size_bytes,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ProviderId, ResearchType, Task};

    async fn seeded() -> (Store, Task) {
        let store = Store::in_memory().await.unwrap();
        let task = Task::new("t", "q", ResearchType::AnalyticalReport);
        store.insert_task(&task).await.unwrap();
        (store, task)
    }

    fn search_spec() -> OpSpec {
        OpSpec::McpSearch {
            provider: ProviderId::Exa,
            query: "q".into(),
            subtopic_index: 0,
        }
    }

    #[tokio::test]
    async fn test_transition_sets_duration_and_output_atomically() {
        let (store, task) = seeded().await;
        let op = Operation::new(&task.id, search_spec());
        store.append_operation(&op).await.unwrap();

        store
            .apply_operation_transition(&OperationTransition::to(
                &op.id,
                OperationStatus::InFlight,
            ))
            .await
            .unwrap();

        let evidence = Evidence::new(&op.id, &task.id, "search_result", serde_json::json!({}))
            .with_provider(ProviderId::Exa);
        let output = OpOutput::McpSearch {
            provider: ProviderId::Exa,
            source_ids: vec!["s1".into()],
            result_count: 1,
        };
        let updated = store
            .apply_operation_transition(
                &OperationTransition::to(&op.id, OperationStatus::Completed)
                    .with_output(output.clone())
                    .with_evidence(vec![evidence]),
            )
            .await
            .unwrap();

        assert_eq!(updated.status, OperationStatus::Completed);
        assert!(updated.completed_at.is_some());
        assert!(updated.duration_ms.unwrap() >= 0);
        assert_eq!(updated.output, Some(output));
        assert_eq!(store.list_evidence(&task.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_terminal_rows_are_immutable() {
        let (store, task) = seeded().await;
        let op = Operation::new(&task.id, OpSpec::BuildKnowledgeTree);
        store.append_operation(&op).await.unwrap();

        store
            .apply_operation_transition(
                &OperationTransition::to(&op.id, OperationStatus::Failed)
                    .with_error("bad", ErrorKind::ProviderPermanent),
            )
            .await
            .unwrap();

        let err = store
            .apply_operation_transition(&OperationTransition::to(
                &op.id,
                OperationStatus::InFlight,
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_output_requires_completed() {
        let (store, task) = seeded().await;
        let op = Operation::new(&task.id, OpSpec::GenerateInsights);
        store.append_operation(&op).await.unwrap();

        let err = store
            .apply_operation_transition(
                &OperationTransition::to(&op.id, OperationStatus::Failed).with_output(
                    OpOutput::GenerateInsights { insight_count: 0 },
                ),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidData(_)));

        let err = store
            .apply_operation_transition(&OperationTransition::to(
                &op.id,
                OperationStatus::Completed,
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidData(_)));
    }

    #[tokio::test]
    async fn test_ledger_order_and_evidence_aggregate() {
        let (store, task) = seeded().await;
        for i in 0..3 {
            let op = Operation::new(&task.id, search_spec()).with_priority(i);
            store.append_operation(&op).await.unwrap();
        }

        let ops = store.list_operations(&task.id).await.unwrap();
        assert_eq!(ops.len(), 3);
        assert!(ops.windows(2).all(|w| w[0].created_at <= w[1].created_at));

        let aggregate = store.evidence_aggregate(&task.id).await.unwrap();
        assert_eq!(aggregate.operations_count, 3);
        assert_eq!(aggregate.total_evidence_items, 0);
        assert!(aggregate.search_providers_used.is_empty());
    }
}
