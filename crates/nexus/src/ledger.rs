//! Operation Ledger: every lifecycle move of an operation lands in the
//! store atomically (transition + evidence + output) and is mirrored onto
//! the event bus.
//!
//! The bus mirror is best-effort; the store write is the source of truth.
//! Consumers reconstruct the full timeline from ledger rows alone.

use crate::error::{CoreError, ErrorKind};
use crate::events::{EventBus, MonitorEvent};
use crate::model::{Evidence, OpOutput, Operation, OperationStatus};
use crate::store::{OperationTransition, Store};

#[derive(Clone)]
pub struct OperationLedger {
    store: Store,
    bus: EventBus,
}

impl OperationLedger {
    pub fn new(store: Store, bus: EventBus) -> Self {
        Self { store, bus }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub async fn record_enqueued(&self, op: &Operation) -> Result<(), CoreError> {
        self.store.append_operation(op).await?;
        self.bus
            .publish(MonitorEvent::TaskEnqueued {
                task_id: op.task_id.clone(),
                operation_id: op.id.clone(),
                operation_type: op.spec.operation_type().to_string(),
                queue: op.queue.clone(),
            })
            .await;
        Ok(())
    }

    pub async fn record_waiting_deps(&self, op: &Operation) -> Result<(), CoreError> {
        self.store
            .apply_operation_transition(&OperationTransition::to(
                &op.id,
                OperationStatus::WaitingDeps,
            ))
            .await?;
        Ok(())
    }

    pub async fn record_dispatched(&self, op: &Operation) -> Result<(), CoreError> {
        self.store
            .apply_operation_transition(&OperationTransition::to(
                &op.id,
                OperationStatus::Dispatched,
            ))
            .await?;
        Ok(())
    }

    pub async fn record_started(&self, op: &Operation, worker_id: &str) -> Result<(), CoreError> {
        self.store
            .apply_operation_transition(&OperationTransition::to(
                &op.id,
                OperationStatus::InFlight,
            ))
            .await?;
        self.bus
            .publish(MonitorEvent::TaskStarted {
                task_id: op.task_id.clone(),
                operation_id: op.id.clone(),
                operation_type: op.spec.operation_type().to_string(),
                worker_id: worker_id.to_string(),
            })
            .await;
        Ok(())
    }

    pub async fn record_completed(
        &self,
        op: &Operation,
        output: OpOutput,
        evidence: Vec<Evidence>,
        retry_count: u32,
        worker_id: &str,
    ) -> Result<Operation, CoreError> {
        let updated = self
            .store
            .apply_operation_transition(
                &OperationTransition::to(&op.id, OperationStatus::Completed)
                    .with_output(output)
                    .with_retry_count(retry_count)
                    .with_evidence(evidence),
            )
            .await?;
        self.bus
            .publish(MonitorEvent::TaskCompleted {
                task_id: op.task_id.clone(),
                operation_id: op.id.clone(),
                operation_type: op.spec.operation_type().to_string(),
                worker_id: worker_id.to_string(),
                duration_ms: updated.duration_ms.unwrap_or(0),
            })
            .await;
        Ok(updated)
    }

    pub async fn record_retry(
        &self,
        op: &Operation,
        retry_count: u32,
        error: &CoreError,
    ) -> Result<(), CoreError> {
        self.store
            .apply_operation_transition(
                &OperationTransition::to(&op.id, OperationStatus::Retrying)
                    .with_retry_count(retry_count)
                    .with_error(error.to_string(), error.kind()),
            )
            .await?;
        self.bus
            .publish(MonitorEvent::TaskRetry {
                task_id: op.task_id.clone(),
                operation_id: op.id.clone(),
                retry_count,
                error: error.to_string(),
            })
            .await;
        Ok(())
    }

    pub async fn record_failed(
        &self,
        op: &Operation,
        error: &CoreError,
        retry_count: u32,
        worker_id: Option<&str>,
    ) -> Result<(), CoreError> {
        self.store
            .apply_operation_transition(
                &OperationTransition::to(&op.id, OperationStatus::Failed)
                    .with_retry_count(retry_count)
                    .with_error(error.to_string(), error.kind()),
            )
            .await?;
        self.bus
            .publish(MonitorEvent::TaskFailed {
                task_id: op.task_id.clone(),
                operation_id: Some(op.id.clone()),
                operation_type: Some(op.spec.operation_type().to_string()),
                worker_id: worker_id.map(String::from),
                error: error.to_string(),
                error_kind: error.kind(),
            })
            .await;
        Ok(())
    }

    pub async fn record_cancelled(&self, op: &Operation) -> Result<(), CoreError> {
        self.store
            .apply_operation_transition(
                &OperationTransition::to(&op.id, OperationStatus::Cancelled)
                    .with_error("cancelled", ErrorKind::Cancelled),
            )
            .await?;
        self.bus
            .publish(MonitorEvent::TaskCancelled {
                task_id: op.task_id.clone(),
                operation_id: op.id.clone(),
            })
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::SubscriberFilter;
    use crate::model::{OpSpec, ResearchType, Task};

    #[tokio::test]
    async fn test_ledger_mirrors_lifecycle_to_bus() {
        let store = Store::in_memory().await.unwrap();
        let bus = EventBus::new(64, crate::config::DEFAULT_EVENT_MAX_BYTES);
        let mut stream = bus.subscribe(SubscriberFilter::all());
        let ledger = OperationLedger::new(store.clone(), bus);

        let task = Task::new("t", "q", ResearchType::AnalyticalReport);
        store.insert_task(&task).await.unwrap();

        let op = Operation::new(&task.id, OpSpec::BuildKnowledgeTree);
        ledger.record_enqueued(&op).await.unwrap();
        ledger.record_dispatched(&op).await.unwrap();
        ledger.record_started(&op, "worker-0").await.unwrap();
        ledger
            .record_completed(
                &op,
                crate::model::OpOutput::BuildKnowledgeTree {
                    node_count: 2,
                    root_count: 1,
                },
                vec![],
                0,
                "worker-0",
            )
            .await
            .unwrap();

        let kinds: Vec<String> = [
            stream.recv_event().await.unwrap(),
            stream.recv_event().await.unwrap(),
            stream.recv_event().await.unwrap(),
        ]
        .iter()
        .map(|e| e.event_type().to_string())
        .collect();
        assert_eq!(kinds, ["task_enqueued", "task_started", "task_completed"]);

        let stored = store.get_operation(&op.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OperationStatus::Completed);
        assert!(stored.duration_ms.is_some());
    }
}
