//! Research Orchestrator: drives a task's workflow as ordered phases over
//! the coordinator, decides phase outcomes under `min_success_ratio`, and
//! owns task-level status and failure.

mod aggregation;
mod analytical;
mod executor;
pub mod prompts;

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::join_all;
use tracing::{info, warn};

use crate::config::NexusConfig;
use crate::coordinator::{Coordinator, OpHandle, SubmitOptions};
use crate::error::{CoreError, ErrorKind};
use crate::events::{EventBus, MonitorEvent};
use crate::gateway::ProviderGateway;
use crate::model::{
    AggregatedEntity, AggregationConfig, OpSpec, Operation, OperationId, ResearchType, Task,
    TaskStatus,
};
use crate::resolution;
use crate::store::Store;

/// Explicit handle bundle passed to every component. No process-global
/// state beyond configuration loaded at startup.
pub struct NexusContext {
    pub config: NexusConfig,
    pub store: Store,
    pub bus: EventBus,
    pub gateway: ProviderGateway,
}

impl NexusContext {
    pub fn new(
        config: NexusConfig,
        store: Store,
        bus: EventBus,
        gateway: ProviderGateway,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            store,
            bus,
            gateway,
        })
    }
}

/// A validated research request, as the HTTP facade would hand it over.
#[derive(Debug, Clone)]
pub struct TaskRequest {
    pub title: String,
    pub research_query: String,
    pub research_type: ResearchType,
    pub project_id: Option<String>,
    pub aggregation_config: Option<AggregationConfig>,
}

/// Why a phase (and with it the task) failed.
#[derive(Debug, Clone)]
pub(crate) struct PhaseError {
    pub message: String,
    pub kind: ErrorKind,
    /// The operation whose failure decided the phase, for downstream
    /// dependency bookkeeping.
    pub anchor_op: Option<OperationId>,
}

impl PhaseError {
    pub(crate) fn new(message: impl Into<String>, kind: ErrorKind) -> Self {
        Self {
            message: message.into(),
            kind,
            anchor_op: None,
        }
    }

    fn from_core(error: CoreError) -> Self {
        Self {
            kind: error.kind(),
            message: error.to_string(),
            anchor_op: None,
        }
    }
}

pub(crate) struct PhaseResult {
    pub op_ids: Vec<OperationId>,
}

pub struct Orchestrator {
    ctx: Arc<NexusContext>,
    coordinator: Coordinator,
}

impl Orchestrator {
    /// Build the executor and worker pool on top of the context.
    pub fn start(ctx: Arc<NexusContext>) -> Self {
        let runner = Arc::new(executor::Executor::new(Arc::clone(&ctx)));
        let coordinator = Coordinator::start(
            ctx.config.clone(),
            ctx.store.clone(),
            ctx.bus.clone(),
            runner,
        );
        Self { ctx, coordinator }
    }

    pub fn context(&self) -> &Arc<NexusContext> {
        &self.ctx
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    /// Validate and persist a new task in `pending` state.
    pub async fn create_task(&self, request: TaskRequest) -> Result<Task, CoreError> {
        let mut task = Task::new(request.title, request.research_query, request.research_type);
        task.project_id = request.project_id;
        task.aggregation_config = request.aggregation_config;
        self.ctx.store.insert_task(&task).await?;
        Ok(task)
    }

    /// Drive a pending task to a terminal state and return it.
    pub async fn run_task(&self, task_id: &str) -> Result<Task, CoreError> {
        let task = self
            .ctx
            .store
            .get_task(task_id)
            .await?
            .ok_or_else(|| CoreError::Store(format!("task {task_id} not found")))?;
        if task.status != TaskStatus::Pending {
            return Err(CoreError::InvariantViolation(format!(
                "task {task_id} is {}, expected pending",
                task.status
            )));
        }

        self.ctx
            .store
            .update_task_status(task_id, TaskStatus::Running, None)
            .await?;
        info!(task_id, research_type = %task.research_type, "task started");

        let outcome = match task.research_type {
            ResearchType::AnalyticalReport => self.run_analytical(&task).await,
            ResearchType::DataAggregation => self.run_aggregation(&task).await,
        };

        match outcome {
            Ok(()) => {
                let task = self
                    .ctx
                    .store
                    .update_task_status(task_id, TaskStatus::Completed, None)
                    .await?;
                info!(task_id, "task completed");
                Ok(task)
            }
            Err(phase_error) => {
                // Stop stragglers before the terminal write.
                self.coordinator.cancel(task_id).await;
                let task = self
                    .ctx
                    .store
                    .update_task_status(
                        task_id,
                        TaskStatus::Failed,
                        Some((&phase_error.message, phase_error.kind)),
                    )
                    .await?;
                self.ctx
                    .bus
                    .publish_scoped(
                        task.project_id.as_deref(),
                        MonitorEvent::TaskFailed {
                            task_id: task_id.to_string(),
                            operation_id: None,
                            operation_type: None,
                            worker_id: None,
                            error: phase_error.message.clone(),
                            error_kind: phase_error.kind,
                        },
                    )
                    .await;
                warn!(task_id, error = %phase_error.message, "task failed");
                Ok(task)
            }
        }
    }

    /// Request cooperative cancellation of a running task.
    pub async fn cancel_task(&self, task_id: &str) {
        self.coordinator.cancel(task_id).await;
    }

    pub async fn delete_task(&self, task_id: &str) -> Result<(), CoreError> {
        self.coordinator.cancel(task_id).await;
        self.ctx.store.delete_task(task_id).await?;
        Ok(())
    }

    /// Cross-task entity consolidation at project scope. Idempotent.
    pub async fn consolidate_project(
        &self,
        project_id: &str,
    ) -> Result<Vec<AggregatedEntity>, CoreError> {
        let tasks = self
            .ctx
            .store
            .list_project_aggregation_tasks(project_id)
            .await?;
        if tasks.is_empty() {
            return Ok(vec![]);
        }

        let entity_type = tasks
            .iter()
            .find_map(|t| {
                t.aggregation_config
                    .as_ref()
                    .and_then(|c| c.entities.first().cloned())
            })
            .unwrap_or_else(|| "entity".to_string());

        let mut candidates = Vec::new();
        for task in &tasks {
            for op in self.ctx.store.list_operations(&task.id).await? {
                if let Some(crate::model::OpOutput::ExtractEntities { candidates: found }) =
                    op.output
                {
                    candidates.extend(found);
                }
            }
        }

        let existing = self
            .ctx
            .store
            .list_entities(project_id, Some(&entity_type))
            .await?;
        let resolved = resolution::resolve(project_id, &entity_type, candidates, existing);
        for entity in &resolved {
            self.ctx.store.upsert_entity(entity).await?;
        }

        self.ctx
            .bus
            .publish_scoped(
                Some(project_id),
                MonitorEvent::PhaseCompleted {
                    parent_task_id: project_id.to_string(),
                    phase: "consolidate".to_string(),
                    counts: BTreeMap::from([("entities".to_string(), resolved.len() as i64)]),
                    message: format!("consolidated {} tasks", tasks.len()),
                },
            )
            .await;
        Ok(resolved)
    }

    pub async fn shutdown(&self) {
        self.coordinator.shutdown().await;
    }

    /// Advance the task status, skipping when already there.
    pub(crate) async fn advance_status(
        &self,
        task: &Task,
        status: TaskStatus,
    ) -> Result<(), PhaseError> {
        let current = self
            .ctx
            .store
            .get_task(&task.id)
            .await
            .map_err(|e| PhaseError::from_core(e.into()))?
            .map(|t| t.status)
            .unwrap_or(TaskStatus::Pending);
        if current == status {
            return Ok(());
        }
        self.ctx
            .store
            .update_task_status(&task.id, status, None)
            .await
            .map_err(|e| PhaseError::from_core(e.into()))?;
        Ok(())
    }

    /// Run one phase: submit the (pre-sorted) specs, wait for every op to
    /// reach a terminal state, then decide the phase under
    /// `min_success_ratio`. A configured phase timeout cancels in-flight
    /// stragglers and evaluates what finished.
    pub(crate) async fn run_phase(
        &self,
        task: &Task,
        phase: &str,
        min_success_ratio: f64,
        specs: Vec<OpSpec>,
        extra_counts: BTreeMap<String, i64>,
    ) -> Result<PhaseResult, PhaseError> {
        let project = task.project_id.as_deref();
        self.ctx
            .bus
            .publish_scoped(
                project,
                MonitorEvent::PhaseStarted {
                    parent_task_id: task.id.clone(),
                    phase: phase.to_string(),
                    message: format!("{} operation(s)", specs.len()),
                },
            )
            .await;

        let mut handles: Vec<OpHandle> = Vec::with_capacity(specs.len());
        for spec in specs {
            let op = Operation::new(&task.id, spec);
            let handle = self
                .coordinator
                .submit_wait(op, SubmitOptions::default())
                .await
                .map_err(|e| match e {
                    crate::coordinator::SubmitError::Core(core) => PhaseError::from_core(core),
                    other => PhaseError::new(other.to_string(), ErrorKind::InvariantViolation),
                })?;
            handles.push(handle);
        }
        let op_ids: Vec<OperationId> = handles.iter().map(|h| h.operation_id.clone()).collect();

        let outcomes = match self.ctx.config.phase_timeout {
            Some(limit) => {
                let waited = tokio::time::timeout(
                    limit,
                    join_all(handles.iter().map(|h| h.await_terminal())),
                )
                .await;
                match waited {
                    Ok(outcomes) => outcomes,
                    Err(_) => {
                        warn!(task_id = %task.id, phase, "phase timed out; cancelling stragglers");
                        self.coordinator.cancel_ops(&op_ids).await;
                        join_all(handles.iter().map(|h| h.await_terminal())).await
                    }
                }
            }
            None => join_all(handles.iter().map(|h| h.await_terminal())).await,
        };

        let total = outcomes.len();
        let succeeded = outcomes.iter().filter(|o| o.succeeded()).count();
        let ratio_ok = total == 0
            || (succeeded >= 1 && succeeded as f64 / total as f64 >= min_success_ratio);

        if !ratio_ok {
            let (message, kind) = outcomes
                .iter()
                .find_map(|o| o.error.clone())
                .unwrap_or_else(|| {
                    (
                        format!("phase {phase} failed without error detail"),
                        ErrorKind::InvariantViolation,
                    )
                });
            let anchor_op = outcomes
                .iter()
                .find(|o| !o.succeeded())
                .map(|o| o.operation_id.clone());
            return Err(PhaseError {
                message: format!("phase {phase}: {message}"),
                kind,
                anchor_op,
            });
        }

        let mut counts = extra_counts;
        counts.insert("operations".to_string(), total as i64);
        counts.insert("succeeded".to_string(), succeeded as i64);
        counts.insert("failed".to_string(), (total - succeeded) as i64);

        self.ctx
            .bus
            .publish_scoped(
                project,
                MonitorEvent::PhaseCompleted {
                    parent_task_id: task.id.clone(),
                    phase: phase.to_string(),
                    counts,
                    message: format!("{succeeded}/{total} operation(s) succeeded"),
                },
            )
            .await;

        Ok(PhaseResult { op_ids })
    }

    /// After a sequential phase fails, record the never-to-run downstream
    /// steps as `DependencyFailed` by submitting them with a dependency on
    /// the failed op. They terminalize without dispatch.
    pub(crate) async fn record_dependency_failures(
        &self,
        task: &Task,
        anchor_op: &Option<OperationId>,
        remaining: Vec<OpSpec>,
    ) {
        let Some(anchor) = anchor_op else {
            return;
        };
        let mut handles = Vec::new();
        for spec in remaining {
            let op = Operation::new(&task.id, spec);
            match self
                .coordinator
                .submit(
                    op,
                    SubmitOptions::default().with_depends_on(vec![anchor.clone()]),
                )
                .await
            {
                Ok(handle) => handles.push(handle),
                Err(e) => warn!(task_id = %task.id, "could not record dependency failure: {e}"),
            }
        }
        join_all(handles.iter().map(|h| h.await_terminal())).await;
    }

    /// Fetch the typed output of a completed operation.
    pub(crate) async fn op_output(
        &self,
        op_id: &OperationId,
    ) -> Result<crate::model::OpOutput, PhaseError> {
        let op = self
            .ctx
            .store
            .get_operation(op_id)
            .await
            .map_err(|e| PhaseError::from_core(e.into()))?
            .ok_or_else(|| {
                PhaseError::new(format!("operation {op_id} vanished"), ErrorKind::Store)
            })?;
        op.output.ok_or_else(|| {
            PhaseError::new(
                format!("operation {op_id} has no output"),
                ErrorKind::InvariantViolation,
            )
        })
    }
}
