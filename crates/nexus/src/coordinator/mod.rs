//! Task Coordinator: a fixed-size worker pool draining named priority
//! queues, with dependency waiting, classified retries, cooperative
//! cancellation, heartbeats, and backpressure.
//!
//! The coordinator never inspects operation payloads. Execution is
//! delegated to an injected [`OperationRunner`]; policy above single-op
//! granularity (phase outcomes, task failure) belongs to the orchestrator.

mod worker;

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{watch, Mutex, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::NexusConfig;
use crate::error::{CoreError, ErrorKind};
use crate::events::{EventBus, MonitorEvent};
use crate::gateway::RetryPolicy;
use crate::ledger::OperationLedger;
use crate::model::{Evidence, OpOutput, Operation, OperationId, OperationStatus, TaskId};
use crate::store::Store;

/// Poll fallback so workers make progress even on a missed wakeup.
const WORKER_POLL: Duration = Duration::from_millis(25);

/// What an operation produced. Evidence lands in the same ledger
/// transaction as the terminal transition.
#[derive(Debug)]
pub struct OpExecution {
    pub output: OpOutput,
    pub evidence: Vec<Evidence>,
}

/// Executes one operation. Implementations poll the cancellation token
/// before every external call.
#[async_trait]
pub trait OperationRunner: Send + Sync {
    async fn run(
        &self,
        op: &Operation,
        cancel: &CancellationToken,
    ) -> Result<OpExecution, CoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DependencyPolicy {
    /// A failed dependency fails the dependent with `DependencyFailed`.
    #[default]
    Propagate,
    /// Dispatch once all dependencies are terminal, whatever their outcome.
    BestEffort,
}

#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    pub priority: i32,
    pub depends_on: Vec<OperationId>,
    pub retry_policy: Option<RetryPolicy>,
    pub deadline: Option<DateTime<Utc>>,
    pub dependency_policy: DependencyPolicy,
}

impl SubmitOptions {
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_depends_on(mut self, deps: Vec<OperationId>) -> Self {
        self.depends_on = deps;
        self
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn best_effort(mut self) -> Self {
        self.dependency_policy = DependencyPolicy::BestEffort;
        self
    }
}

#[derive(Error, Debug)]
pub enum SubmitError {
    #[error("queue '{queue}' is full ({depth}/{cap})")]
    QueueFull {
        queue: String,
        depth: usize,
        cap: usize,
    },

    #[error(transparent)]
    Core(#[from] CoreError),
}

/// Observable operation state for handle holders.
#[derive(Debug, Clone)]
pub enum OpPhase {
    Pending,
    Terminal {
        status: OperationStatus,
        error: Option<(String, ErrorKind)>,
    },
}

/// Terminal outcome as seen by the submitter.
#[derive(Debug, Clone)]
pub struct OpOutcome {
    pub operation_id: OperationId,
    pub status: OperationStatus,
    pub error: Option<(String, ErrorKind)>,
}

impl OpOutcome {
    pub fn succeeded(&self) -> bool {
        self.status == OperationStatus::Completed
    }
}

#[derive(Clone, Debug)]
pub struct OpHandle {
    pub operation_id: OperationId,
    pub task_id: TaskId,
    rx: watch::Receiver<OpPhase>,
}

impl OpHandle {
    /// Wait for the operation to reach a terminal state.
    pub async fn await_terminal(&self) -> OpOutcome {
        let mut rx = self.rx.clone();
        loop {
            {
                let phase = rx.borrow();
                if let OpPhase::Terminal { status, error } = &*phase {
                    return OpOutcome {
                        operation_id: self.operation_id.clone(),
                        status: *status,
                        error: error.clone(),
                    };
                }
            }
            if rx.changed().await.is_err() {
                return OpOutcome {
                    operation_id: self.operation_id.clone(),
                    status: OperationStatus::Failed,
                    error: Some((
                        "coordinator shut down mid-flight".to_string(),
                        ErrorKind::InvariantViolation,
                    )),
                };
            }
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(&*self.rx.borrow(), OpPhase::Terminal { .. })
    }
}

#[derive(Clone, Copy)]
pub(crate) enum EntryPhase {
    Pending { not_before: Option<Instant> },
    Running { worker: usize, generation: u64 },
    Terminal(OperationStatus),
}

pub(crate) struct Entry {
    pub op: Operation,
    pub depends_on: Vec<OperationId>,
    pub dependency_policy: DependencyPolicy,
    pub retry: RetryPolicy,
    pub deadline: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub generation: u64,
    pub phase: EntryPhase,
    pub seq: u64,
    /// Child of the task token, so one op can be cancelled without
    /// cancelling its task.
    pub token: CancellationToken,
    pub tx: watch::Sender<OpPhase>,
}

impl Entry {
    fn is_terminal(&self) -> bool {
        matches!(self.phase, EntryPhase::Terminal(_))
    }
}

#[derive(Default)]
pub(crate) struct State {
    pub entries: HashMap<OperationId, Entry>,
    pub task_tokens: HashMap<TaskId, CancellationToken>,
    pub next_seq: u64,
}

impl State {
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.entries
            .values()
            .filter(|e| e.op.queue == queue && !e.is_terminal())
            .count()
    }

    pub fn queue_depths(&self) -> BTreeMap<String, usize> {
        let mut depths: BTreeMap<String, usize> = BTreeMap::new();
        for entry in self.entries.values() {
            if !entry.is_terminal() {
                *depths.entry(entry.op.queue.clone()).or_insert(0) += 1;
            }
        }
        depths
    }

    pub fn terminal_counts(&self) -> BTreeMap<String, i64> {
        let mut counts: BTreeMap<String, i64> = BTreeMap::new();
        for entry in self.entries.values() {
            if let EntryPhase::Terminal(status) = entry.phase {
                *counts.entry(status.to_string()).or_insert(0) += 1;
            }
        }
        counts
    }

    pub fn token_for(&mut self, task_id: &str) -> CancellationToken {
        self.task_tokens
            .entry(task_id.to_string())
            .or_default()
            .clone()
    }
}

pub(crate) struct WorkerHealth {
    pub last_beat_ms: AtomicU64,
    pub stale: AtomicBool,
}

pub(crate) struct Inner {
    pub config: NexusConfig,
    pub ledger: OperationLedger,
    pub bus: EventBus,
    pub runner: Arc<dyn OperationRunner>,
    pub state: Mutex<State>,
    pub ready: Notify,
    pub shutdown: CancellationToken,
    pub health: Vec<Arc<WorkerHealth>>,
}

#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
    handles: Arc<std::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>>,
}

impl Coordinator {
    /// Spin up the worker pool, heartbeat supervisor, stats emitter, and
    /// bus keepalive.
    pub fn start(
        config: NexusConfig,
        store: Store,
        bus: EventBus,
        runner: Arc<dyn OperationRunner>,
    ) -> Self {
        let worker_count = config.worker_count.max(1);
        let health = (0..worker_count)
            .map(|_| {
                Arc::new(WorkerHealth {
                    last_beat_ms: AtomicU64::new(epoch_millis()),
                    stale: AtomicBool::new(false),
                })
            })
            .collect();

        let inner = Arc::new(Inner {
            ledger: OperationLedger::new(store, bus.clone()),
            bus: bus.clone(),
            runner,
            state: Mutex::new(State::default()),
            ready: Notify::new(),
            shutdown: CancellationToken::new(),
            health,
            config,
        });

        let mut handles = Vec::new();
        for worker_id in 0..worker_count {
            let inner = Arc::clone(&inner);
            handles.push(tokio::spawn(worker::worker_loop(inner, worker_id)));
        }
        handles.push(tokio::spawn(supervisor_loop(Arc::clone(&inner))));
        handles.push(tokio::spawn(stats_loop(Arc::clone(&inner))));
        handles.push(bus.start_keepalive(Duration::from_secs(25)));

        Self {
            inner,
            handles: Arc::new(std::sync::Mutex::new(handles)),
        }
    }

    /// Submit an operation. Returns the existing handle when the id was
    /// already submitted; `QueueFull` when the queue is at its depth cap.
    pub async fn submit(
        &self,
        op: Operation,
        opts: SubmitOptions,
    ) -> Result<OpHandle, SubmitError> {
        self.try_submit(&op, &opts).await
    }

    /// Submit, waiting for queue capacity instead of failing. Bails out
    /// early if the task is cancelled while waiting.
    pub async fn submit_wait(
        &self,
        op: Operation,
        opts: SubmitOptions,
    ) -> Result<OpHandle, SubmitError> {
        loop {
            match self.try_submit(&op, &opts).await {
                Ok(handle) => return Ok(handle),
                Err(SubmitError::QueueFull { queue, depth, cap }) => {
                    if self.task_token(&op.task_id).await.is_cancelled() {
                        return Err(SubmitError::Core(CoreError::Cancelled));
                    }
                    debug!("queue '{queue}' full ({depth}/{cap}); waiting");
                    tokio::time::sleep(WORKER_POLL).await;
                }
                Err(other) => return Err(other),
            }
        }
    }

    async fn try_submit(
        &self,
        original: &Operation,
        opts: &SubmitOptions,
    ) -> Result<OpHandle, SubmitError> {
        let mut op = original.clone();
        op.priority = opts.priority;

        let mut state = self.inner.state.lock().await;

        if let Some(entry) = state.entries.get(&op.id) {
            return Ok(OpHandle {
                operation_id: op.id.clone(),
                task_id: entry.op.task_id.clone(),
                rx: entry.tx.subscribe(),
            });
        }

        let cap = self.inner.config.queue_cap(&op.queue);
        let depth = state.queue_depth(&op.queue);
        if depth >= cap {
            return Err(SubmitError::QueueFull {
                queue: op.queue.clone(),
                depth,
                cap,
            });
        }

        let op_token = state.token_for(&op.task_id).child_token();
        let deps_pending = opts
            .depends_on
            .iter()
            .any(|dep| state.entries.get(dep).map_or(false, |e| !e.is_terminal()));

        // Persist before the entry becomes claimable.
        self.inner
            .ledger
            .record_enqueued(&op)
            .await
            .map_err(SubmitError::Core)?;
        if deps_pending {
            self.inner
                .ledger
                .record_waiting_deps(&op)
                .await
                .map_err(SubmitError::Core)?;
        }

        let (tx, rx) = watch::channel(OpPhase::Pending);
        let seq = state.next_seq;
        state.next_seq += 1;

        let handle = OpHandle {
            operation_id: op.id.clone(),
            task_id: op.task_id.clone(),
            rx,
        };

        state.entries.insert(
            op.id.clone(),
            Entry {
                depends_on: opts.depends_on.clone(),
                dependency_policy: opts.dependency_policy,
                retry: opts.retry_policy.unwrap_or(RetryPolicy {
                    max_attempts: self.inner.config.max_retries.max(1),
                    base: self.inner.config.retry_base,
                    jitter: true,
                }),
                deadline: opts.deadline,
                attempts: 0,
                generation: 0,
                phase: EntryPhase::Pending { not_before: None },
                seq,
                token: op_token,
                tx,
                op,
            },
        );

        let depths = state.queue_depths();
        drop(state);

        self.inner
            .bus
            .publish(MonitorEvent::QueueDepthUpdate { queues: depths })
            .await;
        self.inner.ready.notify_waiters();

        Ok(handle)
    }

    /// Cooperative cancellation of everything a task owns. Idempotent.
    pub async fn cancel(&self, task_id: &str) {
        let mut state = self.inner.state.lock().await;
        let token = state.token_for(task_id);
        token.cancel();

        let mut cancelled = Vec::new();
        for entry in state.entries.values_mut() {
            if entry.op.task_id == task_id && !entry.is_terminal() {
                if let EntryPhase::Pending { .. } = entry.phase {
                    entry.phase = EntryPhase::Terminal(OperationStatus::Cancelled);
                    cancelled.push((entry.op.clone(), entry.tx.clone()));
                }
                // Running entries observe the token at their next call
                // boundary and finalize themselves.
            }
        }
        let depths = state.queue_depths();
        drop(state);

        for (op, tx) in cancelled {
            if let Err(e) = self.inner.ledger.record_cancelled(&op).await {
                warn!("failed to record cancellation for {}: {e}", op.id);
            }
            let _ = tx.send(OpPhase::Terminal {
                status: OperationStatus::Cancelled,
                error: Some(("cancelled".to_string(), ErrorKind::Cancelled)),
            });
        }

        self.inner
            .bus
            .publish(MonitorEvent::QueueDepthUpdate { queues: depths })
            .await;
        self.inner.ready.notify_waiters();
    }

    /// Cancel specific operations (used for phase-level timeouts) without
    /// touching the rest of the task.
    pub async fn cancel_ops(&self, op_ids: &[OperationId]) {
        let mut state = self.inner.state.lock().await;
        let mut cancelled = Vec::new();
        for op_id in op_ids {
            if let Some(entry) = state.entries.get_mut(op_id) {
                if entry.is_terminal() {
                    continue;
                }
                entry.token.cancel();
                if let EntryPhase::Pending { .. } = entry.phase {
                    entry.phase = EntryPhase::Terminal(OperationStatus::Cancelled);
                    cancelled.push((entry.op.clone(), entry.tx.clone()));
                }
            }
        }
        let depths = state.queue_depths();
        drop(state);

        for (op, tx) in cancelled {
            if let Err(e) = self.inner.ledger.record_cancelled(&op).await {
                warn!("failed to record cancellation for {}: {e}", op.id);
            }
            let _ = tx.send(OpPhase::Terminal {
                status: OperationStatus::Cancelled,
                error: Some(("cancelled".to_string(), ErrorKind::Cancelled)),
            });
        }

        self.inner
            .bus
            .publish(MonitorEvent::QueueDepthUpdate { queues: depths })
            .await;
        self.inner.ready.notify_waiters();
    }

    pub async fn task_token(&self, task_id: &str) -> CancellationToken {
        self.inner.state.lock().await.token_for(task_id)
    }

    pub async fn queue_depths(&self) -> BTreeMap<String, usize> {
        self.inner.state.lock().await.queue_depths()
    }

    /// Stop workers and background loops. In-flight operations finalize on
    /// their own; pending work stays pending.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.ready.notify_waiters();
        let handles: Vec<_> = {
            let mut guard = self.handles.lock().expect("handles mutex");
            guard.drain(..).collect()
        };
        for handle in handles {
            handle.abort();
        }
    }

}

fn epoch_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Requeue in-flight work of workers whose heartbeat went silent.
async fn supervisor_loop(inner: Arc<Inner>) {
    let mut ticker = tokio::time::interval(inner.config.heartbeat_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let ttl_ms = inner.config.heartbeat_ttl.as_millis() as u64;
        let now = epoch_millis();
        for (worker_id, health) in inner.health.iter().enumerate() {
            let silent_for = now.saturating_sub(health.last_beat_ms.load(Ordering::Relaxed));
            let was_stale = health.stale.load(Ordering::Relaxed);
            if silent_for > ttl_ms && !was_stale {
                health.stale.store(true, Ordering::Relaxed);
                inner
                    .bus
                    .publish(MonitorEvent::WorkerStopped {
                        worker_id: format!("worker-{worker_id}"),
                        status: "stale".to_string(),
                    })
                    .await;
                worker::requeue_worker_ops(&inner, worker_id).await;
            } else if silent_for <= ttl_ms && was_stale {
                health.stale.store(false, Ordering::Relaxed);
                inner
                    .bus
                    .publish(MonitorEvent::WorkerStarted {
                        worker_id: format!("worker-{worker_id}"),
                    })
                    .await;
            }
        }
    }
}

/// Periodic `stats_snapshot` with terminal counts, queue depths, and the
/// bus drop counter.
async fn stats_loop(inner: Arc<Inner>) {
    let mut ticker = tokio::time::interval(inner.config.stats_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let (counts, queues) = {
            let state = inner.state.lock().await;
            (state.terminal_counts(), state.queue_depths())
        };
        inner
            .bus
            .publish(MonitorEvent::StatsSnapshot {
                counts,
                queues,
                dropped_count: inner.bus.take_dropped(),
            })
            .await;
    }
}
