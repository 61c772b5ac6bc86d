//! Worker loop: claim the best ready operation, execute it under the
//! cancellation token and deadline, classify the outcome, finalize or
//! requeue.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::{
    epoch_millis, DependencyPolicy, EntryPhase, Inner, OpPhase, WORKER_POLL,
};
use crate::error::{CoreError, ErrorKind};
use crate::events::MonitorEvent;
use crate::gateway::RetryPolicy;
use crate::model::{Operation, OperationStatus};

pub(super) struct Claim {
    op: Operation,
    retry: RetryPolicy,
    deadline: Option<chrono::DateTime<Utc>>,
    attempts: u32,
    generation: u64,
    token: CancellationToken,
}

pub(super) async fn worker_loop(inner: Arc<Inner>, worker_id: usize) {
    let worker_name = format!("worker-{worker_id}");
    inner
        .bus
        .publish(MonitorEvent::WorkerStarted {
            worker_id: worker_name.clone(),
        })
        .await;

    let mut heartbeat = tokio::time::interval(inner.config.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        stamp(&inner, worker_id);

        while let Some(claim) = claim_next(&inner, worker_id).await {
            stamp(&inner, worker_id);
            execute(&inner, worker_id, &worker_name, claim).await;
            stamp(&inner, worker_id);
            if inner.shutdown.is_cancelled() {
                break;
            }
        }

        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = inner.ready.notified() => {}
            _ = heartbeat.tick() => {
                stamp(&inner, worker_id);
                inner.bus.publish(MonitorEvent::WorkerHeartbeat {
                    worker_id: worker_name.clone(),
                    status: "idle".to_string(),
                }).await;
            }
            _ = tokio::time::sleep(WORKER_POLL) => {}
        }
    }

    inner
        .bus
        .publish(MonitorEvent::WorkerStopped {
            worker_id: worker_name,
            status: "shutdown".to_string(),
        })
        .await;
}

fn stamp(inner: &Inner, worker_id: usize) {
    inner.health[worker_id]
        .last_beat_ms
        .store(epoch_millis(), Ordering::Relaxed);
}

/// Pick the best ready operation: priority descending, then submission
/// order. Dependency failures and cancellations discovered during the scan
/// are finalized without dispatch.
async fn claim_next(inner: &Arc<Inner>, worker_id: usize) -> Option<Claim> {
    struct Finalize {
        op: Operation,
        tx: watch::Sender<OpPhase>,
        status: OperationStatus,
        error: Option<(String, ErrorKind)>,
    }

    let (claim, finalized) = {
        let mut state = inner.state.lock().await;
        let now = Instant::now();

        // Terminal snapshot for dependency evaluation.
        let terminal: HashMap<String, Option<OperationStatus>> = state
            .entries
            .iter()
            .map(|(id, entry)| {
                let status = match entry.phase {
                    EntryPhase::Terminal(status) => Some(status),
                    _ => None,
                };
                (id.clone(), status)
            })
            .collect();

        let mut running_per_queue: HashMap<String, usize> = HashMap::new();
        for entry in state.entries.values() {
            if matches!(entry.phase, EntryPhase::Running { .. }) {
                *running_per_queue.entry(entry.op.queue.clone()).or_insert(0) += 1;
            }
        }

        let mut to_cancel: Vec<String> = Vec::new();
        let mut to_dep_fail: Vec<(String, String)> = Vec::new();
        let mut best: Option<(i32, u64, String)> = None;

        for (id, entry) in state.entries.iter() {
            let EntryPhase::Pending { not_before } = entry.phase else {
                continue;
            };
            if let Some(not_before) = not_before {
                if now < not_before {
                    continue;
                }
            }

            if entry.token.is_cancelled() {
                to_cancel.push(id.clone());
                continue;
            }

            let mut ready = true;
            let mut failed_dep = None;
            for dep in &entry.depends_on {
                match terminal.get(dep) {
                    Some(Some(OperationStatus::Completed)) => {}
                    Some(Some(_)) => {
                        if entry.dependency_policy == DependencyPolicy::Propagate {
                            failed_dep = Some(dep.clone());
                        }
                    }
                    Some(None) => {
                        ready = false;
                        break;
                    }
                    None => {
                        failed_dep = Some(dep.clone());
                    }
                }
            }
            if !ready {
                continue;
            }
            if let Some(dep) = failed_dep {
                to_dep_fail.push((id.clone(), dep));
                continue;
            }

            let cap = inner.config.queue_concurrency(&entry.op.queue);
            if running_per_queue.get(&entry.op.queue).copied().unwrap_or(0) >= cap {
                continue;
            }

            let candidate = (entry.op.priority, entry.seq, id.clone());
            let better = match &best {
                None => true,
                Some((priority, seq, _)) => {
                    candidate.0 > *priority || (candidate.0 == *priority && candidate.1 < *seq)
                }
            };
            if better {
                best = Some(candidate);
            }
        }

        let mut finalized = Vec::new();
        for id in to_cancel {
            if let Some(entry) = state.entries.get_mut(&id) {
                entry.phase = EntryPhase::Terminal(OperationStatus::Cancelled);
                finalized.push(Finalize {
                    op: entry.op.clone(),
                    tx: entry.tx.clone(),
                    status: OperationStatus::Cancelled,
                    error: Some(("cancelled".to_string(), ErrorKind::Cancelled)),
                });
            }
        }
        for (id, dep) in to_dep_fail {
            if let Some(entry) = state.entries.get_mut(&id) {
                entry.phase = EntryPhase::Terminal(OperationStatus::Failed);
                finalized.push(Finalize {
                    op: entry.op.clone(),
                    tx: entry.tx.clone(),
                    status: OperationStatus::Failed,
                    error: Some((
                        format!("dependency {dep} did not complete"),
                        ErrorKind::DependencyFailed,
                    )),
                });
            }
        }

        let claim = best.and_then(|(_, _, id)| {
            let entry = state.entries.get_mut(&id)?;
            let generation = entry.generation;
            entry.phase = EntryPhase::Running {
                worker: worker_id,
                generation,
            };
            Some(Claim {
                op: entry.op.clone(),
                retry: entry.retry,
                deadline: entry.deadline,
                attempts: entry.attempts,
                generation,
                token: entry.token.clone(),
            })
        });

        (claim, finalized)
    };

    let had_finalized = !finalized.is_empty();
    for item in finalized {
        let record = match item.status {
            OperationStatus::Cancelled => inner.ledger.record_cancelled(&item.op).await,
            _ => {
                let message = item
                    .error
                    .as_ref()
                    .map(|(m, _)| m.clone())
                    .unwrap_or_default();
                inner
                    .ledger
                    .record_failed(
                        &item.op,
                        &CoreError::DependencyFailed(message),
                        0,
                        None,
                    )
                    .await
            }
        };
        if let Err(e) = record {
            warn!("ledger write failed finalizing {}: {e}", item.op.id);
        }
        let _ = item.tx.send(OpPhase::Terminal {
            status: item.status,
            error: item.error,
        });
    }
    if had_finalized {
        publish_depths(inner).await;
        inner.ready.notify_waiters();
    }

    if let Some(claim) = &claim {
        if let Err(e) = inner.ledger.record_dispatched(&claim.op).await {
            warn!("ledger write failed dispatching {}: {e}", claim.op.id);
        }
    }
    claim
}

async fn execute(inner: &Arc<Inner>, worker_id: usize, worker_name: &str, claim: Claim) {
    if let Err(e) = inner.ledger.record_started(&claim.op, worker_name).await {
        warn!("ledger write failed starting {}: {e}", claim.op.id);
    }

    let result = run_claim(inner, &claim).await;

    // An error observed after cancellation is reported as cancellation.
    let result = match result {
        Err(e) if claim.token.is_cancelled() && !matches!(e, CoreError::Cancelled) => {
            Err(CoreError::Cancelled)
        }
        other => other,
    };

    match result {
        Ok(execution) => {
            let Some((op, tx)) = mark_terminal(inner, &claim, OperationStatus::Completed).await
            else {
                return;
            };
            if let Err(e) = inner
                .ledger
                .record_completed(
                    &op,
                    execution.output,
                    execution.evidence,
                    claim.attempts,
                    worker_name,
                )
                .await
            {
                warn!("ledger write failed completing {}: {e}", op.id);
            }
            let _ = tx.send(OpPhase::Terminal {
                status: OperationStatus::Completed,
                error: None,
            });
        }
        Err(CoreError::Cancelled) => {
            let Some((op, tx)) = mark_terminal(inner, &claim, OperationStatus::Cancelled).await
            else {
                return;
            };
            if let Err(e) = inner.ledger.record_cancelled(&op).await {
                warn!("ledger write failed cancelling {}: {e}", op.id);
            }
            let _ = tx.send(OpPhase::Terminal {
                status: OperationStatus::Cancelled,
                error: Some(("cancelled".to_string(), ErrorKind::Cancelled)),
            });
        }
        Err(err) if err.is_transient() && claim.attempts + 1 < claim.retry.max_attempts => {
            let retry_count = claim.attempts + 1;
            let requeued = {
                let mut state = inner.state.lock().await;
                match state.entries.get_mut(&claim.op.id) {
                    Some(entry) if entry.generation == claim.generation => {
                        entry.attempts = retry_count;
                        entry.generation += 1;
                        entry.phase = EntryPhase::Pending {
                            not_before: Some(
                                Instant::now() + claim.retry.backoff(claim.attempts),
                            ),
                        };
                        true
                    }
                    _ => false,
                }
            };
            if requeued {
                if let Err(e) = inner.ledger.record_retry(&claim.op, retry_count, &err).await {
                    warn!("ledger write failed retrying {}: {e}", claim.op.id);
                }
            }
        }
        Err(err) => {
            let Some((op, tx)) = mark_terminal(inner, &claim, OperationStatus::Failed).await
            else {
                return;
            };
            if let Err(e) = inner
                .ledger
                .record_failed(&op, &err, claim.attempts, Some(worker_name))
                .await
            {
                warn!("ledger write failed failing {}: {e}", op.id);
            }
            let _ = tx.send(OpPhase::Terminal {
                status: OperationStatus::Failed,
                error: Some((err.to_string(), err.kind())),
            });
        }
    }

    let _ = worker_id;
    publish_depths(inner).await;
    inner.ready.notify_waiters();
}

async fn run_claim(inner: &Arc<Inner>, claim: &Claim) -> Result<super::OpExecution, CoreError> {
    if claim.token.is_cancelled() {
        return Err(CoreError::Cancelled);
    }

    let work = inner.runner.run(&claim.op, &claim.token);
    match claim.deadline {
        Some(deadline) => {
            let remaining = (deadline - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO);
            if remaining.is_zero() {
                return Err(CoreError::Timeout(format!(
                    "deadline {deadline} passed before dispatch"
                )));
            }
            tokio::select! {
                biased;
                _ = claim.token.cancelled() => Err(CoreError::Cancelled),
                outcome = tokio::time::timeout(remaining, work) => match outcome {
                    Ok(result) => result,
                    Err(_) => Err(CoreError::Timeout(format!("deadline {deadline} exceeded"))),
                },
            }
        }
        None => {
            tokio::select! {
                biased;
                _ = claim.token.cancelled() => Err(CoreError::Cancelled),
                result = work => result,
            }
        }
    }
}

/// Flip a running entry to terminal iff this claim still owns it. A stale
/// claim (requeued by the supervisor) drops its result.
async fn mark_terminal(
    inner: &Arc<Inner>,
    claim: &Claim,
    status: OperationStatus,
) -> Option<(Operation, watch::Sender<OpPhase>)> {
    let mut state = inner.state.lock().await;
    let entry = state.entries.get_mut(&claim.op.id)?;
    match entry.phase {
        EntryPhase::Running { generation, .. } if generation == claim.generation => {
            entry.phase = EntryPhase::Terminal(status);
            Some((entry.op.clone(), entry.tx.clone()))
        }
        _ => None,
    }
}

async fn publish_depths(inner: &Arc<Inner>) {
    let depths = {
        let state = inner.state.lock().await;
        state.queue_depths()
    };
    inner
        .bus
        .publish(MonitorEvent::QueueDepthUpdate { queues: depths })
        .await;
}

/// Called by the supervisor when a worker's heartbeat goes silent: requeue
/// its in-flight operations once per loss, bounded by the retry budget.
pub(super) async fn requeue_worker_ops(inner: &Arc<Inner>, worker_id: usize) {
    struct Failed {
        op: Operation,
        tx: watch::Sender<OpPhase>,
        error: CoreError,
        attempts: u32,
    }
    struct Requeued {
        op: Operation,
        retry_count: u32,
    }

    let (failed, requeued) = {
        let mut state = inner.state.lock().await;
        let mut failed = Vec::new();
        let mut requeued = Vec::new();

        let ids: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, e)| matches!(e.phase, EntryPhase::Running { worker, .. } if worker == worker_id))
            .map(|(id, _)| id.clone())
            .collect();

        for id in ids {
            let Some(entry) = state.entries.get_mut(&id) else {
                continue;
            };
            let next_attempt = entry.attempts + 1;
            if next_attempt >= entry.retry.max_attempts {
                entry.phase = EntryPhase::Terminal(OperationStatus::Failed);
                failed.push(Failed {
                    op: entry.op.clone(),
                    tx: entry.tx.clone(),
                    error: CoreError::Timeout(format!(
                        "worker-{worker_id} heartbeat lost mid-operation"
                    )),
                    attempts: entry.attempts,
                });
            } else {
                entry.attempts = next_attempt;
                entry.generation += 1;
                entry.phase = EntryPhase::Pending { not_before: None };
                requeued.push(Requeued {
                    op: entry.op.clone(),
                    retry_count: next_attempt,
                });
            }
        }
        (failed, requeued)
    };

    for item in &requeued {
        let err = CoreError::Timeout("worker heartbeat lost".to_string());
        if let Err(e) = inner
            .ledger
            .record_retry(&item.op, item.retry_count, &err)
            .await
        {
            warn!("ledger write failed requeueing {}: {e}", item.op.id);
        }
    }
    for item in failed {
        if let Err(e) = inner
            .ledger
            .record_failed(&item.op, &item.error, item.attempts, None)
            .await
        {
            warn!("ledger write failed failing {}: {e}", item.op.id);
        }
        let _ = item.tx.send(OpPhase::Terminal {
            status: OperationStatus::Failed,
            error: Some((item.error.to_string(), item.error.kind())),
        });
    }

    if !requeued.is_empty() {
        inner.ready.notify_waiters();
    }
}
