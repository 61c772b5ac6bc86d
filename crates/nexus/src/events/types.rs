//! Typed monitoring events.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;

/// Everything the core publishes on the bus. `task_*` events describe
/// operation lifecycle on workers; `phase_*` events describe orchestrator
/// progress; the rest is pool health.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum MonitorEvent {
    TaskEnqueued {
        task_id: String,
        operation_id: String,
        operation_type: String,
        queue: String,
    },
    TaskStarted {
        task_id: String,
        operation_id: String,
        operation_type: String,
        worker_id: String,
    },
    TaskCompleted {
        task_id: String,
        operation_id: String,
        operation_type: String,
        worker_id: String,
        duration_ms: i64,
    },
    TaskFailed {
        task_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        operation_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        operation_type: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        worker_id: Option<String>,
        error: String,
        error_kind: ErrorKind,
    },
    TaskRetry {
        task_id: String,
        operation_id: String,
        retry_count: u32,
        error: String,
    },
    TaskCancelled {
        task_id: String,
        operation_id: String,
    },
    PhaseStarted {
        parent_task_id: String,
        phase: String,
        message: String,
    },
    PhaseCompleted {
        parent_task_id: String,
        phase: String,
        counts: BTreeMap<String, i64>,
        message: String,
    },
    WorkerStarted {
        worker_id: String,
    },
    WorkerStopped {
        worker_id: String,
        status: String,
    },
    WorkerHeartbeat {
        worker_id: String,
        status: String,
    },
    QueueDepthUpdate {
        queues: BTreeMap<String, usize>,
    },
    StatsSnapshot {
        counts: BTreeMap<String, i64>,
        queues: BTreeMap<String, usize>,
        dropped_count: u64,
    },
}

impl MonitorEvent {
    /// The research task this event belongs to, for subscriber filtering.
    pub fn task_id(&self) -> Option<&str> {
        match self {
            MonitorEvent::TaskEnqueued { task_id, .. }
            | MonitorEvent::TaskStarted { task_id, .. }
            | MonitorEvent::TaskCompleted { task_id, .. }
            | MonitorEvent::TaskFailed { task_id, .. }
            | MonitorEvent::TaskRetry { task_id, .. }
            | MonitorEvent::TaskCancelled { task_id, .. } => Some(task_id),
            MonitorEvent::PhaseStarted { parent_task_id, .. }
            | MonitorEvent::PhaseCompleted { parent_task_id, .. } => Some(parent_task_id),
            _ => None,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            MonitorEvent::TaskEnqueued { .. } => "task_enqueued",
            MonitorEvent::TaskStarted { .. } => "task_started",
            MonitorEvent::TaskCompleted { .. } => "task_completed",
            MonitorEvent::TaskFailed { .. } => "task_failed",
            MonitorEvent::TaskRetry { .. } => "task_retry",
            MonitorEvent::TaskCancelled { .. } => "task_cancelled",
            MonitorEvent::PhaseStarted { .. } => "phase_started",
            MonitorEvent::PhaseCompleted { .. } => "phase_completed",
            MonitorEvent::WorkerStarted { .. } => "worker_started",
            MonitorEvent::WorkerStopped { .. } => "worker_stopped",
            MonitorEvent::WorkerHeartbeat { .. } => "worker_heartbeat",
            MonitorEvent::QueueDepthUpdate { .. } => "queue_depth_update",
            MonitorEvent::StatsSnapshot { .. } => "stats_snapshot",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialized_tag_matches_event_type() {
        let event = MonitorEvent::StatsSnapshot {
            counts: BTreeMap::new(),
            queues: BTreeMap::new(),
            dropped_count: 0,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event_type"], event.event_type());
    }

    #[test]
    fn test_failed_event_carries_kind() {
        let event = MonitorEvent::TaskFailed {
            task_id: "t".into(),
            operation_id: None,
            operation_type: None,
            worker_id: None,
            error: "all providers disabled".into(),
            error_kind: ErrorKind::ProviderDegraded,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["error_kind"], "provider_degraded");
    }
}
