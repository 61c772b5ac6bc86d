//! Monitoring event bus.
//!
//! Best-effort publish/subscribe over a broadcast channel. The stream is
//! explicitly not a durable queue: workflow correctness never depends on
//! delivery. Subscribers tolerate duplicates by `event_id` and sort by
//! `(ts, event_id)` when merging publishers.

mod types;

pub use types::MonitorEvent;

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

pub const DEFAULT_BUS_CAPACITY: usize = 1024;
const PUBLISH_ATTEMPTS: u32 = 3;
const PUBLISH_BACKOFF: Duration = Duration::from_millis(10);
/// Floor under string truncation so payloads stay readable.
const MIN_STRING_BUDGET: usize = 64;

/// Wire envelope. `payload` is the serialized event (tagged by
/// `event_type`); pings carry no payload and no event_type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_id: String,
    pub ts: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default)]
    pub truncated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl EventEnvelope {
    pub fn is_ping(&self) -> bool {
        self.payload.is_none()
    }

    pub fn event_type(&self) -> Option<&str> {
        self.payload
            .as_ref()
            .and_then(|p| p.get("event_type"))
            .and_then(|v| v.as_str())
    }

    /// Typed view. Pings and unparseable payloads yield `None`.
    pub fn event(&self) -> Option<MonitorEvent> {
        self.payload
            .as_ref()
            .and_then(|p| serde_json::from_value(p.clone()).ok())
    }
}

/// Subscriber-side filter. Pings always pass so the connection stays warm.
#[derive(Debug, Clone, Default)]
pub struct SubscriberFilter {
    pub project_id: Option<String>,
    pub task_id: Option<String>,
    pub event_types: Option<HashSet<String>>,
}

impl SubscriberFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn for_task(task_id: impl Into<String>) -> Self {
        Self {
            task_id: Some(task_id.into()),
            ..Self::default()
        }
    }

    pub fn for_project(project_id: impl Into<String>) -> Self {
        Self {
            project_id: Some(project_id.into()),
            ..Self::default()
        }
    }

    pub fn with_event_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.event_types = Some(types.into_iter().map(Into::into).collect());
        self
    }

    fn matches(&self, envelope: &EventEnvelope) -> bool {
        if envelope.is_ping() {
            return true;
        }
        if let Some(project_id) = &self.project_id {
            if envelope.project_id.as_deref() != Some(project_id.as_str()) {
                return false;
            }
        }
        if let Some(task_id) = &self.task_id {
            if envelope.task_id.as_deref() != Some(task_id.as_str()) {
                return false;
            }
        }
        if let Some(event_types) = &self.event_types {
            match envelope.event_type() {
                Some(event_type) if event_types.contains(event_type) => {}
                _ => return false,
            }
        }
        true
    }
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EventEnvelope>,
    max_event_bytes: usize,
    dropped: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new(capacity: usize, max_event_bytes: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            max_event_bytes,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Publish an event. Best-effort: after bounded retry the event is
    /// dropped and accounted in the next stats snapshot.
    pub async fn publish(&self, event: MonitorEvent) {
        self.publish_scoped(None, event).await;
    }

    pub async fn publish_scoped(&self, project_id: Option<&str>, event: MonitorEvent) {
        let task_id = event.task_id().map(String::from);
        let (payload, truncated) = match serde_json::to_value(&event) {
            Ok(value) => self.bound_payload(value),
            Err(e) => {
                debug!("dropping unserializable event: {e}");
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        let envelope = EventEnvelope {
            event_id: uuid::Uuid::new_v4().to_string(),
            ts: Utc::now(),
            project_id: project_id.map(String::from),
            task_id,
            truncated,
            payload: Some(payload),
        };

        self.send_with_retry(envelope).await;
    }

    async fn send_with_retry(&self, envelope: EventEnvelope) {
        let mut backoff = PUBLISH_BACKOFF;
        for attempt in 0..PUBLISH_ATTEMPTS {
            // No subscribers at all is not a transient condition; the
            // stream is best-effort, so account and move on.
            if self.tx.receiver_count() == 0 {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
            match self.tx.send(envelope.clone()) {
                Ok(_) => return,
                Err(_) if attempt + 1 < PUBLISH_ATTEMPTS => {
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(_) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    /// Enforce the payload size cap by shrinking string values, largest
    /// first, and flagging the envelope as truncated.
    fn bound_payload(&self, mut value: serde_json::Value) -> (serde_json::Value, bool) {
        let size = |v: &serde_json::Value| serde_json::to_string(v).map(|s| s.len()).unwrap_or(0);
        if size(&value) <= self.max_event_bytes {
            return (value, false);
        }

        let mut budget = 1024usize;
        while size(&value) > self.max_event_bytes && budget >= MIN_STRING_BUDGET {
            truncate_strings(&mut value, budget);
            budget /= 2;
        }
        (value, true)
    }

    pub fn subscribe(&self, filter: SubscriberFilter) -> EventStream {
        EventStream {
            rx: self.tx.subscribe(),
            filter,
            dropped: Arc::clone(&self.dropped),
        }
    }

    /// Events dropped (publish failures and subscriber lag) since the last
    /// call. Reported via `stats_snapshot`.
    pub fn take_dropped(&self) -> u64 {
        self.dropped.swap(0, Ordering::Relaxed)
    }

    /// Emit keepalive pings until the handle is dropped or aborted. The
    /// interval must stay at or under the 30 s contract.
    pub fn start_keepalive(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let _ = tx.send(EventEnvelope {
                    event_id: uuid::Uuid::new_v4().to_string(),
                    ts: Utc::now(),
                    project_id: None,
                    task_id: None,
                    truncated: false,
                    payload: None,
                });
            }
        })
    }
}

fn truncate_strings(value: &mut serde_json::Value, budget: usize) {
    match value {
        serde_json::Value::String(s) => {
            if s.len() > budget {
                let mut cut = budget;
                while cut > 0 && !s.is_char_boundary(cut) {
                    cut -= 1;
                }
                s.truncate(cut);
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                truncate_strings(item, budget);
            }
        }
        serde_json::Value::Object(map) => {
            for (key, item) in map.iter_mut() {
                // The discriminant must survive for typed consumers.
                if key != "event_type" {
                    truncate_strings(item, budget);
                }
            }
        }
        _ => {}
    }
}

/// Filtered subscription over the bus.
pub struct EventStream {
    rx: broadcast::Receiver<EventEnvelope>,
    filter: SubscriberFilter,
    dropped: Arc<AtomicU64>,
}

impl EventStream {
    /// Next matching envelope. `None` when the bus shut down.
    pub async fn recv(&mut self) -> Option<EventEnvelope> {
        loop {
            match self.rx.recv().await {
                Ok(envelope) => {
                    if self.filter.matches(&envelope) {
                        return Some(envelope);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    self.dropped.fetch_add(skipped, Ordering::Relaxed);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next matching typed event, discarding pings.
    pub async fn recv_event(&mut self) -> Option<MonitorEvent> {
        loop {
            let envelope = self.recv().await?;
            if let Some(event) = envelope.event() {
                return Some(event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_and_filtered_subscribe() {
        let bus = EventBus::new(16, crate::config::DEFAULT_EVENT_MAX_BYTES);
        let mut all = bus.subscribe(SubscriberFilter::all());
        let mut only_a = bus.subscribe(SubscriberFilter::for_task("task-a"));

        bus.publish(MonitorEvent::PhaseStarted {
            parent_task_id: "task-a".into(),
            phase: "mcp_search".into(),
            message: "fan-out".into(),
        })
        .await;
        bus.publish(MonitorEvent::PhaseStarted {
            parent_task_id: "task-b".into(),
            phase: "mcp_search".into(),
            message: "fan-out".into(),
        })
        .await;

        let first = all.recv_event().await.unwrap();
        assert_eq!(first.task_id(), Some("task-a"));
        let second = all.recv_event().await.unwrap();
        assert_eq!(second.task_id(), Some("task-b"));

        let filtered = only_a.recv_event().await.unwrap();
        assert_eq!(filtered.task_id(), Some("task-a"));
    }

    #[tokio::test]
    async fn test_event_type_filter() {
        let bus = EventBus::new(16, crate::config::DEFAULT_EVENT_MAX_BYTES);
        let mut stream = bus.subscribe(SubscriberFilter::all().with_event_types(["task_retry"]));

        bus.publish(MonitorEvent::WorkerStarted {
            worker_id: "worker-0".into(),
        })
        .await;
        bus.publish(MonitorEvent::TaskRetry {
            task_id: "t".into(),
            operation_id: "op".into(),
            retry_count: 1,
            error: "503".into(),
        })
        .await;

        let event = stream.recv_event().await.unwrap();
        assert!(matches!(event, MonitorEvent::TaskRetry { retry_count: 1, .. }));
    }

    #[tokio::test]
    async fn test_oversized_event_is_truncated_but_typed() {
        let bus = EventBus::new(16, 512);
        let mut stream = bus.subscribe(SubscriberFilter::all());

        bus.publish(MonitorEvent::TaskFailed {
            task_id: "t".into(),
            operation_id: Some("op".into()),
            operation_type: Some("mcp_search".into()),
            worker_id: None,
            error: "x".repeat(10_000),
            error_kind: crate::error::ErrorKind::ProviderPermanent,
        })
        .await;

        let envelope = stream.recv().await.unwrap();
        assert!(envelope.truncated);
        let serialized = serde_json::to_string(&envelope.payload).unwrap();
        assert!(serialized.len() <= 2048);
        // The discriminant survives truncation.
        assert!(envelope.event().is_some());
    }

    #[tokio::test]
    async fn test_lag_is_counted_as_dropped() {
        let bus = EventBus::new(2, crate::config::DEFAULT_EVENT_MAX_BYTES);
        let mut stream = bus.subscribe(SubscriberFilter::all());

        for i in 0..8 {
            bus.publish(MonitorEvent::WorkerHeartbeat {
                worker_id: format!("worker-{i}"),
                status: "idle".into(),
            })
            .await;
        }

        // Receiving after overflow surfaces the lag.
        let _ = stream.recv().await.unwrap();
        assert!(bus.take_dropped() > 0);
        assert_eq!(bus.take_dropped(), 0);
    }
}
