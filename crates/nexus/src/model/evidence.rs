//! Raw artifacts: evidence rows, deduplicated sources, and per-source
//! summaries (DOK-1).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::{OperationId, ProviderId, SourceId, TaskId};

/// Raw artifact captured by an operation. Stored verbatim; never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evidence {
    pub id: String,
    pub operation_id: OperationId,
    pub task_id: TaskId,
    pub evidence_type: String,
    pub data: serde_json::Value,
    pub source_url: Option<String>,
    pub provider: Option<ProviderId>,
    pub size_bytes: i64,
    pub created_at: DateTime<Utc>,
}

impl Evidence {
    pub fn new(
        operation_id: impl Into<OperationId>,
        task_id: impl Into<TaskId>,
        evidence_type: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        let size_bytes = serde_json::to_string(&data)
            .map(|s| s.len() as i64)
            .unwrap_or(0);
        Self {
            id: super::new_id(),
            operation_id: operation_id.into(),
            task_id: task_id.into(),
            evidence_type: evidence_type.into(),
            data,
            source_url: None,
            provider: None,
            size_bytes,
            created_at: Utc::now(),
        }
    }

    pub fn with_source_url(mut self, url: impl Into<String>) -> Self {
        self.source_url = Some(url.into());
        self
    }

    pub fn with_provider(mut self, provider: ProviderId) -> Self {
        self.provider = Some(provider);
        self
    }
}

/// Deduplicated external reference, shared across tasks and identified by
/// `(url, content_hash)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub id: SourceId,
    pub url: String,
    pub title: String,
    pub description: String,
    pub provider: ProviderId,
    pub accessed_at: DateTime<Utc>,
    pub reliability_score: f64,
    pub content_hash: String,
}

impl Source {
    pub fn new(
        url: impl Into<String>,
        title: impl Into<String>,
        description: impl Into<String>,
        provider: ProviderId,
    ) -> Self {
        let title = title.into();
        let description = description.into();
        let content_hash = content_hash(&title, &description);
        Self {
            id: super::new_id(),
            url: url.into(),
            title,
            description,
            provider,
            accessed_at: Utc::now(),
            reliability_score: 0.5,
            content_hash,
        }
    }
}

/// Content address for source deduplication.
pub fn content_hash(title: &str, body: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(title.as_bytes());
    hasher.update(b"\x00");
    hasher.update(body.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Distilled per-source facts (DOK level 1/2). Created once per
/// `(source, task)`; superseded rather than mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSummary {
    pub id: String,
    pub source_id: SourceId,
    pub task_id: TaskId,
    pub subtopic: String,
    pub subtopic_index: usize,
    pub summary: String,
    pub dok1_facts: Vec<String>,
    pub dok_level: u8,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_hash_distinguishes_body() {
        let a = content_hash("title", "body one");
        let b = content_hash("title", "body two");
        assert_ne!(a, b);
        assert_eq!(a, content_hash("title", "body one"));
    }

    #[test]
    fn test_evidence_size_tracks_payload() {
        let evidence = Evidence::new(
            "op-1",
            "task-1",
            "search_result",
            serde_json::json!({"snippet": "hello"}),
        );
        assert!(evidence.size_bytes > 0);
        assert_eq!(evidence.evidence_type, "search_result");
    }
}
