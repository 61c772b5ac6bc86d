//! Aggregated entities and their per-attribute lineage.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::TaskId;

/// A candidate extracted from search results before resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityCandidate {
    pub name: String,
    /// Attribute values as extracted. BTreeMap keeps merge order stable.
    pub attributes: BTreeMap<String, String>,
    pub unique_identifier: Option<String>,
    pub confidence: f64,
    pub source_url: Option<String>,
    pub task_id: TaskId,
    pub observed_at: DateTime<Utc>,
}

/// One observation that contributed a value to a consolidated attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineageEntry {
    pub task_id: TaskId,
    pub value: String,
    pub confidence: f64,
    pub timestamp: DateTime<Utc>,
}

/// Per-attribute history on a consolidated entity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttributeLineage {
    pub sources: Vec<LineageEntry>,
}

/// A resolved, consolidated entity produced by a data-aggregation task or a
/// cross-task project consolidation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedEntity {
    pub id: String,
    /// Project id when the owning task belongs to a project, else the task id.
    pub scope_id: String,
    pub entity_type: String,
    pub name: String,
    pub unique_identifier: Option<String>,
    pub attributes: BTreeMap<String, String>,
    pub lineage: BTreeMap<String, AttributeLineage>,
    pub source_tasks: Vec<TaskId>,
    /// Arithmetic mean of per-attribute confidence maxima.
    pub confidence_score: f64,
    pub consolidated_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AggregatedEntity {
    /// The identity used for scope-level uniqueness: the domain key when the
    /// extractor produced one, else the normalized display name.
    pub fn identity_key(&self) -> String {
        self.unique_identifier
            .clone()
            .unwrap_or_else(|| crate::resolution::normalize_name(&self.name))
    }
}
