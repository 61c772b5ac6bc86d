//! DOK synthesis artifacts: the knowledge forest (levels 1-2), insights
//! (level 3), and spiky POVs (level 4).
//!
//! Cross-links are ids; the forest is an arena keyed by node id with
//! `parent_id` edges, never in-memory pointers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{SourceId, TaskId};

/// One node of the per-task knowledge forest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeNode {
    pub id: String,
    pub task_id: TaskId,
    pub parent_id: Option<String>,
    pub category: String,
    pub subcategory: Option<String>,
    pub summary: String,
    pub dok_level: u8,
    /// Insertion order within the task; the store returns nodes sorted by it.
    pub position: i64,
    /// Leaf links: `(source_id, relevance in [0,1])`.
    pub source_links: Vec<(SourceId, f64)>,
}

/// DOK-3 synthesized claim. Must cite at least one source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Insight {
    pub id: String,
    pub task_id: TaskId,
    pub category: String,
    pub insight_text: String,
    pub confidence: f64,
    pub source_ids: Vec<SourceId>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PovKind {
    Truth,
    Myth,
}

impl std::fmt::Display for PovKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PovKind::Truth => write!(f, "truth"),
            PovKind::Myth => write!(f, "myth"),
        }
    }
}

impl std::str::FromStr for PovKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "truth" => Ok(PovKind::Truth),
            "myth" => Ok(PovKind::Myth),
            other => Err(format!("unknown pov kind: {other}")),
        }
    }
}

/// DOK-4 contrarian claim, supported (`truth`) or debunked (`myth`).
/// Must cite at least one insight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpikyPov {
    pub id: String,
    pub task_id: TaskId,
    pub kind: PovKind,
    pub statement: String,
    pub reasoning: String,
    pub insight_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
}
