//! Core data model: tasks and the entities a task owns.
//!
//! Everything here is plain data. Cross-links between entities are stable
//! string ids, never in-memory pointers; serialization to JSON happens only
//! at the store and bus boundaries.

mod dok;
mod entity;
mod evidence;
mod operation;

pub use dok::{Insight, KnowledgeNode, PovKind, SpikyPov};
pub use entity::{AggregatedEntity, AttributeLineage, EntityCandidate, LineageEntry};
pub use evidence::{Evidence, Source, SourceSummary};
pub use operation::{
    OpOutput, OpSpec, Operation, OperationStatus, ResearchPlan, SearchStrategy, Subtopic,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type TaskId = String;
pub type OperationId = String;
pub type SourceId = String;
pub type ProjectId = String;

pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// The two research pipelines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResearchType {
    AnalyticalReport,
    DataAggregation,
}

impl std::fmt::Display for ResearchType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResearchType::AnalyticalReport => write!(f, "analytical_report"),
            ResearchType::DataAggregation => write!(f, "data_aggregation"),
        }
    }
}

impl std::str::FromStr for ResearchType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "analytical_report" => Ok(ResearchType::AnalyticalReport),
            "data_aggregation" => Ok(ResearchType::DataAggregation),
            other => Err(format!("unknown research type: {other}")),
        }
    }
}

/// Task lifecycle. Transitions are monotonic over the declared order;
/// `Failed` is reachable from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Planning,
    Searching,
    Summarizing,
    BuildingKnowledge,
    GeneratingInsights,
    AnalyzingPovs,
    Synthesizing,
    Completed,
    Failed,
}

impl TaskStatus {
    fn rank(self) -> u8 {
        match self {
            TaskStatus::Pending => 0,
            TaskStatus::Running => 1,
            TaskStatus::Planning => 2,
            TaskStatus::Searching => 3,
            TaskStatus::Summarizing => 4,
            TaskStatus::BuildingKnowledge => 5,
            TaskStatus::GeneratingInsights => 6,
            TaskStatus::AnalyzingPovs => 7,
            TaskStatus::Synthesizing => 8,
            TaskStatus::Completed => 9,
            TaskStatus::Failed => 10,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        if next == TaskStatus::Failed {
            return true;
        }
        next.rank() > self.rank()
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Planning => "planning",
            TaskStatus::Searching => "searching",
            TaskStatus::Summarizing => "summarizing",
            TaskStatus::BuildingKnowledge => "building_knowledge",
            TaskStatus::GeneratingInsights => "generating_insights",
            TaskStatus::AnalyzingPovs => "analyzing_povs",
            TaskStatus::Synthesizing => "synthesizing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "planning" => Ok(TaskStatus::Planning),
            "searching" => Ok(TaskStatus::Searching),
            "summarizing" => Ok(TaskStatus::Summarizing),
            "building_knowledge" => Ok(TaskStatus::BuildingKnowledge),
            "generating_insights" => Ok(TaskStatus::GeneratingInsights),
            "analyzing_povs" => Ok(TaskStatus::AnalyzingPovs),
            "synthesizing" => Ok(TaskStatus::Synthesizing),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// External search providers reachable through the gateway. The registry in
/// the gateway is the only place new variants are wired up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderId {
    Linkup,
    Exa,
    Perplexity,
    Firecrawl,
}

impl ProviderId {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderId::Linkup => "linkup",
            ProviderId::Exa => "exa",
            ProviderId::Perplexity => "perplexity",
            ProviderId::Firecrawl => "firecrawl",
        }
    }

    pub fn all() -> [ProviderId; 4] {
        [
            ProviderId::Linkup,
            ProviderId::Exa,
            ProviderId::Perplexity,
            ProviderId::Firecrawl,
        ]
    }
}

impl std::fmt::Display for ProviderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ProviderId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "linkup" => Ok(ProviderId::Linkup),
            "exa" => Ok(ProviderId::Exa),
            "perplexity" => Ok(ProviderId::Perplexity),
            "firecrawl" => Ok(ProviderId::Firecrawl),
            other => Err(format!("unknown provider: {other}")),
        }
    }
}

/// Configuration block for data-aggregation tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationConfig {
    pub entities: Vec<String>,
    pub attributes: Vec<String>,
    pub search_space: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain_hint: Option<String>,
}

/// One research request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    pub research_query: String,
    pub research_type: ResearchType,
    pub status: TaskStatus,
    pub project_id: Option<ProjectId>,
    pub aggregation_config: Option<AggregationConfig>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(
        title: impl Into<String>,
        research_query: impl Into<String>,
        research_type: ResearchType,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            title: title.into(),
            research_query: research_query.into(),
            research_type,
            status: TaskStatus::Pending,
            project_id: None,
            aggregation_config: None,
            error_message: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn with_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    pub fn with_aggregation_config(mut self, config: AggregationConfig) -> Self {
        self.aggregation_config = Some(config);
        self
    }

    /// Request-level validation applied before the task is persisted.
    pub fn validate(&self) -> Result<(), String> {
        if self.research_query.trim().is_empty() {
            return Err("research_query must not be empty".to_string());
        }
        match (self.research_type, &self.aggregation_config) {
            (ResearchType::DataAggregation, None) => {
                Err("data_aggregation tasks require an aggregation_config".to_string())
            }
            (ResearchType::AnalyticalReport, Some(_)) => {
                Err("analytical_report tasks must not carry an aggregation_config".to_string())
            }
            _ => Ok(()),
        }
    }
}
