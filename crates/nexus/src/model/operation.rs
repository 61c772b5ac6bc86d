//! Operations: the unit of work scheduled by the coordinator.
//!
//! Operation inputs and outputs are closed tagged variants. The coordinator
//! never inspects payloads; the orchestrator's executor is the single match
//! over `OpSpec`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use super::{OperationId, ProviderId, SourceId, TaskId};
use crate::error::ErrorKind;

/// Operation lifecycle. Terminal states are immutable; `Retrying` loops back
/// through `InFlight` until the retry budget is spent.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, Default,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OperationStatus {
    #[default]
    Queued,
    WaitingDeps,
    Dispatched,
    InFlight,
    Retrying,
    Completed,
    Failed,
    Cancelled,
}

impl OperationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OperationStatus::Completed | OperationStatus::Failed | OperationStatus::Cancelled
        )
    }
}

/// A subtopic produced by topic decomposition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subtopic {
    pub query: String,
    pub focus_area: String,
}

/// Per-strategy search plan inside a research plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchStrategy {
    pub name: String,
    pub methods: Vec<String>,
    pub sources: Vec<String>,
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchPlan {
    pub objectives: Vec<String>,
    pub deliverables: Vec<String>,
    pub key_questions: Vec<String>,
    pub strategies: Vec<SearchStrategy>,
}

/// Typed operation input. Serialized to the ledger's `input_data` column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation_type", rename_all = "snake_case")]
pub enum OpSpec {
    TopicDecomposition {
        query: String,
        max_subtopics: usize,
    },
    ResearchPlan {
        query: String,
        subtopics: Vec<Subtopic>,
    },
    McpSearch {
        provider: ProviderId,
        query: String,
        subtopic_index: usize,
    },
    SummarizeSource {
        source_id: SourceId,
        url: String,
        title: String,
        subtopic: String,
        subtopic_index: usize,
    },
    BuildKnowledgeTree,
    GenerateInsights,
    SpikyPov,
    SynthesizeReport,
    SearchSpaceEnumeration {
        search_space: String,
        entities: Vec<String>,
    },
    ExtractEntities {
        subspace: String,
        subspace_index: usize,
        attributes: Vec<String>,
        domain_hint: Option<String>,
        source_ids: Vec<SourceId>,
    },
    ResolveEntities {
        entity_type: String,
    },
    ExportCsv,
}

impl OpSpec {
    pub fn operation_type(&self) -> &'static str {
        match self {
            OpSpec::TopicDecomposition { .. } => "topic_decomposition",
            OpSpec::ResearchPlan { .. } => "research_plan",
            OpSpec::McpSearch { .. } => "mcp_search",
            OpSpec::SummarizeSource { .. } => "summarize_source",
            OpSpec::BuildKnowledgeTree => "build_knowledge_tree",
            OpSpec::GenerateInsights => "generate_insights",
            OpSpec::SpikyPov => "spiky_pov",
            OpSpec::SynthesizeReport => "synthesize_report",
            OpSpec::SearchSpaceEnumeration { .. } => "search_space_enumeration",
            OpSpec::ExtractEntities { .. } => "extract_entities",
            OpSpec::ResolveEntities { .. } => "resolve_entities",
            OpSpec::ExportCsv => "export_csv",
        }
    }

    /// Which worker role executes this op. Recorded on the ledger row.
    pub fn agent_type(&self) -> &'static str {
        match self {
            OpSpec::TopicDecomposition { .. }
            | OpSpec::ResearchPlan { .. }
            | OpSpec::SearchSpaceEnumeration { .. } => "planner",
            OpSpec::McpSearch { .. } => "searcher",
            OpSpec::SummarizeSource { .. } => "summarizer",
            OpSpec::BuildKnowledgeTree
            | OpSpec::GenerateInsights
            | OpSpec::SpikyPov
            | OpSpec::SynthesizeReport => "synthesizer",
            OpSpec::ExtractEntities { .. } | OpSpec::ResolveEntities { .. } => "resolver",
            OpSpec::ExportCsv => "exporter",
        }
    }

    /// Coordinator queue this spec is submitted to.
    pub fn queue(&self) -> &'static str {
        match self {
            OpSpec::McpSearch { .. } => "search",
            OpSpec::SummarizeSource { .. } | OpSpec::ExtractEntities { .. } => "extract",
            OpSpec::ResolveEntities { .. } | OpSpec::ExportCsv => "local",
            _ => "llm",
        }
    }

    /// Provider budget tag, when the op spends a provider's rate budget.
    pub fn provider(&self) -> Option<ProviderId> {
        match self {
            OpSpec::McpSearch { provider, .. } => Some(*provider),
            _ => None,
        }
    }
}

/// Typed operation output. Serialized to the ledger's `output_data` column,
/// populated iff the operation completed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation_type", rename_all = "snake_case")]
pub enum OpOutput {
    TopicDecomposition {
        subtopics: Vec<Subtopic>,
    },
    ResearchPlan {
        plan: ResearchPlan,
    },
    McpSearch {
        provider: ProviderId,
        source_ids: Vec<SourceId>,
        result_count: usize,
    },
    SummarizeSource {
        summary_id: String,
        fact_count: usize,
    },
    BuildKnowledgeTree {
        node_count: usize,
        root_count: usize,
    },
    GenerateInsights {
        insight_count: usize,
    },
    SpikyPov {
        truth_count: usize,
        myth_count: usize,
    },
    SynthesizeReport {
        report_id: String,
        section_count: usize,
    },
    SearchSpaceEnumeration {
        subspaces: Vec<String>,
    },
    ExtractEntities {
        candidates: Vec<super::EntityCandidate>,
    },
    ResolveEntities {
        entity_count: usize,
        merged_count: usize,
    },
    ExportCsv {
        artifact_id: String,
        path: String,
        row_count: usize,
    },
}

/// One ledger row: a sub-unit of work executed on a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    pub id: OperationId,
    pub task_id: TaskId,
    pub parent_id: Option<OperationId>,
    pub spec: OpSpec,
    pub status: OperationStatus,
    pub agent_type: String,
    pub queue: String,
    pub priority: i32,
    pub retry_count: u32,
    pub output: Option<OpOutput>,
    pub error_message: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

impl Operation {
    pub fn new(task_id: impl Into<TaskId>, spec: OpSpec) -> Self {
        Self {
            id: super::new_id(),
            task_id: task_id.into(),
            parent_id: None,
            agent_type: spec.agent_type().to_string(),
            queue: spec.queue().to_string(),
            spec,
            status: OperationStatus::Queued,
            priority: 0,
            retry_count: 0,
            output: None,
            error_message: None,
            error_kind: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            duration_ms: None,
        }
    }

    pub fn with_parent(mut self, parent_id: impl Into<OperationId>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_serialization_is_tagged() {
        let spec = OpSpec::McpSearch {
            provider: ProviderId::Exa,
            query: "ai agents".into(),
            subtopic_index: 0,
        };
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["operation_type"], "mcp_search");
        assert_eq!(json["provider"], "exa");

        let back: OpSpec = serde_json::from_value(json).unwrap();
        assert_eq!(back, spec);
    }

    #[test]
    fn test_unit_variant_serialization() {
        let spec = OpSpec::BuildKnowledgeTree;
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["operation_type"], "build_knowledge_tree");
        let back: OpSpec = serde_json::from_value(json).unwrap();
        assert_eq!(back, spec);
    }

    #[test]
    fn test_queue_routing() {
        assert_eq!(
            OpSpec::McpSearch {
                provider: ProviderId::Linkup,
                query: "q".into(),
                subtopic_index: 0
            }
            .queue(),
            "search"
        );
        assert_eq!(OpSpec::GenerateInsights.queue(), "llm");
        assert_eq!(OpSpec::ExportCsv.queue(), "local");
    }

    #[test]
    fn test_operation_status_terminal() {
        assert!(OperationStatus::Completed.is_terminal());
        assert!(OperationStatus::Failed.is_terminal());
        assert!(OperationStatus::Cancelled.is_terminal());
        assert!(!OperationStatus::Retrying.is_terminal());
        assert!(!OperationStatus::InFlight.is_terminal());
    }

    #[test]
    fn test_status_string_round_trip() {
        let status: OperationStatus = "waiting_deps".parse().unwrap();
        assert_eq!(status, OperationStatus::WaitingDeps);
        assert_eq!(OperationStatus::InFlight.to_string(), "in_flight");
    }
}
