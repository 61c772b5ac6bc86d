//! DOK synthesis: the parsing and validation layer between raw LLM text
//! and persisted knowledge artifacts.
//!
//! LLM steps fix only their output contracts (the response structs here);
//! prompt text lives with the orchestrator. Contract violations that the
//! model can cause are `ProviderPermanent` (malformed output); violations
//! of our own data model are `InvariantViolation`.

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::CoreError;
use crate::model::{new_id, Insight, KnowledgeNode, PovKind, SourceSummary, SpikyPov, Subtopic};

/// Contract for `topic_decomposition`.
#[derive(Debug, Deserialize)]
pub struct DecompositionResponse {
    pub subtopics: Vec<Subtopic>,
}

/// Contract for `summarize_source`.
#[derive(Debug, Deserialize)]
pub struct SummaryResponse {
    pub summary: String,
    #[serde(default)]
    pub facts: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct SourceLinkSpec {
    pub source_id: String,
    #[serde(default = "default_relevance")]
    pub relevance: f64,
}

fn default_relevance() -> f64 {
    1.0
}

/// One proposed node in the `build_knowledge_tree` contract. `ref_id` and
/// `parent_ref` are model-local labels; real ids are assigned here.
#[derive(Debug, Deserialize)]
pub struct TreeNodeSpec {
    pub ref_id: String,
    #[serde(default)]
    pub parent_ref: Option<String>,
    pub category: String,
    #[serde(default)]
    pub subcategory: Option<String>,
    pub summary: String,
    #[serde(default)]
    pub sources: Vec<SourceLinkSpec>,
}

#[derive(Debug, Deserialize)]
pub struct TreeResponse {
    pub nodes: Vec<TreeNodeSpec>,
}

#[derive(Debug, Deserialize)]
pub struct InsightSpec {
    pub category: String,
    pub insight_text: String,
    pub confidence: f64,
    pub source_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct InsightsResponse {
    pub insights: Vec<InsightSpec>,
}

#[derive(Debug, Deserialize)]
pub struct PovSpec {
    pub statement: String,
    pub reasoning: String,
    pub insight_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct PovResponse {
    #[serde(default)]
    pub truths: Vec<PovSpec>,
    #[serde(default)]
    pub myths: Vec<PovSpec>,
}

/// Contract for `search_space_enumeration`.
#[derive(Debug, Deserialize)]
pub struct EnumerationResponse {
    pub subspaces: Vec<String>,
}

/// Parse an LLM JSON response, tolerating markdown fences and prose around
/// the payload. Anything unparseable is a permanent provider error.
pub fn parse_llm_json<T: DeserializeOwned>(text: &str) -> Result<T, CoreError> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str::<T>(trimmed) {
        return Ok(value);
    }

    let start = trimmed.find('{');
    let end = trimmed.rfind('}');
    if let (Some(start), Some(end)) = (start, end) {
        if start < end {
            if let Ok(value) = serde_json::from_str::<T>(&trimmed[start..=end]) {
                return Ok(value);
            }
        }
    }

    Err(CoreError::ProviderPermanent(format!(
        "malformed LLM response: {}",
        clip(trimmed, 160)
    )))
}

pub fn clamp_confidence(value: f64) -> f64 {
    if value.is_nan() {
        return 0.0;
    }
    value.clamp(0.0, 1.0)
}

/// Build a summary from the model's response: facts trimmed to the cap,
/// empty facts dropped, dok_level 1 when atomic facts survive else 2.
pub fn build_summary(
    task_id: &str,
    source_id: &str,
    subtopic: &str,
    subtopic_index: usize,
    response: SummaryResponse,
    max_fact_len: usize,
) -> Result<SourceSummary, CoreError> {
    if response.summary.trim().is_empty() {
        return Err(CoreError::ProviderPermanent(
            "summary text must not be empty".to_string(),
        ));
    }

    let facts: Vec<String> = response
        .facts
        .into_iter()
        .map(|fact| fact.trim().to_string())
        .filter(|fact| !fact.is_empty())
        .map(|mut fact| {
            if fact.len() > max_fact_len {
                let mut cut = max_fact_len;
                while cut > 0 && !fact.is_char_boundary(cut) {
                    cut -= 1;
                }
                fact.truncate(cut);
            }
            fact
        })
        .collect();

    let dok_level = if facts.is_empty() { 2 } else { 1 };
    Ok(SourceSummary {
        id: new_id(),
        source_id: source_id.to_string(),
        task_id: task_id.to_string(),
        subtopic: subtopic.to_string(),
        subtopic_index,
        summary: response.summary.trim().to_string(),
        dok1_facts: facts,
        dok_level,
        created_at: Utc::now(),
    })
}

/// Turn the model's proposed forest into persisted nodes. Enforces: known
/// parents, no cycles, depth within bounds, non-empty summaries, and at
/// least one known source on every leaf.
pub fn build_knowledge_nodes(
    task_id: &str,
    response: TreeResponse,
    known_sources: &HashSet<String>,
    max_depth: usize,
) -> Result<Vec<KnowledgeNode>, CoreError> {
    if response.nodes.is_empty() {
        return Err(CoreError::ProviderPermanent(
            "knowledge tree has no nodes".to_string(),
        ));
    }

    let by_ref: HashMap<&str, &TreeNodeSpec> = response
        .nodes
        .iter()
        .map(|node| (node.ref_id.as_str(), node))
        .collect();
    if by_ref.len() != response.nodes.len() {
        return Err(CoreError::ProviderPermanent(
            "duplicate ref_id in knowledge tree".to_string(),
        ));
    }

    let mut has_children: HashSet<&str> = HashSet::new();
    for node in &response.nodes {
        if node.summary.trim().is_empty() {
            return Err(CoreError::InvariantViolation(format!(
                "knowledge node '{}' has an empty summary",
                node.ref_id
            )));
        }
        if let Some(parent) = &node.parent_ref {
            if !by_ref.contains_key(parent.as_str()) {
                return Err(CoreError::ProviderPermanent(format!(
                    "knowledge node '{}' references unknown parent '{parent}'",
                    node.ref_id
                )));
            }
            has_children.insert(parent.as_str());
        }
    }

    // Depth and cycle check: walk each node's parent chain.
    for node in &response.nodes {
        let mut seen = HashSet::new();
        let mut depth = 1usize;
        let mut current = node;
        seen.insert(current.ref_id.as_str());
        while let Some(parent) = &current.parent_ref {
            if !seen.insert(parent.as_str()) {
                return Err(CoreError::InvariantViolation(format!(
                    "cycle through knowledge node '{}'",
                    parent
                )));
            }
            depth += 1;
            if depth > max_depth {
                return Err(CoreError::InvariantViolation(format!(
                    "knowledge tree exceeds max depth {max_depth}"
                )));
            }
            current = by_ref[parent.as_str()];
        }
    }

    let ids: HashMap<&str, String> = response
        .nodes
        .iter()
        .map(|node| (node.ref_id.as_str(), new_id()))
        .collect();

    let mut nodes = Vec::with_capacity(response.nodes.len());
    for (position, spec) in response.nodes.iter().enumerate() {
        let is_leaf = !has_children.contains(spec.ref_id.as_str());
        let source_links: Vec<(String, f64)> = spec
            .sources
            .iter()
            .filter(|link| known_sources.contains(&link.source_id))
            .map(|link| (link.source_id.clone(), clamp_confidence(link.relevance)))
            .collect();

        if is_leaf && source_links.is_empty() {
            return Err(CoreError::InvariantViolation(format!(
                "leaf knowledge node '{}' cites no known source",
                spec.ref_id
            )));
        }

        nodes.push(KnowledgeNode {
            id: ids[spec.ref_id.as_str()].clone(),
            task_id: task_id.to_string(),
            parent_id: spec
                .parent_ref
                .as_ref()
                .map(|parent| ids[parent.as_str()].clone()),
            category: spec.category.clone(),
            subcategory: spec.subcategory.clone(),
            summary: spec.summary.trim().to_string(),
            dok_level: if is_leaf { 1 } else { 2 },
            position: position as i64,
            source_links,
        });
    }

    Ok(nodes)
}

/// Insights must cite at least one known source; confidence is clamped.
pub fn build_insights(
    task_id: &str,
    response: InsightsResponse,
    known_sources: &HashSet<String>,
) -> Result<Vec<Insight>, CoreError> {
    let mut insights = Vec::with_capacity(response.insights.len());
    for spec in response.insights {
        let source_ids: Vec<String> = spec
            .source_ids
            .into_iter()
            .filter(|id| known_sources.contains(id))
            .collect();
        if source_ids.is_empty() {
            return Err(CoreError::InvariantViolation(format!(
                "insight '{}' cites no known source",
                truncate_label(&spec.insight_text)
            )));
        }
        insights.push(Insight {
            id: new_id(),
            task_id: task_id.to_string(),
            category: spec.category,
            insight_text: spec.insight_text,
            confidence: clamp_confidence(spec.confidence),
            source_ids,
            created_at: Utc::now(),
        });
    }
    Ok(insights)
}

/// POVs must cite at least one known insight; the response is partitioned
/// into truths and myths by construction.
pub fn build_spiky_povs(
    task_id: &str,
    response: PovResponse,
    known_insights: &HashSet<String>,
) -> Result<Vec<SpikyPov>, CoreError> {
    let mut povs = Vec::new();
    for (kind, specs) in [
        (PovKind::Truth, response.truths),
        (PovKind::Myth, response.myths),
    ] {
        for spec in specs {
            let insight_ids: Vec<String> = spec
                .insight_ids
                .into_iter()
                .filter(|id| known_insights.contains(id))
                .collect();
            if insight_ids.is_empty() {
                return Err(CoreError::InvariantViolation(format!(
                    "{kind} POV '{}' cites no known insight",
                    truncate_label(&spec.statement)
                )));
            }
            povs.push(SpikyPov {
                id: new_id(),
                task_id: task_id.to_string(),
                kind,
                statement: spec.statement,
                reasoning: spec.reasoning,
                insight_ids,
                created_at: Utc::now(),
            });
        }
    }
    Ok(povs)
}

fn truncate_label(text: &str) -> &str {
    clip(text, 60)
}

fn clip(text: &str, max: usize) -> &str {
    let mut end = text.len().min(max);
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sources(ids: &[&str]) -> HashSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_tolerates_fences_and_prose() {
        let fenced = "Here you go:\n```json\n{\"subtopics\":[{\"query\":\"q\",\"focus_area\":\"f\"}]}\n```";
        let parsed: DecompositionResponse = parse_llm_json(fenced).unwrap();
        assert_eq!(parsed.subtopics.len(), 1);

        let bare = r#"{"subtopics":[]}"#;
        let parsed: DecompositionResponse = parse_llm_json(bare).unwrap();
        assert!(parsed.subtopics.is_empty());

        let err = parse_llm_json::<DecompositionResponse>("not json at all").unwrap_err();
        assert!(matches!(err, CoreError::ProviderPermanent(_)));
    }

    #[test]
    fn test_summary_trims_and_caps_facts() {
        let response = SummaryResponse {
            summary: "  A solid summary.  ".into(),
            facts: vec!["".into(), "  short fact  ".into(), "x".repeat(1000)],
        };
        let summary = build_summary("t", "s", "topic", 0, response, 100).unwrap();
        assert_eq!(summary.summary, "A solid summary.");
        assert_eq!(summary.dok1_facts.len(), 2);
        assert_eq!(summary.dok1_facts[0], "short fact");
        assert_eq!(summary.dok1_facts[1].len(), 100);
        assert_eq!(summary.dok_level, 1);
    }

    #[test]
    fn test_tree_rejects_cycles_and_unknown_parents() {
        let cyclic: TreeResponse = serde_json::from_value(serde_json::json!({
            "nodes": [
                {"ref_id": "a", "parent_ref": "b", "category": "C", "summary": "s",
                 "sources": [{"source_id": "s1"}]},
                {"ref_id": "b", "parent_ref": "a", "category": "C", "summary": "s",
                 "sources": [{"source_id": "s1"}]}
            ]
        }))
        .unwrap();
        let err = build_knowledge_nodes("t", cyclic, &sources(&["s1"]), 4).unwrap_err();
        assert!(matches!(err, CoreError::InvariantViolation(_)));

        let orphan: TreeResponse = serde_json::from_value(serde_json::json!({
            "nodes": [
                {"ref_id": "a", "parent_ref": "missing", "category": "C", "summary": "s",
                 "sources": [{"source_id": "s1"}]}
            ]
        }))
        .unwrap();
        let err = build_knowledge_nodes("t", orphan, &sources(&["s1"]), 4).unwrap_err();
        assert!(matches!(err, CoreError::ProviderPermanent(_)));
    }

    #[test]
    fn test_tree_builds_forest_with_levels() {
        let response: TreeResponse = serde_json::from_value(serde_json::json!({
            "nodes": [
                {"ref_id": "root", "category": "Tooling", "summary": "Root summary"},
                {"ref_id": "leaf", "parent_ref": "root", "category": "Tooling",
                 "subcategory": "CI", "summary": "Leaf summary",
                 "sources": [{"source_id": "s1", "relevance": 2.5}]}
            ]
        }))
        .unwrap();

        let nodes = build_knowledge_nodes("t", response, &sources(&["s1"]), 4).unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].dok_level, 2);
        assert!(nodes[0].parent_id.is_none());
        assert_eq!(nodes[1].dok_level, 1);
        assert_eq!(nodes[1].parent_id.as_ref(), Some(&nodes[0].id));
        // Relevance clamped into [0,1].
        assert_eq!(nodes[1].source_links[0].1, 1.0);
    }

    #[test]
    fn test_leaf_without_sources_is_invariant_violation() {
        let response: TreeResponse = serde_json::from_value(serde_json::json!({
            "nodes": [
                {"ref_id": "lonely", "category": "C", "summary": "s"}
            ]
        }))
        .unwrap();
        let err = build_knowledge_nodes("t", response, &sources(&["s1"]), 4).unwrap_err();
        assert!(matches!(err, CoreError::InvariantViolation(_)));
    }

    #[test]
    fn test_insights_require_known_sources_and_clamp() {
        let response = InsightsResponse {
            insights: vec![InsightSpec {
                category: "C".into(),
                insight_text: "Something synthesized".into(),
                confidence: 3.0,
                source_ids: vec!["s1".into(), "ghost".into()],
            }],
        };
        let insights = build_insights("t", response, &sources(&["s1"])).unwrap();
        assert_eq!(insights[0].confidence, 1.0);
        assert_eq!(insights[0].source_ids, vec!["s1".to_string()]);

        let response = InsightsResponse {
            insights: vec![InsightSpec {
                category: "C".into(),
                insight_text: "Unsupported".into(),
                confidence: 0.5,
                source_ids: vec!["ghost".into()],
            }],
        };
        let err = build_insights("t", response, &sources(&["s1"])).unwrap_err();
        assert!(matches!(err, CoreError::InvariantViolation(_)));
    }

    #[test]
    fn test_povs_partition_truth_and_myth() {
        let known: HashSet<String> = sources(&["i1"]);
        let response = PovResponse {
            truths: vec![PovSpec {
                statement: "Agents do test better".into(),
                reasoning: "Evidence says so".into(),
                insight_ids: vec!["i1".into()],
            }],
            myths: vec![PovSpec {
                statement: "Agents replace all QA".into(),
                reasoning: "Contradicted".into(),
                insight_ids: vec!["i1".into()],
            }],
        };
        let povs = build_spiky_povs("t", response, &known).unwrap();
        assert_eq!(povs.len(), 2);
        assert_eq!(povs[0].kind, PovKind::Truth);
        assert_eq!(povs[1].kind, PovKind::Myth);
    }
}
