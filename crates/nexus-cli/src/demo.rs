//! Scripted providers for `nexus run --demo`: a full offline pass through
//! either pipeline. The reasoning script cites ids parsed back out of the
//! prompts so every citation invariant holds on real data.

use std::sync::Arc;

use nexus::gateway::fixture::{ScriptedLlm, ScriptedSearchProvider};
use nexus::gateway::ProviderGateway;
use nexus::model::ProviderId;
use nexus::orchestrator::prompts;
use nexus::NexusConfig;

fn extract_ids(prompt: &str, line_prefix: &str) -> Vec<String> {
    prompt
        .lines()
        .filter_map(|line| line.trim().strip_prefix(line_prefix))
        .filter_map(|rest| rest.split_whitespace().next())
        .map(String::from)
        .collect()
}

fn reasoning_llm() -> ScriptedLlm {
    ScriptedLlm::new("demo-reasoning")
        .with_handler(prompts::TAG_DECOMPOSITION, |prompt| {
            let query = prompt
                .lines()
                .find_map(|l| l.strip_prefix("Query: "))
                .unwrap_or("the research query")
                .to_string();
            let subtopics: Vec<serde_json::Value> = ["landscape", "evidence", "risks"]
                .iter()
                .map(|focus| {
                    serde_json::json!({
                        "query": format!("{query} ({focus})"),
                        "focus_area": focus,
                    })
                })
                .collect();
            serde_json::json!({ "subtopics": subtopics }).to_string()
        })
        .with_rule(
            prompts::TAG_RESEARCH_PLAN,
            serde_json::json!({
                "objectives": ["survey the current landscape"],
                "deliverables": ["analytical report"],
                "key_questions": ["what does the evidence support?"],
                "strategies": [{
                    "name": "web search",
                    "methods": ["provider fan-out"],
                    "sources": ["industry publications"],
                    "keywords": ["survey", "evidence"],
                }],
            })
            .to_string(),
        )
        .with_handler(prompts::TAG_KNOWLEDGE_TREE, |prompt| {
            let source_ids = extract_ids(prompt, "- source_id=");
            let leaves: Vec<serde_json::Value> = source_ids
                .iter()
                .take(4)
                .enumerate()
                .map(|(i, id)| {
                    serde_json::json!({
                        "ref_id": format!("leaf-{i}"),
                        "parent_ref": "root",
                        "category": "Evidence",
                        "summary": format!("Evidence cluster {i}."),
                        "sources": [{"source_id": id, "relevance": 0.85}],
                    })
                })
                .collect();
            let mut nodes = vec![serde_json::json!({
                "ref_id": "root",
                "category": "Evidence",
                "summary": "What the gathered sources establish.",
            })];
            nodes.extend(leaves);
            serde_json::json!({ "nodes": nodes }).to_string()
        })
        .with_handler(prompts::TAG_INSIGHTS, |prompt| {
            let ids: Vec<String> = prompt
                .split_once("from [")
                .and_then(|(_, rest)| rest.split_once(']'))
                .map(|(list, _)| list.split(", ").map(|s| s.trim().to_string()).collect())
                .unwrap_or_default();
            serde_json::json!({
                "insights": [{
                    "category": "Evidence",
                    "insight_text": "The sources converge on a consistent picture.",
                    "confidence": 0.8,
                    "source_ids": ids,
                }],
            })
            .to_string()
        })
        .with_handler(prompts::TAG_SPIKY_POV, |prompt| {
            let insight_ids = extract_ids(prompt, "- id=");
            serde_json::json!({
                "truths": [{
                    "statement": "The conventional framing understates the shift.",
                    "reasoning": "The synthesized insights support it.",
                    "insight_ids": insight_ids,
                }],
                "myths": [],
            })
            .to_string()
        })
        .with_rule(
            prompts::TAG_REPORT,
            serde_json::json!({
                "sections": [
                    {"name": "key_findings", "markdown": "The demo corpus yields a consistent signal."},
                    {"name": "evidence_analysis", "markdown": "Sources were deduplicated and summarized."},
                    {"name": "causal_relationships", "markdown": "Observed effects follow adoption."},
                    {"name": "alternative_interpretations", "markdown": "The demo corpus is synthetic."},
                ],
            })
            .to_string(),
        )
        .with_handler(prompts::TAG_ENUMERATION, |prompt| {
            let space = prompt
                .split_once("search space '")
                .and_then(|(_, rest)| rest.split_once('\''))
                .map(|(space, _)| space.to_string())
                .unwrap_or_else(|| "the search space".to_string());
            serde_json::json!({
                "subspaces": [format!("northern {space}"), format!("southern {space}")],
            })
            .to_string()
        })
}

fn task_llm() -> ScriptedLlm {
    ScriptedLlm::new("demo-task")
        .with_rule(
            prompts::TAG_SUMMARIZE,
            serde_json::json!({
                "summary": "A distilled view of what this source claims.",
                "facts": ["the source makes a concrete claim", "the claim is dated"],
            })
            .to_string(),
        )
        .with_handler(prompts::TAG_EXTRACTION, |prompt| {
            let subspace = prompt
                .split_once("found in '")
                .and_then(|(_, rest)| rest.split_once('\''))
                .map(|(s, _)| s.to_string())
                .unwrap_or_default();
            serde_json::json!({
                "entities": [{
                    "name": format!("Example entity ({subspace})"),
                    "attributes": {"region": subspace},
                    "confidence": 0.7,
                }],
            })
            .to_string()
        })
}

pub fn demo_gateway(config: &NexusConfig) -> ProviderGateway {
    ProviderGateway::builder()
        .with_search_provider(Arc::new(ScriptedSearchProvider::new(ProviderId::Linkup)))
        .with_search_provider(Arc::new(ScriptedSearchProvider::new(ProviderId::Exa)))
        .with_reasoning_llm(Arc::new(reasoning_llm()))
        .with_task_llm(Arc::new(task_llm()))
        .build(config)
}
