//! End-to-end pipeline tests over scripted providers: no network, no live
//! LLM. The scripted reasoning model echoes runtime ids parsed out of the
//! prompts, so every citation invariant is exercised for real.

use std::sync::Arc;
use std::time::Duration;

use nexus::config::NexusConfig;
use nexus::coordinator::SubmitOptions;
use nexus::error::ErrorKind;
use nexus::events::SubscriberFilter;
use nexus::gateway::fixture::{ScriptedLlm, ScriptedSearchProvider};
use nexus::gateway::{ProviderGateway, ProviderError, RetryPolicy};
use nexus::model::{
    AggregationConfig, OperationStatus, ProviderId, ResearchType, TaskStatus,
};
use nexus::orchestrator::prompts;
use nexus::{EventBus, MonitorEvent, NexusContext, Orchestrator, Store, TaskRequest};

fn test_config() -> NexusConfig {
    let mut config = NexusConfig::default();
    config.worker_count = 4;
    config.retry_base = Duration::from_millis(5);
    config
}

fn extract_ids(prompt: &str, line_prefix: &str) -> Vec<String> {
    prompt
        .lines()
        .filter_map(|line| line.trim().strip_prefix(line_prefix))
        .filter_map(|rest| rest.split_whitespace().next())
        .map(String::from)
        .collect()
}

/// Reasoning model covering the analytical pipeline. Tree, insight, and
/// POV responses cite ids parsed back out of the prompt.
fn reasoning_llm(subtopic_count: usize) -> ScriptedLlm {
    reasoning_llm_with(subtopic_count, None)
}

fn reasoning_llm_with(subtopic_count: usize, tree_override: Option<&str>) -> ScriptedLlm {
    let subtopics: Vec<serde_json::Value> = (0..subtopic_count)
        .map(|i| {
            serde_json::json!({
                "query": format!("subtopic {i} of the research query"),
                "focus_area": format!("focus-{i}"),
            })
        })
        .collect();

    let mut llm = ScriptedLlm::new("reasoning-fixture");
    if let Some(tree_response) = tree_override {
        // First matching rule wins, so an override shadows the handler.
        llm = llm.with_rule(prompts::TAG_KNOWLEDGE_TREE, tree_response);
    }
    llm.with_rule(
            prompts::TAG_DECOMPOSITION,
            serde_json::json!({ "subtopics": subtopics }).to_string(),
        )
        .with_rule(
            prompts::TAG_RESEARCH_PLAN,
            serde_json::json!({
                "objectives": ["map the landscape"],
                "deliverables": ["analytical report"],
                "key_questions": ["what changed?"],
                "strategies": [{
                    "name": "web",
                    "methods": ["search"],
                    "sources": ["industry"],
                    "keywords": ["agents", "testing"],
                }],
            })
            .to_string(),
        )
        .with_handler(prompts::TAG_KNOWLEDGE_TREE, |prompt| {
            let source_ids = extract_ids(prompt, "- source_id=");
            let leaves: Vec<serde_json::Value> = source_ids
                .iter()
                .take(3)
                .enumerate()
                .map(|(i, id)| {
                    serde_json::json!({
                        "ref_id": format!("leaf-{i}"),
                        "parent_ref": "root",
                        "category": "Findings",
                        "subcategory": format!("cluster-{i}"),
                        "summary": format!("Cluster {i} of the evidence."),
                        "sources": [{"source_id": id, "relevance": 0.9}],
                    })
                })
                .collect();
            let mut nodes = vec![serde_json::json!({
                "ref_id": "root",
                "category": "Findings",
                "summary": "Top-level findings.",
            })];
            nodes.extend(leaves);
            serde_json::json!({ "nodes": nodes }).to_string()
        })
        .with_handler(prompts::TAG_INSIGHTS, |prompt| {
            let ids: Vec<String> = prompt
                .split_once("from [")
                .and_then(|(_, rest)| rest.split_once(']'))
                .map(|(list, _)| {
                    list.split(", ")
                        .map(|id| id.trim().to_string())
                        .filter(|id| !id.is_empty())
                        .collect()
                })
                .unwrap_or_default();
            let first = ids.first().cloned().unwrap_or_default();
            serde_json::json!({
                "insights": [
                    {"category": "Findings", "insight_text": "Agents shift testing left.",
                     "confidence": 0.85, "source_ids": [first]},
                    {"category": "Findings", "insight_text": "Coverage improves with agents.",
                     "confidence": 1.4, "source_ids": ids},
                ],
            })
            .to_string()
        })
        .with_handler(prompts::TAG_SPIKY_POV, |prompt| {
            let insight_ids = extract_ids(prompt, "- id=");
            let first = insight_ids.first().cloned().unwrap_or_default();
            serde_json::json!({
                "truths": [{"statement": "Agents outperform scripted suites.",
                            "reasoning": "Supported by the insights.",
                            "insight_ids": [first]}],
                "myths": [{"statement": "Agents remove the need for QA.",
                           "reasoning": "Debunked by the insights.",
                           "insight_ids": insight_ids}],
            })
            .to_string()
        })
        .with_rule(
            prompts::TAG_REPORT,
            serde_json::json!({
                "sections": [
                    {"name": "key_findings", "markdown": "Agents matter for testing."},
                    {"name": "evidence_analysis", "markdown": "The evidence base is broad."},
                    {"name": "causal_relationships", "markdown": "Automation drives coverage."},
                    {"name": "alternative_interpretations", "markdown": "Selection bias is possible."},
                ],
            })
            .to_string(),
        )
        .with_handler(prompts::TAG_ENUMERATION, |_| {
            serde_json::json!({ "subspaces": ["North region", "South region"] }).to_string()
        })
}

fn task_llm() -> ScriptedLlm {
    ScriptedLlm::new("task-fixture")
        .with_rule(
            prompts::TAG_SUMMARIZE,
            serde_json::json!({
                "summary": "A self-contained summary of the source.",
                "facts": ["fact one", "fact two"],
            })
            .to_string(),
        )
        .with_rule(
            "'North region'",
            serde_json::json!({
                "entities": [
                    {"name": "Oak School", "unique_identifier": "CA-1",
                     "attributes": {"address": "1 Main St", "enrollment": "420"},
                     "confidence": 0.9},
                    {"name": "Pine Academy",
                     "attributes": {"address": "9 Hill Rd", "tuition": "9000"},
                     "confidence": 0.7},
                ],
            })
            .to_string(),
        )
        .with_rule(
            "'South region'",
            serde_json::json!({
                "entities": [
                    {"name": "Oak School", "unique_identifier": "CA-1",
                     "attributes": {"website": "https://oak.example", "tuition": "12000"},
                     "confidence": 0.6},
                ],
            })
            .to_string(),
        )
}

struct Harness {
    orchestrator: Arc<Orchestrator>,
    store: Store,
    bus: EventBus,
}

async fn harness_with(config: NexusConfig, gateway: ProviderGateway) -> Harness {
    let store = Store::in_memory().await.unwrap();
    let bus = EventBus::new(1024, config.event_max_bytes);
    let ctx = NexusContext::new(config, store.clone(), bus.clone(), gateway);
    Harness {
        orchestrator: Arc::new(Orchestrator::start(ctx)),
        store,
        bus,
    }
}

fn analytical_request() -> TaskRequest {
    TaskRequest {
        title: "AI agents and software testing".into(),
        research_query: "impact of AI agents on software testing".into(),
        research_type: ResearchType::AnalyticalReport,
        project_id: None,
        aggregation_config: None,
    }
}

fn aggregation_request(project_id: Option<&str>) -> TaskRequest {
    TaskRequest {
        title: "Private schools in California".into(),
        research_query: "private schools in California".into(),
        research_type: ResearchType::DataAggregation,
        project_id: project_id.map(String::from),
        aggregation_config: Some(AggregationConfig {
            entities: vec!["private schools".into()],
            attributes: vec![
                "name".into(),
                "address".into(),
                "website".into(),
                "enrollment".into(),
                "tuition".into(),
            ],
            search_space: "California".into(),
            domain_hint: Some("education.private_schools".into()),
        }),
    }
}

#[tokio::test]
async fn test_analytical_happy_path() {
    let config = test_config();
    let gateway = ProviderGateway::builder()
        .with_search_provider(Arc::new(ScriptedSearchProvider::new(ProviderId::Exa)))
        .with_search_provider(Arc::new(ScriptedSearchProvider::new(ProviderId::Linkup)))
        .with_reasoning_llm(Arc::new(reasoning_llm(4)))
        .with_task_llm(Arc::new(task_llm()))
        .build(&config);
    let h = harness_with(config, gateway).await;

    let task = h.orchestrator.create_task(analytical_request()).await.unwrap();
    let finished = h.orchestrator.run_task(&task.id).await.unwrap();
    assert_eq!(finished.status, TaskStatus::Completed);

    let ops = h.store.list_operations(&task.id).await.unwrap();
    let count_of = |kind: &str| {
        ops.iter()
            .filter(|op| op.spec.operation_type() == kind)
            .count()
    };
    assert_eq!(count_of("topic_decomposition"), 1);
    assert_eq!(count_of("research_plan"), 1);
    // 4 subtopics x 2 providers.
    assert_eq!(count_of("mcp_search"), 8);
    assert!(count_of("summarize_source") >= 4);
    assert_eq!(count_of("build_knowledge_tree"), 1);
    assert_eq!(count_of("generate_insights"), 1);
    assert_eq!(count_of("spiky_pov"), 1);
    assert_eq!(count_of("synthesize_report"), 1);
    assert!(ops.iter().all(|op| op.status == OperationStatus::Completed));

    let stats = h.store.dok_stats(&task.id).await.unwrap();
    assert!(stats.total_sources >= 4);
    assert!(stats.total_summaries >= 4);
    assert!(stats.total_nodes >= 1);
    assert!(stats.total_insights >= 1);
    assert!(stats.total_truths >= 1);
    assert!(stats.total_myths >= 1);

    let report = h.store.get_report(&task.id).await.unwrap().unwrap();
    assert!(report.contains("## Key Findings"));
    assert!(!report.trim().is_empty());

    let aggregate = h.store.evidence_aggregate(&task.id).await.unwrap();
    assert!(aggregate.total_evidence_items > 0);
    assert_eq!(aggregate.search_providers_used, vec!["exa", "linkup"]);

    // Insights cite persisted sources only.
    for insight in h.store.list_insights(&task.id).await.unwrap() {
        assert!(!insight.source_ids.is_empty());
        assert!(insight.confidence <= 1.0);
    }

    h.orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_zero_results_still_completes_with_explicit_report() {
    let config = test_config();
    let gateway = ProviderGateway::builder()
        .with_search_provider(Arc::new(
            ScriptedSearchProvider::new(ProviderId::Exa).with_results(vec![]),
        ))
        .with_reasoning_llm(Arc::new(reasoning_llm(2)))
        .with_task_llm(Arc::new(task_llm()))
        .build(&config);
    let h = harness_with(config, gateway).await;

    let task = h.orchestrator.create_task(analytical_request()).await.unwrap();
    let finished = h.orchestrator.run_task(&task.id).await.unwrap();
    assert_eq!(finished.status, TaskStatus::Completed);

    let report = h.store.get_report(&task.id).await.unwrap().unwrap();
    assert!(report.contains("No sources found"));

    let stats = h.store.dok_stats(&task.id).await.unwrap();
    assert_eq!(stats.total_sources, 0);
    assert_eq!(stats.total_insights, 0);

    h.orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_all_providers_degraded_fails_task() {
    let config = test_config();
    let gateway = ProviderGateway::builder()
        .with_search_provider(Arc::new(ScriptedSearchProvider::disabled(ProviderId::Exa)))
        .with_search_provider(Arc::new(ScriptedSearchProvider::disabled(
            ProviderId::Linkup,
        )))
        .with_reasoning_llm(Arc::new(reasoning_llm(2)))
        .with_task_llm(Arc::new(task_llm()))
        .build(&config);
    let h = harness_with(config, gateway).await;

    let task = h.orchestrator.create_task(analytical_request()).await.unwrap();
    let finished = h.orchestrator.run_task(&task.id).await.unwrap();
    assert_eq!(finished.status, TaskStatus::Failed);
    assert!(finished
        .error_message
        .unwrap()
        .starts_with(ErrorKind::ProviderDegraded.as_str()));

    h.orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_transient_provider_recovers_with_retry_events() {
    let config = test_config();
    let gateway = ProviderGateway::builder()
        .with_search_provider(Arc::new(
            ScriptedSearchProvider::new(ProviderId::Exa)
                .failing_first(2, ProviderError::Server("503".into())),
        ))
        // Single-attempt gateway so the coordinator owns the retries.
        .with_retry(RetryPolicy::new(1, Duration::from_millis(1)).without_jitter())
        .with_reasoning_llm(Arc::new(reasoning_llm(1)))
        .with_task_llm(Arc::new(task_llm()))
        .build(&config);
    let h = harness_with(config, gateway).await;

    let mut retries = h
        .bus
        .subscribe(SubscriberFilter::all().with_event_types(["task_retry"]));

    let task = h.orchestrator.create_task(analytical_request()).await.unwrap();
    let finished = h.orchestrator.run_task(&task.id).await.unwrap();
    assert_eq!(finished.status, TaskStatus::Completed);

    let first = retries.recv_event().await.unwrap();
    let second = retries.recv_event().await.unwrap();
    match (first, second) {
        (
            MonitorEvent::TaskRetry {
                retry_count: a,
                operation_id: op_a,
                ..
            },
            MonitorEvent::TaskRetry {
                retry_count: b,
                operation_id: op_b,
                ..
            },
        ) => {
            assert_eq!((a, b), (1, 2));
            assert_eq!(op_a, op_b);
        }
        other => panic!("expected two retry events, got {other:?}"),
    }

    let ops = h.store.list_operations(&task.id).await.unwrap();
    let search_op = ops
        .iter()
        .find(|op| op.spec.operation_type() == "mcp_search")
        .unwrap();
    assert_eq!(search_op.status, OperationStatus::Completed);
    assert_eq!(search_op.retry_count, 2);

    h.orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_cancellation_terminalizes_inflight_search() {
    let config = test_config();
    let gateway = ProviderGateway::builder()
        .with_search_provider(Arc::new(
            ScriptedSearchProvider::new(ProviderId::Exa).with_delay(Duration::from_secs(60)),
        ))
        .with_search_provider(Arc::new(
            ScriptedSearchProvider::new(ProviderId::Linkup).with_delay(Duration::from_secs(60)),
        ))
        .with_reasoning_llm(Arc::new(reasoning_llm(4)))
        .with_task_llm(Arc::new(task_llm()))
        .build(&config);
    let h = harness_with(config, gateway).await;

    let task = h.orchestrator.create_task(analytical_request()).await.unwrap();
    let orchestrator = Arc::clone(&h.orchestrator);
    let task_id = task.id.clone();
    let running = tokio::spawn(async move { orchestrator.run_task(&task_id).await });

    // Let the search fan-out get in flight, then cancel.
    tokio::time::sleep(Duration::from_millis(400)).await;
    h.orchestrator.cancel_task(&task.id).await;

    let finished = running.await.unwrap().unwrap();
    assert_eq!(finished.status, TaskStatus::Failed);
    assert!(finished
        .error_message
        .unwrap()
        .starts_with(ErrorKind::Cancelled.as_str()));

    let ops = h.store.list_operations(&task.id).await.unwrap();
    for op in ops.iter().filter(|op| op.spec.operation_type() == "mcp_search") {
        assert_eq!(op.status, OperationStatus::Cancelled);
    }
    // No search evidence landed after the cancel.
    let evidence = h.store.list_evidence(&task.id).await.unwrap();
    assert!(evidence.iter().all(|e| e.evidence_type != "search_result"));

    h.orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_tree_failure_marks_downstream_dependency_failed() {
    let config = test_config();
    let reasoning = reasoning_llm_with(2, Some("this is not json"));
    let gateway = ProviderGateway::builder()
        .with_search_provider(Arc::new(ScriptedSearchProvider::new(ProviderId::Exa)))
        .with_reasoning_llm(Arc::new(reasoning))
        .with_task_llm(Arc::new(task_llm()))
        .build(&config);
    let h = harness_with(config, gateway).await;

    let task = h.orchestrator.create_task(analytical_request()).await.unwrap();
    let finished = h.orchestrator.run_task(&task.id).await.unwrap();
    assert_eq!(finished.status, TaskStatus::Failed);

    let ops = h.store.list_operations(&task.id).await.unwrap();
    let status_of = |kind: &str| {
        ops.iter()
            .find(|op| op.spec.operation_type() == kind)
            .map(|op| (op.status, op.error_kind))
    };

    let (tree_status, tree_kind) = status_of("build_knowledge_tree").unwrap();
    assert_eq!(tree_status, OperationStatus::Failed);
    assert_eq!(tree_kind, Some(ErrorKind::ProviderPermanent));

    for kind in ["generate_insights", "spiky_pov", "synthesize_report"] {
        let (status, error_kind) = status_of(kind).unwrap();
        assert_eq!(status, OperationStatus::Failed, "{kind}");
        assert_eq!(error_kind, Some(ErrorKind::DependencyFailed), "{kind}");
    }

    // Partial artifacts survive; the report does not exist.
    assert!(!h.store.list_source_summaries(&task.id).await.unwrap().is_empty());
    assert!(h.store.get_report(&task.id).await.unwrap().is_none());

    h.orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_aggregation_pipeline_exports_csv() {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = test_config();
    config.storage_root = tmp.path().to_path_buf();
    let gateway = ProviderGateway::builder()
        .with_search_provider(Arc::new(ScriptedSearchProvider::new(ProviderId::Exa)))
        .with_reasoning_llm(Arc::new(reasoning_llm(2)))
        .with_task_llm(Arc::new(task_llm()))
        .build(&config);
    let h = harness_with(config, gateway).await;

    let task = h
        .orchestrator
        .create_task(aggregation_request(None))
        .await
        .unwrap();
    let finished = h.orchestrator.run_task(&task.id).await.unwrap();
    assert_eq!(finished.status, TaskStatus::Completed);

    // Oak School appears in both subspaces and merges by identifier.
    let entities = h.store.list_entities(&task.id, None).await.unwrap();
    assert_eq!(entities.len(), 2);
    let oak = entities.iter().find(|e| e.name == "Oak School").unwrap();
    assert_eq!(oak.unique_identifier.as_deref(), Some("CA-1"));
    assert_eq!(oak.attributes["address"], "1 Main St");
    assert_eq!(oak.attributes["website"], "https://oak.example");

    let artifacts = h.store.list_artifacts(&task.id).await.unwrap();
    assert_eq!(artifacts.len(), 1);
    let csv = std::fs::read_to_string(&artifacts[0].path).unwrap();
    let header = csv.lines().next().unwrap();
    assert_eq!(
        header,
        "name,unique_identifier,address,enrollment,tuition,website,source_tasks,confidence_score,updated_at"
    );
    assert_eq!(csv.lines().count(), 3);

    h.orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_cross_task_consolidation_merges_lineage() {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = test_config();
    config.storage_root = tmp.path().to_path_buf();
    let gateway = ProviderGateway::builder()
        .with_search_provider(Arc::new(ScriptedSearchProvider::new(ProviderId::Exa)))
        .with_reasoning_llm(Arc::new(reasoning_llm(2)))
        .with_task_llm(Arc::new(task_llm()))
        .build(&config);
    let h = harness_with(config, gateway).await;

    let first = h
        .orchestrator
        .create_task(aggregation_request(Some("proj-1")))
        .await
        .unwrap();
    let second = h
        .orchestrator
        .create_task(aggregation_request(Some("proj-1")))
        .await
        .unwrap();
    h.orchestrator.run_task(&first.id).await.unwrap();
    h.orchestrator.run_task(&second.id).await.unwrap();

    let consolidated = h.orchestrator.consolidate_project("proj-1").await.unwrap();
    let oak = consolidated
        .iter()
        .find(|e| e.unique_identifier.as_deref() == Some("CA-1"))
        .unwrap();

    let address_tasks: Vec<&str> = oak.lineage["address"]
        .sources
        .iter()
        .map(|entry| entry.task_id.as_str())
        .collect();
    assert!(address_tasks.contains(&first.id.as_str()));
    assert!(address_tasks.contains(&second.id.as_str()));

    // Mean of per-attribute maxima over address/enrollment/tuition/website.
    let expected = (0.9 + 0.9 + 0.6 + 0.6) / 4.0;
    assert!((oak.confidence_score - expected).abs() < 1e-9);

    // Consolidation is idempotent.
    let again = h.orchestrator.consolidate_project("proj-1").await.unwrap();
    let oak_again = again
        .iter()
        .find(|e| e.unique_identifier.as_deref() == Some("CA-1"))
        .unwrap();
    assert_eq!(oak_again.attributes, oak.attributes);
    assert_eq!(oak_again.lineage, oak.lineage);
    assert!((oak_again.confidence_score - oak.confidence_score).abs() < 1e-9);

    h.orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_resubmitting_completed_operation_returns_prior_handle() {
    let config = test_config();
    let gateway = ProviderGateway::builder()
        .with_search_provider(Arc::new(ScriptedSearchProvider::new(ProviderId::Exa)))
        .with_reasoning_llm(Arc::new(reasoning_llm(1)))
        .with_task_llm(Arc::new(task_llm()))
        .build(&config);
    let h = harness_with(config, gateway).await;

    let task = h.orchestrator.create_task(analytical_request()).await.unwrap();
    h.orchestrator.run_task(&task.id).await.unwrap();

    let ops = h.store.list_operations(&task.id).await.unwrap();
    let done = ops
        .iter()
        .find(|op| op.status == OperationStatus::Completed)
        .unwrap();

    let handle = h
        .orchestrator
        .coordinator()
        .submit(done.clone(), SubmitOptions::default())
        .await
        .unwrap();
    assert!(handle.is_terminal());
    let outcome = handle.await_terminal().await;
    assert_eq!(outcome.status, OperationStatus::Completed);

    h.orchestrator.shutdown().await;
}
