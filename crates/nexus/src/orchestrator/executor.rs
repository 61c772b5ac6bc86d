//! The operation executor: the single match over `OpSpec` that turns
//! coordinator dispatches into gateway calls, synthesis, resolution, and
//! store writes.
//!
//! The cancellation token is polled before every external call; evidence
//! returned here lands in the same ledger transaction as the terminal
//! transition.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{prompts, NexusContext};
use crate::coordinator::{OpExecution, OperationRunner};
use crate::error::CoreError;
use crate::gateway::{LlmOptions, ModelRole, SearchOptions};
use crate::model::{
    Evidence, OpOutput, OpSpec, Operation, ProviderId, ResearchPlan, Source, SourceId, Subtopic,
};
use crate::report;
use crate::resolution;
use crate::synthesis;

pub(super) struct Executor {
    ctx: Arc<NexusContext>,
}

impl Executor {
    pub(super) fn new(ctx: Arc<NexusContext>) -> Self {
        Self { ctx }
    }

    fn ensure_live(cancel: &CancellationToken) -> Result<(), CoreError> {
        if cancel.is_cancelled() {
            return Err(CoreError::Cancelled);
        }
        Ok(())
    }

    /// Evidence payloads are bounded; long model output is clipped, not
    /// dropped.
    fn clip_for_evidence(&self, text: &str) -> String {
        let cap = self.ctx.config.evidence_max_bytes.saturating_sub(256).max(256);
        let mut end = text.len().min(cap);
        while end > 0 && !text.is_char_boundary(end) {
            end -= 1;
        }
        text[..end].to_string()
    }

    fn llm_evidence(&self, op: &Operation, tag: &str, model: &str, text: &str) -> Evidence {
        Evidence::new(
            &op.id,
            &op.task_id,
            "llm_response",
            serde_json::json!({
                "tag": tag,
                "model": model,
                "text": self.clip_for_evidence(text),
            }),
        )
    }

    async fn complete(
        &self,
        cancel: &CancellationToken,
        role: ModelRole,
        prompt: &str,
    ) -> Result<crate::gateway::Completion, CoreError> {
        Self::ensure_live(cancel)?;
        self.ctx
            .gateway
            .llm_complete(role, prompt, &LlmOptions::default())
            .await
            .into_result()
    }

    async fn run_decomposition(
        &self,
        op: &Operation,
        cancel: &CancellationToken,
        query: &str,
        max_subtopics: usize,
    ) -> Result<OpExecution, CoreError> {
        let prompt = prompts::decomposition(query, max_subtopics);
        let completion = self
            .complete(cancel, ModelRole::Reasoning, &prompt)
            .await?;
        let mut response: synthesis::DecompositionResponse =
            synthesis::parse_llm_json(&completion.text)?;
        response.subtopics.truncate(max_subtopics);
        if response.subtopics.is_empty() {
            return Err(CoreError::ProviderPermanent(
                "decomposition produced no subtopics".to_string(),
            ));
        }

        Ok(OpExecution {
            evidence: vec![self.llm_evidence(
                op,
                prompts::TAG_DECOMPOSITION,
                &completion.model,
                &completion.text,
            )],
            output: OpOutput::TopicDecomposition {
                subtopics: response.subtopics,
            },
        })
    }

    async fn run_research_plan(
        &self,
        op: &Operation,
        cancel: &CancellationToken,
        query: &str,
        subtopics: &[Subtopic],
    ) -> Result<OpExecution, CoreError> {
        let prompt = prompts::research_plan(query, subtopics);
        let completion = self
            .complete(cancel, ModelRole::Reasoning, &prompt)
            .await?;
        let plan: ResearchPlan = synthesis::parse_llm_json(&completion.text)?;

        Ok(OpExecution {
            evidence: vec![self.llm_evidence(
                op,
                prompts::TAG_RESEARCH_PLAN,
                &completion.model,
                &completion.text,
            )],
            output: OpOutput::ResearchPlan { plan },
        })
    }

    async fn run_search(
        &self,
        op: &Operation,
        cancel: &CancellationToken,
        provider: ProviderId,
        query: &str,
        subtopic_index: usize,
    ) -> Result<OpExecution, CoreError> {
        Self::ensure_live(cancel)?;
        let results = self
            .ctx
            .gateway
            .search(provider, query, &SearchOptions::default())
            .await
            .into_result()?;

        let mut evidence = Vec::with_capacity(results.len());
        let mut source_ids: Vec<SourceId> = Vec::new();
        let result_count = results.len();

        for result in &results {
            Self::ensure_live(cancel)?;
            let source = Source::new(&result.url, &result.title, &result.snippet, provider);
            let source_id = self
                .ctx
                .store
                .upsert_source(
                    &source,
                    &op.task_id,
                    subtopic_index,
                    self.ctx.config.reliability_alpha,
                )
                .await?;
            if !source_ids.contains(&source_id) {
                source_ids.push(source_id);
            }

            evidence.push(
                Evidence::new(
                    &op.id,
                    &op.task_id,
                    "search_result",
                    serde_json::json!({
                        "title": result.title,
                        "snippet": self.clip_for_evidence(&result.snippet),
                    }),
                )
                .with_source_url(&result.url)
                .with_provider(provider),
            );
        }

        Ok(OpExecution {
            evidence,
            output: OpOutput::McpSearch {
                provider,
                source_ids,
                result_count,
            },
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_summarize(
        &self,
        op: &Operation,
        cancel: &CancellationToken,
        source_id: &str,
        url: &str,
        title: &str,
        subtopic: &str,
        subtopic_index: usize,
    ) -> Result<OpExecution, CoreError> {
        Self::ensure_live(cancel)?;
        let source = self
            .ctx
            .store
            .get_source(source_id)
            .await?
            .ok_or_else(|| CoreError::InvariantViolation(format!("unknown source {source_id}")))?;

        // Prefer stored content; fetch only when the search result carried
        // nothing, and tolerate fetch failure.
        let mut content = source.description.clone();
        if content.trim().is_empty() {
            Self::ensure_live(cancel)?;
            match self.ctx.gateway.fetch(url).await.into_result() {
                Ok(document) => content = document.content,
                Err(e) => debug!("fetch for {url} failed, summarizing title only: {e}"),
            }
        }

        let prompt = prompts::summarize(title, url, &self.clip_for_evidence(&content), subtopic);
        let completion = self.complete(cancel, ModelRole::Task, &prompt).await?;
        let response: synthesis::SummaryResponse = synthesis::parse_llm_json(&completion.text)?;
        let summary = synthesis::build_summary(
            &op.task_id,
            source_id,
            subtopic,
            subtopic_index,
            response,
            self.ctx.config.max_fact_len,
        )?;

        Self::ensure_live(cancel)?;
        self.ctx.store.append_source_summary(&summary).await?;

        Ok(OpExecution {
            evidence: vec![self.llm_evidence(
                op,
                prompts::TAG_SUMMARIZE,
                &completion.model,
                &completion.text,
            )],
            output: OpOutput::SummarizeSource {
                summary_id: summary.id,
                fact_count: summary.dok1_facts.len(),
            },
        })
    }

    async fn known_source_ids(&self, task_id: &str) -> Result<HashSet<String>, CoreError> {
        Ok(self
            .ctx
            .store
            .list_task_sources(task_id)
            .await?
            .into_iter()
            .map(|(source, _)| source.id)
            .collect())
    }

    async fn run_build_tree(
        &self,
        op: &Operation,
        cancel: &CancellationToken,
    ) -> Result<OpExecution, CoreError> {
        Self::ensure_live(cancel)?;
        let summaries = self.ctx.store.list_source_summaries(&op.task_id).await?;
        if summaries.is_empty() {
            return Ok(OpExecution {
                evidence: vec![],
                output: OpOutput::BuildKnowledgeTree {
                    node_count: 0,
                    root_count: 0,
                },
            });
        }

        let known = self.known_source_ids(&op.task_id).await?;
        let prompt = prompts::knowledge_tree(&summaries);
        let completion = self
            .complete(cancel, ModelRole::Reasoning, &prompt)
            .await?;
        let response: synthesis::TreeResponse = synthesis::parse_llm_json(&completion.text)?;
        let nodes = synthesis::build_knowledge_nodes(
            &op.task_id,
            response,
            &known,
            self.ctx.config.max_tree_depth,
        )?;

        Self::ensure_live(cancel)?;
        self.ctx.store.append_knowledge_nodes(&nodes).await?;

        let root_count = nodes.iter().filter(|n| n.parent_id.is_none()).count();
        Ok(OpExecution {
            evidence: vec![self.llm_evidence(
                op,
                prompts::TAG_KNOWLEDGE_TREE,
                &completion.model,
                &completion.text,
            )],
            output: OpOutput::BuildKnowledgeTree {
                node_count: nodes.len(),
                root_count,
            },
        })
    }

    async fn run_insights(
        &self,
        op: &Operation,
        cancel: &CancellationToken,
    ) -> Result<OpExecution, CoreError> {
        Self::ensure_live(cancel)?;
        let nodes = self.ctx.store.list_knowledge_nodes(&op.task_id).await?;
        let known = self.known_source_ids(&op.task_id).await?;
        if nodes.is_empty() || known.is_empty() {
            return Ok(OpExecution {
                evidence: vec![],
                output: OpOutput::GenerateInsights { insight_count: 0 },
            });
        }

        let digest = nodes
            .iter()
            .map(|n| {
                let sources = n
                    .source_links
                    .iter()
                    .map(|(id, _)| id.as_str())
                    .collect::<Vec<_>>()
                    .join(", ");
                format!(
                    "- [{}] {} :: {} (sources: {sources})",
                    n.category, n.summary, n.dok_level
                )
            })
            .collect::<Vec<_>>()
            .join("\n");
        let mut source_ids: Vec<String> = known.iter().cloned().collect();
        source_ids.sort();
        let prompt = prompts::insights(&digest, &source_ids);
        let completion = self
            .complete(cancel, ModelRole::Reasoning, &prompt)
            .await?;
        let response: synthesis::InsightsResponse = synthesis::parse_llm_json(&completion.text)?;
        let insights = synthesis::build_insights(&op.task_id, response, &known)?;

        Self::ensure_live(cancel)?;
        for insight in &insights {
            self.ctx.store.append_insight(insight).await?;
        }

        Ok(OpExecution {
            evidence: vec![self.llm_evidence(
                op,
                prompts::TAG_INSIGHTS,
                &completion.model,
                &completion.text,
            )],
            output: OpOutput::GenerateInsights {
                insight_count: insights.len(),
            },
        })
    }

    async fn run_spiky_povs(
        &self,
        op: &Operation,
        cancel: &CancellationToken,
    ) -> Result<OpExecution, CoreError> {
        Self::ensure_live(cancel)?;
        let insights = self.ctx.store.list_insights(&op.task_id).await?;
        if insights.is_empty() {
            return Ok(OpExecution {
                evidence: vec![],
                output: OpOutput::SpikyPov {
                    truth_count: 0,
                    myth_count: 0,
                },
            });
        }

        let digest = insights
            .iter()
            .map(|i| format!("- id={} [{}] {}", i.id, i.category, i.insight_text))
            .collect::<Vec<_>>()
            .join("\n");
        let known: HashSet<String> = insights.iter().map(|i| i.id.clone()).collect();
        let prompt = prompts::spiky_povs(&digest);
        let completion = self
            .complete(cancel, ModelRole::Reasoning, &prompt)
            .await?;
        let response: synthesis::PovResponse = synthesis::parse_llm_json(&completion.text)?;
        let povs = synthesis::build_spiky_povs(&op.task_id, response, &known)?;

        Self::ensure_live(cancel)?;
        let mut truth_count = 0;
        let mut myth_count = 0;
        for pov in &povs {
            self.ctx.store.append_spiky_pov(pov).await?;
            match pov.kind {
                crate::model::PovKind::Truth => truth_count += 1,
                crate::model::PovKind::Myth => myth_count += 1,
            }
        }

        Ok(OpExecution {
            evidence: vec![self.llm_evidence(
                op,
                prompts::TAG_SPIKY_POV,
                &completion.model,
                &completion.text,
            )],
            output: OpOutput::SpikyPov {
                truth_count,
                myth_count,
            },
        })
    }

    async fn run_report(
        &self,
        op: &Operation,
        cancel: &CancellationToken,
    ) -> Result<OpExecution, CoreError> {
        Self::ensure_live(cancel)?;
        let task = self
            .ctx
            .store
            .get_task(&op.task_id)
            .await?
            .ok_or_else(|| CoreError::InvariantViolation(format!("unknown task {}", op.task_id)))?;
        let known = self.known_source_ids(&op.task_id).await?;

        let report_id = crate::model::new_id();
        if known.is_empty() {
            let (markdown, sections) = report::empty_report(&task);
            self.ctx
                .store
                .insert_report(&report_id, &op.task_id, &markdown, &sections)
                .await?;
            return Ok(OpExecution {
                evidence: vec![],
                output: OpOutput::SynthesizeReport {
                    report_id,
                    section_count: report::REPORT_SECTIONS.len(),
                },
            });
        }

        let nodes = self.ctx.store.list_knowledge_nodes(&op.task_id).await?;
        let insights = self.ctx.store.list_insights(&op.task_id).await?;
        let povs = self.ctx.store.list_spiky_povs(&op.task_id).await?;

        let tree_digest = nodes
            .iter()
            .map(|n| format!("- [{}] {}", n.category, n.summary))
            .collect::<Vec<_>>()
            .join("\n");
        let insight_digest = insights
            .iter()
            .map(|i| {
                format!(
                    "- {} (confidence {:.2}, sources: {})",
                    i.insight_text,
                    i.confidence,
                    i.source_ids.join(", ")
                )
            })
            .collect::<Vec<_>>()
            .join("\n");
        let pov_digest = povs
            .iter()
            .map(|p| format!("- {} {}: {}", p.kind, p.statement, p.reasoning))
            .collect::<Vec<_>>()
            .join("\n");

        let prompt = prompts::report(
            &task.research_query,
            &tree_digest,
            &insight_digest,
            &pov_digest,
        );
        let completion = self
            .complete(cancel, ModelRole::Reasoning, &prompt)
            .await?;
        let mut response: report::ReportResponse = synthesis::parse_llm_json(&completion.text)?;
        for section in &mut response.sections {
            section.source_ids.retain(|id| known.contains(id));
        }

        let (markdown, section_sources) = report::render_markdown(&task, &response.sections);
        Self::ensure_live(cancel)?;
        self.ctx
            .store
            .insert_report(&report_id, &op.task_id, &markdown, &section_sources)
            .await?;

        Ok(OpExecution {
            evidence: vec![self.llm_evidence(
                op,
                prompts::TAG_REPORT,
                &completion.model,
                &completion.text,
            )],
            output: OpOutput::SynthesizeReport {
                report_id,
                section_count: response.sections.len(),
            },
        })
    }

    async fn run_enumeration(
        &self,
        op: &Operation,
        cancel: &CancellationToken,
        search_space: &str,
        entities: &[String],
    ) -> Result<OpExecution, CoreError> {
        let prompt = prompts::enumeration(search_space, entities);
        let completion = self
            .complete(cancel, ModelRole::Reasoning, &prompt)
            .await?;
        let response: synthesis::EnumerationResponse =
            synthesis::parse_llm_json(&completion.text)?;
        let subspaces = if response.subspaces.is_empty() {
            vec![search_space.to_string()]
        } else {
            response.subspaces
        };

        Ok(OpExecution {
            evidence: vec![self.llm_evidence(
                op,
                prompts::TAG_ENUMERATION,
                &completion.model,
                &completion.text,
            )],
            output: OpOutput::SearchSpaceEnumeration { subspaces },
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_extract(
        &self,
        op: &Operation,
        cancel: &CancellationToken,
        subspace: &str,
        attributes: &[String],
        domain_hint: Option<&str>,
        source_ids: &[SourceId],
        entity_type: &str,
    ) -> Result<OpExecution, CoreError> {
        Self::ensure_live(cancel)?;
        let mut corpus_lines = Vec::new();
        for source_id in source_ids {
            if let Some(source) = self.ctx.store.get_source(source_id).await? {
                corpus_lines.push(format!(
                    "- url={} title='{}' content: {}",
                    source.url, source.title, source.description
                ));
            }
        }

        if corpus_lines.is_empty() {
            return Ok(OpExecution {
                evidence: vec![],
                output: OpOutput::ExtractEntities { candidates: vec![] },
            });
        }

        let prompt = prompts::extraction(
            entity_type,
            attributes,
            subspace,
            &self.clip_for_evidence(&corpus_lines.join("\n")),
            domain_hint,
        );
        let completion = self.complete(cancel, ModelRole::Task, &prompt).await?;
        let candidates =
            resolution::parse_candidates(&completion.text, &op.task_id, Utc::now())?;

        Ok(OpExecution {
            evidence: vec![self.llm_evidence(
                op,
                prompts::TAG_EXTRACTION,
                &completion.model,
                &completion.text,
            )],
            output: OpOutput::ExtractEntities { candidates },
        })
    }

    async fn run_resolve(
        &self,
        op: &Operation,
        cancel: &CancellationToken,
        entity_type: &str,
    ) -> Result<OpExecution, CoreError> {
        Self::ensure_live(cancel)?;
        let task = self
            .ctx
            .store
            .get_task(&op.task_id)
            .await?
            .ok_or_else(|| CoreError::InvariantViolation(format!("unknown task {}", op.task_id)))?;
        let scope_id = task.project_id.clone().unwrap_or_else(|| task.id.clone());

        let mut candidates = Vec::new();
        for operation in self.ctx.store.list_operations(&op.task_id).await? {
            if let Some(OpOutput::ExtractEntities { candidates: found }) = operation.output {
                candidates.extend(found);
            }
        }
        let candidate_count = candidates.len();

        Self::ensure_live(cancel)?;
        let existing = self
            .ctx
            .store
            .list_entities(&scope_id, Some(entity_type))
            .await?;
        let resolved = resolution::resolve(&scope_id, entity_type, candidates, existing);

        Self::ensure_live(cancel)?;
        for entity in &resolved {
            self.ctx.store.upsert_entity(entity).await?;
        }

        Ok(OpExecution {
            evidence: vec![],
            output: OpOutput::ResolveEntities {
                entity_count: resolved.len(),
                merged_count: candidate_count.saturating_sub(resolved.len()),
            },
        })
    }

    async fn run_export(
        &self,
        op: &Operation,
        cancel: &CancellationToken,
    ) -> Result<OpExecution, CoreError> {
        Self::ensure_live(cancel)?;
        let task = self
            .ctx
            .store
            .get_task(&op.task_id)
            .await?
            .ok_or_else(|| CoreError::InvariantViolation(format!("unknown task {}", op.task_id)))?;
        let scope_id = task.project_id.clone().unwrap_or_else(|| task.id.clone());
        let entities = self.ctx.store.list_entities(&scope_id, None).await?;

        Self::ensure_live(cancel)?;
        let artifact =
            crate::export::export_entities_csv(&self.ctx.store, &self.ctx.config, &task, &entities)
                .await?;

        Ok(OpExecution {
            evidence: vec![],
            output: OpOutput::ExportCsv {
                artifact_id: artifact.id,
                path: artifact.path,
                row_count: entities.len(),
            },
        })
    }
}

#[async_trait]
impl OperationRunner for Executor {
    async fn run(
        &self,
        op: &Operation,
        cancel: &CancellationToken,
    ) -> Result<OpExecution, CoreError> {
        Self::ensure_live(cancel)?;
        match &op.spec {
            OpSpec::TopicDecomposition {
                query,
                max_subtopics,
            } => {
                self.run_decomposition(op, cancel, query, *max_subtopics)
                    .await
            }
            OpSpec::ResearchPlan { query, subtopics } => {
                self.run_research_plan(op, cancel, query, subtopics).await
            }
            OpSpec::McpSearch {
                provider,
                query,
                subtopic_index,
            } => {
                self.run_search(op, cancel, *provider, query, *subtopic_index)
                    .await
            }
            OpSpec::SummarizeSource {
                source_id,
                url,
                title,
                subtopic,
                subtopic_index,
            } => {
                self.run_summarize(op, cancel, source_id, url, title, subtopic, *subtopic_index)
                    .await
            }
            OpSpec::BuildKnowledgeTree => self.run_build_tree(op, cancel).await,
            OpSpec::GenerateInsights => self.run_insights(op, cancel).await,
            OpSpec::SpikyPov => self.run_spiky_povs(op, cancel).await,
            OpSpec::SynthesizeReport => self.run_report(op, cancel).await,
            OpSpec::SearchSpaceEnumeration {
                search_space,
                entities,
            } => {
                self.run_enumeration(op, cancel, search_space, entities)
                    .await
            }
            OpSpec::ExtractEntities {
                subspace,
                subspace_index: _,
                attributes,
                domain_hint,
                source_ids,
            } => {
                let entity_type = self.entity_type_for(&op.task_id).await?;
                self.run_extract(
                    op,
                    cancel,
                    subspace,
                    attributes,
                    domain_hint.as_deref(),
                    source_ids,
                    &entity_type,
                )
                .await
            }
            OpSpec::ResolveEntities { entity_type } => {
                self.run_resolve(op, cancel, entity_type).await
            }
            OpSpec::ExportCsv => self.run_export(op, cancel).await,
        }
    }
}

impl Executor {
    async fn entity_type_for(&self, task_id: &str) -> Result<String, CoreError> {
        let task = self
            .ctx
            .store
            .get_task(task_id)
            .await?
            .ok_or_else(|| CoreError::InvariantViolation(format!("unknown task {task_id}")))?;
        Ok(task
            .aggregation_config
            .as_ref()
            .and_then(|c| c.entities.first().cloned())
            .unwrap_or_else(|| "entity".to_string()))
    }
}
