//! The analytical-report pipeline: decompose, plan, search, summarize,
//! build the knowledge tree, synthesize insights and POVs, write the
//! report.

use std::collections::BTreeMap;

use super::{Orchestrator, PhaseError};
use crate::error::ErrorKind;
use crate::model::{OpOutput, OpSpec, Task, TaskStatus};

const MAX_SUBTOPICS: usize = 8;

impl Orchestrator {
    pub(super) async fn run_analytical(&self, task: &Task) -> Result<(), PhaseError> {
        let fanout_ratio = self.ctx.config.fanout_min_success_ratio;

        // Phase 1: topic decomposition.
        self.advance_status(task, TaskStatus::Planning).await?;
        let decomposition = self
            .run_phase(
                task,
                "topic_decomposition",
                1.0,
                vec![OpSpec::TopicDecomposition {
                    query: task.research_query.clone(),
                    max_subtopics: MAX_SUBTOPICS,
                }],
                BTreeMap::new(),
            )
            .await?;
        let OpOutput::TopicDecomposition { subtopics } =
            self.op_output(&decomposition.op_ids[0]).await?
        else {
            return Err(PhaseError::new(
                "unexpected output for topic_decomposition",
                ErrorKind::InvariantViolation,
            ));
        };

        // Phase 2: research plan.
        self.run_phase(
            task,
            "research_plan",
            1.0,
            vec![OpSpec::ResearchPlan {
                query: task.research_query.clone(),
                subtopics: subtopics.clone(),
            }],
            BTreeMap::from([("subtopics".to_string(), subtopics.len() as i64)]),
        )
        .await?;

        // Phase 3: search fan-out, subtopic x provider, deterministic order.
        self.advance_status(task, TaskStatus::Searching).await?;
        let mut providers = self.ctx.gateway.enabled_providers();
        providers.sort_by_key(|p| p.as_str());
        if providers.is_empty() {
            return Err(PhaseError::new(
                "no search providers enabled",
                ErrorKind::ProviderDegraded,
            ));
        }
        let mut search_specs = Vec::with_capacity(subtopics.len() * providers.len());
        for (subtopic_index, subtopic) in subtopics.iter().enumerate() {
            for provider in &providers {
                search_specs.push(OpSpec::McpSearch {
                    provider: *provider,
                    query: subtopic.query.clone(),
                    subtopic_index,
                });
            }
        }
        self.run_phase(
            task,
            "mcp_search",
            fanout_ratio,
            search_specs,
            BTreeMap::from([
                ("subtopics".to_string(), subtopics.len() as i64),
                ("providers".to_string(), providers.len() as i64),
            ]),
        )
        .await?;

        // Phase 4: one summarization per deduplicated (source, subtopic).
        let sources = self
            .ctx
            .store
            .list_task_sources(&task.id)
            .await
            .map_err(|e| PhaseError::new(e.to_string(), ErrorKind::Store))?;
        self.advance_status(task, TaskStatus::Summarizing).await?;
        let summarize_specs: Vec<OpSpec> = sources
            .iter()
            .map(|(source, subtopic_index)| OpSpec::SummarizeSource {
                source_id: source.id.clone(),
                url: source.url.clone(),
                title: source.title.clone(),
                subtopic: subtopics
                    .get(*subtopic_index)
                    .map(|s| s.query.clone())
                    .unwrap_or_else(|| task.research_query.clone()),
                subtopic_index: *subtopic_index,
            })
            .collect();
        self.run_phase(
            task,
            "summarize_source",
            fanout_ratio,
            summarize_specs,
            BTreeMap::from([("sources".to_string(), sources.len() as i64)]),
        )
        .await?;

        // Sequential tail. When one step fails permanently the rest are
        // recorded as dependency failures instead of silently skipped.
        self.advance_status(task, TaskStatus::BuildingKnowledge)
            .await?;
        if let Err(e) = self
            .run_phase(
                task,
                "build_knowledge_tree",
                1.0,
                vec![OpSpec::BuildKnowledgeTree],
                BTreeMap::new(),
            )
            .await
        {
            self.record_dependency_failures(
                task,
                &e.anchor_op,
                vec![
                    OpSpec::GenerateInsights,
                    OpSpec::SpikyPov,
                    OpSpec::SynthesizeReport,
                ],
            )
            .await;
            return Err(e);
        }

        self.advance_status(task, TaskStatus::GeneratingInsights)
            .await?;
        if let Err(e) = self
            .run_phase(
                task,
                "generate_insights",
                1.0,
                vec![OpSpec::GenerateInsights],
                BTreeMap::new(),
            )
            .await
        {
            self.record_dependency_failures(
                task,
                &e.anchor_op,
                vec![OpSpec::SpikyPov, OpSpec::SynthesizeReport],
            )
            .await;
            return Err(e);
        }

        self.advance_status(task, TaskStatus::AnalyzingPovs).await?;
        if let Err(e) = self
            .run_phase(task, "spiky_pov", 1.0, vec![OpSpec::SpikyPov], BTreeMap::new())
            .await
        {
            self.record_dependency_failures(task, &e.anchor_op, vec![OpSpec::SynthesizeReport])
                .await;
            return Err(e);
        }

        self.advance_status(task, TaskStatus::Synthesizing).await?;
        self.run_phase(
            task,
            "synthesize_report",
            1.0,
            vec![OpSpec::SynthesizeReport],
            BTreeMap::new(),
        )
        .await?;

        Ok(())
    }
}
