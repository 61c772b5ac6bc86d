//! The data-aggregation pipeline: enumerate the search space, search per
//! subspace, extract candidate entities, resolve, export CSV.

use std::collections::BTreeMap;

use super::{Orchestrator, PhaseError};
use crate::error::ErrorKind;
use crate::model::{OpOutput, OpSpec, SourceId, Task, TaskStatus};

impl Orchestrator {
    pub(super) async fn run_aggregation(&self, task: &Task) -> Result<(), PhaseError> {
        let config = task.aggregation_config.clone().ok_or_else(|| {
            PhaseError::new(
                "data_aggregation task without aggregation_config",
                ErrorKind::InvariantViolation,
            )
        })?;
        let fanout_ratio = self.ctx.config.fanout_min_success_ratio;

        // Phase 1: search-space enumeration.
        self.advance_status(task, TaskStatus::Planning).await?;
        let enumeration = self
            .run_phase(
                task,
                "search_space_enumeration",
                1.0,
                vec![OpSpec::SearchSpaceEnumeration {
                    search_space: config.search_space.clone(),
                    entities: config.entities.clone(),
                }],
                BTreeMap::new(),
            )
            .await?;
        let OpOutput::SearchSpaceEnumeration { subspaces } =
            self.op_output(&enumeration.op_ids[0]).await?
        else {
            return Err(PhaseError::new(
                "unexpected output for search_space_enumeration",
                ErrorKind::InvariantViolation,
            ));
        };

        // Phase 2: search per subspace x provider.
        self.advance_status(task, TaskStatus::Searching).await?;
        let mut providers = self.ctx.gateway.enabled_providers();
        providers.sort_by_key(|p| p.as_str());
        if providers.is_empty() {
            return Err(PhaseError::new(
                "no search providers enabled",
                ErrorKind::ProviderDegraded,
            ));
        }
        let entity_label = config.entities.join(", ");
        let mut search_specs = Vec::with_capacity(subspaces.len() * providers.len());
        for (subtopic_index, subspace) in subspaces.iter().enumerate() {
            for provider in &providers {
                search_specs.push(OpSpec::McpSearch {
                    provider: *provider,
                    query: format!("{entity_label} in {subspace}"),
                    subtopic_index,
                });
            }
        }
        self.run_phase(
            task,
            "mcp_search",
            fanout_ratio,
            search_specs,
            BTreeMap::from([("subspaces".to_string(), subspaces.len() as i64)]),
        )
        .await?;

        // Phase 3: extraction per subspace over that subspace's sources.
        let sources = self
            .ctx
            .store
            .list_task_sources(&task.id)
            .await
            .map_err(|e| PhaseError::new(e.to_string(), ErrorKind::Store))?;
        let mut per_subspace: BTreeMap<usize, Vec<SourceId>> = BTreeMap::new();
        for (source, subtopic_index) in &sources {
            per_subspace
                .entry(*subtopic_index)
                .or_default()
                .push(source.id.clone());
        }

        self.advance_status(task, TaskStatus::Summarizing).await?;
        let extract_specs: Vec<OpSpec> = subspaces
            .iter()
            .enumerate()
            .map(|(subspace_index, subspace)| OpSpec::ExtractEntities {
                subspace: subspace.clone(),
                subspace_index,
                attributes: config.attributes.clone(),
                domain_hint: config.domain_hint.clone(),
                source_ids: per_subspace.remove(&subspace_index).unwrap_or_default(),
            })
            .collect();
        self.run_phase(
            task,
            "extract_entities",
            fanout_ratio,
            extract_specs,
            BTreeMap::from([("sources".to_string(), sources.len() as i64)]),
        )
        .await?;

        // Phase 4: resolve, then export. Export is recorded as a dependency
        // failure when resolution dies.
        self.advance_status(task, TaskStatus::Synthesizing).await?;
        let entity_type = config
            .entities
            .first()
            .cloned()
            .unwrap_or_else(|| "entity".to_string());
        if let Err(e) = self
            .run_phase(
                task,
                "resolve_entities",
                1.0,
                vec![OpSpec::ResolveEntities {
                    entity_type: entity_type.clone(),
                }],
                BTreeMap::new(),
            )
            .await
        {
            self.record_dependency_failures(task, &e.anchor_op, vec![OpSpec::ExportCsv])
                .await;
            return Err(e);
        }

        self.run_phase(task, "export_csv", 1.0, vec![OpSpec::ExportCsv], BTreeMap::new())
            .await?;

        Ok(())
    }
}
