//! Entity resolution: group extracted candidates, merge attributes by
//! confidence, and carry full per-attribute lineage.
//!
//! Resolution is a pure function over observations; re-running it on an
//! already-consolidated set leaves attributes, lineage, and the confidence
//! aggregate unchanged.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::error::CoreError;
use crate::model::{
    new_id, AggregatedEntity, AttributeLineage, EntityCandidate, LineageEntry, TaskId,
};
use crate::synthesis::{clamp_confidence, parse_llm_json};

/// Contract for `extract_entities`.
#[derive(Debug, Deserialize)]
pub struct ExtractionResponse {
    pub entities: Vec<ExtractedEntity>,
}

#[derive(Debug, Deserialize)]
pub struct ExtractedEntity {
    pub name: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub unique_identifier: Option<String>,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    #[serde(default)]
    pub source_url: Option<String>,
}

fn default_confidence() -> f64 {
    0.5
}

/// Name key used when no domain identifier exists: lowercase, punctuation
/// stripped, whitespace collapsed.
pub fn normalize_name(name: &str) -> String {
    let mut normalized = String::with_capacity(name.len());
    let mut last_was_space = true;
    for c in name.chars() {
        if c.is_alphanumeric() {
            for lower in c.to_lowercase() {
                normalized.push(lower);
            }
            last_was_space = false;
        } else if !last_was_space {
            normalized.push(' ');
            last_was_space = true;
        }
    }
    normalized.trim_end().to_string()
}

/// Parse an extraction response into candidates. Empty names are dropped;
/// confidence is clamped.
pub fn parse_candidates(
    text: &str,
    task_id: &TaskId,
    observed_at: DateTime<Utc>,
) -> Result<Vec<EntityCandidate>, CoreError> {
    let response: ExtractionResponse = parse_llm_json(text)?;
    Ok(response
        .entities
        .into_iter()
        .filter(|entity| !entity.name.trim().is_empty())
        .map(|entity| EntityCandidate {
            name: entity.name.trim().to_string(),
            attributes: entity
                .attributes
                .into_iter()
                .filter(|(_, value)| !value.trim().is_empty())
                .map(|(key, value)| (key, value.trim().to_string()))
                .collect(),
            unique_identifier: entity
                .unique_identifier
                .filter(|id| !id.trim().is_empty()),
            confidence: clamp_confidence(entity.confidence),
            source_url: entity.source_url,
            task_id: task_id.clone(),
            observed_at,
        })
        .collect())
}

/// One observed value for one attribute of one entity group.
#[derive(Debug, Clone, PartialEq)]
struct Observation {
    task_id: TaskId,
    value: String,
    confidence: f64,
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Group {
    unique_identifier: Option<String>,
    names: Vec<(String, f64, DateTime<Utc>)>,
    attributes: BTreeMap<String, Vec<Observation>>,
    source_tasks: Vec<TaskId>,
}

/// Resolve candidates (plus previously consolidated entities, unfolded back
/// into their lineage observations) into one entity per identity.
pub fn resolve(
    scope_id: &str,
    entity_type: &str,
    candidates: Vec<EntityCandidate>,
    existing: Vec<AggregatedEntity>,
) -> Vec<AggregatedEntity> {
    let mut groups: BTreeMap<String, Group> = BTreeMap::new();

    for entity in existing {
        let key = entity.identity_key();
        let group = groups.entry(key).or_default();
        if group.unique_identifier.is_none() {
            group.unique_identifier = entity.unique_identifier.clone();
        }
        group
            .names
            .push((entity.name.clone(), entity.confidence_score, entity.updated_at));
        for task in &entity.source_tasks {
            push_unique(&mut group.source_tasks, task.clone());
        }
        for (attribute, lineage) in entity.lineage {
            let observations = group.attributes.entry(attribute).or_default();
            for entry in lineage.sources {
                push_observation(
                    observations,
                    Observation {
                        task_id: entry.task_id,
                        value: entry.value,
                        confidence: entry.confidence,
                        timestamp: entry.timestamp,
                    },
                );
            }
        }
    }

    for candidate in candidates {
        let key = candidate
            .unique_identifier
            .clone()
            .unwrap_or_else(|| normalize_name(&candidate.name));
        let group = groups.entry(key).or_default();
        if group.unique_identifier.is_none() {
            group.unique_identifier = candidate.unique_identifier.clone();
        }
        group
            .names
            .push((candidate.name.clone(), candidate.confidence, candidate.observed_at));
        push_unique(&mut group.source_tasks, candidate.task_id.clone());
        for (attribute, value) in candidate.attributes {
            push_observation(
                group.attributes.entry(attribute).or_default(),
                Observation {
                    task_id: candidate.task_id.clone(),
                    value,
                    confidence: candidate.confidence,
                    timestamp: candidate.observed_at,
                },
            );
        }
    }

    let now = Utc::now();
    let mut entities: Vec<AggregatedEntity> = groups
        .into_values()
        .filter(|group| !group.names.is_empty())
        .map(|group| consolidate(scope_id, entity_type, group, now))
        .collect();
    entities.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
    entities
}

fn consolidate(
    scope_id: &str,
    entity_type: &str,
    group: Group,
    now: DateTime<Utc>,
) -> AggregatedEntity {
    let name = pick_name(&group.names);

    let mut attributes = BTreeMap::new();
    let mut lineage = BTreeMap::new();
    let mut per_attribute_max = Vec::new();

    for (attribute, observations) in group.attributes {
        if observations.is_empty() {
            continue;
        }
        // Winning value: highest summed confidence, ties to most recent.
        let mut by_value: BTreeMap<&str, (f64, DateTime<Utc>)> = BTreeMap::new();
        for obs in &observations {
            let entry = by_value
                .entry(obs.value.as_str())
                .or_insert((0.0, obs.timestamp));
            entry.0 += obs.confidence;
            entry.1 = entry.1.max(obs.timestamp);
        }
        let (winner, _) = by_value
            .iter()
            .max_by(|a, b| {
                (a.1 .0)
                    .partial_cmp(&b.1 .0)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.1 .1.cmp(&b.1 .1))
            })
            .map(|(value, score)| (value.to_string(), *score))
            .unwrap_or_default();

        per_attribute_max.push(
            observations
                .iter()
                .map(|o| o.confidence)
                .fold(0.0_f64, f64::max),
        );

        let mut sources: Vec<LineageEntry> = observations
            .into_iter()
            .map(|obs| LineageEntry {
                task_id: obs.task_id,
                value: obs.value,
                confidence: obs.confidence,
                timestamp: obs.timestamp,
            })
            .collect();
        sources.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.task_id.cmp(&b.task_id))
                .then_with(|| a.value.cmp(&b.value))
        });

        attributes.insert(attribute.clone(), winner);
        lineage.insert(attribute, AttributeLineage { sources });
    }

    let confidence_score = if per_attribute_max.is_empty() {
        group
            .names
            .iter()
            .map(|(_, confidence, _)| *confidence)
            .fold(0.0_f64, f64::max)
    } else {
        per_attribute_max.iter().sum::<f64>() / per_attribute_max.len() as f64
    };

    let updated_at = group
        .names
        .iter()
        .map(|(_, _, ts)| *ts)
        .max()
        .unwrap_or(now);

    let mut source_tasks = group.source_tasks;
    source_tasks.sort();

    AggregatedEntity {
        id: new_id(),
        scope_id: scope_id.to_string(),
        entity_type: entity_type.to_string(),
        name,
        unique_identifier: group.unique_identifier,
        attributes,
        lineage,
        source_tasks,
        confidence_score,
        consolidated_at: now,
        updated_at,
    }
}

/// Display name: highest summed confidence across observations of the same
/// spelling, ties to the most recent.
fn pick_name(names: &[(String, f64, DateTime<Utc>)]) -> String {
    let mut by_name: BTreeMap<&str, (f64, DateTime<Utc>)> = BTreeMap::new();
    for (name, confidence, ts) in names {
        let entry = by_name.entry(name.as_str()).or_insert((0.0, *ts));
        entry.0 += confidence;
        entry.1 = entry.1.max(*ts);
    }
    by_name
        .iter()
        .max_by(|a, b| {
            (a.1 .0)
                .partial_cmp(&b.1 .0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.1 .1.cmp(&b.1 .1))
        })
        .map(|(name, _)| name.to_string())
        .unwrap_or_default()
}

fn push_unique(tasks: &mut Vec<TaskId>, task: TaskId) {
    if !tasks.contains(&task) {
        tasks.push(task);
    }
}

fn push_observation(observations: &mut Vec<Observation>, observation: Observation) {
    if !observations.contains(&observation) {
        observations.push(observation);
    }
}
