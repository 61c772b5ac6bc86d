//! CSV materialization for data-aggregation tasks.
//!
//! RFC 4180 quoting via the csv crate, LF line endings, UTF-8. Column
//! order: `name`, `unique_identifier`, the alphabetically sorted attribute
//! union, then `source_tasks`, `confidence_score`, `updated_at`.

use std::collections::BTreeSet;

use chrono::Utc;
use sha2::{Digest, Sha256};

use crate::config::NexusConfig;
use crate::error::CoreError;
use crate::model::{new_id, AggregatedEntity, Task};
use crate::store::{Artifact, Store};

/// Alphabetical union of attribute keys across entities.
pub fn attribute_columns(entities: &[AggregatedEntity]) -> Vec<String> {
    let set: BTreeSet<&str> = entities
        .iter()
        .flat_map(|e| e.attributes.keys().map(String::as_str))
        .collect();
    set.into_iter().map(String::from).collect()
}

/// Render the entity table. Rows come out in the caller's entity order
/// (the store lists by name for stable exports).
pub fn render_csv(entities: &[AggregatedEntity]) -> Result<Vec<u8>, CoreError> {
    let attributes = attribute_columns(entities);

    let mut writer = csv::WriterBuilder::new()
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(Vec::new());

    let mut header: Vec<String> = vec!["name".into(), "unique_identifier".into()];
    header.extend(attributes.iter().cloned());
    header.extend([
        "source_tasks".to_string(),
        "confidence_score".to_string(),
        "updated_at".to_string(),
    ]);
    writer
        .write_record(&header)
        .map_err(|e| CoreError::Store(format!("csv write failed: {e}")))?;

    for entity in entities {
        let mut record: Vec<String> = vec![
            entity.name.clone(),
            entity.unique_identifier.clone().unwrap_or_default(),
        ];
        for attribute in &attributes {
            record.push(entity.attributes.get(attribute).cloned().unwrap_or_default());
        }
        record.push(entity.source_tasks.join(";"));
        record.push(format!("{:.4}", entity.confidence_score));
        record.push(entity.updated_at.to_rfc3339());
        writer
            .write_record(&record)
            .map_err(|e| CoreError::Store(format!("csv write failed: {e}")))?;
    }

    writer
        .into_inner()
        .map_err(|e| CoreError::Store(format!("csv flush failed: {e}")))
}

/// Write the CSV under `storage/{task_id}/{artifact_uuid}.csv` and record
/// the artifact row (path, checksum, size).
pub async fn export_entities_csv(
    store: &Store,
    config: &NexusConfig,
    task: &Task,
    entities: &[AggregatedEntity],
) -> Result<Artifact, CoreError> {
    let bytes = render_csv(entities)?;

    let artifact_id = new_id();
    let dir = config.storage_root.join(&task.id);
    let path = dir.join(format!("{artifact_id}.csv"));
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|e| CoreError::Store(format!("failed to create {}: {e}", dir.display())))?;
    tokio::fs::write(&path, &bytes)
        .await
        .map_err(|e| CoreError::Store(format!("failed to write {}: {e}", path.display())))?;

    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let artifact = Artifact {
        id: artifact_id,
        task_id: task.id.clone(),
        path: path.display().to_string(),
        checksum: format!("{:x}", hasher.finalize()),
        size_bytes: bytes.len() as i64,
        content_type: "text/csv".to_string(),
        created_at: Utc::now(),
    };
    store.insert_artifact(&artifact).await?;
    Ok(artifact)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AttributeLineage;
    use std::collections::BTreeMap;

    fn entity(name: &str, identifier: Option<&str>, attrs: &[(&str, &str)]) -> AggregatedEntity {
        let now = chrono::Utc::now();
        AggregatedEntity {
            id: new_id(),
            scope_id: "task-1".into(),
            entity_type: "private schools".into(),
            name: name.into(),
            unique_identifier: identifier.map(String::from),
            attributes: attrs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            lineage: BTreeMap::from([(
                "address".to_string(),
                AttributeLineage { sources: vec![] },
            )]),
            source_tasks: vec!["task-1".into(), "task-2".into()],
            confidence_score: 0.75,
            consolidated_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_header_layout_and_quoting() {
        let entities = vec![
            entity(
                "Oak School",
                Some("CA-1"),
                &[
                    ("website", "https://oak"),
                    ("address", "1 Main St, Suite 2"),
                    ("enrollment", "420"),
                    ("tuition", "12000"),
                ],
            ),
            entity("Pine Academy", None, &[("address", "9 Hill Rd")]),
        ];

        let bytes = render_csv(&entities).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        let mut lines = text.lines();

        let header = lines.next().unwrap();
        assert_eq!(
            header,
            "name,unique_identifier,address,enrollment,tuition,website,source_tasks,confidence_score,updated_at"
        );

        let first = lines.next().unwrap();
        // Comma inside the address forces quoting.
        assert!(first.contains("\"1 Main St, Suite 2\""));
        assert!(first.contains("task-1;task-2"));
        assert!(first.contains("0.7500"));

        let second = lines.next().unwrap();
        assert!(second.starts_with("Pine Academy,,9 Hill Rd,,,"));
        assert!(!text.contains('\r'));
    }

    #[tokio::test]
    async fn test_export_records_artifact() {
        let store = Store::in_memory().await.unwrap();
        let task = crate::model::Task::new(
            "t",
            "q",
            crate::model::ResearchType::AnalyticalReport,
        );
        store.insert_task(&task).await.unwrap();

        let tmp = tempfile::tempdir().unwrap();
        let mut config = NexusConfig::default();
        config.storage_root = tmp.path().to_path_buf();

        let entities = vec![entity("Oak", None, &[("address", "1 Main")])];
        let artifact = export_entities_csv(&store, &config, &task, &entities)
            .await
            .unwrap();

        assert!(artifact.path.ends_with(".csv"));
        assert!(artifact.size_bytes > 0);
        assert_eq!(artifact.checksum.len(), 64);

        let on_disk = std::fs::read(&artifact.path).unwrap();
        assert_eq!(on_disk.len() as i64, artifact.size_bytes);

        let listed = store.list_artifacts(&task.id).await.unwrap();
        assert_eq!(listed.len(), 1);
    }
}
