//! Aggregated entities and exported artifacts.

use chrono::{DateTime, Utc};
use sqlx::FromRow;

use super::{parse_ts, Store, StoreResult};
use crate::model::{AggregatedEntity, ResearchType, Task};

/// A file materialized under the object-store layout
/// `storage/{task_id}/{artifact_uuid}.{ext}`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Artifact {
    pub id: String,
    pub task_id: String,
    pub path: String,
    pub checksum: String,
    pub size_bytes: i64,
    pub content_type: String,
    pub created_at: DateTime<Utc>,
}

impl Store {
    /// Write a consolidated entity, keyed by `(scope, entity_type,
    /// identity_key)`. Re-running with identical inputs rewrites the same
    /// row byte-for-byte: the original row id and scope key survive.
    pub async fn upsert_entity(&self, entity: &AggregatedEntity) -> StoreResult<String> {
        let identity_key = entity.identity_key();
        let attributes = serde_json::to_string(&entity.attributes)?;
        let lineage = serde_json::to_string(&entity.lineage)?;
        let source_tasks = serde_json::to_string(&entity.source_tasks)?;

        let mut tx = self.pool().begin().await?;

        let existing: Option<(String,)> = sqlx::query_as(
            "SELECT id FROM aggregated_entities
             WHERE scope_id = ? AND entity_type = ? AND identity_key = ?",
        )
        .bind(&entity.scope_id)
        .bind(&entity.entity_type)
        .bind(&identity_key)
        .fetch_optional(&mut *tx)
        .await?;

        let entity_id = match existing {
            Some((id,)) => {
                sqlx::query(
                    r#"
                    UPDATE aggregated_entities
                    SET name = ?, unique_identifier = ?, attributes = ?, lineage = ?,
                        source_tasks = ?, confidence_score = ?, consolidated_at = ?, updated_at = ?
                    WHERE id = ?
                    "#,
                )
                .bind(&entity.name)
                .bind(&entity.unique_identifier)
                .bind(&attributes)
                .bind(&lineage)
                .bind(&source_tasks)
                .bind(entity.confidence_score)
                .bind(entity.consolidated_at.to_rfc3339())
                .bind(entity.updated_at.to_rfc3339())
                .bind(&id)
                .execute(&mut *tx)
                .await?;
                id
            }
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO aggregated_entities (
                        id, scope_id, entity_type, name, identity_key, unique_identifier,
                        attributes, lineage, source_tasks, confidence_score,
                        consolidated_at, updated_at
                    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(&entity.id)
                .bind(&entity.scope_id)
                .bind(&entity.entity_type)
                .bind(&entity.name)
                .bind(&identity_key)
                .bind(&entity.unique_identifier)
                .bind(&attributes)
                .bind(&lineage)
                .bind(&source_tasks)
                .bind(entity.confidence_score)
                .bind(entity.consolidated_at.to_rfc3339())
                .bind(entity.updated_at.to_rfc3339())
                .execute(&mut *tx)
                .await?;
                entity.id.clone()
            }
        };

        tx.commit().await?;
        Ok(entity_id)
    }

    /// Entities in a scope, ordered by name for stable exports.
    pub async fn list_entities(
        &self,
        scope_id: &str,
        entity_type: Option<&str>,
    ) -> StoreResult<Vec<AggregatedEntity>> {
        let rows: Vec<EntityRow> = match entity_type {
            Some(entity_type) => {
                sqlx::query_as(
                    "SELECT * FROM aggregated_entities
                     WHERE scope_id = ? AND entity_type = ? ORDER BY name, id",
                )
                .bind(scope_id)
                .bind(entity_type)
                .fetch_all(self.pool())
                .await?
            }
            None => {
                sqlx::query_as(
                    "SELECT * FROM aggregated_entities WHERE scope_id = ? ORDER BY name, id",
                )
                .bind(scope_id)
                .fetch_all(self.pool())
                .await?
            }
        };

        rows.into_iter().map(EntityRow::into_entity).collect()
    }

    /// Aggregation tasks of a project, for cross-task consolidation.
    pub async fn list_project_aggregation_tasks(
        &self,
        project_id: &str,
    ) -> StoreResult<Vec<Task>> {
        Ok(self
            .list_project_tasks(project_id)
            .await?
            .into_iter()
            .filter(|t| t.research_type == ResearchType::DataAggregation)
            .collect())
    }

    pub async fn insert_artifact(&self, artifact: &Artifact) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO artifacts (id, task_id, path, checksum, size_bytes, content_type, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&artifact.id)
        .bind(&artifact.task_id)
        .bind(&artifact.path)
        .bind(&artifact.checksum)
        .bind(artifact.size_bytes)
        .bind(&artifact.content_type)
        .bind(artifact.created_at.to_rfc3339())
        .execute(self.pool())
        .await?;

        Ok(())
    }

    pub async fn list_artifacts(&self, task_id: &str) -> StoreResult<Vec<Artifact>> {
        let rows: Vec<ArtifactRow> =
            sqlx::query_as("SELECT * FROM artifacts WHERE task_id = ? ORDER BY created_at, rowid")
                .bind(task_id)
                .fetch_all(self.pool())
                .await?;

        rows.into_iter().map(ArtifactRow::into_artifact).collect()
    }
}

#[derive(Debug, FromRow)]
struct EntityRow {
    id: String,
    scope_id: String,
    entity_type: String,
    name: String,
    #[allow(dead_code)]
    identity_key: String,
    unique_identifier: Option<String>,
    attributes: String,
    lineage: String,
    source_tasks: String,
    confidence_score: f64,
    consolidated_at: String,
    updated_at: String,
}

impl EntityRow {
    fn into_entity(self) -> StoreResult<AggregatedEntity> {
        Ok(AggregatedEntity {
            id: self.id,
            scope_id: self.scope_id,
            entity_type: self.entity_type,
            name: self.name,
            unique_identifier: self.unique_identifier,
            attributes: serde_json::from_str(&self.attributes)?,
            lineage: serde_json::from_str(&self.lineage)?,
            source_tasks: serde_json::from_str(&self.source_tasks)?,
            confidence_score: self.confidence_score,
            consolidated_at: parse_ts(&self.consolidated_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

#[derive(Debug, FromRow)]
struct ArtifactRow {
    id: String,
    task_id: String,
    path: String,
    checksum: String,
    size_bytes: i64,
    content_type: String,
    created_at: String,
}

impl ArtifactRow {
    fn into_artifact(self) -> StoreResult<Artifact> {
        Ok(Artifact {
            id: self.id,
            task_id: self.task_id,
            path: self.path,
            checksum: self.checksum,
            size_bytes: self.size_bytes,
            content_type: self.content_type,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}
