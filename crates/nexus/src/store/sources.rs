//! Content-addressed sources, shared across tasks.

use sqlx::FromRow;

use super::{parse_ts, Store, StoreError, StoreResult};
use crate::model::{Source, SourceId, TaskId};

impl Store {
    /// Upsert a source by `(url, content_hash)` and link it to the task.
    ///
    /// Repeated observations of the same content move the reliability score
    /// by an exponential moving average; with a fixed observation value the
    /// score is monotone toward that value. Returns the canonical source id.
    pub async fn upsert_source(
        &self,
        source: &Source,
        task_id: &TaskId,
        subtopic_index: usize,
        reliability_alpha: f64,
    ) -> StoreResult<SourceId> {
        let mut tx = self.pool().begin().await?;

        let existing: Option<(String, f64, i64)> = sqlx::query_as(
            "SELECT id, reliability_score, observation_count FROM sources
             WHERE url = ? AND content_hash = ?",
        )
        .bind(&source.url)
        .bind(&source.content_hash)
        .fetch_optional(&mut *tx)
        .await?;

        let source_id = match existing {
            Some((id, score, observations)) => {
                let updated = score + reliability_alpha * (source.reliability_score - score);
                sqlx::query(
                    "UPDATE sources SET reliability_score = ?, observation_count = ?, accessed_at = ?
                     WHERE id = ?",
                )
                .bind(updated)
                .bind(observations + 1)
                .bind(source.accessed_at.to_rfc3339())
                .bind(&id)
                .execute(&mut *tx)
                .await?;
                id
            }
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO sources (
                        id, url, title, description, provider, accessed_at,
                        reliability_score, content_hash, observation_count
                    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, 1)
                    "#,
                )
                .bind(&source.id)
                .bind(&source.url)
                .bind(&source.title)
                .bind(&source.description)
                .bind(source.provider.as_str())
                .bind(source.accessed_at.to_rfc3339())
                .bind(source.reliability_score)
                .bind(&source.content_hash)
                .execute(&mut *tx)
                .await?;
                source.id.clone()
            }
        };

        sqlx::query(
            "INSERT OR IGNORE INTO task_sources (task_id, source_id, subtopic_index) VALUES (?, ?, ?)",
        )
        .bind(task_id)
        .bind(&source_id)
        .bind(subtopic_index as i64)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(source_id)
    }

    pub async fn get_source(&self, source_id: &str) -> StoreResult<Option<Source>> {
        let row: Option<SourceRow> = sqlx::query_as("SELECT * FROM sources WHERE id = ?")
            .bind(source_id)
            .fetch_optional(self.pool())
            .await?;

        row.map(SourceRow::into_source).transpose()
    }

    /// Sources linked to a task, in link insertion order.
    pub async fn list_task_sources(&self, task_id: &str) -> StoreResult<Vec<(Source, usize)>> {
        let rows: Vec<SourceLinkRow> = sqlx::query_as(
            r#"
            SELECT s.id, s.url, s.title, s.description, s.provider, s.accessed_at,
                   s.reliability_score, s.content_hash, s.observation_count,
                   ts.subtopic_index
            FROM task_sources ts
            JOIN sources s ON s.id = ts.source_id
            WHERE ts.task_id = ?
            ORDER BY ts.rowid
            "#,
        )
        .bind(task_id)
        .fetch_all(self.pool())
        .await?;

        rows.into_iter()
            .map(|row| {
                let subtopic_index = row.subtopic_index as usize;
                row.source.into_source().map(|s| (s, subtopic_index))
            })
            .collect()
    }
}

#[derive(Debug, FromRow)]
struct SourceRow {
    id: String,
    url: String,
    title: String,
    description: String,
    provider: String,
    accessed_at: String,
    reliability_score: f64,
    content_hash: String,
    #[allow(dead_code)]
    observation_count: i64,
}

impl SourceRow {
    fn into_source(self) -> StoreResult<Source> {
        let provider = self
            .provider
            .parse()
            .map_err(|_| StoreError::InvalidData(format!("bad provider {}", self.provider)))?;

        Ok(Source {
            id: self.id,
            url: self.url,
            title: self.title,
            description: self.description,
            provider,
            accessed_at: parse_ts(&self.accessed_at)?,
            reliability_score: self.reliability_score,
            content_hash: self.content_hash,
        })
    }
}

#[derive(Debug, FromRow)]
struct SourceLinkRow {
    #[sqlx(flatten)]
    source: SourceRow,
    subtopic_index: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ProviderId, ResearchType, Task};

    #[tokio::test]
    async fn test_dedupe_by_url_and_hash() {
        let store = Store::in_memory().await.unwrap();
        let task = Task::new("t", "q", ResearchType::AnalyticalReport);
        store.insert_task(&task).await.unwrap();

        let source = Source::new("https://a.example/x", "Title", "Body", ProviderId::Exa);
        let first = store
            .upsert_source(&source, &task.id, 0, 0.3)
            .await
            .unwrap();

        let duplicate = Source::new("https://a.example/x", "Title", "Body", ProviderId::Linkup);
        let second = store
            .upsert_source(&duplicate, &task.id, 1, 0.3)
            .await
            .unwrap();
        assert_eq!(first, second);

        let sources = store.list_task_sources(&task.id).await.unwrap();
        assert_eq!(sources.len(), 1);

        // Different content at the same URL is a distinct source.
        let changed = Source::new("https://a.example/x", "Title", "Other body", ProviderId::Exa);
        let third = store
            .upsert_source(&changed, &task.id, 0, 0.3)
            .await
            .unwrap();
        assert_ne!(first, third);
        assert_eq!(store.list_task_sources(&task.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_reliability_moves_monotonically_toward_observation() {
        let store = Store::in_memory().await.unwrap();
        let task = Task::new("t", "q", ResearchType::AnalyticalReport);
        store.insert_task(&task).await.unwrap();

        let mut source = Source::new("https://b.example", "T", "B", ProviderId::Exa);
        source.reliability_score = 0.5;
        let id = store
            .upsert_source(&source, &task.id, 0, 0.3)
            .await
            .unwrap();

        let mut last = store.get_source(&id).await.unwrap().unwrap().reliability_score;
        source.reliability_score = 0.9;
        for _ in 0..3 {
            store.upsert_source(&source, &task.id, 0, 0.3).await.unwrap();
            let next = store.get_source(&id).await.unwrap().unwrap().reliability_score;
            assert!(next >= last);
            assert!(next <= 0.9);
            last = next;
        }
    }
}
