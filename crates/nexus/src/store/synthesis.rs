//! Persistence for DOK synthesis artifacts: summaries, the knowledge
//! forest, insights, spiky POVs, and the final report.

use sqlx::FromRow;

use super::{parse_ts, Store, StoreError, StoreResult};
use crate::model::{Insight, KnowledgeNode, PovKind, SourceSummary, SpikyPov};

/// Aggregate DOK view for a task.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct DokStats {
    pub total_sources: i64,
    pub total_summaries: i64,
    pub total_facts: i64,
    pub total_nodes: i64,
    pub total_insights: i64,
    pub total_truths: i64,
    pub total_myths: i64,
}

impl Store {
    pub async fn append_source_summary(&self, summary: &SourceSummary) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO source_summaries (
                id, source_id, task_id, subtopic, subtopic_index, summary,
                dok1_facts, dok_level, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&summary.id)
        .bind(&summary.source_id)
        .bind(&summary.task_id)
        .bind(&summary.subtopic)
        .bind(summary.subtopic_index as i64)
        .bind(&summary.summary)
        .bind(serde_json::to_string(&summary.dok1_facts)?)
        .bind(summary.dok_level as i64)
        .bind(summary.created_at.to_rfc3339())
        .execute(self.pool())
        .await?;

        Ok(())
    }

    pub async fn list_source_summaries(&self, task_id: &str) -> StoreResult<Vec<SourceSummary>> {
        let rows: Vec<SummaryRow> = sqlx::query_as(
            "SELECT * FROM source_summaries WHERE task_id = ? ORDER BY subtopic_index, rowid",
        )
        .bind(task_id)
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(SummaryRow::into_summary).collect()
    }

    /// Persist a validated forest in one transaction, source links included.
    pub async fn append_knowledge_nodes(&self, nodes: &[KnowledgeNode]) -> StoreResult<()> {
        let mut tx = self.pool().begin().await?;

        for node in nodes {
            sqlx::query(
                r#"
                INSERT INTO knowledge_nodes (
                    id, task_id, parent_id, category, subcategory, summary, dok_level, position
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&node.id)
            .bind(&node.task_id)
            .bind(&node.parent_id)
            .bind(&node.category)
            .bind(&node.subcategory)
            .bind(&node.summary)
            .bind(node.dok_level as i64)
            .bind(node.position)
            .execute(&mut *tx)
            .await?;

            for (source_id, relevance) in &node.source_links {
                sqlx::query(
                    "INSERT OR IGNORE INTO knowledge_node_sources (node_id, source_id, relevance)
                     VALUES (?, ?, ?)",
                )
                .bind(&node.id)
                .bind(source_id)
                .bind(relevance)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    /// Nodes in insertion order (stable for rebuild and display).
    pub async fn list_knowledge_nodes(&self, task_id: &str) -> StoreResult<Vec<KnowledgeNode>> {
        let rows: Vec<NodeRow> =
            sqlx::query_as("SELECT * FROM knowledge_nodes WHERE task_id = ? ORDER BY position")
                .bind(task_id)
                .fetch_all(self.pool())
                .await?;

        let links: Vec<(String, String, f64)> = sqlx::query_as(
            r#"
            SELECT kns.node_id, kns.source_id, kns.relevance
            FROM knowledge_node_sources kns
            JOIN knowledge_nodes kn ON kn.id = kns.node_id
            WHERE kn.task_id = ?
            ORDER BY kns.rowid
            "#,
        )
        .bind(task_id)
        .fetch_all(self.pool())
        .await?;

        let mut by_node: std::collections::HashMap<String, Vec<(String, f64)>> =
            std::collections::HashMap::new();
        for (node_id, source_id, relevance) in links {
            by_node.entry(node_id).or_default().push((source_id, relevance));
        }

        Ok(rows
            .into_iter()
            .map(|row| {
                let source_links = by_node.remove(&row.id).unwrap_or_default();
                row.into_node(source_links)
            })
            .collect())
    }

    pub async fn append_insight(&self, insight: &Insight) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO insights (id, task_id, category, insight_text, confidence, source_ids, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&insight.id)
        .bind(&insight.task_id)
        .bind(&insight.category)
        .bind(&insight.insight_text)
        .bind(insight.confidence)
        .bind(serde_json::to_string(&insight.source_ids)?)
        .bind(insight.created_at.to_rfc3339())
        .execute(self.pool())
        .await?;

        Ok(())
    }

    pub async fn list_insights(&self, task_id: &str) -> StoreResult<Vec<Insight>> {
        let rows: Vec<InsightRow> =
            sqlx::query_as("SELECT * FROM insights WHERE task_id = ? ORDER BY created_at, rowid")
                .bind(task_id)
                .fetch_all(self.pool())
                .await?;

        rows.into_iter().map(InsightRow::into_insight).collect()
    }

    pub async fn append_spiky_pov(&self, pov: &SpikyPov) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO spiky_povs (id, task_id, kind, statement, reasoning, insight_ids, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&pov.id)
        .bind(&pov.task_id)
        .bind(pov.kind.to_string())
        .bind(&pov.statement)
        .bind(&pov.reasoning)
        .bind(serde_json::to_string(&pov.insight_ids)?)
        .bind(pov.created_at.to_rfc3339())
        .execute(self.pool())
        .await?;

        Ok(())
    }

    pub async fn list_spiky_povs(&self, task_id: &str) -> StoreResult<Vec<SpikyPov>> {
        let rows: Vec<PovRow> =
            sqlx::query_as("SELECT * FROM spiky_povs WHERE task_id = ? ORDER BY created_at, rowid")
                .bind(task_id)
                .fetch_all(self.pool())
                .await?;

        rows.into_iter().map(PovRow::into_pov).collect()
    }

    /// Persist the report and its section→source map in one transaction.
    pub async fn insert_report(
        &self,
        report_id: &str,
        task_id: &str,
        markdown: &str,
        section_sources: &[(String, String)],
    ) -> StoreResult<()> {
        let mut tx = self.pool().begin().await?;

        sqlx::query("INSERT INTO reports (id, task_id, markdown, created_at) VALUES (?, ?, ?, ?)")
            .bind(report_id)
            .bind(task_id)
            .bind(markdown)
            .bind(chrono::Utc::now().to_rfc3339())
            .execute(&mut *tx)
            .await?;

        for (section, source_id) in section_sources {
            sqlx::query(
                "INSERT OR IGNORE INTO report_section_sources (report_id, section, source_id)
                 VALUES (?, ?, ?)",
            )
            .bind(report_id)
            .bind(section)
            .bind(source_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn get_report(&self, task_id: &str) -> StoreResult<Option<String>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT markdown FROM reports WHERE task_id = ?")
                .bind(task_id)
                .fetch_optional(self.pool())
                .await?;
        Ok(row.map(|(markdown,)| markdown))
    }

    pub async fn list_report_section_sources(
        &self,
        task_id: &str,
    ) -> StoreResult<Vec<(String, String)>> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT rss.section, rss.source_id
            FROM report_section_sources rss
            JOIN reports r ON r.id = rss.report_id
            WHERE r.task_id = ?
            ORDER BY rss.rowid
            "#,
        )
        .bind(task_id)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    pub async fn dok_stats(&self, task_id: &str) -> StoreResult<DokStats> {
        let summaries = self.list_source_summaries(task_id).await?;
        let total_facts = summaries.iter().map(|s| s.dok1_facts.len() as i64).sum();

        let (total_sources,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM task_sources WHERE task_id = ?")
                .bind(task_id)
                .fetch_one(self.pool())
                .await?;
        let (total_nodes,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM knowledge_nodes WHERE task_id = ?")
                .bind(task_id)
                .fetch_one(self.pool())
                .await?;
        let (total_insights,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM insights WHERE task_id = ?")
                .bind(task_id)
                .fetch_one(self.pool())
                .await?;
        let (total_truths,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM spiky_povs WHERE task_id = ? AND kind = 'truth'")
                .bind(task_id)
                .fetch_one(self.pool())
                .await?;
        let (total_myths,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM spiky_povs WHERE task_id = ? AND kind = 'myth'")
                .bind(task_id)
                .fetch_one(self.pool())
                .await?;

        Ok(DokStats {
            total_sources,
            total_summaries: summaries.len() as i64,
            total_facts,
            total_nodes,
            total_insights,
            total_truths,
            total_myths,
        })
    }
}

#[derive(Debug, FromRow)]
struct SummaryRow {
    id: String,
    source_id: String,
    task_id: String,
    subtopic: String,
    subtopic_index: i64,
    summary: String,
    dok1_facts: String,
    dok_level: i64,
    created_at: String,
}

impl SummaryRow {
    fn into_summary(self) -> StoreResult<SourceSummary> {
        Ok(SourceSummary {
            id: self.id,
            source_id: self.source_id,
            task_id: self.task_id,
            subtopic: self.subtopic,
            subtopic_index: self.subtopic_index as usize,
            summary: self.summary,
            dok1_facts: serde_json::from_str(&self.dok1_facts)?,
            dok_level: self.dok_level as u8,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

#[derive(Debug, FromRow)]
struct NodeRow {
    id: String,
    task_id: String,
    parent_id: Option<String>,
    category: String,
    subcategory: Option<String>,
    summary: String,
    dok_level: i64,
    position: i64,
}

impl NodeRow {
    fn into_node(self, source_links: Vec<(String, f64)>) -> KnowledgeNode {
        KnowledgeNode {
            id: self.id,
            task_id: self.task_id,
            parent_id: self.parent_id,
            category: self.category,
            subcategory: self.subcategory,
            summary: self.summary,
            dok_level: self.dok_level as u8,
            position: self.position,
            source_links,
        }
    }
}

#[derive(Debug, FromRow)]
struct InsightRow {
    id: String,
    task_id: String,
    category: String,
    insight_text: String,
    confidence: f64,
    source_ids: String,
    created_at: String,
}

impl InsightRow {
    fn into_insight(self) -> StoreResult<Insight> {
        Ok(Insight {
            id: self.id,
            task_id: self.task_id,
            category: self.category,
            insight_text: self.insight_text,
            confidence: self.confidence,
            source_ids: serde_json::from_str(&self.source_ids)?,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

#[derive(Debug, FromRow)]
struct PovRow {
    id: String,
    task_id: String,
    kind: String,
    statement: String,
    reasoning: String,
    insight_ids: String,
    created_at: String,
}

impl PovRow {
    fn into_pov(self) -> StoreResult<SpikyPov> {
        let kind: PovKind = self
            .kind
            .parse()
            .map_err(|_| StoreError::InvalidData(format!("bad pov kind {}", self.kind)))?;

        Ok(SpikyPov {
            id: self.id,
            task_id: self.task_id,
            kind,
            statement: self.statement,
            reasoning: self.reasoning,
            insight_ids: serde_json::from_str(&self.insight_ids)?,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{new_id, ProviderId, ResearchType, Source, Task};
    use chrono::Utc;

    #[tokio::test]
    async fn test_dok_round_trip_and_stats() {
        let store = Store::in_memory().await.unwrap();
        let task = Task::new("t", "q", ResearchType::AnalyticalReport);
        store.insert_task(&task).await.unwrap();

        let source = Source::new("https://s.example", "T", "B", ProviderId::Perplexity);
        let source_id = store
            .upsert_source(&source, &task.id, 0, 0.3)
            .await
            .unwrap();

        store
            .append_source_summary(&SourceSummary {
                id: new_id(),
                source_id: source_id.clone(),
                task_id: task.id.clone(),
                subtopic: "testing".into(),
                subtopic_index: 0,
                summary: "A summary.".into(),
                dok1_facts: vec!["fact one".into(), "fact two".into()],
                dok_level: 1,
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        let root_id = new_id();
        store
            .append_knowledge_nodes(&[
                KnowledgeNode {
                    id: root_id.clone(),
                    task_id: task.id.clone(),
                    parent_id: None,
                    category: "Tooling".into(),
                    subcategory: None,
                    summary: "Root".into(),
                    dok_level: 2,
                    position: 0,
                    source_links: vec![],
                },
                KnowledgeNode {
                    id: new_id(),
                    task_id: task.id.clone(),
                    parent_id: Some(root_id.clone()),
                    category: "Tooling".into(),
                    subcategory: Some("CI".into()),
                    summary: "Leaf".into(),
                    dok_level: 1,
                    position: 1,
                    source_links: vec![(source_id.clone(), 0.9)],
                },
            ])
            .await
            .unwrap();

        let insight = Insight {
            id: new_id(),
            task_id: task.id.clone(),
            category: "Tooling".into(),
            insight_text: "Testing shifts left.".into(),
            confidence: 0.8,
            source_ids: vec![source_id.clone()],
            created_at: Utc::now(),
        };
        store.append_insight(&insight).await.unwrap();

        store
            .append_spiky_pov(&SpikyPov {
                id: new_id(),
                task_id: task.id.clone(),
                kind: PovKind::Truth,
                statement: "Agents test better.".into(),
                reasoning: "Because.".into(),
                insight_ids: vec![insight.id.clone()],
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        let nodes = store.list_knowledge_nodes(&task.id).await.unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[1].source_links.len(), 1);

        let stats = store.dok_stats(&task.id).await.unwrap();
        assert_eq!(stats.total_sources, 1);
        assert_eq!(stats.total_summaries, 1);
        assert_eq!(stats.total_facts, 2);
        assert_eq!(stats.total_nodes, 2);
        assert_eq!(stats.total_insights, 1);
        assert_eq!(stats.total_truths, 1);
        assert_eq!(stats.total_myths, 0);
    }

    #[tokio::test]
    async fn test_report_with_section_sources() {
        let store = Store::in_memory().await.unwrap();
        let task = Task::new("t", "q", ResearchType::AnalyticalReport);
        store.insert_task(&task).await.unwrap();

        store
            .insert_report(
                &new_id(),
                &task.id,
                "# Report\n",
                &[
                    ("key_findings".into(), "src-1".into()),
                    ("evidence_analysis".into(), "src-1".into()),
                ],
            )
            .await
            .unwrap();

        assert!(store.get_report(&task.id).await.unwrap().is_some());
        let sections = store.list_report_section_sources(&task.id).await.unwrap();
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].0, "key_findings");
    }
}
