//! Schema creation. Tables are created idempotently at open time; every
//! task-owned table cascades on task deletion.

use sqlx::{Pool, Sqlite};

use super::StoreResult;

pub(super) async fn create_schema(pool: &Pool<Sqlite>) -> StoreResult<()> {
    let statements = [
        r#"
        CREATE TABLE IF NOT EXISTS tasks (
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            research_query TEXT NOT NULL,
            research_type TEXT NOT NULL,
            status TEXT NOT NULL,
            project_id TEXT,
            aggregation_config TEXT,
            error_message TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            completed_at TEXT
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS operations (
            id TEXT PRIMARY KEY,
            task_id TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
            parent_id TEXT,
            operation_type TEXT NOT NULL,
            agent_type TEXT NOT NULL,
            queue TEXT NOT NULL,
            priority INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL,
            retry_count INTEGER NOT NULL DEFAULT 0,
            input_data TEXT NOT NULL,
            output_data TEXT,
            error_message TEXT,
            error_kind TEXT,
            created_at TEXT NOT NULL,
            started_at TEXT,
            completed_at TEXT,
            duration_ms INTEGER
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS evidence (
            id TEXT PRIMARY KEY,
            operation_id TEXT NOT NULL REFERENCES operations(id) ON DELETE CASCADE,
            task_id TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
            evidence_type TEXT NOT NULL,
            evidence_data TEXT NOT NULL,
            source_url TEXT,
            provider TEXT,
            size_bytes INTEGER NOT NULL,
            created_at TEXT NOT NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS sources (
            id TEXT PRIMARY KEY,
            url TEXT NOT NULL,
            title TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            provider TEXT NOT NULL,
            accessed_at TEXT NOT NULL,
            reliability_score REAL NOT NULL,
            content_hash TEXT NOT NULL,
            observation_count INTEGER NOT NULL DEFAULT 1,
            UNIQUE(url, content_hash)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS task_sources (
            task_id TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
            source_id TEXT NOT NULL REFERENCES sources(id),
            subtopic_index INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (task_id, source_id)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS source_summaries (
            id TEXT PRIMARY KEY,
            source_id TEXT NOT NULL REFERENCES sources(id),
            task_id TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
            subtopic TEXT NOT NULL,
            subtopic_index INTEGER NOT NULL DEFAULT 0,
            summary TEXT NOT NULL,
            dok1_facts TEXT NOT NULL,
            dok_level INTEGER NOT NULL,
            created_at TEXT NOT NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS knowledge_nodes (
            id TEXT PRIMARY KEY,
            task_id TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
            parent_id TEXT,
            category TEXT NOT NULL,
            subcategory TEXT,
            summary TEXT NOT NULL,
            dok_level INTEGER NOT NULL,
            position INTEGER NOT NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS knowledge_node_sources (
            node_id TEXT NOT NULL REFERENCES knowledge_nodes(id) ON DELETE CASCADE,
            source_id TEXT NOT NULL,
            relevance REAL NOT NULL,
            PRIMARY KEY (node_id, source_id)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS insights (
            id TEXT PRIMARY KEY,
            task_id TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
            category TEXT NOT NULL,
            insight_text TEXT NOT NULL,
            confidence REAL NOT NULL,
            source_ids TEXT NOT NULL,
            created_at TEXT NOT NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS spiky_povs (
            id TEXT PRIMARY KEY,
            task_id TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
            kind TEXT NOT NULL,
            statement TEXT NOT NULL,
            reasoning TEXT NOT NULL,
            insight_ids TEXT NOT NULL,
            created_at TEXT NOT NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS reports (
            id TEXT PRIMARY KEY,
            task_id TEXT NOT NULL UNIQUE REFERENCES tasks(id) ON DELETE CASCADE,
            markdown TEXT NOT NULL,
            created_at TEXT NOT NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS report_section_sources (
            report_id TEXT NOT NULL REFERENCES reports(id) ON DELETE CASCADE,
            section TEXT NOT NULL,
            source_id TEXT NOT NULL,
            PRIMARY KEY (report_id, section, source_id)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS aggregated_entities (
            id TEXT PRIMARY KEY,
            scope_id TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            name TEXT NOT NULL,
            identity_key TEXT NOT NULL,
            unique_identifier TEXT,
            attributes TEXT NOT NULL,
            lineage TEXT NOT NULL,
            source_tasks TEXT NOT NULL,
            confidence_score REAL NOT NULL,
            consolidated_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE(scope_id, entity_type, identity_key)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS artifacts (
            id TEXT PRIMARY KEY,
            task_id TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
            path TEXT NOT NULL,
            checksum TEXT NOT NULL,
            size_bytes INTEGER NOT NULL,
            content_type TEXT NOT NULL,
            created_at TEXT NOT NULL
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_operations_task ON operations(task_id, created_at)",
        "CREATE INDEX IF NOT EXISTS idx_evidence_task ON evidence(task_id, created_at)",
        "CREATE INDEX IF NOT EXISTS idx_evidence_operation ON evidence(operation_id)",
        "CREATE INDEX IF NOT EXISTS idx_summaries_task ON source_summaries(task_id)",
        "CREATE INDEX IF NOT EXISTS idx_nodes_task ON knowledge_nodes(task_id, position)",
        "CREATE INDEX IF NOT EXISTS idx_insights_task ON insights(task_id)",
        "CREATE INDEX IF NOT EXISTS idx_povs_task ON spiky_povs(task_id)",
        "CREATE INDEX IF NOT EXISTS idx_entities_scope ON aggregated_entities(scope_id, entity_type)",
        "CREATE INDEX IF NOT EXISTS idx_tasks_project ON tasks(project_id)",
    ];

    for statement in statements {
        sqlx::query(statement).execute(pool).await?;
    }

    Ok(())
}
