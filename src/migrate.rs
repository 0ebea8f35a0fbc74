use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::KnowledgeConfig;
use crate::db;

/// Create the knowledge schema on a fresh connection.
pub async fn run_migrations(config: &KnowledgeConfig) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Idempotent schema creation on an existing pool.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS knowledge_documents (
            id TEXT PRIMARY KEY,
            text TEXT NOT NULL,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            doc_type TEXT,
            dims INTEGER NOT NULL,
            embedding BLOB NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_knowledge_documents_type ON knowledge_documents(doc_type)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
