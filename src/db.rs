//! SQLite pool for the knowledge store.

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::time::Duration;

use crate::config::KnowledgeConfig;

fn options(path: &Path) -> SqliteConnectOptions {
    SqliteConnectOptions::new()
        .filename(path)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5))
}

async fn pool(options: SqliteConnectOptions, path: &Path) -> Result<SqlitePool> {
    SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .with_context(|| format!("Failed to open knowledge store at {}", path.display()))
}

/// Open (creating if needed) the knowledge database in WAL mode.
///
/// Connections wait up to five seconds on a concurrent writer before
/// reporting `SQLITE_BUSY`.
pub async fn connect(config: &KnowledgeConfig) -> Result<SqlitePool> {
    let path = &config.path;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    pool(options(path).create_if_missing(true), path).await
}

/// Open an existing knowledge database. Fails instead of creating a
/// missing file.
pub async fn connect_existing(config: &KnowledgeConfig) -> Result<SqlitePool> {
    pool(options(&config.path).create_if_missing(false), &config.path).await
}

/// Whether `maint init` has created the schema on this pool.
pub async fn is_initialized(pool: &SqlitePool) -> Result<bool> {
    let found: Option<String> = sqlx::query_scalar(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'knowledge_documents'",
    )
    .fetch_optional(pool)
    .await?;
    Ok(found.is_some())
}
