//! Knowledge store statistics.
//!
//! Used by `maint stats` to confirm that indexing is working: document
//! counts, the intervention share, and when the store last changed.

use anyhow::Result;

use maint_assist_core::models::interventions_only;
use maint_assist_core::store::KnowledgeStore;

use crate::config::Config;
use crate::db;
use crate::sqlite_store::SqliteKnowledgeStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KnowledgeStats {
    pub available: bool,
    pub total_documents: u64,
    pub intervention_documents: u64,
}

/// Count documents. An unavailable store reports zeros.
pub async fn collect(store: &dyn KnowledgeStore) -> KnowledgeStats {
    if !store.is_available() {
        return KnowledgeStats::default();
    }
    let total_documents = store.count(None).await.unwrap_or_else(|e| {
        tracing::warn!(error = %e, "document count failed");
        0
    });
    let intervention_documents = store
        .count(Some(&interventions_only()))
        .await
        .unwrap_or_else(|e| {
            tracing::warn!(error = %e, "intervention count failed");
            0
        });
    KnowledgeStats {
        available: true,
        total_documents,
        intervention_documents,
    }
}

/// Run the stats command against the configured SQLite store and print a
/// summary. A store that `maint init` never created is reported, not
/// created.
pub async fn run_stats(config: &Config) -> Result<()> {
    let path = &config.knowledge.path;

    println!("maint-assist knowledge stats");
    println!("============================");
    println!();
    println!("  Store:          {}", path.display());

    if !path.exists() {
        println!("  Available:      no (not initialized; run `maint init`)");
        println!();
        return Ok(());
    }

    let pool = match db::connect_existing(&config.knowledge).await {
        Ok(pool) => pool,
        Err(e) => {
            println!("  Available:      no ({})", e);
            println!();
            return Ok(());
        }
    };
    if !db::is_initialized(&pool).await? {
        println!("  Available:      no (not initialized; run `maint init`)");
        println!();
        pool.close().await;
        return Ok(());
    }
    let store = SqliteKnowledgeStore::new(pool);

    let stats = collect(&store).await;
    let size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
    let last_update: Option<i64> =
        sqlx::query_scalar("SELECT MAX(updated_at) FROM knowledge_documents")
            .fetch_one(store.pool())
            .await?;

    println!("  Size:           {}", format_bytes(size));
    println!("  Available:      {}", if stats.available { "yes" } else { "no" });
    println!();
    println!("  Documents:      {}", stats.total_documents);
    println!("  Interventions:  {}", stats.intervention_documents);
    println!(
        "  Last update:    {}",
        last_update.map_or_else(|| "never".to_string(), format_ts_relative)
    );
    println!();

    store.pool().close().await;
    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;

    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}
