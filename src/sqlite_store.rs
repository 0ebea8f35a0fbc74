//! SQLite-backed [`KnowledgeStore`] implementation.
//!
//! One row per document in `knowledge_documents`: text, metadata JSON, and
//! the embedding as a little-endian f32 BLOB. Upsert is a single
//! `INSERT … ON CONFLICT DO UPDATE`, so vector, text, and metadata are
//! replaced together. Nearest-neighbor search is brute-force cosine
//! distance over rows of matching dimensionality.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use maint_assist_core::embedding::{blob_to_vec, cosine_distance, vec_to_blob};
use maint_assist_core::models::{KnowledgeDocument, Metadata, MetadataFilter, Neighbor};
use maint_assist_core::store::{rank_neighbors, KnowledgeStore};
use maint_assist_core::AdapterError;

use crate::config::KnowledgeConfig;
use crate::{db, migrate};

/// SQLite implementation of the [`KnowledgeStore`] trait.
pub struct SqliteKnowledgeStore {
    pool: SqlitePool,
}

impl SqliteKnowledgeStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect and ensure the schema exists.
    pub async fn open(config: &KnowledgeConfig) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::apply(&pool).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn store_err(err: sqlx::Error) -> AdapterError {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            AdapterError::unavailable(err.to_string())
        }
        other => AdapterError::invalid(other.to_string()),
    }
}

fn parse_metadata(raw: &str) -> Metadata {
    serde_json::from_str(raw).unwrap_or_default()
}

/// `type` is the only filter key pushed down to SQL; the rest is applied
/// to decoded metadata.
fn type_constraint(filter: Option<&MetadataFilter>) -> Option<String> {
    filter
        .and_then(|f| f.value("type"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

#[async_trait]
impl KnowledgeStore for SqliteKnowledgeStore {
    fn is_available(&self) -> bool {
        !self.pool.is_closed()
    }

    async fn upsert(&self, doc: &KnowledgeDocument) -> Result<(), AdapterError> {
        let now = chrono::Utc::now().timestamp();
        let metadata_json = serde_json::to_string(&doc.metadata)?;
        let doc_type = doc.metadata.get("type").and_then(|v| v.as_str());

        sqlx::query(
            r#"
            INSERT INTO knowledge_documents (id, text, metadata_json, doc_type, dims, embedding, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                text = excluded.text,
                metadata_json = excluded.metadata_json,
                doc_type = excluded.doc_type,
                dims = excluded.dims,
                embedding = excluded.embedding,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&doc.id)
        .bind(&doc.text)
        .bind(&metadata_json)
        .bind(doc_type)
        .bind(doc.embedding.len() as i64)
        .bind(vec_to_blob(&doc.embedding))
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool, AdapterError> {
        let result = sqlx::query("DELETE FROM knowledge_documents WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn contains(&self, id: &str) -> Result<bool, AdapterError> {
        let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM knowledge_documents WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(found.is_some())
    }

    async fn query(
        &self,
        vector: &[f32],
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<Neighbor>, AdapterError> {
        let rows = match type_constraint(filter) {
            Some(doc_type) => sqlx::query(
                "SELECT id, text, metadata_json, embedding FROM knowledge_documents WHERE dims = ? AND doc_type = ?",
            )
            .bind(vector.len() as i64)
            .bind(doc_type)
            .fetch_all(&self.pool)
            .await,
            None => sqlx::query(
                "SELECT id, text, metadata_json, embedding FROM knowledge_documents WHERE dims = ?",
            )
            .bind(vector.len() as i64)
            .fetch_all(&self.pool)
            .await,
        }
        .map_err(store_err)?;

        let mut neighbors = Vec::with_capacity(rows.len());
        for row in &rows {
            let metadata = parse_metadata(&row.get::<String, _>("metadata_json"));
            if let Some(f) = filter {
                if !f.matches(&metadata) {
                    continue;
                }
            }
            let blob: Vec<u8> = row.get("embedding");
            let embedding = blob_to_vec(&blob);
            neighbors.push(Neighbor {
                id: row.get("id"),
                text: row.get("text"),
                metadata,
                distance: cosine_distance(vector, &embedding),
            });
        }

        Ok(rank_neighbors(neighbors, k))
    }

    async fn count(&self, filter: Option<&MetadataFilter>) -> Result<u64, AdapterError> {
        let filter = filter.filter(|f| !f.is_empty());
        let Some(f) = filter else {
            let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM knowledge_documents")
                .fetch_one(&self.pool)
                .await
                .map_err(store_err)?;
            return Ok(total as u64);
        };

        let rows = match type_constraint(Some(f)) {
            Some(doc_type) => {
                sqlx::query("SELECT metadata_json FROM knowledge_documents WHERE doc_type = ?")
                    .bind(doc_type)
                    .fetch_all(&self.pool)
                    .await
            }
            None => {
                sqlx::query("SELECT metadata_json FROM knowledge_documents")
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(store_err)?;

        Ok(rows
            .iter()
            .filter(|row| f.matches(&parse_metadata(&row.get::<String, _>("metadata_json"))))
            .count() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maint_assist_core::models::interventions_only;
    use serde_json::json;
    use tempfile::TempDir;

    async fn open_store(tmp: &TempDir) -> SqliteKnowledgeStore {
        let config = KnowledgeConfig {
            path: tmp.path().join("knowledge.sqlite"),
            ..Default::default()
        };
        SqliteKnowledgeStore::open(&config).await.unwrap()
    }

    fn doc(id: &str, kind: &str, source: &str, embedding: Vec<f32>) -> KnowledgeDocument {
        let mut metadata = Metadata::new();
        metadata.insert("type".into(), json!(kind));
        metadata.insert("source".into(), json!(source));
        KnowledgeDocument {
            id: id.to_string(),
            text: format!("text of {}", id),
            metadata,
            embedding,
        }
    }

    #[tokio::test]
    async fn test_upsert_replaces_row() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp).await;

        store.upsert(&doc("a", "intervention", "Intervention_A", vec![1.0, 0.0])).await.unwrap();
        store.upsert(&doc("a", "manual", "manual.pdf", vec![0.0, 1.0])).await.unwrap();

        assert_eq!(store.count(None).await.unwrap(), 1);
        let hits = store.query(&[0.0, 1.0], 5, None).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].distance.abs() < 1e-6);
        assert_eq!(hits[0].metadata["source"], json!("manual.pdf"));
    }

    #[tokio::test]
    async fn test_query_ranks_filters_and_skips_other_dims() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp).await;

        store.upsert(&doc("far", "intervention", "F", vec![0.0, 1.0])).await.unwrap();
        store.upsert(&doc("near", "intervention", "N", vec![1.0, 0.05])).await.unwrap();
        store.upsert(&doc("manual", "manual", "M", vec![1.0, 0.0])).await.unwrap();
        store.upsert(&doc("wide", "intervention", "W", vec![1.0, 0.0, 0.0])).await.unwrap();

        let hits = store.query(&[1.0, 0.0], 10, None).await.unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["manual", "near", "far"]);

        let hits = store
            .query(&[1.0, 0.0], 10, Some(&interventions_only()))
            .await
            .unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["near", "far"]);

        assert_eq!(store.query(&[1.0, 0.0], 1, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_contains_count() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp).await;

        store.upsert(&doc("i1", "intervention", "I1", vec![1.0])).await.unwrap();
        store.upsert(&doc("m1", "manual", "M1", vec![1.0])).await.unwrap();

        assert!(store.contains("i1").await.unwrap());
        assert_eq!(store.count(Some(&interventions_only())).await.unwrap(), 1);
        assert_eq!(
            store
                .count(Some(&MetadataFilter::new().eq("source", "M1")))
                .await
                .unwrap(),
            1
        );
        assert!(store.delete("i1").await.unwrap());
        assert!(!store.delete("i1").await.unwrap());
        assert!(!store.contains("i1").await.unwrap());
        assert_eq!(store.count(None).await.unwrap(), 1);
    }
}
