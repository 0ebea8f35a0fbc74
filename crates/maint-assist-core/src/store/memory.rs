//! In-memory [`KnowledgeStore`] implementation for tests and all-in-one runs.
//!
//! Uses a `HashMap` behind a `parking_lot::RwLock`. Vector search is
//! brute-force cosine distance over all stored vectors.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::embedding::cosine_distance;
use crate::error::AdapterError;
use crate::models::{KnowledgeDocument, MetadataFilter, Neighbor};

use super::{rank_neighbors, KnowledgeStore};

/// In-memory knowledge store.
pub struct InMemoryKnowledgeStore {
    docs: RwLock<HashMap<String, KnowledgeDocument>>,
    available: AtomicBool,
}

impl InMemoryKnowledgeStore {
    pub fn new() -> Self {
        Self {
            docs: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Toggle availability, simulating an uninitialized store.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Snapshot of a stored document.
    pub fn get(&self, id: &str) -> Option<KnowledgeDocument> {
        self.docs.read().get(id).cloned()
    }

    fn check(&self) -> Result<(), AdapterError> {
        if self.is_available() {
            Ok(())
        } else {
            Err(AdapterError::unavailable("in-memory knowledge store disabled"))
        }
    }
}

impl Default for InMemoryKnowledgeStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KnowledgeStore for InMemoryKnowledgeStore {
    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn upsert(&self, doc: &KnowledgeDocument) -> Result<(), AdapterError> {
        self.check()?;
        self.docs.write().insert(doc.id.clone(), doc.clone());
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool, AdapterError> {
        self.check()?;
        Ok(self.docs.write().remove(id).is_some())
    }

    async fn contains(&self, id: &str) -> Result<bool, AdapterError> {
        self.check()?;
        Ok(self.docs.read().contains_key(id))
    }

    async fn query(
        &self,
        vector: &[f32],
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<Neighbor>, AdapterError> {
        self.check()?;
        let docs = self.docs.read();
        let neighbors: Vec<Neighbor> = docs
            .values()
            .filter(|d| d.embedding.len() == vector.len())
            .filter(|d| filter.map_or(true, |f| f.matches(&d.metadata)))
            .map(|d| Neighbor {
                id: d.id.clone(),
                text: d.text.clone(),
                metadata: d.metadata.clone(),
                distance: cosine_distance(vector, &d.embedding),
            })
            .collect();
        Ok(rank_neighbors(neighbors, k))
    }

    async fn count(&self, filter: Option<&MetadataFilter>) -> Result<u64, AdapterError> {
        self.check()?;
        let docs = self.docs.read();
        Ok(docs
            .values()
            .filter(|d| filter.map_or(true, |f| f.matches(&d.metadata)))
            .count() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{interventions_only, Metadata};
    use serde_json::json;

    fn doc(id: &str, kind: &str, embedding: Vec<f32>) -> KnowledgeDocument {
        let mut metadata = Metadata::new();
        metadata.insert("type".into(), json!(kind));
        metadata.insert("source".into(), json!(id));
        KnowledgeDocument {
            id: id.to_string(),
            text: format!("text of {}", id),
            metadata,
            embedding,
        }
    }

    #[tokio::test]
    async fn test_upsert_replaces_vector_and_metadata_together() {
        let store = InMemoryKnowledgeStore::new();
        store.upsert(&doc("a", "intervention", vec![1.0, 0.0])).await.unwrap();
        store.upsert(&doc("a", "manual", vec![0.0, 1.0])).await.unwrap();

        assert_eq!(store.count(None).await.unwrap(), 1);
        let stored = store.get("a").unwrap();
        assert_eq!(stored.embedding, vec![0.0, 1.0]);
        assert_eq!(stored.metadata["type"], json!("manual"));
    }

    #[tokio::test]
    async fn test_query_orders_by_ascending_distance() {
        let store = InMemoryKnowledgeStore::new();
        store.upsert(&doc("far", "intervention", vec![0.0, 1.0])).await.unwrap();
        store.upsert(&doc("near", "intervention", vec![1.0, 0.1])).await.unwrap();
        store.upsert(&doc("mid", "intervention", vec![1.0, 1.0])).await.unwrap();

        let hits = store.query(&[1.0, 0.0], 10, None).await.unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["near", "mid", "far"]);
        assert!(hits.windows(2).all(|w| w[0].distance <= w[1].distance));
    }

    #[tokio::test]
    async fn test_query_respects_k_filter_and_dims() {
        let store = InMemoryKnowledgeStore::new();
        store.upsert(&doc("i1", "intervention", vec![1.0, 0.0])).await.unwrap();
        store.upsert(&doc("m1", "manual", vec![1.0, 0.0])).await.unwrap();
        store.upsert(&doc("odd", "intervention", vec![1.0, 0.0, 0.0])).await.unwrap();

        let hits = store
            .query(&[1.0, 0.0], 10, Some(&interventions_only()))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "i1");

        let hits = store.query(&[1.0, 0.0], 1, None).await.unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_and_count() {
        let store = InMemoryKnowledgeStore::new();
        store.upsert(&doc("i1", "intervention", vec![1.0])).await.unwrap();
        store.upsert(&doc("m1", "manual", vec![1.0])).await.unwrap();

        assert_eq!(store.count(Some(&interventions_only())).await.unwrap(), 1);
        assert!(store.delete("i1").await.unwrap());
        assert!(!store.delete("i1").await.unwrap());
        assert!(!store.contains("i1").await.unwrap());
        assert_eq!(store.count(None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_disabled_store_refuses_operations() {
        let store = InMemoryKnowledgeStore::new();
        store.set_available(false);
        assert!(!store.is_available());
        assert!(store.query(&[1.0], 5, None).await.unwrap_err().is_unavailable());
    }
}
