//! Reply cache and per-user conversation history over a [`KvStore`].
//!
//! Both live in the same key-value store under disjoint prefixes:
//!
//! | Namespace | Key | Value |
//! |-----------|-----|-------|
//! | cache | `{prefix}:cache:{sha256(user_id:query)}` | reply JSON |
//! | history | `{prefix}:chat_history:{user_id}` | JSON array of turns |
//! | generation | `{prefix}:knowledge_generation` | integer counter |
//!
//! Every operation degrades instead of failing: an unavailable or erroring
//! store reads as a cache miss / empty history and writes become no-ops.

use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};

use crate::kv::KvStore;
use crate::models::{Reply, Turn};

/// Namespaced access to the reply cache and conversation history.
#[derive(Clone)]
pub struct ConversationStore {
    kv: Arc<dyn KvStore>,
    prefix: String,
    cache_ttl: Duration,
    history_ttl: Duration,
}

/// Stable cache key for a `(user_id, query)` pair.
///
/// `generation` is folded in when cache invalidation on knowledge writes is
/// enabled; `None` reproduces the plain `sha256("{user_id}:{query}")` key.
pub fn cache_key(user_id: &str, query: &str, generation: Option<i64>) -> String {
    let mut hasher = Sha256::new();
    if let Some(g) = generation {
        hasher.update(format!("{}:", g).as_bytes());
    }
    hasher.update(format!("{}:{}", user_id, query).as_bytes());
    hex::encode(hasher.finalize())
}

impl ConversationStore {
    pub fn new(
        kv: Arc<dyn KvStore>,
        prefix: impl Into<String>,
        cache_ttl: Duration,
        history_ttl: Duration,
    ) -> Self {
        Self {
            kv,
            prefix: prefix.into(),
            cache_ttl,
            history_ttl,
        }
    }

    pub fn is_available(&self) -> bool {
        self.kv.is_available()
    }

    fn cache_slot(&self, hashed: &str) -> String {
        format!("{}:cache:{}", self.prefix, hashed)
    }

    fn history_slot(&self, user_id: &str) -> String {
        format!("{}:chat_history:{}", self.prefix, user_id)
    }

    fn generation_slot(&self) -> String {
        format!("{}:knowledge_generation", self.prefix)
    }

    /// Look up a cached reply. Misses on any store failure.
    pub async fn cached_reply(&self, hashed_key: &str) -> Option<Reply> {
        if !self.kv.is_available() {
            return None;
        }
        match self.kv.get(&self.cache_slot(hashed_key)).await {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(reply) => Some(reply),
                Err(e) => {
                    tracing::warn!(error = %e, "discarding undecodable cache entry");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(error = %e, "cache read failed; treating as miss");
                None
            }
        }
    }

    /// Write a reply into the cache with the configured TTL.
    pub async fn cache_reply(&self, hashed_key: &str, reply: &Reply) {
        if !self.kv.is_available() {
            return;
        }
        let raw = match serde_json::to_string(reply) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(error = %e, "reply not serializable; skipping cache write");
                return;
            }
        };
        if let Err(e) = self
            .kv
            .set(&self.cache_slot(hashed_key), &raw, self.cache_ttl)
            .await
        {
            tracing::warn!(error = %e, "cache write failed");
        }
    }

    /// Full stored history for a user, oldest first. Empty on any failure.
    pub async fn history(&self, user_id: &str) -> Vec<Turn> {
        if !self.kv.is_available() {
            return Vec::new();
        }
        match self.kv.get(&self.history_slot(user_id)).await {
            Ok(Some(raw)) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                tracing::warn!(user_id, error = %e, "discarding undecodable history");
                Vec::new()
            }),
            Ok(None) => Vec::new(),
            Err(e) => {
                tracing::warn!(user_id, error = %e, "history read failed; using empty history");
                Vec::new()
            }
        }
    }

    /// Persist a user's full history, renewing its TTL.
    pub async fn save_history(&self, user_id: &str, turns: &[Turn]) {
        if !self.kv.is_available() {
            return;
        }
        let raw = match serde_json::to_string(turns) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(user_id, error = %e, "history not serializable");
                return;
            }
        };
        if let Err(e) = self
            .kv
            .set(&self.history_slot(user_id), &raw, self.history_ttl)
            .await
        {
            tracing::warn!(user_id, error = %e, "history write failed");
        }
    }

    /// Current knowledge generation, or `None` when the store is unavailable.
    pub async fn knowledge_generation(&self) -> Option<i64> {
        if !self.kv.is_available() {
            return None;
        }
        match self.kv.get(&self.generation_slot()).await {
            Ok(Some(raw)) => raw.parse().ok(),
            Ok(None) => Some(0),
            Err(_) => None,
        }
    }

    /// Advance the knowledge generation, orphaning every cached reply keyed
    /// on the previous one.
    pub async fn bump_knowledge_generation(&self) {
        if !self.kv.is_available() {
            return;
        }
        if let Err(e) = self.kv.incr(&self.generation_slot()).await {
            tracing::warn!(error = %e, "knowledge generation bump failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::{InMemoryKv, UnavailableKv};

    fn store(kv: Arc<dyn KvStore>) -> ConversationStore {
        ConversationStore::new(kv, "maint", Duration::from_secs(3600), Duration::from_secs(3600))
    }

    #[test]
    fn test_cache_key_is_stable_and_user_scoped() {
        let a = cache_key("u1", "hello", None);
        assert_eq!(a, cache_key("u1", "hello", None));
        assert_ne!(a, cache_key("u2", "hello", None));
        assert_ne!(a, cache_key("u1", "hello ", None));
        assert_ne!(a, cache_key("u1", "hello", Some(1)));
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_cache_key_matches_plain_sha256() {
        let expected = hex::encode(Sha256::digest(b"u1:hello"));
        assert_eq!(cache_key("u1", "hello", None), expected);
    }

    #[tokio::test]
    async fn test_namespaces_do_not_collide() {
        let kv = Arc::new(InMemoryKv::new());
        let conv = store(kv.clone());

        // A user id equal to a cache hash must not alias the cache slot.
        let hashed = cache_key("u1", "hello", None);
        conv.cache_reply(&hashed, &Reply::message("hi")).await;
        conv.save_history(&hashed, &[Turn::user("x")]).await;

        assert_eq!(conv.cached_reply(&hashed).await, Some(Reply::message("hi")));
        assert_eq!(conv.history(&hashed).await, vec![Turn::user("x")]);
        assert_eq!(kv.keys_with_prefix("maint:cache:").len(), 1);
        assert_eq!(kv.keys_with_prefix("maint:chat_history:").len(), 1);
    }

    #[tokio::test]
    async fn test_history_roundtrip_keeps_all_turns() {
        let conv = store(Arc::new(InMemoryKv::new()));
        let turns: Vec<Turn> = (0..25).map(|i| Turn::user(format!("q{}", i))).collect();
        conv.save_history("u1", &turns).await;
        assert_eq!(conv.history("u1").await.len(), 25);
        assert!(conv.history("u2").await.is_empty());
    }

    #[tokio::test]
    async fn test_unavailable_store_degrades() {
        let conv = store(Arc::new(UnavailableKv));
        conv.cache_reply("k", &Reply::message("hi")).await;
        conv.save_history("u1", &[Turn::user("x")]).await;
        assert!(conv.cached_reply("k").await.is_none());
        assert!(conv.history("u1").await.is_empty());
        assert!(conv.knowledge_generation().await.is_none());
    }

    #[tokio::test]
    async fn test_generation_bump() {
        let conv = store(Arc::new(InMemoryKv::new()));
        assert_eq!(conv.knowledge_generation().await, Some(0));
        conv.bump_knowledge_generation().await;
        assert_eq!(conv.knowledge_generation().await, Some(1));
    }
}
