//! Dependency container for the gateway, the worker, and the indexer.
//!
//! [`PipelineContext::from_config`] builds every adapter from configuration.
//! An adapter that fails to initialize is replaced by its unavailable
//! stand-in and a warning is logged, so the process still starts and the
//! pipeline degrades instead of crashing. Only an unparseable broker
//! configuration is fatal.

use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;

use maint_assist_core::conversation::ConversationStore;
use maint_assist_core::embedding::{DisabledEmbedder, Embedder};
use maint_assist_core::kv::{InMemoryKv, KvStore, UnavailableKv};
use maint_assist_core::llm::{DisabledModel, LanguageModel};
use maint_assist_core::prompt::PromptBuilder;
use maint_assist_core::store::memory::InMemoryKnowledgeStore;
use maint_assist_core::store::{KnowledgeStore, UnavailableStore};

use crate::broker::{self, Broker};
use crate::config::Config;
use crate::embedding::create_embedder;
use crate::llm::create_model;
use crate::redis_kv::RedisKv;
use crate::sqlite_store::SqliteKnowledgeStore;

/// Shared adapters for one process.
#[derive(Clone)]
pub struct PipelineContext {
    pub config: Arc<Config>,
    pub store: Arc<dyn KnowledgeStore>,
    pub conversations: ConversationStore,
    pub embedder: Arc<dyn Embedder>,
    pub llm: Arc<dyn LanguageModel>,
    pub broker: Arc<dyn Broker>,
    pub prompt: PromptBuilder,
}

/// Body of `GET /health`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub status: String,
    pub service: String,
    pub version: String,
    pub cache: bool,
    pub knowledge_store: bool,
    pub embedding_model: bool,
    pub language_model: bool,
    pub broker: bool,
}

impl PipelineContext {
    /// Assemble a context from already-built adapters.
    pub fn new(
        config: Config,
        store: Arc<dyn KnowledgeStore>,
        kv: Arc<dyn KvStore>,
        embedder: Arc<dyn Embedder>,
        llm: Arc<dyn LanguageModel>,
        broker: Arc<dyn Broker>,
    ) -> Self {
        let conversations = ConversationStore::new(
            kv,
            config.cache.prefix.clone(),
            config.cache.ttl(),
            config.cache.history_ttl(),
        );
        let prompt = config.prompt.builder();
        Self {
            config: Arc::new(config),
            store,
            conversations,
            embedder,
            llm,
            broker,
            prompt,
        }
    }

    pub async fn from_config(config: Config) -> Result<Self> {
        let broker = broker::from_config(&config.broker)?;
        let store = open_store(&config).await;
        let kv = open_kv(&config).await;

        let embedder: Arc<dyn Embedder> = match create_embedder(&config.embedding) {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!(error = %e, provider = %config.embedding.provider, "embedding model unavailable");
                Arc::new(DisabledEmbedder)
            }
        };

        let llm: Arc<dyn LanguageModel> = match create_model(&config.llm) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(error = %e, provider = %config.llm.provider, "language model unavailable");
                Arc::new(DisabledModel)
            }
        };

        Ok(Self::new(config, store, kv, embedder, llm, broker))
    }

    /// Probe each dependency independently. The broker is pinged live;
    /// the rest report their initialization state.
    pub async fn health(&self) -> HealthReport {
        HealthReport {
            status: "ok".to_string(),
            service: "maint-assist".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            cache: self.conversations.is_available(),
            knowledge_store: self.store.is_available(),
            embedding_model: self.embedder.is_available(),
            language_model: self.llm.is_available(),
            broker: self.broker.ping().await,
        }
    }
}

async fn open_store(config: &Config) -> Arc<dyn KnowledgeStore> {
    match config.knowledge.backend.as_str() {
        "memory" => Arc::new(InMemoryKnowledgeStore::new()),
        _ => match SqliteKnowledgeStore::open(&config.knowledge).await {
            Ok(store) => Arc::new(store),
            Err(e) => {
                tracing::warn!(error = %e, path = %config.knowledge.path.display(), "knowledge store unavailable");
                Arc::new(UnavailableStore)
            }
        },
    }
}

async fn open_kv(config: &Config) -> Arc<dyn KvStore> {
    match config.cache.backend.as_str() {
        "memory" => Arc::new(InMemoryKv::new()),
        "disabled" => Arc::new(UnavailableKv),
        _ => match RedisKv::connect(&config.cache, config.broker.connect_timeout()).await {
            Ok(kv) => Arc::new(kv),
            Err(e) => {
                tracing::warn!(error = %e, "cache unavailable; caching and history disabled");
                Arc::new(UnavailableKv)
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;

    #[tokio::test]
    async fn test_in_memory_context_health() {
        let config = parse_config(
            r#"
            [broker]
            backend = "memory"
            [cache]
            backend = "memory"
            [knowledge]
            backend = "memory"
            "#,
        )
        .unwrap();
        let ctx = PipelineContext::from_config(config).await.unwrap();
        let health = ctx.health().await;

        assert_eq!(health.status, "ok");
        assert!(health.cache);
        assert!(health.knowledge_store);
        assert!(health.broker);
        assert!(!health.embedding_model);
        assert!(!health.language_model);
    }

    #[tokio::test]
    async fn test_unreachable_cache_degrades() {
        let config = parse_config(
            r#"
            [broker]
            backend = "memory"
            connect_timeout_ms = 200
            [cache]
            url = "redis://127.0.0.1:1/0"
            [knowledge]
            backend = "memory"
            "#,
        )
        .unwrap();
        let ctx = PipelineContext::from_config(config).await.unwrap();
        assert!(!ctx.conversations.is_available());
    }
}
