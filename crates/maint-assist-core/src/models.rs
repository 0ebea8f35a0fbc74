//! Core data models for the query pipeline.
//!
//! These types flow between the gateway, the broker, the worker, and the
//! knowledge store. The serialized shapes of [`JobBody`] and [`Reply`] are
//! the queue wire contract and the HTTP response contract respectively, so
//! field names here are part of the public interface.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Free-form document metadata (type, source reference, dates, domain fields).
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// User id applied when a caller does not provide one.
pub const DEFAULT_USER_ID: &str = "default_user";

fn default_user_id() -> String {
    DEFAULT_USER_ID.to_string()
}

/// Speaker of a conversation turn or prompt message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One entry of a user's conversation history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

impl Turn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Body of a job message on the queue: `{query, user_id}`.
///
/// Correlation id and reply destination travel in the transport envelope,
/// not in the body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobBody {
    pub query: String,
    #[serde(default = "default_user_id")]
    pub user_id: String,
}

/// A decoded unit of work, as seen by the worker.
#[derive(Debug, Clone)]
pub struct QueryJob {
    pub correlation_id: String,
    pub user_id: String,
    pub query: String,
    pub enqueued_at: DateTime<Utc>,
}

impl QueryJob {
    /// Create a job with a fresh UUID v4 correlation id.
    pub fn new(user_id: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            correlation_id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            query: query.into(),
            enqueued_at: Utc::now(),
        }
    }

    pub fn body(&self) -> JobBody {
        JobBody {
            query: self.query.clone(),
            user_id: self.user_id.clone(),
        }
    }
}

/// One retrieved source cited in a reply.
///
/// `page` and `year` serialize as `null` when absent; clients rely on the
/// keys being present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextItem {
    pub source: String,
    pub page: Option<i64>,
    pub year: Option<i64>,
    pub similarity: f64,
}

/// Reply body: `{response, context}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub response: String,
    #[serde(default)]
    pub context: Vec<ContextItem>,
}

impl Reply {
    /// A reply carrying only a message and no sources.
    pub fn message(response: impl Into<String>) -> Self {
        Self {
            response: response.into(),
            context: Vec::new(),
        }
    }
}

/// A document held by the knowledge store.
#[derive(Debug, Clone, PartialEq)]
pub struct KnowledgeDocument {
    pub id: String,
    pub text: String,
    pub metadata: Metadata,
    pub embedding: Vec<f32>,
}

/// A nearest-neighbor hit returned by [`KnowledgeStore::query`](crate::store::KnowledgeStore::query).
#[derive(Debug, Clone, PartialEq)]
pub struct Neighbor {
    pub id: String,
    pub text: String,
    pub metadata: Metadata,
    /// Cosine distance to the query vector (`0.0` = identical direction).
    pub distance: f32,
}

/// Metadata equality filter. Every listed key must be present with an
/// equal value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataFilter {
    equals: BTreeMap<String, serde_json::Value>,
}

impl MetadataFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.equals.insert(key.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.equals.is_empty()
    }

    /// Required value for `key`, if the filter constrains it.
    pub fn value(&self, key: &str) -> Option<&serde_json::Value> {
        self.equals.get(key)
    }

    pub fn matches(&self, metadata: &Metadata) -> bool {
        self.equals
            .iter()
            .all(|(k, v)| metadata.get(k).is_some_and(|actual| actual == v))
    }
}

/// Filter selecting intervention documents.
pub fn interventions_only() -> MetadataFilter {
    MetadataFilter::new().eq("type", "intervention")
}
