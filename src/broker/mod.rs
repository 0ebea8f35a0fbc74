//! Work queue with reply correlation.
//!
//! The gateway publishes a [`JobEnvelope`] onto the shared job queue and
//! waits on its own reply destination (`reply:{correlation_id}`). A worker
//! dequeues the job, publishes exactly one [`ReplyEnvelope`] to the
//! envelope's `reply_to`, then acknowledges the delivery.
//!
//! Delivery is at-least-once: a dequeued job stays in the consumer's
//! in-flight set until [`JobConsumer::ack`], and unacknowledged jobs are
//! requeued by [`JobConsumer::recover`] (Redis) or when the consumer is
//! dropped (in-memory).
//!
//! | Backend | Job queue | In-flight | Reply destination |
//! |---------|-----------|-----------|-------------------|
//! | [`redis_backend`] | `LPUSH`/`BLMOVE` list | per-consumer processing list | list with `EXPIRE`, read by `BLPOP` |
//! | [`memory`] | `VecDeque` + `Notify` | per-consumer map | mailbox + `Notify`, lazy expiry |

pub mod memory;
pub mod redis_backend;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use maint_assist_core::models::{QueryJob, Reply};
use maint_assist_core::AdapterError;

use crate::config::BrokerConfig;

/// Reply destination for a correlation id.
pub fn reply_destination(correlation_id: &str) -> String {
    format!("reply:{}", correlation_id)
}

/// Transport envelope of a job: correlation metadata plus the JSON body
/// `{query, user_id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEnvelope {
    pub correlation_id: String,
    pub reply_to: String,
    pub enqueued_at: DateTime<Utc>,
    /// Raw job body; decoded by the worker so that malformed bodies can be
    /// answered rather than dropped.
    pub body: String,
}

impl JobEnvelope {
    pub fn for_job(job: &QueryJob) -> Result<Self, AdapterError> {
        Ok(Self {
            correlation_id: job.correlation_id.clone(),
            reply_to: reply_destination(&job.correlation_id),
            enqueued_at: job.enqueued_at,
            body: serde_json::to_string(&job.body())?,
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>, AdapterError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(payload: &[u8]) -> Result<Self, AdapterError> {
        Ok(serde_json::from_slice(payload)?)
    }
}

/// Transport envelope of a reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyEnvelope {
    pub correlation_id: String,
    /// Set when the reply was produced from a failure; degraded replies are
    /// returned to the caller but never cached.
    #[serde(default)]
    pub degraded: bool,
    pub body: Reply,
}

impl ReplyEnvelope {
    pub fn encode(&self) -> Result<Vec<u8>, AdapterError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(payload: &[u8]) -> Result<Self, AdapterError> {
        Ok(serde_json::from_slice(payload)?)
    }
}

/// A dequeued job awaiting acknowledgement.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub tag: u64,
    pub payload: Vec<u8>,
}

/// Connection factory for one broker.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Open a channel for publishing jobs and exchanging replies. The
    /// channel is released when dropped.
    async fn channel(&self) -> Result<Box<dyn BrokerChannel>, AdapterError>;

    /// Open a job consumer. `consumer_id` must be stable across restarts of
    /// the same worker loop so that its in-flight jobs can be recovered.
    async fn consumer(&self, consumer_id: &str) -> Result<Box<dyn JobConsumer>, AdapterError>;

    /// Live reachability check.
    async fn ping(&self) -> bool;
}

#[async_trait]
pub trait BrokerChannel: Send {
    async fn publish_job(&mut self, envelope: &JobEnvelope) -> Result<(), AdapterError>;

    /// Wait up to `wait` for the next message on `reply_to`.
    async fn next_reply(
        &mut self,
        reply_to: &str,
        wait: Duration,
    ) -> Result<Option<Vec<u8>>, AdapterError>;

    async fn publish_reply(
        &mut self,
        reply_to: &str,
        envelope: &ReplyEnvelope,
    ) -> Result<(), AdapterError>;
}

#[async_trait]
pub trait JobConsumer: Send {
    /// Requeue jobs held by consumers that are no longer alive, including
    /// a previous connection of this one. Jobs held by live consumers are
    /// left alone. Returns how many were requeued.
    async fn recover(&mut self) -> Result<usize, AdapterError>;

    /// Wait up to `wait` for the next job.
    async fn next_job(&mut self, wait: Duration) -> Result<Option<Delivery>, AdapterError>;

    async fn ack(&mut self, delivery: &Delivery) -> Result<(), AdapterError>;

    /// Publish a reply from the consuming side.
    async fn publish_reply(
        &mut self,
        reply_to: &str,
        envelope: &ReplyEnvelope,
    ) -> Result<(), AdapterError>;
}

/// Build the configured broker. Redis connections are opened lazily per
/// channel; this only parses the URL.
pub fn from_config(config: &BrokerConfig) -> anyhow::Result<Arc<dyn Broker>> {
    match config.backend.as_str() {
        "redis" => Ok(Arc::new(redis_backend::RedisBroker::new(config)?)),
        "memory" => Ok(Arc::new(memory::InMemoryBroker::new(config.reply_ttl()))),
        other => anyhow::bail!("Unknown broker backend: {}", other),
    }
}
