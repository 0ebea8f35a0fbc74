//! Redis-backed [`KvStore`].
//!
//! Holds one long-lived [`ConnectionManager`] shared by every gateway call
//! and worker loop; it reconnects on its own after transient failures.
//! Each operation is bounded by `cache.op_timeout_ms`.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::time::timeout;

use maint_assist_core::kv::KvStore;
use maint_assist_core::AdapterError;

use crate::config::CacheConfig;

pub struct RedisKv {
    conn: ConnectionManager,
    op_timeout: Duration,
}

pub(crate) fn redis_err(err: redis::RedisError) -> AdapterError {
    if err.is_io_error() || err.is_connection_refusal() || err.is_connection_dropped() {
        AdapterError::unavailable(err.to_string())
    } else if err.is_timeout() {
        AdapterError::Timeout(0)
    } else {
        AdapterError::invalid(err.to_string())
    }
}

impl RedisKv {
    /// Connect and verify with a `PING`, bounded by the connect timeout.
    pub async fn connect(config: &CacheConfig, connect_timeout: Duration) -> anyhow::Result<Self> {
        let client = redis::Client::open(config.url.as_str())?;
        let mut conn = timeout(connect_timeout, client.get_connection_manager())
            .await
            .map_err(|_| anyhow::anyhow!("timed out connecting to redis at {}", config.url))??;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(Self {
            conn,
            op_timeout: config.op_timeout(),
        })
    }

    async fn bounded<T, Fut>(&self, op: Fut) -> Result<T, AdapterError>
    where
        Fut: Future<Output = redis::RedisResult<T>>,
    {
        match timeout(self.op_timeout, op).await {
            Ok(result) => result.map_err(redis_err),
            Err(_) => Err(AdapterError::Timeout(self.op_timeout.as_millis() as u64)),
        }
    }
}

#[async_trait]
impl KvStore for RedisKv {
    fn is_available(&self) -> bool {
        true
    }

    async fn get(&self, key: &str) -> Result<Option<String>, AdapterError> {
        let mut conn = self.conn.clone();
        self.bounded(async move { conn.get::<_, Option<String>>(key).await })
            .await
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), AdapterError> {
        let mut conn = self.conn.clone();
        let secs = ttl.as_secs().max(1);
        self.bounded(async move { conn.set_ex::<_, _, ()>(key, value, secs).await })
            .await
    }

    async fn incr(&self, key: &str) -> Result<i64, AdapterError> {
        let mut conn = self.conn.clone();
        self.bounded(async move { conn.incr::<_, _, i64>(key, 1).await })
            .await
    }
}
