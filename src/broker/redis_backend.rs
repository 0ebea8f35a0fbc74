//! Redis list-based [`Broker`].
//!
//! | Key | Type | Use |
//! |-----|------|-----|
//! | `{queue}` | list | pending jobs; `LPUSH` in, `BLMOVE` out (FIFO) |
//! | `{queue}:processing:{consumer}` | list | jobs a consumer holds but has not acked |
//! | `{queue}:consumers` | set | every consumer id that may own a processing list |
//! | `{queue}:heartbeat:{consumer}` | string | liveness key, `SET EX`, refreshed in the background |
//! | `{queue}:reply:{correlation_id}` | list | replies; `RPUSH` + `EXPIRE`, read by `BLPOP` |
//!
//! A consumer whose heartbeat key has expired is dead. [`JobConsumer::recover`]
//! moves the processing lists of dead consumers (and its own, left over from
//! a previous connection under the same id) back onto the queue. Live
//! consumers' lists are never touched.
//!
//! Every channel and consumer opens its own connection, so blocking reads
//! never stall other callers. Connection attempts are bounded by
//! `broker.connect_timeout_ms` and are not retried: a failed connect is
//! reported as unavailable at once.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Direction};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use maint_assist_core::AdapterError;

use super::{Broker, BrokerChannel, Delivery, JobConsumer, JobEnvelope, ReplyEnvelope};
use crate::config::BrokerConfig;
use crate::redis_kv::redis_err;

pub struct RedisBroker {
    client: redis::Client,
    queue: String,
    reply_ttl: Duration,
    connect_timeout: Duration,
    heartbeat_ttl: Duration,
}

impl RedisBroker {
    pub fn new(config: &BrokerConfig) -> anyhow::Result<Self> {
        let client = redis::Client::open(config.url.as_str())?;
        Ok(Self {
            client,
            queue: config.queue.clone(),
            reply_ttl: config.reply_ttl(),
            connect_timeout: config.connect_timeout(),
            heartbeat_ttl: config.heartbeat_ttl(),
        })
    }

    async fn connect(&self) -> Result<MultiplexedConnection, AdapterError> {
        match timeout(
            self.connect_timeout,
            self.client.get_multiplexed_async_connection(),
        )
        .await
        {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(e)) => Err(AdapterError::unavailable(e.to_string())),
            Err(_) => Err(AdapterError::unavailable(format!(
                "connect timed out after {}ms",
                self.connect_timeout.as_millis()
            ))),
        }
    }

    fn keys(&self) -> Keys {
        Keys {
            queue: self.queue.clone(),
            reply_ttl_secs: self.reply_ttl.as_secs().max(1) as i64,
        }
    }
}

#[derive(Clone)]
struct Keys {
    queue: String,
    reply_ttl_secs: i64,
}

impl Keys {
    fn reply(&self, reply_to: &str) -> String {
        format!("{}:{}", self.queue, reply_to)
    }

    fn processing(&self, consumer_id: &str) -> String {
        format!("{}:processing:{}", self.queue, consumer_id)
    }

    fn consumers(&self) -> String {
        format!("{}:consumers", self.queue)
    }

    fn heartbeat(&self, consumer_id: &str) -> String {
        format!("{}:heartbeat:{}", self.queue, consumer_id)
    }
}

/// Refresh period for a heartbeat key living `ttl`.
fn heartbeat_period(ttl: Duration) -> Duration {
    (ttl / 3).max(Duration::from_millis(200))
}

async fn beat(
    conn: &mut MultiplexedConnection,
    key: &str,
    ttl: Duration,
) -> Result<(), AdapterError> {
    let _: () = conn
        .set_ex(key, 1, ttl.as_secs().max(1))
        .await
        .map_err(redis_err)?;
    Ok(())
}

/// Move every element of `from` onto the end of the queue that `BLMOVE`
/// pops from, oldest job ending up first in line. Returns how many moved.
async fn drain_into_queue(
    conn: &mut MultiplexedConnection,
    from: &str,
    queue: &str,
) -> Result<usize, AdapterError> {
    let mut moved = 0;
    loop {
        let item: Option<Vec<u8>> = conn
            .lmove(from, queue, Direction::Left, Direction::Right)
            .await
            .map_err(redis_err)?;
        if item.is_none() {
            return Ok(moved);
        }
        moved += 1;
    }
}

/// Blocking-command timeout in seconds. Redis treats `0` as "forever", so
/// never send it.
fn block_secs(wait: Duration) -> f64 {
    wait.as_secs_f64().max(0.01)
}

async fn push_reply(
    conn: &mut MultiplexedConnection,
    keys: &Keys,
    reply_to: &str,
    envelope: &ReplyEnvelope,
) -> Result<(), AdapterError> {
    let key = keys.reply(reply_to);
    let payload = envelope.encode()?;
    let _: () = redis::pipe()
        .atomic()
        .rpush(&key, payload)
        .ignore()
        .expire(&key, keys.reply_ttl_secs)
        .ignore()
        .query_async(conn)
        .await
        .map_err(redis_err)?;
    Ok(())
}

#[async_trait]
impl Broker for RedisBroker {
    async fn channel(&self) -> Result<Box<dyn BrokerChannel>, AdapterError> {
        let conn = self.connect().await?;
        Ok(Box::new(RedisChannel {
            conn,
            keys: self.keys(),
        }))
    }

    /// Register the consumer and start its heartbeat. The heartbeat runs on
    /// its own connection so that a blocking dequeue never delays it.
    async fn consumer(&self, consumer_id: &str) -> Result<Box<dyn JobConsumer>, AdapterError> {
        let mut conn = self.connect().await?;
        let mut beat_conn = self.connect().await?;
        let keys = self.keys();
        let heartbeat_key = keys.heartbeat(consumer_id);
        let ttl = self.heartbeat_ttl;

        beat(&mut conn, &heartbeat_key, ttl).await?;
        let _: i64 = conn
            .sadd(keys.consumers(), consumer_id)
            .await
            .map_err(redis_err)?;

        let id = consumer_id.to_string();
        let heartbeat = tokio::spawn(async move {
            loop {
                tokio::time::sleep(heartbeat_period(ttl)).await;
                if let Err(e) = beat(&mut beat_conn, &heartbeat_key, ttl).await {
                    tracing::warn!(consumer_id = %id, error = %e, "heartbeat refresh failed");
                }
            }
        });

        Ok(Box::new(RedisConsumer {
            id: consumer_id.to_string(),
            processing: keys.processing(consumer_id),
            conn,
            keys,
            next_tag: 1,
            heartbeat,
        }))
    }

    async fn ping(&self) -> bool {
        let Ok(mut conn) = self.connect().await else {
            return false;
        };
        let pong: redis::RedisResult<String> = redis::cmd("PING").query_async(&mut conn).await;
        pong.is_ok()
    }
}

struct RedisChannel {
    conn: MultiplexedConnection,
    keys: Keys,
}

#[async_trait]
impl BrokerChannel for RedisChannel {
    async fn publish_job(&mut self, envelope: &JobEnvelope) -> Result<(), AdapterError> {
        let payload = envelope.encode()?;
        let _: i64 = self
            .conn
            .lpush(&self.keys.queue, payload)
            .await
            .map_err(redis_err)?;
        Ok(())
    }

    async fn next_reply(
        &mut self,
        reply_to: &str,
        wait: Duration,
    ) -> Result<Option<Vec<u8>>, AdapterError> {
        let key = self.keys.reply(reply_to);
        let popped: Option<(String, Vec<u8>)> = self
            .conn
            .blpop(&key, block_secs(wait))
            .await
            .map_err(redis_err)?;
        Ok(popped.map(|(_, payload)| payload))
    }

    async fn publish_reply(
        &mut self,
        reply_to: &str,
        envelope: &ReplyEnvelope,
    ) -> Result<(), AdapterError> {
        push_reply(&mut self.conn, &self.keys, reply_to, envelope).await
    }
}

struct RedisConsumer {
    id: String,
    conn: MultiplexedConnection,
    keys: Keys,
    processing: String,
    next_tag: u64,
    heartbeat: JoinHandle<()>,
}

impl Drop for RedisConsumer {
    fn drop(&mut self) {
        // Unacked jobs stay in the processing list until the heartbeat key
        // expires and another consumer reaps them.
        self.heartbeat.abort();
    }
}

#[async_trait]
impl JobConsumer for RedisConsumer {
    async fn recover(&mut self) -> Result<usize, AdapterError> {
        let mut requeued =
            drain_into_queue(&mut self.conn, &self.processing, &self.keys.queue).await?;

        let members: Vec<String> = self
            .conn
            .smembers(self.keys.consumers())
            .await
            .map_err(redis_err)?;
        for other in members.iter().filter(|m| **m != self.id) {
            let alive: bool = self
                .conn
                .exists(self.keys.heartbeat(other))
                .await
                .map_err(redis_err)?;
            if alive {
                continue;
            }
            let moved = drain_into_queue(
                &mut self.conn,
                &self.keys.processing(other),
                &self.keys.queue,
            )
            .await?;
            let _: i64 = self
                .conn
                .srem(self.keys.consumers(), other)
                .await
                .map_err(redis_err)?;
            if moved > 0 {
                tracing::info!(dead_consumer = %other, requeued = moved, "reaped jobs of dead consumer");
            }
            requeued += moved;
        }
        Ok(requeued)
    }

    async fn next_job(&mut self, wait: Duration) -> Result<Option<Delivery>, AdapterError> {
        let moved: Option<Vec<u8>> = self
            .conn
            .blmove(
                &self.keys.queue,
                &self.processing,
                Direction::Right,
                Direction::Left,
                block_secs(wait),
            )
            .await
            .map_err(redis_err)?;
        Ok(moved.map(|payload| {
            let tag = self.next_tag;
            self.next_tag += 1;
            Delivery { tag, payload }
        }))
    }

    async fn ack(&mut self, delivery: &Delivery) -> Result<(), AdapterError> {
        let _: i64 = self
            .conn
            .lrem(&self.processing, 1, delivery.payload.as_slice())
            .await
            .map_err(redis_err)?;
        Ok(())
    }

    async fn publish_reply(
        &mut self,
        reply_to: &str,
        envelope: &ReplyEnvelope,
    ) -> Result<(), AdapterError> {
        push_reply(&mut self.conn, &self.keys, reply_to, envelope).await
    }
}
