//! Key-value store abstraction for the reply cache and conversation history.
//!
//! Only single-key atomic operations are required; no transactions. A
//! store that failed to connect at startup reports `is_available() ==
//! false`, and [`ConversationStore`](crate::conversation::ConversationStore)
//! turns that into "always miss, always empty".

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::AdapterError;

/// Minimal TTL-aware key-value store.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Whether a connection was established at startup.
    fn is_available(&self) -> bool;

    /// Read a value; expired keys read as absent.
    async fn get(&self, key: &str) -> Result<Option<String>, AdapterError>;

    /// Write a value that expires after `ttl`.
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), AdapterError>;

    /// Atomically increment an integer counter (no expiry), returning the
    /// new value.
    async fn incr(&self, key: &str) -> Result<i64, AdapterError>;
}

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |t| now < t)
    }
}

/// In-memory [`KvStore`] with lazy expiry.
#[derive(Default)]
pub struct InMemoryKv {
    entries: Mutex<HashMap<String, Entry>>,
}

impl InMemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.lock().values().filter(|e| e.is_live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live keys starting with `prefix`, sorted.
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .entries
            .lock()
            .iter()
            .filter(|(k, e)| k.starts_with(prefix) && e.is_live(now))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl KvStore for InMemoryKv {
    fn is_available(&self) -> bool {
        true
    }

    async fn get(&self, key: &str) -> Result<Option<String>, AdapterError> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(e) if e.is_live(now) => Ok(Some(e.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), AdapterError> {
        self.entries.lock().insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64, AdapterError> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let current = match entries.get(key) {
            Some(e) if e.is_live(now) => e
                .value
                .parse::<i64>()
                .map_err(|e| AdapterError::invalid(format!("counter {}: {}", key, e)))?,
            _ => 0,
        };
        let next = current + 1;
        entries.insert(
            key.to_string(),
            Entry {
                value: next.to_string(),
                expires_at: None,
            },
        );
        Ok(next)
    }
}

/// A KV store that never connected.
pub struct UnavailableKv;

#[async_trait]
impl KvStore for UnavailableKv {
    fn is_available(&self) -> bool {
        false
    }

    async fn get(&self, _key: &str) -> Result<Option<String>, AdapterError> {
        Err(AdapterError::unavailable("kv store not connected"))
    }

    async fn set(&self, _key: &str, _value: &str, _ttl: Duration) -> Result<(), AdapterError> {
        Err(AdapterError::unavailable("kv store not connected"))
    }

    async fn incr(&self, _key: &str) -> Result<i64, AdapterError> {
        Err(AdapterError::unavailable("kv store not connected"))
    }
}
