//! In-process [`Broker`] for tests and all-in-one runs.
//!
//! Jobs sit in a single FIFO; each reply destination is a mailbox that
//! expires `reply_ttl` after its last write. Waiters park on a
//! [`Notify`] per queue/mailbox, and `notify_one` stores a permit when no
//! one is waiting, so a publish between "check" and "wait" is not lost.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use maint_assist_core::AdapterError;

use super::{Broker, BrokerChannel, Delivery, JobConsumer, JobEnvelope, ReplyEnvelope};

struct Mailbox {
    items: VecDeque<Vec<u8>>,
    expires_at: Instant,
    notify: Arc<Notify>,
}

impl Mailbox {
    fn new(ttl: Duration) -> Self {
        Self {
            items: VecDeque::new(),
            expires_at: Instant::now() + ttl,
            notify: Arc::new(Notify::new()),
        }
    }
}

#[derive(Default)]
struct State {
    queue: VecDeque<Vec<u8>>,
    mailboxes: HashMap<String, Mailbox>,
}

struct Inner {
    state: Mutex<State>,
    jobs_ready: Notify,
    reply_ttl: Duration,
    available: AtomicBool,
    published_jobs: AtomicU64,
    next_tag: AtomicU64,
}

impl Inner {
    fn check(&self) -> Result<(), AdapterError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(AdapterError::unavailable("in-memory broker disabled"))
        }
    }

    fn push_reply(&self, reply_to: &str, payload: Vec<u8>) -> Result<(), AdapterError> {
        self.check()?;
        let mut state = self.state.lock();
        let now = Instant::now();
        // A mailbox with a parked waiter keeps its Notify alive.
        state
            .mailboxes
            .retain(|_, m| m.expires_at > now || Arc::strong_count(&m.notify) > 1);
        let mailbox = state
            .mailboxes
            .entry(reply_to.to_string())
            .or_insert_with(|| Mailbox::new(self.reply_ttl));
        mailbox.items.push_back(payload);
        mailbox.expires_at = now + self.reply_ttl;
        mailbox.notify.notify_one();
        Ok(())
    }

    fn requeue(&self, payloads: impl IntoIterator<Item = Vec<u8>>) {
        let mut state = self.state.lock();
        let mut requeued = 0;
        for payload in payloads {
            state.queue.push_front(payload);
            requeued += 1;
        }
        drop(state);
        for _ in 0..requeued {
            self.jobs_ready.notify_one();
        }
    }
}

/// In-memory broker. Cheap to clone; clones share the same queue.
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

impl InMemoryBroker {
    pub fn new(reply_ttl: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                jobs_ready: Notify::new(),
                reply_ttl,
                available: AtomicBool::new(true),
                published_jobs: AtomicU64::new(0),
                next_tag: AtomicU64::new(1),
            }),
        }
    }

    /// Simulate the broker going down (or coming back).
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    /// Total jobs ever published.
    pub fn published_jobs(&self) -> u64 {
        self.inner.published_jobs.load(Ordering::SeqCst)
    }

    /// Jobs waiting to be consumed.
    pub fn queued_jobs(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    /// Unread messages on a live reply destination.
    pub fn pending_replies(&self, reply_to: &str) -> usize {
        let now = Instant::now();
        self.inner
            .state
            .lock()
            .mailboxes
            .get(reply_to)
            .filter(|m| m.expires_at > now)
            .map_or(0, |m| m.items.len())
    }

    /// Enqueue a raw payload, bypassing envelope encoding.
    pub fn push_raw_job(&self, payload: Vec<u8>) {
        self.inner.state.lock().queue.push_back(payload);
        self.inner.published_jobs.fetch_add(1, Ordering::SeqCst);
        self.inner.jobs_ready.notify_one();
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn channel(&self) -> Result<Box<dyn BrokerChannel>, AdapterError> {
        self.inner.check()?;
        Ok(Box::new(MemoryChannel {
            inner: self.inner.clone(),
        }))
    }

    async fn consumer(&self, _consumer_id: &str) -> Result<Box<dyn JobConsumer>, AdapterError> {
        self.inner.check()?;
        Ok(Box::new(MemoryConsumer {
            inner: self.inner.clone(),
            unacked: HashMap::new(),
        }))
    }

    async fn ping(&self) -> bool {
        self.inner.available.load(Ordering::SeqCst)
    }
}

struct MemoryChannel {
    inner: Arc<Inner>,
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn publish_job(&mut self, envelope: &JobEnvelope) -> Result<(), AdapterError> {
        self.inner.check()?;
        let payload = envelope.encode()?;
        self.inner.state.lock().queue.push_back(payload);
        self.inner.published_jobs.fetch_add(1, Ordering::SeqCst);
        self.inner.jobs_ready.notify_one();
        Ok(())
    }

    async fn next_reply(
        &mut self,
        reply_to: &str,
        wait: Duration,
    ) -> Result<Option<Vec<u8>>, AdapterError> {
        self.inner.check()?;
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let notify = {
                let mut state = self.inner.state.lock();
                let now = Instant::now();
                let mailbox = state
                    .mailboxes
                    .entry(reply_to.to_string())
                    .or_insert_with(|| Mailbox::new(self.inner.reply_ttl));
                if mailbox.expires_at <= now {
                    mailbox.items.clear();
                    mailbox.expires_at = now + self.inner.reply_ttl;
                }
                if let Some(payload) = mailbox.items.pop_front() {
                    return Ok(Some(payload));
                }
                mailbox.notify.clone()
            };
            if tokio::time::timeout_at(deadline, notify.notified())
                .await
                .is_err()
            {
                return Ok(None);
            }
        }
    }

    async fn publish_reply(
        &mut self,
        reply_to: &str,
        envelope: &ReplyEnvelope,
    ) -> Result<(), AdapterError> {
        self.inner.push_reply(reply_to, envelope.encode()?)
    }
}

struct MemoryConsumer {
    inner: Arc<Inner>,
    unacked: HashMap<u64, Vec<u8>>,
}

#[async_trait]
impl JobConsumer for MemoryConsumer {
    /// Consumers hand their unacked jobs back when dropped, so there is
    /// never anything to reap.
    async fn recover(&mut self) -> Result<usize, AdapterError> {
        Ok(0)
    }

    async fn next_job(&mut self, wait: Duration) -> Result<Option<Delivery>, AdapterError> {
        self.inner.check()?;
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let next = self.inner.state.lock().queue.pop_front();
            if let Some(payload) = next {
                let tag = self.inner.next_tag.fetch_add(1, Ordering::SeqCst);
                self.unacked.insert(tag, payload.clone());
                return Ok(Some(Delivery { tag, payload }));
            }
            if tokio::time::timeout_at(deadline, self.inner.jobs_ready.notified())
                .await
                .is_err()
            {
                return Ok(None);
            }
        }
    }

    async fn ack(&mut self, delivery: &Delivery) -> Result<(), AdapterError> {
        self.unacked.remove(&delivery.tag);
        Ok(())
    }

    async fn publish_reply(
        &mut self,
        reply_to: &str,
        envelope: &ReplyEnvelope,
    ) -> Result<(), AdapterError> {
        self.inner.push_reply(reply_to, envelope.encode()?)
    }
}

impl Drop for MemoryConsumer {
    fn drop(&mut self) {
        if !self.unacked.is_empty() {
            let mut pending: Vec<(u64, Vec<u8>)> = self.unacked.drain().collect();
            // Oldest delivery ends up at the front.
            pending.sort_by(|a, b| b.0.cmp(&a.0));
            self.inner.requeue(pending.into_iter().map(|(_, p)| p));
        }
    }
}
