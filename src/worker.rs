//! Query worker: consumes jobs and publishes exactly one reply per job.
//!
//! For each job the worker loads the user's history, retrieves the nearest
//! knowledge documents, composes the prompt, calls the language model,
//! saves the extended history, and replies to the job's reply destination.
//! The delivery is acknowledged only after the reply is published, so a
//! crash in between leads to redelivery.
//!
//! History read-modify-write is serialized per user within this process.
//! Two worker processes handling the same user at once can still lose a
//! turn.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::task::JoinSet;

use maint_assist_core::models::{JobBody, Neighbor, QueryJob, Reply, Turn};
use maint_assist_core::prompt::context_items;
use maint_assist_core::store::rank_neighbors;
use maint_assist_core::AdapterError;

use crate::broker::{Delivery, JobConsumer, JobEnvelope, ReplyEnvelope};
use crate::context::PipelineContext;
use crate::logging::truncate_for_log;

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Reply produced for one job.
#[derive(Debug, Clone, PartialEq)]
pub struct Answer {
    pub reply: Reply,
    pub degraded: bool,
}

#[derive(Clone)]
pub struct Worker {
    ctx: PipelineContext,
    user_locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl Worker {
    pub fn new(ctx: PipelineContext) -> Self {
        Self {
            ctx,
            user_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn user_lock(&self, user_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut map = self.user_locks.lock();
        Arc::clone(
            map.entry(user_id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    fn release_user_lock(&self, user_id: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut map = self.user_locks.lock();
        // Held by the map and by us only: nobody else is waiting.
        if Arc::strong_count(&lock) <= 2 {
            map.remove(user_id);
        }
    }

    /// Run the full pipeline for one decoded job. Never fails: dependency
    /// failures degrade the reply instead.
    pub async fn answer(&self, job: &QueryJob) -> Answer {
        let lock = self.user_lock(&job.user_id);
        let answer = {
            let _guard = lock.lock().await;
            self.answer_locked(job).await
        };
        self.release_user_lock(&job.user_id, lock);
        answer
    }

    async fn answer_locked(&self, job: &QueryJob) -> Answer {
        let conversations = &self.ctx.conversations;

        let mut history = conversations.history(&job.user_id).await;
        history.push(Turn::user(&job.query));

        let neighbors = self.retrieve(job).await;
        let messages = self.ctx.prompt.build(&job.query, &neighbors, &history);

        let (response, degraded) = match self.ctx.llm.complete(&messages).await {
            Ok(text) => (text, false),
            Err(e) => {
                tracing::warn!(
                    user_id = %job.user_id,
                    query = %truncate_for_log(&job.query, 100),
                    model = self.ctx.llm.model_name(),
                    error = %e,
                    "language model call failed"
                );
                (self.ctx.config.messages.model_unavailable.clone(), true)
            }
        };

        history.push(Turn::assistant(&response));
        conversations.save_history(&job.user_id, &history).await;

        Answer {
            reply: Reply {
                response,
                context: context_items(&neighbors),
            },
            degraded,
        }
    }

    /// Nearest knowledge documents for the query, best first. Empty when the
    /// store or the embedding model cannot serve.
    async fn retrieve(&self, job: &QueryJob) -> Vec<Neighbor> {
        let store = &self.ctx.store;
        let embedder = &self.ctx.embedder;
        if !store.is_available() || !embedder.is_available() {
            tracing::debug!("retrieval skipped; knowledge store or embedding model unavailable");
            return Vec::new();
        }

        let knowledge = &self.ctx.config.knowledge;
        let result = match embedder.embed(&job.query).await {
            Ok(vector) => store.query(&vector, knowledge.retrieve_k, None).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(neighbors) => rank_neighbors(neighbors, knowledge.keep_top),
            Err(e) => {
                tracing::warn!(
                    user_id = %job.user_id,
                    query = %truncate_for_log(&job.query, 100),
                    error = %e,
                    "retrieval failed; answering without context"
                );
                Vec::new()
            }
        }
    }

    /// Decode, answer, reply, acknowledge.
    ///
    /// Returns an error only when the broker fails, leaving the delivery
    /// unacknowledged for redelivery.
    pub async fn handle_delivery(
        &self,
        consumer: &mut dyn JobConsumer,
        delivery: &Delivery,
    ) -> Result<(), AdapterError> {
        let envelope = match JobEnvelope::decode(&delivery.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::error!(tag = delivery.tag, error = %e, "dropping job without a usable envelope");
                return consumer.ack(delivery).await;
            }
        };

        let messages = &self.ctx.config.messages;
        let (reply, degraded) = match serde_json::from_str::<JobBody>(&envelope.body) {
            Ok(body) if !body.query.trim().is_empty() => {
                let job = QueryJob {
                    correlation_id: envelope.correlation_id.clone(),
                    user_id: body.user_id,
                    query: body.query,
                    enqueued_at: envelope.enqueued_at,
                };
                self.answer_isolated(job).await
            }
            Ok(_) => (Reply::message(&messages.malformed_job), true),
            Err(e) => {
                tracing::warn!(correlation_id = %envelope.correlation_id, error = %e, "malformed job body");
                (Reply::message(&messages.malformed_job), true)
            }
        };

        let reply = ReplyEnvelope {
            correlation_id: envelope.correlation_id.clone(),
            degraded,
            body: reply,
        };
        consumer.publish_reply(&envelope.reply_to, &reply).await?;
        consumer.ack(delivery).await?;
        tracing::debug!(correlation_id = %envelope.correlation_id, degraded, "reply published");
        Ok(())
    }

    /// Answer on a separate task so that a panic becomes an error reply
    /// instead of taking the consumer loop down.
    async fn answer_isolated(&self, job: QueryJob) -> (Reply, bool) {
        let worker = self.clone();
        let user_id = job.user_id.clone();
        let query = truncate_for_log(&job.query, 100);
        match tokio::spawn(async move { worker.answer(&job).await }).await {
            Ok(answer) => (answer.reply, answer.degraded),
            Err(e) => {
                tracing::error!(user_id = %user_id, query = %query, error = %e, "job processing failed");
                (
                    Reply::message(&self.ctx.config.messages.processing_error),
                    true,
                )
            }
        }
    }

    /// Consume jobs until the task is aborted.
    ///
    /// Failing to open the first consumer is fatal. Later broker failures
    /// are logged and the consumer is reopened. Every
    /// `worker.reap_interval_secs` the loop requeues jobs held by dead
    /// consumers.
    pub async fn run(&self, consumer_id: String) -> Result<()> {
        let mut consumer = self
            .ctx
            .broker
            .consumer(&consumer_id)
            .await
            .with_context(|| format!("worker {} cannot reach the broker", consumer_id))?;
        self.recover(consumer.as_mut(), &consumer_id).await;
        tracing::info!(consumer_id = %consumer_id, "worker consuming");

        let wait = self.ctx.config.worker.dequeue_wait();
        let reap_every = self.ctx.config.worker.reap_interval();
        let mut last_reap = tokio::time::Instant::now();
        loop {
            if last_reap.elapsed() >= reap_every {
                self.recover(consumer.as_mut(), &consumer_id).await;
                last_reap = tokio::time::Instant::now();
            }
            let failure = match consumer.next_job(wait).await {
                Ok(Some(delivery)) => self
                    .handle_delivery(consumer.as_mut(), &delivery)
                    .await
                    .err(),
                Ok(None) => None,
                Err(e) => Some(e),
            };

            if let Some(e) = failure {
                tracing::warn!(consumer_id = %consumer_id, error = %e, "broker failure; reconnecting");
                consumer = self.reconnect(&consumer_id).await;
            }
        }
    }

    async fn reconnect(&self, consumer_id: &str) -> Box<dyn JobConsumer> {
        loop {
            tokio::time::sleep(RECONNECT_DELAY).await;
            match self.ctx.broker.consumer(consumer_id).await {
                Ok(mut consumer) => {
                    self.recover(consumer.as_mut(), consumer_id).await;
                    tracing::info!(consumer_id, "worker reconnected");
                    return consumer;
                }
                Err(e) => tracing::debug!(consumer_id, error = %e, "reconnect failed"),
            }
        }
    }

    async fn recover(&self, consumer: &mut dyn JobConsumer, consumer_id: &str) {
        match consumer.recover().await {
            Ok(0) => {}
            Ok(n) => tracing::info!(consumer_id, requeued = n, "requeued unacknowledged jobs"),
            Err(e) => tracing::warn!(consumer_id, error = %e, "could not requeue in-flight jobs"),
        }
    }
}

/// Start `count` consumer loops named `{worker_id}-{i}`. Dropping the set
/// stops them.
pub fn spawn_workers(worker: &Worker, worker_id: &str, count: usize) -> JoinSet<Result<()>> {
    let mut set = JoinSet::new();
    for i in 0..count {
        let worker = worker.clone();
        let consumer_id = format!("{}-{}", worker_id, i);
        set.spawn(async move { worker.run(consumer_id).await });
    }
    set
}
