//! Request gateway: cache check, then publish a correlated job and wait
//! for its reply.
//!
//! Every submission opens its own broker channel and waits on its own
//! reply destination (`reply:{correlation_id}`), so concurrent calls never
//! observe each other's replies. The wait is an explicit [`WaitState`]
//! machine bounded by `gateway.reply_timeout_secs`, and the whole call
//! (channel setup included) is bounded by `gateway.request_budget_secs`.
//!
//! | Outcome | [`SubmitStatus`] | HTTP |
//! |---------|------------------|------|
//! | cache hit or matched reply | `Ok` | 200 |
//! | no reply in time | `TimedOut` | 504 |
//! | broker unreachable | `Unavailable` | 503 |
//! | anything else | `Failed` | 500 |
//!
//! Malformed input is rejected with a [`SubmitError`] before any broker
//! interaction.

use std::time::Duration;

use tokio::time::{timeout, Instant};

use maint_assist_core::conversation::cache_key;
use maint_assist_core::models::{QueryJob, Reply, DEFAULT_USER_ID};
use maint_assist_core::AdapterError;

use crate::broker::{reply_destination, BrokerChannel, JobEnvelope, ReplyEnvelope};
use crate::context::PipelineContext;
use crate::logging::truncate_for_log;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitStatus {
    Ok,
    TimedOut,
    Unavailable,
    Failed,
}

impl SubmitStatus {
    pub fn http_status(self) -> u16 {
        match self {
            SubmitStatus::Ok => 200,
            SubmitStatus::TimedOut => 504,
            SubmitStatus::Unavailable => 503,
            SubmitStatus::Failed => 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubmitOutcome {
    pub status: SubmitStatus,
    pub reply: Reply,
    /// Whether the reply came from the cache.
    pub cached: bool,
    /// Whether the reply stands in for a failure; such replies are never
    /// cached.
    pub degraded: bool,
}

/// Input rejected before enqueueing.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SubmitError {
    #[error("query must not be empty")]
    EmptyQuery,
    #[error("query exceeds {max} characters")]
    QueryTooLong { max: usize },
}

/// State of one reply wait.
#[derive(Debug)]
pub enum WaitState {
    Waiting,
    Matched(ReplyEnvelope),
    TimedOut,
}

#[derive(Clone)]
pub struct Gateway {
    ctx: PipelineContext,
}

impl Gateway {
    pub fn new(ctx: PipelineContext) -> Self {
        Self { ctx }
    }

    /// Answer `query` for `user_id` (defaults to `default_user`).
    pub async fn submit(
        &self,
        query: &str,
        user_id: Option<&str>,
    ) -> Result<SubmitOutcome, SubmitError> {
        let max = self.ctx.config.gateway.max_query_chars;
        if query.trim().is_empty() {
            return Err(SubmitError::EmptyQuery);
        }
        if query.chars().count() > max {
            return Err(SubmitError::QueryTooLong { max });
        }
        let user_id = user_id
            .filter(|u| !u.is_empty())
            .unwrap_or(DEFAULT_USER_ID);

        let generation = if self.ctx.config.cache.invalidate_on_write {
            self.ctx.conversations.knowledge_generation().await
        } else {
            None
        };
        let key = cache_key(user_id, query, generation);

        if let Some(reply) = self.ctx.conversations.cached_reply(&key).await {
            tracing::debug!(user_id, "cache hit");
            return Ok(SubmitOutcome {
                status: SubmitStatus::Ok,
                reply,
                cached: true,
                degraded: false,
            });
        }

        let job = QueryJob::new(user_id, query);
        let outcome = self.dispatch(&job).await;

        if outcome.status == SubmitStatus::Ok && !outcome.degraded {
            self.ctx.conversations.cache_reply(&key, &outcome.reply).await;
        }
        Ok(outcome)
    }

    async fn dispatch(&self, job: &QueryJob) -> SubmitOutcome {
        let messages = &self.ctx.config.messages;
        let query_preview = truncate_for_log(&job.query, 100);
        let budget = self.ctx.config.gateway.request_budget();

        let result = match timeout(budget, self.round_trip(job)).await {
            Ok(result) => result,
            Err(_) => Ok(None),
        };

        match result {
            Ok(Some(envelope)) => SubmitOutcome {
                status: SubmitStatus::Ok,
                reply: envelope.body,
                cached: false,
                degraded: envelope.degraded,
            },
            Ok(None) => {
                tracing::warn!(
                    user_id = %job.user_id,
                    correlation_id = %job.correlation_id,
                    query = %query_preview,
                    "no reply before timeout"
                );
                degraded(SubmitStatus::TimedOut, &messages.timed_out)
            }
            Err(e) if matches!(e, AdapterError::Unavailable(_) | AdapterError::Timeout(_)) => {
                tracing::error!(
                    user_id = %job.user_id,
                    query = %query_preview,
                    error = %e,
                    "broker unavailable"
                );
                degraded(SubmitStatus::Unavailable, &messages.unavailable)
            }
            Err(e) => {
                tracing::error!(
                    user_id = %job.user_id,
                    query = %query_preview,
                    error = %e,
                    "submission failed"
                );
                degraded(SubmitStatus::Failed, &messages.internal_error)
            }
        }
    }

    /// Publish the job and wait for its reply. `Ok(None)` means the reply
    /// timeout elapsed.
    async fn round_trip(&self, job: &QueryJob) -> Result<Option<ReplyEnvelope>, AdapterError> {
        let envelope = JobEnvelope::for_job(job)?;
        let mut channel = self.ctx.broker.channel().await?;
        channel.publish_job(&envelope).await?;
        tracing::debug!(correlation_id = %envelope.correlation_id, "job published");

        let deadline = Instant::now() + self.ctx.config.gateway.reply_timeout();
        let mut state = WaitState::Waiting;
        loop {
            state = match state {
                WaitState::Waiting => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        WaitState::TimedOut
                    } else {
                        await_reply(channel.as_mut(), &envelope, remaining).await?
                    }
                }
                WaitState::Matched(reply) => return Ok(Some(reply)),
                WaitState::TimedOut => return Ok(None),
            };
        }
    }
}

/// One bounded read on the job's reply destination.
async fn await_reply(
    channel: &mut dyn BrokerChannel,
    job: &JobEnvelope,
    remaining: Duration,
) -> Result<WaitState, AdapterError> {
    let Some(payload) = channel.next_reply(&job.reply_to, remaining).await? else {
        return Ok(WaitState::Waiting);
    };

    match ReplyEnvelope::decode(&payload) {
        Ok(reply) if reply.correlation_id == job.correlation_id => Ok(WaitState::Matched(reply)),
        Ok(stray) => {
            let destination = reply_destination(&stray.correlation_id);
            tracing::warn!(
                expected = %job.correlation_id,
                got = %stray.correlation_id,
                "re-routing reply to its own destination"
            );
            if let Err(e) = channel.publish_reply(&destination, &stray).await {
                tracing::warn!(error = %e, "failed to re-route stray reply");
            }
            Ok(WaitState::Waiting)
        }
        Err(e) => {
            tracing::warn!(correlation_id = %job.correlation_id, error = %e, "discarding undecodable reply");
            Ok(WaitState::Waiting)
        }
    }
}

fn degraded(status: SubmitStatus, message: &str) -> SubmitOutcome {
    SubmitOutcome {
        status,
        reply: Reply::message(message),
        cached: false,
        degraded: true,
    }
}
