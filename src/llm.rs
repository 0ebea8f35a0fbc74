//! Chat-completion clients.
//!
//! [`OpenAiChatModel`] speaks the OpenAI-compatible
//! `POST {base_url}/chat/completions` protocol, so it also covers hosted
//! gateways and local servers that mimic it. `"disabled"` maps to the core
//! [`DisabledModel`].

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Serialize;

use maint_assist_core::llm::{ChatMessage, DisabledModel, LanguageModel};
use maint_assist_core::AdapterError;

use crate::config::LlmConfig;

pub struct OpenAiChatModel {
    base_url: String,
    model: String,
    api_key: String,
    max_tokens: u32,
    temperature: f32,
    max_retries: u32,
    timeout: Duration,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    max_tokens: u32,
    temperature: f32,
}

impl OpenAiChatModel {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env).map_err(|_| {
            anyhow::anyhow!("{} environment variable not set", config.api_key_env)
        })?;
        let timeout = Duration::from_secs(config.timeout_secs);
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key,
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            max_retries: config.max_retries,
            timeout,
            client,
        })
    }

    async fn attempt(&self, body: &CompletionRequest<'_>) -> Result<String, (bool, AdapterError)> {
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                let err = if e.is_timeout() {
                    AdapterError::Timeout(self.timeout.as_millis() as u64)
                } else {
                    AdapterError::unavailable(e.to_string())
                };
                (true, err)
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let retry = status.as_u16() == 429 || status.is_server_error();
            return Err((
                retry,
                AdapterError::invalid(format!("chat API error {}: {}", status, text)),
            ));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| (false, AdapterError::invalid(e.to_string())))?;
        parse_completion(&json).map_err(|e| (false, e))
    }
}

#[async_trait]
impl LanguageModel for OpenAiChatModel {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, AdapterError> {
        let body = CompletionRequest {
            model: &self.model,
            messages,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        };

        let mut attempt = 0;
        loop {
            match self.attempt(&body).await {
                Ok(text) => return Ok(text),
                Err((retry, err)) => {
                    if !retry || attempt >= self.max_retries {
                        return Err(err);
                    }
                    attempt += 1;
                    tracing::debug!(attempt, error = %err, "retrying chat completion");
                    tokio::time::sleep(Duration::from_secs(1 << (attempt - 1).min(5))).await;
                }
            }
        }
    }
}

/// Extract `choices[0].message.content`, trimmed.
fn parse_completion(json: &serde_json::Value) -> Result<String, AdapterError> {
    json.get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .map(|s| s.trim().to_string())
        .ok_or_else(|| AdapterError::invalid("completion missing choices[0].message.content"))
}

/// Create the configured [`LanguageModel`].
pub fn create_model(config: &LlmConfig) -> Result<Arc<dyn LanguageModel>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledModel)),
        "openai" => Ok(Arc::new(OpenAiChatModel::new(config)?)),
        other => bail!("Unknown llm provider: {}", other),
    }
}
