//! Language model trait.
//!
//! A [`LanguageModel`] takes a structured prompt (an ordered list of
//! role-tagged messages) and returns generated text. Concrete backends
//! live in the `maint-assist` app crate.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::AdapterError;
use crate::models::{Role, Turn};

/// One message of a structured prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

impl From<&Turn> for ChatMessage {
    fn from(turn: &Turn) -> Self {
        Self {
            role: turn.role,
            content: turn.content.clone(),
        }
    }
}

/// Stateless completion service.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Model identifier sent to the service.
    fn model_name(&self) -> &str;

    /// Whether the client was configured and can serve requests.
    fn is_available(&self) -> bool {
        true
    }

    /// Generate a completion for the given messages.
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, AdapterError>;
}

/// A model that is never available (`llm.provider = "disabled"`).
pub struct DisabledModel;

#[async_trait]
impl LanguageModel for DisabledModel {
    fn model_name(&self) -> &str {
        "disabled"
    }

    fn is_available(&self) -> bool {
        false
    }

    async fn complete(&self, _messages: &[ChatMessage]) -> Result<String, AdapterError> {
        Err(AdapterError::unavailable("language model is disabled"))
    }
}
