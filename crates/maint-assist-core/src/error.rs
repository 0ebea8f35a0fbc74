//! Typed failure kinds shared by every adapter.
//!
//! Each external collaborator (knowledge store, KV store, broker, embedding
//! model, language model) reports failures as one of three kinds. Callers
//! match on the kind to decide between degrading, reporting a timeout, or
//! surfacing an internal error; none of them ever reaches an end user
//! verbatim.

/// Failure reported by an adapter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdapterError {
    /// The dependency is not reachable or was never initialized.
    #[error("unavailable: {0}")]
    Unavailable(String),
    /// The dependency did not answer within its bound.
    #[error("timed out after {0}ms")]
    Timeout(u64),
    /// The dependency answered with something we could not use.
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl AdapterError {
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidResponse(msg.into())
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

impl From<serde_json::Error> for AdapterError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidResponse(err.to_string())
    }
}
