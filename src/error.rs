//! Orchestrator error taxonomy.
//!
//! Every surfaced failure carries a stable `kind` slug and a short
//! human-readable message; internal detail stays in the logs. Transient
//! upstream failures are recovered inside the gateway and only reach this
//! type after retry/fallback exhaustion, as [`OrchestratorError::UpstreamFailed`].

use thiserror::Error;

/// Errors surfaced by the orchestrator core.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Malformed input or unknown conversation. Not retried.
    #[error("{message}")]
    InvalidRequest {
        /// Stable sub-kind, e.g. `query_too_long` or `unknown_conversation`.
        kind: &'static str,
        message: String,
    },

    /// Caller is not allowed to touch the resource.
    #[error("not authorized for this conversation")]
    Unauthorized,

    /// Per-conversation lock wait exceeded its deadline.
    #[error("conversation is busy with another request")]
    Busy,

    /// Gateway concurrency saturated; `retry_after_secs` is advisory.
    #[error("service overloaded, retry after {retry_after_secs}s")]
    Overloaded { retry_after_secs: u64 },

    /// Retriable upstream failure that survived the full retry and
    /// fallback chain.
    #[error("language model unavailable: {message}")]
    UpstreamFailed { message: String },

    /// Provider refused the request (content policy). Not retried.
    #[error("request refused by the language model provider")]
    UpstreamPolicy { message: String },

    /// Summarization unavailable and truncation impossible.
    #[error("could not assemble conversation context: {message}")]
    ContextBuildFailed { message: String },

    /// Storage write failed after bounded retries.
    #[error("failed to persist the result: {message}")]
    PersistFailed { message: String },

    /// Cooperative cancellation. A normal terminal state, not a fault.
    #[error("request cancelled")]
    Cancelled,

    /// Unexpected internal failure.
    #[error("internal error")]
    Internal { message: String },
}

impl OrchestratorError {
    /// Stable machine-readable kind slug, for wire surfaces and events.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidRequest { kind, .. } => kind,
            Self::Unauthorized => "unauthorized",
            Self::Busy => "busy",
            Self::Overloaded { .. } => "overloaded",
            Self::UpstreamFailed { .. } => "upstream_failed",
            Self::UpstreamPolicy { .. } => "upstream_policy",
            Self::ContextBuildFailed { .. } => "context_build_failed",
            Self::PersistFailed { .. } => "persist_failed",
            Self::Cancelled => "cancelled",
            Self::Internal { .. } => "internal",
        }
    }

    /// True when a client retry with the same input may succeed later.
    pub fn is_retriable_by_caller(&self) -> bool {
        matches!(self, Self::Busy | Self::Overloaded { .. } | Self::UpstreamFailed { .. })
    }

    pub fn query_too_long(tokens: usize, limit: usize) -> Self {
        Self::InvalidRequest {
            kind: "query_too_long",
            message: format!("query is {tokens} tokens, limit is {limit}"),
        }
    }

    pub fn unknown_conversation(id: uuid::Uuid) -> Self {
        Self::InvalidRequest {
            kind: "unknown_conversation",
            message: format!("conversation {id} does not exist"),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidRequest { kind: "invalid_request", message: message.into() }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }
}

impl From<sqlx::Error> for OrchestratorError {
    fn from(err: sqlx::Error) -> Self {
        Self::PersistFailed { message: err.to_string() }
    }
}

/// Convenience result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, OrchestratorError>;
