//! LLM provider abstraction.
//!
//! The gateway depends only on this narrow contract: a chat-style
//! request/response with streaming chunks, distinguishable retriable vs
//! non-retriable errors, and a retry-after hint for rate limits. Any
//! provider matching this shape is substitutable.

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

/// Provider-level errors, split into retriable and permanent.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    /// HTTP 429. Carries the provider's retry-after hint when present.
    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    /// Upstream HTTP error with a status code.
    #[error("provider returned {status}: {message}")]
    Api { status: u16, message: String },

    /// Connection-level failure (DNS, reset, TLS).
    #[error("network error: {0}")]
    Network(String),

    /// The attempt deadline elapsed.
    #[error("attempt timed out")]
    Timeout,

    /// Provider refused on content-policy grounds. Never retried.
    #[error("content policy refusal: {0}")]
    ContentPolicy(String),

    /// We built a request the provider cannot accept. Never retried.
    #[error("malformed request: {0}")]
    Malformed(String),

    /// Stream broke mid-flight.
    #[error("stream error: {0}")]
    Stream(String),

    /// The run was cancelled while a call was in flight.
    #[error("cancelled")]
    Cancelled,
}

impl ProviderError {
    /// Whether a retry of the same request may succeed.
    ///
    /// Retriable: 429, 5xx, 408, network resets, timeouts, broken streams.
    /// Everything else surfaces immediately.
    pub fn is_retriable(&self) -> bool {
        match self {
            ProviderError::RateLimited { .. } => true,
            ProviderError::Api { status, .. } => {
                matches!(status, 408 | 429 | 500 | 502 | 503 | 504)
            }
            ProviderError::Network(_) | ProviderError::Timeout | ProviderError::Stream(_) => true,
            ProviderError::ContentPolicy(_)
            | ProviderError::Malformed(_)
            | ProviderError::Cancelled => false,
        }
    }

    /// Provider-supplied retry-after hint, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ProviderError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::Timeout
        } else {
            ProviderError::Network(err.to_string())
        }
    }
}

pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// Why the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
}

/// Token usage reported by the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// One wire-level chat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self { role: role.into(), content: content.into() }
    }
}

/// A chat completion request.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub system: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
    pub temperature: Option<f32>,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            system: None,
            messages,
            max_tokens: 1024,
            temperature: None,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

/// A full, non-streamed completion.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: String,
    pub finish_reason: Option<FinishReason>,
    pub usage: TokenUsage,
}

/// One streamed increment.
///
/// `tokens_so_far` is the running output-token count; the final chunk
/// carries the provider-reported usage when available.
#[derive(Debug, Clone, Default)]
pub struct ChatChunk {
    pub text_delta: Option<String>,
    pub finish_reason: Option<FinishReason>,
    pub tokens_so_far: u32,
    pub usage: Option<TokenUsage>,
}

impl ChatChunk {
    pub fn is_final(&self) -> bool {
        self.finish_reason.is_some()
    }
}

/// Lazy chunk sequence; the caller owns flow control.
pub type ChunkStream = Pin<Box<dyn Stream<Item = ProviderResult<ChatChunk>> + Send>>;

/// The provider contract the gateway is written against.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Provider name, for logs and attempt records.
    fn name(&self) -> &str;

    fn supports_streaming(&self) -> bool {
        true
    }

    /// Single-shot completion.
    async fn complete(&self, request: ChatRequest) -> ProviderResult<ChatResponse>;

    /// Streamed completion.
    async fn stream(&self, request: ChatRequest) -> ProviderResult<ChunkStream>;
}
