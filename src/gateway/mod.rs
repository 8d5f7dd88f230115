//! LLM gateway.
//!
//! Wraps the provider with everything the orchestrator must not care
//! about: per-tier admission control, per-attempt deadlines, exponential
//! backoff with full jitter, fallback-chain advancement, and attempt
//! accounting. Every provider call — including failed retries — becomes
//! one [`Attempt`](crate::ledger::Attempt).

pub mod openai_compatible;
pub mod provider;
pub mod retry;

pub use openai_compatible::OpenAiCompatibleProvider;
pub use provider::{
    ChatChunk, ChatMessage, ChatRequest, ChatResponse, ChunkStream, FinishReason, Provider,
    ProviderError, ProviderResult, TokenUsage,
};
pub use retry::{RetryConfig, retry_with_backoff};

use crate::config::{Config, GatewayConfig, TierTable};
use crate::error::{OrchestratorError, Result};
use crate::ledger::{Attempt, Ledger};
use crate::tier::Tier;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

/// A successfully opened streamed invocation.
///
/// Holds the tier's concurrency permit for as long as the stream lives, so
/// a conversation streaming for a minute occupies its slot for a minute.
pub struct InvokeStarted {
    pub tier: Tier,
    pub model: String,
    pub stream: ChunkStream,
    /// Completed (failed) establishment attempts, in order.
    pub failed_attempts: Vec<Attempt>,
    /// When the live attempt's provider call began.
    pub attempt_started_at: chrono::DateTime<Utc>,
    _permit: OwnedSemaphorePermit,
}

pub struct LlmGateway {
    provider: Arc<dyn Provider>,
    config: GatewayConfig,
    tiers: TierTable,
    ledger: Arc<Ledger>,
    semaphores: [Arc<Semaphore>; 3],
}

impl LlmGateway {
    pub fn new(provider: Arc<dyn Provider>, config: &Config, ledger: Arc<Ledger>) -> Self {
        let permits = config.gateway.concurrency_per_tier;
        Self {
            provider,
            config: config.gateway.clone(),
            tiers: config.tier.clone(),
            ledger,
            semaphores: [
                Arc::new(Semaphore::new(permits)),
                Arc::new(Semaphore::new(permits)),
                Arc::new(Semaphore::new(permits)),
            ],
        }
    }

    fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.config.max_attempts,
            base: Duration::from_millis(self.config.backoff_base_ms),
            cap: Duration::from_millis(self.config.backoff_cap_ms),
        }
    }

    fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.config.attempt_timeout_secs)
    }

    /// Acquire a concurrency slot for a tier, waiting at most the admit
    /// timeout. Expiry surfaces as `Overloaded` with an advisory
    /// retry-after.
    pub async fn admit(&self, tier: Tier) -> Result<OwnedSemaphorePermit> {
        let semaphore = Arc::clone(&self.semaphores[tier.index()]);
        let wait = Duration::from_secs(self.config.admit_timeout_secs);
        match tokio::time::timeout(wait, semaphore.acquire_owned()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(OrchestratorError::internal("gateway semaphore closed")),
            Err(_) => {
                tracing::warn!(tier = %tier, "admission timed out, gateway overloaded");
                Err(OrchestratorError::Overloaded {
                    retry_after_secs: self.config.admit_timeout_secs,
                })
            }
        }
    }

    /// Map a terminal provider error onto the surfaced taxonomy.
    fn surface(err: ProviderError) -> OrchestratorError {
        match err {
            ProviderError::Cancelled => OrchestratorError::Cancelled,
            ProviderError::ContentPolicy(message) => OrchestratorError::UpstreamPolicy { message },
            other => OrchestratorError::UpstreamFailed { message: other.to_string() },
        }
    }

    /// Non-streamed call on one tier, with retries. Used by the
    /// classifier and the context summarizer.
    pub async fn complete_simple(
        &self,
        tier: Tier,
        system: &str,
        user_prompt: &str,
        max_tokens: u32,
        cancel: &CancellationToken,
    ) -> Result<ChatResponse> {
        let _permit = self.admit(tier).await?;
        let model = self.tiers.get(tier).name.clone();
        let request = ChatRequest::new(model, vec![ChatMessage::new("user", user_prompt)])
            .with_system(system)
            .with_max_tokens(max_tokens);

        let attempt_timeout = self.attempt_timeout();
        let provider = Arc::clone(&self.provider);
        let result = retry_with_backoff(
            || {
                let provider = Arc::clone(&provider);
                let request = request.clone();
                async move {
                    match tokio::time::timeout(attempt_timeout, provider.complete(request)).await {
                        Ok(inner) => inner,
                        Err(_) => Err(ProviderError::Timeout),
                    }
                }
            },
            &self.retry_config(),
            cancel,
            |_, _err| self.ledger.record_attempt(tier, false),
        )
        .await;

        match result {
            Ok(response) => {
                self.ledger.record_attempt(tier, true);
                Ok(response)
            }
            Err(err) => Err(Self::surface(err)),
        }
    }

    /// Open a streamed invocation, walking the fallback chain.
    ///
    /// Establishment failures retry with backoff inside each tier; once a
    /// tier's retry budget is exhausted on a retriable error, the next
    /// tier in the chain is tried. Non-retriable errors surface
    /// immediately without advancing the chain.
    pub async fn invoke(
        &self,
        chain: &[Tier],
        system: String,
        messages: Vec<ChatMessage>,
        max_tokens: u32,
        cancel: &CancellationToken,
    ) -> std::result::Result<InvokeStarted, (OrchestratorError, Vec<Attempt>)> {
        let mut attempts: Vec<Attempt> = Vec::new();
        let mut last_err: Option<ProviderError> = None;

        for &tier in chain {
            let permit = match self.admit(tier).await {
                Ok(permit) => permit,
                Err(err @ OrchestratorError::Overloaded { .. }) => {
                    tracing::warn!(tier = %tier, "tier saturated, advancing fallback chain");
                    last_err = Some(ProviderError::Api {
                        status: 503,
                        message: err.to_string(),
                    });
                    continue;
                }
                Err(err) => return Err((err, attempts)),
            };

            let model = self.tiers.get(tier).name.clone();
            let request = ChatRequest::new(model.clone(), messages.clone())
                .with_system(system.clone())
                .with_max_tokens(max_tokens);

            match self.try_tier(tier, request, cancel, &mut attempts).await {
                Ok((stream, started_at)) => {
                    tracing::info!(
                        tier = %tier,
                        model = %model,
                        prior_failures = attempts.len(),
                        "stream opened"
                    );
                    return Ok(InvokeStarted {
                        tier,
                        model,
                        stream,
                        failed_attempts: attempts,
                        attempt_started_at: started_at,
                        _permit: permit,
                    });
                }
                Err(err) if matches!(err, ProviderError::Cancelled) => {
                    return Err((OrchestratorError::Cancelled, attempts));
                }
                Err(err) if !err.is_retriable() => {
                    return Err((Self::surface(err), attempts));
                }
                Err(err) => {
                    tracing::warn!(tier = %tier, error = %err, "tier exhausted, trying next in chain");
                    last_err = Some(err);
                }
            }
        }

        let message = last_err
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no tier available".to_string());
        Err((OrchestratorError::UpstreamFailed { message }, attempts))
    }

    /// Retry loop for one tier. Each provider call appends one completed
    /// [`Attempt`] on failure; the successful call's Attempt is finished
    /// by the caller once the stream ends.
    async fn try_tier(
        &self,
        tier: Tier,
        request: ChatRequest,
        cancel: &CancellationToken,
        attempts: &mut Vec<Attempt>,
    ) -> std::result::Result<(ChunkStream, chrono::DateTime<Utc>), ProviderError> {
        let retry = self.retry_config();
        let attempt_timeout = self.attempt_timeout();
        let model = request.model.clone();
        let mut call_idx = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Err(ProviderError::Cancelled);
            }

            let started_at = Utc::now();
            let opened = tokio::select! {
                result = tokio::time::timeout(attempt_timeout, self.open_stream(tier, request.clone())) => {
                    match result {
                        Ok(inner) => inner,
                        Err(_) => Err(ProviderError::Timeout),
                    }
                }
                _ = cancel.cancelled() => Err(ProviderError::Cancelled),
            };

            match opened {
                Ok(stream) => return Ok((stream, started_at)),
                Err(err) => {
                    if !matches!(err, ProviderError::Cancelled) {
                        attempts.push(Attempt {
                            tier,
                            model: model.clone(),
                            started_at,
                            ended_at: Utc::now(),
                            tokens_in: 0,
                            tokens_out: 0,
                            error: Some(err.to_string()),
                        });
                        self.ledger.record_attempt(tier, false);
                    }

                    if !err.is_retriable() {
                        return Err(err);
                    }
                    call_idx += 1;
                    if call_idx >= retry.max_attempts {
                        return Err(err);
                    }

                    let delay = retry.delay_for(call_idx - 1, err.retry_after());
                    tracing::debug!(
                        tier = %tier,
                        call = call_idx,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "backing off before retry"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
                    }
                }
            }
        }
    }

    /// Open a provider stream, or synthesize one from a non-streamed
    /// completion when the tier does not support streaming.
    async fn open_stream(&self, tier: Tier, request: ChatRequest) -> std::result::Result<ChunkStream, ProviderError> {
        if self.tiers.get(tier).supports_streaming && self.provider.supports_streaming() {
            return self.provider.stream(request).await;
        }

        tracing::debug!(tier = %tier, "tier has no streaming, falling back to single completion");
        let response = self.provider.complete(request).await?;
        let total_tokens = response.usage.output_tokens;
        let chunks = vec![
            Ok(ChatChunk {
                text_delta: Some(response.content),
                finish_reason: None,
                tokens_so_far: total_tokens,
                usage: None,
            }),
            Ok(ChatChunk {
                text_delta: None,
                finish_reason: response.finish_reason.or(Some(FinishReason::Stop)),
                tokens_so_far: total_tokens,
                usage: Some(response.usage),
            }),
        ];
        Ok(Box::pin(futures::stream::iter(chunks)))
    }
}
