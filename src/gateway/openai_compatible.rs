//! OpenAI-compatible chat provider.
//!
//! Speaks the chat-completions protocol over HTTP, which covers the
//! official API and any compatible gateway (Azure front-ends, local
//! vLLM/Ollama deployments). One instance serves all tiers; the tier's
//! deployment name travels in the request.

use super::provider::{
    ChatChunk, ChatRequest, ChatResponse, ChunkStream, FinishReason, Provider, ProviderError,
    ProviderResult, TokenUsage,
};
use async_trait::async_trait;
use futures::stream::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

#[derive(Clone)]
pub struct OpenAiCompatibleProvider {
    api_key: String,
    base_url: String,
    client: Client,
}

impl OpenAiCompatibleProvider {
    /// `api_key` may be empty for local deployments that skip auth.
    pub fn new(base_url: String, api_key: String) -> ProviderResult<Self> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .connect_timeout(DEFAULT_CONNECT_TIMEOUT)
            .pool_idle_timeout(DEFAULT_POOL_IDLE_TIMEOUT)
            .pool_max_idle_per_host(2)
            .build()
            .map_err(|e| ProviderError::Network(format!("http client build failed: {e}")))?;

        Ok(Self { api_key, base_url, client })
    }

    fn headers(&self) -> ProviderResult<reqwest::header::HeaderMap> {
        let mut headers = reqwest::header::HeaderMap::new();
        if !self.api_key.is_empty() {
            let clean_key = self.api_key.trim();
            let value: reqwest::header::HeaderValue = format!("Bearer {clean_key}")
                .parse()
                .map_err(|_| ProviderError::Malformed("API key contains invalid characters".into()))?;
            headers.insert(reqwest::header::AUTHORIZATION, value);
        }
        headers.insert(
            reqwest::header::CONTENT_TYPE,
            "application/json".parse().expect("valid content-type"),
        );
        Ok(headers)
    }

    fn to_wire_request(&self, request: &ChatRequest, stream: bool) -> WireRequest {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if let Some(system) = &request.system {
            messages.push(WireMessage { role: "system".to_string(), content: system.clone() });
        }
        for msg in &request.messages {
            messages.push(WireMessage { role: msg.role.clone(), content: msg.content.clone() });
        }
        WireRequest {
            model: request.model.clone(),
            messages,
            temperature: request.temperature,
            max_tokens: Some(request.max_tokens),
            stream: if stream { Some(true) } else { None },
            stream_options: stream.then_some(StreamOptions { include_usage: true }),
        }
    }

    /// Map an error response, extracting the retry-after hint for 429s.
    async fn handle_error(&self, response: reqwest::Response) -> ProviderError {
        let status = response.status().as_u16();

        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs);

        let message = match response.json::<WireErrorResponse>().await {
            Ok(body) => body.error.message,
            Err(_) => format!("HTTP {status}"),
        };

        if status == 429 {
            return ProviderError::RateLimited { message, retry_after };
        }
        // Content-filter refusals come back as 400 with a distinctive code
        if status == 400 && message.to_lowercase().contains("content") {
            return ProviderError::ContentPolicy(message);
        }
        ProviderError::Api { status, message }
    }

    fn map_finish_reason(reason: &str) -> Option<FinishReason> {
        match reason {
            "stop" => Some(FinishReason::Stop),
            "length" => Some(FinishReason::Length),
            "content_filter" => Some(FinishReason::ContentFilter),
            _ => Some(FinishReason::Stop),
        }
    }
}

#[async_trait]
impl Provider for OpenAiCompatibleProvider {
    fn name(&self) -> &str {
        "openai-compatible"
    }

    async fn complete(&self, request: ChatRequest) -> ProviderResult<ChatResponse> {
        let wire = self.to_wire_request(&request, false);
        tracing::debug!(model = %wire.model, messages = wire.messages.len(), "completion request");

        let response = self
            .client
            .post(&self.base_url)
            .headers(self.headers()?)
            .json(&wire)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }

        let body: WireResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Stream(format!("bad response body: {e}")))?;

        let choice = body
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::Stream("response had no choices".into()))?;

        let usage = body.usage.map(|u| TokenUsage {
            input_tokens: u.prompt_tokens.unwrap_or(0),
            output_tokens: u.completion_tokens.unwrap_or(0),
        });

        tracing::debug!(
            input_tokens = usage.map(|u| u.input_tokens).unwrap_or(0),
            output_tokens = usage.map(|u| u.output_tokens).unwrap_or(0),
            "completion response"
        );

        Ok(ChatResponse {
            content: choice.message.and_then(|m| m.content).unwrap_or_default(),
            finish_reason: choice.finish_reason.as_deref().and_then(Self::map_finish_reason),
            usage: usage.unwrap_or_default(),
        })
    }

    async fn stream(&self, request: ChatRequest) -> ProviderResult<ChunkStream> {
        let wire = self.to_wire_request(&request, true);
        tracing::debug!(model = %wire.model, messages = wire.messages.len(), "stream request");

        let response = self
            .client
            .post(&self.base_url)
            .headers(self.headers()?)
            .json(&wire)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }

        // Server-Sent Events: buffer bytes, emit one ChatChunk per complete
        // `data:` line. Token totals accumulate across deltas; the final
        // chunk carries the provider-reported usage when sent.
        struct SseState {
            buffer: String,
            tokens_so_far: u32,
            finished: bool,
        }
        let state = std::sync::Arc::new(std::sync::Mutex::new(SseState {
            buffer: String::new(),
            tokens_so_far: 0,
            finished: false,
        }));

        let byte_stream = response.bytes_stream();
        let chunk_stream = byte_stream
            .map(move |chunk_result| -> Vec<ProviderResult<ChatChunk>> {
                let bytes = match chunk_result {
                    Ok(bytes) => bytes,
                    Err(e) => return vec![Err(ProviderError::Stream(e.to_string()))],
                };

                let mut st = state.lock().expect("SSE state lock poisoned");
                st.buffer.push_str(&String::from_utf8_lossy(&bytes));

                let mut out = Vec::new();
                while let Some(newline) = st.buffer.find('\n') {
                    let line = st.buffer[..newline].trim().to_string();
                    st.buffer.drain(..=newline);

                    let Some(json_str) = line.strip_prefix("data: ") else {
                        continue;
                    };
                    if json_str == "[DONE]" {
                        if !st.finished {
                            st.finished = true;
                            out.push(Ok(ChatChunk {
                                finish_reason: Some(FinishReason::Stop),
                                tokens_so_far: st.tokens_so_far,
                                ..Default::default()
                            }));
                        }
                        continue;
                    }

                    let parsed: WireStreamChunk = match serde_json::from_str(json_str) {
                        Ok(parsed) => parsed,
                        Err(e) => {
                            tracing::warn!(error = %e, "unparseable stream chunk, skipping");
                            continue;
                        }
                    };

                    let delta_text = parsed
                        .choices
                        .first()
                        .and_then(|c| c.delta.as_ref())
                        .and_then(|d| d.content.clone());
                    let finish = parsed
                        .choices
                        .first()
                        .and_then(|c| c.finish_reason.as_deref())
                        .and_then(Self::map_finish_reason);
                    let usage = parsed.usage.map(|u| TokenUsage {
                        input_tokens: u.prompt_tokens.unwrap_or(0),
                        output_tokens: u.completion_tokens.unwrap_or(0),
                    });

                    if let Some(text) = &delta_text {
                        st.tokens_so_far += crate::tokens::count(
                            text,
                            crate::tokens::ModelFamily::for_model(&parsed.model),
                        ) as u32;
                    }
                    if let Some(u) = usage {
                        st.tokens_so_far = st.tokens_so_far.max(u.output_tokens);
                    }

                    if delta_text.is_none() && finish.is_none() && usage.is_none() {
                        continue;
                    }
                    if finish.is_some() {
                        st.finished = true;
                    }
                    out.push(Ok(ChatChunk {
                        text_delta: delta_text,
                        finish_reason: finish,
                        tokens_so_far: st.tokens_so_far,
                        usage,
                    }));
                }
                out
            })
            .flat_map(futures::stream::iter);

        Ok(Box::pin(chunk_stream))
    }
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Clone, Serialize)]
struct WireRequest {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
}

#[derive(Debug, Clone, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireMessage {
    role: String,
    content: String,
}

#[derive(Debug, Clone, Deserialize)]
struct WireResponse {
    choices: Vec<WireChoice>,
    usage: Option<WireUsage>,
}

#[derive(Debug, Clone, Deserialize)]
struct WireChoice {
    message: Option<WireResponseMessage>,
    finish_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct WireResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct WireUsage {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
struct WireStreamChunk {
    #[serde(default)]
    model: String,
    #[serde(default)]
    choices: Vec<WireStreamChoice>,
    usage: Option<WireUsage>,
}

#[derive(Debug, Clone, Deserialize)]
struct WireStreamChoice {
    delta: Option<WireDelta>,
    finish_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct WireDelta {
    content: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct WireErrorResponse {
    error: WireError,
}

#[derive(Debug, Clone, Deserialize)]
struct WireError {
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::provider::ChatMessage;

    fn provider() -> OpenAiCompatibleProvider {
        OpenAiCompatibleProvider::new(
            "http://localhost:9999/v1/chat/completions".to_string(),
            "test-key".to_string(),
        )
        .unwrap()
    }

    #[test]
    fn system_prompt_becomes_first_wire_message() {
        let request = ChatRequest::new("m", vec![ChatMessage::new("user", "hello")])
            .with_system("be brief");
        let wire = provider().to_wire_request(&request, false);
        assert_eq!(wire.messages[0].role, "system");
        assert_eq!(wire.messages[0].content, "be brief");
        assert_eq!(wire.messages[1].role, "user");
        assert!(wire.stream.is_none());
    }

    #[test]
    fn streaming_request_asks_for_usage() {
        let request = ChatRequest::new("m", vec![ChatMessage::new("user", "hello")]);
        let wire = provider().to_wire_request(&request, true);
        assert_eq!(wire.stream, Some(true));
        assert!(wire.stream_options.is_some());
    }

    #[test]
    fn finish_reason_mapping() {
        assert_eq!(
            OpenAiCompatibleProvider::map_finish_reason("stop"),
            Some(FinishReason::Stop)
        );
        assert_eq!(
            OpenAiCompatibleProvider::map_finish_reason("length"),
            Some(FinishReason::Length)
        );
        assert_eq!(
            OpenAiCompatibleProvider::map_finish_reason("content_filter"),
            Some(FinishReason::ContentFilter)
        );
    }

    #[test]
    fn empty_api_key_sends_no_auth_header() {
        let provider = OpenAiCompatibleProvider::new("http://x".to_string(), String::new()).unwrap();
        let headers = provider.headers().unwrap();
        assert!(!headers.contains_key(reqwest::header::AUTHORIZATION));
    }

    #[test]
    fn stream_chunk_parses_delta() {
        let raw = r#"{"id":"c1","model":"gpt-4o","choices":[{"delta":{"content":"Hel"},"finish_reason":null}]}"#;
        let chunk: WireStreamChunk = serde_json::from_str(raw).unwrap();
        assert_eq!(
            chunk.choices[0].delta.as_ref().unwrap().content.as_deref(),
            Some("Hel")
        );
    }
}
