mod fallback;

use super::*;
use crate::gateway::{
    ChatChunk, ChatRequest, ChatResponse, ChunkStream, Provider, ProviderError, ProviderResult,
    TokenUsage,
};
use crate::hub::Envelope;
use crate::store::Database;
use async_trait::async_trait;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::broadcast;

/// Mock platform provider.
///
/// `complete` serves classifier and summarizer calls (recognized by their
/// system prompts); `stream` serves the main invocation, optionally
/// failing scripted establishment attempts first, and optionally hanging
/// after a number of deltas to exercise cancellation.
struct MockPlatform {
    /// JSON replies popped per classifier call; last one repeats.
    classifications: StdMutex<Vec<String>>,
    /// Assistant reply, streamed as word-ish deltas.
    reply: String,
    /// Establishment script popped per `stream` call; empty = succeed.
    stream_failures: StdMutex<Vec<ProviderError>>,
    /// Yield this many deltas, then pend forever (for cancellation tests).
    hang_after: Option<usize>,
    /// Close the stream after the deltas without ever sending a finish
    /// reason (simulates a premature upstream close).
    end_without_finish: bool,
    classifier_calls: AtomicUsize,
    summarizer_calls: AtomicUsize,
    stream_calls: AtomicUsize,
}

impl MockPlatform {
    fn new(classification: &str, reply: &str) -> Self {
        Self {
            classifications: StdMutex::new(vec![classification.to_string()]),
            reply: reply.to_string(),
            stream_failures: StdMutex::new(Vec::new()),
            hang_after: None,
            end_without_finish: false,
            classifier_calls: AtomicUsize::new(0),
            summarizer_calls: AtomicUsize::new(0),
            stream_calls: AtomicUsize::new(0),
        }
    }

    fn with_stream_failures(mut self, failures: Vec<ProviderError>) -> Self {
        self.stream_failures = StdMutex::new(failures);
        self
    }

    fn hanging_after(mut self, deltas: usize) -> Self {
        self.hang_after = Some(deltas);
        self
    }

    fn ending_without_finish(mut self) -> Self {
        self.end_without_finish = true;
        self
    }

    fn classifier_calls(&self) -> usize {
        self.classifier_calls.load(Ordering::SeqCst)
    }

    fn summarizer_calls(&self) -> usize {
        self.summarizer_calls.load(Ordering::SeqCst)
    }

    fn deltas(&self) -> Vec<String> {
        // Split the reply into a handful of chunks, keeping it non-empty
        let words: Vec<&str> = self.reply.split_inclusive(' ').collect();
        if words.is_empty() {
            return vec![self.reply.clone()];
        }
        words.chunks(2.max(words.len() / 3)).map(|c| c.concat()).collect()
    }
}

#[async_trait]
impl Provider for MockPlatform {
    fn name(&self) -> &str {
        "mock-platform"
    }

    async fn complete(&self, request: ChatRequest) -> ProviderResult<ChatResponse> {
        let system = request.system.as_deref().unwrap_or_default();
        let content = if system.contains("route aircraft maintenance queries") {
            self.classifier_calls.fetch_add(1, Ordering::SeqCst);
            let mut replies = self.classifications.lock().unwrap();
            if replies.len() > 1 { replies.remove(0) } else { replies[0].clone() }
        } else if system.contains("compress aircraft-maintenance conversation") {
            self.summarizer_calls.fetch_add(1, Ordering::SeqCst);
            "summary: earlier turns covered accumulator precharge checks".to_string()
        } else {
            self.reply.clone()
        };
        Ok(ChatResponse {
            content,
            finish_reason: Some(crate::gateway::FinishReason::Stop),
            usage: TokenUsage { input_tokens: 40, output_tokens: 20 },
        })
    }

    async fn stream(&self, _request: ChatRequest) -> ProviderResult<ChunkStream> {
        self.stream_calls.fetch_add(1, Ordering::SeqCst);
        {
            let mut failures = self.stream_failures.lock().unwrap();
            if !failures.is_empty() {
                return Err(failures.remove(0));
            }
        }

        let deltas = self.deltas();
        let mut chunks: Vec<ProviderResult<ChatChunk>> = Vec::new();
        let mut tokens = 0u32;
        for (i, delta) in deltas.iter().enumerate() {
            if let Some(limit) = self.hang_after
                && i >= limit
            {
                break;
            }
            tokens += 2;
            chunks.push(Ok(ChatChunk {
                text_delta: Some(delta.clone()),
                tokens_so_far: tokens,
                ..Default::default()
            }));
        }

        if self.hang_after.is_some() {
            // Deltas then a stream that never ends
            return Ok(Box::pin(
                futures::stream::iter(chunks).chain(futures::stream::pending()),
            ));
        }
        if self.end_without_finish {
            // Deltas, then the stream just closes
            return Ok(Box::pin(futures::stream::iter(chunks)));
        }

        chunks.push(Ok(ChatChunk {
            finish_reason: Some(crate::gateway::FinishReason::Stop),
            tokens_so_far: tokens,
            usage: Some(TokenUsage { input_tokens: 120, output_tokens: tokens }),
            ..Default::default()
        }));
        Ok(Box::pin(futures::stream::iter(chunks)))
    }
}

fn maintenance_reply(confidence: f64) -> String {
    format!(
        r#"{{"agent": "maintenance", "confidence": {confidence}, "reasoning": "procedure request"}}"#
    )
}

/// Fast-everything config for tests.
fn test_config() -> Config {
    let mut config = Config::default();
    config.gateway.backoff_base_ms = 1;
    config.gateway.backoff_cap_ms = 2;
    config.gateway.max_attempts = 4;
    config.gateway.admit_timeout_secs = 1;
    config.gateway.lock_timeout_secs = 1;
    config.gateway.request_timeout_secs = 10;
    config
}

async fn runtime_with(provider: Arc<dyn Provider>, config: Config) -> Arc<Runtime> {
    let db = Database::connect_in_memory().await.unwrap();
    db.run_migrations().await.unwrap();
    Runtime::new(config, &db, provider)
}

async fn test_runtime(provider: Arc<dyn Provider>) -> Arc<Runtime> {
    runtime_with(provider, test_config()).await
}

fn query(text: &str, conversation_id: Option<Uuid>) -> QueryRequest {
    QueryRequest {
        query: text.to_string(),
        conversation_id,
        user_id: "tech-1".to_string(),
        force_agent_type: None,
        session_id: None,
    }
}

/// Subscribe a fresh session to a conversation, returning its receiver.
fn subscribe(runtime: &Runtime, conversation_id: Uuid) -> (Uuid, broadcast::Receiver<Envelope>) {
    let session_id = Uuid::new_v4();
    runtime.hub.register_session(session_id, "tech-1");
    let rx = runtime.hub.subscribe(session_id, conversation_id).unwrap();
    (session_id, rx)
}

/// Drain buffered events until `done` (or the buffer empties), returning
/// the event kinds in delivery order.
fn drain_kinds(rx: &mut broadcast::Receiver<Envelope>) -> Vec<String> {
    let mut kinds = Vec::new();
    while let Ok(envelope) = rx.try_recv() {
        kinds.push(envelope.event.kind().to_string());
    }
    kinds
}

/// Collapse consecutive duplicate kinds (token_delta bursts).
fn dedup_consecutive(kinds: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for kind in kinds {
        if out.last().map(|l| l != kind).unwrap_or(true) {
            out.push(kind.clone());
        }
    }
    out
}
