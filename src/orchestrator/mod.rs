//! Orchestrator core.
//!
//! Drives one request run through its state machine: classify the query,
//! select a tier, build the context window, stream the completion, persist
//! the assistant turn, and record the run. A per-conversation lock is held
//! from before the user message is appended until the run reaches a
//! terminal state, so exactly one run streams per conversation at a time.

pub mod locks;

#[cfg(test)]
mod tests;

use crate::agents::AgentKind;
use crate::classifier::{ClassificationDecision, Classifier};
use crate::config::Config;
use crate::context::{ContextManager, ContextWindow};
use crate::error::{OrchestratorError, Result};
use crate::gateway::{FinishReason, LlmGateway, Provider};
use crate::hub::{HubEvent, SessionHub};
use crate::ledger::{Attempt, Ledger, RequestRunRecord, RunOutcome};
use crate::pricing;
use crate::selector::{CostPolicy, ModelDecision, ModelSelector};
use crate::store::{Conversation, ConversationStore, Database, Message, MessageMeta, MessageRole};
use crate::tier::Tier;
use crate::tokens::{self, ModelFamily};
use chrono::Utc;
use futures::StreamExt;
use locks::ConversationLocks;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Lifecycle of one request run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Received,
    Classifying,
    Selecting,
    Building,
    Invoking,
    Streaming,
    Persisting,
    Completed,
    Failed,
    Cancelled,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Completed | RunState::Failed | RunState::Cancelled)
    }

    /// Legal transitions: the forward chain, plus Failed/Cancelled from
    /// any non-terminal state.
    pub fn can_advance_to(self, next: RunState) -> bool {
        use RunState::*;
        if self.is_terminal() {
            return false;
        }
        matches!(
            (self, next),
            (Received, Classifying)
                | (Classifying, Selecting)
                | (Selecting, Building)
                | (Building, Invoking)
                | (Invoking, Streaming)
                | (Streaming, Persisting)
                | (Persisting, Completed)
        ) || matches!(next, Failed | Cancelled)
    }
}

/// An inbound query, already authenticated.
#[derive(Debug, Clone, Deserialize)]
pub struct QueryRequest {
    pub query: String,
    pub conversation_id: Option<Uuid>,
    pub user_id: String,
    pub force_agent_type: Option<AgentKind>,
    /// Real-time session that initiated the run, when there is one.
    pub session_id: Option<Uuid>,
}

/// The completed answer for one query.
#[derive(Debug, Clone, Serialize)]
pub struct QueryResponse {
    pub response: String,
    pub agent_type: AgentKind,
    pub agent_name: &'static str,
    pub confidence: f64,
    pub conversation_id: Uuid,
    pub message_id: Uuid,
}

/// Mutable run bookkeeping, shared with the cancellable pipeline future so
/// the terminal handler sees everything gathered before an abort.
struct RunCtx {
    state: RunState,
    agent: Option<AgentKind>,
    tier: Option<Tier>,
    attempts: Vec<Attempt>,
    tokens_in: u32,
    tokens_out: u32,
    warning: Option<String>,
    message_id: Option<Uuid>,
}

impl RunCtx {
    fn new() -> Self {
        Self {
            state: RunState::Received,
            agent: None,
            tier: None,
            attempts: Vec::new(),
            tokens_in: 0,
            tokens_out: 0,
            warning: None,
            message_id: None,
        }
    }
}

type SharedRunCtx = Arc<Mutex<RunCtx>>;

fn advance(ctx: &SharedRunCtx, run_id: Uuid, next: RunState) {
    let mut ctx = ctx.lock().expect("run ctx lock poisoned");
    debug_assert!(
        ctx.state.can_advance_to(next),
        "illegal transition {:?} -> {next:?}",
        ctx.state
    );
    tracing::trace!(run_id = %run_id, from = ?ctx.state, to = ?next, "run state");
    ctx.state = next;
}

/// Everything a request run needs, dependency-injected. Tests build their
/// own with an in-memory database and a mock provider.
pub struct Runtime {
    pub config: Config,
    pub store: ConversationStore,
    pub context: ContextManager,
    pub classifier: Classifier,
    pub selector: ModelSelector,
    pub gateway: Arc<LlmGateway>,
    pub hub: Arc<SessionHub>,
    pub ledger: Arc<Ledger>,
    locks: ConversationLocks,
}

impl Runtime {
    /// Assemble a runtime. Must be called inside a tokio runtime (the
    /// ledger spawns its aggregator task).
    pub fn new(config: Config, database: &Database, provider: Arc<dyn Provider>) -> Arc<Self> {
        let store = ConversationStore::new(database.pool().clone());
        let ledger = Ledger::spawn(config.selector.failure_window);
        let gateway = Arc::new(LlmGateway::new(provider, &config, Arc::clone(&ledger)));
        let hub = Arc::new(SessionHub::from_config(&config.session));
        let context = ContextManager::new(store.clone(), config.context.clone());
        let classifier = Classifier::new(config.classifier.confidence_threshold);
        let selector = ModelSelector::new(&config);

        Arc::new(Self {
            config,
            store,
            context,
            classifier,
            selector,
            gateway,
            hub,
            ledger,
            locks: ConversationLocks::new(),
        })
    }

    /// Handle one user query end to end.
    pub async fn handle_query(
        &self,
        request: QueryRequest,
        cancel: CancellationToken,
    ) -> Result<QueryResponse> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let clock = Instant::now();

        let query = request.query.trim().to_string();
        if query.is_empty() {
            return Err(OrchestratorError::invalid("query must not be empty"));
        }

        // A query that cannot fit even the largest window is hopeless.
        let large = self.config.tier.get(Tier::Large);
        let hard_limit =
            (large.context_tokens.saturating_sub(self.config.context.reserve_tokens)) as usize;
        let query_tokens = tokens::count(&query, ModelFamily::for_model(&large.name));
        if query_tokens > hard_limit {
            return Err(OrchestratorError::query_too_long(query_tokens, hard_limit));
        }

        // Admission probe before anything is persisted: a saturated gateway
        // turns the request away with the conversation untouched.
        drop(self.gateway.admit(Tier::Small).await?);

        let conversation = match request.conversation_id {
            Some(id) => {
                let conversation = self.store.get_conversation_required(id).await?;
                if conversation.owner_id != request.user_id {
                    return Err(OrchestratorError::Unauthorized);
                }
                conversation
            }
            None => {
                let title: String = query.chars().take(60).collect();
                self.store.create_conversation(&request.user_id, &title).await?
            }
        };
        let conversation_id = conversation.id;

        // Disconnecting the initiating session cancels the run.
        if let Some(session_id) = request.session_id {
            self.hub.register_run(session_id, cancel.clone());
        }

        let _guard = self
            .locks
            .acquire(conversation_id, Duration::from_secs(self.config.gateway.lock_timeout_secs))
            .await?;

        let ctx: SharedRunCtx = Arc::new(Mutex::new(RunCtx::new()));
        let deadline = Duration::from_secs(self.config.gateway.request_timeout_secs);

        let outcome = tokio::select! {
            result = tokio::time::timeout(
                deadline,
                self.run_pipeline(run_id, &conversation, &query, query_tokens, &request, &ctx, &cancel),
            ) => {
                match result {
                    Ok(inner) => inner,
                    Err(_) => Err(OrchestratorError::UpstreamFailed {
                        message: format!("request deadline of {}s exceeded", deadline.as_secs()),
                    }),
                }
            }
            _ = cancel.cancelled() => Err(OrchestratorError::Cancelled),
        };

        let latency_ms = clock.elapsed().as_millis() as u64;
        match outcome {
            Ok(response) => {
                self.finish_run(
                    run_id,
                    conversation_id,
                    &request.user_id,
                    &ctx,
                    RunOutcome::Ok,
                    None,
                    started_at,
                    latency_ms,
                );
                Ok(response)
            }
            Err(err) => {
                let (terminal, outcome_kind) = match err {
                    OrchestratorError::Cancelled => (RunState::Cancelled, RunOutcome::Cancelled),
                    _ => (RunState::Failed, RunOutcome::Failed),
                };
                {
                    let mut ctx = ctx.lock().expect("run ctx lock poisoned");
                    if !ctx.state.is_terminal() {
                        ctx.state = terminal;
                    }
                }
                self.hub.publish(
                    conversation_id,
                    HubEvent::Error { kind: err.kind().to_string(), message: err.to_string() },
                );
                self.finish_run(
                    run_id,
                    conversation_id,
                    &request.user_id,
                    &ctx,
                    outcome_kind,
                    Some(err.kind().to_string()),
                    started_at,
                    latency_ms,
                );
                tracing::warn!(
                    run_id = %run_id,
                    conversation_id = %conversation_id,
                    kind = err.kind(),
                    "run terminated: {err}"
                );
                Err(err)
            }
        }
    }

    /// The Received → … → Completed pipeline, run under the conversation
    /// lock, the request deadline, and the cancellation token.
    #[allow(clippy::too_many_arguments)]
    async fn run_pipeline(
        &self,
        run_id: Uuid,
        conversation: &Conversation,
        query: &str,
        query_tokens: usize,
        request: &QueryRequest,
        ctx: &SharedRunCtx,
        cancel: &CancellationToken,
    ) -> Result<QueryResponse> {
        let conversation_id = conversation.id;
        let prior_hint = conversation.agent_hint_kind();

        // Recent turns for the classifier, captured before this query is
        // appended.
        let recent = self.store.read(conversation_id, Some(6)).await?;
        let recent_context = render_recent(&recent);

        // The user message lands before classification begins; it stays
        // even if the run fails later.
        let user_message = self
            .store
            .append(
                conversation_id,
                MessageRole::User,
                query,
                MessageMeta { tokens_in: query_tokens as i64, ..Default::default() },
            )
            .await?;

        advance(ctx, run_id, RunState::Classifying);
        let classification = self
            .classifier
            .classify(
                &self.gateway,
                query,
                &recent_context,
                prior_hint,
                request.force_agent_type,
                cancel,
            )
            .await?;
        ctx.lock().expect("run ctx lock poisoned").agent = Some(classification.agent);
        self.hub.publish(
            conversation_id,
            HubEvent::Classified {
                agent: classification.agent,
                confidence: classification.confidence,
                forced: classification.forced,
                fallback_from: classification.fallback_from.clone(),
            },
        );
        tracing::info!(
            run_id = %run_id,
            agent = %classification.agent,
            confidence = classification.confidence,
            forced = classification.forced,
            "query classified"
        );

        advance(ctx, run_id, RunState::Selecting);
        let decision = self
            .select_model(&request.user_id, query, query_tokens, &classification, conversation_id)
            .await?;
        ctx.lock().expect("run ctx lock poisoned").tier = Some(decision.primary);
        self.hub.publish(
            conversation_id,
            HubEvent::ModelSelected {
                tier: decision.primary,
                model: self.config.tier.get(decision.primary).name.clone(),
                estimated_cost: decision.estimated_cost,
            },
        );

        advance(ctx, run_id, RunState::Building);
        // Fresh snapshot: the cached summary may have changed since the
        // pre-lock read.
        let conversation = self.store.get_conversation_required(conversation_id).await?;
        let window = self
            .context
            .build_window(
                &conversation,
                self.config.tier.get(decision.primary),
                classification.agent,
                self.gateway.as_ref(),
                cancel,
            )
            .await?;
        if let Some(warning) = &window.warning {
            ctx.lock().expect("run ctx lock poisoned").warning = Some(warning.clone());
        }

        advance(ctx, run_id, RunState::Invoking);
        let (text, tier_used, usage_in, usage_out) = self
            .stream_completion(run_id, conversation_id, &classification, &decision, &window, prior_hint, ctx, cancel)
            .await?;

        advance(ctx, run_id, RunState::Persisting);
        let assistant = self
            .persist_assistant(
                conversation_id,
                &text,
                classification.agent,
                tier_used,
                usage_in,
                usage_out,
            )
            .await?;
        debug_assert_eq!(assistant.seq, user_message.seq + 1);

        {
            let mut ctx = ctx.lock().expect("run ctx lock poisoned");
            ctx.tokens_in = usage_in;
            ctx.tokens_out = usage_out;
            ctx.message_id = Some(assistant.id);
        }

        self.hub.publish(conversation_id, HubEvent::AssistantMessage { message: assistant.clone() });
        self.hub.publish(
            conversation_id,
            HubEvent::Done {
                conversation_id,
                message_id: Some(assistant.id),
                outcome: RunOutcome::Ok,
            },
        );
        advance(ctx, run_id, RunState::Completed);

        Ok(QueryResponse {
            response: text,
            agent_type: classification.agent,
            agent_name: classification.agent.display_name(),
            confidence: classification.confidence,
            conversation_id,
            message_id: assistant.id,
        })
    }

    /// Selector inputs that need storage or ledger reads.
    async fn select_model(
        &self,
        owner_id: &str,
        query: &str,
        query_tokens: usize,
        classification: &ClassificationDecision,
        conversation_id: Uuid,
    ) -> Result<ModelDecision> {
        let assistant_turns = self.store.count_assistant_messages(conversation_id).await?;
        let budget_remaining = match self.config.budget.per_owner_limit {
            Some(limit) => limit - self.ledger.usage_summary(owner_id).total_cost,
            None => f64::INFINITY,
        };
        Ok(self.selector.select(
            query,
            query_tokens,
            classification.agent,
            assistant_turns,
            CostPolicy { prefer_cheap: false, budget_remaining },
            &self.ledger,
        ))
    }

    /// Invoke the gateway and fan streamed tokens out to subscribers.
    /// Returns the accumulated text and token usage.
    #[allow(clippy::too_many_arguments)]
    async fn stream_completion(
        &self,
        run_id: Uuid,
        conversation_id: Uuid,
        classification: &ClassificationDecision,
        decision: &ModelDecision,
        window: &ContextWindow,
        prior_hint: Option<AgentKind>,
        ctx: &SharedRunCtx,
        cancel: &CancellationToken,
    ) -> Result<(String, Tier, u32, u32)> {
        let max_tokens = self.config.context.reserve_tokens;
        let invoke = self
            .gateway
            .invoke(
                &decision.chain,
                window.system_preamble.clone(),
                window.chat_messages(),
                max_tokens,
                cancel,
            )
            .await;

        let mut started = match invoke {
            Ok(started) => started,
            Err((err, attempts)) => {
                ctx.lock().expect("run ctx lock poisoned").attempts.extend(attempts);
                return Err(err);
            }
        };
        {
            let mut ctx = ctx.lock().expect("run ctx lock poisoned");
            ctx.attempts.append(&mut started.failed_attempts);
            ctx.tier = Some(started.tier);
        }

        let mut text = String::new();
        let mut usage: Option<crate::gateway::TokenUsage> = None;
        let mut tokens_so_far = 0u32;
        let mut first_chunk = true;
        let mut finish: Option<FinishReason> = None;

        loop {
            let next = tokio::select! {
                chunk = started.stream.next() => chunk,
                _ = cancel.cancelled() => {
                    // Dropping the stream closes the upstream connection.
                    return Err(OrchestratorError::Cancelled);
                }
            };
            let Some(chunk) = next else { break };
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => {
                    let failed = Attempt {
                        tier: started.tier,
                        model: started.model.clone(),
                        started_at: started.attempt_started_at,
                        ended_at: Utc::now(),
                        tokens_in: 0,
                        tokens_out: tokens_so_far,
                        error: Some(err.to_string()),
                    };
                    self.ledger.record_attempt(started.tier, false);
                    ctx.lock().expect("run ctx lock poisoned").attempts.push(failed);
                    return Err(OrchestratorError::UpstreamFailed {
                        message: format!("stream broke mid-response: {err}"),
                    });
                }
            };

            if first_chunk {
                first_chunk = false;
                advance(ctx, run_id, RunState::Streaming);
                if let Some(previous) = prior_hint
                    && previous != classification.agent
                {
                    self.hub.publish(
                        conversation_id,
                        HubEvent::AgentSwitched { from: Some(previous), to: classification.agent },
                    );
                }
                self.hub.publish(
                    conversation_id,
                    HubEvent::TypingStart { agent: classification.agent },
                );
            }

            tokens_so_far = tokens_so_far.max(chunk.tokens_so_far);
            if let Some(delta) = chunk.text_delta {
                text.push_str(&delta);
                self.hub.publish(conversation_id, HubEvent::TokenDelta { text: delta });
            }
            if let Some(u) = chunk.usage {
                usage = Some(u);
            }
            if let Some(reason) = chunk.finish_reason {
                finish = Some(reason);
                break;
            }
        }

        // A stream that closes without a finish reason is the same failure
        // class as an explicit mid-stream error: part of the answer may be
        // missing, so nothing is persisted as a complete reply.
        if finish.is_none() {
            let message = "stream closed before a finish reason was received";
            tracing::warn!(run_id = %run_id, tier = %started.tier, "{message}");
            self.ledger.record_attempt(started.tier, false);
            ctx.lock().expect("run ctx lock poisoned").attempts.push(Attempt {
                tier: started.tier,
                model: started.model.clone(),
                started_at: started.attempt_started_at,
                ended_at: Utc::now(),
                tokens_in: 0,
                tokens_out: tokens_so_far,
                error: Some(message.to_string()),
            });
            return Err(OrchestratorError::UpstreamFailed { message: message.to_string() });
        }
        self.hub.publish(conversation_id, HubEvent::TypingEnd);

        let tokens_in = usage
            .map(|u| u.input_tokens)
            .filter(|t| *t > 0)
            .unwrap_or(window.prompt_tokens as u32);
        let tokens_out = usage
            .map(|u| u.output_tokens)
            .filter(|t| *t > 0)
            .unwrap_or(tokens_so_far);

        // The successful attempt, closed out now that the stream is done.
        self.ledger.record_attempt(started.tier, true);
        ctx.lock().expect("run ctx lock poisoned").attempts.push(Attempt {
            tier: started.tier,
            model: started.model.clone(),
            started_at: started.attempt_started_at,
            ended_at: Utc::now(),
            tokens_in,
            tokens_out,
            error: None,
        });

        Ok((text, started.tier, tokens_in, tokens_out))
    }

    /// Append the assistant message with bounded retries on storage
    /// failure. Unknown-conversation errors (deleted mid-run) fail fast.
    async fn persist_assistant(
        &self,
        conversation_id: Uuid,
        text: &str,
        agent: AgentKind,
        tier: Tier,
        tokens_in: u32,
        tokens_out: u32,
    ) -> Result<Message> {
        const PERSIST_ATTEMPTS: u32 = 3;
        let meta = MessageMeta::assistant(agent, tier, tokens_in as i64, tokens_out as i64);

        let mut last_err = None;
        for attempt in 0..PERSIST_ATTEMPTS {
            match self
                .store
                .append(conversation_id, MessageRole::Assistant, text, meta.clone())
                .await
            {
                Ok(message) => return Ok(message),
                Err(err @ OrchestratorError::InvalidRequest { .. }) => return Err(err),
                Err(err) => {
                    tracing::warn!(attempt, error = %err, "assistant append failed, retrying");
                    last_err = Some(err);
                    tokio::time::sleep(Duration::from_millis(100 * (attempt as u64 + 1))).await;
                }
            }
        }
        Err(OrchestratorError::PersistFailed {
            message: last_err.map(|e| e.to_string()).unwrap_or_else(|| "storage write failed".into()),
        })
    }

    /// Delete a conversation: cascade messages, terminate subscriptions.
    pub async fn delete_conversation(&self, conversation_id: Uuid, user_id: &str) -> Result<()> {
        let conversation = self.store.get_conversation_required(conversation_id).await?;
        if conversation.owner_id != user_id {
            return Err(OrchestratorError::Unauthorized);
        }
        self.store.delete_conversation(conversation_id).await?;
        self.hub.terminate_conversation(conversation_id);
        self.locks.forget(conversation_id);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn finish_run(
        &self,
        run_id: Uuid,
        conversation_id: Uuid,
        owner_id: &str,
        ctx: &SharedRunCtx,
        outcome: RunOutcome,
        error_kind: Option<String>,
        started_at: chrono::DateTime<Utc>,
        latency_ms: u64,
    ) {
        let ctx = ctx.lock().expect("run ctx lock poisoned");
        let cost = ctx
            .tier
            .map(|tier| {
                pricing::estimate_cost(ctx.tokens_in, ctx.tokens_out, self.config.tier.get(tier))
            })
            .unwrap_or(0.0);
        self.ledger.record_run(RequestRunRecord {
            run_id,
            conversation_id,
            owner_id: owner_id.to_string(),
            agent: ctx.agent.unwrap_or(AgentKind::DEFAULT),
            tier: ctx.tier,
            attempts: ctx.attempts.clone(),
            outcome,
            tokens_in: ctx.tokens_in,
            tokens_out: ctx.tokens_out,
            cost,
            latency_ms,
            warning: ctx.warning.clone(),
            error_kind,
            started_at,
        });
    }
}

/// Compact transcript excerpt for the classifier prompt.
fn render_recent(messages: &[Message]) -> String {
    let mut out = String::new();
    for msg in messages {
        let snippet: String = msg.content.chars().take(200).collect();
        out.push_str(&msg.role);
        out.push_str(": ");
        out.push_str(&snippet);
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod state_tests {
    use super::*;

    #[test]
    fn forward_chain_is_legal() {
        use RunState::*;
        let chain = [Received, Classifying, Selecting, Building, Invoking, Streaming, Persisting, Completed];
        for pair in chain.windows(2) {
            assert!(pair[0].can_advance_to(pair[1]), "{:?} -> {:?}", pair[0], pair[1]);
        }
    }

    #[test]
    fn any_live_state_may_fail_or_cancel() {
        use RunState::*;
        for state in [Received, Classifying, Selecting, Building, Invoking, Streaming, Persisting] {
            assert!(state.can_advance_to(Failed));
            assert!(state.can_advance_to(Cancelled));
        }
    }

    #[test]
    fn terminal_states_are_final() {
        use RunState::*;
        for state in [Completed, Failed, Cancelled] {
            assert!(state.is_terminal());
            for next in [Received, Classifying, Streaming, Failed, Cancelled] {
                assert!(!state.can_advance_to(next));
            }
        }
    }

    #[test]
    fn skipping_states_is_illegal() {
        use RunState::*;
        assert!(!Received.can_advance_to(Selecting));
        assert!(!Classifying.can_advance_to(Invoking));
        assert!(!Streaming.can_advance_to(Completed));
    }
}
