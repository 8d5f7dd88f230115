//! Context window assembly.
//!
//! Builds the token-bounded message window for one LLM call: the agent's
//! system preamble first, then the newest messages that fit under
//! `W_model − R_reserve`, in seq order. When a long prefix is excluded,
//! it is compacted into a cached summary by a small-tier call; if that
//! fails, the window falls back to strict truncation and the run is
//! annotated.

use crate::agents::AgentKind;
use crate::config::{ContextConfig, TierConfig};
use crate::error::{OrchestratorError, Result};
use crate::gateway::ChatMessage;
use crate::store::{Conversation, ConversationStore, Message};
use crate::tokens::{self, ModelFamily};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// The transient window submitted to the LLM for one turn.
#[derive(Debug)]
pub struct ContextWindow {
    pub system_preamble: String,
    /// Included messages, oldest first.
    pub messages: Vec<Message>,
    /// Preamble + messages, with per-message framing overhead.
    pub prompt_tokens: usize,
    /// Messages that did not fit.
    pub excluded: usize,
    pub summary_used: bool,
    /// Degradation note for the request run, e.g. summarization failure.
    pub warning: Option<String>,
}

impl ContextWindow {
    /// Wire-level messages for the gateway, preamble excluded (it travels
    /// as the system prompt).
    pub fn chat_messages(&self) -> Vec<ChatMessage> {
        self.messages
            .iter()
            .map(|m| ChatMessage::new(m.role.clone(), m.content.clone()))
            .collect()
    }
}

/// Produces a compact summary of an excluded conversation prefix.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, transcript: &str, cancel: &CancellationToken) -> Result<String>;
}

const SUMMARIZER_SYSTEM: &str = "You compress aircraft-maintenance conversation history. \
    Produce a compact summary that preserves: the aircraft and systems discussed, faults \
    reported and their resolutions, procedures referenced, and any open questions. \
    Plain prose, no preamble.";

/// Output cap for the summarizer call. Kept under
/// [`SUMMARY_RESERVE_TOKENS`] so a well-behaved summary never costs more
/// window than was reserved for it.
const SUMMARY_MAX_TOKENS: u32 = 256;

/// Window headroom reserved for the summary text and its heading when a
/// summarized window is planned. The tail chosen under this reserve is
/// the tail that ships; only a summary that overruns the reserve forces
/// further trimming.
const SUMMARY_RESERVE_TOKENS: usize = 320;

#[async_trait]
impl Summarizer for crate::gateway::LlmGateway {
    async fn summarize(&self, transcript: &str, cancel: &CancellationToken) -> Result<String> {
        let prompt = format!("Summarize this conversation so far:\n\n{transcript}");
        let response = self
            .complete_simple(
                crate::tier::Tier::Small,
                SUMMARIZER_SYSTEM,
                &prompt,
                SUMMARY_MAX_TOKENS,
                cancel,
            )
            .await?;
        Ok(response.content)
    }
}

pub struct ContextManager {
    store: ConversationStore,
    config: ContextConfig,
}

impl ContextManager {
    pub fn new(store: ConversationStore, config: ContextConfig) -> Self {
        Self { store, config }
    }

    /// Assemble the window for one request.
    pub async fn build_window(
        &self,
        conversation: &Conversation,
        tier: &TierConfig,
        agent: AgentKind,
        summarizer: &dyn Summarizer,
        cancel: &CancellationToken,
    ) -> Result<ContextWindow> {
        let messages = self.store.read(conversation.id, None).await?;
        let family = ModelFamily::for_model(&tier.name);
        let overhead = self.config.message_overhead_tokens;
        let budget = (tier.context_tokens.saturating_sub(self.config.reserve_tokens)) as usize;

        let base_preamble = agent.preamble().to_string();
        let cut = newest_first_cut(&messages, &base_preamble, family, overhead, budget);

        // Everything fits: no summary, no truncation.
        if cut == 0 {
            let prompt_tokens = window_tokens(&base_preamble, &messages, family, overhead);
            return Ok(ContextWindow {
                system_preamble: base_preamble,
                messages,
                prompt_tokens,
                excluded: 0,
                summary_used: false,
                warning: None,
            });
        }

        // A summarized window is planned with headroom reserved for the
        // summary text, so the tail chosen here is the tail that ships:
        // the summary covers messages[..planned_cut] exactly, the window
        // holds messages[planned_cut..] verbatim.
        let planned_cut = newest_first_cut(
            &messages,
            &base_preamble,
            family,
            overhead,
            budget.saturating_sub(SUMMARY_RESERVE_TOKENS),
        );
        let mut warning = None;

        // Reuse the cached summary when its covered range still matches,
        // otherwise generate one for large exclusions.
        let summary = if planned_cut > 0
            && conversation.summary_through_seq == Some(messages[planned_cut - 1].seq)
        {
            conversation.summary_text.clone()
        } else if planned_cut > self.config.summarize_after_messages {
            let boundary_seq = messages[planned_cut - 1].seq;
            let transcript = render_transcript(&messages[..planned_cut]);
            match summarizer.summarize(&transcript, cancel).await {
                Ok(summary) => {
                    self.store
                        .set_summary(conversation.id, &summary, boundary_seq)
                        .await?;
                    tracing::info!(
                        conversation_id = %conversation.id,
                        covered_messages = planned_cut,
                        through_seq = boundary_seq,
                        "conversation prefix summarized"
                    );
                    Some(summary)
                }
                Err(OrchestratorError::Cancelled) => return Err(OrchestratorError::Cancelled),
                Err(err) => {
                    tracing::warn!(
                        conversation_id = %conversation.id,
                        error = %err,
                        "summarization failed, truncating instead"
                    );
                    warning = Some(format!(
                        "summarization unavailable ({}), history truncated to the newest messages",
                        err.kind()
                    ));
                    None
                }
            }
        } else {
            None
        };

        // Without a summary the plain truncation boundary applies.
        let (preamble, summary_used, mut final_cut) = match summary {
            Some(text) => (
                format!("{base_preamble}\n\nConversation so far (summarized):\n{text}"),
                true,
                planned_cut,
            ),
            None => (base_preamble, false, cut),
        };

        // A summary that overran its reserve pushes the budget over: trim
        // past the summarized prefix and annotate the degradation.
        let recheck = newest_first_cut(&messages, &preamble, family, overhead, budget);
        if recheck > final_cut {
            let dropped = recheck - final_cut;
            tracing::warn!(
                conversation_id = %conversation.id,
                dropped,
                "summary overran its reserve, trimming past the summarized prefix"
            );
            warning = Some(format!(
                "summary overran its window reserve, {dropped} more messages truncated"
            ));
            final_cut = recheck;
        }
        let included = messages[final_cut..].to_vec();

        // The triggering user message must survive windowing; if even it
        // cannot fit the budget there is nothing sensible to send.
        if included.is_empty() {
            return Err(OrchestratorError::ContextBuildFailed {
                message: format!(
                    "window budget of {budget} tokens cannot hold the latest message"
                ),
            });
        }

        let prompt_tokens = window_tokens(&preamble, &included, family, overhead);
        Ok(ContextWindow {
            system_preamble: preamble,
            messages: included,
            prompt_tokens,
            excluded: final_cut,
            summary_used,
            warning,
        })
    }
}

/// Index of the first message that fits: messages `[cut..]` are included
/// newest-first under `budget` after the preamble is accounted for.
fn newest_first_cut(
    messages: &[Message],
    preamble: &str,
    family: ModelFamily,
    overhead: usize,
    budget: usize,
) -> usize {
    let preamble_tokens = tokens::count_message(preamble, family, overhead);
    let mut remaining = budget.saturating_sub(preamble_tokens);
    let mut cut = messages.len();
    for (i, msg) in messages.iter().enumerate().rev() {
        let cost = tokens::count_message(&msg.content, family, overhead);
        if cost > remaining {
            break;
        }
        remaining -= cost;
        cut = i;
    }
    cut
}

fn window_tokens(preamble: &str, messages: &[Message], family: ModelFamily, overhead: usize) -> usize {
    tokens::count_message(preamble, family, overhead)
        + tokens::count_messages(messages.iter().map(|m| m.content.as_str()), family, overhead)
}

fn render_transcript(messages: &[Message]) -> String {
    let mut out = String::new();
    for msg in messages {
        out.push_str(&msg.role);
        out.push_str(": ");
        out.push_str(&msg.content);
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Database, MessageMeta, MessageRole};
    use crate::tier::Tier;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeSummarizer {
        calls: AtomicUsize,
        fail: bool,
        reply: String,
    }

    impl FakeSummarizer {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail: false,
                reply: "compact summary of earlier discussion".to_string(),
            }
        }

        fn failing() -> Self {
            Self { calls: AtomicUsize::new(0), fail: true, reply: String::new() }
        }

        /// A summary far past its reserve, to force post-summary trimming.
        fn verbose() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail: false,
                reply: "the accumulator precharge pressure was reviewed across many turns "
                    .repeat(40),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Summarizer for FakeSummarizer {
        async fn summarize(&self, _transcript: &str, _cancel: &CancellationToken) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(OrchestratorError::UpstreamFailed { message: "summarizer down".into() })
            } else {
                Ok(self.reply.clone())
            }
        }
    }

    fn tier(context_tokens: u32) -> TierConfig {
        TierConfig {
            name: "test-model".to_string(),
            context_tokens,
            rate_per_1k_in: 0.0,
            rate_per_1k_out: 0.0,
            supports_streaming: true,
        }
    }

    fn config(reserve: u32, summarize_after: usize) -> ContextConfig {
        ContextConfig {
            reserve_tokens: reserve,
            summarize_after_messages: summarize_after,
            message_overhead_tokens: 4,
        }
    }

    async fn setup() -> (ConversationStore, Conversation) {
        let db = Database::connect_in_memory().await.unwrap();
        db.run_migrations().await.unwrap();
        let store = ConversationStore::new(db.pool().clone());
        let conv = store.create_conversation("tech-1", "Window tests").await.unwrap();
        (store, conv)
    }

    async fn fill_pairs(store: &ConversationStore, conv: &Conversation, pairs: usize) {
        for i in 0..pairs {
            store
                .append(
                    conv.id,
                    MessageRole::User,
                    &format!("question {i} about the hydraulic accumulator precharge pressure"),
                    MessageMeta::default(),
                )
                .await
                .unwrap();
            store
                .append(
                    conv.id,
                    MessageRole::Assistant,
                    &format!("answer {i}: the precharge is checked with gear down and system depressurized"),
                    MessageMeta::default(),
                )
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn short_history_fits_whole() {
        let (store, conv) = setup().await;
        fill_pairs(&store, &conv, 2).await;
        let manager = ContextManager::new(store.clone(), config(1024, 20));
        let summarizer = FakeSummarizer::new();

        let window = manager
            .build_window(
                &store.get_conversation_required(conv.id).await.unwrap(),
                &tier(16_384),
                AgentKind::Documentation,
                &summarizer,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(window.messages.len(), 4);
        assert_eq!(window.excluded, 0);
        assert!(!window.summary_used);
        assert_eq!(summarizer.calls(), 0);
        assert!(window.prompt_tokens <= (16_384 - 1024) as usize);
    }

    #[tokio::test]
    async fn window_is_emitted_in_seq_order_and_within_budget() {
        let (store, conv) = setup().await;
        fill_pairs(&store, &conv, 40).await;
        // Summarize threshold far above the exclusion: pure truncation path
        let manager = ContextManager::new(store.clone(), config(64, 1000));
        let summarizer = FakeSummarizer::new();
        let tier_cfg = tier(700);

        let window = manager
            .build_window(
                &store.get_conversation_required(conv.id).await.unwrap(),
                &tier_cfg,
                AgentKind::Documentation,
                &summarizer,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(window.excluded > 0, "tight budget must exclude something");
        assert!(window.prompt_tokens <= (700 - 64) as usize, "window budget invariant");
        let seqs: Vec<i64> = window.messages.iter().map(|m| m.seq).collect();
        let mut sorted = seqs.clone();
        sorted.sort_unstable();
        assert_eq!(seqs, sorted, "messages emitted in seq order");
        // Newest message always present
        assert_eq!(window.messages.last().unwrap().seq, 80);
        // Below the summarize threshold: truncation without warning
        assert!(!window.summary_used);
        assert!(window.warning.is_none());
        assert_eq!(summarizer.calls(), 0);
    }

    #[tokio::test]
    async fn large_exclusion_generates_and_caches_summary() {
        let (store, conv) = setup().await;
        fill_pairs(&store, &conv, 30).await;
        let manager = ContextManager::new(store.clone(), config(64, 10));
        let summarizer = FakeSummarizer::new();
        let tier_cfg = tier(500);

        let window = manager
            .build_window(
                &store.get_conversation_required(conv.id).await.unwrap(),
                &tier_cfg,
                AgentKind::Maintenance,
                &summarizer,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(window.summary_used);
        assert!(window.system_preamble.contains("compact summary"));
        assert!(window.prompt_tokens <= (500 - 64) as usize);
        assert_eq!(summarizer.calls(), 1);

        let cached = store.get_conversation_required(conv.id).await.unwrap();
        assert!(cached.summary_text.is_some());
        assert!(cached.summary_through_seq.is_some());
    }

    #[tokio::test]
    async fn cached_summary_is_reused_until_boundary_moves() {
        let (store, conv) = setup().await;
        fill_pairs(&store, &conv, 30).await;
        let manager = ContextManager::new(store.clone(), config(64, 10));
        let summarizer = FakeSummarizer::new();
        let tier_cfg = tier(500);

        let conv1 = store.get_conversation_required(conv.id).await.unwrap();
        manager
            .build_window(&conv1, &tier_cfg, AgentKind::Maintenance, &summarizer, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summarizer.calls(), 1);

        // Same history, fresh conversation snapshot: boundary unchanged,
        // the cached summary is reused without another model call.
        let conv2 = store.get_conversation_required(conv.id).await.unwrap();
        let window = manager
            .build_window(&conv2, &tier_cfg, AgentKind::Maintenance, &summarizer, &CancellationToken::new())
            .await
            .unwrap();
        assert!(window.summary_used);
        assert_eq!(summarizer.calls(), 1, "cache hit must not call the summarizer");

        // An assistant append clears the cache; the next build summarizes again.
        store
            .append(conv.id, MessageRole::Assistant, "new answer", MessageMeta::default())
            .await
            .unwrap();
        let conv3 = store.get_conversation_required(conv.id).await.unwrap();
        assert!(conv3.summary_text.is_none());
        manager
            .build_window(&conv3, &tier_cfg, AgentKind::Maintenance, &summarizer, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summarizer.calls(), 2);
    }

    #[tokio::test]
    async fn summary_and_included_tail_meet_exactly() {
        let (store, conv) = setup().await;
        fill_pairs(&store, &conv, 30).await;
        let manager = ContextManager::new(store.clone(), config(64, 10));
        let summarizer = FakeSummarizer::new();
        let tier_cfg = tier(500);

        // The tail the builder plans under the summary reserve
        let conversation = store.get_conversation_required(conv.id).await.unwrap();
        let messages = store.read(conv.id, None).await.unwrap();
        let family = ModelFamily::for_model(&tier_cfg.name);
        let planned_cut = newest_first_cut(
            &messages,
            AgentKind::Maintenance.preamble(),
            family,
            4,
            (500 - 64) as usize - SUMMARY_RESERVE_TOKENS,
        );
        assert!(planned_cut > 10, "exclusion must be large enough to summarize");

        let window = manager
            .build_window(&conversation, &tier_cfg, AgentKind::Maintenance, &summarizer, &CancellationToken::new())
            .await
            .unwrap();

        assert!(window.summary_used);
        // The summarized prefix and the included tail meet exactly: no
        // message is silently dropped between them.
        assert_eq!(window.excluded, planned_cut, "summary covers [..cut], window holds [cut..]");
        assert_eq!(window.messages.first().unwrap().seq, planned_cut as i64 + 1);
        assert!(window.warning.is_none());

        let cached = store.get_conversation_required(conv.id).await.unwrap();
        assert_eq!(
            cached.summary_through_seq,
            Some(planned_cut as i64),
            "cache boundary matches the window split"
        );
    }

    #[tokio::test]
    async fn oversized_summary_trims_further_and_warns() {
        let (store, conv) = setup().await;
        fill_pairs(&store, &conv, 30).await;
        let manager = ContextManager::new(store.clone(), config(64, 10));
        let summarizer = FakeSummarizer::verbose();
        // Roomy enough that a tail survives even the oversized summary
        let tier_cfg = tier(1200);

        let window = manager
            .build_window(
                &store.get_conversation_required(conv.id).await.unwrap(),
                &tier_cfg,
                AgentKind::Maintenance,
                &summarizer,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(window.summary_used);
        assert!(window.prompt_tokens <= (1200 - 64) as usize, "budget still holds");
        let warning = window.warning.as_deref().expect("overrun must be annotated");
        assert!(warning.contains("truncated"));
        // The newest message always survives
        assert_eq!(window.messages.last().unwrap().seq, 60);
    }

    #[tokio::test]
    async fn summarizer_failure_truncates_with_warning() {
        let (store, conv) = setup().await;
        fill_pairs(&store, &conv, 30).await;
        let manager = ContextManager::new(store.clone(), config(64, 10));
        let summarizer = FakeSummarizer::failing();
        let tier_cfg = tier(500);

        let window = manager
            .build_window(
                &store.get_conversation_required(conv.id).await.unwrap(),
                &tier_cfg,
                AgentKind::Maintenance,
                &summarizer,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(!window.summary_used);
        assert!(window.warning.as_deref().unwrap().contains("truncated"));
        assert!(window.prompt_tokens <= (500 - 64) as usize);
        assert_eq!(window.messages.last().unwrap().seq, 60, "newest message kept");
    }

    #[tokio::test]
    async fn impossible_budget_fails_context_build() {
        let (store, conv) = setup().await;
        store
            .append(
                conv.id,
                MessageRole::User,
                &"torque values ".repeat(500),
                MessageMeta::default(),
            )
            .await
            .unwrap();
        let manager = ContextManager::new(store.clone(), config(64, 10));
        let summarizer = FakeSummarizer::new();

        let err = manager
            .build_window(
                &store.get_conversation_required(conv.id).await.unwrap(),
                &tier(128),
                AgentKind::Documentation,
                &summarizer,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "context_build_failed");
    }
}
