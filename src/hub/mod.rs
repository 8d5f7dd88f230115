//! Real-time session hub.
//!
//! Fan-out of request-run progress to subscribed clients. Each
//! conversation gets a broadcast channel with a fixed ring buffer; a slow
//! receiver is overwritten oldest-first and observes how many events it
//! missed, which the hub turns into a lagging/disconnect verdict. Per
//! session and run, delivery order equals publish order.
//!
//! The hub knows nothing about transports: the WebSocket layer subscribes,
//! forwards envelopes, and reports lag.

use crate::agents::AgentKind;
use crate::ledger::RunOutcome;
use crate::store::Message;
use crate::tier::Tier;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Progress events published during a request run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum HubEvent {
    Classified {
        agent: AgentKind,
        confidence: f64,
        forced: bool,
        fallback_from: Option<String>,
    },
    ModelSelected {
        tier: Tier,
        model: String,
        estimated_cost: f64,
    },
    TypingStart {
        agent: AgentKind,
    },
    TokenDelta {
        text: String,
    },
    TypingEnd,
    AgentSwitched {
        from: Option<AgentKind>,
        to: AgentKind,
    },
    AssistantMessage {
        message: Message,
    },
    Error {
        kind: String,
        message: String,
    },
    Done {
        conversation_id: Uuid,
        message_id: Option<Uuid>,
        outcome: RunOutcome,
    },
    /// Another participant's typing indicator (client-originated).
    UserTyping {
        user_id: String,
        is_typing: bool,
    },
}

impl HubEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            HubEvent::Classified { .. } => "classified",
            HubEvent::ModelSelected { .. } => "model_selected",
            HubEvent::TypingStart { .. } => "typing_start",
            HubEvent::TokenDelta { .. } => "token_delta",
            HubEvent::TypingEnd => "typing_end",
            HubEvent::AgentSwitched { .. } => "agent_switched",
            HubEvent::AssistantMessage { .. } => "assistant_message",
            HubEvent::Error { .. } => "error",
            HubEvent::Done { .. } => "done",
            HubEvent::UserTyping { .. } => "user_typing",
        }
    }
}

/// What actually travels to clients: the event plus a server timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(flatten)]
    pub event: HubEvent,
    pub ts: DateTime<Utc>,
}

/// Verdict after a session missed events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LagVerdict {
    /// Keep the session; it may catch up.
    Continue,
    /// Lagging beyond the timeout: disconnect it.
    Disconnect,
}

struct SessionEntry {
    user_id: String,
    subscribed_at: DateTime<Utc>,
    conversations: HashSet<Uuid>,
    dropped: u64,
    lag_since: Option<Instant>,
    runs: Vec<CancellationToken>,
}

struct HubInner {
    channels: HashMap<Uuid, broadcast::Sender<Envelope>>,
    sessions: HashMap<Uuid, SessionEntry>,
}

pub struct SessionHub {
    buffer_size: usize,
    lag_timeout: Duration,
    inner: RwLock<HubInner>,
}

impl SessionHub {
    pub fn new(buffer_size: usize, lag_timeout: Duration) -> Self {
        Self {
            buffer_size,
            lag_timeout,
            inner: RwLock::new(HubInner {
                channels: HashMap::new(),
                sessions: HashMap::new(),
            }),
        }
    }

    pub fn from_config(config: &crate::config::SessionConfig) -> Self {
        Self::new(config.buffer_size, Duration::from_millis(config.lag_timeout_ms))
    }

    /// Register a connected session. Idempotent.
    pub fn register_session(&self, session_id: Uuid, user_id: &str) {
        let mut inner = self.inner.write().expect("hub lock poisoned");
        inner.sessions.entry(session_id).or_insert_with(|| SessionEntry {
            user_id: user_id.to_string(),
            subscribed_at: Utc::now(),
            conversations: HashSet::new(),
            dropped: 0,
            lag_since: None,
            runs: Vec::new(),
        });
        tracing::debug!(session_id = %session_id, user_id, "session registered");
    }

    /// Subscribe a session to a conversation.
    ///
    /// Idempotent: returns `Some(receiver)` on the first subscribe and
    /// `None` when already subscribed, so callers never double-forward.
    /// Ownership authorization happens at the transport layer before this
    /// is called — on every subscribe, not just at connect.
    pub fn subscribe(&self, session_id: Uuid, conversation_id: Uuid) -> Option<broadcast::Receiver<Envelope>> {
        let mut inner = self.inner.write().expect("hub lock poisoned");
        let entry = inner.sessions.get_mut(&session_id)?;
        if !entry.conversations.insert(conversation_id) {
            return None;
        }
        let buffer_size = self.buffer_size;
        let sender = inner
            .channels
            .entry(conversation_id)
            .or_insert_with(|| broadcast::channel(buffer_size).0);
        tracing::debug!(session_id = %session_id, conversation_id = %conversation_id, "subscribed");
        Some(sender.subscribe())
    }

    /// Remove one subscription.
    pub fn unsubscribe(&self, session_id: Uuid, conversation_id: Uuid) {
        let mut inner = self.inner.write().expect("hub lock poisoned");
        if let Some(entry) = inner.sessions.get_mut(&session_id) {
            entry.conversations.remove(&conversation_id);
        }
        Self::gc_channel(&mut inner, conversation_id);
    }

    /// Whether a session currently holds a subscription.
    pub fn is_subscribed(&self, session_id: Uuid, conversation_id: Uuid) -> bool {
        self.inner
            .read()
            .expect("hub lock poisoned")
            .sessions
            .get(&session_id)
            .is_some_and(|e| e.conversations.contains(&conversation_id))
    }

    /// Tear down a session: drop all subscriptions and cancel any runs it
    /// initiated. Called on disconnect and on auth failure.
    pub fn remove_session(&self, session_id: Uuid) {
        let mut inner = self.inner.write().expect("hub lock poisoned");
        if let Some(entry) = inner.sessions.remove(&session_id) {
            for token in &entry.runs {
                token.cancel();
            }
            let conversations: Vec<Uuid> = entry.conversations.into_iter().collect();
            for conversation_id in conversations {
                Self::gc_channel(&mut inner, conversation_id);
            }
            tracing::debug!(
                session_id = %session_id,
                dropped = entry.dropped,
                "session removed"
            );
        }
    }

    /// Attach a run's cancellation handle to the session that started it.
    pub fn register_run(&self, session_id: Uuid, token: CancellationToken) {
        let mut inner = self.inner.write().expect("hub lock poisoned");
        if let Some(entry) = inner.sessions.get_mut(&session_id) {
            // Sweep tokens of runs already cancelled
            entry.runs.retain(|t| !t.is_cancelled());
            entry.runs.push(token);
        }
    }

    /// Publish an event to every subscriber of a conversation. Returns the
    /// number of receivers it reached. Never suspends: overflow overwrites
    /// the oldest buffered event per receiver.
    pub fn publish(&self, conversation_id: Uuid, event: HubEvent) -> usize {
        let inner = self.inner.read().expect("hub lock poisoned");
        let Some(sender) = inner.channels.get(&conversation_id) else {
            return 0;
        };
        let envelope = Envelope { event, ts: Utc::now() };
        match sender.send(envelope) {
            Ok(receivers) => receivers,
            Err(_) => 0,
        }
    }

    /// Record missed events for a session and decide its fate.
    pub fn note_lag(&self, session_id: Uuid, missed: u64) -> LagVerdict {
        let mut inner = self.inner.write().expect("hub lock poisoned");
        let Some(entry) = inner.sessions.get_mut(&session_id) else {
            return LagVerdict::Disconnect;
        };
        entry.dropped += missed;
        let since = *entry.lag_since.get_or_insert_with(Instant::now);
        if since.elapsed() > self.lag_timeout {
            tracing::warn!(
                session_id = %session_id,
                dropped = entry.dropped,
                "session lagging beyond timeout, disconnecting"
            );
            LagVerdict::Disconnect
        } else {
            tracing::debug!(session_id = %session_id, missed, "session lagging");
            LagVerdict::Continue
        }
    }

    /// Clear the lagging mark after a successful delivery.
    pub fn note_caught_up(&self, session_id: Uuid) {
        let mut inner = self.inner.write().expect("hub lock poisoned");
        if let Some(entry) = inner.sessions.get_mut(&session_id) {
            entry.lag_since = None;
        }
    }

    /// Total events dropped for a session so far.
    pub fn dropped_count(&self, session_id: Uuid) -> u64 {
        self.inner
            .read()
            .expect("hub lock poisoned")
            .sessions
            .get(&session_id)
            .map(|e| e.dropped)
            .unwrap_or(0)
    }

    /// Owner recorded for a session at registration.
    pub fn session_user(&self, session_id: Uuid) -> Option<String> {
        self.inner
            .read()
            .expect("hub lock poisoned")
            .sessions
            .get(&session_id)
            .map(|e| e.user_id.clone())
    }

    pub fn session_subscribed_at(&self, session_id: Uuid) -> Option<DateTime<Utc>> {
        self.inner
            .read()
            .expect("hub lock poisoned")
            .sessions
            .get(&session_id)
            .map(|e| e.subscribed_at)
    }

    /// Unsubscribe everyone and drop the channel; subscribers observe a
    /// closed stream. Used when a conversation is deleted.
    pub fn terminate_conversation(&self, conversation_id: Uuid) {
        let mut inner = self.inner.write().expect("hub lock poisoned");
        for entry in inner.sessions.values_mut() {
            entry.conversations.remove(&conversation_id);
        }
        inner.channels.remove(&conversation_id);
        tracing::debug!(conversation_id = %conversation_id, "conversation channel terminated");
    }

    /// Sessions currently subscribed to a conversation.
    pub fn subscriber_count(&self, conversation_id: Uuid) -> usize {
        self.inner
            .read()
            .expect("hub lock poisoned")
            .sessions
            .values()
            .filter(|e| e.conversations.contains(&conversation_id))
            .count()
    }

    /// Drop a conversation's channel once nothing references it.
    fn gc_channel(inner: &mut HubInner, conversation_id: Uuid) {
        let in_use = inner
            .sessions
            .values()
            .any(|e| e.conversations.contains(&conversation_id));
        if !in_use {
            inner.channels.remove(&conversation_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hub() -> SessionHub {
        SessionHub::new(8, Duration::from_millis(50))
    }

    fn delta(text: &str) -> HubEvent {
        HubEvent::TokenDelta { text: text.to_string() }
    }

    #[tokio::test]
    async fn subscribe_is_idempotent_and_unsubscribe_wins() {
        let hub = hub();
        let session = Uuid::new_v4();
        let conversation = Uuid::new_v4();
        hub.register_session(session, "alice");

        assert!(hub.subscribe(session, conversation).is_some());
        assert!(hub.subscribe(session, conversation).is_none(), "second subscribe is a no-op");
        hub.unsubscribe(session, conversation);
        assert!(!hub.is_subscribed(session, conversation));
    }

    #[tokio::test]
    async fn events_arrive_in_publish_order() {
        let hub = hub();
        let session = Uuid::new_v4();
        let conversation = Uuid::new_v4();
        hub.register_session(session, "alice");
        let mut rx = hub.subscribe(session, conversation).unwrap();

        for i in 0..5 {
            assert_eq!(hub.publish(conversation, delta(&format!("t{i}"))), 1);
        }
        for i in 0..5 {
            let envelope = rx.recv().await.unwrap();
            match envelope.event {
                HubEvent::TokenDelta { text } => assert_eq!(text, format!("t{i}")),
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn publish_without_subscribers_reaches_nobody() {
        let hub = hub();
        assert_eq!(hub.publish(Uuid::new_v4(), HubEvent::TypingEnd), 0);
    }

    #[tokio::test]
    async fn overflow_drops_oldest_and_counts() {
        let hub = SessionHub::new(4, Duration::from_secs(60));
        let session = Uuid::new_v4();
        let conversation = Uuid::new_v4();
        hub.register_session(session, "alice");
        let mut rx = hub.subscribe(session, conversation).unwrap();

        // 10 events through a ring of 4: the receiver lags by 6
        for i in 0..10 {
            hub.publish(conversation, delta(&i.to_string()));
        }
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                assert_eq!(missed, 6);
                assert_eq!(hub.note_lag(session, missed), LagVerdict::Continue);
                assert_eq!(hub.dropped_count(session), 6);
            }
            other => panic!("expected lag, got {other:?}"),
        }
        // The surviving events are the newest ones, still in order
        let envelope = rx.recv().await.unwrap();
        match envelope.event {
            HubEvent::TokenDelta { text } => assert_eq!(text, "6"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn lagging_beyond_timeout_disconnects() {
        let hub = SessionHub::new(4, Duration::from_millis(10));
        let session = Uuid::new_v4();
        hub.register_session(session, "alice");
        let conversation = Uuid::new_v4();
        hub.subscribe(session, conversation).unwrap();

        assert_eq!(hub.note_lag(session, 1), LagVerdict::Continue);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(hub.note_lag(session, 1), LagVerdict::Disconnect);

        // Catching up clears the clock
        hub.note_caught_up(session);
        assert_eq!(hub.note_lag(session, 1), LagVerdict::Continue);
    }

    #[tokio::test]
    async fn registration_records_identity_and_time() {
        let hub = hub();
        let session = Uuid::new_v4();
        assert!(hub.session_user(session).is_none());

        hub.register_session(session, "alice");
        assert_eq!(hub.session_user(session).as_deref(), Some("alice"));
        assert!(hub.session_subscribed_at(session).is_some());

        // Re-registration keeps the original identity
        hub.register_session(session, "mallory");
        assert_eq!(hub.session_user(session).as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn remove_session_cancels_its_runs() {
        let hub = hub();
        let session = Uuid::new_v4();
        hub.register_session(session, "alice");
        let token = CancellationToken::new();
        hub.register_run(session, token.clone());

        hub.remove_session(session);
        assert!(token.is_cancelled(), "disconnect cancels in-flight runs");
    }

    #[tokio::test]
    async fn terminate_conversation_closes_subscribers() {
        let hub = hub();
        let session = Uuid::new_v4();
        let conversation = Uuid::new_v4();
        hub.register_session(session, "alice");
        let mut rx = hub.subscribe(session, conversation).unwrap();

        hub.terminate_conversation(conversation);
        assert!(matches!(rx.recv().await, Err(broadcast::error::RecvError::Closed)));
        assert_eq!(hub.subscriber_count(conversation), 0);
    }

    #[test]
    fn envelope_wire_shape() {
        let envelope = Envelope {
            event: HubEvent::Classified {
                agent: AgentKind::Maintenance,
                confidence: 0.9,
                forced: false,
                fallback_from: None,
            },
            ts: Utc::now(),
        };
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["type"], "classified");
        assert_eq!(value["payload"]["agent"], "maintenance");
        assert!(value["ts"].is_string());

        let unit = Envelope { event: HubEvent::TypingEnd, ts: Utc::now() };
        let value = serde_json::to_value(&unit).unwrap();
        assert_eq!(value["type"], "typing_end");
    }
}
