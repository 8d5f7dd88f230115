//! Storage rows for conversations, messages, and feedback.

use crate::agents::AgentKind;
use crate::tier::Tier;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Message author role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::Tool => "tool",
        }
    }

    pub fn parse(s: &str) -> Option<MessageRole> {
        match s {
            "system" => Some(MessageRole::System),
            "user" => Some(MessageRole::User),
            "assistant" => Some(MessageRole::Assistant),
            "tool" => Some(MessageRole::Tool),
            _ => None,
        }
    }
}

/// A durable conversation. Only `title`, `updated_at`, `turn_count`,
/// `agent_hint` and the summary cache are ever mutated.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Conversation {
    pub id: Uuid,
    pub owner_id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub turn_count: i64,
    /// Last specialist used, if any.
    pub agent_hint: Option<String>,
    /// Cached prefix summary, valid until the next assistant turn.
    pub summary_text: Option<String>,
    /// Highest seq the cached summary covers.
    pub summary_through_seq: Option<i64>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Conversation {
    pub fn agent_hint_kind(&self) -> Option<AgentKind> {
        self.agent_hint.as_deref().and_then(AgentKind::parse)
    }
}

/// One committed turn. Append-only: never updated or reordered.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub role: String,
    pub content: String,
    /// Specialist that produced an assistant message.
    pub agent_type: Option<String>,
    /// Tier the assistant message was generated on.
    pub tier_used: Option<String>,
    pub tokens_in: i64,
    pub tokens_out: i64,
    /// Dense, strictly increasing per conversation.
    pub seq: i64,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn role_kind(&self) -> Option<MessageRole> {
        MessageRole::parse(&self.role)
    }

    pub fn is_assistant(&self) -> bool {
        self.role == "assistant"
    }
}

/// Optional metadata attached to an append.
#[derive(Debug, Clone, Default)]
pub struct MessageMeta {
    pub agent_type: Option<AgentKind>,
    pub tier_used: Option<Tier>,
    pub tokens_in: i64,
    pub tokens_out: i64,
}

impl MessageMeta {
    pub fn assistant(agent: AgentKind, tier: Tier, tokens_in: i64, tokens_out: i64) -> Self {
        Self {
            agent_type: Some(agent),
            tier_used: Some(tier),
            tokens_in,
            tokens_out,
        }
    }
}

/// Thumbs-up/down on an assistant message.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct MessageFeedback {
    pub id: Uuid,
    pub message_id: Uuid,
    pub user_id: String,
    pub feedback: String,
    pub comments: Option<String>,
    pub created_at: DateTime<Utc>,
}
