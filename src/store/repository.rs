//! Conversation and message repository.
//!
//! All mutation goes through here. `append` is the only way a message is
//! written: it assigns the next dense `seq`, bumps the conversation's
//! counters, and maintains the summary cache, all in one transaction.

use super::models::{Conversation, Message, MessageFeedback, MessageMeta, MessageRole};
use crate::error::{OrchestratorError, Result};
use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ConversationStore {
    pool: SqlitePool,
}

impl ConversationStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create a conversation owned by `owner_id`.
    pub async fn create_conversation(&self, owner_id: &str, title: &str) -> Result<Conversation> {
        let now = Utc::now();
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO conversations (id, owner_id, title, created_at, updated_at, turn_count)
             VALUES (?1, ?2, ?3, ?4, ?4, 0)",
        )
        .bind(id)
        .bind(owner_id)
        .bind(title)
        .bind(now)
        .execute(&self.pool)
        .await?;

        tracing::debug!(conversation_id = %id, owner = owner_id, "conversation created");
        self.get_conversation(id)
            .await?
            .ok_or_else(|| OrchestratorError::internal("conversation vanished after insert"))
    }

    /// Fetch a live (non-deleted) conversation.
    pub async fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>> {
        let row = sqlx::query_as::<_, Conversation>(
            "SELECT * FROM conversations WHERE id = ?1 AND deleted_at IS NULL",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Fetch a live conversation or fail with `unknown_conversation`.
    pub async fn get_conversation_required(&self, id: Uuid) -> Result<Conversation> {
        self.get_conversation(id)
            .await?
            .ok_or_else(|| OrchestratorError::unknown_conversation(id))
    }

    /// List an owner's live conversations, most recently updated first.
    pub async fn list_conversations(&self, owner_id: &str) -> Result<Vec<Conversation>> {
        let rows = sqlx::query_as::<_, Conversation>(
            "SELECT * FROM conversations
             WHERE owner_id = ?1 AND deleted_at IS NULL
             ORDER BY updated_at DESC",
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Append a message.
    ///
    /// Atomic: assigns `seq = max(seq) + 1`, bumps `turn_count` and
    /// `updated_at`, and — for assistant messages — updates `agent_hint`
    /// and clears the summary cache in the same transaction.
    pub async fn append(
        &self,
        conversation_id: Uuid,
        role: MessageRole,
        content: &str,
        meta: MessageMeta,
    ) -> Result<Message> {
        let mut tx = self.pool.begin().await?;

        let live: Option<(i64,)> = sqlx::query_as(
            "SELECT turn_count FROM conversations WHERE id = ?1 AND deleted_at IS NULL",
        )
        .bind(conversation_id)
        .fetch_optional(&mut *tx)
        .await?;
        if live.is_none() {
            return Err(OrchestratorError::unknown_conversation(conversation_id));
        }

        let (next_seq,): (i64,) = sqlx::query_as(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM messages WHERE conversation_id = ?1",
        )
        .bind(conversation_id)
        .fetch_one(&mut *tx)
        .await?;

        let id = Uuid::new_v4();
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO messages
               (id, conversation_id, role, content, agent_type, tier_used,
                tokens_in, tokens_out, seq, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        )
        .bind(id)
        .bind(conversation_id)
        .bind(role.as_str())
        .bind(content)
        .bind(meta.agent_type.map(|a| a.as_str()))
        .bind(meta.tier_used.map(|t| t.as_str()))
        .bind(meta.tokens_in)
        .bind(meta.tokens_out)
        .bind(next_seq)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        if role == MessageRole::Assistant {
            // A new assistant turn moves the exclusion boundary, so any
            // cached prefix summary no longer matches its covered range.
            sqlx::query(
                "UPDATE conversations
                 SET turn_count = turn_count + 1,
                     updated_at = ?2,
                     agent_hint = COALESCE(?3, agent_hint),
                     summary_text = NULL,
                     summary_through_seq = NULL
                 WHERE id = ?1",
            )
            .bind(conversation_id)
            .bind(now)
            .bind(meta.agent_type.map(|a| a.as_str()))
            .execute(&mut *tx)
            .await?;
        } else {
            sqlx::query(
                "UPDATE conversations
                 SET turn_count = turn_count + 1, updated_at = ?2
                 WHERE id = ?1",
            )
            .bind(conversation_id)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        Ok(Message {
            id,
            conversation_id,
            role: role.as_str().to_string(),
            content: content.to_string(),
            agent_type: meta.agent_type.map(|a| a.as_str().to_string()),
            tier_used: meta.tier_used.map(|t| t.as_str().to_string()),
            tokens_in: meta.tokens_in,
            tokens_out: meta.tokens_out,
            seq: next_seq,
            created_at: now,
        })
    }

    /// Read messages in seq order. `limit` keeps the newest N; the result
    /// is returned oldest-first either way.
    pub async fn read(&self, conversation_id: Uuid, limit: Option<i64>) -> Result<Vec<Message>> {
        let mut rows = match limit {
            Some(n) => {
                sqlx::query_as::<_, Message>(
                    "SELECT * FROM messages WHERE conversation_id = ?1
                     ORDER BY seq DESC LIMIT ?2",
                )
                .bind(conversation_id)
                .bind(n)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, Message>(
                    "SELECT * FROM messages WHERE conversation_id = ?1 ORDER BY seq ASC",
                )
                .bind(conversation_id)
                .fetch_all(&self.pool)
                .await?
            }
        };
        if limit.is_some() {
            rows.reverse();
        }
        Ok(rows)
    }

    pub async fn get_message(&self, id: Uuid) -> Result<Option<Message>> {
        let row = sqlx::query_as::<_, Message>("SELECT * FROM messages WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    /// Number of assistant messages in a conversation (selector input).
    pub async fn count_assistant_messages(&self, conversation_id: Uuid) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM messages
             WHERE conversation_id = ?1 AND role = 'assistant'",
        )
        .bind(conversation_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Cache a prefix summary covering messages up to `through_seq`.
    pub async fn set_summary(
        &self,
        conversation_id: Uuid,
        summary: &str,
        through_seq: i64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE conversations
             SET summary_text = ?2, summary_through_seq = ?3
             WHERE id = ?1 AND deleted_at IS NULL",
        )
        .bind(conversation_id)
        .bind(summary)
        .bind(through_seq)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Rename a conversation.
    pub async fn set_title(&self, conversation_id: Uuid, title: &str) -> Result<()> {
        sqlx::query(
            "UPDATE conversations SET title = ?2, updated_at = ?3
             WHERE id = ?1 AND deleted_at IS NULL",
        )
        .bind(conversation_id)
        .bind(title)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Soft-delete the conversation and hard-delete its messages
    /// (feedback goes with them via cascade).
    pub async fn delete_conversation(&self, conversation_id: Uuid) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM messages WHERE conversation_id = ?1")
            .bind(conversation_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "UPDATE conversations SET deleted_at = ?2, summary_text = NULL,
             summary_through_seq = NULL WHERE id = ?1",
        )
        .bind(conversation_id)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        tracing::info!(conversation_id = %conversation_id, "conversation deleted");
        Ok(())
    }

    /// Record user feedback on an assistant message.
    pub async fn record_feedback(
        &self,
        message_id: Uuid,
        user_id: &str,
        feedback: &str,
        comments: Option<&str>,
    ) -> Result<MessageFeedback> {
        if feedback != "positive" && feedback != "negative" {
            return Err(OrchestratorError::invalid(format!(
                "feedback must be positive or negative, got {feedback}"
            )));
        }
        if self.get_message(message_id).await?.is_none() {
            return Err(OrchestratorError::invalid(format!(
                "message {message_id} does not exist"
            )));
        }

        let id = Uuid::new_v4();
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO message_feedback (id, message_id, user_id, feedback, comments, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(id)
        .bind(message_id)
        .bind(user_id)
        .bind(feedback)
        .bind(comments)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(MessageFeedback {
            id,
            message_id,
            user_id: user_id.to_string(),
            feedback: feedback.to_string(),
            comments: comments.map(str::to_string),
            created_at: now,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::AgentKind;
    use crate::store::Database;
    use crate::tier::Tier;

    async fn store() -> ConversationStore {
        let db = Database::connect_in_memory().await.unwrap();
        db.run_migrations().await.unwrap();
        ConversationStore::new(db.pool().clone())
    }

    #[tokio::test]
    async fn seq_is_dense_and_strictly_increasing() {
        let store = store().await;
        let conv = store.create_conversation("tech-1", "Hydraulics").await.unwrap();

        for i in 0..6 {
            let role = if i % 2 == 0 { MessageRole::User } else { MessageRole::Assistant };
            store
                .append(conv.id, role, &format!("turn {i}"), MessageMeta::default())
                .await
                .unwrap();
        }

        let messages = store.read(conv.id, None).await.unwrap();
        assert_eq!(messages.len(), 6);
        for (i, msg) in messages.iter().enumerate() {
            assert_eq!(msg.seq, i as i64 + 1, "seq must be dense with no gaps");
        }
    }

    #[tokio::test]
    async fn append_bumps_turn_count_and_updated_at() {
        let store = store().await;
        let conv = store.create_conversation("tech-1", "APU").await.unwrap();
        assert_eq!(conv.turn_count, 0);

        store
            .append(conv.id, MessageRole::User, "why won't the APU start", MessageMeta::default())
            .await
            .unwrap();

        let after = store.get_conversation_required(conv.id).await.unwrap();
        assert_eq!(after.turn_count, 1);
        assert!(after.updated_at >= conv.updated_at);
    }

    #[tokio::test]
    async fn append_to_unknown_conversation_fails() {
        let store = store().await;
        let err = store
            .append(Uuid::new_v4(), MessageRole::User, "hello", MessageMeta::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "unknown_conversation");
    }

    #[tokio::test]
    async fn assistant_append_updates_hint_and_clears_summary() {
        let store = store().await;
        let conv = store.create_conversation("tech-1", "Brakes").await.unwrap();
        store
            .append(conv.id, MessageRole::User, "brake wear limits?", MessageMeta::default())
            .await
            .unwrap();
        store.set_summary(conv.id, "earlier discussion about brakes", 1).await.unwrap();

        store
            .append(
                conv.id,
                MessageRole::Assistant,
                "Limits are in AMM 32-41.",
                MessageMeta::assistant(AgentKind::Documentation, Tier::Medium, 50, 20),
            )
            .await
            .unwrap();

        let after = store.get_conversation_required(conv.id).await.unwrap();
        assert_eq!(after.agent_hint.as_deref(), Some("documentation"));
        assert!(after.summary_text.is_none(), "assistant turn invalidates the summary");
        assert!(after.summary_through_seq.is_none());
    }

    #[tokio::test]
    async fn user_append_keeps_cached_summary() {
        let store = store().await;
        let conv = store.create_conversation("tech-1", "Brakes").await.unwrap();
        store
            .append(conv.id, MessageRole::User, "first", MessageMeta::default())
            .await
            .unwrap();
        store.set_summary(conv.id, "summary", 1).await.unwrap();

        store
            .append(conv.id, MessageRole::User, "second", MessageMeta::default())
            .await
            .unwrap();

        let after = store.get_conversation_required(conv.id).await.unwrap();
        assert_eq!(after.summary_text.as_deref(), Some("summary"));
    }

    #[tokio::test]
    async fn read_round_trips_content_and_role() {
        let store = store().await;
        let conv = store.create_conversation("tech-1", "Gear").await.unwrap();
        let content = "Torque the axle nut to 250 ft-lb — see AMM 32-11-04.\n\tStep 2.";
        store
            .append(conv.id, MessageRole::User, content, MessageMeta::default())
            .await
            .unwrap();

        let messages = store.read(conv.id, None).await.unwrap();
        assert_eq!(messages[0].content, content, "content must round-trip byte-identical");
        assert_eq!(messages[0].role, "user");
    }

    #[tokio::test]
    async fn read_with_limit_keeps_newest_in_seq_order() {
        let store = store().await;
        let conv = store.create_conversation("tech-1", "Gear").await.unwrap();
        for i in 1..=5 {
            store
                .append(conv.id, MessageRole::User, &format!("m{i}"), MessageMeta::default())
                .await
                .unwrap();
        }

        let tail = store.read(conv.id, Some(2)).await.unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].content, "m4");
        assert_eq!(tail[1].content, "m5");
    }

    #[tokio::test]
    async fn delete_cascades_and_hides_conversation() {
        let store = store().await;
        let conv = store.create_conversation("tech-1", "Doomed").await.unwrap();
        let msg = store
            .append(conv.id, MessageRole::User, "bye", MessageMeta::default())
            .await
            .unwrap();
        store.record_feedback(msg.id, "tech-1", "positive", None).await.unwrap();

        store.delete_conversation(conv.id).await.unwrap();

        assert!(store.get_conversation(conv.id).await.unwrap().is_none());
        assert!(store.read(conv.id, None).await.unwrap().is_empty());
        assert!(
            store
                .append(conv.id, MessageRole::User, "hello?", MessageMeta::default())
                .await
                .is_err(),
            "deleted conversations reject appends"
        );
    }

    #[tokio::test]
    async fn feedback_rejects_unknown_message_and_bad_value() {
        let store = store().await;
        let err = store
            .record_feedback(Uuid::new_v4(), "tech-1", "positive", None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_request");

        let conv = store.create_conversation("tech-1", "FB").await.unwrap();
        let msg = store
            .append(conv.id, MessageRole::Assistant, "hi", MessageMeta::default())
            .await
            .unwrap();
        let err = store
            .record_feedback(msg.id, "tech-1", "meh", None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_request");
    }

    #[tokio::test]
    async fn list_conversations_is_scoped_to_owner() {
        let store = store().await;
        store.create_conversation("alice", "A1").await.unwrap();
        store.create_conversation("alice", "A2").await.unwrap();
        store.create_conversation("bob", "B1").await.unwrap();

        let alice = store.list_conversations("alice").await.unwrap();
        assert_eq!(alice.len(), 2);
        assert!(alice.iter().all(|c| c.owner_id == "alice"));
    }
}
