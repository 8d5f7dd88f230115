//! WebSocket session layer.
//!
//! One socket = one Session. The client joins conversations it owns and
//! receives the hub's event envelopes as JSON frames; queries started over
//! the socket are cancelled if the socket drops. Ownership is re-checked
//! on every join, not just at connect.

use super::AppState;
use crate::agents::AgentKind;
use crate::error::OrchestratorError;
use crate::hub::{Envelope, HubEvent, LagVerdict};
use crate::orchestrator::{QueryRequest, Runtime};
use axum::{
    extract::{
        Query, State, WebSocketUpgrade,
        ws::{Message as WsMessage, WebSocket},
    },
    response::{IntoResponse, Response},
};
use chrono::Utc;
use futures::{SinkExt, StreamExt, stream::SplitSink};
use serde::Deserialize;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Frames the client may send.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientFrame {
    Message {
        query: String,
        #[serde(default)]
        conversation_id: Option<Uuid>,
        #[serde(default)]
        force_agent_type: Option<AgentKind>,
    },
    Typing {
        is_typing: bool,
        conversation_id: Uuid,
    },
    JoinConversation {
        conversation_id: Uuid,
    },
    LeaveConversation {
        conversation_id: Uuid,
    },
    Feedback {
        message_id: Uuid,
        feedback: String,
        #[serde(default)]
        comments: Option<String>,
    },
}

#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    token: String,
}

/// Resolve the connect token to a user identity.
///
/// With an api_key configured the token must be `<api_key>:<user_id>`;
/// without one (loopback deployments) the token itself is the user id.
fn verify_token(config: &crate::config::Config, token: &str) -> Option<String> {
    match &config.server.api_key {
        Some(key) => token
            .strip_prefix(key.as_str())
            .and_then(|rest| rest.strip_prefix(':'))
            .filter(|user| !user.is_empty())
            .map(str::to_string),
        None => {
            let token = token.trim();
            (!token.is_empty()).then(|| token.to_string())
        }
    }
}

/// GET /orchestrator/ws?token=… — upgrade to the real-time channel.
pub async fn ws_handler(
    State(state): State<AppState>,
    Query(params): Query<ConnectParams>,
    ws: WebSocketUpgrade,
) -> Response {
    match verify_token(&state.runtime.config, &params.token) {
        Some(user_id) => ws
            .on_upgrade(move |socket| session_loop(state, socket, user_id))
            .into_response(),
        None => OrchestratorError::Unauthorized.into_response(),
    }
}

async fn session_loop(state: AppState, socket: WebSocket, user_id: String) {
    let runtime = state.runtime;
    let session_id = Uuid::new_v4();
    runtime.hub.register_session(session_id, &user_id);
    tracing::info!(session_id = %session_id, user_id = %user_id, "realtime session connected");

    // Fired when the session must die (lag timeout, socket error).
    let session_gone = CancellationToken::new();

    let (sink, mut source) = socket.split();
    let (out_tx, out_rx) = mpsc::channel::<String>(64);
    let writer = tokio::spawn(write_loop(sink, out_rx));

    loop {
        tokio::select! {
            _ = session_gone.cancelled() => break,
            frame = source.next() => {
                match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        handle_frame(
                            &runtime,
                            session_id,
                            &user_id,
                            text.as_str(),
                            &out_tx,
                            &session_gone,
                        )
                        .await;
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {} // ping/pong/binary: nothing to do
                    Some(Err(err)) => {
                        tracing::debug!(session_id = %session_id, error = %err, "socket error");
                        break;
                    }
                }
            }
        }
    }

    // Drops subscriptions and cancels any runs this session initiated.
    runtime.hub.remove_session(session_id);
    session_gone.cancel();
    drop(out_tx);
    let _ = writer.await;
    tracing::info!(session_id = %session_id, "realtime session closed");
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, WsMessage>,
    mut out_rx: mpsc::Receiver<String>,
) {
    while let Some(text) = out_rx.recv().await {
        if sink.send(WsMessage::Text(text.into())).await.is_err() {
            break;
        }
    }
    let _ = sink.close().await;
}

async fn handle_frame(
    runtime: &std::sync::Arc<Runtime>,
    session_id: Uuid,
    user_id: &str,
    raw: &str,
    out_tx: &mpsc::Sender<String>,
    session_gone: &CancellationToken,
) {
    let frame: ClientFrame = match serde_json::from_str(raw) {
        Ok(frame) => frame,
        Err(err) => {
            send_error(out_tx, "invalid_request", &format!("unparseable frame: {err}")).await;
            return;
        }
    };

    match frame {
        ClientFrame::JoinConversation { conversation_id } => {
            join_conversation(runtime, session_id, user_id, conversation_id, out_tx, session_gone)
                .await;
        }

        ClientFrame::LeaveConversation { conversation_id } => {
            runtime.hub.unsubscribe(session_id, conversation_id);
        }

        ClientFrame::Typing { is_typing, conversation_id } => {
            if runtime.hub.is_subscribed(session_id, conversation_id) {
                runtime.hub.publish(
                    conversation_id,
                    HubEvent::UserTyping { user_id: user_id.to_string(), is_typing },
                );
            }
        }

        ClientFrame::Feedback { message_id, feedback, comments } => {
            if let Err(err) =
                record_feedback(runtime, user_id, message_id, &feedback, comments.as_deref()).await
            {
                send_error(out_tx, err.kind(), &err.to_string()).await;
            }
        }

        ClientFrame::Message { query, conversation_id, force_agent_type } => {
            // New conversations are created here so the session can join
            // before the run starts streaming.
            let conversation_id = match conversation_id {
                Some(id) => id,
                None => {
                    let title: String = query.trim().chars().take(60).collect();
                    match runtime.store.create_conversation(user_id, &title).await {
                        Ok(conversation) => conversation.id,
                        Err(err) => {
                            send_error(out_tx, err.kind(), &err.to_string()).await;
                            return;
                        }
                    }
                }
            };
            join_conversation(runtime, session_id, user_id, conversation_id, out_tx, session_gone)
                .await;

            let request = QueryRequest {
                query,
                conversation_id: Some(conversation_id),
                user_id: user_id.to_string(),
                force_agent_type,
                session_id: Some(session_id),
            };
            let runtime = std::sync::Arc::clone(runtime);
            let out_tx = out_tx.clone();
            tokio::spawn(async move {
                if let Err(err) = runtime.handle_query(request, CancellationToken::new()).await {
                    // Failures inside the run are already published as hub
                    // events; failures before the run starts are not, so
                    // they go straight to the initiating client.
                    let pre_run = matches!(
                        err.kind(),
                        "busy"
                            | "overloaded"
                            | "unauthorized"
                            | "invalid_request"
                            | "query_too_long"
                            | "unknown_conversation"
                    );
                    if pre_run {
                        send_error(&out_tx, err.kind(), &err.to_string()).await;
                    }
                }
            });
        }
    }
}

/// Ownership-checked subscribe plus event forwarding. Idempotent.
async fn join_conversation(
    runtime: &std::sync::Arc<Runtime>,
    session_id: Uuid,
    user_id: &str,
    conversation_id: Uuid,
    out_tx: &mpsc::Sender<String>,
    session_gone: &CancellationToken,
) {
    // Authorization is re-checked on every join
    match runtime.store.get_conversation(conversation_id).await {
        Ok(Some(conversation)) if conversation.owner_id == user_id => {}
        Ok(Some(_)) => {
            send_error(out_tx, "unauthorized", "not authorized for this conversation").await;
            return;
        }
        Ok(None) => {
            send_error(out_tx, "unknown_conversation", "conversation does not exist").await;
            return;
        }
        Err(err) => {
            send_error(out_tx, err.kind(), &err.to_string()).await;
            return;
        }
    }

    let Some(rx) = runtime.hub.subscribe(session_id, conversation_id) else {
        return; // already joined
    };
    spawn_forwarder(
        std::sync::Arc::clone(runtime),
        session_id,
        rx,
        out_tx.clone(),
        session_gone.clone(),
    );
}

/// Pump hub envelopes into the socket writer, enforcing the lag policy.
fn spawn_forwarder(
    runtime: std::sync::Arc<Runtime>,
    session_id: Uuid,
    mut rx: broadcast::Receiver<Envelope>,
    out_tx: mpsc::Sender<String>,
    session_gone: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            let received = tokio::select! {
                _ = session_gone.cancelled() => break,
                received = rx.recv() => received,
            };
            match received {
                Ok(envelope) => {
                    runtime.hub.note_caught_up(session_id);
                    let Ok(text) = serde_json::to_string(&envelope) else { continue };
                    if out_tx.send(text).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    if runtime.hub.note_lag(session_id, missed) == LagVerdict::Disconnect {
                        session_gone.cancel();
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

async fn record_feedback(
    runtime: &Runtime,
    user_id: &str,
    message_id: Uuid,
    feedback: &str,
    comments: Option<&str>,
) -> crate::error::Result<()> {
    let message = runtime
        .store
        .get_message(message_id)
        .await?
        .ok_or_else(|| OrchestratorError::invalid(format!("message {message_id} does not exist")))?;
    let conversation = runtime
        .store
        .get_conversation_required(message.conversation_id)
        .await?;
    if conversation.owner_id != user_id {
        return Err(OrchestratorError::Unauthorized);
    }
    runtime
        .store
        .record_feedback(message_id, user_id, feedback, comments)
        .await?;
    tracing::debug!(message_id = %message_id, feedback, "feedback recorded");
    Ok(())
}

async fn send_error(out_tx: &mpsc::Sender<String>, kind: &str, message: &str) {
    let envelope = Envelope {
        event: HubEvent::Error { kind: kind.to_string(), message: message.to_string() },
        ts: Utc::now(),
    };
    if let Ok(text) = serde_json::to_string(&envelope) {
        let _ = out_tx.send(text).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn token_maps_to_user_without_api_key() {
        let config = Config::default();
        assert_eq!(verify_token(&config, "tech-7"), Some("tech-7".to_string()));
        assert_eq!(verify_token(&config, "  "), None);
    }

    #[test]
    fn token_requires_key_prefix_when_configured() {
        let mut config = Config::default();
        config.server.api_key = Some("sekrit".to_string());
        assert_eq!(verify_token(&config, "sekrit:tech-7"), Some("tech-7".to_string()));
        assert_eq!(verify_token(&config, "wrong:tech-7"), None);
        assert_eq!(verify_token(&config, "sekrit:"), None);
        assert_eq!(verify_token(&config, "tech-7"), None);
    }

    #[test]
    fn client_frames_parse() {
        let frame: ClientFrame = serde_json::from_str(
            r#"{"type": "message", "query": "check the APU", "force_agent_type": "troubleshooting"}"#,
        )
        .unwrap();
        match frame {
            ClientFrame::Message { query, conversation_id, force_agent_type } => {
                assert_eq!(query, "check the APU");
                assert!(conversation_id.is_none());
                assert_eq!(force_agent_type, Some(AgentKind::Troubleshooting));
            }
            other => panic!("wrong frame {other:?}"),
        }

        let id = Uuid::new_v4();
        let frame: ClientFrame = serde_json::from_str(&format!(
            r#"{{"type": "join_conversation", "conversation_id": "{id}"}}"#
        ))
        .unwrap();
        assert!(matches!(frame, ClientFrame::JoinConversation { conversation_id } if conversation_id == id));

        let frame: ClientFrame = serde_json::from_str(&format!(
            r#"{{"type": "typing", "is_typing": true, "conversation_id": "{id}"}}"#
        ))
        .unwrap();
        assert!(matches!(frame, ClientFrame::Typing { is_typing: true, .. }));

        let frame: ClientFrame = serde_json::from_str(&format!(
            r#"{{"type": "feedback", "message_id": "{id}", "feedback": "positive", "comments": "clear steps"}}"#
        ))
        .unwrap();
        assert!(matches!(frame, ClientFrame::Feedback { feedback, .. } if feedback == "positive"));

        assert!(serde_json::from_str::<ClientFrame>(r#"{"type": "dance"}"#).is_err());
    }
}
