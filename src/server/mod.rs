//! HTTP surface.
//!
//! Serves:
//! - `POST   /orchestrator/query`              — run a query to completion
//! - `GET    /orchestrator/conversations`      — list an owner's conversations
//! - `GET    /orchestrator/conversation/{id}`  — ordered messages
//! - `DELETE /orchestrator/conversation/{id}`  — cascade delete
//! - `GET    /orchestrator/usage`              — ledger cost summary
//! - `GET    /orchestrator/health`             — liveness
//! - `GET    /orchestrator/ws`                 — real-time channel
//!
//! Bearer token auth middleware protects everything but health and the
//! WebSocket endpoint (which authenticates its own connect token).

pub mod ws;

use crate::agents::AgentKind;
use crate::error::OrchestratorError;
use crate::orchestrator::{QueryRequest, QueryResponse, Runtime};
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderValue, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, CorsLayer};
use uuid::Uuid;

/// Shared state for the HTTP surface.
#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<Runtime>,
}

impl OrchestratorError {
    fn http_status(&self) -> StatusCode {
        match self {
            OrchestratorError::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            OrchestratorError::Unauthorized => StatusCode::UNAUTHORIZED,
            OrchestratorError::Busy => StatusCode::CONFLICT,
            OrchestratorError::Overloaded { .. } => StatusCode::SERVICE_UNAVAILABLE,
            OrchestratorError::UpstreamFailed { .. } => StatusCode::BAD_GATEWAY,
            OrchestratorError::UpstreamPolicy { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            OrchestratorError::ContextBuildFailed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            OrchestratorError::PersistFailed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            OrchestratorError::Cancelled => StatusCode::REQUEST_TIMEOUT,
            OrchestratorError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for OrchestratorError {
    fn into_response(self) -> Response {
        let status = self.http_status();
        let body = serde_json::json!({
            "error": { "kind": self.kind(), "message": self.to_string() }
        });
        let mut response = (status, Json(body)).into_response();
        if let OrchestratorError::Overloaded { retry_after_secs } = self {
            let advisory = retry_after_secs.max(1).to_string();
            if let Ok(value) = HeaderValue::from_str(&advisory) {
                response.headers_mut().insert("retry-after", value);
            }
        }
        response
    }
}

/// Bearer token auth middleware. Skipped when no api_key is configured.
async fn require_bearer(
    State(state): State<AppState>,
    req: axum::http::Request<axum::body::Body>,
    next: middleware::Next,
) -> Response {
    let Some(ref expected) = state.runtime.config.server.api_key else {
        return next.run(req).await;
    };

    let authorized = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|token| token == expected);

    if authorized {
        next.run(req).await
    } else {
        OrchestratorError::Unauthorized.into_response()
    }
}

/// Build the axum router.
pub fn build_router(runtime: Arc<Runtime>) -> Router {
    let allowed_origins = &runtime.config.server.allowed_origins;
    let cors = if allowed_origins.is_empty() {
        CorsLayer::new()
    } else {
        let origins: Vec<_> = allowed_origins.iter().filter_map(|o| o.parse().ok()).collect();
        CorsLayer::new().allow_origin(AllowOrigin::list(origins))
    };

    let state = AppState { runtime };

    let protected = Router::new()
        .route("/orchestrator/query", post(post_query))
        .route("/orchestrator/conversations", get(list_conversations))
        .route(
            "/orchestrator/conversation/{id}",
            get(get_conversation).delete(delete_conversation),
        )
        .route("/orchestrator/usage", get(get_usage))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_bearer));

    Router::new()
        .route("/orchestrator/health", get(health_check))
        .route("/orchestrator/ws", get(ws::ws_handler))
        .merge(protected)
        .layer(cors)
        .with_state(state)
}

/// Start the server. Runs until the listener fails.
pub async fn start_server(runtime: Arc<Runtime>) -> anyhow::Result<()> {
    let bind = &runtime.config.server.bind;
    let port = runtime.config.server.port;
    let addr: SocketAddr = format!("{bind}:{port}")
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid server address: {e}"))?;

    let app = build_router(runtime);
    tracing::info!("orchestrator listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

#[derive(Debug, Deserialize)]
struct QueryBody {
    query: String,
    #[serde(default)]
    conversation_id: Option<Uuid>,
    user_id: String,
    #[serde(default)]
    force_agent_type: Option<AgentKind>,
}

/// POST /orchestrator/query — classify, generate, persist, reply.
async fn post_query(
    State(state): State<AppState>,
    Json(body): Json<QueryBody>,
) -> Result<Json<QueryResponse>, OrchestratorError> {
    let request = QueryRequest {
        query: body.query,
        conversation_id: body.conversation_id,
        user_id: body.user_id,
        force_agent_type: body.force_agent_type,
        session_id: None,
    };
    let response = state
        .runtime
        .handle_query(request, CancellationToken::new())
        .await?;
    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
struct OwnerParams {
    user_id: String,
}

#[derive(Debug, Serialize)]
struct ConversationView {
    conversation: crate::store::Conversation,
    messages: Vec<crate::store::Message>,
}

/// GET /orchestrator/conversation/{id} — ordered messages.
async fn get_conversation(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(params): Query<OwnerParams>,
) -> Result<Json<ConversationView>, OrchestratorError> {
    let conversation = state.runtime.store.get_conversation_required(id).await?;
    if conversation.owner_id != params.user_id {
        return Err(OrchestratorError::Unauthorized);
    }
    let messages = state.runtime.store.read(id, None).await?;
    Ok(Json(ConversationView { conversation, messages }))
}

/// GET /orchestrator/conversations — an owner's conversation list.
async fn list_conversations(
    State(state): State<AppState>,
    Query(params): Query<OwnerParams>,
) -> Result<Json<Vec<crate::store::Conversation>>, OrchestratorError> {
    let conversations = state.runtime.store.list_conversations(&params.user_id).await?;
    Ok(Json(conversations))
}

/// DELETE /orchestrator/conversation/{id} — cascade delete, terminate
/// subscriptions.
async fn delete_conversation(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(params): Query<OwnerParams>,
) -> Result<StatusCode, OrchestratorError> {
    state.runtime.delete_conversation(id, &params.user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /orchestrator/usage — per-owner cost and token totals.
async fn get_usage(
    State(state): State<AppState>,
    Query(params): Query<OwnerParams>,
) -> Json<crate::ledger::UsageSummary> {
    Json(state.runtime.ledger.usage_summary(&params.user_id))
}

/// GET /orchestrator/health — liveness.
async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": crate::VERSION,
    }))
}
