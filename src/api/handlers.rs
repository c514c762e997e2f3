//! HTTP request handlers

use super::sse::{reply_stream, StreamEvent};
use super::types::{
    ChatRequest, ChatResponse, ErrorResponse, MessagesResponse, SessionResponse, SuccessResponse,
};
use super::AppState;
use crate::checkpoint::ThreadId;
use crate::graph::GraphError;
use crate::llm::LlmErrorKind;
use crate::tools::ContractResult;
use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Sessions
        .route("/api/sessions", post(create_session))
        .route("/api/sessions/:id", delete(delete_session))
        .route("/api/sessions/:id/messages", get(get_messages))
        // Chat
        .route("/api/sessions/:id/chat", post(send_chat))
        .route("/api/sessions/:id/stream", post(stream_chat))
        // Direct contract generation
        .route("/api/contracts", post(generate_contract))
        // Version
        .route("/version", get(get_version))
        .with_state(state)
}

// ============================================================
// Sessions
// ============================================================

async fn create_session(State(state): State<AppState>) -> (StatusCode, Json<SessionResponse>) {
    let thread_id = ThreadId::generate();
    state.graph.open(&thread_id).await;
    tracing::info!(session_id = %thread_id, "Session created");

    (
        StatusCode::CREATED,
        Json(SessionResponse {
            session_id: thread_id.to_string(),
        }),
    )
}

async fn get_messages(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<MessagesResponse>, AppError> {
    let thread_id = ThreadId::new(id);
    let checkpoint = state
        .graph
        .checkpoint(&thread_id)
        .await
        .ok_or_else(|| AppError::session_not_found(&thread_id))?;

    Ok(Json(MessagesResponse {
        session_id: thread_id.to_string(),
        messages: checkpoint.conversation.messages().to_vec(),
        version: checkpoint.version,
        updated_at: checkpoint.updated_at,
    }))
}

async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SuccessResponse>, AppError> {
    let thread_id = ThreadId::new(id);
    if !state.graph.reset(&thread_id) {
        return Err(AppError::session_not_found(&thread_id));
    }
    tracing::info!(session_id = %thread_id, "Session deleted");
    Ok(Json(SuccessResponse { success: true }))
}

// ============================================================
// Chat
// ============================================================

async fn send_chat(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, AppError> {
    let thread_id = ThreadId::new(id);
    let reply = state.graph.send(&thread_id, &req.text, None).await?;

    Ok(Json(ChatResponse {
        session_id: thread_id.to_string(),
        reply,
    }))
}

async fn stream_chat(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ChatRequest>,
) -> Result<Response, AppError> {
    let thread_id = ThreadId::new(id);
    // Answer 404 before switching to SSE; a thread evicted after this
    // check still ends the stream with an error event
    if !state.graph.checkpoints().contains(&thread_id) {
        return Err(AppError::session_not_found(&thread_id));
    }
    if req.text.trim().is_empty() {
        return Err(AppError::BadRequest(
            "user message must not be empty".to_string(),
        ));
    }

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let graph = state.graph.clone();
    tokio::spawn(async move {
        let (delta_tx, mut delta_rx) = mpsc::unbounded_channel::<String>();
        let chunk_tx = events_tx.clone();
        let forward = tokio::spawn(async move {
            while let Some(content) = delta_rx.recv().await {
                let _ = chunk_tx.send(StreamEvent::Chunk { content });
            }
        });

        let result = graph.send(&thread_id, &req.text, Some(delta_tx)).await;
        // The delta sender is gone once the run returns, so this drains and ends
        let _ = forward.await;

        let event = match result {
            Ok(message) => StreamEvent::Done { message },
            Err(e) => {
                tracing::error!(session_id = %thread_id, error = %e, "Streamed turn failed");
                StreamEvent::Error {
                    message: e.to_string(),
                }
            }
        };
        let _ = events_tx.send(event);
    });

    Ok(reply_stream(events_rx).into_response())
}

// ============================================================
// Contracts
// ============================================================

async fn generate_contract(
    State(state): State<AppState>,
    body: Result<Json<Value>, JsonRejection>,
) -> Response {
    let result = match body {
        Ok(Json(input)) => state.contracts.generate(input),
        Err(rejection) => ContractResult::invalid_body(&rejection.body_text()),
    };
    let status = if result.is_success() {
        StatusCode::OK
    } else {
        StatusCode::UNPROCESSABLE_ENTITY
    };
    (status, Json(result)).into_response()
}

// ============================================================
// Version
// ============================================================

async fn get_version() -> &'static str {
    concat!("inkit ", env!("CARGO_PKG_VERSION"))
}

// ============================================================
// Error Handling
// ============================================================

#[derive(Debug)]
enum AppError {
    BadRequest(String),
    NotFound(String),
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },
    Upstream(String),
    Internal(String),
}

impl AppError {
    fn session_not_found(thread_id: &ThreadId) -> Self {
        AppError::NotFound(format!("Session not found: {thread_id}"))
    }
}

impl From<GraphError> for AppError {
    fn from(error: GraphError) -> Self {
        match error {
            GraphError::Conversation(e) => AppError::BadRequest(e.to_string()),
            GraphError::UnknownThread(thread_id) => AppError::session_not_found(&thread_id),
            GraphError::Upstream(e) if e.kind == LlmErrorKind::RateLimit => AppError::RateLimited {
                message: e.message,
                retry_after: e.retry_after,
            },
            GraphError::Upstream(e) => AppError::Upstream(e.to_string()),
            other => AppError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::RateLimited {
                message,
                retry_after,
            } => {
                let body = Json(ErrorResponse::new(message));
                return match retry_after {
                    Some(wait) => (
                        StatusCode::TOO_MANY_REQUESTS,
                        [(header::RETRY_AFTER, wait.as_secs().max(1).to_string())],
                        body,
                    )
                        .into_response(),
                    None => (StatusCode::TOO_MANY_REQUESTS, body).into_response(),
                };
            }
            AppError::Upstream(msg) => (StatusCode::BAD_GATEWAY, msg),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(ErrorResponse::new(message));
        (status, body).into_response()
    }
}
