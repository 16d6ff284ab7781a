//! REST API server for Finnie
//!
//! Exposes the session driver over HTTP. Sessions live in process memory
//! only and are keyed by the client-supplied id. Idle sessions are dropped
//! after `SESSION_IDLE_TTL`, and the map never holds more than `MAX_SESSIONS`.

use axum::{extract::State, http::StatusCode, routing::get, routing::post, Json, Router};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::agent::{Orchestrator, ProgressSink};
use crate::session::{strip_progress, Session};
use crate::state::TaskContext;

/// =============================
/// Request / Response Models
/// =============================

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub session_id: Option<String>,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct ChatReply {
    pub session_id: Uuid,
    pub answer: String,
    pub progress: Vec<String>,
    pub fatal_error: bool,
    pub error_detail: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    pub timestamp: String,
}

impl ApiResponse {
    pub fn success<T: Serialize>(data: T) -> Self {
        Self {
            success: true,
            data: serde_json::to_value(data).ok(),
            error: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// =============================
/// API State
/// =============================

pub const SESSION_IDLE_TTL: Duration = Duration::from_secs(30 * 60);
pub const MAX_SESSIONS: usize = 1024;

struct SessionSlot {
    session: Arc<Mutex<Session>>,
    last_used: Instant,
}

impl SessionSlot {
    /// A handler still holds the session
    fn in_use(&self) -> bool {
        Arc::strong_count(&self.session) > 1
    }
}

#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Arc<Orchestrator>,
    sessions: Arc<Mutex<HashMap<Uuid, SessionSlot>>>,
    history_window: usize,
    context: TaskContext,
    idle_ttl: Duration,
    max_sessions: usize,
}

impl ApiState {
    pub fn new(orchestrator: Arc<Orchestrator>, history_window: usize, context: TaskContext) -> Self {
        Self {
            orchestrator,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            history_window,
            context,
            idle_ttl: SESSION_IDLE_TTL,
            max_sessions: MAX_SESSIONS,
        }
    }

    async fn session(&self, id: Uuid) -> Arc<Mutex<Session>> {
        let now = Instant::now();
        let mut sessions = self.sessions.lock().await;

        let before = sessions.len();
        sessions.retain(|_, slot| slot.in_use() || now.duration_since(slot.last_used) < self.idle_ttl);
        if sessions.len() < before {
            debug!(dropped = before - sessions.len(), "Dropped idle sessions");
        }

        if !sessions.contains_key(&id) {
            while sessions.len() >= self.max_sessions {
                let oldest = sessions
                    .iter()
                    .filter(|(_, slot)| !slot.in_use())
                    .min_by_key(|(_, slot)| slot.last_used)
                    .map(|(k, _)| *k);
                let Some(oldest) = oldest else { break };
                sessions.remove(&oldest);
                info!(session_id = %oldest, "Evicted least recently used session");
            }
            info!(session_id = %id, "New session");
        }

        let slot = sessions.entry(id).or_insert_with(|| SessionSlot {
            session: Arc::new(Mutex::new(Session::new(id, self.history_window, self.context.clone()))),
            last_used: now,
        });
        slot.last_used = now;
        slot.session.clone()
    }

    async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }
}

fn stable_uuid_from_string(input: &str) -> Uuid {
    use sha2::{Digest, Sha256};

    let hash = Sha256::digest(input.as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&hash[..16]);

    // version 4, RFC4122 variant
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;

    Uuid::from_bytes(bytes)
}

/// Parse a client session id, hashing free-form ids; absent ids get a new session.
fn session_id(value: Option<&str>) -> Uuid {
    match value.map(str::trim) {
        Some(v) if !v.is_empty() => Uuid::parse_str(v).unwrap_or_else(|_| stable_uuid_from_string(v)),
        _ => Uuid::new_v4(),
    }
}

/// =============================
/// Handlers
/// =============================

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

async fn chat_handler(
    State(state): State<ApiState>,
    Json(req): Json<ChatRequest>,
) -> (StatusCode, Json<ApiResponse>) {
    if req.message.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::error("message is empty".into())),
        );
    }

    let id = session_id(req.session_id.as_deref());
    let session = state.session(id).await;
    let live_sessions = state.session_count().await;
    debug!(session_id = %id, live_sessions = live_sessions, "Chat turn");
    let mut session = session.lock().await;

    let (progress, mut rx) = ProgressSink::channel();
    let result = session.run_turn(&state.orchestrator, &req.message, &progress).await;
    drop(progress);

    let mut streamed = Vec::new();
    while let Some(line) = rx.recv().await {
        if let Some(p) = strip_progress(&line) {
            streamed.push(p.to_string());
        }
    }

    match result {
        Ok(reply) => {
            streamed.extend(reply.progress);
            (
                StatusCode::OK,
                Json(ApiResponse::success(ChatReply {
                    session_id: id,
                    answer: reply.answer,
                    progress: streamed,
                    fatal_error: reply.fatal_error,
                    error_detail: reply.error_detail,
                })),
            )
        }
        Err(e) => {
            error!(session_id = %id, error = %e, "Chat turn failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiResponse::error(format!("Turn failed: {}", e))),
            )
        }
    }
}

/// =============================
/// Router
/// =============================

pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/chat", post(chat_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// =============================
/// Server Startup
/// =============================

pub async fn start_server(
    state: ApiState,
    port: u16,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let orchestrator = state.orchestrator.clone();
    let router = create_router(state);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
    info!("API Server listening on http://0.0.0.0:{}", port);

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await?;

    orchestrator.shutdown().await;
    Ok(())
}
