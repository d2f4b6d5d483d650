//! REST API server for the procurement assistant
//!
//! Each session id owns an independent conversation; all sessions share
//! the core's store handle and reasoner.

use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tower_http::cors::CorsLayer;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::agent::{AssistantCore, ProcurementAssistant, QUICK_QUESTIONS};
use crate::error::AssistantError;

/// =============================
/// Request Models
/// =============================

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub session_id: Option<String>,
    pub question: String,
}

#[derive(Debug, Deserialize)]
pub struct ResetRequest {
    pub session_id: String,
}

/// =============================
/// Response Wrapper
/// =============================

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

type Session = Arc<Mutex<ProcurementAssistant>>;

struct SessionEntry {
    assistant: Session,
    last_used: Instant,
}

#[derive(Clone)]
pub struct ApiState {
    pub core: Arc<AssistantCore>,
    sessions: Arc<RwLock<HashMap<Uuid, SessionEntry>>>,
    max_sessions: usize,
    idle_timeout: Duration,
}

impl ApiState {
    pub fn new(core: Arc<AssistantCore>) -> Self {
        let max_sessions = core.config().max_sessions;
        let idle_timeout = core.config().session_idle_timeout;
        Self::with_limits(core, max_sessions, idle_timeout)
    }

    pub fn with_limits(core: Arc<AssistantCore>, max_sessions: usize, idle_timeout: Duration) -> Self {
        Self {
            core,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            max_sessions: max_sessions.max(1),
            idle_timeout,
        }
    }

    /// Existing session for `id`, or a new one. Creating a session first
    /// drops idle ones and, at capacity, the least recently used.
    async fn session(&self, id: Uuid) -> Session {
        let now = Instant::now();
        let mut sessions = self.sessions.write().await;
        if let Some(entry) = sessions.get_mut(&id) {
            entry.last_used = now;
            return Arc::clone(&entry.assistant);
        }

        self.evict(&mut sessions, now);

        let assistant = Arc::new(Mutex::new(self.core.session()));
        sessions.insert(
            id,
            SessionEntry {
                assistant: Arc::clone(&assistant),
                last_used: now,
            },
        );
        assistant
    }

    fn evict(&self, sessions: &mut HashMap<Uuid, SessionEntry>, now: Instant) {
        let before = sessions.len();
        sessions.retain(|_, entry| now.saturating_duration_since(entry.last_used) < self.idle_timeout);

        while sessions.len() >= self.max_sessions {
            let Some(oldest) = sessions
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(id, _)| *id)
            else {
                break;
            };
            sessions.remove(&oldest);
        }

        let evicted = before - sessions.len();
        if evicted > 0 {
            debug!(evicted, remaining = sessions.len(), "Evicted sessions");
        }
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

/// =============================
/// Helpers
/// =============================

fn stable_uuid_from_string(input: &str) -> Uuid {
    use sha2::{Digest, Sha256};

    let hash = Sha256::digest(input.as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&hash[..16]);

    // Set UUID version (4) and variant (RFC4122) bits.
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;

    Uuid::from_bytes(bytes)
}

/// Session ids may be UUIDs or any opaque client string; absent means new.
fn session_id(value: Option<&str>) -> Uuid {
    match value {
        Some(v) if !v.trim().is_empty() => {
            Uuid::parse_str(v.trim()).unwrap_or_else(|_| stable_uuid_from_string(v.trim()))
        }
        _ => Uuid::new_v4(),
    }
}

fn error_status(error: &AssistantError) -> StatusCode {
    match error {
        AssistantError::Connection(_) => StatusCode::SERVICE_UNAVAILABLE,
        AssistantError::QueryTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// =============================
/// Health Endpoint
/// =============================

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// =============================
/// Chat Endpoints
/// =============================

async fn chat_handler(
    State(state): State<ApiState>,
    Json(req): Json<ChatRequest>,
) -> (StatusCode, Json<ApiResponse>) {
    let question = req.question.trim();
    if question.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::error("Question must not be empty".into())),
        );
    }

    let id = session_id(req.session_id.as_deref());
    info!(session_id = %id, "Received chat question");

    let session = state.session(id).await;
    let report = session.lock().await.ask(question).await;

    (
        StatusCode::OK,
        Json(ApiResponse::success(serde_json::json!({
            "session_id": id.to_string(),
            "answer": report.answer,
            "termination": report.termination,
            "tool_calls": report.tool_calls,
        }))),
    )
}

async fn reset_handler(
    State(state): State<ApiState>,
    Json(req): Json<ResetRequest>,
) -> (StatusCode, Json<ApiResponse>) {
    let id = session_id(Some(&req.session_id));
    let existing = state
        .sessions
        .read()
        .await
        .get(&id)
        .map(|entry| Arc::clone(&entry.assistant));
    let reset = match existing {
        Some(session) => {
            session.lock().await.reset_conversation();
            true
        }
        None => false,
    };

    (
        StatusCode::OK,
        Json(ApiResponse::success(serde_json::json!({
            "session_id": id.to_string(),
            "reset": reset,
        }))),
    )
}

/// =============================
/// Dataset Endpoints
/// =============================

async fn overview_handler(State(state): State<ApiState>) -> (StatusCode, Json<ApiResponse>) {
    match state.core.explorer().overview().await {
        Ok(overview) => (StatusCode::OK, Json(ApiResponse::success(overview))),
        Err(e) => {
            error!(error = %e, "Overview failed");
            (
                error_status(&e),
                Json(ApiResponse::error(format!("Overview failed: {}", e))),
            )
        }
    }
}

async fn examples_handler() -> Json<ApiResponse> {
    let examples: Vec<serde_json::Value> = QUICK_QUESTIONS
        .iter()
        .map(|(label, question)| serde_json::json!({"label": label, "question": question}))
        .collect();
    Json(ApiResponse::success(examples))
}

/// =============================
/// Router
/// =============================

pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/chat", post(chat_handler))
        .route("/api/reset", post(reset_handler))
        .route("/api/overview", get(overview_handler))
        .route("/api/examples", get(examples_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// =============================
/// Server Startup
/// =============================

pub async fn start_server(
    core: Arc<AssistantCore>,
    port: u16,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let router = create_router(ApiState::new(core));

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    info!("API Server listening on http://0.0.0.0:{}", port);
    info!("Local: http://127.0.0.1:{}", port);

    axum::serve(listener, router).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::reasoner::IntentReasoner;
    use crate::store::{DocumentStore, InMemoryStore};
    use serde_json::json;

    fn state() -> (ApiState, Arc<InMemoryStore>) {
        let docs = crate::pipelines::stages(json!([
            {"Fiscal Year": "2012-2013", "Department Name": "Parks", "Total Price": 12_500.0},
            {"Fiscal Year": "2013-2014", "Department Name": "Parks", "Total Price": 800.0}
        ]));
        let store = Arc::new(InMemoryStore::from_documents("purchase_orders", docs));
        let core = AssistantCore::with_reasoner(
            AppConfig::default(),
            store.clone(),
            Arc::new(IntentReasoner),
        );
        (ApiState::new(Arc::new(core)), store)
    }

    #[test]
    fn test_session_ids() {
        let id = Uuid::new_v4();
        assert_eq!(session_id(Some(&id.to_string())), id);
        assert_eq!(session_id(Some("browser-tab-1")), session_id(Some("browser-tab-1")));
        assert_ne!(session_id(None), session_id(None));
    }

    #[tokio::test]
    async fn test_chat_keeps_sessions_apart() {
        let (state, _) = state();
        let ask = |session: &str| ChatRequest {
            session_id: Some(session.to_string()),
            question: "What was the total spending in fiscal year 2012-2013?".to_string(),
        };

        let (status, Json(response)) = chat_handler(State(state.clone()), Json(ask("a"))).await;
        assert_eq!(status, StatusCode::OK);
        let data = response.data.unwrap();
        assert!(data["answer"].as_str().unwrap().contains("$12.50K"));
        assert_eq!(data["termination"], json!("answered"));

        chat_handler(State(state.clone()), Json(ask("b"))).await;
        assert_eq!(state.session_count().await, 2);

        let (_, Json(reset)) = reset_handler(
            State(state.clone()),
            Json(ResetRequest {
                session_id: "a".to_string(),
            }),
        )
        .await;
        assert_eq!(reset.data.unwrap()["reset"], json!(true));
    }

    #[tokio::test]
    async fn test_sessions_stay_bounded() {
        let (state, _) = state();
        let state = ApiState::with_limits(Arc::clone(&state.core), 3, Duration::from_secs(600));

        let kept = Uuid::new_v4();
        state.session(kept).await;
        for _ in 0..20 {
            state.session(Uuid::new_v4()).await;
            state.session(kept).await;
            assert!(state.session_count().await <= 3);
        }
        assert_eq!(state.session_count().await, 3);
        assert!(state.sessions.read().await.contains_key(&kept));

        for _ in 0..5 {
            let request = ChatRequest {
                session_id: None,
                question: "What was the total spending in fiscal year 2012-2013?".to_string(),
            };
            let (status, _) = chat_handler(State(state.clone()), Json(request)).await;
            assert_eq!(status, StatusCode::OK);
        }
        assert_eq!(state.session_count().await, 3);
    }

    #[tokio::test]
    async fn test_idle_sessions_expire() {
        let (state, _) = state();
        let state = ApiState::with_limits(Arc::clone(&state.core), 100, Duration::ZERO);

        for _ in 0..10 {
            state.session(Uuid::new_v4()).await;
        }
        assert_eq!(state.session_count().await, 1);
    }

    #[tokio::test]
    async fn test_empty_question_rejected() {
        let (state, _) = state();
        let (status, Json(response)) = chat_handler(
            State(state),
            Json(ChatRequest {
                session_id: None,
                question: "   ".to_string(),
            }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(!response.success);
    }

    #[tokio::test]
    async fn test_overview_and_unavailable_store() {
        let (state, store) = state();
        let (status, Json(response)) = overview_handler(State(state.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(response.data.unwrap()["total_records"], json!(2));

        store.close().await.unwrap();
        let (status, _) = overview_handler(State(state)).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_examples() {
        let Json(response) = examples_handler().await;
        let data = response.data.unwrap();
        assert_eq!(data.as_array().map(Vec::len), Some(QUICK_QUESTIONS.len()));
        assert_eq!(data[0]["label"], json!("Total spending by year"));
    }
}
