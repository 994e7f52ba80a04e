use crate::adapters::llm::OpenAiCompatibleClient;
use crate::adapters::materials_project::MaterialsProjectClient;
use crate::config::AppConfig;
use crate::core::search::RetrievalDb;
use crate::core::session::{ExplorationSession, SessionServices, SessionSettings};
use crate::domain::model::BatteryTask;
use crate::domain::ports::MaterialsDatabase;
use crate::utils::error::{BatteryError, Result};
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

type SessionMap = HashMap<Uuid, Arc<Mutex<ExplorationSession>>>;

pub const DEFAULT_SESSION_IDLE_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// 各 session 各自加鎖，不同 session 可同時進行
#[derive(Clone)]
pub struct AppState {
    sessions: Arc<RwLock<SessionMap>>,
    services: Arc<SessionServices>,
    settings: SessionSettings,
    idle_timeout: Duration,
}

impl AppState {
    pub fn new(services: Arc<SessionServices>, settings: SessionSettings) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            services,
            settings,
            idle_timeout: DEFAULT_SESSION_IDLE_TIMEOUT,
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// 移除閒置超過 `idle_timeout` 的 session；正在處理請求 (已上鎖) 的不動
    pub async fn expire_idle(&self, now: DateTime<Utc>) -> usize {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|id, session| {
            let Ok(session) = session.try_lock() else {
                return true;
            };
            let keep = now
                .signed_duration_since(session.last_active())
                .to_std()
                .map(|idle| idle < self.idle_timeout)
                .unwrap_or(true);
            if !keep {
                tracing::info!("⌛ Session {} expired after inactivity", id);
            }
            keep
        });
        before - sessions.len()
    }

    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let llm = OpenAiCompatibleClient::new(config.llm_settings())?;
        tracing::info!(
            "🤖 LLM backend: {} (model: {})",
            llm.settings().api_base,
            config.model()
        );
        if llm.settings().api_key.is_none() {
            tracing::warn!("⚠️ No LLM API key configured (OPENAI_API_KEY / OPENROUTER_API_KEY)");
        }

        let materials: Option<Arc<dyn MaterialsDatabase>> = if config.materials_project_enabled() {
            let client = MaterialsProjectClient::new(
                config.materials_project_endpoint(),
                config.materials_project_api_key(),
                config.materials_project_timeout(),
            )?;
            if !client.has_api_key() {
                tracing::warn!("⚠️ MP_API_KEY is not set, Materials Project checks will be unavailable");
            }
            Some(Arc::new(client))
        } else {
            tracing::info!("Materials Project lookup disabled");
            None
        };

        let services = SessionServices {
            llm: Arc::new(llm),
            materials,
            lithium_db: Arc::new(RetrievalDb::load_or_empty(
                config.retrieval_db_path(BatteryTask::Lithium),
            )?),
            sodium_db: Arc::new(RetrievalDb::load_or_empty(
                config.retrieval_db_path(BatteryTask::Sodium),
            )?),
        };

        Ok(Self::new(Arc::new(services), config.session_settings())
            .with_idle_timeout(config.session_idle_timeout()))
    }

    async fn session(&self, id: &str) -> std::result::Result<Arc<Mutex<ExplorationSession>>, ApiError> {
        let not_found = || {
            ApiError(BatteryError::SessionNotFound {
                id: id.to_string(),
            })
        };
        let uuid = Uuid::parse_str(id).map_err(|_| not_found())?;
        self.sessions
            .read()
            .await
            .get(&uuid)
            .cloned()
            .ok_or_else(not_found)
    }
}

/// 將 BatteryError 轉成 HTTP 狀態碼與 JSON 錯誤內容
pub struct ApiError(pub BatteryError);

impl From<BatteryError> for ApiError {
    fn from(error: BatteryError) -> Self {
        Self(error)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            BatteryError::SessionNotFound { .. } => StatusCode::NOT_FOUND,
            BatteryError::InvalidFormula { .. } | BatteryError::ValidationError { .. } => {
                StatusCode::BAD_REQUEST
            }
            BatteryError::ApiError(_)
            | BatteryError::LlmError { .. }
            | BatteryError::MaterialsDbError { .. }
            | BatteryError::ScoringError { .. }
            | BatteryError::NoNewCandidates { .. } => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("❌ {}", self.0);
        } else {
            tracing::debug!("Request rejected: {}", self.0);
        }
        let body = json!({
            "error": self.0.to_string(),
            "category": format!("{:?}", self.0.category()),
            "suggestion": self.0.recovery_suggestion(),
        });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/// 空的請求內容視為預設值；格式錯誤的 JSON 回 400
fn optional_json<T: DeserializeOwned + Default>(body: &Bytes) -> ApiResult<T> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| {
        ApiError(BatteryError::ValidationError {
            message: format!("Invalid request body: {}", e),
        })
    })
}

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub task: String,
    pub formula: String,
    pub model: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct EvaluateRequest {
    pub candidates: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
pub struct FeedbackRequest {
    pub message: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RankRequest {
    pub candidates: Vec<String>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/sessions", post(create_session))
        .route("/api/sessions/:id", get(get_session).delete(delete_session))
        .route("/api/sessions/:id/propose", post(propose))
        .route("/api/sessions/:id/evaluate", post(evaluate))
        .route("/api/sessions/:id/feedback", post(feedback))
        .route("/api/sessions/:id/rank", post(rank))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// 定期清除閒置 session，檢查間隔不超過一分鐘
fn spawn_idle_sweeper(state: AppState) -> tokio::task::JoinHandle<()> {
    let period = state.idle_timeout().min(Duration::from_secs(60)).max(Duration::from_secs(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            let expired = state.expire_idle(Utc::now()).await;
            if expired > 0 {
                tracing::debug!("Expired {} idle sessions", expired);
            }
        }
    })
}

pub async fn serve(state: AppState, host: &str, port: u16) -> Result<()> {
    let sweeper = spawn_idle_sweeper(state.clone());
    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind((host, port)).await?;
    tracing::info!("🌐 Listening on http://{}", listener.local_addr()?);

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("🛑 Shutting down");
        })
        .await?;
    sweeper.abort();
    Ok(())
}

async fn health_check(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "sessions": state.sessions.read().await.len(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn create_session(
    State(state): State<AppState>,
    Json(request): Json<CreateSessionRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let task: BatteryTask = request.task.parse()?;
    let mut settings = state.settings.clone();
    if let Some(model) = request.model.filter(|m| !m.trim().is_empty()) {
        settings.model = model;
    }

    let session = ExplorationSession::start(task, &request.formula, settings, state.services.clone())?;
    let id = session.id();
    let input_capacity = session.input_capacity();
    state
        .sessions
        .write()
        .await
        .insert(id, Arc::new(Mutex::new(session)));

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "session_id": id,
            "task": task,
            "input_capacity": input_capacity,
        })),
    ))
}

async fn get_session(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Value>> {
    let session = state.session(&id).await?;
    let mut session = session.lock().await;
    session.touch();
    let snapshot = session.snapshot();
    Ok(Json(serde_json::to_value(snapshot).map_err(BatteryError::from)?))
}

async fn delete_session(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<StatusCode> {
    let not_found = || {
        ApiError(BatteryError::SessionNotFound { id: id.clone() })
    };
    let uuid = Uuid::parse_str(&id).map_err(|_| not_found())?;
    match state.sessions.write().await.remove(&uuid) {
        Some(_) => {
            tracing::info!("🗑️ Session {} closed", uuid);
            Ok(StatusCode::NO_CONTENT)
        }
        None => Err(not_found()),
    }
}

async fn propose(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Value>> {
    let session = state.session(&id).await?;
    let mut session = session.lock().await;
    session.touch();
    let proposals = session.propose().await?;
    Ok(Json(json!({
        "proposals": proposals,
        "round": session.snapshot().round,
    })))
}

async fn evaluate(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    let request: EvaluateRequest = optional_json(&body)?;
    let session = state.session(&id).await?;
    let mut session = session.lock().await;
    session.touch();
    let assessments = session.evaluate(request.candidates).await?;
    let accepted: Vec<&str> = assessments
        .iter()
        .filter(|a| a.accepted())
        .map(|a| a.formula.as_str())
        .collect();
    Ok(Json(json!({
        "assessments": assessments,
        "accepted": accepted,
    })))
}

async fn feedback(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    let request: FeedbackRequest = optional_json(&body)?;
    let session = state.session(&id).await?;
    let mut session = session.lock().await;
    session.touch();
    let proposals = session.feedback(request.message).await?;
    Ok(Json(json!({
        "proposals": proposals,
        "round": session.snapshot().round,
    })))
}

async fn rank(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<RankRequest>,
) -> ApiResult<Json<Value>> {
    let session = state.session(&id).await?;
    let mut session = session.lock().await;
    session.touch();
    let outcome = session.rank(request.candidates).await?;
    Ok(Json(serde_json::to_value(outcome).map_err(BatteryError::from)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::session::tests::ScriptedLlm;
    use axum::body::Body;
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;

    fn state_with(replies: Vec<Result<String>>) -> AppState {
        let services = SessionServices {
            llm: Arc::new(ScriptedLlm::new(replies)),
            materials: None,
            lithium_db: Arc::new(RetrievalDb::default()),
            sodium_db: Arc::new(RetrievalDb::default()),
        };
        AppState::new(
            Arc::new(services),
            SessionSettings {
                retry_delay: Duration::ZERO,
                max_attempts: 2,
                ..SessionSettings::default()
            },
        )
    }

    fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn empty_request(method: &str, uri: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn create(router: &Router, formula: &str) -> Response {
        router
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/sessions",
                json!({"task": "li", "formula": formula}),
            ))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_check() {
        let router = build_router(state_with(Vec::new()));
        let response = router.oneshot(empty_request("GET", "/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        let router = build_router(state_with(vec![Ok("* LiCoPO4\n* Li2FePO4".to_string())]));

        let response = create(&router, "LiFePO4").await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let id = body_json(response).await["session_id"]
            .as_str()
            .unwrap()
            .to_string();

        let response = router
            .clone()
            .oneshot(empty_request("POST", &format!("/api/sessions/{}/propose", id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["proposals"], json!(["LiCoPO4", "Li2FePO4"]));
        assert_eq!(body["round"], 1);

        let response = router
            .clone()
            .oneshot(empty_request("POST", &format!("/api/sessions/{}/evaluate", id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["assessments"].as_array().unwrap().len(), 2);
        assert_eq!(body["accepted"], json!(["Li2FePO4"]));
        assert_eq!(
            body["assessments"][0]["materials_project"]["status"],
            "unavailable"
        );

        let response = router
            .clone()
            .oneshot(empty_request("GET", &format!("/api/sessions/{}", id)))
            .await
            .unwrap();
        let snapshot = body_json(response).await;
        assert_eq!(snapshot["input_formula"], "LiFePO4");
        assert_eq!(snapshot["messages"].as_array().unwrap().len(), 3);

        let response = router
            .clone()
            .oneshot(empty_request("DELETE", &format!("/api/sessions/{}", id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = router
            .oneshot(empty_request("GET", &format!("/api/sessions/{}", id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_invalid_input_is_bad_request() {
        let router = build_router(state_with(Vec::new()));
        assert_eq!(create(&router, "Li(FePO4").await.status(), StatusCode::BAD_REQUEST);

        let response = router
            .oneshot(json_request(
                "POST",
                "/api/sessions",
                json!({"task": "potassium", "formula": "KFePO4"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_session_is_not_found() {
        let router = build_router(state_with(Vec::new()));
        let response = router
            .clone()
            .oneshot(empty_request("POST", "/api/sessions/not-a-uuid/propose"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = router
            .oneshot(empty_request("DELETE", &format!("/api/sessions/{}", Uuid::new_v4())))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_llm_failure_is_bad_gateway() {
        let router = build_router(state_with(vec![
            Err(BatteryError::LlmError {
                status: 500,
                message: "upstream down".to_string(),
            }),
            Err(BatteryError::LlmError {
                status: 500,
                message: "upstream down".to_string(),
            }),
        ]));

        let id = body_json(create(&router, "LiFePO4").await).await["session_id"]
            .as_str()
            .unwrap()
            .to_string();
        let response = router
            .oneshot(empty_request("POST", &format!("/api/sessions/{}/propose", id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert!(body_json(response).await["error"]
            .as_str()
            .unwrap()
            .contains("upstream down"));
    }

    #[tokio::test]
    async fn test_rank_endpoint() {
        let router = build_router(state_with(vec![Ok("* LiCoPO4\n* LiMnPO4".to_string())]));
        let id = body_json(create(&router, "LiFePO4").await).await["session_id"]
            .as_str()
            .unwrap()
            .to_string();

        let response = router
            .oneshot(json_request(
                "POST",
                &format!("/api/sessions/{}/rank", id),
                json!({"candidates": ["LiMnPO4", "LiCoPO4"]}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["ordered"], json!(["LiCoPO4", "LiMnPO4"]));
    }

    #[tokio::test]
    async fn test_malformed_body_is_bad_request() {
        let router = build_router(state_with(Vec::new()));
        let id = body_json(create(&router, "LiFePO4").await).await["session_id"]
            .as_str()
            .unwrap()
            .to_string();

        let response = router
            .clone()
            .oneshot(json_request(
                "POST",
                &format!("/api/sessions/{}/evaluate", id),
                json!({"candidates": "LiFePO4"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_json(response).await["error"]
            .as_str()
            .unwrap()
            .contains("Invalid request body"));

        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/api/sessions/{}/feedback", id))
                    .header("content-type", "application/json")
                    .body(Body::from("{not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        // 明確指定候選即可評估，不需先提案
        let response = router
            .oneshot(json_request(
                "POST",
                &format!("/api/sessions/{}/evaluate", id),
                json!({"candidates": ["Li2FePO4"]}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["accepted"], json!(["Li2FePO4"]));
    }

    #[tokio::test]
    async fn test_idle_sessions_expire() {
        let state = state_with(Vec::new()).with_idle_timeout(Duration::from_secs(600));
        let router = build_router(state.clone());
        let id = body_json(create(&router, "LiFePO4").await).await["session_id"]
            .as_str()
            .unwrap()
            .to_string();

        assert_eq!(state.expire_idle(Utc::now()).await, 0);
        assert_eq!(
            state.expire_idle(Utc::now() + chrono::Duration::minutes(11)).await,
            1
        );

        let response = router
            .oneshot(empty_request("GET", &format!("/api/sessions/{}", id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
