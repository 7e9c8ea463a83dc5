use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::Utc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use wardsync_core::protocol::{
    AbandonRequest, CompletePushResponse, HealthResponse, InitiatePullResponse, PullPage,
    PullQuery, PushRequest, PushResponse, SessionReport, StartSyncRequest, StartSyncResponse,
};
use wardsync_core::session::StartOutcome;
use wardsync_core::SessionManager;

use crate::config::AppConfig;
use crate::error::AppError;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub sessions: SessionManager,
}

impl AppState {
    pub const fn new(config: Arc<AppConfig>, sessions: SessionManager) -> Self {
        Self { config, sessions }
    }
}

pub fn app_router(state: AppState) -> Router {
    let sync_routes = Router::new()
        .route("/start", post(start_sync))
        .route("/{session_id}", delete(abandon_sync))
        .route("/{session_id}/pull/initiate", post(initiate_pull))
        .route("/{session_id}/pull", get(pull))
        .route("/{session_id}/push", post(push))
        .route("/{session_id}/push/complete", post(complete_push))
        .route("/{session_id}/status", get(session_status));

    Router::new()
        .route("/healthz", get(healthz))
        .nest("/sync", sync_routes)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_headers(Any)
                .allow_methods(Any),
        )
        .with_state(state)
}

async fn healthz(State(state): State<AppState>) -> Result<Json<HealthResponse>, AppError> {
    Ok(Json(HealthResponse {
        status: "ok".to_string(),
        current_tick: state.sessions.store().current_tick().await?,
        active_sessions: state.sessions.active_session_count().await?,
        timestamp: Utc::now().timestamp(),
    }))
}

async fn start_sync(
    State(state): State<AppState>,
    Json(request): Json<StartSyncRequest>,
) -> Result<Json<StartSyncResponse>, AppError> {
    let response = match state.sessions.start_session(&request).await? {
        StartOutcome::Started(session) => StartSyncResponse::Started {
            session_id: session.id,
            pull_from_tick: session.pull_from_tick,
        },
        StartOutcome::Queued { position } => StartSyncResponse::WaitingInQueue { position },
    };
    Ok(Json(response))
}

async fn initiate_pull(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<InitiatePullResponse>, AppError> {
    let snapshot = state.sessions.initiate_pull(&session_id).await?;
    Ok(Json(InitiatePullResponse {
        pull_until_tick: snapshot.pull_until_tick,
        total_to_pull: snapshot.total,
    }))
}

async fn pull(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<PullQuery>,
) -> Result<Json<PullPage>, AppError> {
    let page = state
        .sessions
        .transfer_to_facility(&session_id, query.offset.unwrap_or(0), query.limit)
        .await?;
    Ok(Json(page))
}

async fn push(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(request): Json<PushRequest>,
) -> Result<Json<PushResponse>, AppError> {
    let received = state
        .sessions
        .receive_push(&session_id, request.records)
        .await?;
    Ok(Json(PushResponse { received }))
}

async fn complete_push(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<CompletePushResponse>, AppError> {
    let outcome = state.sessions.complete_push(&session_id).await?;
    let report = state.sessions.status(&session_id).await?;
    Ok(Json(CompletePushResponse {
        status: report.session.status,
        tick: outcome.tick,
        applied: outcome.applied,
    }))
}

async fn session_status(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionReport>, AppError> {
    Ok(Json(state.sessions.status(&session_id).await?))
}

async fn abandon_sync(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    let request: AbandonRequest = if body.is_empty() {
        AbandonRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|error| AppError::bad_request(format!("invalid abandon body: {error}")))?
    };
    let reason = request
        .reason
        .unwrap_or_else(|| "abandoned by facility".to_string());
    state.sessions.fail(&session_id, &reason).await?;
    tracing::info!(session_id = %session_id, reason = %reason, "Facility abandoned session");
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use axum::body::{to_bytes, Body};
    use axum::http::{Method, Request};
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};
    use tower::ServiceExt;
    use wardsync_core::{SyncSchema, SyncStore};

    use super::*;

    async fn router() -> Router {
        let config = AppConfig::from_lookup(|_| None).unwrap();
        let store = SyncStore::open_in_memory(SyncSchema::clinical())
            .await
            .unwrap();
        let sessions = SessionManager::new(store, config.sync.clone());
        app_router(AppState::new(Arc::new(config), sessions))
    }

    async fn call(router: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut request = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(value) => {
                request = request.header("content-type", "application/json");
                Body::from(value.to_string())
            }
            None => Body::empty(),
        };
        let response = router
            .clone()
            .oneshot(request.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_session_round_trip_over_http() {
        let router = router().await;

        let (status, started) = call(
            &router,
            Method::POST,
            "/sync/start",
            Some(json!({"facilityId": "f1", "deviceId": "d1"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(started["status"], "started");
        let session_id = started["sessionId"].as_str().unwrap().to_string();

        let (status, snapshot) = call(
            &router,
            Method::POST,
            &format!("/sync/{session_id}/pull/initiate"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(snapshot["totalToPull"], 0);

        let (status, page) = call(
            &router,
            Method::GET,
            &format!("/sync/{session_id}/pull?offset=0&limit=10"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(page["hasMore"], false);

        let (status, pushed) = call(
            &router,
            Method::POST,
            &format!("/sync/{session_id}/push"),
            Some(json!({"records": [
                {"recordType": "Patient", "recordId": "p1", "data": {"name": "Ada"}}
            ]})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(pushed["received"], 1);

        let (status, completed) = call(
            &router,
            Method::POST,
            &format!("/sync/{session_id}/push/complete"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(completed["status"], "completed");
        assert_eq!(completed["tick"], 1);

        let (status, health) = call(&router, Method::GET, "/healthz", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(health["currentTick"], 1);
        assert_eq!(health["activeSessions"], 0);
        assert!(health["timestamp"].as_i64().unwrap() > 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unknown_session_is_not_found() {
        let router = router().await;
        let (status, body) = call(&router, Method::GET, "/sync/missing/status", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("missing"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_abandon_fails_session() {
        let router = router().await;
        let (_, started) = call(
            &router,
            Method::POST,
            "/sync/start",
            Some(json!({"facilityId": "f1", "deviceId": "d1"})),
        )
        .await;
        let session_id = started["sessionId"].as_str().unwrap().to_string();

        let (status, _) = call(
            &router,
            Method::DELETE,
            &format!("/sync/{session_id}"),
            Some(json!({"reason": "device offline"})),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (_, report) = call(
            &router,
            Method::GET,
            &format!("/sync/{session_id}/status"),
            None,
        )
        .await;
        assert_eq!(report["session"]["status"], "errored");
        assert_eq!(report["session"]["error"], "device offline");
    }
}
