//! HTTP status surface.
//!
//! A small read-mostly API over the shared registry: list sessions, fetch
//! one, stop one. It reuses the same enrichment and stop paths as the CLI,
//! so both surfaces always agree. Bound to 127.0.0.1; an optional bearer
//! token gates every route except the health check.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tracing::{info, warn};

use crate::error::Result;
use crate::lifecycle::{self, SessionView};
use crate::prd::FilePrd;
use crate::process::SignalProbe;
use crate::store::StateStore;

/// Shared state for HTTP handlers.
pub struct AppState {
    pub store: Arc<StateStore>,
    pub auth_token: Option<String>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Debug, Serialize)]
struct StopResponse {
    stopped: Vec<String>,
}

/// Creates the router with all endpoints.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/sessions", get(list_sessions))
        .route("/sessions/{name}", get(get_session))
        .route("/sessions/{name}/stop", post(stop_session))
        .route("/health", get(health_check))
        .with_state(state)
}

/// Starts the HTTP server on 127.0.0.1.
pub async fn serve(store: Arc<StateStore>, port: u16, auth_token: Option<String>) -> Result<()> {
    let state = Arc::new(AppState { store, auth_token });
    let router = create_router(state);

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    info!("Status server listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .await
        .map_err(std::io::Error::other)?;
    Ok(())
}

/// Validates the bearer token when one is configured.
fn check_auth(
    state: &AppState,
    headers: &HeaderMap,
) -> std::result::Result<(), (StatusCode, Json<ErrorResponse>)> {
    let Some(expected) = &state.auth_token else {
        return Ok(());
    };
    let provided = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "));

    match provided {
        Some(token) if token == expected => Ok(()),
        _ => Err((
            StatusCode::UNAUTHORIZED,
            Json(ErrorResponse {
                error: "invalid or missing bearer token".to_string(),
            }),
        )),
    }
}

fn internal_error(e: impl std::fmt::Display) -> (StatusCode, Json<ErrorResponse>) {
    warn!("Status surface error: {e}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: e.to_string(),
        }),
    )
}

async fn list_sessions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> std::result::Result<Json<Vec<SessionView>>, (StatusCode, Json<ErrorResponse>)> {
    check_auth(&state, &headers)?;
    let views = lifecycle::status(&state.store, &FilePrd).map_err(internal_error)?;
    Ok(Json(views))
}

async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> std::result::Result<Json<SessionView>, (StatusCode, Json<ErrorResponse>)> {
    check_auth(&state, &headers)?;
    let views = lifecycle::status(&state.store, &FilePrd).map_err(internal_error)?;
    views
        .into_iter()
        .find(|v| v.record.name == name)
        .map(Json)
        .ok_or_else(|| {
            (
                StatusCode::NOT_FOUND,
                Json(ErrorResponse {
                    error: format!("session not found: {name}"),
                }),
            )
        })
}

async fn stop_session(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> std::result::Result<Json<StopResponse>, (StatusCode, Json<ErrorResponse>)> {
    check_auth(&state, &headers)?;
    match lifecycle::stop(&state.store, &SignalProbe, Some(&name)) {
        Ok(stopped) => Ok(Json(StopResponse { stopped })),
        Err(crate::error::DroverError::SessionNotFound { name }) => Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: format!("session not found: {name}"),
            }),
        )),
        Err(e) => Err(internal_error(e)),
    }
}

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::store::{SessionStatus, SessionUpdate};
    use crate::testing::FakeInspector;
    use axum::body::Body;
    use axum::http::Request;
    use std::time::Duration;
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn test_state(tmp: &TempDir, token: Option<&str>) -> Arc<AppState> {
        let config = StoreConfig::at_dir(tmp.path().join(".drover"))
            .with_lock_timeout(Duration::from_secs(2));
        let store = Arc::new(StateStore::new(
            config,
            Arc::new(FakeInspector::all_alive()),
        ));
        Arc::new(AppState {
            store,
            auth_token: token.map(String::from),
        })
    }

    fn seed(state: &AppState, name: &str) {
        state
            .store
            .upsert(
                name,
                SessionUpdate {
                    dir: Some("/work".into()),
                    status: Some(SessionStatus::Stopped),
                    last_task_count: Some(Some(2)),
                    ..Default::default()
                },
            )
            .expect("seed");
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        serde_json::from_slice(&bytes).expect("json body")
    }

    #[tokio::test]
    async fn test_health_needs_no_auth() {
        let tmp = TempDir::new().unwrap();
        let router = create_router(test_state(&tmp, Some("secret")));

        let response = router
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_list_sessions() {
        let tmp = TempDir::new().unwrap();
        let state = test_state(&tmp, None);
        seed(&state, "api");
        let router = create_router(state);

        let response = router
            .oneshot(Request::get("/sessions").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json[0]["name"], "api");
        assert_eq!(json[0]["remaining"], 2);
    }

    #[tokio::test]
    async fn test_get_session_404() {
        let tmp = TempDir::new().unwrap();
        let router = create_router(test_state(&tmp, None));

        let response = router
            .oneshot(Request::get("/sessions/ghost").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_auth_rejects_missing_token() {
        let tmp = TempDir::new().unwrap();
        let router = create_router(test_state(&tmp, Some("secret")));

        let response = router
            .oneshot(Request::get("/sessions").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_auth_accepts_bearer_token() {
        let tmp = TempDir::new().unwrap();
        let router = create_router(test_state(&tmp, Some("secret")));

        let response = router
            .oneshot(
                Request::get("/sessions")
                    .header(header::AUTHORIZATION, "Bearer secret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_stop_session_transitions_record() {
        let tmp = TempDir::new().unwrap();
        let state = test_state(&tmp, None);
        state
            .store
            .upsert(
                "api",
                SessionUpdate {
                    dir: Some("/work".into()),
                    status: Some(SessionStatus::Running),
                    ..Default::default()
                },
            )
            .unwrap();
        let router = create_router(Arc::clone(&state));

        let response = router
            .oneshot(
                Request::post("/sessions/api/stop")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            state.store.get("api").unwrap().unwrap().status,
            SessionStatus::Stopped
        );
    }

    #[tokio::test]
    async fn test_stop_unknown_session_404() {
        let tmp = TempDir::new().unwrap();
        let router = create_router(test_state(&tmp, None));

        let response = router
            .oneshot(
                Request::post("/sessions/ghost/stop")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
