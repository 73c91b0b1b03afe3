//! Control Plane
//!
//! REST + WebSocket surface over the engine manager. JSON bodies, bearer
//! token auth, and a stable error envelope mapping core error kinds onto
//! HTTP statuses.

pub mod routes;
pub mod ws;

use crate::bus::EventBus;
use crate::cache::MarketCache;
use crate::engine::{EngineManager, ExecutionEngine};
use crate::error::CoreError;
use crate::models::Config;
use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Shared application state behind every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub bus: Arc<EventBus>,
    pub cache: Arc<MarketCache>,
    pub manager: Arc<EngineManager>,
    pub paper_execution: Arc<ExecutionEngine>,
    pub live_execution: Option<Arc<ExecutionEngine>>,
}

/// API error envelope; every error carries a stable machine code.
pub struct ApiError(pub CoreError);

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.0.status_code();
        let body = Json(json!({
            "error": {
                "code": self.0.code(),
                "message": self.0.to_string(),
            }
        }));
        (status, body).into_response()
    }
}

/// Build the control-plane router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/strategy",
            post(routes::start_strategy).get(routes::list_strategies),
        )
        .route(
            "/strategy/:id",
            get(routes::get_strategy).delete(routes::delete_strategy),
        )
        .route("/strategy/:id/pause", post(routes::pause_strategy))
        .route("/strategy/:id/resume", post(routes::resume_strategy))
        .route("/backtest/run", post(routes::run_backtest))
        .route("/backtest/:id/progress", get(routes::backtest_progress))
        .route("/backtest/:id/result", get(routes::backtest_result))
        .route("/backtest/:id/cancel", post(routes::cancel_backtest))
        .route("/system/kill-switch", post(routes::kill_switch))
        .route("/ws", get(ws::ws_handler))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

/// Bearer-token check; `/health` stays open, a query `token` works for
/// WebSocket clients that cannot set headers.
pub async fn auth_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = state.config.api_token.as_deref() else {
        return next.run(request).await;
    };
    if request.uri().path() == "/health" {
        return next.run(request).await;
    }

    let header_ok = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(|value| value == format!("Bearer {}", expected))
        .unwrap_or(false);
    let query_ok = request
        .uri()
        .query()
        .map(|query| {
            query
                .split('&')
                .any(|kv| kv == format!("token={}", expected))
        })
        .unwrap_or(false);

    if header_ok || query_ok {
        next.run(request).await
    } else {
        ApiError(CoreError::Auth("missing or invalid bearer token".into())).into_response()
    }
}
