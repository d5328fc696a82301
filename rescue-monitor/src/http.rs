/**
 * CONTROL API - REST surface of the monitor
 *
 * ROLE :
 * Lets an operator (or the app that picked the location) start and stop
 * monitoring and look at what the monitor is doing.
 *
 * ROUTES :
 * - GET  /health                  liveness probe, no auth
 * - GET  /monitor                 active?, connected?, state summary
 * - GET  /monitor/connectivity    connected?
 * - GET  /monitor/liveness        full heartbeat report
 * - POST /monitor/activate        { location, channel } -> state summary
 * - POST /monitor/deactivate      stop now, clear state
 * - POST /monitor/test-alert      fire the alert sink directly
 *
 * SECURITY :
 * - x-api-key header required on every route except /health
 * - No key configured = every protected route answers 401
 * - Responses never carry the broker password
 */

use crate::models::{ChannelConfig, Location, StateSummary};
use crate::service::{RescueMonitor, ServiceError};
use crate::state::StateError;
use crate::transport::Transport;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{error, warn};

pub const API_KEY_HEADER: &str = "x-api-key";

pub struct AppState<T: Transport + Clone> {
    pub monitor: Arc<RescueMonitor<T>>,
    pub api_key: Option<String>,
}

impl<T: Transport + Clone> Clone for AppState<T> {
    fn clone(&self) -> Self {
        Self {
            monitor: self.monitor.clone(),
            api_key: self.api_key.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
struct MonitorView {
    active: bool,
    connected: bool,
    state: Option<StateSummary>,
}

#[derive(Debug, Deserialize)]
pub struct ActivateRequest {
    pub location: Location,
    pub channel: ChannelConfig,
}

async fn require_api_key<T: Transport + Clone>(
    State(app): State<AppState<T>>,
    req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    if req.uri().path() == "/health" {
        return Ok(next.run(req).await);
    }

    let Some(expected) = app.api_key.as_deref().filter(|k| !k.is_empty()) else {
        warn!("no API key configured, access denied");
        return Err(StatusCode::UNAUTHORIZED);
    };

    let ok = req
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == expected);
    if !ok {
        warn!(path = %req.uri().path(), "rejected request with missing or wrong API key");
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

pub fn build_router<T: Transport + Clone>(app_state: AppState<T>) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/monitor", get(get_monitor::<T>))
        .route("/monitor/connectivity", get(get_connectivity::<T>))
        .route("/monitor/liveness", get(get_liveness::<T>))
        .route("/monitor/activate", post(activate::<T>))
        .route("/monitor/deactivate", post(deactivate::<T>))
        .route("/monitor/test-alert", post(test_alert::<T>))
        .layer(middleware::from_fn_with_state(
            app_state.clone(),
            require_api_key::<T>,
        ))
        .with_state(app_state)
}

fn service_error(e: ServiceError) -> Response {
    match e {
        ServiceError::State(StateError::ConfigurationMissing(reason)) => {
            (StatusCode::BAD_REQUEST, Json(json!({ "error": reason }))).into_response()
        }
        other => {
            error!(error = %other, "request failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": other.to_string() })),
            )
                .into_response()
        }
    }
}

// GET /monitor
async fn get_monitor<T: Transport + Clone>(State(app): State<AppState<T>>) -> Response {
    match app.monitor.current_state() {
        Ok(status) => Json(MonitorView {
            active: status.is_active(),
            connected: app.monitor.is_connected(),
            state: status.as_state().map(|s| s.summary()),
        })
        .into_response(),
        Err(e) => service_error(e),
    }
}

// GET /monitor/connectivity
async fn get_connectivity<T: Transport + Clone>(
    State(app): State<AppState<T>>,
) -> Json<serde_json::Value> {
    Json(json!({ "connected": app.monitor.is_connected() }))
}

// GET /monitor/liveness
async fn get_liveness<T: Transport + Clone>(
    State(app): State<AppState<T>>,
) -> Json<crate::health::LivenessReport> {
    Json(app.monitor.liveness())
}

// POST /monitor/activate
async fn activate<T: Transport + Clone>(
    State(app): State<AppState<T>>,
    Json(body): Json<ActivateRequest>,
) -> Response {
    match app.monitor.activate(body.location, body.channel).await {
        Ok(state) => (StatusCode::OK, Json(state.summary())).into_response(),
        Err(e) => service_error(e),
    }
}

// POST /monitor/deactivate
async fn deactivate<T: Transport + Clone>(State(app): State<AppState<T>>) -> Response {
    match app.monitor.deactivate().await {
        Ok(()) => Json(json!({ "status": "deactivated" })).into_response(),
        Err(e) => service_error(e),
    }
}

// POST /monitor/test-alert
async fn test_alert<T: Transport + Clone>(State(app): State<AppState<T>>) -> Response {
    match app.monitor.trigger_test_alert() {
        Ok(alert) => Json(json!({ "fired": true, "alert": alert })).into_response(),
        Err(e) => {
            error!(error = %e, "test alert failed");
            (
                StatusCode::BAD_GATEWAY,
                Json(json!({ "fired": false, "error": e.to_string() })),
            )
                .into_response()
        }
    }
}
