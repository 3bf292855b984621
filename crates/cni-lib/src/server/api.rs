//! HTTP API served by the daemon
//!
//! `POST /cni` carries plugin commands, `/state` keeps the per-interface
//! records the plugin writes after binding, and `/health`, `/ping` and
//! `/metrics` serve liveness checks and scraping.

use super::cmd_handler::{CommandHandler, HandlerError};
use super::port_counter::PortCounter;
use crate::cni::ErrorResult;
use crate::health::HealthChecker;
use crate::models::{CniCommand, Command, IfaceInfo};
use crate::observability::Metrics;
use crate::state::{FileStateStore, StateError};
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use prometheus::{Encoder, TextEncoder};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub handler: Arc<dyn CommandHandler>,
    pub health: HealthChecker,
    pub metrics: Metrics,
    pub port_counter: Option<Arc<PortCounter>>,
    pub state_store: FileStateStore,
    /// Deadline for a single CNI command
    pub request_timeout: Duration,
}

async fn with_deadline<T>(
    limit: Duration,
    fut: impl Future<Output = Result<T, HandlerError>>,
) -> Result<T, String> {
    match tokio::time::timeout(limit, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(err.to_string()),
        Err(_) => Err(format!("timed out after {:?}", limit)),
    }
}

fn bad_request(state: &AppState, reason: impl std::fmt::Display) -> Response {
    state.metrics.inc_invalid_request();
    warn!(reason = %reason, "Rejected CNI request");
    (StatusCode::BAD_REQUEST, reason.to_string()).into_response()
}

/// Run one CNI command
async fn cni(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    state.metrics.inc_request();

    let cmd: CniCommand = match serde_json::from_slice(&body) {
        Ok(cmd) => cmd,
        Err(e) => return bad_request(&state, format!("invalid request body: {}", e)),
    };
    let command = match cmd.validate() {
        Ok(Command::Version) => {
            return bad_request(&state, "VERSION is answered by the plugin itself")
        }
        Ok(command) => command,
        Err(e) => return bad_request(&state, e),
    };

    let details = cmd.to_string();
    info!(
        command = %command,
        container_id = %cmd.container_id,
        ifname = %cmd.ifname,
        netns = %cmd.netns,
        "Handling CNI request"
    );

    let limit = state.request_timeout;
    let outcome = match command {
        Command::Add => with_deadline(limit, state.handler.add(cmd))
            .await
            .map(|result| (StatusCode::OK, Json(result)).into_response()),
        Command::Del => with_deadline(limit, state.handler.del(cmd))
            .await
            .map(|()| StatusCode::NO_CONTENT.into_response()),
        Command::Check | Command::Version => with_deadline(limit, state.handler.check(cmd))
            .await
            .map(|()| StatusCode::NO_CONTENT.into_response()),
    };

    state.metrics.record_outcome(command, outcome.is_ok());
    match outcome {
        Ok(response) => response,
        Err(err) => {
            error!(command = %command, error = %err, request = %details, "CNI request failed");
            let body = ErrorResult::internal(
                format!("error during {}", command),
                format!("{}; {}", err, details),
            );
            (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
        }
    }
}

/// 200 when every check passes, 500 otherwise
async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health.health().await;

    let status_code = if health.is_healthy {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };

    (status_code, Json(health))
}

async fn ping() -> &'static str {
    "PONG"
}

/// Prometheus metrics endpoint
async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    if let Some(counter) = &state.port_counter {
        state.metrics.set_port_total(counter.count().await as i64);
    }

    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!(error = %e, "Failed to encode metrics");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
        .into_response()
}

fn state_error(err: StateError) -> Response {
    let status = match &err {
        StateError::NotFound { .. } => StatusCode::NOT_FOUND,
        StateError::InvalidKey(_) => StatusCode::BAD_REQUEST,
        StateError::Io { .. } | StateError::Json { .. } => {
            error!(error = %err, "State store failure");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, err.to_string()).into_response()
}

async fn get_state(
    State(state): State<Arc<AppState>>,
    Path((container_id, ifname)): Path<(String, String)>,
) -> Response {
    match state.state_store.get(&container_id, &ifname).await {
        Ok(info) => (StatusCode::OK, Json(info)).into_response(),
        Err(e) => state_error(e),
    }
}

async fn delete_state(
    State(state): State<Arc<AppState>>,
    Path((container_id, ifname)): Path<(String, String)>,
) -> Response {
    match state.state_store.delete(&container_id, &ifname).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => state_error(e),
    }
}

async fn put_state(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let info: IfaceInfo = match serde_json::from_slice(&body) {
        Ok(info) => info,
        Err(e) => return (StatusCode::BAD_REQUEST, format!("invalid state: {}", e)).into_response(),
    };

    match state.state_store.put(&info).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => state_error(e),
    }
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/cni", post(cni))
        .route("/health", get(health))
        .route("/ping", get(ping))
        .route("/metrics", get(metrics))
        .route("/state", post(put_state))
        .route(
            "/state/:container_id/:ifname",
            get(get_state).delete(delete_state),
        )
        .with_state(state)
}
