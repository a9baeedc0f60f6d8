use super::state::AppState;
use crate::backup::TriggerOutcome;
use crate::error::BackupError;
use crate::ledger::Trigger;
use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

const DEFAULT_RUN_LIMIT: usize = 50;

#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    data: T,
}

#[derive(Serialize)]
struct ApiError {
    success: bool,
    error: String,
}

#[derive(Debug, Deserialize)]
struct RunsQuery {
    job: Option<String>,
    limit: Option<usize>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/runs", get(runs_handler))
        .route("/api/runs/:id", get(run_handler))
        .route("/api/jobs/:id/run", post(trigger_handler))
        .route("/api/servers/:id/probe", get(server_probe_handler))
        .route("/api/servers/:id/databases", get(databases_handler))
        .route("/api/destinations/:id/probe", get(destination_probe_handler))
        .route("/api/scheduler", get(scheduler_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serves the status API until `shutdown` is raised.
pub async fn start_server(state: Arc<AppState>, port: u16, shutdown: Arc<AtomicUsize>) {
    if !state.auth_required() {
        warn!("No web username configured, the status API is unauthenticated");
    }
    let app = router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!("Starting status API on http://localhost:{}", port);

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind to {}: {}", addr, e);
            return;
        }
    };

    let stop = async move {
        while shutdown.load(Ordering::Relaxed) == 0 {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    };
    if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(stop).await {
        error!("Web server error: {}", e);
    }
}

fn check_auth(headers: &HeaderMap, state: &AppState) -> bool {
    if !state.auth_required() {
        return true;
    }

    let auth_header = match headers.get(header::AUTHORIZATION) {
        Some(h) => h,
        None => return false,
    };

    let auth_str = match auth_header.to_str() {
        Ok(s) => s,
        Err(_) => return false,
    };

    let Some(encoded) = auth_str.strip_prefix("Basic ") else {
        return false;
    };
    let decoded = match STANDARD.decode(encoded) {
        Ok(d) => d,
        Err(_) => return false,
    };

    let credentials = match String::from_utf8(decoded) {
        Ok(s) => s,
        Err(_) => return false,
    };

    match credentials.split_once(':') {
        Some((user, pass)) => state.check_credentials(user, pass),
        None => false,
    }
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, "Basic realm=\"DB Backup Engine\"")],
        "Unauthorized",
    )
        .into_response()
}

fn ok<T: Serialize>(status: StatusCode, data: T) -> Response {
    (status, Json(ApiResponse { success: true, data })).into_response()
}

fn fail(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ApiError {
            success: false,
            error: message.into(),
        }),
    )
        .into_response()
}

fn error_response(err: &BackupError) -> Response {
    let status = match err {
        BackupError::Config(_) => StatusCode::NOT_FOUND,
        BackupError::ConfigValidation(_) => StatusCode::UNPROCESSABLE_ENTITY,
        BackupError::Database(_) | BackupError::Timeout(_) | BackupError::Credential(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    fail(status, err.to_string())
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    #[derive(Serialize)]
    struct Health {
        status: &'static str,
        uptime_secs: i64,
    }

    Json(Health {
        status: "ok",
        uptime_secs: (Utc::now() - state.started_at).num_seconds(),
    })
    .into_response()
}

async fn runs_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<RunsQuery>,
) -> Response {
    if !check_auth(&headers, &state) {
        return unauthorized();
    }

    let limit = query.limit.unwrap_or(DEFAULT_RUN_LIMIT);
    let runs = state.engine.ledger().list(query.job.as_deref(), limit).await;
    ok(StatusCode::OK, runs)
}

async fn run_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<u64>,
) -> Response {
    if !check_auth(&headers, &state) {
        return unauthorized();
    }

    match state.engine.ledger().get(id).await {
        Some(record) => ok(StatusCode::OK, record),
        None => fail(StatusCode::NOT_FOUND, format!("run {} not found", id)),
    }
}

async fn trigger_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(job_id): Path<String>,
) -> Response {
    if !check_auth(&headers, &state) {
        return unauthorized();
    }

    match state.engine.start(&job_id, Trigger::Manual).await {
        Ok(outcome @ TriggerOutcome::Started(_)) => ok(StatusCode::ACCEPTED, outcome),
        Ok(outcome @ TriggerOutcome::AlreadyRunning) => ok(StatusCode::CONFLICT, outcome),
        Err(e) => error_response(&e),
    }
}

async fn server_probe_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(server_id): Path<String>,
) -> Response {
    if !check_auth(&headers, &state) {
        return unauthorized();
    }

    match state.engine.probe_server(&server_id).await {
        Ok(result) => ok(StatusCode::OK, result),
        Err(e) => error_response(&e),
    }
}

async fn databases_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(server_id): Path<String>,
) -> Response {
    if !check_auth(&headers, &state) {
        return unauthorized();
    }

    match state.engine.list_databases(&server_id).await {
        Ok(databases) => ok(StatusCode::OK, databases),
        Err(e) => error_response(&e),
    }
}

async fn destination_probe_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(destination_id): Path<String>,
) -> Response {
    if !check_auth(&headers, &state) {
        return unauthorized();
    }

    match state.engine.probe_destination(&destination_id).await {
        Ok(result) => ok(StatusCode::OK, result),
        Err(e) => error_response(&e),
    }
}

async fn scheduler_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    if !check_auth(&headers, &state) {
        return unauthorized();
    }

    ok(StatusCode::OK, state.scheduler_snapshot().await)
}
