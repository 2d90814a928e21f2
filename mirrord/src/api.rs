//! Control API — JSON endpoints for starting, stopping and inspecting receivers
//!
//! A front end (web page, menu-bar app, script) drives the registry through
//! these routes. Responses are structured data only; presenting them is the
//! caller's job.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use uxmirror_registry::{ProcessRegistry, RegistryError};

use crate::config::MirrorConfig;

/// Shared state for the control API
#[derive(Clone)]
pub struct ApiState {
    registry: Arc<ProcessRegistry>,
    config: Arc<MirrorConfig>,
    binary: Arc<String>,
    stop_timeout: Duration,
}

impl ApiState {
    pub fn new(registry: Arc<ProcessRegistry>, config: Arc<MirrorConfig>, binary: String) -> Self {
        let stop_timeout = config.stop_timeout();
        Self {
            registry,
            config,
            binary: Arc::new(binary),
            stop_timeout,
        }
    }
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/health", get(health_check))
        .route("/api/receivers", get(list_receivers))
        .route("/api/receivers/:label", get(get_receiver))
        .route("/api/receivers/:label/start", post(start_receiver))
        .route("/api/receivers/:label/stop", post(stop_receiver))
        .route("/api/stop-all", post(stop_all))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// --- API Types ---

#[derive(Serialize)]
struct HealthResponse {
    healthy: bool,
    version: String,
}

#[derive(Serialize)]
struct ReceiverResponse {
    label: String,
    airplay_name: String,
    base_port: u16,
    configured: bool,
    running: bool,
    stopping: bool,
    pid: Option<u32>,
    started_at: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
struct ReceiverStatusResponse {
    label: String,
    running: bool,
    pid: Option<u32>,
}

#[derive(Deserialize, Default)]
struct StartRequest {
    binary: Option<String>,
    airplay_name: Option<String>,
    base_port: Option<u16>,
    extra_args: Option<Vec<String>>,
}

#[derive(Serialize)]
struct StartResponse {
    label: String,
    pid: u32,
}

#[derive(Serialize)]
struct StopResponse {
    label: String,
    stopped: bool,
}

#[derive(Serialize)]
struct StopAllResponse {
    stopped: usize,
}

// --- Errors ---

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    kind: &'static str,
    message: String,
}

impl ApiError {
    fn unknown_receiver(label: &str) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            kind: "unknown_receiver",
            message: format!(
                "receiver '{label}' is not configured; supply airplay_name and base_port"
            ),
        }
    }

    fn invalid_request(message: String) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            kind: "invalid_request",
            message,
        }
    }

    fn internal(message: String) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            kind: "internal",
            message,
        }
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        let status = match err {
            RegistryError::NotFound(_) => StatusCode::NOT_FOUND,
            RegistryError::AlreadyRunning { .. } => StatusCode::CONFLICT,
            RegistryError::EmptyLabel | RegistryError::InvalidPort(_) => StatusCode::BAD_REQUEST,
            RegistryError::Spawn { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.kind,
            "message": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

/// Registry calls may wait on a stop in progress, so keep them off the runtime threads
async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError::internal(format!("registry task failed: {e}")))
}

/// An empty body means "use the configured values"; anything else must be a
/// well-formed JSON start request.
fn parse_start_request(headers: &HeaderMap, body: &[u8]) -> Result<StartRequest, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(StartRequest::default());
    }

    let is_json = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(';').next())
        .is_some_and(|mime| mime.trim().eq_ignore_ascii_case("application/json"));
    if !is_json {
        return Err(ApiError::invalid_request(
            "start request body requires `Content-Type: application/json`".into(),
        ));
    }

    serde_json::from_slice(body)
        .map_err(|e| ApiError::invalid_request(format!("invalid start request: {e}")))
}

// --- Handlers ---

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        healthy: true,
        version: env!("CARGO_PKG_VERSION").into(),
    })
}

/// Configured receivers first, then any live receiver started under another label
async fn list_receivers(
    State(state): State<ApiState>,
) -> Result<Json<Vec<ReceiverResponse>>, ApiError> {
    let registry = state.registry.clone();
    let live = blocking(move || registry.list()).await?;

    let mut response: Vec<ReceiverResponse> = state
        .config
        .receivers
        .iter()
        .map(|r| {
            let status = live.iter().find(|s| s.label == r.label);
            ReceiverResponse {
                label: r.label.clone(),
                airplay_name: r.airplay_name.clone(),
                base_port: r.base_port,
                configured: true,
                running: status.is_some(),
                stopping: status.is_some_and(|s| s.stopping),
                pid: status.map(|s| s.pid),
                started_at: status.map(|s| s.started_at),
            }
        })
        .collect();

    response.extend(
        live.iter()
            .filter(|s| state.config.receiver(&s.label).is_none())
            .map(|s| ReceiverResponse {
                label: s.label.clone(),
                airplay_name: s.airplay_name.clone(),
                base_port: s.base_port,
                configured: false,
                running: true,
                stopping: s.stopping,
                pid: Some(s.pid),
                started_at: Some(s.started_at),
            }),
    );

    Ok(Json(response))
}

async fn get_receiver(
    State(state): State<ApiState>,
    Path(label): Path<String>,
) -> Result<Json<ReceiverStatusResponse>, ApiError> {
    let registry = state.registry.clone();
    let lookup = label.clone();
    let pid = blocking(move || registry.get_pid(&lookup)).await?;
    Ok(Json(ReceiverStatusResponse {
        label,
        running: pid.is_some(),
        pid,
    }))
}

async fn start_receiver(
    State(state): State<ApiState>,
    Path(label): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<StartResponse>, ApiError> {
    let req = parse_start_request(&headers, &body).inspect_err(|e| {
        warn!(label = %label, "Rejected start request: {}", e.message);
    })?;
    let configured = state.config.receiver(&label);

    let airplay_name = req
        .airplay_name
        .or_else(|| configured.map(|r| r.airplay_name.clone()))
        .ok_or_else(|| ApiError::unknown_receiver(&label))?;
    let base_port = req
        .base_port
        .or_else(|| configured.map(|r| r.base_port))
        .ok_or_else(|| ApiError::unknown_receiver(&label))?;
    let extra_args = req
        .extra_args
        .or_else(|| configured.map(|r| r.extra_args.clone()))
        .unwrap_or_default();
    let binary = req.binary.unwrap_or_else(|| (*state.binary).clone());

    let registry = state.registry.clone();
    let spawn_label = label.clone();
    let result = blocking(move || {
        registry.start(&spawn_label, &binary, &airplay_name, base_port, &extra_args)
    })
    .await?;

    match result {
        Ok(pid) => {
            info!(label = %label, pid, "Receiver started via API");
            Ok(Json(StartResponse { label, pid }))
        }
        Err(e) => {
            warn!(label = %label, "Start request failed: {e}");
            Err(e.into())
        }
    }
}

async fn stop_receiver(
    State(state): State<ApiState>,
    Path(label): Path<String>,
) -> Result<Json<StopResponse>, ApiError> {
    let registry = state.registry.clone();
    let timeout = state.stop_timeout;
    let stop_label = label.clone();
    let stopped = blocking(move || registry.stop(&stop_label, timeout)).await?;
    Ok(Json(StopResponse { label, stopped }))
}

async fn stop_all(State(state): State<ApiState>) -> Result<Json<StopAllResponse>, ApiError> {
    let registry = state.registry.clone();
    let timeout = state.stop_timeout;
    let stopped = blocking(move || registry.stop_all(timeout)).await?;
    Ok(Json(StopAllResponse { stopped }))
}
