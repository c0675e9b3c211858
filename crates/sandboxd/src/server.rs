//! HTTP front end for sandboxd.
//!
//! Thin JSON/SSE layer over the registry and reporter. Handlers translate
//! payloads and errors; every execution decision lives in the engine.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures_util::{Stream, StreamExt};
use sandbox_core::request::TimeoutInput;
use sandbox_core::{
    ExecutionEvent, ExecutionRequest, ExecutionResult, ExecutionStatus, ExecutionSummary, Id,
    Language,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::registry::{Registry, RegistryError};
use crate::reporter::{EventSubscription, Replay, Reporter};
use crate::workspace::{ResetReport, WorkspaceError};

/// Header carrying the API token.
pub const TOKEN_HEADER: &str = "x-sandbox-token";

/// Shared state for HTTP handlers.
#[derive(Debug)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub reporter: Reporter,
    pub auth_token: Option<String>,
}

/// Create the HTTP router with all endpoints.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health_check))
        // Executions
        .route("/execute", post(execute))
        .route("/executions", post(submit_execution).get(list_executions))
        .route("/executions/{id}", get(get_execution))
        .route("/executions/{id}/cancel", post(cancel_execution))
        .route("/executions/{id}/events", get(stream_events))
        .route("/run_code", post(run_code))
        // Workspace files
        .route("/write", post(write_file))
        .route("/read", get(read_file))
        .route("/workspace/reset", post(reset_workspace))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until `shutdown` is cancelled.
///
/// Executions are stopped before connections drain, so pending waits and
/// open event streams finish instead of holding the server open.
pub async fn start_server(
    state: Arc<AppState>,
    addr: SocketAddr,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let registry = Arc::clone(&state.registry);
    let router = create_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("HTTP server listening on http://{}", listener.local_addr()?);

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
            registry.shutdown().await;
        })
        .await
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, error: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
        }),
    )
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        let status = match &err {
            RegistryError::InvalidRequest(_) | RegistryError::InvalidPath { .. } => {
                StatusCode::BAD_REQUEST
            }
            RegistryError::WorkspaceBusy { .. } => StatusCode::CONFLICT,
            RegistryError::TooManyRequests(_) => StatusCode::TOO_MANY_REQUESTS,
            RegistryError::NotFound(_) | RegistryError::Workspace(WorkspaceError::NotFound(_)) => {
                StatusCode::NOT_FOUND
            }
            RegistryError::Shutdown => StatusCode::SERVICE_UNAVAILABLE,
            RegistryError::Workspace(_) => {
                error!("workspace error: {}", err);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        api_error(status, err.to_string())
    }
}

/// Validate the auth token if one is configured.
///
/// Accepts `X-Sandbox-Token: <token>` or `Authorization: Bearer <token>`.
fn check_auth(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = &state.auth_token else {
        return Ok(());
    };

    let provided = headers
        .get(TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .or_else(|| {
            headers
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .map(|s| s.strip_prefix("Bearer ").unwrap_or(s))
        });

    match provided {
        Some(token) if token == expected => Ok(()),
        Some(_) => Err(api_error(StatusCode::UNAUTHORIZED, "invalid auth token")),
        None => Err(api_error(StatusCode::UNAUTHORIZED, "missing auth token")),
    }
}

// --- Request/Response types ---

/// Error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Response for POST /executions.
#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub id: Id,
    pub status: ExecutionStatus,
}

/// Response for GET /executions.
#[derive(Debug, Serialize, Deserialize)]
pub struct ListExecutionsResponse {
    pub executions: Vec<ExecutionSummary>,
}

/// Query params for GET /executions/{id}.
#[derive(Debug, Deserialize, Default)]
pub struct GetExecutionQuery {
    /// Block up to this long for the execution to finish.
    #[serde(default)]
    pub wait_ms: Option<u64>,
}

/// Query params for GET /executions/{id}/events.
#[derive(Debug, Deserialize, Default)]
pub struct StreamEventsQuery {
    /// Replay buffered output before live events.
    #[serde(default)]
    pub replay: bool,
}

/// Request payload for POST /run_code.
#[derive(Debug, Deserialize)]
pub struct RunCodeRequest {
    #[serde(default = "default_language")]
    pub language: String,
    pub code: String,
    #[serde(default)]
    pub timeout: Option<TimeoutInput>,
}

fn default_language() -> String {
    "python".to_string()
}

/// Response for POST /run_code.
#[derive(Debug, Serialize, Deserialize)]
pub struct RunCodeResponse {
    #[serde(flatten)]
    pub result: ExecutionResult,
    /// Script file name, relative to the workspace root.
    pub temp_file: String,
}

/// Request payload for POST /write.
#[derive(Debug, Deserialize)]
pub struct WriteFileRequest {
    pub path: String,
    pub content: String,
}

/// Query params for GET /read.
#[derive(Debug, Deserialize)]
pub struct ReadFileQuery {
    pub path: String,
}

// --- Handlers ---

/// GET / - Service banner.
async fn root(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "online",
        "workspace": state.registry.workspace().root().display().to_string(),
        "auth_enabled": state.auth_token.is_some(),
    }))
}

/// Health check endpoint.
async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "running": state.registry.running_count(),
        "pending": state.registry.pending_count(),
    }))
}

/// POST /execute - Run a command and return its result.
///
/// With `stream: true` the response is an SSE stream instead.
async fn execute(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<ExecutionRequest>,
) -> Result<Response, ApiError> {
    check_auth(&state, &headers)?;

    let submission = state.registry.submit(&req)?;
    if let Some(events) = submission.events {
        return Ok(sse_response(events).into_response());
    }

    let result = state
        .reporter
        .await_result(&submission.execution, state.reporter.max_wait())
        .await;
    Ok(Json(result).into_response())
}

/// POST /executions - Submit a command without waiting.
async fn submit_execution(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(mut req): Json<ExecutionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;

    // Events are fetched separately from /executions/{id}/events.
    req.stream = false;
    let submission = state.registry.submit(&req)?;
    let execution = submission.execution;

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            id: execution.id().clone(),
            status: execution.status(),
        }),
    ))
}

/// GET /executions - List retained executions.
async fn list_executions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;

    let executions = state
        .registry
        .list()
        .iter()
        .map(|e| ExecutionSummary::from(&state.reporter.result(e)))
        .collect();
    Ok(Json(ListExecutionsResponse { executions }))
}

/// GET /executions/{id} - Get an execution result.
async fn get_execution(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(query): Query<GetExecutionQuery>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;

    let execution = state.registry.get(&id)?;
    let result = match query.wait_ms {
        Some(ms) => {
            state
                .reporter
                .await_result(&execution, Duration::from_millis(ms))
                .await
        }
        None => state.reporter.result(&execution),
    };
    Ok(Json(result))
}

/// POST /executions/{id}/cancel - Cancel and return the settled result.
async fn cancel_execution(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;

    let execution = state.registry.cancel(&id)?;
    let result = state
        .reporter
        .await_result(&execution, state.reporter.max_wait())
        .await;
    Ok(Json(result))
}

/// GET /executions/{id}/events - Stream execution events (SSE).
async fn stream_events(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(query): Query<StreamEventsQuery>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    check_auth(&state, &headers)?;

    let execution = state.registry.get(&id).map_err(|e| {
        warn!("execution not found: {}", id);
        e
    })?;
    let replay = if query.replay {
        Replay::FromStart
    } else {
        Replay::Live
    };
    Ok(sse_response(state.reporter.subscribe(&execution, replay)))
}

fn sse_response(
    events: EventSubscription,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let stream = events.into_stream().filter_map(|event| {
        futures_util::future::ready(to_sse_event(&event).map(Ok::<_, Infallible>))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// Encode one event as an SSE frame. Events that fail to serialize are
/// logged and skipped.
fn to_sse_event(event: &ExecutionEvent) -> Option<SseEvent> {
    let name = event.event_type().as_str();
    match SseEvent::default().event(name).json_data(event.to_payload()) {
        Ok(sse) => Some(sse),
        Err(e) => {
            error!("failed to serialize {} event: {}", name, e);
            None
        }
    }
}

/// POST /run_code - Write a script into the workspace and run it.
async fn run_code(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<RunCodeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;

    let language = Language::parse(&req.language).ok_or_else(|| {
        api_error(
            StatusCode::BAD_REQUEST,
            format!(
                "unsupported language: {}. Supported: {}",
                req.language,
                Language::NAMES.join(", ")
            ),
        )
    })?;

    let temp_file = state
        .registry
        .workspace()
        .write_script(language, &req.code)
        .map_err(RegistryError::from)?;

    let mut exec_req = ExecutionRequest::argv([language.runner(), temp_file.as_str()]);
    exec_req.timeout = req.timeout;
    let submission = state.registry.submit(&exec_req)?;
    let result = state
        .reporter
        .await_result(&submission.execution, state.reporter.max_wait())
        .await;

    info!(language = language.runner(), temp_file = %temp_file, status = %result.status, "ran code snippet");
    Ok(Json(RunCodeResponse { result, temp_file }))
}

/// POST /write - Write a file inside the workspace.
async fn write_file(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<WriteFileRequest>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;

    let path = state
        .registry
        .workspace()
        .write_file(&req.path, req.content.as_bytes())
        .map_err(RegistryError::from)?;
    Ok(Json(serde_json::json!({
        "status": "success",
        "path": path.display().to_string(),
    })))
}

/// GET /read - Read a file inside the workspace.
async fn read_file(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ReadFileQuery>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;

    let bytes = state
        .registry
        .workspace()
        .read_file(&query.path)
        .map_err(RegistryError::from)?;
    Ok(Json(serde_json::json!({
        "content": String::from_utf8_lossy(&bytes),
    })))
}

/// POST /workspace/reset - Clear the workspace.
async fn reset_workspace(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<ResetReport>, ApiError> {
    check_auth(&state, &headers)?;

    let registry = Arc::clone(&state.registry);
    let report = tokio::task::spawn_blocking(move || registry.reset_workspace())
        .await
        .map_err(|e| {
            error!("workspace reset task failed: {}", e);
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "workspace reset failed")
        })??;
    Ok(Json(report))
}
