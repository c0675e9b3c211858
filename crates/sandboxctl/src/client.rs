//! HTTP client for the sandboxd daemon.

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use sandbox_core::{
    EventPayload, ExecutionRequest, ExecutionResult, ExecutionStatus, ExecutionSummary, Id,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("daemon not running at {addr}\n  → start with: sandboxd\n  → or set SANDBOXD_ADDR if using a different address")]
    ConnectionFailed { addr: String },

    #[error("HTTP error: {status} - {message}")]
    HttpError { status: u16, message: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("I/O error: {0}")]
    IoError(String),

    #[error("unauthorized: check SANDBOX_TOKEN env var or --token flag")]
    Unauthorized,

    #[error("too many requests: {0}")]
    TooManyRequests(String),

    #[error("workspace busy: {0}")]
    WorkspaceBusy(String),

    #[error("daemon is shutting down")]
    ShuttingDown,

    #[error(
        "daemon not ready after {timeout_ms}ms at {addr}\n  → ensure sandboxd is running\n  → check SANDBOX_TOKEN if auth is enabled"
    )]
    DaemonNotReady { addr: String, timeout_ms: u64 },
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() {
            let addr = e
                .url()
                .map(|u| u.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            ClientError::ConnectionFailed { addr }
        } else {
            ClientError::HttpError {
                status: e.status().map(|s| s.as_u16()).unwrap_or(0),
                message: e.to_string(),
            }
        }
    }
}

/// Response from POST /executions.
#[derive(Debug, Deserialize)]
pub struct SubmitResponse {
    pub id: Id,
    pub status: ExecutionStatus,
}

/// Response from GET /executions.
#[derive(Debug, Deserialize)]
pub struct ListExecutionsResponse {
    pub executions: Vec<ExecutionSummary>,
}

/// Request payload for POST /run_code.
#[derive(Debug, Serialize)]
pub struct RunCodeRequest {
    pub language: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
}

/// Response from POST /run_code.
#[derive(Debug, Deserialize)]
pub struct RunCodeResponse {
    #[serde(flatten)]
    pub result: ExecutionResult,
    pub temp_file: String,
}

/// Request payload for POST /write.
#[derive(Debug, Serialize)]
struct WriteFileRequest<'a> {
    path: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct WriteFileResponse {
    path: String,
}

#[derive(Debug, Deserialize)]
struct ReadFileResponse {
    content: String,
}

/// Response from POST /workspace/reset.
#[derive(Debug, Deserialize)]
pub struct ResetResponse {
    pub removed: usize,
    pub kept: Vec<String>,
}

/// Error response from API.
#[derive(Debug, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Default total timeout for the daemon readiness probe.
const DEFAULT_READY_TIMEOUT_MS: u64 = 5000;

/// Initial backoff delay for the readiness probe.
const INITIAL_BACKOFF_MS: u64 = 200;

/// HTTP client for sandboxd.
pub struct Client {
    base_url: String,
    token: Option<String>,
    http: reqwest::Client,
}

impl Client {
    pub fn new(base_url: &str, token: Option<&str>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.map(String::from),
            http: reqwest::Client::new(),
        }
    }

    /// Returns the daemon address (for error messages).
    pub fn addr(&self) -> &str {
        &self.base_url
    }

    /// Probe /health. Err if the connection failed.
    pub async fn check_health(&self) -> Result<bool, ClientError> {
        let url = format!("{}/health", self.base_url);
        let response = self.http.get(&url).headers(self.headers()).send().await?;
        Ok(response.status().is_success())
    }

    /// Wait for the daemon to become ready with exponential backoff.
    pub async fn wait_for_ready(&self) -> Result<(), ClientError> {
        self.wait_for_ready_with_timeout(DEFAULT_READY_TIMEOUT_MS)
            .await
    }

    /// Wait for the daemon to become ready with a custom timeout.
    pub async fn wait_for_ready_with_timeout(&self, timeout_ms: u64) -> Result<(), ClientError> {
        let start = std::time::Instant::now();
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            match self.check_health().await {
                Ok(true) => return Ok(()),
                Ok(false) | Err(_) => {
                    let elapsed = start.elapsed().as_millis() as u64;
                    if elapsed >= timeout_ms {
                        return Err(ClientError::DaemonNotReady {
                            addr: self.base_url.clone(),
                            timeout_ms,
                        });
                    }

                    eprintln!(
                        "waiting for daemon at {} (retrying in {}ms)",
                        self.base_url, backoff_ms
                    );

                    let remaining = timeout_ms.saturating_sub(elapsed);
                    let sleep_ms = backoff_ms.min(remaining);
                    tokio::time::sleep(std::time::Duration::from_millis(sleep_ms)).await;

                    backoff_ms = backoff_ms.saturating_mul(2);
                }
            }
        }
    }

    /// Build headers with optional auth token.
    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(token) = &self.token {
            if let Ok(value) = HeaderValue::from_str(&format!("Bearer {token}")) {
                headers.insert(AUTHORIZATION, value);
            }
        }
        headers
    }

    /// Map an error response to a client error.
    async fn handle_error(&self, response: reqwest::Response) -> ClientError {
        let status = response.status().as_u16();

        if status == 401 {
            return ClientError::Unauthorized;
        }
        if status == 503 {
            return ClientError::ShuttingDown;
        }

        let message = response
            .json::<ErrorResponse>()
            .await
            .map(|e| e.error)
            .unwrap_or_else(|_| "unknown error".to_string());

        match status {
            400 => ClientError::InvalidRequest(message),
            404 => ClientError::NotFound(message),
            409 => ClientError::WorkspaceBusy(message),
            429 => ClientError::TooManyRequests(message),
            _ => ClientError::HttpError { status, message },
        }
    }

    async fn send_json<T: serde::de::DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, ClientError> {
        let response = request.headers(self.headers()).send().await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        response
            .json()
            .await
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    /// Run a command and wait for its result.
    /// POST /execute
    pub async fn execute(&self, req: &ExecutionRequest) -> Result<ExecutionResult, ClientError> {
        let mut req = req.clone();
        req.stream = false;
        let url = format!("{}/execute", self.base_url);
        self.send_json(self.http.post(&url).json(&req)).await
    }

    /// Run a command, handing each event to `on_event` as it arrives.
    /// POST /execute with `stream: true`
    ///
    /// Returns the final result carried by the `finished` event, if the
    /// stream delivered one.
    pub async fn execute_streaming(
        &self,
        req: &ExecutionRequest,
        on_event: impl FnMut(&EventPayload),
    ) -> Result<Option<ExecutionResult>, ClientError> {
        let mut req = req.clone();
        req.stream = true;
        let url = format!("{}/execute", self.base_url);
        let response = self
            .http
            .post(&url)
            .headers(self.headers())
            .json(&req)
            .send()
            .await?;
        self.consume_events(response, on_event).await
    }

    /// Submit a command without waiting.
    /// POST /executions
    pub async fn submit(&self, req: &ExecutionRequest) -> Result<SubmitResponse, ClientError> {
        let url = format!("{}/executions", self.base_url);
        self.send_json(self.http.post(&url).json(req)).await
    }

    /// Get an execution result, optionally waiting for it to finish.
    /// GET /executions/{id}?wait_ms=...
    pub async fn get(
        &self,
        id: &str,
        wait_ms: Option<u64>,
    ) -> Result<ExecutionResult, ClientError> {
        let mut url = format!("{}/executions/{}", self.base_url, urlencoding::encode(id));
        if let Some(ms) = wait_ms {
            url = format!("{url}?wait_ms={ms}");
        }
        self.send_json(self.http.get(&url)).await
    }

    /// List retained executions.
    /// GET /executions
    pub async fn list(&self) -> Result<Vec<ExecutionSummary>, ClientError> {
        let url = format!("{}/executions", self.base_url);
        let body: ListExecutionsResponse = self.send_json(self.http.get(&url)).await?;
        Ok(body.executions)
    }

    /// Cancel an execution and return its settled result.
    /// POST /executions/{id}/cancel
    pub async fn cancel(&self, id: &str) -> Result<ExecutionResult, ClientError> {
        let url = format!(
            "{}/executions/{}/cancel",
            self.base_url,
            urlencoding::encode(id)
        );
        self.send_json(self.http.post(&url)).await
    }

    /// Follow an execution's events.
    /// GET /executions/{id}/events?replay=...
    pub async fn tail(
        &self,
        id: &str,
        replay: bool,
        on_event: impl FnMut(&EventPayload),
    ) -> Result<Option<ExecutionResult>, ClientError> {
        let url = format!(
            "{}/executions/{}/events?replay={}",
            self.base_url,
            urlencoding::encode(id),
            replay
        );
        let response = self.http.get(&url).headers(self.headers()).send().await?;
        self.consume_events(response, on_event).await
    }

    /// Write a code snippet to the workspace and run it.
    /// POST /run_code
    pub async fn run_code(&self, req: &RunCodeRequest) -> Result<RunCodeResponse, ClientError> {
        let url = format!("{}/run_code", self.base_url);
        self.send_json(self.http.post(&url).json(req)).await
    }

    /// Write a file in the workspace. Returns the absolute path written.
    /// POST /write
    pub async fn write_file(&self, path: &str, content: &str) -> Result<String, ClientError> {
        let url = format!("{}/write", self.base_url);
        let body: WriteFileResponse = self
            .send_json(
                self.http
                    .post(&url)
                    .json(&WriteFileRequest { path, content }),
            )
            .await?;
        Ok(body.path)
    }

    /// Read a file from the workspace.
    /// GET /read?path=...
    pub async fn read_file(&self, path: &str) -> Result<String, ClientError> {
        let url = format!("{}/read?path={}", self.base_url, urlencoding::encode(path));
        let body: ReadFileResponse = self.send_json(self.http.get(&url)).await?;
        Ok(body.content)
    }

    /// Clear the workspace.
    /// POST /workspace/reset
    pub async fn reset_workspace(&self) -> Result<ResetResponse, ClientError> {
        let url = format!("{}/workspace/reset", self.base_url);
        self.send_json(self.http.post(&url)).await
    }

    /// Read an SSE response to the end.
    async fn consume_events(
        &self,
        response: reqwest::Response,
        mut on_event: impl FnMut(&EventPayload),
    ) -> Result<Option<ExecutionResult>, ClientError> {
        use futures::StreamExt;

        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }

        let mut stream = response.bytes_stream();
        let mut buffer = String::new();
        let mut finished = None;

        let mut handle = |event_str: &str, finished: &mut Option<ExecutionResult>| {
            if let Some(payload) = parse_sse_event(event_str) {
                on_event(&payload);
                if let EventPayload::Finished(result) = payload {
                    *finished = Some(result);
                }
            }
        };

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| ClientError::IoError(e.to_string()))?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            // Events are separated by a blank line.
            while let Some(end) = buffer.find("\n\n") {
                let event_str = buffer[..end].to_string();
                buffer.drain(..end + 2);
                handle(&event_str, &mut finished);
            }
        }

        if !buffer.trim().is_empty() {
            handle(&buffer, &mut finished);
        }

        Ok(finished)
    }
}

/// Parse one SSE event block into a payload. Comments, keep-alives and
/// unknown events yield `None`.
fn parse_sse_event(event_str: &str) -> Option<EventPayload> {
    let mut event_type = None;
    let mut data = None;

    for line in event_str.lines() {
        if let Some(value) = line.strip_prefix("event:") {
            event_type = Some(value.trim());
        } else if let Some(value) = line.strip_prefix("data:") {
            data = Some(value.trim());
        }
    }

    let payload: EventPayload = serde_json::from_str(data?).ok()?;
    match event_type {
        Some(name) if name == payload.event_type().as_str() => Some(payload),
        None => Some(payload),
        Some(_) => None,
    }
}
