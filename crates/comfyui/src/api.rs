//! REST client for the ComfyUI HTTP endpoints.
//!
//! Wraps the ComfyUI HTTP API (workflow submission, history retrieval,
//! queue management, interruption, image upload) using [`reqwest`].
//! Errors split into [`ApiError::Transport`] (the request never got a
//! usable response) and [`ApiError::Rejected`] (the backend answered
//! non-2xx); rejections carry the backend's own error message and are
//! never retried here.

use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::graph::NodeGraph;

/// Timeout for ordinary control-plane requests (queue, history, ...).
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
/// Timeout for heavier requests (submission, upload).
const SUBMIT_TIMEOUT: Duration = Duration::from_secs(30);
/// Timeout for the health probe; a slow backend counts as down.
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

/// HTTP client for a single ComfyUI instance.
#[derive(Debug, Clone)]
pub struct ComfyApi {
    client: reqwest::Client,
    base_url: String,
}

/// Errors from the ComfyUI REST layer.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The HTTP request itself failed (connection, DNS, timeout).
    #[error("HTTP request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// ComfyUI returned a non-2xx status; `message` is the backend's
    /// `error`/`detail` field when present, else the raw body.
    #[error("ComfyUI rejected the request ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// A local file (reference image) could not be read for upload.
    #[error("failed to read upload source: {0}")]
    Io(#[from] std::io::Error),
}

/// Response returned by `POST /prompt` after queuing a workflow.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitResponse {
    /// Server-assigned identifier for the queued job.
    pub prompt_id: String,
}

/// Response returned by `POST /upload/image`.
#[derive(Debug, Clone, Deserialize)]
pub struct UploadResponse {
    /// Server-side filename, possibly deduplicated by the backend.
    pub name: String,
}

/// Point-in-time view of the backend's execution queue.
///
/// The backend serializes execution: `running` holds at most one id in
/// practice, but the wire format allows more.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueSnapshot {
    pub running: BTreeSet<String>,
    pub pending: BTreeSet<String>,
}

impl QueueSnapshot {
    /// Parse a `GET /queue` payload. Each queue entry is an array whose
    /// first element is the job id; malformed rows are skipped.
    pub fn parse(raw: &serde_json::Value) -> Self {
        Self {
            running: Self::parse_ids(raw.get("queue_running")),
            pending: Self::parse_ids(raw.get("queue_pending")),
        }
    }

    fn parse_ids(rows: Option<&serde_json::Value>) -> BTreeSet<String> {
        rows.and_then(|v| v.as_array())
            .map(|rows| {
                rows.iter()
                    .filter_map(|row| row.as_array()?.first().map(id_to_string))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Queue rows carry ids as strings or numbers depending on version.
fn id_to_string(id: &serde_json::Value) -> String {
    match id {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl ComfyApi {
    /// Create a client for one ComfyUI instance.
    ///
    /// * `base_url` - HTTP base URL, e.g. `http://host:8188`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    /// Create a client reusing an existing [`reqwest::Client`] (shares
    /// the connection pool with other instances).
    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    /// Base HTTP URL of the backed instance.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Submit a graph for execution (`POST /prompt`).
    ///
    /// `client_id` is the dispatcher's correlation id, echoed back by
    /// the backend in push notifications.
    pub async fn submit(
        &self,
        graph: &NodeGraph,
        client_id: &str,
    ) -> Result<SubmitResponse, ApiError> {
        let body = serde_json::json!({
            "prompt": graph,
            "client_id": client_id,
        });

        let response = self
            .client
            .post(format!("{}/prompt", self.base_url))
            .timeout(SUBMIT_TIMEOUT)
            .json(&body)
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Retrieve execution history for a job (`GET /history/{id}`).
    ///
    /// The payload is keyed by job id and contains the per-node
    /// `outputs` map plus status/error messages.
    pub async fn history(&self, prompt_id: &str) -> Result<serde_json::Value, ApiError> {
        let response = self
            .client
            .get(format!("{}/history/{}", self.base_url, prompt_id))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Fetch the current pending/running queue state (`GET /queue`).
    pub async fn queue_snapshot(&self) -> Result<QueueSnapshot, ApiError> {
        let response = self
            .client
            .get(format!("{}/queue", self.base_url))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;

        let raw: serde_json::Value = Self::parse_response(response).await?;
        Ok(QueueSnapshot::parse(&raw))
    }

    /// Remove every pending job from the queue (`POST /queue` with
    /// `{"clear": true}`). Does not touch the running job.
    pub async fn clear_queue(&self) -> Result<(), ApiError> {
        self.post_queue(serde_json::json!({ "clear": true })).await
    }

    /// Remove specific pending jobs from the queue (`POST /queue` with
    /// `{"delete": [...]}`).
    pub async fn delete_from_queue(&self, prompt_ids: &[String]) -> Result<(), ApiError> {
        self.post_queue(serde_json::json!({ "delete": prompt_ids }))
            .await
    }

    /// Interrupt whatever is executing right now (`POST /interrupt`).
    ///
    /// Not addressed to a specific job -- the backend runs one job at a
    /// time and this stops it.
    pub async fn interrupt(&self) -> Result<(), ApiError> {
        let response = self
            .client
            .post(format!("{}/interrupt", self.base_url))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;

        Self::check_status(response).await
    }

    /// Upload a reference image (`POST /upload/image`, multipart).
    ///
    /// Returns the server-side filename to wire into load nodes.
    pub async fn upload_image(&self, path: &Path) -> Result<UploadResponse, ApiError> {
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "reference.png".to_string());
        let bytes = tokio::fs::read(path).await?;

        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(filename)
            .mime_str("image/png")?;
        let form = reqwest::multipart::Form::new()
            .text("type", "input")
            .text("overwrite", "true")
            .part("image", part);

        let response = self
            .client
            .post(format!("{}/upload/image", self.base_url))
            .timeout(SUBMIT_TIMEOUT)
            .multipart(form)
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Compose the artifact-retrieval URL for a history output entry.
    ///
    /// Pure string composition against `GET /view`; no request is made.
    pub fn view_url(&self, filename: &str, subfolder: &str, file_type: &str) -> String {
        let mut url = format!("{}/view?filename={filename}", self.base_url);
        if !subfolder.is_empty() {
            url.push_str(&format!("&subfolder={subfolder}"));
        }
        url.push_str(&format!("&type={file_type}"));
        url
    }

    /// Probe backend liveness (`GET /system_stats`, short timeout).
    pub async fn check_health(&self) -> bool {
        match self
            .client
            .get(format!("{}/system_stats", self.base_url))
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    // ---- private helpers ----

    async fn post_queue(&self, body: serde_json::Value) -> Result<(), ApiError> {
        let response = self
            .client
            .post(format!("{}/queue", self.base_url))
            .timeout(REQUEST_TIMEOUT)
            .json(&body)
            .send()
            .await?;

        Self::check_status(response).await
    }

    /// Turn a non-2xx response into [`ApiError::Rejected`], mining the
    /// body for the backend's `error`/`detail` field.
    async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(ApiError::Rejected {
                status: status.as_u16(),
                message: extract_error_message(&body),
            });
        }
        Ok(response)
    }

    /// Parse a successful JSON response body into the expected type.
    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ApiError> {
        let response = Self::ensure_success(response).await?;
        Ok(response.json::<T>().await?)
    }

    /// Assert success, discarding the body.
    async fn check_status(response: reqwest::Response) -> Result<(), ApiError> {
        Self::ensure_success(response).await?;
        Ok(())
    }
}

/// Pull the most specific error message out of an error response body.
///
/// ComfyUI reports errors as `{"error": ...}` (string or
/// `{message: ...}` object) or `{"detail": ...}`; anything else is
/// surfaced verbatim.
fn extract_error_message(body: &str) -> String {
    let Ok(parsed) = serde_json::from_str::<serde_json::Value>(body) else {
        return body.to_string();
    };
    if let Some(error) = parsed.get("error") {
        return match error {
            serde_json::Value::String(s) => s.clone(),
            other => other
                .get("message")
                .and_then(|m| m.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| other.to_string()),
        };
    }
    if let Some(detail) = parsed.get("detail") {
        return match detail {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
    }
    body.to_string()
}
