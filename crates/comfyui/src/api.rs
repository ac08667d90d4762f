//! REST API client for the ComfyUI HTTP endpoints.
//!
//! Wraps the ComfyUI HTTP API (workflow submission, cancellation,
//! interruption, history retrieval, output download) using [`reqwest`].

use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::history::OutputFile;

/// HTTP client for a single ComfyUI instance.
#[derive(Debug, Clone)]
pub struct ComfyUIApi {
    client: reqwest::Client,
    api_url: String,
}

/// Response returned by the ComfyUI `/prompt` endpoint after
/// successfully queuing a workflow.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitResponse {
    /// Server-assigned identifier for the queued prompt.
    pub prompt_id: String,
    /// Position in the execution queue.
    #[serde(default)]
    pub number: i64,
}

/// Snapshot of the server's execution queue (`GET /queue`).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueueState {
    #[serde(default)]
    pub queue_running: Vec<serde_json::Value>,
    #[serde(default)]
    pub queue_pending: Vec<serde_json::Value>,
}

impl QueueState {
    pub fn running(&self) -> usize {
        self.queue_running.len()
    }

    pub fn pending(&self) -> usize {
        self.queue_pending.len()
    }
}

/// Polling cadence for [`ComfyUIApi::wait_for_history`].
#[derive(Debug, Clone, Copy)]
pub struct PollConfig {
    /// Delay between history requests.
    pub interval: Duration,
    /// Give up after this long.
    pub timeout: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            timeout: Duration::from_secs(3600),
        }
    }
}

/// Errors from the ComfyUI REST API layer.
#[derive(Debug, thiserror::Error)]
pub enum ComfyUIApiError {
    /// The HTTP request itself failed (network, DNS, TLS, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// ComfyUI returned a non-2xx status code.
    #[error("ComfyUI API error ({status}): {body}")]
    ApiError {
        /// HTTP status code.
        status: u16,
        /// Raw response body for debugging.
        body: String,
    },

    /// `/prompt` answered 2xx without a `prompt_id`.
    #[error("ComfyUI accepted the workflow but returned no prompt_id: {0}")]
    MissingPromptId(String),

    /// The prompt did not show up in the history in time.
    #[error("Timed out after {}s waiting for prompt {prompt_id}", .waited.as_secs())]
    Timeout { prompt_id: String, waited: Duration },

    #[error("Operation cancelled")]
    Cancelled,
}

impl ComfyUIApi {
    /// Create a new API client for a ComfyUI instance.
    ///
    /// * `api_url` - Base HTTP URL, e.g. `http://host:8188`. A trailing
    ///   slash is stripped.
    pub fn new(api_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), api_url)
    }

    /// Create an API client reusing an existing [`reqwest::Client`].
    pub fn with_client(client: reqwest::Client, api_url: impl Into<String>) -> Self {
        let api_url = api_url.into().trim_end_matches('/').to_string();
        Self { client, api_url }
    }

    /// HTTP API base URL (e.g. `http://host:8188`).
    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Submit a workflow for execution.
    ///
    /// Sends a `POST /prompt` request with the given workflow JSON and
    /// client ID.  Returns the server-assigned `prompt_id` and queue
    /// position.
    pub async fn submit_workflow(
        &self,
        workflow: &serde_json::Value,
        client_id: &str,
    ) -> Result<SubmitResponse, ComfyUIApiError> {
        let body = serde_json::json!({
            "prompt": workflow,
            "client_id": client_id,
        });

        let response = self
            .client
            .post(format!("{}/prompt", self.api_url))
            .json(&body)
            .send()
            .await?;

        let raw: serde_json::Value = Self::parse_response(response).await?;
        let Some(prompt_id) = raw.get("prompt_id").and_then(|v| v.as_str()) else {
            return Err(ComfyUIApiError::MissingPromptId(raw.to_string()));
        };
        let submitted = SubmitResponse {
            prompt_id: prompt_id.to_string(),
            number: raw.get("number").and_then(|v| v.as_i64()).unwrap_or(0),
        };
        tracing::info!(
            prompt_id = %submitted.prompt_id,
            queue_position = submitted.number,
            "Workflow submitted to ComfyUI",
        );
        Ok(submitted)
    }

    /// Cancel a queued or running execution.
    ///
    /// Sends a `POST /queue` request asking ComfyUI to delete the
    /// specified prompt from the queue.
    pub async fn cancel_execution(&self, prompt_id: &str) -> Result<(), ComfyUIApiError> {
        let body = serde_json::json!({
            "delete": [prompt_id],
        });

        let response = self
            .client
            .post(format!("{}/queue", self.api_url))
            .json(&body)
            .send()
            .await?;

        Self::check_status(response).await
    }

    /// Interrupt the currently running execution immediately.
    ///
    /// Sends a `POST /interrupt` request.  This does not target a
    /// specific prompt -- it interrupts whatever is executing right now.
    pub async fn interrupt(&self) -> Result<(), ComfyUIApiError> {
        let response = self
            .client
            .post(format!("{}/interrupt", self.api_url))
            .send()
            .await?;

        Self::check_status(response).await
    }

    /// Retrieve execution history for a specific prompt.
    ///
    /// Sends a `GET /history/{prompt_id}` request.  The returned JSON
    /// is keyed by prompt ID and contains the node outputs.
    pub async fn get_history(&self, prompt_id: &str) -> Result<serde_json::Value, ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}/history/{}", self.api_url, prompt_id))
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Poll the history until the prompt's record appears.
    ///
    /// A 404 or an empty object means the prompt has not finished yet.
    /// Network errors are logged and retried until the timeout.
    pub async fn wait_for_history(
        &self,
        prompt_id: &str,
        poll: &PollConfig,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value, ComfyUIApiError> {
        let started = Instant::now();

        loop {
            if cancel.is_cancelled() {
                return Err(ComfyUIApiError::Cancelled);
            }

            match self.get_history(prompt_id).await {
                Ok(history) if history_ready(&history, prompt_id) => {
                    tracing::debug!(prompt_id, "History available");
                    return Ok(history);
                }
                Ok(_) | Err(ComfyUIApiError::ApiError { status: 404, .. }) => {}
                Err(ComfyUIApiError::Request(e)) => {
                    tracing::warn!(prompt_id, error = %e, "History poll failed, retrying");
                }
                Err(e) => return Err(e),
            }

            let waited = started.elapsed();
            if waited >= poll.timeout {
                return Err(ComfyUIApiError::Timeout {
                    prompt_id: prompt_id.to_string(),
                    waited,
                });
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(ComfyUIApiError::Cancelled),
                _ = tokio::time::sleep(poll.interval) => {}
            }
        }
    }

    /// Download a generated file via `GET /view`.
    pub async fn download_output(&self, file: &OutputFile) -> Result<Vec<u8>, ComfyUIApiError> {
        let mut query = vec![("filename", file.filename.as_str())];
        if !file.subfolder.is_empty() {
            query.push(("subfolder", file.subfolder.as_str()));
        }
        query.push(("type", file.kind_or_output()));

        let response = self
            .client
            .get(format!("{}/view", self.api_url))
            .query(&query)
            .send()
            .await?;

        let response = Self::ensure_success(response).await?;
        let bytes = response.bytes().await?;
        tracing::debug!(filename = %file.filename, size = bytes.len(), "Downloaded output");
        Ok(bytes.to_vec())
    }

    /// Current queue contents (`GET /queue`).
    pub async fn queue_status(&self) -> Result<QueueState, ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}/queue", self.api_url))
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Server and device information (`GET /system_stats`).
    ///
    /// Doubles as a health probe.
    pub async fn system_stats(&self) -> Result<serde_json::Value, ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}/system_stats", self.api_url))
            .send()
            .await?;

        Self::parse_response(response).await
    }

    // ---- private helpers ----

    /// Ensure the response has a success status code. Returns the
    /// response unchanged on success, or a [`ComfyUIApiError::ApiError`]
    /// containing the status and body text on failure.
    async fn ensure_success(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, ComfyUIApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(ComfyUIApiError::ApiError {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    /// Parse a successful JSON response body into the expected type.
    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ComfyUIApiError> {
        let response = Self::ensure_success(response).await?;
        Ok(response.json::<T>().await?)
    }

    /// Assert the response has a success status code, discarding the body.
    async fn check_status(response: reqwest::Response) -> Result<(), ComfyUIApiError> {
        Self::ensure_success(response).await?;
        Ok(())
    }
}

/// A history response is complete once it holds a non-empty record for
/// the prompt.
pub fn history_ready(history: &serde_json::Value, prompt_id: &str) -> bool {
    history
        .get(prompt_id)
        .and_then(|entry| entry.as_object())
        .is_some_and(|entry| !entry.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fast_poll() -> PollConfig {
        PollConfig {
            interval: Duration::from_millis(10),
            timeout: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn submit_returns_prompt_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/prompt"))
            .and(body_partial_json(json!({"client_id": "c1"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "prompt_id": "p-1",
                "number": 4,
                "node_errors": {}
            })))
            .mount(&server)
            .await;

        let api = ComfyUIApi::new(format!("{}/", server.uri()));
        let resp = api.submit_workflow(&json!({"1": {}}), "c1").await.unwrap();
        assert_eq!(resp.prompt_id, "p-1");
        assert_eq!(resp.number, 4);
    }

    #[tokio::test]
    async fn submit_without_prompt_id_fails() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/prompt"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"error": "x"})))
            .mount(&server)
            .await;

        let api = ComfyUIApi::new(server.uri());
        let err = api.submit_workflow(&json!({}), "c").await.unwrap_err();
        assert_matches!(err, ComfyUIApiError::MissingPromptId(_));
    }

    #[tokio::test]
    async fn submit_surfaces_validation_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/prompt"))
            .respond_with(ResponseTemplate::new(400).set_body_string("invalid prompt"))
            .mount(&server)
            .await;

        let api = ComfyUIApi::new(server.uri());
        let err = api.submit_workflow(&json!({}), "c").await.unwrap_err();
        assert_matches!(err, ComfyUIApiError::ApiError { status: 400, ref body } if body == "invalid prompt");
    }

    #[tokio::test]
    async fn wait_for_history_polls_until_ready() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/history/p-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/history/p-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "p-1": {"outputs": {"9": {"images": [{"filename": "a.png"}]}}}
            })))
            .mount(&server)
            .await;

        let api = ComfyUIApi::new(server.uri());
        let history = api
            .wait_for_history("p-1", &fast_poll(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(history["p-1"]["outputs"].is_object());
    }

    #[tokio::test]
    async fn wait_for_history_treats_404_as_pending() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/history/p-2"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let api = ComfyUIApi::new(server.uri());
        let err = api
            .wait_for_history("p-2", &fast_poll(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_matches!(err, ComfyUIApiError::Timeout { ref prompt_id, .. } if prompt_id == "p-2");
    }

    #[tokio::test]
    async fn wait_for_history_honours_cancellation() {
        let server = MockServer::start().await;
        let api = ComfyUIApi::new(server.uri());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = api
            .wait_for_history("p-3", &fast_poll(), &cancel)
            .await
            .unwrap_err();
        assert_matches!(err, ComfyUIApiError::Cancelled);
    }

    #[tokio::test]
    async fn download_uses_view_query() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/view"))
            .and(query_param("filename", "a.png"))
            .and(query_param("subfolder", "shots"))
            .and(query_param("type", "output"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"PNG".to_vec()))
            .mount(&server)
            .await;

        let api = ComfyUIApi::new(server.uri());
        let file = OutputFile {
            filename: "a.png".into(),
            subfolder: "shots".into(),
            kind: String::new(),
        };
        assert_eq!(api.download_output(&file).await.unwrap(), b"PNG");
    }

    #[tokio::test]
    async fn queue_and_interrupt() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/queue"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "queue_running": [[0, "p-1"]],
                "queue_pending": []
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/interrupt"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/queue"))
            .and(body_partial_json(json!({"delete": ["p-1"]})))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let api = ComfyUIApi::new(server.uri());
        let queue = api.queue_status().await.unwrap();
        assert_eq!((queue.running(), queue.pending()), (1, 0));
        api.interrupt().await.unwrap();
        api.cancel_execution("p-1").await.unwrap();
    }

    #[test]
    fn history_ready_requires_record() {
        assert!(!history_ready(&json!({}), "p"));
        assert!(!history_ready(&json!({"p": {}}), "p"));
        assert!(history_ready(&json!({"p": {"outputs": {}}}), "p"));
    }
}
