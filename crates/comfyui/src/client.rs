//! WebSocket client for connecting to a ComfyUI instance.
//!
//! [`ComfyUIClient`] holds the connection configuration for a single
//! ComfyUI server.  Call [`ComfyUIClient::connect`] to establish a
//! live [`ComfyUIConnection`] over WebSocket.

use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

pub type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Configuration handle for a ComfyUI server.
#[derive(Debug, Clone)]
pub struct ComfyUIClient {
    ws_url: String,
    api_url: String,
}

/// A live WebSocket connection to a ComfyUI server.
pub struct ComfyUIConnection {
    /// Client ID sent during the handshake. Prompts submitted with the
    /// same `client_id` report their progress on this socket.
    pub client_id: String,
    /// Base HTTP API URL (e.g. `http://host:8188`).
    pub api_url: String,
    pub ws_stream: WsStream,
}

impl ComfyUIClient {
    /// Create a client from the server's HTTP base URL.
    ///
    /// The WebSocket URL is derived with [`ws_url_from_http`].
    pub fn new(api_url: impl Into<String>) -> Self {
        let api_url = api_url.into().trim_end_matches('/').to_string();
        Self {
            ws_url: ws_url_from_http(&api_url),
            api_url,
        }
    }

    /// Create a client whose WebSocket lives at an explicit `ws_url`.
    pub fn with_ws_url(api_url: impl Into<String>, ws_url: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into().trim_end_matches('/').to_string(),
            ws_url: ws_url_from_http(&ws_url.into()),
        }
    }

    /// WebSocket base URL (e.g. `ws://host:8188`).
    pub fn ws_url(&self) -> &str {
        &self.ws_url
    }

    /// HTTP API base URL (e.g. `http://host:8188`).
    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Connect with a freshly generated client ID (UUID v4).
    pub async fn connect(&self) -> Result<ComfyUIConnection, ComfyUIClientError> {
        self.connect_with_id(&uuid::Uuid::new_v4().to_string()).await
    }

    /// Connect to `{ws_url}/ws?clientId={client_id}`.
    pub async fn connect_with_id(
        &self,
        client_id: &str,
    ) -> Result<ComfyUIConnection, ComfyUIClientError> {
        let url = format!("{}/ws?clientId={}", self.ws_url, client_id);

        let (ws_stream, _response) = connect_async(&url).await.map_err(|e| {
            ComfyUIClientError::Connection(format!(
                "Failed to connect to ComfyUI at {}: {e}",
                self.ws_url
            ))
        })?;

        tracing::info!(client_id = %client_id, "Connected to ComfyUI at {}", self.ws_url);

        Ok(ComfyUIConnection {
            client_id: client_id.to_string(),
            api_url: self.api_url.clone(),
            ws_stream,
        })
    }
}

/// Derive the WebSocket base URL from an HTTP base URL.
///
/// `http` maps to `ws`, `https` to `wss`; a bare `host:port` gets `ws://`.
pub fn ws_url_from_http(api_url: &str) -> String {
    let trimmed = api_url.trim().trim_end_matches('/');
    if let Some(rest) = trimmed.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = trimmed.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if trimmed.starts_with("ws://") || trimmed.starts_with("wss://") {
        trimmed.to_string()
    } else {
        format!("ws://{trimmed}")
    }
}

/// Errors that can occur when working with the WebSocket client.
#[derive(Debug, thiserror::Error)]
pub enum ComfyUIClientError {
    /// Failed to establish the initial WebSocket connection.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A protocol-level error on an already-established connection.
    #[error("Protocol error: {0}")]
    Protocol(String),
}
