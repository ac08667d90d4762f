//! Re-establishing a dropped ComfyUI WebSocket.
//!
//! The socket is re-opened with the same client ID, so a prompt queued
//! before the drop keeps reporting its progress on the new connection.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::client::{ComfyUIClient, ComfyUIConnection};

/// Retry policy: delays grow geometrically up to a ceiling.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Failed connects tolerated before giving up; `None` never gives up.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            max_attempts: Some(5),
        }
    }
}

/// Delays to sleep between consecutive connect attempts.
///
/// The first attempt happens immediately, so a cap of `n` attempts
/// yields `n - 1` delays.
#[derive(Debug, Clone)]
pub struct Backoff {
    next: Duration,
    remaining: Option<u32>,
    max_delay: Duration,
    multiplier: f64,
}

impl Backoff {
    pub fn new(config: &ReconnectConfig) -> Self {
        Self {
            next: config.initial_delay.min(config.max_delay),
            remaining: config.max_attempts.map(|n| n.saturating_sub(1)),
            max_delay: config.max_delay,
            multiplier: config.multiplier,
        }
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if let Some(remaining) = self.remaining.as_mut() {
            if *remaining == 0 {
                return None;
            }
            *remaining -= 1;
        }
        let current = self.next;
        self.next = current.mul_f64(self.multiplier).min(self.max_delay);
        Some(current)
    }
}

/// Connect again as `client_id`, backing off between failures.
///
/// `None` means the token was cancelled or the attempts ran out.
pub async fn reconnect_loop(
    client: &ComfyUIClient,
    client_id: &str,
    config: &ReconnectConfig,
    cancel: &CancellationToken,
) -> Option<ComfyUIConnection> {
    let mut delays = Backoff::new(config);
    let mut attempt = 1u32;

    loop {
        let result = tokio::select! {
            _ = cancel.cancelled() => return None,
            result = client.connect_with_id(client_id) => result,
        };
        match result {
            Ok(conn) => {
                tracing::info!(client_id, attempt, "WebSocket restored");
                return Some(conn);
            }
            Err(e) => tracing::warn!(client_id, attempt, error = %e, "WebSocket reconnect failed"),
        }

        let Some(delay) = delays.next() else {
            tracing::warn!(url = client.ws_url(), attempts = attempt, "Giving up on WebSocket");
            return None;
        };
        tracing::debug!(delay_ms = delay.as_millis() as u64, "Waiting before next reconnect");
        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
    }
}
