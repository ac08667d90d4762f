//! Per-prompt execution tracking over a ComfyUI WebSocket.
//!
//! Reads raw frames from a connection, parses them into typed
//! [`ComfyUIMessage`] variants, and turns the frames belonging to one
//! prompt into [`ExecutionEvent`]s until the prompt finishes.

use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::client::WsStream;
use crate::events::ExecutionEvent;
use crate::messages::{parse_message, ComfyUIMessage};

/// How tracking of a prompt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackOutcome {
    /// `executing` with `node: null` (or `execution_success`) was seen.
    Completed,
    /// The server reported an `execution_error`.
    Failed(String),
    /// The server reported `execution_interrupted`.
    Interrupted,
    /// The socket closed or errored before the prompt finished.
    Disconnected,
    /// The caller's token was cancelled.
    Cancelled,
}

/// Tracking state for one prompt.
#[derive(Debug)]
pub struct PromptTracker {
    prompt_id: String,
    current_node: Option<String>,
}

impl PromptTracker {
    pub fn new(prompt_id: impl Into<String>) -> Self {
        Self {
            prompt_id: prompt_id.into(),
            current_node: None,
        }
    }

    pub fn current_node(&self) -> Option<&str> {
        self.current_node.as_deref()
    }

    /// Handle one text frame. Returns `Some` once the prompt has finished.
    pub fn handle_text(
        &mut self,
        text: &str,
        event_tx: Option<&broadcast::Sender<ExecutionEvent>>,
    ) -> Option<TrackOutcome> {
        let msg = match parse_message(text) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::trace!(error = %e, raw_message = %text, "Ignoring unrecognised ComfyUI message");
                return None;
            }
        };

        if let ComfyUIMessage::Status(data) = &msg {
            tracing::debug!(
                queue_remaining = data.status.exec_info.queue_remaining,
                "ComfyUI queue status",
            );
            return None;
        }
        // Frames without a prompt ID (old servers) are attributed to us.
        if msg.prompt_id().is_some_and(|id| id != self.prompt_id) {
            return None;
        }

        let prompt_id = self.prompt_id.clone();
        let (event, outcome) = match msg {
            ComfyUIMessage::Status(_) => return None,
            ComfyUIMessage::ExecutionStart(_) => {
                tracing::info!(prompt_id = %prompt_id, "Execution started");
                (Some(ExecutionEvent::Started { prompt_id }), None)
            }
            ComfyUIMessage::ExecutionCached(data) => {
                tracing::debug!(prompt_id = %prompt_id, cached = data.nodes.len(), "Execution used cache");
                (
                    Some(ExecutionEvent::Cached {
                        prompt_id,
                        nodes: data.nodes,
                    }),
                    None,
                )
            }
            ComfyUIMessage::Executing(data) => match data.node {
                Some(node) => {
                    tracing::debug!(prompt_id = %prompt_id, node = %node, "Executing node");
                    self.current_node = Some(node.clone());
                    (Some(ExecutionEvent::NodeExecuting { prompt_id, node }), None)
                }
                None => {
                    tracing::info!(prompt_id = %prompt_id, "Execution completed (all nodes done)");
                    (
                        Some(ExecutionEvent::Completed { prompt_id }),
                        Some(TrackOutcome::Completed),
                    )
                }
            },
            ComfyUIMessage::ExecutionSuccess(_) => (
                Some(ExecutionEvent::Completed { prompt_id }),
                Some(TrackOutcome::Completed),
            ),
            ComfyUIMessage::Progress(data) => {
                let percent = data.percent();
                let current_node = data.node.or_else(|| self.current_node.clone());
                tracing::debug!(
                    prompt_id = %prompt_id,
                    value = data.value,
                    max = data.max,
                    percent,
                    "Generation progress",
                );
                (
                    Some(ExecutionEvent::Progress {
                        prompt_id,
                        percent,
                        current_node,
                    }),
                    None,
                )
            }
            ComfyUIMessage::Executed(data) => {
                tracing::debug!(prompt_id = %prompt_id, node = %data.node, "Node executed with output");
                (
                    Some(ExecutionEvent::NodeOutput {
                        prompt_id,
                        node: data.node,
                        output: data.output,
                    }),
                    None,
                )
            }
            ComfyUIMessage::ExecutionInterrupted(_) => {
                tracing::warn!(prompt_id = %prompt_id, "Execution interrupted");
                (
                    Some(ExecutionEvent::Interrupted { prompt_id }),
                    Some(TrackOutcome::Interrupted),
                )
            }
            ComfyUIMessage::ExecutionError(data) => {
                tracing::error!(
                    prompt_id = %prompt_id,
                    node_id = ?data.node_id,
                    error_type = %data.exception_type,
                    error_message = %data.exception_message,
                    "Execution error",
                );
                let error = if data.exception_type.is_empty() {
                    data.exception_message
                } else {
                    format!("{}: {}", data.exception_type, data.exception_message)
                };
                (
                    Some(ExecutionEvent::Failed {
                        prompt_id,
                        error: error.clone(),
                    }),
                    Some(TrackOutcome::Failed(error)),
                )
            }
        };

        if let (Some(event), Some(tx)) = (event, event_tx) {
            // No subscribers is fine.
            let _ = tx.send(event);
        }
        outcome
    }
}

/// Consume frames from `ws_stream` until `prompt_id` finishes.
///
/// Binary frames (live previews) are ignored.
pub async fn track_prompt(
    ws_stream: &mut WsStream,
    prompt_id: &str,
    event_tx: Option<&broadcast::Sender<ExecutionEvent>>,
    cancel: &CancellationToken,
) -> TrackOutcome {
    let mut tracker = PromptTracker::new(prompt_id);

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return TrackOutcome::Cancelled,
            next = ws_stream.next() => next,
        };

        match next {
            Some(Ok(Message::Text(text))) => {
                if let Some(outcome) = tracker.handle_text(&text, event_tx) {
                    return outcome;
                }
            }
            Some(Ok(Message::Binary(_))) => {
                tracing::trace!(prompt_id, "Ignoring binary message (preview image)");
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
            Some(Ok(Message::Close(frame))) => {
                tracing::info!(prompt_id, ?frame, "ComfyUI WebSocket closed");
                return TrackOutcome::Disconnected;
            }
            Some(Err(e)) => {
                tracing::error!(prompt_id, error = %e, "WebSocket receive error");
                return TrackOutcome::Disconnected;
            }
            None => return TrackOutcome::Disconnected,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn full_run_emits_events() {
        let (tx, mut rx) = broadcast::channel(16);
        let mut t = PromptTracker::new("p");

        let frames = [
            r#"{"type":"status","data":{"status":{"exec_info":{"queue_remaining":1}}}}"#,
            r#"{"type":"execution_start","data":{"prompt_id":"p"}}"#,
            r#"{"type":"executing","data":{"node":"3","prompt_id":"p"}}"#,
            r#"{"type":"progress","data":{"value":10,"max":20}}"#,
        ];
        for f in frames {
            assert_eq!(t.handle_text(f, Some(&tx)), None);
        }
        assert_eq!(t.current_node(), Some("3"));

        let done = t.handle_text(r#"{"type":"executing","data":{"node":null,"prompt_id":"p"}}"#, Some(&tx));
        assert_eq!(done, Some(TrackOutcome::Completed));

        assert_matches!(rx.try_recv(), Ok(ExecutionEvent::Started { .. }));
        assert_matches!(rx.try_recv(), Ok(ExecutionEvent::NodeExecuting { ref node, .. }) if node == "3");
        assert_matches!(
            rx.try_recv(),
            Ok(ExecutionEvent::Progress { percent: 50, current_node: Some(ref n), .. }) if n == "3"
        );
        assert_matches!(rx.try_recv(), Ok(ExecutionEvent::Completed { .. }));
    }

    #[test]
    fn other_prompts_are_ignored() {
        let mut t = PromptTracker::new("mine");
        let other = r#"{"type":"executing","data":{"node":null,"prompt_id":"theirs"}}"#;
        assert_eq!(t.handle_text(other, None), None);
    }

    #[test]
    fn error_ends_tracking() {
        let mut t = PromptTracker::new("p");
        let frame = r#"{"type":"execution_error","data":{"prompt_id":"p","node_id":"5","exception_message":"OOM","exception_type":"RuntimeError"}}"#;
        assert_eq!(
            t.handle_text(frame, None),
            Some(TrackOutcome::Failed("RuntimeError: OOM".into()))
        );
    }

    #[test]
    fn interrupted_and_success() {
        let mut t = PromptTracker::new("p");
        assert_eq!(
            t.handle_text(r#"{"type":"execution_interrupted","data":{"prompt_id":"p"}}"#, None),
            Some(TrackOutcome::Interrupted)
        );
        assert_eq!(
            t.handle_text(r#"{"type":"execution_success","data":{"prompt_id":"p"}}"#, None),
            Some(TrackOutcome::Completed)
        );
    }

    #[test]
    fn garbage_is_skipped() {
        let mut t = PromptTracker::new("p");
        assert_eq!(t.handle_text("{", None), None);
        assert_eq!(t.handle_text(r#"{"type":"crystools.monitor","data":{}}"#, None), None);
    }
}
