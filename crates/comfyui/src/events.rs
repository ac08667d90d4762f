//! Execution events emitted while tracking a prompt.
//!
//! Produced by [`crate::processor::track_prompt`] from raw WebSocket
//! messages; the render engine forwards them to its own subscribers.

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ExecutionEvent {
    /// The server started executing the prompt.
    Started { prompt_id: String },

    /// Nodes were served from cache and will not report progress.
    Cached { prompt_id: String, nodes: Vec<String> },

    /// A node began executing.
    NodeExecuting { prompt_id: String, node: String },

    /// Step progress within the current node.
    Progress {
        prompt_id: String,
        /// Completion percentage (0-100).
        percent: u8,
        /// The node currently executing, if known.
        current_node: Option<String>,
    },

    /// A node produced output.
    NodeOutput {
        prompt_id: String,
        node: String,
        output: serde_json::Value,
    },

    Completed { prompt_id: String },

    Failed { prompt_id: String, error: String },

    Interrupted { prompt_id: String },
}
