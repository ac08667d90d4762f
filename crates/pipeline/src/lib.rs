//! Render orchestration on top of the core model and the ComfyUI client.
//!
//! - [`engine`] dispatches render queues one workflow at a time.
//! - [`wizard`] turns LLM workflow output into new shots.
//! - [`edit`] exports, merges and extends shots with FFmpeg.

pub mod edit;
pub mod engine;
pub mod error;
pub mod wizard;
