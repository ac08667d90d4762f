//! ComfyUI REST and WebSocket client library.
//!
//! Provides workflow submission and history polling over HTTP, typed
//! WebSocket message parsing, per-prompt execution tracking, reconnection
//! backoff, output extraction from history records, and a launcher for a
//! local ComfyUI process.

pub mod api;
pub mod client;
pub mod events;
pub mod history;
pub mod launcher;
pub mod messages;
pub mod processor;
pub mod reconnect;
