//! Domain model and pure logic for Cinema Shot Designer.
//!
//! Shots, ComfyUI workflow graphs and parameter injection, render
//! signatures, render-queue ordering, project persistence, user settings,
//! and the thin FFmpeg wrapper used for assembling and exporting clips.

pub mod error;
pub mod ffmpeg;
pub mod hashing;
pub mod naming;
pub mod param;
pub mod project;
pub mod queue;
pub mod relink;
pub mod settings;
pub mod shot;
pub mod signature;
pub mod types;
pub mod workflow;
