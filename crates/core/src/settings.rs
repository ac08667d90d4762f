//! User settings persisted as JSON in the platform config directory.
//!
//! Defaults are suitable for a local ComfyUI on port 8188. The `COMFY_URL`
//! environment variable (read after `.env` is loaded) overrides the stored
//! server address.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::CoreError;
use crate::param::{Param, ParamKind};
use crate::shot::{MediaKind, WorkflowParams};

/// Directory under the platform config dir holding the settings file.
pub const APP_DIR: &str = "CinemaShotDesigner";

pub const SETTINGS_FILE: &str = "user_settings.json";

const DEFAULT_COMFY_URL: &str = "http://localhost:8188";

const MAX_RECENT_FILES: usize = 10;

/// workflow path -> node ID -> input name -> visible.
pub type ParamVisibility = BTreeMap<String, BTreeMap<String, BTreeMap<String, bool>>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Base HTTP URL of the ComfyUI server.
    pub comfy_ip: String,
    /// Python interpreter used to launch a local ComfyUI.
    pub comfy_py_path: String,
    /// Path to ComfyUI's `main.py`.
    pub comfy_main_path: String,
    pub default_shot_params: Vec<Param>,
    pub default_image_params: Vec<Param>,
    pub default_video_params: Vec<Param>,
    /// Saved params per workflow path, merged when a workflow is attached.
    pub workflow_defaults: BTreeMap<String, WorkflowParams>,
    pub workflow_param_visibility: ParamVisibility,
    /// Directory scanned for image workflows.
    pub comfy_image_workflows: Option<String>,
    /// Directory scanned for video workflows.
    pub comfy_video_workflows: Option<String>,
    pub recent_files: Vec<String>,
    /// Track executions over the WebSocket instead of only polling history.
    pub use_websocket: bool,
    /// WebSocket base URL when it is not reachable next to `comfy_ip`,
    /// e.g. behind a reverse proxy.
    pub comfy_ws_url: Option<String>,
    /// Connect attempts after the WebSocket drops mid-execution.
    pub ws_reconnect_attempts: u32,
    pub poll_interval_secs: u64,
    /// Upper bound on a single workflow execution.
    pub render_timeout_secs: u64,
    /// How long to wait for a previous workflow's output file to appear.
    pub prev_result_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        let mut image = Param::new("Image", ParamKind::Image, json!("")).with_nodes(["1"]);
        image.use_shot_image = true;

        Self {
            comfy_ip: DEFAULT_COMFY_URL.to_string(),
            comfy_py_path: String::new(),
            comfy_main_path: String::new(),
            default_shot_params: Vec::new(),
            default_image_params: Vec::new(),
            default_video_params: vec![image],
            workflow_defaults: BTreeMap::new(),
            workflow_param_visibility: BTreeMap::new(),
            comfy_image_workflows: None,
            comfy_video_workflows: None,
            recent_files: Vec::new(),
            use_websocket: true,
            comfy_ws_url: None,
            ws_reconnect_attempts: 5,
            poll_interval_secs: 2,
            render_timeout_secs: 3600,
            prev_result_timeout_secs: 300,
        }
    }
}

impl Settings {
    /// `<config dir>/CinemaShotDesigner/user_settings.json`, when the
    /// platform has a config directory.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join(APP_DIR).join(SETTINGS_FILE))
    }

    /// Load settings from `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, CoreError> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No settings file, using defaults");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path).map_err(|e| CoreError::io(path, e))?;
        serde_json::from_str(&raw).map_err(|e| CoreError::json(path, e))
    }

    pub fn save(&self, path: &Path) -> Result<(), CoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CoreError::io(parent, e))?;
        }
        let body = serde_json::to_string_pretty(self).map_err(|e| CoreError::json(path, e))?;
        std::fs::write(path, body).map_err(|e| CoreError::io(path, e))?;
        tracing::debug!(path = %path.display(), "Settings saved");
        Ok(())
    }

    /// Apply environment overrides.
    ///
    /// | Env Var     | Field      |
    /// |-------------|------------|
    /// | `COMFY_URL` | `comfy_ip` |
    pub fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("COMFY_URL") {
            let url = url.trim();
            if !url.is_empty() {
                self.comfy_ip = url.to_string();
            }
        }
    }

    /// Server URL without a trailing slash.
    pub fn comfy_url(&self) -> &str {
        self.comfy_ip.trim_end_matches('/')
    }

    /// Explicit WebSocket URL, if one is configured.
    pub fn ws_url_override(&self) -> Option<&str> {
        self.comfy_ws_url
            .as_deref()
            .map(|url| url.trim().trim_end_matches('/'))
            .filter(|url| !url.is_empty())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn render_timeout(&self) -> Duration {
        Duration::from_secs(self.render_timeout_secs)
    }

    pub fn prev_result_timeout(&self) -> Duration {
        Duration::from_secs(self.prev_result_timeout_secs)
    }

    /// Saved visibility of a workflow input; unknown inputs are hidden.
    pub fn param_visible(&self, workflow_path: &str, node_id: &str, input: &str) -> bool {
        self.workflow_param_visibility
            .get(workflow_path)
            .and_then(|nodes| nodes.get(node_id))
            .and_then(|inputs| inputs.get(input))
            .copied()
            .unwrap_or(false)
    }

    pub fn set_param_visibility(&mut self, workflow_path: &str, node_id: &str, input: &str, visible: bool) {
        self.workflow_param_visibility
            .entry(workflow_path.to_string())
            .or_default()
            .entry(node_id.to_string())
            .or_default()
            .insert(input.to_string(), visible);
    }

    pub fn workflow_defaults_for(&self, workflow_path: &str) -> Option<&WorkflowParams> {
        self.workflow_defaults.get(workflow_path)
    }

    pub fn save_workflow_defaults(&mut self, workflow_path: &str, params: WorkflowParams) {
        self.workflow_defaults.insert(workflow_path.to_string(), params);
    }

    /// Default shot params for a new shot: shot, image and video defaults.
    pub fn new_shot_params(&self) -> Vec<Param> {
        self.default_shot_params
            .iter()
            .chain(&self.default_image_params)
            .chain(&self.default_video_params)
            .cloned()
            .collect()
    }

    /// Move `path` to the front of the recent-files list.
    pub fn add_recent(&mut self, path: &str) {
        self.recent_files.retain(|p| p != path);
        self.recent_files.insert(0, path.to_string());
        self.recent_files.truncate(MAX_RECENT_FILES);
    }

    /// Workflow JSON files in the configured directory for `kind`, sorted.
    pub fn list_workflows(&self, kind: MediaKind) -> Result<Vec<PathBuf>, CoreError> {
        let dir = match kind {
            MediaKind::Image => self.comfy_image_workflows.as_deref(),
            MediaKind::Video => self.comfy_video_workflows.as_deref(),
        };
        let Some(dir) = dir else {
            return Ok(Vec::new());
        };
        let entries = std::fs::read_dir(dir).map_err(|e| CoreError::io(dir, e))?;
        let mut files: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("json")))
            .collect();
        files.sort();
        Ok(files)
    }
}
