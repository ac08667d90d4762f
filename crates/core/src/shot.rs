//! Shots, their workflow assignments and rendered versions.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::param::{AssetKind, Param};
use crate::workflow::WorkflowGraph;

/// Rendered media kind. Stills are images, clips are videos.
pub type MediaKind = AssetKind;

/// Freshness of a shot's current media relative to its params.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaStatus {
    /// No media, or the file is gone.
    Missing,
    /// Media exists but params changed since it was rendered.
    Stale,
    /// Media exists and matches the current params.
    Fresh,
}

// ---------------------------------------------------------------------------
// Workflow assignment
// ---------------------------------------------------------------------------

/// Params stored on a workflow assignment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowParams {
    #[serde(default)]
    pub params: Vec<Param>,
    /// Number of frame runs; values above one assemble a video.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_count: Option<u32>,
}

impl WorkflowParams {
    pub fn runs(&self) -> u32 {
        self.run_count.unwrap_or(1).max(1)
    }

    pub fn find(&self, name: &str) -> Option<&Param> {
        self.params.iter().find(|p| p.name == name)
    }

    pub fn find_mut(&mut self, name: &str) -> Option<&mut Param> {
        self.params.iter_mut().find(|p| p.name == name)
    }
}

/// One render recorded on a workflow assignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowVersion {
    /// Snapshot of the params used for this render.
    pub params: WorkflowParams,
    pub output: String,
    #[serde(default)]
    pub is_video: bool,
    /// Seconds since the Unix epoch.
    #[serde(default)]
    pub timestamp: f64,
    /// Workflow signature the version was rendered with. Versions without
    /// one are never reused.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub signature: String,
}

/// A workflow file attached to a shot, with its params and history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowAssignment {
    pub path: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub parameters: WorkflowParams,
    #[serde(default)]
    pub is_video: bool,
    #[serde(default)]
    pub last_signature: String,
    #[serde(default)]
    pub versions: Vec<WorkflowVersion>,
}

impl WorkflowAssignment {
    /// Attach a workflow with no exposed params.
    pub fn new(path: impl Into<String>, is_video: bool) -> Self {
        Self {
            path: path.into(),
            enabled: true,
            parameters: WorkflowParams::default(),
            is_video,
            last_signature: String::new(),
            versions: Vec::new(),
        }
    }

    /// Build an assignment from a loaded graph.
    ///
    /// Every literal input becomes a param. Saved defaults for the same
    /// workflow override values (and restore previous-result bindings)
    /// when both name and node IDs match.
    pub fn from_graph(
        path: impl Into<String>,
        graph: &WorkflowGraph,
        is_video: bool,
        defaults: Option<&WorkflowParams>,
        visible: impl Fn(&str, &str) -> bool,
    ) -> Self {
        let mut assignment = Self::new(path, is_video);
        let mut params = graph.expose_params(visible);

        if let Some(defaults) = defaults {
            for param in &mut params {
                let Some(saved) = defaults
                    .params
                    .iter()
                    .find(|d| d.name == param.name && d.node_ids == param.node_ids)
                else {
                    continue;
                };
                param.value = saved.value.clone();
                if let Some(over) = &saved.dynamic_overrides {
                    param.apply_dynamic_override(over);
                }
            }
            assignment.parameters.run_count = defaults.run_count;
        }

        assignment.parameters.params = params;
        assignment
    }

    pub fn media_kind(&self) -> MediaKind {
        MediaKind::from_is_video(self.is_video)
    }

    /// A recorded version rendered under `signature` whose file still exists.
    ///
    /// The signature covers shot params as well, so a version made before
    /// a prompt change does not qualify.
    pub fn reusable_output(&self, signature: &str) -> Option<&WorkflowVersion> {
        if signature.is_empty() {
            return None;
        }
        self.versions.iter().rev().find(|v| {
            v.is_video == self.is_video
                && v.signature == signature
                && Path::new(&v.output).exists()
        })
    }

    /// Append a version snapshot of the current params.
    pub fn record_version(&mut self, output: impl Into<String>, is_video: bool, signature: &str) {
        let now = chrono::Utc::now();
        self.versions.push(WorkflowVersion {
            params: self.parameters.clone(),
            output: output.into(),
            is_video,
            timestamp: now.timestamp_millis() as f64 / 1000.0,
            signature: signature.to_string(),
        });
        self.last_signature = signature.to_string();
    }

    /// Display name: the workflow file stem.
    pub fn label(&self) -> &str {
        Path::new(&self.path)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(&self.path)
    }
}

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Shot
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Shot {
    #[serde(default = "default_shot_name")]
    pub name: String,
    #[serde(default)]
    pub video_path: String,
    #[serde(default)]
    pub video_versions: Vec<String>,
    #[serde(default, with = "version_index")]
    pub current_video_version: Option<usize>,
    #[serde(default)]
    pub still_path: String,
    #[serde(default)]
    pub image_versions: Vec<String>,
    #[serde(default, with = "version_index")]
    pub current_image_version: Option<usize>,
    #[serde(default)]
    pub last_still_signature: String,
    #[serde(default)]
    pub last_video_signature: String,
    #[serde(default)]
    pub workflows: Vec<WorkflowAssignment>,
    #[serde(default)]
    pub params: Vec<Param>,
    #[serde(default = "default_duration")]
    pub duration: u32,
    #[serde(default)]
    pub in_point: f64,
    #[serde(default = "default_out_point")]
    pub out_point: f64,
    #[serde(default = "default_true")]
    pub linked_audio: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub thumbnail_path: String,
}

fn default_shot_name() -> String {
    "Unnamed Shot".to_string()
}

fn default_duration() -> u32 {
    5
}

fn default_out_point() -> f64 {
    1.0
}

impl Default for Shot {
    fn default() -> Self {
        Self::new(default_shot_name())
    }
}

impl Shot {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            video_path: String::new(),
            video_versions: Vec::new(),
            current_video_version: None,
            still_path: String::new(),
            image_versions: Vec::new(),
            current_image_version: None,
            last_still_signature: String::new(),
            last_video_signature: String::new(),
            workflows: Vec::new(),
            params: Vec::new(),
            duration: default_duration(),
            in_point: 0.0,
            out_point: default_out_point(),
            linked_audio: true,
            thumbnail_path: String::new(),
        }
    }

    /// Copy params and workflows into a new shot with no rendered media.
    pub fn derive(&self, name: impl Into<String>) -> Self {
        let mut shot = self.clone();
        shot.name = name.into();
        shot.video_path.clear();
        shot.video_versions.clear();
        shot.current_video_version = None;
        shot.still_path.clear();
        shot.image_versions.clear();
        shot.current_image_version = None;
        shot.last_still_signature.clear();
        shot.last_video_signature.clear();
        shot.thumbnail_path.clear();
        for wf in &mut shot.workflows {
            wf.versions.clear();
            wf.last_signature.clear();
        }
        shot
    }

    pub fn param(&self, name: &str) -> Option<&Param> {
        self.params.iter().find(|p| p.name.eq_ignore_ascii_case(name))
    }

    pub fn param_mut(&mut self, name: &str) -> Option<&mut Param> {
        self.params
            .iter_mut()
            .find(|p| p.name.eq_ignore_ascii_case(name))
    }

    pub fn current_path(&self, kind: MediaKind) -> Option<&str> {
        let path = match kind {
            MediaKind::Image => &self.still_path,
            MediaKind::Video => &self.video_path,
        };
        (!path.is_empty()).then_some(path.as_str())
    }

    pub fn versions(&self, kind: MediaKind) -> &[String] {
        match kind {
            MediaKind::Image => &self.image_versions,
            MediaKind::Video => &self.video_versions,
        }
    }

    pub fn last_signature(&self, kind: MediaKind) -> &str {
        match kind {
            MediaKind::Image => &self.last_still_signature,
            MediaKind::Video => &self.last_video_signature,
        }
    }

    /// Append a rendered output and make it the current version.
    pub fn record_output(&mut self, kind: MediaKind, path: impl Into<String>, signature: &str) {
        let path = path.into();
        let (current, versions, index, last) = self.slots_mut(kind);
        versions.push(path.clone());
        *index = Some(versions.len() - 1);
        *current = path;
        *last = signature.to_string();
    }

    pub fn set_last_signature(&mut self, kind: MediaKind, signature: &str) {
        let (_, _, _, last) = self.slots_mut(kind);
        *last = signature.to_string();
    }

    /// Switch the current media to an earlier version.
    pub fn select_version(&mut self, kind: MediaKind, index: usize) -> Result<(), CoreError> {
        let (current, versions, current_index, _) = self.slots_mut(kind);
        let path = versions.get(index).cloned().ok_or(CoreError::NotFound {
            entity: match kind {
                MediaKind::Image => "image version",
                MediaKind::Video => "video version",
            },
            index,
        })?;
        *current = path;
        *current_index = Some(index);
        Ok(())
    }

    pub fn media_status(&self, kind: MediaKind, current_signature: &str) -> MediaStatus {
        match self.current_path(kind) {
            Some(path) if Path::new(path).exists() => {
                if self.last_signature(kind) == current_signature {
                    MediaStatus::Fresh
                } else {
                    MediaStatus::Stale
                }
            }
            _ => MediaStatus::Missing,
        }
    }

    /// Latest existing output, preferring video.
    pub fn latest_output(&self) -> Option<(MediaKind, &str)> {
        [MediaKind::Video, MediaKind::Image]
            .into_iter()
            .find_map(|kind| {
                self.current_path(kind)
                    .filter(|p| Path::new(p).exists())
                    .map(|p| (kind, p))
            })
    }

    fn slots_mut(
        &mut self,
        kind: MediaKind,
    ) -> (&mut String, &mut Vec<String>, &mut Option<usize>, &mut String) {
        match kind {
            MediaKind::Image => (
                &mut self.still_path,
                &mut self.image_versions,
                &mut self.current_image_version,
                &mut self.last_still_signature,
            ),
            MediaKind::Video => (
                &mut self.video_path,
                &mut self.video_versions,
                &mut self.current_video_version,
                &mut self.last_video_signature,
            ),
        }
    }
}

/// `Option<usize>` stored as a signed index where `-1` means unset.
mod version_index {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<usize>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(i) => s.serialize_i64(*i as i64),
            None => s.serialize_i64(-1),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<usize>, D::Error> {
        let raw = Option::<i64>::deserialize(d)?;
        Ok(raw.and_then(|i| usize::try_from(i).ok()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::param::{ParamKind, AWAITING_PREVIOUS_IMAGE};
    use assert_matches::assert_matches;
    use serde_json::json;

    fn graph() -> WorkflowGraph {
        WorkflowGraph::from_value(json!({
            "1": {
                "class_type": "LoadImage",
                "inputs": { "image": "in.png" },
                "_meta": { "title": "Load Image" }
            },
            "2": {
                "class_type": "KSampler",
                "inputs": { "seed": 1, "steps": 20, "image": ["1", 0] }
            }
        }))
        .unwrap()
    }

    #[test]
    fn legacy_shot_round_trips_indices() {
        let raw = json!({
            "name": "Shot 1",
            "videoVersions": [],
            "currentVideoVersion": -1,
            "imageVersions": ["a.png", "b.png"],
            "currentImageVersion": 1,
            "workflows": [{ "path": "wf.json", "parameters": { "params": [] } }],
            "params": []
        });
        let shot: Shot = serde_json::from_value(raw).unwrap();
        assert_eq!(shot.current_video_version, None);
        assert_eq!(shot.current_image_version, Some(1));
        assert_eq!(shot.duration, 5);
        assert!(shot.linked_audio);
        assert!(shot.workflows[0].enabled);

        let out = serde_json::to_value(&shot).unwrap();
        assert_eq!(out["currentVideoVersion"], json!(-1));
        assert_eq!(out["currentImageVersion"], json!(1));
    }

    #[test]
    fn record_and_select_versions() {
        let mut shot = Shot::new("Shot 1");
        shot.record_output(MediaKind::Image, "a.png", "sig-a");
        shot.record_output(MediaKind::Image, "b.png", "sig-b");
        assert_eq!(shot.current_path(MediaKind::Image), Some("b.png"));
        assert_eq!(shot.current_image_version, Some(1));
        assert_eq!(shot.last_still_signature, "sig-b");

        shot.select_version(MediaKind::Image, 0).unwrap();
        assert_eq!(shot.still_path, "a.png");
        assert_matches!(
            shot.select_version(MediaKind::Video, 0),
            Err(CoreError::NotFound { index: 0, .. })
        );
    }

    #[test]
    fn derive_resets_outputs() {
        let mut shot = Shot::new("Shot 1");
        shot.params.push(Param::new("seed", ParamKind::Int, json!(3)));
        let mut wf = WorkflowAssignment::new("wf.json", false);
        wf.record_version("x.png", false, "sig");
        shot.workflows.push(wf);
        shot.record_output(MediaKind::Video, "v.mp4", "sig");

        let copy = shot.derive("Shot 2");
        assert_eq!(copy.name, "Shot 2");
        assert_eq!(copy.params, shot.params);
        assert!(copy.video_path.is_empty());
        assert!(copy.video_versions.is_empty());
        assert!(copy.workflows[0].versions.is_empty());
        assert!(copy.workflows[0].last_signature.is_empty());
    }

    #[test]
    fn media_status_tracks_file_and_signature() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("still.png");
        std::fs::write(&file, b"png").unwrap();

        let mut shot = Shot::new("Shot 1");
        assert_eq!(shot.media_status(MediaKind::Image, "s"), MediaStatus::Missing);

        shot.record_output(MediaKind::Image, file.display().to_string(), "s1");
        assert_eq!(shot.media_status(MediaKind::Image, "s1"), MediaStatus::Fresh);
        assert_eq!(shot.media_status(MediaKind::Image, "s2"), MediaStatus::Stale);

        std::fs::remove_file(&file).unwrap();
        assert_eq!(shot.media_status(MediaKind::Image, "s1"), MediaStatus::Missing);
    }

    #[test]
    fn from_graph_merges_defaults() {
        let mut saved_seed = Param::new("seed", ParamKind::Int, json!(99)).with_nodes(["2"]);
        saved_seed.visible = true;
        let mut saved_image = Param::new("image", ParamKind::String, json!("x")).with_nodes(["1"]);
        saved_image.set_previous_result(AssetKind::Image).unwrap();
        let defaults = WorkflowParams {
            params: vec![
                saved_seed,
                saved_image,
                Param::new("steps", ParamKind::Int, json!(5)).with_nodes(["9"]),
            ],
            run_count: Some(3),
        };

        let wf = WorkflowAssignment::from_graph("wf.json", &graph(), true, Some(&defaults), |_, _| false);
        let seed = wf.parameters.find("seed").unwrap();
        assert_eq!(seed.value, json!(99));
        let image = wf.parameters.find("image").unwrap();
        assert!(image.use_prev_result_image);
        assert_eq!(image.value, json!(AWAITING_PREVIOUS_IMAGE));
        // Node IDs differ, so the saved value does not apply.
        assert_eq!(wf.parameters.find("steps").unwrap().value, json!(20));
        assert_eq!(wf.parameters.runs(), 3);
        assert!(wf.is_video);
    }

    #[test]
    fn reusable_output_requires_same_signature_and_file() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.png");
        std::fs::write(&out, b"png").unwrap();

        let mut wf = WorkflowAssignment::from_graph("wf.json", &graph(), false, None, |_, _| true);
        wf.record_version(out.display().to_string(), false, "sig");
        assert_eq!(wf.versions[0].signature, "sig");
        assert!(wf.reusable_output("sig").is_some());
        assert!(wf.reusable_output("other").is_none());
        assert!(wf.reusable_output("").is_none());

        wf.is_video = true;
        assert!(wf.reusable_output("sig").is_none());

        wf.is_video = false;
        std::fs::remove_file(&out).unwrap();
        assert!(wf.reusable_output("sig").is_none());
    }

    #[test]
    fn versions_without_signature_are_not_reused() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.png");
        std::fs::write(&out, b"png").unwrap();

        let raw = json!({
            "path": "wf.json",
            "versions": [{"params": {"params": []}, "output": out.display().to_string()}]
        });
        let wf: WorkflowAssignment = serde_json::from_value(raw).unwrap();
        assert!(wf.versions[0].signature.is_empty());
        assert!(wf.reusable_output("sig").is_none());
    }

    #[test]
    fn latest_output_prefers_video() {
        let dir = tempfile::tempdir().unwrap();
        let still = dir.path().join("s.png");
        let clip = dir.path().join("c.mp4");
        std::fs::write(&still, b"s").unwrap();
        std::fs::write(&clip, b"c").unwrap();

        let mut shot = Shot::new("Shot 1");
        shot.record_output(MediaKind::Image, still.display().to_string(), "");
        assert_eq!(shot.latest_output().map(|(k, _)| k), Some(MediaKind::Image));
        shot.record_output(MediaKind::Video, clip.display().to_string(), "");
        assert_eq!(shot.latest_output().map(|(k, _)| k), Some(MediaKind::Video));
    }

    #[test]
    fn label_is_file_stem() {
        assert_eq!(WorkflowAssignment::new("/w/flux_dev.json", false).label(), "flux_dev");
    }
}
