//! Project documents: the ordered shot list and its persistence.
//!
//! A project is stored as pretty-printed JSON `{"shots": [...]}`. Unknown
//! keys are ignored and missing keys take their defaults, so project files
//! written by older versions keep loading.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CoreError;
use crate::naming;
use crate::param::{Param, ParamKind};
use crate::shot::{MediaKind, Shot, WorkflowAssignment};
use crate::signature::workflow_signature;
use crate::types::{ShotIndex, WorkflowIndex};

/// Where a param lives when addressed across shots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamTarget {
    /// A shot-level param, by name.
    Shot { name: String },
    /// A param of every workflow with the given path.
    Workflow { path: String, name: String },
}

/// A single place in the project that references a media file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MediaLocation {
    ShotStill { shot: ShotIndex },
    ShotVideo { shot: ShotIndex },
    ImageVersion { shot: ShotIndex, index: usize },
    VideoVersion { shot: ShotIndex, index: usize },
    WorkflowOutput { shot: ShotIndex, workflow: WorkflowIndex, version: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MediaRef {
    pub location: MediaLocation,
    pub path: String,
    pub exists: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Project {
    #[serde(default)]
    pub shots: Vec<Shot>,
}

impl Project {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(path: &Path) -> Result<Self, CoreError> {
        let raw = std::fs::read_to_string(path).map_err(|e| CoreError::io(path, e))?;
        let project: Self = serde_json::from_str(&raw).map_err(|e| CoreError::json(path, e))?;
        tracing::info!(path = %path.display(), shots = project.shots.len(), "Project loaded");
        Ok(project)
    }

    /// Write the project atomically: a sibling temp file is renamed over `path`.
    pub fn save(&self, path: &Path) -> Result<(), CoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| CoreError::io(parent, e))?;
        }
        let body = serde_json::to_string_pretty(self).map_err(|e| CoreError::json(path, e))?;
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        std::fs::write(&tmp, body).map_err(|e| CoreError::io(&tmp, e))?;
        std::fs::rename(&tmp, path).map_err(|e| CoreError::io(path, e))?;
        tracing::info!(path = %path.display(), shots = self.shots.len(), "Project saved");
        Ok(())
    }

    pub fn shot(&self, index: ShotIndex) -> Result<&Shot, CoreError> {
        self.shots.get(index).ok_or(CoreError::NotFound {
            entity: "shot",
            index,
        })
    }

    pub fn shot_mut(&mut self, index: ShotIndex) -> Result<&mut Shot, CoreError> {
        self.shots.get_mut(index).ok_or(CoreError::NotFound {
            entity: "shot",
            index,
        })
    }

    pub fn workflow_mut(
        &mut self,
        shot: ShotIndex,
        workflow: WorkflowIndex,
    ) -> Result<&mut WorkflowAssignment, CoreError> {
        self.shot_mut(shot)?
            .workflows
            .get_mut(workflow)
            .ok_or(CoreError::NotFound {
                entity: "workflow",
                index: workflow,
            })
    }

    // -----------------------------------------------------------------------
    // Shot list editing
    // -----------------------------------------------------------------------

    /// Append a shot named `Shot N` and return its index.
    ///
    /// With a reference shot the new one copies its params and workflows;
    /// otherwise it starts with `default_params`.
    pub fn add_shot(
        &mut self,
        reference: Option<ShotIndex>,
        default_params: &[Param],
    ) -> Result<ShotIndex, CoreError> {
        let name = naming::shot_name(self.shots.len());
        let shot = match reference {
            Some(i) => self.shot(i)?.derive(name),
            None => {
                let mut shot = Shot::new(name);
                shot.params = default_params.to_vec();
                shot
            }
        };
        self.shots.push(shot);
        Ok(self.shots.len() - 1)
    }

    pub fn remove_shot(&mut self, index: ShotIndex) -> Result<Shot, CoreError> {
        self.shot(index)?;
        Ok(self.shots.remove(index))
    }

    /// Move a shot so it ends up at position `to`.
    pub fn move_shot(&mut self, from: ShotIndex, to: ShotIndex) -> Result<(), CoreError> {
        self.shot(from)?;
        if to >= self.shots.len() {
            return Err(CoreError::NotFound {
                entity: "shot",
                index: to,
            });
        }
        let shot = self.shots.remove(from);
        self.shots.insert(to, shot);
        Ok(())
    }

    /// Insert a full copy (including rendered versions) right after `index`.
    pub fn duplicate_shot(&mut self, index: ShotIndex) -> Result<ShotIndex, CoreError> {
        let mut copy = self.shot(index)?.clone();
        copy.name = format!("{} Copy", copy.name);
        self.shots.insert(index + 1, copy);
        Ok(index + 1)
    }

    /// Create one shot per non-empty line.
    ///
    /// Without a target each shot is named after its line. With a target
    /// the shot gets a default name and the targeted param takes the line;
    /// a missing shot param is added as a string param.
    pub fn import_lines<'a, I>(
        &mut self,
        lines: I,
        target: Option<&ParamTarget>,
        reference: Option<ShotIndex>,
        default_params: &[Param],
    ) -> Result<Vec<ShotIndex>, CoreError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut created = Vec::new();
        for line in lines.into_iter().map(str::trim).filter(|l| !l.is_empty()) {
            let index = self.add_shot(reference, default_params)?;
            let shot = &mut self.shots[index];
            match target {
                None => shot.name = line.to_string(),
                Some(target) => set_target(shot, target, Value::from(line)),
            }
            created.push(index);
        }
        tracing::info!(count = created.len(), "Imported shots from lines");
        Ok(created)
    }

    /// Copy `value` into the same-named param across shots.
    ///
    /// `indices` limits the update to the given shots; `None` means all.
    /// Returns the number of params changed.
    pub fn set_param_in_shots(
        &mut self,
        target: &ParamTarget,
        value: &Value,
        indices: Option<&[ShotIndex]>,
    ) -> usize {
        let selected: Vec<ShotIndex> = match indices {
            Some(list) => list.iter().copied().filter(|&i| i < self.shots.len()).collect(),
            None => (0..self.shots.len()).collect(),
        };

        let mut changed = 0;
        for i in selected {
            let shot = &mut self.shots[i];
            match target {
                ParamTarget::Shot { name } => {
                    for p in shot.params.iter_mut().filter(|p| &p.name == name) {
                        p.value = value.clone();
                        changed += 1;
                    }
                }
                ParamTarget::Workflow { path, name } => {
                    let mut matched = false;
                    for wf in shot.workflows.iter_mut().filter(|wf| &wf.path == path) {
                        matched = true;
                        for p in wf.parameters.params.iter_mut().filter(|p| &p.name == name) {
                            p.value = value.clone();
                            changed += 1;
                        }
                    }
                    if !matched {
                        tracing::warn!(shot = %shot.name, workflow = %path, "No matching workflow in shot");
                    }
                }
            }
        }
        changed
    }

    // -----------------------------------------------------------------------
    // Workflow editing
    // -----------------------------------------------------------------------

    pub fn add_workflow(
        &mut self,
        shot: ShotIndex,
        assignment: WorkflowAssignment,
    ) -> Result<WorkflowIndex, CoreError> {
        let shot = self.shot_mut(shot)?;
        shot.workflows.push(assignment);
        Ok(shot.workflows.len() - 1)
    }

    pub fn remove_workflow(
        &mut self,
        shot: ShotIndex,
        workflow: WorkflowIndex,
    ) -> Result<WorkflowAssignment, CoreError> {
        self.workflow_mut(shot, workflow)?;
        Ok(self.shots[shot].workflows.remove(workflow))
    }

    /// Flip the enabled flag and return the new state.
    pub fn toggle_workflow(
        &mut self,
        shot: ShotIndex,
        workflow: WorkflowIndex,
    ) -> Result<bool, CoreError> {
        let wf = self.workflow_mut(shot, workflow)?;
        wf.enabled = !wf.enabled;
        Ok(wf.enabled)
    }

    /// Output of another shot whose same-path workflow was last rendered
    /// with this workflow's current signature, as
    /// `(path, render signature of that shot)`.
    pub fn find_shared_output(
        &self,
        shot: ShotIndex,
        workflow: WorkflowIndex,
    ) -> Option<(String, String)> {
        let this = self.shots.get(shot)?;
        let wf = this.workflows.get(workflow)?;
        let kind = wf.media_kind();
        let signature = workflow_signature(this, workflow)?;

        self.shots
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != shot)
            .find_map(|(_, other)| {
                let path = other.current_path(kind).filter(|p| Path::new(p).exists())?;
                other
                    .workflows
                    .iter()
                    .enumerate()
                    .filter(|(_, owf)| owf.path == wf.path && owf.last_signature == signature)
                    .any(|(oi, _)| workflow_signature(other, oi).as_deref() == Some(signature.as_str()))
                    .then(|| (path.to_string(), other.last_signature(kind).to_string()))
            })
    }

    // -----------------------------------------------------------------------
    // Media references
    // -----------------------------------------------------------------------

    /// Every media path referenced by the project.
    pub fn media_refs(&self) -> Vec<MediaRef> {
        let mut refs = Vec::new();
        let mut push = |location, path: &str| {
            if !path.is_empty() {
                refs.push(MediaRef {
                    location,
                    path: path.to_string(),
                    exists: Path::new(path).exists(),
                });
            }
        };

        for (si, shot) in self.shots.iter().enumerate() {
            push(MediaLocation::ShotStill { shot: si }, &shot.still_path);
            push(MediaLocation::ShotVideo { shot: si }, &shot.video_path);
            for (i, p) in shot.image_versions.iter().enumerate() {
                push(MediaLocation::ImageVersion { shot: si, index: i }, p);
            }
            for (i, p) in shot.video_versions.iter().enumerate() {
                push(MediaLocation::VideoVersion { shot: si, index: i }, p);
            }
            for (wi, wf) in shot.workflows.iter().enumerate() {
                for (vi, v) in wf.versions.iter().enumerate() {
                    push(
                        MediaLocation::WorkflowOutput {
                            shot: si,
                            workflow: wi,
                            version: vi,
                        },
                        &v.output,
                    );
                }
            }
        }
        refs
    }

    /// Point a single media reference at `new_path`.
    pub fn relink(&mut self, location: MediaLocation, new_path: &str) -> Result<(), CoreError> {
        let slot = match location {
            MediaLocation::ShotStill { shot } => &mut self.shot_mut(shot)?.still_path,
            MediaLocation::ShotVideo { shot } => &mut self.shot_mut(shot)?.video_path,
            MediaLocation::ImageVersion { shot, index } => self
                .shot_mut(shot)?
                .image_versions
                .get_mut(index)
                .ok_or(CoreError::NotFound {
                    entity: "image version",
                    index,
                })?,
            MediaLocation::VideoVersion { shot, index } => self
                .shot_mut(shot)?
                .video_versions
                .get_mut(index)
                .ok_or(CoreError::NotFound {
                    entity: "video version",
                    index,
                })?,
            MediaLocation::WorkflowOutput {
                shot,
                workflow,
                version,
            } => {
                &mut self
                    .workflow_mut(shot, workflow)?
                    .versions
                    .get_mut(version)
                    .ok_or(CoreError::NotFound {
                        entity: "workflow version",
                        index: version,
                    })?
                    .output
            }
        };
        *slot = new_path.to_string();
        Ok(())
    }

    /// Shots whose current media of `kind` exists, in project order.
    pub fn existing_media(&self, kind: MediaKind) -> Vec<(ShotIndex, PathBuf)> {
        self.shots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| {
                s.current_path(kind)
                    .map(PathBuf::from)
                    .filter(|p| p.exists())
                    .map(|p| (i, p))
            })
            .collect()
    }
}

/// Directory that receives rendered media for a project.
///
/// The project file's directory when the project has been saved, else
/// `fallback`. Always absolute, so recorded media paths stay valid
/// whatever directory later reads them.
pub fn project_folder(project_path: Option<&Path>, fallback: &Path) -> PathBuf {
    project_path
        .map(naming::absolute_path)
        .and_then(|p| p.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| naming::absolute_path(fallback))
}

fn set_target(shot: &mut Shot, target: &ParamTarget, value: Value) {
    match target {
        ParamTarget::Shot { name } => match shot.param_mut(name) {
            Some(p) => p.value = value,
            None => shot.params.push(Param::new(name.clone(), ParamKind::String, value)),
        },
        ParamTarget::Workflow { path, name } => {
            for wf in shot.workflows.iter_mut().filter(|wf| &wf.path == path) {
                if let Some(p) = wf.parameters.find_mut(name) {
                    p.value = value.clone();
                }
            }
        }
    }
}
