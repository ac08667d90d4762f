//! Media relinking: find moved media files and repoint project references.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Serialize;
use walkdir::WalkDir;

use crate::error::CoreError;
use crate::project::{MediaLocation, Project};

/// Outcome of [`relink_missing`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct RelinkReport {
    /// References pointed at a newly found file.
    pub relinked: Vec<(MediaLocation, PathBuf)>,
    /// Missing references with no candidate file.
    pub not_found: Vec<MediaLocation>,
    /// Missing references with more than one candidate, left untouched.
    pub ambiguous: Vec<(MediaLocation, Vec<PathBuf>)>,
}

/// Files under `folder` whose name contains the base name of `file_name`,
/// compared case-insensitively. Results are sorted.
pub fn find_candidates(folder: &Path, file_name: &str) -> Vec<PathBuf> {
    let base = Path::new(file_name)
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    if base.is_empty() {
        return Vec::new();
    }

    let mut found: Vec<PathBuf> = WalkDir::new(folder)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.file_name().to_string_lossy().to_lowercase().contains(&base))
        .map(|e| e.into_path())
        .collect();
    found.sort();
    found
}

/// Relink every missing media reference that has exactly one candidate
/// under `folder`.
pub fn relink_missing(project: &mut Project, folder: &Path) -> Result<RelinkReport, CoreError> {
    if !folder.is_dir() {
        return Err(CoreError::Validation(format!(
            "'{}' is not a directory",
            folder.display()
        )));
    }

    let mut report = RelinkReport::default();
    let mut cache: HashMap<String, Vec<PathBuf>> = HashMap::new();

    for media in project.media_refs().into_iter().filter(|r| !r.exists) {
        let candidates = cache
            .entry(media.path.clone())
            .or_insert_with(|| find_candidates(folder, &media.path))
            .clone();

        match candidates.as_slice() {
            [] => report.not_found.push(media.location),
            [only] => {
                project.relink(media.location, &only.to_string_lossy())?;
                tracing::info!(old = %media.path, new = %only.display(), "Relinked media");
                report.relinked.push((media.location, only.clone()));
            }
            _ => report.ambiguous.push((media.location, candidates)),
        }
    }

    Ok(report)
}
