//! Timeline edits backed by FFmpeg: export, merge and extend.

use std::path::{Path, PathBuf};

use rand::Rng;
use serde_json::Value;

use shotdesigner_core::ffmpeg::{self, TranscodeInput, VideoCodec};
use shotdesigner_core::naming;
use shotdesigner_core::project::Project;
use shotdesigner_core::shot::MediaKind;
use shotdesigner_core::signature::render_signature;
use shotdesigner_core::types::ShotIndex;

use crate::error::PipelineError;

#[derive(Debug, Clone)]
pub struct ExportOptions {
    /// Output file when merging, output directory otherwise.
    pub dest: PathBuf,
    pub codec: VideoCodec,
    pub merge: bool,
    /// Extra FFmpeg arguments placed before the output path.
    pub custom_args: Vec<String>,
}

/// Export the current video of every shot whose file exists.
///
/// Returns the written files in shot order.
pub async fn export(project: &Project, options: &ExportOptions) -> Result<Vec<PathBuf>, PipelineError> {
    let clips: Vec<PathBuf> = project
        .existing_media(MediaKind::Video)
        .into_iter()
        .map(|(_, path)| path)
        .collect();
    if clips.is_empty() {
        return Err(PipelineError::NothingToExport);
    }
    tracing::info!(
        clips = clips.len(),
        merge = options.merge,
        codec = options.codec.encoder(),
        dest = %options.dest.display(),
        "Exporting",
    );

    if options.merge {
        if let Some(parent) = options.dest.parent().filter(|p| !p.as_os_str().is_empty()) {
            create_dir(parent).await?;
        }
        let list = concat_list_path();
        ffmpeg::write_concat_list(&clips, &list).await?;
        let result = ffmpeg::transcode(
            TranscodeInput::ConcatList(&list),
            &options.dest,
            options.codec,
            &options.custom_args,
        )
        .await;
        remove_quietly(&list).await;
        result?;
        return Ok(vec![options.dest.clone()]);
    }

    create_dir(&options.dest).await?;
    let mut written = Vec::with_capacity(clips.len());
    for (position, clip) in clips.iter().enumerate() {
        let out = options.dest.join(naming::export_clip_name(position));
        ffmpeg::transcode(
            TranscodeInput::File(clip),
            &out,
            options.codec,
            &options.custom_args,
        )
        .await?;
        tracing::debug!(clip = %clip.display(), out = %out.display(), "Clip exported");
        written.push(out);
    }
    Ok(written)
}

/// Concatenate the videos of `indices` into a new shot.
///
/// The new shot copies the last selected shot without workflows, holds
/// the merged file as its only video version and is inserted right after
/// the last selected shot. Returns its index.
pub async fn merge_shots(
    project: &mut Project,
    indices: &[ShotIndex],
    folder: &Path,
) -> Result<ShotIndex, PipelineError> {
    let Some(&last) = indices.last() else {
        return Err(PipelineError::Validation(
            "Select at least two shots to merge".to_string(),
        ));
    };
    if indices.len() < 2 {
        return Err(PipelineError::Validation(
            "Select at least two shots to merge".to_string(),
        ));
    }

    let mut videos = Vec::with_capacity(indices.len());
    for &index in indices {
        let shot = project.shot(index)?;
        match shot.current_path(MediaKind::Video).map(PathBuf::from) {
            Some(path) if path.exists() => videos.push(path),
            _ => {
                return Err(PipelineError::Validation(format!(
                    "Shot '{}' has no valid video",
                    shot.name
                )));
            }
        }
    }

    create_dir(folder).await?;
    let tag = rand::rng().random_range(100_000..=999_999);
    let output = folder.join(naming::merged_clip_name(tag));
    let list = concat_list_path();
    ffmpeg::write_concat_list(&videos, &list).await?;
    let result = ffmpeg::concat_copy(&list, &output).await;
    remove_quietly(&list).await;
    result?;

    let mut merged = project.shot(last)?.clone();
    let output = output.display().to_string();
    merged.name = format!("{} Merged", merged.name);
    merged.workflows.clear();
    merged.video_path = output.clone();
    merged.video_versions = vec![output.clone()];
    merged.current_video_version = Some(0);
    merged.last_video_signature = render_signature(&merged, MediaKind::Video);

    let insert_at = last + 1;
    project.shots.insert(insert_at, merged);
    tracing::info!(shots = indices.len(), output = %output, index = insert_at, "Shots merged");
    Ok(insert_at)
}

/// Continue a shot from its last output.
///
/// The latest video version (or still, for an image workflow) of the
/// shot's last workflow is reduced to a single frame, and a derived
/// `<name> - Extended` shot is appended whose last workflow has
/// `param_name` set to that frame. Returns the new shot's index.
pub async fn extend_shot(
    project: &mut Project,
    index: ShotIndex,
    param_name: &str,
    frame_dir: &Path,
) -> Result<ShotIndex, PipelineError> {
    let shot = project.shot(index)?;
    let Some(last_wf) = shot.workflows.last() else {
        return Err(PipelineError::Validation(format!(
            "Shot '{}' has no workflows to extend",
            shot.name
        )));
    };
    let kind = last_wf.media_kind();
    let Some(last_output) = shot.versions(kind).last().map(PathBuf::from) else {
        return Err(PipelineError::Validation(format!(
            "Shot '{}' has no {} output to extend",
            shot.name,
            naming::media_subfolder(kind)
        )));
    };
    if !last_wf.parameters.params.iter().any(|p| p.name == param_name) {
        return Err(PipelineError::Validation(format!(
            "Last workflow of shot '{}' has no param '{param_name}'",
            shot.name
        )));
    }

    let frame = match kind {
        MediaKind::Video => {
            create_dir(frame_dir).await?;
            let stamp = chrono::Utc::now().timestamp();
            let frame = frame_dir.join(format!(
                "{}_last_frame_{stamp}.png",
                naming::file_stem(&shot.name)
            ));
            ffmpeg::extract_last_frame(&last_output, &frame).await?;
            frame
        }
        MediaKind::Image => {
            if !last_output.exists() {
                return Err(PipelineError::Validation(format!(
                    "Still {} no longer exists",
                    last_output.display()
                )));
            }
            last_output
        }
    };

    let mut extended = shot.derive(format!("{} - Extended", shot.name));
    if let Some(param) = extended
        .workflows
        .last_mut()
        .and_then(|wf| wf.parameters.find_mut(param_name))
    {
        param.clear_dynamic_override();
        param.value = Value::String(frame.display().to_string());
    }

    project.shots.push(extended);
    let new_index = project.shots.len() - 1;
    tracing::info!(from = index, index = new_index, frame = %frame.display(), "Shot extended");
    Ok(new_index)
}

fn concat_list_path() -> PathBuf {
    std::env::temp_dir().join(format!("shotdesigner_concat_{}.txt", uuid::Uuid::new_v4()))
}

async fn create_dir(dir: &Path) -> Result<(), PipelineError> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| PipelineError::io(dir, e))
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        tracing::debug!(path = %path.display(), error = %e, "Could not remove temp file");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;
    use shotdesigner_core::param::{AssetKind, Param, ParamKind};
    use shotdesigner_core::shot::{Shot, WorkflowAssignment};

    fn options(dest: &Path) -> ExportOptions {
        ExportOptions {
            dest: dest.to_path_buf(),
            codec: VideoCodec::Libx264,
            merge: false,
            custom_args: Vec::new(),
        }
    }

    #[tokio::test]
    async fn export_without_videos_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut project = Project::new();
        let mut shot = Shot::new("Shot 1");
        shot.video_path = dir.path().join("gone.mp4").display().to_string();
        project.shots.push(shot);

        let result = export(&project, &options(&dir.path().join("out"))).await;
        assert_matches!(result, Err(PipelineError::NothingToExport));
    }

    #[tokio::test]
    async fn merge_needs_two_shots() {
        let dir = tempfile::tempdir().unwrap();
        let mut project = Project::new();
        project.shots.push(Shot::new("Shot 1"));
        let result = merge_shots(&mut project, &[0], dir.path()).await;
        assert_matches!(result, Err(PipelineError::Validation(_)));
        let result = merge_shots(&mut project, &[], dir.path()).await;
        assert_matches!(result, Err(PipelineError::Validation(_)));
    }

    #[tokio::test]
    async fn merge_rejects_shot_without_video() {
        let dir = tempfile::tempdir().unwrap();
        let clip = dir.path().join("a.mp4");
        std::fs::write(&clip, b"x").unwrap();

        let mut project = Project::new();
        let mut first = Shot::new("Shot 1");
        first.video_path = clip.display().to_string();
        project.shots.push(first);
        project.shots.push(Shot::new("Shot 2"));

        let result = merge_shots(&mut project, &[0, 1], dir.path()).await;
        assert_matches!(result, Err(PipelineError::Validation(msg)) if msg.contains("Shot 2"));
        assert_eq!(project.shots.len(), 2);
    }

    fn image_shot(still: &Path) -> Shot {
        let mut shot = Shot::new("Shot 1");
        let mut wf = WorkflowAssignment::new("img.json", false);
        let mut image = Param::new("image", ParamKind::String, json!(""));
        image.set_previous_result(AssetKind::Image).unwrap();
        wf.parameters.params.push(image);
        shot.workflows.push(wf);
        shot.record_output(MediaKind::Image, still.display().to_string(), "sig");
        shot
    }

    #[tokio::test]
    async fn extend_from_still_sets_param() {
        let dir = tempfile::tempdir().unwrap();
        let still = dir.path().join("still.png");
        std::fs::write(&still, b"x").unwrap();
        let mut project = Project::new();
        project.shots.push(image_shot(&still));

        let index = extend_shot(&mut project, 0, "image", dir.path()).await.unwrap();
        assert_eq!(index, 1);

        let extended = &project.shots[1];
        assert_eq!(extended.name, "Shot 1 - Extended");
        assert!(extended.still_path.is_empty());
        assert!(extended.image_versions.is_empty());
        let param = extended.workflows[0].parameters.find("image").unwrap();
        assert_eq!(param.value, json!(still.display().to_string()));
        assert!(!param.is_dynamic());
    }

    #[tokio::test]
    async fn extend_requires_output_and_param() {
        let dir = tempfile::tempdir().unwrap();
        let still = dir.path().join("still.png");
        std::fs::write(&still, b"x").unwrap();
        let mut project = Project::new();
        project.shots.push(image_shot(&still));
        project.shots.push(Shot::new("Empty"));

        assert_matches!(
            extend_shot(&mut project, 1, "image", dir.path()).await,
            Err(PipelineError::Validation(_))
        );
        assert_matches!(
            extend_shot(&mut project, 0, "nope", dir.path()).await,
            Err(PipelineError::Validation(msg)) if msg.contains("nope")
        );
        assert_eq!(project.shots.len(), 2);
    }
}
