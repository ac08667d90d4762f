use std::path::PathBuf;

use shotdesigner_comfyui::api::ComfyUIApiError;
use shotdesigner_core::error::CoreError;
use shotdesigner_core::ffmpeg::FfmpegError;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Ffmpeg(#[from] FfmpegError),

    #[error(transparent)]
    Api(ComfyUIApiError),

    #[error("Prompt {prompt_id} failed: {error}")]
    ExecutionFailed { prompt_id: String, error: String },

    #[error("Prompt {0} finished without an image or video output")]
    NoOutput(String),

    #[error("Param '{0}' needs a previous result but the shot has none")]
    MissingPreviousResult(String),

    #[error("Timed out waiting for previous result {}", .0.display())]
    PreviousResultTimeout(PathBuf),

    #[error("No existing videos to export")]
    NothingToExport,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Render cancelled")]
    Cancelled,
}

impl PipelineError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PipelineError::Io {
            path: path.into(),
            source,
        }
    }
}

impl From<ComfyUIApiError> for PipelineError {
    fn from(err: ComfyUIApiError) -> Self {
        match err {
            ComfyUIApiError::Cancelled => PipelineError::Cancelled,
            other => PipelineError::Api(other),
        }
    }
}
