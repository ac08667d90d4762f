//! FFmpeg/FFprobe command wrappers.
//!
//! All media assembly (frame sequences, merges, exports) and last-frame
//! extraction shells out to the `ffmpeg` and `ffprobe` binaries on `PATH`.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::naming::absolute_path;

const FFMPEG: &str = "ffmpeg";
const FFPROBE: &str = "ffprobe";

/// Error type for FFmpeg/FFprobe operations.
#[derive(Debug, thiserror::Error)]
pub enum FfmpegError {
    #[error("ffprobe/ffmpeg binary not found: {0}")]
    NotFound(std::io::Error),

    #[error("ffprobe/ffmpeg execution failed (exit code {exit_code:?}): {stderr}")]
    ExecutionFailed {
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("failed to parse ffprobe output: {0}")]
    ParseError(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("video file not found: {0}")]
    VideoNotFound(String),
}

/// Video codecs offered for export.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    #[default]
    Libx264,
    Libx265,
    Mpeg4,
    Vp9,
}

impl VideoCodec {
    /// Encoder name passed to `-c:v`.
    pub fn encoder(self) -> &'static str {
        match self {
            VideoCodec::Libx264 => "libx264",
            VideoCodec::Libx265 => "libx265",
            VideoCodec::Mpeg4 => "mpeg4",
            VideoCodec::Vp9 => "libvpx-vp9",
        }
    }
}

impl std::str::FromStr for VideoCodec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "libx264" | "h264" => Ok(VideoCodec::Libx264),
            "libx265" | "h265" | "hevc" => Ok(VideoCodec::Libx265),
            "mpeg4" => Ok(VideoCodec::Mpeg4),
            "vp9" | "libvpx-vp9" => Ok(VideoCodec::Vp9),
            other => Err(format!("unsupported codec '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// ffprobe JSON output structures
// ---------------------------------------------------------------------------

/// Top-level ffprobe JSON output (`-print_format json -show_format -show_streams`).
#[derive(Debug, Deserialize)]
pub struct FfprobeOutput {
    #[serde(default)]
    pub streams: Vec<FfprobeStream>,
    pub format: FfprobeFormat,
}

#[derive(Debug, Deserialize)]
pub struct FfprobeStream {
    pub codec_type: Option<String>,
    pub width: Option<i32>,
    pub height: Option<i32>,
    /// e.g. "30/1" or "24000/1001"
    pub r_frame_rate: Option<String>,
    pub duration: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct FfprobeFormat {
    pub duration: Option<String>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Run `ffprobe` on a video file and return the parsed JSON output.
pub async fn probe_video(path: &Path) -> Result<FfprobeOutput, FfmpegError> {
    ensure_exists(path)?;

    let output = tokio::process::Command::new(FFPROBE)
        .args([
            "-v",
            "quiet",
            "-print_format",
            "json",
            "-show_format",
            "-show_streams",
        ])
        .arg(path)
        .output()
        .await
        .map_err(FfmpegError::NotFound)?;

    if !output.status.success() {
        return Err(FfmpegError::ExecutionFailed {
            exit_code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        });
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    serde_json::from_str::<FfprobeOutput>(&stdout)
        .map_err(|e| FfmpegError::ParseError(format!("{e}: {stdout}")))
}

/// Write the last frame of `video` to `output` as an image.
///
/// Seeks one frame before the probed end; videos without a known
/// duration fall back to seeking from the end of the input.
pub async fn extract_last_frame(video: &Path, output: &Path) -> Result<(), FfmpegError> {
    ensure_exists(video)?;
    let probe = probe_video(video).await?;
    let duration = parse_duration(&probe);
    let fps = parse_framerate(&probe);

    let mut args: Vec<OsString> = vec!["-y".into()];
    if duration > 0.0 {
        let frame = if fps > 0.0 { 1.0 / fps } else { 0.1 };
        let at = (duration - frame).max(0.0);
        args.extend(["-ss".into(), format!("{at:.3}").into()]);
    } else {
        args.extend(["-sseof".into(), "-1".into()]);
    }
    args.extend(["-i".into(), video.as_os_str().to_owned()]);
    args.extend(["-update".into(), "1".into(), "-frames:v".into(), "1".into()]);
    args.extend(["-q:v".into(), "2".into(), output.as_os_str().to_owned()]);
    run_ffmpeg(args).await
}

/// Write an FFmpeg concat demuxer list for `paths`.
///
/// FFmpeg resolves relative entries against the list's directory, so
/// every entry is written as an absolute path.
pub async fn write_concat_list(paths: &[PathBuf], list: &Path) -> Result<(), FfmpegError> {
    let entries: Vec<PathBuf> = paths.iter().map(|p| absolute_path(p)).collect();
    tokio::fs::write(list, concat_list_body(&entries)).await?;
    Ok(())
}

/// Concatenate the clips listed in `list` without re-encoding.
pub async fn concat_copy(list: &Path, output: &Path) -> Result<(), FfmpegError> {
    run_ffmpeg(concat_copy_args(list, output)).await
}

/// Encode the frame images listed in `list` into an H.264 video.
pub async fn assemble_frames(list: &Path, output: &Path) -> Result<(), FfmpegError> {
    run_ffmpeg(assemble_args(list, output)).await
}

/// Input of a [`transcode`] call.
#[derive(Debug, Clone, Copy)]
pub enum TranscodeInput<'a> {
    /// A single media file.
    File(&'a Path),
    /// A concat demuxer list.
    ConcatList(&'a Path),
}

/// Re-encode `input` with the given codec and AAC audio.
///
/// `custom_args` are inserted verbatim before the output path.
pub async fn transcode(
    input: TranscodeInput<'_>,
    output: &Path,
    codec: VideoCodec,
    custom_args: &[String],
) -> Result<(), FfmpegError> {
    run_ffmpeg(transcode_args(input, output, codec, custom_args)).await
}

/// Split a user-supplied argument string on whitespace.
pub fn split_custom_args(raw: &str) -> Vec<String> {
    raw.split_whitespace().map(str::to_string).collect()
}

// ---------------------------------------------------------------------------
// Command builders
// ---------------------------------------------------------------------------

fn concat_list_body(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| {
            let escaped = p.to_string_lossy().replace('\'', r"'\''");
            format!("file '{escaped}'\n")
        })
        .collect()
}

fn concat_input(list: &Path) -> Vec<OsString> {
    vec![
        "-y".into(),
        "-f".into(),
        "concat".into(),
        "-safe".into(),
        "0".into(),
        "-i".into(),
        list.as_os_str().to_owned(),
    ]
}

fn concat_copy_args(list: &Path, output: &Path) -> Vec<OsString> {
    let mut args = concat_input(list);
    args.extend(["-c".into(), "copy".into(), output.as_os_str().to_owned()]);
    args
}

fn assemble_args(list: &Path, output: &Path) -> Vec<OsString> {
    let mut args = concat_input(list);
    args.extend([
        "-c:v".into(),
        "libx264".into(),
        "-pix_fmt".into(),
        "yuv420p".into(),
        output.as_os_str().to_owned(),
    ]);
    args
}

fn transcode_args(
    input: TranscodeInput<'_>,
    output: &Path,
    codec: VideoCodec,
    custom_args: &[String],
) -> Vec<OsString> {
    let mut args = match input {
        TranscodeInput::ConcatList(list) => concat_input(list),
        TranscodeInput::File(file) => vec!["-y".into(), "-i".into(), file.as_os_str().to_owned()],
    };
    args.extend([
        "-c:v".into(),
        codec.encoder().into(),
        "-c:a".into(),
        "aac".into(),
    ]);
    args.extend(custom_args.iter().map(OsString::from));
    args.push(output.as_os_str().to_owned());
    args
}

async fn run_ffmpeg(args: Vec<OsString>) -> Result<(), FfmpegError> {
    tracing::debug!(args = ?args, "Running ffmpeg");
    let output = tokio::process::Command::new(FFMPEG)
        .args(&args)
        .output()
        .await
        .map_err(FfmpegError::NotFound)?;

    if !output.status.success() {
        return Err(FfmpegError::ExecutionFailed {
            exit_code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        });
    }
    Ok(())
}

fn ensure_exists(path: &Path) -> Result<(), FfmpegError> {
    if path.exists() {
        Ok(())
    } else {
        Err(FfmpegError::VideoNotFound(path.to_string_lossy().to_string()))
    }
}

// ---------------------------------------------------------------------------
// Parsing helpers
// ---------------------------------------------------------------------------

fn first_video_stream(probe: &FfprobeOutput) -> Option<&FfprobeStream> {
    probe
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
}

/// Parse the video duration in seconds from ffprobe output.
pub fn parse_duration(probe: &FfprobeOutput) -> f64 {
    probe
        .format
        .duration
        .as_deref()
        .and_then(|d| d.parse::<f64>().ok())
        .or_else(|| {
            first_video_stream(probe)
                .and_then(|s| s.duration.as_deref())
                .and_then(|d| d.parse::<f64>().ok())
        })
        .unwrap_or(0.0)
}

/// Parse the video framerate from ffprobe output.
pub fn parse_framerate(probe: &FfprobeOutput) -> f64 {
    first_video_stream(probe)
        .and_then(|s| s.r_frame_rate.as_deref())
        .map(parse_fraction)
        .unwrap_or(0.0)
}

/// Find the first video stream's resolution.
pub fn parse_resolution(probe: &FfprobeOutput) -> (i32, i32) {
    first_video_stream(probe)
        .map(|s| (s.width.unwrap_or(0), s.height.unwrap_or(0)))
        .unwrap_or((0, 0))
}

/// Parse a fraction string like `"30/1"` into a float.
fn parse_fraction(s: &str) -> f64 {
    if let Some((num, den)) = s.split_once('/') {
        let num = num.parse::<f64>().unwrap_or(0.0);
        let den = den.parse::<f64>().unwrap_or(1.0);
        return if den > 0.0 { num / den } else { 0.0 };
    }
    s.parse::<f64>().unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(args: &[OsString]) -> Vec<String> {
        args.iter().map(|a| a.to_string_lossy().to_string()).collect()
    }

    fn probe(format_duration: Option<&str>, stream_duration: Option<&str>, rate: Option<&str>) -> FfprobeOutput {
        FfprobeOutput {
            streams: vec![FfprobeStream {
                codec_type: Some("video".into()),
                width: Some(1280),
                height: Some(720),
                r_frame_rate: rate.map(Into::into),
                duration: stream_duration.map(Into::into),
            }],
            format: FfprobeFormat {
                duration: format_duration.map(Into::into),
            },
        }
    }

    #[test]
    fn test_parse_fraction() {
        assert!((parse_fraction("30/1") - 30.0).abs() < 0.001);
        assert!((parse_fraction("24000/1001") - 23.976).abs() < 0.01);
        assert!((parse_fraction("25") - 25.0).abs() < 0.001);
        assert!((parse_fraction("30/0") - 0.0).abs() < 0.001);
    }

    #[test]
    fn test_parse_duration_prefers_format() {
        assert!((parse_duration(&probe(Some("12.5"), Some("3.0"), None)) - 12.5).abs() < 0.001);
        assert!((parse_duration(&probe(None, Some("3.0"), None)) - 3.0).abs() < 0.001);
        assert_eq!(parse_duration(&probe(None, None, None)), 0.0);
    }

    #[test]
    fn test_parse_stream_fields() {
        let p = probe(None, None, Some("24/1"));
        assert!((parse_framerate(&p) - 24.0).abs() < 0.001);
        assert_eq!(parse_resolution(&p), (1280, 720));
    }

    #[test]
    fn test_codec_encoders() {
        assert_eq!(VideoCodec::Vp9.encoder(), "libvpx-vp9");
        assert_eq!("libx265".parse::<VideoCodec>().unwrap(), VideoCodec::Libx265);
        assert_eq!("VP9".parse::<VideoCodec>().unwrap(), VideoCodec::Vp9);
        assert!("prores".parse::<VideoCodec>().is_err());
    }

    #[test]
    fn test_concat_list_escapes_quotes() {
        let body = concat_list_body(&[PathBuf::from("/a/b.mp4"), PathBuf::from("/a/it's.mp4")]);
        assert_eq!(body, "file '/a/b.mp4'\nfile '/a/it'\\''s.mp4'\n");
    }

    #[tokio::test]
    async fn test_write_concat_list() {
        let dir = tempfile::tempdir().unwrap();
        let list = dir.path().join("list.txt");
        let clip = dir.path().join("a.mp4");
        write_concat_list(&[clip.clone(), PathBuf::from("work/x.png")], &list)
            .await
            .unwrap();
        let cwd = std::env::current_dir().unwrap();
        assert_eq!(
            std::fs::read_to_string(&list).unwrap(),
            format!("file '{}'\nfile '{}'\n", clip.display(), cwd.join("work/x.png").display())
        );
    }

    #[test]
    fn test_concat_copy_args() {
        let args = strings(&concat_copy_args(Path::new("l.txt"), Path::new("o.mp4")));
        assert_eq!(
            args,
            ["-y", "-f", "concat", "-safe", "0", "-i", "l.txt", "-c", "copy", "o.mp4"]
        );
    }

    #[test]
    fn test_assemble_args() {
        let args = strings(&assemble_args(Path::new("l.txt"), Path::new("o.mp4")));
        assert!(args.windows(2).any(|w| w == ["-pix_fmt", "yuv420p"]));
        assert!(args.windows(2).any(|w| w == ["-c:v", "libx264"]));
    }

    #[test]
    fn test_transcode_args_with_custom() {
        let custom = split_custom_args("  -crf 18   -preset slow ");
        let args = strings(&transcode_args(
            TranscodeInput::File(Path::new("in.mp4")),
            Path::new("out.mp4"),
            VideoCodec::Vp9,
            &custom,
        ));
        assert_eq!(
            args,
            ["-y", "-i", "in.mp4", "-c:v", "libvpx-vp9", "-c:a", "aac", "-crf", "18", "-preset", "slow", "out.mp4"]
        );
    }

    #[tokio::test]
    async fn test_missing_video_is_reported() {
        let err = probe_video(Path::new("/definitely/not/here.mp4")).await.unwrap_err();
        assert!(matches!(err, FfmpegError::VideoNotFound(_)));
    }
}
