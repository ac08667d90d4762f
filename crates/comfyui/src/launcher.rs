//! Local ComfyUI process launcher.
//!
//! Starts `python main.py` in the ComfyUI checkout, forwards its output
//! line by line to `tracing`, and stops it with SIGTERM followed by a
//! hard kill if it does not exit in time.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};

/// Grace period between SIGTERM and a hard kill.
const STOP_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum LauncherError {
    #[error("ComfyUI entry point not found: {0}")]
    MainNotFound(PathBuf),

    #[error("Failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Process I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A running ComfyUI server process.
#[derive(Debug)]
pub struct ComfyLauncher {
    child: Child,
}

impl ComfyLauncher {
    /// Spawn `python main_py` with the working directory set to the
    /// folder containing `main_py`.
    pub fn start(python: &str, main_py: &Path) -> Result<Self, LauncherError> {
        if !main_py.is_file() {
            return Err(LauncherError::MainNotFound(main_py.to_path_buf()));
        }
        let workdir = main_py.parent().unwrap_or_else(|| Path::new("."));

        tracing::info!(
            python,
            main = %main_py.display(),
            workdir = %workdir.display(),
            "Starting ComfyUI",
        );

        let mut child = Command::new(python)
            .arg(main_py)
            .current_dir(workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| LauncherError::Spawn {
                program: python.to_string(),
                source,
            })?;

        if let Some(out) = child.stdout.take() {
            tokio::spawn(forward_lines(out, "stdout"));
        }
        if let Some(err) = child.stderr.take() {
            tokio::spawn(forward_lines(err, "stderr"));
        }

        Ok(Self { child })
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Whether the process has not exited yet.
    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Wait for the process to exit on its own.
    pub async fn wait(&mut self) -> Result<ExitStatus, LauncherError> {
        Ok(self.child.wait().await?)
    }

    /// Ask the process to terminate, killing it after a grace period.
    pub async fn stop(&mut self) -> Result<ExitStatus, LauncherError> {
        if let Some(status) = self.child.try_wait()? {
            return Ok(status);
        }

        #[cfg(unix)]
        if let Some(pid) = self.child.id() {
            tracing::info!(pid, "Sending SIGTERM to ComfyUI");
            // SAFETY: pid belongs to a child we spawned and have not reaped.
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
            if let Ok(status) = tokio::time::timeout(STOP_GRACE, self.child.wait()).await {
                return Ok(status?);
            }
            tracing::warn!(pid, "ComfyUI ignored SIGTERM, killing");
        }

        self.child.kill().await?;
        Ok(self.child.wait().await?)
    }
}

async fn forward_lines<R>(reader: R, stream: &'static str)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => tracing::info!(stream, "{line}"),
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(stream, error = %e, "ComfyUI output stream closed");
                break;
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn missing_main_is_rejected() {
        let err = ComfyLauncher::start("python3", Path::new("/nonexistent/main.py")).unwrap_err();
        assert_matches!(err, LauncherError::MainNotFound(_));
    }

    #[tokio::test]
    async fn runs_script_to_completion() {
        let dir = std::env::temp_dir().join(format!("launcher-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let script = dir.join("main.py");
        std::fs::write(&script, "echo started\nexit 3\n").unwrap();

        let mut launcher = ComfyLauncher::start("sh", &script).unwrap();
        let status = launcher.wait().await.unwrap();
        assert_eq!(status.code(), Some(3));
        assert!(!launcher.is_running());

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn stop_terminates_long_running_process() {
        let dir = std::env::temp_dir().join(format!("launcher-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let script = dir.join("main.py");
        std::fs::write(&script, "sleep 30\n").unwrap();

        let mut launcher = ComfyLauncher::start("sh", &script).unwrap();
        assert!(launcher.is_running());
        let status = launcher.stop().await.unwrap();
        assert!(!status.success());

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
