//! Sequential render engine.
//!
//! Takes a render queue built by [`shotdesigner_core::queue`] and runs
//! each task against a single ComfyUI server: reuse checks, parameter
//! injection, submission, completion tracking, download and version
//! bookkeeping. Only one prompt is outstanding at any time.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use shotdesigner_comfyui::api::{history_ready, ComfyUIApi, ComfyUIApiError, PollConfig};
use shotdesigner_comfyui::client::{ComfyUIClient, ComfyUIConnection};
use shotdesigner_comfyui::events::ExecutionEvent;
use shotdesigner_comfyui::history::{find_primary_output, PrimaryOutput};
use shotdesigner_comfyui::processor::{track_prompt, TrackOutcome};
use shotdesigner_comfyui::reconnect::{reconnect_loop, ReconnectConfig};
use shotdesigner_core::error::CoreError;
use shotdesigner_core::ffmpeg;
use shotdesigner_core::naming;
use shotdesigner_core::param::{Param, ParamSource};
use shotdesigner_core::project::{project_folder, Project};
use shotdesigner_core::queue::RenderTask;
use shotdesigner_core::settings::Settings;
use shotdesigner_core::shot::{MediaKind, WorkflowParams};
use shotdesigner_core::signature::{render_signature, workflow_signature};
use shotdesigner_core::workflow::WorkflowGraph;

use crate::error::PipelineError;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// How often a dynamic param checks for its source file.
const PREV_RESULT_POLL: Duration = Duration::from_secs(1);

/// Progress notifications for render subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RenderEvent {
    TaskStarted {
        shot_index: usize,
        workflow_index: usize,
        shot: String,
        workflow: String,
    },
    /// A ComfyUI execution event for the running task.
    Execution {
        shot_index: usize,
        workflow_index: usize,
        event: ExecutionEvent,
    },
    TaskReused {
        shot_index: usize,
        workflow_index: usize,
        path: String,
    },
    TaskCompleted {
        shot_index: usize,
        workflow_index: usize,
        path: String,
        is_video: bool,
    },
    TaskFailed {
        shot_index: usize,
        workflow_index: usize,
        error: String,
    },
    QueueFinished { summary: RenderSummary },
}

/// Counts of how each queued task ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RenderSummary {
    pub completed: usize,
    pub reused: usize,
    pub failed: usize,
    /// Tasks not run because the queue was cancelled.
    pub cancelled: usize,
}

/// Result of a single task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// A new output was rendered and recorded.
    Rendered { path: String, kind: MediaKind },
    /// An existing output was reused without dispatching.
    Reused { path: String },
}

pub struct RenderEngine {
    api: ComfyUIApi,
    client: ComfyUIClient,
    settings: Settings,
    reconnect: ReconnectConfig,
    events: broadcast::Sender<RenderEvent>,
}

impl RenderEngine {
    pub fn new(api: ComfyUIApi, settings: Settings) -> Self {
        let client = match settings.ws_url_override() {
            Some(ws_url) => ComfyUIClient::with_ws_url(api.api_url(), ws_url),
            None => ComfyUIClient::new(api.api_url()),
        };
        let reconnect = ReconnectConfig {
            max_attempts: Some(settings.ws_reconnect_attempts.max(1)),
            ..ReconnectConfig::default()
        };
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            api,
            client,
            settings,
            reconnect,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RenderEvent> {
        self.events.subscribe()
    }

    /// Run `queue` in order, one task at a time.
    ///
    /// A failed task is reported and the queue moves on. Cancellation
    /// interrupts the server and counts the remaining tasks as cancelled.
    /// When `project_path` is given the project is saved after every
    /// task that changed it, and rendered media lands next to it.
    pub async fn render(
        &self,
        project: &mut Project,
        project_path: Option<&Path>,
        queue: &[RenderTask],
        cancel: &CancellationToken,
    ) -> RenderSummary {
        let fallback = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        let folder = project_folder(project_path, &fallback);
        let mut summary = RenderSummary::default();

        tracing::info!(
            tasks = queue.len(),
            folder = %folder.display(),
            "Render queue started",
        );

        for (position, task) in queue.iter().copied().enumerate() {
            if cancel.is_cancelled() {
                summary.cancelled = queue.len() - position;
                break;
            }

            let (shot, workflow) = task_labels(project, task);
            tracing::info!(
                shot_index = task.shot_index,
                workflow_index = task.workflow_index,
                shot = %shot,
                workflow = %workflow,
                "Rendering task {}/{}",
                position + 1,
                queue.len(),
            );
            self.emit(RenderEvent::TaskStarted {
                shot_index: task.shot_index,
                workflow_index: task.workflow_index,
                shot,
                workflow,
            });

            match self.execute_workflow(project, task, &folder, cancel).await {
                Ok(TaskOutcome::Rendered { path, kind }) => {
                    summary.completed += 1;
                    self.emit(RenderEvent::TaskCompleted {
                        shot_index: task.shot_index,
                        workflow_index: task.workflow_index,
                        path,
                        is_video: kind.is_video(),
                    });
                    autosave(project, project_path);
                }
                Ok(TaskOutcome::Reused { path }) => {
                    summary.reused += 1;
                    self.emit(RenderEvent::TaskReused {
                        shot_index: task.shot_index,
                        workflow_index: task.workflow_index,
                        path,
                    });
                    autosave(project, project_path);
                }
                Err(PipelineError::Cancelled) => {
                    tracing::warn!(shot_index = task.shot_index, "Render queue cancelled");
                    self.interrupt_quietly().await;
                    summary.cancelled = queue.len() - position;
                    break;
                }
                Err(e) => {
                    summary.failed += 1;
                    tracing::error!(
                        shot_index = task.shot_index,
                        workflow_index = task.workflow_index,
                        error = %e,
                        "Render task failed",
                    );
                    self.emit(RenderEvent::TaskFailed {
                        shot_index: task.shot_index,
                        workflow_index: task.workflow_index,
                        error: e.to_string(),
                    });
                }
            }
        }

        tracing::info!(
            completed = summary.completed,
            reused = summary.reused,
            failed = summary.failed,
            cancelled = summary.cancelled,
            "Render queue finished",
        );
        self.emit(RenderEvent::QueueFinished { summary });
        summary
    }

    /// Render one workflow of one shot and record the result.
    pub async fn execute_workflow(
        &self,
        project: &mut Project,
        task: RenderTask,
        folder: &Path,
        cancel: &CancellationToken,
    ) -> Result<TaskOutcome, PipelineError> {
        let RenderTask {
            shot_index,
            workflow_index,
        } = task;

        let shot = project.shot(shot_index)?;
        let signature = workflow_signature(shot, workflow_index).ok_or(CoreError::NotFound {
            entity: "workflow",
            index: workflow_index,
        })?;

        if let Some(path) = reuse_existing(project, shot_index, workflow_index, &signature)? {
            return Ok(TaskOutcome::Reused { path });
        }

        let shot = project.shot(shot_index)?;
        let wf = &shot.workflows[workflow_index];
        let job = Job {
            task,
            graph_path: PathBuf::from(&wf.path),
            shot_name: shot.name.clone(),
            shot_params: shot.params.clone(),
            shot_still: shot.current_path(MediaKind::Image).map(str::to_string),
            version_number: wf.versions.len() + 1,
            timestamp: chrono::Utc::now().timestamp(),
        };
        let previous_image = shot.current_path(MediaKind::Image).map(PathBuf::from);
        let previous_video = shot.current_path(MediaKind::Video).map(PathBuf::from);
        let mut params = wf.parameters.clone();

        self.resolve_previous_results(
            &mut params.params,
            previous_image.as_deref(),
            previous_video.as_deref(),
            cancel,
        )
        .await?;

        let (path, kind) = if params.runs() > 1 {
            self.render_frames(&job, &mut params, folder, cancel).await?
        } else {
            let (bytes, output) = self.run_workflow(&job, &params, cancel).await?;
            let kind = MediaKind::from_is_video(output.is_video);
            let name = naming::version_file_name(
                &job.shot_name,
                workflow_index,
                job.version_number,
                job.timestamp,
                &output.file.extension(),
            );
            (store_output(folder, kind, &name, &bytes).await?, kind)
        };

        let path = path.display().to_string();
        record_render(project, task, kind, &path, &signature)?;
        tracing::info!(
            shot_index,
            workflow_index,
            path = %path,
            is_video = kind.is_video(),
            "Render recorded",
        );
        Ok(TaskOutcome::Rendered { path, kind })
    }

    /// Fill previous-result params with the shot's current media, waiting
    /// for the file to appear on disk.
    async fn resolve_previous_results(
        &self,
        params: &mut [Param],
        previous_image: Option<&Path>,
        previous_video: Option<&Path>,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        for param in params.iter_mut() {
            let source = match param.source() {
                ParamSource::PreviousImage => previous_image,
                ParamSource::PreviousVideo => previous_video,
                ParamSource::Literal | ParamSource::ShotImage => continue,
            };
            let Some(path) = source else {
                return Err(PipelineError::MissingPreviousResult(param.name.clone()));
            };
            self.wait_for_file(path, cancel).await?;
            tracing::debug!(param = %param.name, path = %path.display(), "Resolved previous result");
            param.value = Value::String(path.display().to_string());
        }
        Ok(())
    }

    async fn wait_for_file(&self, path: &Path, cancel: &CancellationToken) -> Result<(), PipelineError> {
        let timeout = self.settings.prev_result_timeout();
        let started = Instant::now();
        while !path.exists() {
            if started.elapsed() >= timeout {
                return Err(PipelineError::PreviousResultTimeout(path.to_path_buf()));
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
                _ = tokio::time::sleep(PREV_RESULT_POLL) => {}
            }
        }
        Ok(())
    }

    /// Run the workflow once per frame and assemble the frames into a video.
    ///
    /// Each frame's output feeds the previous-result params of the next run.
    async fn render_frames(
        &self,
        job: &Job,
        params: &mut WorkflowParams,
        folder: &Path,
        cancel: &CancellationToken,
    ) -> Result<(PathBuf, MediaKind), PipelineError> {
        let runs = params.runs() as usize;
        let mut frames = Vec::with_capacity(runs);

        for run in 1..=runs {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            tracing::info!(shot = %job.shot_name, run, runs, "Rendering frame");

            let (bytes, output) = self.run_workflow(job, params, cancel).await?;
            let kind = MediaKind::from_is_video(output.is_video);
            let name = naming::version_file_name(
                &format!("{}_frame", job.shot_name),
                job.task.workflow_index,
                run,
                job.timestamp,
                &output.file.extension(),
            );
            let frame = store_output(folder, kind, &name, &bytes).await?;

            let feeds = match kind {
                MediaKind::Image => ParamSource::PreviousImage,
                MediaKind::Video => ParamSource::PreviousVideo,
            };
            for param in params.params.iter_mut().filter(|p| p.source() == feeds) {
                param.value = Value::String(frame.display().to_string());
            }
            frames.push(frame);
        }

        let videos = folder.join(naming::media_subfolder(MediaKind::Video));
        tokio::fs::create_dir_all(&videos)
            .await
            .map_err(|e| PipelineError::io(&videos, e))?;
        let stem = naming::version_file_name(
            &job.shot_name,
            job.task.workflow_index,
            job.version_number,
            job.timestamp,
            "",
        );
        let list = videos.join(format!("{stem}_frames.txt"));
        let output = videos.join(format!("{stem}.mp4"));

        ffmpeg::write_concat_list(&frames, &list).await?;
        ffmpeg::assemble_frames(&list, &output).await?;
        if let Err(e) = tokio::fs::remove_file(&list).await {
            tracing::debug!(list = %list.display(), error = %e, "Could not remove frame list");
        }

        tracing::info!(frames = frames.len(), output = %output.display(), "Frames assembled");
        Ok((output, MediaKind::Video))
    }

    /// Inject params, submit, wait and download the primary output.
    async fn run_workflow(
        &self,
        job: &Job,
        params: &WorkflowParams,
        cancel: &CancellationToken,
    ) -> Result<(Vec<u8>, PrimaryOutput), PipelineError> {
        let mut graph = WorkflowGraph::load(&job.graph_path)?;
        let written = graph.apply_params(&job.shot_params, &params.params, job.shot_still.as_deref());
        tracing::debug!(workflow = %job.graph_path.display(), written, "Params injected");

        let (prompt_id, history) = self.submit_and_wait(job.task, graph.into_value(), cancel).await?;
        let output = find_primary_output(&history, &prompt_id)
            .ok_or_else(|| PipelineError::NoOutput(prompt_id.clone()))?;
        tracing::debug!(prompt_id = %prompt_id, file = %output.file.relative_path(), "Downloading output");
        let bytes = self.api.download_output(&output.file).await?;
        Ok((bytes, output))
    }

    /// Submit `workflow` and wait for its history record.
    ///
    /// Completion is tracked over the WebSocket when enabled and
    /// reachable, with history polling as the fallback. The render
    /// timeout bounds the whole execution, reconnects and fallback
    /// polling included.
    pub async fn submit_and_wait(
        &self,
        task: RenderTask,
        workflow: Value,
        cancel: &CancellationToken,
    ) -> Result<(String, Value), PipelineError> {
        let poll = PollConfig {
            interval: self.settings.poll_interval(),
            timeout: self.settings.render_timeout(),
        };

        if self.settings.use_websocket {
            match self.client.connect().await {
                Ok(conn) => return self.submit_tracked(task, conn, workflow, &poll, cancel).await,
                Err(e) => {
                    tracing::warn!(error = %e, "WebSocket unavailable, polling history instead");
                }
            }
        }

        let client_id = uuid::Uuid::new_v4().to_string();
        let submitted = self.api.submit_workflow(&workflow, &client_id).await?;
        let history = self
            .api
            .wait_for_history(&submitted.prompt_id, &poll, cancel)
            .await?;
        Ok((submitted.prompt_id, history))
    }

    async fn submit_tracked(
        &self,
        task: RenderTask,
        conn: ComfyUIConnection,
        workflow: Value,
        poll: &PollConfig,
        cancel: &CancellationToken,
    ) -> Result<(String, Value), PipelineError> {
        let ComfyUIConnection {
            client_id,
            mut ws_stream,
            ..
        } = conn;
        let submitted = self.api.submit_workflow(&workflow, &client_id).await?;
        let prompt_id = submitted.prompt_id;
        let deadline = tokio::time::Instant::now() + poll.timeout;
        let exec_tx = self.forward_execution_events(task);

        loop {
            let outcome = tokio::time::timeout_at(
                deadline,
                track_prompt(&mut ws_stream, &prompt_id, Some(&exec_tx), cancel),
            )
            .await
            .map_err(|_| execution_timeout(&prompt_id, poll.timeout))?;

            match outcome {
                TrackOutcome::Completed => break,
                TrackOutcome::Failed(error) => {
                    return Err(PipelineError::ExecutionFailed { prompt_id, error });
                }
                TrackOutcome::Interrupted => {
                    return Err(PipelineError::ExecutionFailed {
                        prompt_id,
                        error: "interrupted on the server".to_string(),
                    });
                }
                TrackOutcome::Cancelled => return Err(PipelineError::Cancelled),
                TrackOutcome::Disconnected => {
                    tracing::warn!(prompt_id = %prompt_id, "WebSocket dropped while tracking");
                    let reconnected = tokio::time::timeout_at(
                        deadline,
                        reconnect_loop(&self.client, &client_id, &self.reconnect, cancel),
                    )
                    .await
                    .map_err(|_| execution_timeout(&prompt_id, poll.timeout))?;
                    let Some(conn) = reconnected else {
                        if cancel.is_cancelled() {
                            return Err(PipelineError::Cancelled);
                        }
                        tracing::warn!(prompt_id = %prompt_id, "Falling back to history polling");
                        break;
                    };
                    ws_stream = conn.ws_stream;
                    // The prompt may have finished while the socket was down.
                    if let Ok(history) = self.api.get_history(&prompt_id).await {
                        if history_ready(&history, &prompt_id) {
                            return Ok((prompt_id, history));
                        }
                    }
                }
            }
        }

        let remaining = PollConfig {
            interval: poll.interval,
            timeout: deadline.saturating_duration_since(tokio::time::Instant::now()),
        };
        let history = self.api.wait_for_history(&prompt_id, &remaining, cancel).await?;
        Ok((prompt_id, history))
    }

    /// Re-emit execution events of `task` on the render event channel.
    ///
    /// The forwarding task ends when the returned sender is dropped.
    fn forward_execution_events(&self, task: RenderTask) -> broadcast::Sender<ExecutionEvent> {
        let (tx, mut rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let events = self.events.clone();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let _ = events.send(RenderEvent::Execution {
                            shot_index: task.shot_index,
                            workflow_index: task.workflow_index,
                            event,
                        });
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "Execution event forwarder lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
        tx
    }

    async fn interrupt_quietly(&self) {
        if let Err(e) = self.api.interrupt().await {
            tracing::warn!(error = %e, "Failed to interrupt ComfyUI");
        }
    }

    fn emit(&self, event: RenderEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

fn execution_timeout(prompt_id: &str, waited: Duration) -> ComfyUIApiError {
    ComfyUIApiError::Timeout {
        prompt_id: prompt_id.to_string(),
        waited,
    }
}

/// Everything a dispatch needs from the shot, captured up front.
struct Job {
    task: RenderTask,
    graph_path: PathBuf,
    shot_name: String,
    shot_params: Vec<Param>,
    shot_still: Option<String>,
    version_number: usize,
    timestamp: i64,
}

/// Find an output that makes dispatching unnecessary and make it current.
///
/// Checked in order: the workflow is unchanged since its last render and
/// the shot's media still exists; another shot rendered the same
/// workflow with identical inputs; a recorded version of this workflow
/// was rendered under the same signature.
pub fn reuse_existing(
    project: &mut Project,
    shot_index: usize,
    workflow_index: usize,
    signature: &str,
) -> Result<Option<String>, CoreError> {
    let shot = project.shot(shot_index)?;
    let wf = shot.workflows.get(workflow_index).ok_or(CoreError::NotFound {
        entity: "workflow",
        index: workflow_index,
    })?;
    let kind = wf.media_kind();
    let shot_signature = render_signature(shot, kind);
    let current = shot
        .current_path(kind)
        .filter(|p| Path::new(p).exists())
        .map(str::to_string);

    if wf.last_signature == signature {
        if let Some(path) = current {
            tracing::info!(shot_index, workflow_index, path = %path, "Workflow unchanged, skipping");
            return Ok(Some(path));
        }
    }

    if current.is_none() {
        if let Some((path, source_signature)) = project.find_shared_output(shot_index, workflow_index) {
            tracing::info!(
                shot_index,
                workflow_index,
                path = %path,
                source_signature = %source_signature,
                "Reusing identical output of another shot",
            );
            let shot = project.shot_mut(shot_index)?;
            shot.record_output(kind, path.clone(), &shot_signature);
            shot.workflows[workflow_index].last_signature = signature.to_string();
            return Ok(Some(path));
        }
    }

    let shot = project.shot(shot_index)?;
    let Some(path) = shot.workflows[workflow_index]
        .reusable_output(signature)
        .map(|v| v.output.clone())
    else {
        return Ok(None);
    };
    tracing::info!(shot_index, workflow_index, path = %path, "Reusing matching workflow version");

    let shot = project.shot_mut(shot_index)?;
    match shot.versions(kind).iter().position(|p| *p == path) {
        Some(index) => {
            shot.select_version(kind, index)?;
            shot.set_last_signature(kind, &shot_signature);
        }
        None => shot.record_output(kind, path.clone(), &shot_signature),
    }
    shot.workflows[workflow_index].last_signature = signature.to_string();
    Ok(Some(path))
}

/// Record a fresh render on the shot and on the workflow's version list.
fn record_render(
    project: &mut Project,
    task: RenderTask,
    kind: MediaKind,
    path: &str,
    signature: &str,
) -> Result<(), CoreError> {
    let shot = project.shot_mut(task.shot_index)?;
    let shot_signature = render_signature(shot, kind);
    shot.record_output(kind, path, &shot_signature);
    let wf = shot
        .workflows
        .get_mut(task.workflow_index)
        .ok_or(CoreError::NotFound {
            entity: "workflow",
            index: task.workflow_index,
        })?;
    wf.record_version(path, kind.is_video(), signature);
    Ok(())
}

/// Write downloaded bytes to `<folder>/<stills|videos>/<name>`.
async fn store_output(
    folder: &Path,
    kind: MediaKind,
    name: &str,
    bytes: &[u8],
) -> Result<PathBuf, PipelineError> {
    let dir = folder.join(naming::media_subfolder(kind));
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|e| PipelineError::io(&dir, e))?;
    let path = dir.join(name);
    tokio::fs::write(&path, bytes)
        .await
        .map_err(|e| PipelineError::io(&path, e))?;
    Ok(path)
}

fn task_labels(project: &Project, task: RenderTask) -> (String, String) {
    match project.shot(task.shot_index) {
        Ok(shot) => (
            shot.name.clone(),
            shot.workflows
                .get(task.workflow_index)
                .map(|wf| wf.label().to_string())
                .unwrap_or_default(),
        ),
        Err(_) => (String::new(), String::new()),
    }
}

fn autosave(project: &Project, project_path: Option<&Path>) {
    if let Some(path) = project_path {
        if let Err(e) = project.save(path) {
            tracing::warn!(path = %path.display(), error = %e, "Autosave failed");
        }
    }
}
