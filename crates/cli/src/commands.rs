//! Subcommand handlers.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context as _};
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use shotdesigner_comfyui::api::ComfyUIApi;
use shotdesigner_comfyui::events::ExecutionEvent;
use shotdesigner_comfyui::launcher::ComfyLauncher;
use shotdesigner_core::ffmpeg::{split_custom_args, VideoCodec};
use shotdesigner_core::naming;
use shotdesigner_core::param::AssetKind;
use shotdesigner_core::project::{project_folder, ParamTarget, Project};
use shotdesigner_core::queue::{build_queue, render_all_queue, RenderMode, RenderTask};
use shotdesigner_core::relink::relink_missing;
use shotdesigner_core::settings::Settings;
use shotdesigner_core::shot::{MediaKind, WorkflowAssignment};
use shotdesigner_core::signature::render_signature;
use shotdesigner_core::workflow::WorkflowGraph;
use shotdesigner_pipeline::edit::{self, ExportOptions};
use shotdesigner_pipeline::engine::{RenderEngine, RenderEvent, RenderSummary};
use shotdesigner_pipeline::wizard::{ShotWizard, WizardRequest, WizardWorkflow};

use crate::{Command, ComfyCommand, PreviousAsset, SettingsCommand, WizardArgs};

/// Settings as stored on disk plus where they live.
pub struct Context {
    settings_path: PathBuf,
    settings: Settings,
}

impl Context {
    pub fn load(explicit: Option<PathBuf>) -> anyhow::Result<Self> {
        let settings_path = match explicit {
            Some(path) => path,
            None => Settings::default_path()
                .context("no config directory on this platform; pass --settings")?,
        };
        let settings = Settings::load(&settings_path)
            .with_context(|| format!("loading settings from {}", settings_path.display()))?;
        Ok(Self {
            settings_path,
            settings,
        })
    }

    /// Stored settings with environment overrides applied.
    fn effective(&self) -> Settings {
        let mut settings = self.settings.clone();
        settings.apply_env();
        settings
    }

    fn save_settings(&self) -> anyhow::Result<()> {
        self.settings
            .save(&self.settings_path)
            .with_context(|| format!("saving settings to {}", self.settings_path.display()))
    }

    fn api(&self) -> ComfyUIApi {
        ComfyUIApi::new(self.effective().comfy_url())
    }

    /// Save the project and put it at the top of the recent-files list.
    fn save_project(&mut self, project: &Project, path: &Path) -> anyhow::Result<()> {
        project
            .save(path)
            .with_context(|| format!("saving project {}", path.display()))?;
        self.settings.add_recent(&path.display().to_string());
        if let Err(e) = self.save_settings() {
            tracing::warn!(error = %e, "Could not update recent files");
        }
        Ok(())
    }
}

fn load_project(path: &Path) -> anyhow::Result<Project> {
    Project::load(path).with_context(|| format!("loading project {}", path.display()))
}

fn work_dir() -> PathBuf {
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

pub async fn run(mut ctx: Context, command: Command) -> anyhow::Result<()> {
    match command {
        Command::New { project, force } => {
            if project.exists() && !force {
                bail!("{} already exists; use --force to overwrite", project.display());
            }
            ctx.save_project(&Project::new(), &project)?;
            println!("Created {}", project.display());
        }

        Command::Status { project } => {
            let loaded = load_project(&project.project)?;
            print_status(&loaded);
        }

        Command::AddShot { project, from } => {
            let mut loaded = load_project(&project.project)?;
            let params = ctx.effective().new_shot_params();
            let index = loaded.add_shot(from, &params)?;
            ctx.save_project(&loaded, &project.project)?;
            println!("Added shot {index}: {}", loaded.shots[index].name);
        }

        Command::RemoveShot { project, shot } => {
            let mut loaded = load_project(&project.project)?;
            let removed = loaded.remove_shot(shot)?;
            ctx.save_project(&loaded, &project.project)?;
            println!("Removed shot '{}'", removed.name);
        }

        Command::MoveShot { project, from, to } => {
            let mut loaded = load_project(&project.project)?;
            loaded.move_shot(from, to)?;
            ctx.save_project(&loaded, &project.project)?;
        }

        Command::DuplicateShot { project, shot } => {
            let mut loaded = load_project(&project.project)?;
            let index = loaded.duplicate_shot(shot)?;
            ctx.save_project(&loaded, &project.project)?;
            println!("Duplicated into shot {index}: {}", loaded.shots[index].name);
        }

        Command::ImportLines {
            project,
            file,
            param,
            workflow,
            from,
        } => {
            let text = if file.as_os_str() == "-" {
                std::io::read_to_string(std::io::stdin()).context("reading stdin")?
            } else {
                std::fs::read_to_string(&file)
                    .with_context(|| format!("reading {}", file.display()))?
            };
            let target = param.map(|name| match workflow {
                Some(path) => ParamTarget::Workflow { path, name },
                None => ParamTarget::Shot { name },
            });

            let mut loaded = load_project(&project.project)?;
            let params = ctx.effective().new_shot_params();
            let created = loaded.import_lines(text.lines(), target.as_ref(), from, &params)?;
            ctx.save_project(&loaded, &project.project)?;
            println!("Imported {} shots", created.len());
        }

        Command::AddWorkflow {
            project,
            shot,
            workflow,
            video,
        } => {
            let mut loaded = load_project(&project.project)?;
            let graph = WorkflowGraph::load(&workflow)?;
            let key = workflow.display().to_string();
            let settings = ctx.effective();
            let assignment = WorkflowAssignment::from_graph(
                key.clone(),
                &graph,
                video,
                settings.workflow_defaults_for(&key),
                |node, input| settings.param_visible(&key, node, input),
            );
            let params = assignment.parameters.params.len();
            let index = loaded.add_workflow(shot, assignment)?;
            ctx.save_project(&loaded, &project.project)?;
            println!("Attached workflow {index} to shot {shot} ({params} params)");
        }

        Command::RemoveWorkflow {
            project,
            shot,
            workflow,
        } => {
            let mut loaded = load_project(&project.project)?;
            let removed = loaded.remove_workflow(shot, workflow)?;
            ctx.save_project(&loaded, &project.project)?;
            println!("Removed workflow {}", removed.path);
        }

        Command::ToggleWorkflow {
            project,
            shot,
            workflow,
        } => {
            let mut loaded = load_project(&project.project)?;
            let enabled = loaded.toggle_workflow(shot, workflow)?;
            ctx.save_project(&loaded, &project.project)?;
            println!("Workflow {workflow} {}", if enabled { "enabled" } else { "disabled" });
        }

        Command::SetParam {
            project,
            name,
            value,
            workflow,
            shots,
        } => {
            let mut loaded = load_project(&project.project)?;
            let target = match workflow {
                Some(path) => ParamTarget::Workflow { path, name },
                None => ParamTarget::Shot { name },
            };
            let value = typed_value(&loaded, &target, &value)?;
            let changed = loaded.set_param_in_shots(&target, &value, shots.as_deref());
            ctx.save_project(&loaded, &project.project)?;
            println!("Updated {changed} params");
        }

        Command::PreviousResult {
            project,
            shot,
            workflow,
            param,
            asset,
        } => {
            let mut loaded = load_project(&project.project)?;
            let wf = loaded.workflow_mut(shot, workflow)?;
            let target = wf
                .parameters
                .find_mut(&param)
                .with_context(|| format!("workflow {workflow} has no param '{param}'"))?;
            match asset {
                PreviousAsset::Image => target.set_previous_result(AssetKind::Image)?,
                PreviousAsset::Video => target.set_previous_result(AssetKind::Video)?,
                PreviousAsset::None => target.clear_dynamic_override(),
            }
            ctx.save_project(&loaded, &project.project)?;
        }

        Command::SelectVersion {
            project,
            shot,
            kind,
            version,
        } => {
            let mut loaded = load_project(&project.project)?;
            let kind = MediaKind::from(kind);
            let selected = loaded.shot_mut(shot)?;
            selected.select_version(kind, version)?;
            let current = selected.current_path(kind).unwrap_or_default().to_string();
            ctx.save_project(&loaded, &project.project)?;
            println!("Shot {shot} now uses {current}");
        }

        Command::SaveDefaults {
            project,
            shot,
            workflow,
        } => {
            let mut loaded = load_project(&project.project)?;
            let wf = loaded.workflow_mut(shot, workflow)?;
            let path = wf.path.clone();
            ctx.settings.save_workflow_defaults(&path, wf.parameters.clone());
            ctx.save_settings()?;
            println!("Saved defaults for {path}");
        }

        Command::Render {
            project,
            shots,
            mode,
        } => {
            let mut loaded = load_project(&project.project)?;
            let selection = shots.unwrap_or_else(|| (0..loaded.shots.len()).collect());
            let queue = build_queue(&loaded.shots, &selection, RenderMode::from(mode));
            render(&mut ctx, &mut loaded, &project.project, &queue).await?;
        }

        Command::RenderAll { project } => {
            let mut loaded = load_project(&project.project)?;
            let queue = render_all_queue(&loaded.shots);
            render(&mut ctx, &mut loaded, &project.project, &queue).await?;
        }

        Command::Export {
            project,
            dest,
            codec,
            merge,
            args,
        } => {
            let loaded = load_project(&project.project)?;
            let options = ExportOptions {
                dest,
                codec: codec.parse::<VideoCodec>().map_err(anyhow::Error::msg)?,
                merge,
                custom_args: split_custom_args(&args),
            };
            let written = edit::export(&loaded, &options).await?;
            for path in &written {
                println!("{}", path.display());
            }
        }

        Command::Merge { project, shots } => {
            let mut loaded = load_project(&project.project)?;
            let folder = project_folder(Some(&project.project), &work_dir())
                .join(naming::media_subfolder(MediaKind::Video));
            let index = edit::merge_shots(&mut loaded, &shots, &folder).await?;
            ctx.save_project(&loaded, &project.project)?;
            println!("Merged into shot {index}: {}", loaded.shots[index].name);
        }

        Command::Extend {
            project,
            shot,
            param,
        } => {
            let mut loaded = load_project(&project.project)?;
            let frames = project_folder(Some(&project.project), &work_dir())
                .join(naming::media_subfolder(MediaKind::Image));
            let index = edit::extend_shot(&mut loaded, shot, &param, &frames).await?;
            ctx.save_project(&loaded, &project.project)?;
            println!("Extended into shot {index}: {}", loaded.shots[index].name);
        }

        Command::Relink { project, folder } => {
            let mut loaded = load_project(&project.project)?;
            let report = relink_missing(&mut loaded, &folder)?;
            for (location, candidates) in &report.ambiguous {
                tracing::warn!(?location, candidates = candidates.len(), "Several candidates, skipped");
            }
            if !report.relinked.is_empty() {
                ctx.save_project(&loaded, &project.project)?;
            }
            println!(
                "Relinked {}, not found {}, ambiguous {}",
                report.relinked.len(),
                report.not_found.len(),
                report.ambiguous.len()
            );
        }

        Command::Wizard(args) => wizard(&mut ctx, args).await?,

        Command::Comfy { command } => match command {
            ComfyCommand::Start => start_comfy(&ctx.effective()).await?,
            ComfyCommand::Status => {
                let api = ctx.api();
                let stats = api.system_stats().await?;
                let queue = api.queue_status().await?;
                println!("Server:  {}", api.api_url());
                println!("Queue:   {} running, {} pending", queue.running(), queue.pending());
                println!("{}", serde_json::to_string_pretty(&stats)?);
            }
        },

        Command::Settings { command } => match command {
            SettingsCommand::Show => {
                println!("{}", serde_json::to_string_pretty(&ctx.settings)?);
            }
            SettingsCommand::Path => println!("{}", ctx.settings_path.display()),
            SettingsCommand::Set { key, value } => {
                ctx.settings = set_setting(&ctx.settings, &key, &value)?;
                ctx.save_settings()?;
            }
        },

        Command::Workflows { kind } => {
            for path in ctx.effective().list_workflows(kind.into())? {
                println!("{}", path.display());
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Render
// ---------------------------------------------------------------------------

async fn render(
    ctx: &mut Context,
    project: &mut Project,
    path: &Path,
    queue: &[RenderTask],
) -> anyhow::Result<RenderSummary> {
    if queue.is_empty() {
        println!("Nothing to render");
        return Ok(RenderSummary::default());
    }

    let settings = ctx.effective();
    let engine = RenderEngine::new(ComfyUIApi::new(settings.comfy_url()), settings);
    let cancel = cancel_on_ctrl_c();

    let mut events = engine.subscribe();
    let logger = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => log_render_event(&event),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Render log lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let summary = engine.render(project, Some(path), queue, &cancel).await;
    drop(engine);
    if tokio::time::timeout(Duration::from_secs(1), logger).await.is_err() {
        tracing::debug!("Render log did not drain");
    }

    ctx.save_project(project, path)?;
    println!(
        "Completed {}, reused {}, failed {}, cancelled {}",
        summary.completed, summary.reused, summary.failed, summary.cancelled
    );
    if summary.failed > 0 {
        bail!("{} render tasks failed", summary.failed);
    }
    Ok(summary)
}

fn log_render_event(event: &RenderEvent) {
    match event {
        RenderEvent::TaskStarted { shot, workflow, .. } => {
            tracing::info!(%shot, %workflow, "Rendering");
        }
        RenderEvent::Execution { event, .. } => match event {
            ExecutionEvent::Progress {
                percent,
                current_node,
                ..
            } => tracing::debug!(percent, node = ?current_node, "Progress"),
            ExecutionEvent::NodeExecuting { node, .. } => tracing::debug!(%node, "Node executing"),
            other => tracing::trace!(event = ?other, "Execution event"),
        },
        RenderEvent::TaskReused { path, .. } => tracing::info!(%path, "Reused existing output"),
        RenderEvent::TaskCompleted { path, .. } => tracing::info!(%path, "Rendered"),
        RenderEvent::TaskFailed {
            shot_index,
            workflow_index,
            error,
        } => tracing::error!(shot_index, workflow_index, %error, "Task failed"),
        RenderEvent::QueueFinished { .. } => tracing::debug!("Queue finished"),
    }
}

/// Exit status of a forced quit, as for a process killed by SIGINT.
const FORCE_QUIT_STATUS: i32 = 130;

/// Token cancelled on the first Ctrl-C; a second Ctrl-C exits at once.
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    tokio::spawn(watch_interrupts(
        cancel.clone(),
        || async { tokio::signal::ctrl_c().await.is_ok() },
        || std::process::exit(FORCE_QUIT_STATUS),
    ));
    cancel
}

/// Cancel `token` on the first `signal`, call `force_quit` on the second.
///
/// `signal` resolves to `false` when signals cannot be received.
async fn watch_interrupts<S>(
    token: CancellationToken,
    mut signal: impl FnMut() -> S,
    force_quit: impl FnOnce(),
) where
    S: std::future::Future<Output = bool>,
{
    if !signal().await {
        return;
    }
    tracing::warn!("Interrupted, cancelling the running prompt (Ctrl-C again to quit now)");
    token.cancel();
    if signal().await {
        tracing::warn!("Interrupted again, quitting");
        force_quit();
    }
}

// ---------------------------------------------------------------------------
// Wizard
// ---------------------------------------------------------------------------

async fn wizard(ctx: &mut Context, args: WizardArgs) -> anyhow::Result<()> {
    let request = WizardRequest {
        llm_workflow: args.llm,
        prompt: args.prompt,
        overrides: args.overrides.into_iter().collect::<BTreeMap<_, _>>(),
        iterations: args.iterations.max(1),
        iteration_workflow: args.iteration_workflow,
    };
    let lines = ShotWizard::new(ctx.api())
        .generate_lines(&request, &cancel_on_ctrl_c())
        .await?;
    if lines.is_empty() {
        bail!("The LLM workflow produced no lines");
    }
    if args.dry_run {
        for line in &lines {
            println!("{line}");
        }
        return Ok(());
    }

    let workflows: Vec<WizardWorkflow> = args
        .image_workflows
        .into_iter()
        .map(|path| WizardWorkflow { path, is_video: false })
        .chain(
            args.video_workflows
                .into_iter()
                .map(|path| WizardWorkflow { path, is_video: true }),
        )
        .collect();

    let path = args.project.project;
    let mut project = if path.exists() {
        load_project(&path)?
    } else {
        Project::new()
    };
    let settings = ctx.effective();
    let created = shotdesigner_pipeline::wizard::shots_from_lines(
        &mut project,
        &lines,
        &workflows,
        &args.param,
        &settings,
    )?;
    ctx.save_project(&project, &path)?;
    println!("Created {} shots", created.len());
    Ok(())
}

// ---------------------------------------------------------------------------
// ComfyUI process
// ---------------------------------------------------------------------------

async fn start_comfy(settings: &Settings) -> anyhow::Result<()> {
    if settings.comfy_py_path.is_empty() || settings.comfy_main_path.is_empty() {
        bail!("Set comfy_py_path and comfy_main_path first (shotdesigner settings set ...)");
    }
    let mut launcher = ComfyLauncher::start(&settings.comfy_py_path, Path::new(&settings.comfy_main_path))?;
    tracing::info!(pid = ?launcher.id(), "ComfyUI started, Ctrl-C to stop");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            let status = launcher.stop().await?;
            tracing::info!(%status, "ComfyUI stopped");
        }
        status = launcher.wait() => {
            let status = status?;
            if !status.success() {
                bail!("ComfyUI exited with {status}");
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Parse `raw` with the kind of the first matching param in the project,
/// or infer a number or string when none exists yet.
fn typed_value(project: &Project, target: &ParamTarget, raw: &str) -> anyhow::Result<Value> {
    let existing = project.shots.iter().find_map(|shot| match target {
        ParamTarget::Shot { name } => shot.param(name),
        ParamTarget::Workflow { path, name } => shot
            .workflows
            .iter()
            .filter(|wf| &wf.path == path)
            .find_map(|wf| wf.parameters.find(name)),
    });
    match existing {
        Some(param) => Ok(param.parse_value(raw)?),
        None => Ok(infer_value(raw)),
    }
}

fn infer_value(raw: &str) -> Value {
    let trimmed = raw.trim();
    if let Ok(i) = trimmed.parse::<i64>() {
        return Value::from(i);
    }
    if let Ok(f) = trimmed.parse::<f64>() {
        if f.is_finite() {
            return Value::from(f);
        }
    }
    Value::String(raw.to_string())
}

/// Replace one top-level settings key, parsing `raw` as JSON when it is
/// valid JSON and as a plain string otherwise.
fn set_setting(settings: &Settings, key: &str, raw: &str) -> anyhow::Result<Settings> {
    let mut doc = serde_json::to_value(settings)?;
    let fields = doc.as_object_mut().context("settings are not a JSON object")?;
    if !fields.contains_key(key) {
        bail!("Unknown setting '{key}'");
    }
    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    fields.insert(key.to_string(), value);
    serde_json::from_value(doc).with_context(|| format!("invalid value for '{key}'"))
}

fn print_status(project: &Project) {
    for (index, shot) in project.shots.iter().enumerate() {
        let still = shot.media_status(MediaKind::Image, &render_signature(shot, MediaKind::Image));
        let video = shot.media_status(MediaKind::Video, &render_signature(shot, MediaKind::Video));
        println!("{index:>3}  {:<30} still: {still:?}  video: {video:?}", shot.name);
        for (wf_index, wf) in shot.workflows.iter().enumerate() {
            println!(
                "       [{wf_index}] {} {} ({}, {} versions)",
                if wf.enabled { "+" } else { "-" },
                wf.label(),
                naming::media_subfolder(wf.media_kind()),
                wf.versions.len()
            );
        }
    }
    let missing = project.media_refs().iter().filter(|r| !r.exists).count();
    if missing > 0 {
        println!("{missing} media references point at missing files (see `relink`)");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use serde_json::json;
    use shotdesigner_core::param::{Param, ParamKind};
    use shotdesigner_core::shot::Shot;
    use tokio::sync::{oneshot, Notify};

    #[tokio::test]
    async fn first_interrupt_cancels_second_quits() {
        let token = CancellationToken::new();
        let notify = Arc::new(Notify::new());
        let (quit_tx, mut quit_rx) = oneshot::channel();
        let signals = notify.clone();
        let signal = move || {
            let signals = signals.clone();
            async move {
                signals.notified().await;
                true
            }
        };
        let watcher = tokio::spawn(watch_interrupts(token.clone(), signal, move || {
            let _ = quit_tx.send(());
        }));

        notify.notify_one();
        token.cancelled().await;
        assert!(quit_rx.try_recv().is_err());

        notify.notify_one();
        quit_rx.await.unwrap();
        watcher.await.unwrap();
    }

    #[tokio::test]
    async fn unavailable_signal_leaves_token_alone() {
        let token = CancellationToken::new();
        watch_interrupts(token.clone(), || async { false }, || panic!("must not quit")).await;
        assert!(!token.is_cancelled());
    }

    #[test]
    fn infers_numbers_then_strings() {
        assert_eq!(infer_value("12"), json!(12));
        assert_eq!(infer_value("0.5"), json!(0.5));
        assert_eq!(infer_value("a red door"), json!("a red door"));
        assert_eq!(infer_value("NaN"), json!("NaN"));
    }

    #[test]
    fn typed_value_follows_existing_param() {
        let mut project = Project::new();
        let mut shot = Shot::new("Shot 1");
        shot.params.push(Param::new("seed", ParamKind::String, json!("")));
        project.shots.push(shot);

        let target = ParamTarget::Shot { name: "seed".into() };
        assert_eq!(typed_value(&project, &target, "42").unwrap(), json!("42"));

        let unknown = ParamTarget::Shot { name: "steps".into() };
        assert_eq!(typed_value(&project, &unknown, "42").unwrap(), json!(42));
    }

    #[test]
    fn set_setting_updates_known_keys() {
        let settings = Settings::default();
        let updated = set_setting(&settings, "comfy_ip", "http://gpu:8188").unwrap();
        assert_eq!(updated.comfy_ip, "http://gpu:8188");

        let updated = set_setting(&updated, "use_websocket", "false").unwrap();
        assert!(!updated.use_websocket);

        let updated = set_setting(&updated, "comfy_ws_url", "wss://edge.example.com/comfy").unwrap();
        assert_eq!(updated.ws_url_override(), Some("wss://edge.example.com/comfy"));

        assert!(set_setting(&settings, "no_such_key", "1").is_err());
        assert!(set_setting(&settings, "poll_interval_secs", "soon").is_err());
    }

    #[test]
    fn context_saves_recent_projects() {
        let dir = tempfile::tempdir().unwrap();
        let settings_path = dir.path().join("settings.json");
        let project_path = dir.path().join("film.json");

        let mut ctx = Context::load(Some(settings_path.clone())).unwrap();
        ctx.save_project(&Project::new(), &project_path).unwrap();

        let reloaded = Settings::load(&settings_path).unwrap();
        assert_eq!(reloaded.recent_files, vec![project_path.display().to_string()]);
        assert!(project_path.exists());
    }
}
