//! `shotdesigner` -- command-line front-end for Cinema Shot Designer.
//!
//! Edits project files, renders shots on a ComfyUI server and runs the
//! FFmpeg-backed export, merge and extend operations.
//!
//! # Environment variables
//!
//! | Variable                 | Default                     | Description                     |
//! |--------------------------|-----------------------------|---------------------------------|
//! | `COMFY_URL`              | settings `comfy_ip`         | ComfyUI base URL                |
//! | `SHOTDESIGNER_SETTINGS`  | per-user config directory   | Settings file path              |
//! | `RUST_LOG`               | `shotdesigner=info`         | Log filter                      |

mod commands;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use shotdesigner_core::queue::RenderMode;
use shotdesigner_core::shot::MediaKind;

#[derive(Parser)]
#[command(name = "shotdesigner", version)]
#[command(about = "Compose shots and render them with ComfyUI")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Log at debug level.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Settings file to use instead of the per-user one.
    #[arg(long, global = true, env = "SHOTDESIGNER_SETTINGS")]
    settings: Option<PathBuf>,
}

#[derive(Args)]
struct ProjectArg {
    /// Project file.
    #[arg(short, long)]
    project: PathBuf,
}

#[derive(Clone, Copy, ValueEnum)]
enum Kind {
    Image,
    Video,
}

impl From<Kind> for MediaKind {
    fn from(kind: Kind) -> Self {
        match kind {
            Kind::Image => MediaKind::Image,
            Kind::Video => MediaKind::Video,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum Mode {
    PerShot,
    PerWorkflow,
}

impl From<Mode> for RenderMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::PerShot => RenderMode::PerShot,
            Mode::PerWorkflow => RenderMode::PerWorkflow,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum PreviousAsset {
    Image,
    Video,
    /// Remove the binding.
    None,
}

#[derive(Subcommand)]
enum Command {
    /// Create an empty project file
    New {
        project: PathBuf,
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Show shots, workflows and media status
    Status {
        #[command(flatten)]
        project: ProjectArg,
    },

    /// Append a new shot
    AddShot {
        #[command(flatten)]
        project: ProjectArg,
        /// Copy params and workflows from this shot
        #[arg(long)]
        from: Option<usize>,
    },

    RemoveShot {
        #[command(flatten)]
        project: ProjectArg,
        shot: usize,
    },

    MoveShot {
        #[command(flatten)]
        project: ProjectArg,
        from: usize,
        to: usize,
    },

    /// Copy a shot, including its rendered versions
    DuplicateShot {
        #[command(flatten)]
        project: ProjectArg,
        shot: usize,
    },

    /// Create one shot per line of a text file ("-" for stdin)
    ImportLines {
        #[command(flatten)]
        project: ProjectArg,
        file: PathBuf,
        /// Param receiving each line; shots are named after the line when omitted
        #[arg(long)]
        param: Option<String>,
        /// Target the param of this workflow instead of a shot param
        #[arg(long, requires = "param")]
        workflow: Option<String>,
        /// Copy params and workflows from this shot
        #[arg(long)]
        from: Option<usize>,
    },

    /// Attach a workflow JSON file to a shot
    AddWorkflow {
        #[command(flatten)]
        project: ProjectArg,
        #[arg(long)]
        shot: usize,
        workflow: PathBuf,
        /// The workflow produces video
        #[arg(long)]
        video: bool,
    },

    RemoveWorkflow {
        #[command(flatten)]
        project: ProjectArg,
        #[arg(long)]
        shot: usize,
        #[arg(long)]
        workflow: usize,
    },

    /// Enable or disable a workflow
    ToggleWorkflow {
        #[command(flatten)]
        project: ProjectArg,
        #[arg(long)]
        shot: usize,
        #[arg(long)]
        workflow: usize,
    },

    /// Set a param across all or selected shots
    SetParam {
        #[command(flatten)]
        project: ProjectArg,
        #[arg(long)]
        name: String,
        #[arg(long, allow_hyphen_values = true)]
        value: String,
        /// Workflow path; targets a shot param when omitted
        #[arg(long)]
        workflow: Option<String>,
        /// Comma-separated shot indices
        #[arg(long, value_delimiter = ',')]
        shots: Option<Vec<usize>>,
    },

    /// Bind a workflow param to the previous workflow's image or video
    PreviousResult {
        #[command(flatten)]
        project: ProjectArg,
        #[arg(long)]
        shot: usize,
        #[arg(long)]
        workflow: usize,
        #[arg(long)]
        param: String,
        #[arg(long, value_enum)]
        asset: PreviousAsset,
    },

    /// Make an earlier rendered version current
    SelectVersion {
        #[command(flatten)]
        project: ProjectArg,
        #[arg(long)]
        shot: usize,
        #[arg(long, value_enum)]
        kind: Kind,
        version: usize,
    },

    /// Save a workflow's current params as defaults for new assignments
    SaveDefaults {
        #[command(flatten)]
        project: ProjectArg,
        #[arg(long)]
        shot: usize,
        #[arg(long)]
        workflow: usize,
    },

    /// Render selected shots
    Render {
        #[command(flatten)]
        project: ProjectArg,
        /// Comma-separated shot indices; all shots when omitted
        #[arg(long, value_delimiter = ',')]
        shots: Option<Vec<usize>>,
        #[arg(long, value_enum, default_value = "per-shot")]
        mode: Mode,
    },

    /// Render every enabled workflow of every shot, workflow by workflow
    RenderAll {
        #[command(flatten)]
        project: ProjectArg,
    },

    /// Export shot videos with FFmpeg
    Export {
        #[command(flatten)]
        project: ProjectArg,
        /// Output file with --merge, output directory otherwise
        #[arg(long)]
        dest: PathBuf,
        #[arg(long, default_value = "libx264")]
        codec: String,
        /// Concatenate into a single file
        #[arg(long)]
        merge: bool,
        /// Extra FFmpeg arguments
        #[arg(long, allow_hyphen_values = true, default_value = "")]
        args: String,
    },

    /// Concatenate the videos of two or more shots into a new shot
    Merge {
        #[command(flatten)]
        project: ProjectArg,
        #[arg(required = true, num_args = 2..)]
        shots: Vec<usize>,
    },

    /// Continue a shot from the last frame of its latest output
    Extend {
        #[command(flatten)]
        project: ProjectArg,
        #[arg(long)]
        shot: usize,
        /// Param of the last workflow that receives the frame
        #[arg(long)]
        param: String,
    },

    /// Repoint missing media references to files found under a folder
    Relink {
        #[command(flatten)]
        project: ProjectArg,
        #[arg(long)]
        folder: PathBuf,
    },

    /// Generate shots from an LLM workflow
    Wizard(WizardArgs),

    /// Manage a local ComfyUI server
    Comfy {
        #[command(subcommand)]
        command: ComfyCommand,
    },

    /// Show or change settings
    Settings {
        #[command(subcommand)]
        command: SettingsCommand,
    },

    /// List workflow files in the configured directory
    Workflows {
        #[arg(long, value_enum, default_value = "image")]
        kind: Kind,
    },
}

#[derive(Args)]
struct WizardArgs {
    #[command(flatten)]
    project: ProjectArg,
    /// LLM workflow producing text lines
    #[arg(long)]
    llm: PathBuf,
    #[arg(long)]
    prompt: String,
    /// Extra prompt node texts as NODE_ID=TEXT
    #[arg(long = "set", value_parser = parse_node_text)]
    overrides: Vec<(String, String)>,
    #[arg(long, default_value_t = 1)]
    iterations: u32,
    /// Workflow used for iterations after the first
    #[arg(long)]
    iteration_workflow: Option<PathBuf>,
    /// Image workflow to attach to each new shot
    #[arg(long = "image-workflow")]
    image_workflows: Vec<PathBuf>,
    /// Video workflow to attach to each new shot
    #[arg(long = "video-workflow")]
    video_workflows: Vec<PathBuf>,
    /// Workflow param receiving each generated line
    #[arg(long, default_value = "text")]
    param: String,
    /// Print the lines without creating shots
    #[arg(long)]
    dry_run: bool,
}

#[derive(Subcommand)]
enum ComfyCommand {
    /// Launch ComfyUI with the configured python and main.py
    Start,
    /// Query server health and queue depth
    Status,
}

#[derive(Subcommand)]
enum SettingsCommand {
    Show,
    /// Print the settings file location
    Path,
    /// Set a top-level key, e.g. `comfy_ip http://gpu:8188`
    Set { key: String, value: String },
}

fn parse_node_text(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(node, text)| (node.trim().to_string(), text.to_string()))
        .filter(|(node, _)| !node.is_empty())
        .ok_or_else(|| format!("expected NODE_ID=TEXT, got '{raw}'"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "shotdesigner=debug"
    } else {
        "shotdesigner=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let ctx = commands::Context::load(cli.settings)?;
    commands::run(ctx, cli.command).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_render_selection() {
        let cli = Cli::try_parse_from([
            "shotdesigner", "render", "-p", "p.json", "--shots", "0,2", "--mode", "per-workflow",
        ])
        .unwrap();
        match cli.command {
            Command::Render { shots, mode, .. } => {
                assert_eq!(shots, Some(vec![0, 2]));
                assert!(matches!(mode, Mode::PerWorkflow));
            }
            _ => panic!("expected render"),
        }
    }

    #[test]
    fn merge_needs_two_shots() {
        assert!(Cli::try_parse_from(["shotdesigner", "merge", "-p", "p.json", "1"]).is_err());
        assert!(Cli::try_parse_from(["shotdesigner", "merge", "-p", "p.json", "1", "2"]).is_ok());
    }

    #[test]
    fn node_text_pairs() {
        assert_eq!(
            parse_node_text("12=moody noir").unwrap(),
            ("12".to_string(), "moody noir".to_string())
        );
        assert!(parse_node_text("=x").is_err());
        assert!(parse_node_text("nothing").is_err());
    }
}
