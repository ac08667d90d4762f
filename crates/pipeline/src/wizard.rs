//! Shot wizard: generate shot prompts with an LLM workflow.
//!
//! An LLM workflow (a ComfyUI graph whose output nodes emit `text`) is run
//! with the user's prompt; every non-empty output line becomes a shot.
//! Further iterations run a second workflow that sees the previous
//! iteration's lines as "prompt history".

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use shotdesigner_comfyui::api::{ComfyUIApi, PollConfig};
use shotdesigner_comfyui::history::collect_text_lines;
use shotdesigner_core::naming;
use shotdesigner_core::project::Project;
use shotdesigner_core::settings::Settings;
use shotdesigner_core::shot::{Shot, WorkflowAssignment};
use shotdesigner_core::types::{NodeId, ShotIndex};
use shotdesigner_core::workflow::WorkflowGraph;

use crate::error::PipelineError;

/// Title fragment of the node receiving the user prompt.
pub const INPUT_PROMPT_TITLE: &str = "input prompt";

/// Title fragment of the node receiving the previous iteration's lines.
pub const PROMPT_HISTORY_TITLE: &str = "prompt history";

/// Nodes whose title mentions this are offered for editing.
const EDITABLE_TITLE: &str = "prompt";

/// What to generate.
#[derive(Debug, Clone)]
pub struct WizardRequest {
    pub llm_workflow: PathBuf,
    /// Text for the "input prompt" nodes.
    pub prompt: String,
    /// Replacement `text` for other editable prompt nodes, by node ID.
    pub overrides: BTreeMap<NodeId, String>,
    /// Total number of LLM runs; values above one need `iteration_workflow`.
    pub iterations: u32,
    pub iteration_workflow: Option<PathBuf>,
}

/// A workflow attached to every generated shot.
#[derive(Debug, Clone)]
pub struct WizardWorkflow {
    pub path: PathBuf,
    pub is_video: bool,
}

/// An editable prompt node of an LLM workflow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptNode {
    pub node_id: NodeId,
    pub title: String,
    pub text: String,
}

/// Prompt nodes of `graph` the user may edit before generation.
pub fn editable_prompts(graph: &WorkflowGraph) -> Vec<PromptNode> {
    graph
        .text_inputs_titled(EDITABLE_TITLE)
        .into_iter()
        .map(|node_id| PromptNode {
            title: graph.title(&node_id).to_string(),
            text: graph
                .input(&node_id, "text")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            node_id,
        })
        .collect()
}

pub struct ShotWizard {
    api: ComfyUIApi,
    poll: PollConfig,
}

impl ShotWizard {
    /// LLM runs are polled every 2 s for up to 400 s.
    pub fn new(api: ComfyUIApi) -> Self {
        Self::with_poll(
            api,
            PollConfig {
                interval: Duration::from_secs(2),
                timeout: Duration::from_secs(400),
            },
        )
    }

    pub fn with_poll(api: ComfyUIApi, poll: PollConfig) -> Self {
        Self { api, poll }
    }

    /// Run the LLM workflow (and any iterations) and collect output lines.
    ///
    /// Iterations stop early when the iteration workflow is missing or a
    /// run yields no text; lines gathered so far are kept.
    pub async fn generate_lines(
        &self,
        request: &WizardRequest,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, PipelineError> {
        let mut graph = WorkflowGraph::load(&request.llm_workflow)?;
        for (node_id, text) in &request.overrides {
            graph.set_input(node_id, "text", Value::String(text.clone()))?;
        }
        set_titled_text(&mut graph, INPUT_PROMPT_TITLE, &request.prompt)?;

        let mut lines = self.run_for_lines(graph, cancel).await?;
        tracing::info!(lines = lines.len(), "LLM workflow returned lines");
        let mut previous = lines.join("\n");

        for iteration in 2..=request.iterations {
            let Some(path) = request.iteration_workflow.as_deref() else {
                tracing::warn!(iteration, "No iteration workflow configured, stopping");
                break;
            };
            if previous.is_empty() {
                break;
            }

            let graph = iteration_graph(path, &previous, &request.prompt)?;
            let batch = self.run_for_lines(graph, cancel).await?;
            tracing::info!(iteration, lines = batch.len(), "Iteration returned lines");
            if batch.is_empty() {
                break;
            }
            previous = batch.join("\n");
            lines.extend(batch);
        }

        Ok(lines)
    }

    async fn run_for_lines(
        &self,
        graph: WorkflowGraph,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, PipelineError> {
        let client_id = uuid::Uuid::new_v4().to_string();
        let submitted = self.api.submit_workflow(&graph.into_value(), &client_id).await?;
        let history = self
            .api
            .wait_for_history(&submitted.prompt_id, &self.poll, cancel)
            .await?;
        Ok(collect_text_lines(&history, &submitted.prompt_id))
    }
}

/// Load the iteration workflow with history, prompt and fresh seeds.
fn iteration_graph(path: &Path, history: &str, prompt: &str) -> Result<WorkflowGraph, PipelineError> {
    let mut graph = WorkflowGraph::load(path)?;
    set_titled_text(&mut graph, PROMPT_HISTORY_TITLE, history)?;
    set_titled_text(&mut graph, INPUT_PROMPT_TITLE, prompt)?;
    graph.randomize_seeds(&mut rand::rng());
    Ok(graph)
}

fn set_titled_text(graph: &mut WorkflowGraph, title: &str, text: &str) -> Result<usize, PipelineError> {
    let nodes = graph.text_inputs_titled(title);
    for node_id in &nodes {
        graph.set_input(node_id, "text", Value::String(text.to_string()))?;
    }
    Ok(nodes.len())
}

/// Append one shot per line, each carrying `workflows` with saved
/// defaults merged and `target_param` set to the line.
///
/// Returns the indices of the new shots.
pub fn shots_from_lines(
    project: &mut Project,
    lines: &[String],
    workflows: &[WizardWorkflow],
    target_param: &str,
    settings: &Settings,
) -> Result<Vec<ShotIndex>, PipelineError> {
    let mut graphs = Vec::with_capacity(workflows.len());
    for wf in workflows {
        graphs.push((wf, WorkflowGraph::load(&wf.path)?));
    }

    let mut created = Vec::with_capacity(lines.len());
    for line in lines {
        let mut shot = Shot::new(naming::shot_name(project.shots.len()));
        for (wf, graph) in &graphs {
            let key = wf.path.display().to_string();
            let mut assignment = WorkflowAssignment::from_graph(
                key.clone(),
                graph,
                wf.is_video,
                settings.workflow_defaults_for(&key),
                |node, input| settings.param_visible(&key, node, input),
            );
            for param in assignment
                .parameters
                .params
                .iter_mut()
                .filter(|p| p.name == target_param)
            {
                param.value = Value::String(line.clone());
            }
            shot.workflows.push(assignment);
        }
        project.shots.push(shot);
        created.push(project.shots.len() - 1);
    }

    tracing::info!(shots = created.len(), workflows = workflows.len(), "Wizard shots created");
    Ok(created)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shotdesigner_core::param::{Param, ParamKind};
    use shotdesigner_core::shot::WorkflowParams;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn llm_graph() -> Value {
        json!({
            "1": {"class_type": "Text", "inputs": {"text": ""}, "_meta": {"title": "Input Prompt"}},
            "2": {"class_type": "Text", "inputs": {"text": "cinematic"}, "_meta": {"title": "Style Prompt"}},
            "3": {"class_type": "OllamaGenerate", "inputs": {"seed": 1, "prompt": ["1", 0]}},
            "7": {"class_type": "ShowText", "inputs": {"text": ["3", 0]}, "_meta": {"title": "Output"}}
        })
    }

    fn iter_graph() -> Value {
        json!({
            "1": {"class_type": "Text", "inputs": {"text": ""}, "_meta": {"title": "Input Prompt"}},
            "5": {"class_type": "Text", "inputs": {"text": ""}, "_meta": {"title": "Prompt History"}},
            "3": {"class_type": "OllamaGenerate", "inputs": {"seed": 1, "prompt": ["1", 0]}}
        })
    }

    fn write(dir: &Path, name: &str, value: &Value) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, value.to_string()).unwrap();
        path
    }

    #[test]
    fn editable_prompts_lists_prompt_nodes() {
        let graph = WorkflowGraph::from_value(llm_graph()).unwrap();
        let nodes = editable_prompts(&graph);
        let ids: Vec<&str> = nodes.iter().map(|n| n.node_id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2"]);
        assert_eq!(nodes[1].text, "cinematic");
        assert_eq!(nodes[1].title, "Style Prompt");
    }

    #[test]
    fn iteration_graph_fills_history_and_reseeds() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "iter.json", &iter_graph());
        let graph = iteration_graph(&path, "a\nb", "heist").unwrap();
        assert_eq!(graph.input("5", "text"), Some(&json!("a\nb")));
        assert_eq!(graph.input("1", "text"), Some(&json!("heist")));
        let seed = graph.input("3", "seed").and_then(Value::as_i64).unwrap();
        assert!((0..=i64::from(i32::MAX)).contains(&seed));
    }

    #[tokio::test]
    async fn generates_lines_over_iterations() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/prompt"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"prompt_id": "p1", "number": 0})))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/prompt"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"prompt_id": "p2", "number": 1})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/history/p1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "p1": {"outputs": {"7": {"text": ["line one\n\n  line two  \n"]}}}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/history/p2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "p2": {"outputs": {"7": {"text": ["line three"]}}}
            })))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let request = WizardRequest {
            llm_workflow: write(dir.path(), "llm.json", &llm_graph()),
            prompt: "a heist in Lisbon".into(),
            overrides: BTreeMap::from([("2".to_string(), "noir".to_string())]),
            iterations: 2,
            iteration_workflow: Some(write(dir.path(), "iter.json", &iter_graph())),
        };
        let wizard = ShotWizard::with_poll(
            ComfyUIApi::new(server.uri()),
            PollConfig {
                interval: Duration::from_millis(10),
                timeout: Duration::from_secs(2),
            },
        );

        let lines = wizard
            .generate_lines(&request, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(lines, vec!["line one", "line two", "line three"]);

        let requests = server.received_requests().await.unwrap();
        let submits: Vec<Value> = requests
            .iter()
            .filter(|r| r.url.path() == "/prompt")
            .map(|r| serde_json::from_slice(&r.body).unwrap())
            .collect();
        assert_eq!(submits.len(), 2);
        assert_eq!(submits[0]["prompt"]["1"]["inputs"]["text"], json!("a heist in Lisbon"));
        assert_eq!(submits[0]["prompt"]["2"]["inputs"]["text"], json!("noir"));
        assert_eq!(submits[1]["prompt"]["5"]["inputs"]["text"], json!("line one\nline two"));
        assert_eq!(submits[1]["prompt"]["1"]["inputs"]["text"], json!("a heist in Lisbon"));
    }

    #[test]
    fn shots_from_lines_sets_target_param() {
        let dir = tempfile::tempdir().unwrap();
        let graph = json!({
            "6": {"class_type": "CLIPTextEncode", "inputs": {"text": "placeholder"}, "_meta": {"title": "Positive"}},
            "3": {"class_type": "KSampler", "inputs": {"steps": 20}}
        });
        let wf_path = write(dir.path(), "img.json", &graph);
        let key = wf_path.display().to_string();

        let mut settings = Settings::default();
        settings.save_workflow_defaults(
            &key,
            WorkflowParams {
                params: vec![Param::new("steps", ParamKind::Int, json!(35)).with_nodes(["3"])],
                run_count: None,
            },
        );
        settings.set_param_visibility(&key, "6", "text", true);

        let mut project = Project::new();
        project.shots.push(Shot::new("Shot 1"));
        let lines = vec!["a red car".to_string(), "a blue boat".to_string()];
        let created = shots_from_lines(
            &mut project,
            &lines,
            &[WizardWorkflow { path: wf_path, is_video: false }],
            "text",
            &settings,
        )
        .unwrap();

        assert_eq!(created, vec![1, 2]);
        assert_eq!(project.shots[2].name, "Shot 3");
        let params = &project.shots[2].workflows[0].parameters;
        assert_eq!(params.find("text").unwrap().value, json!("a blue boat"));
        assert!(params.find("text").unwrap().visible);
        assert_eq!(params.find("steps").unwrap().value, json!(35));
    }

    #[test]
    fn shots_from_lines_fails_on_missing_workflow() {
        let mut project = Project::new();
        let result = shots_from_lines(
            &mut project,
            &["x".to_string()],
            &[WizardWorkflow { path: PathBuf::from("/nonexistent.json"), is_video: true }],
            "text",
            &Settings::default(),
        );
        assert!(result.is_err());
        assert!(project.shots.is_empty());
    }
}
