//! ComfyUI workflow graphs and parameter injection.
//!
//! A workflow in API format is a JSON object keyed by node ID:
//!
//! ```json
//! {
//!   "3": {
//!     "class_type": "KSampler",
//!     "inputs": { "seed": 42, "model": ["4", 0] },
//!     "_meta": { "title": "KSampler" }
//!   }
//! }
//! ```
//!
//! Input values are either literals or links (`["<node id>", <slot>]`)
//! to another node's output. [`WorkflowGraph::apply_params`] writes shot
//! and workflow params into the literal inputs before submission.

use std::path::Path;

use rand::Rng;
use serde_json::{Map, Value};

use crate::error::CoreError;
use crate::param::{Param, ParamSource};
use crate::types::NodeId;

/// Name of the shot param routed by node title rather than node ID.
pub const POSITIVE_PROMPT_PARAM: &str = "positive prompt";

/// Largest seed written by [`WorkflowGraph::randomize_seeds`].
const MAX_SEED: i64 = (1 << 31) - 1;

/// A reference from one node's input to another node's output slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeLink {
    pub node: NodeId,
    pub slot: u64,
}

impl NodeLink {
    /// Interpret an input value as a link, if it has the `[id, slot]` shape.
    pub fn parse(value: &Value) -> Option<Self> {
        let arr = value.as_array()?;
        if arr.len() != 2 {
            return None;
        }
        let node = arr[0].as_str()?.to_string();
        let slot = arr[1].as_u64()?;
        Some(Self { node, slot })
    }
}

/// A mutable ComfyUI workflow graph.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowGraph {
    nodes: Map<String, Value>,
}

impl WorkflowGraph {
    /// Validate and wrap a workflow JSON value.
    pub fn from_value(value: Value) -> Result<Self, CoreError> {
        let Value::Object(nodes) = value else {
            return Err(CoreError::Validation(
                "Workflow JSON must be an object".to_string(),
            ));
        };
        if nodes.is_empty() {
            return Err(CoreError::Validation(
                "Workflow JSON must contain at least one node".to_string(),
            ));
        }
        if let Some((id, _)) = nodes.iter().find(|(_, node)| !node.is_object()) {
            return Err(CoreError::Validation(format!(
                "Workflow node '{id}' is not an object"
            )));
        }
        Ok(Self { nodes })
    }

    /// Read and validate a workflow file.
    pub fn load(path: &Path) -> Result<Self, CoreError> {
        let raw = std::fs::read_to_string(path).map_err(|e| CoreError::io(path, e))?;
        let value: Value = serde_json::from_str(&raw).map_err(|e| CoreError::json(path, e))?;
        Self::from_value(value)
    }

    /// Node IDs in natural order (numeric IDs compare as numbers).
    pub fn node_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.nodes.keys().map(String::as_str).collect();
        ids.sort_by(|a, b| natural_key(a).cmp(&natural_key(b)));
        ids
    }

    /// The node's `_meta.title`, or an empty string.
    pub fn title(&self, node_id: &str) -> &str {
        self.nodes
            .get(node_id)
            .and_then(|n| n.get("_meta"))
            .and_then(|m| m.get("title"))
            .and_then(Value::as_str)
            .unwrap_or("")
    }

    /// Current value of a node input.
    pub fn input(&self, node_id: &str, key: &str) -> Option<&Value> {
        self.nodes.get(node_id)?.get("inputs")?.get(key)
    }

    /// Overwrite a single node input.
    pub fn set_input(&mut self, node_id: &str, key: &str, value: Value) -> Result<(), CoreError> {
        let inputs = self
            .nodes
            .get_mut(node_id)
            .and_then(|n| n.get_mut("inputs"))
            .and_then(Value::as_object_mut)
            .ok_or_else(|| {
                CoreError::Validation(format!("Workflow node '{node_id}' has no inputs"))
            })?;
        inputs.insert(key.to_string(), value);
        Ok(())
    }

    /// Expose every literal input as a param bound to its node.
    ///
    /// `visible` decides the initial visibility for `(node_id, input)`.
    pub fn expose_params(&self, visible: impl Fn(&str, &str) -> bool) -> Vec<Param> {
        let mut params = Vec::new();
        for node_id in self.node_ids() {
            let title = self.title(node_id);
            let Some(inputs) = self.inputs_of(node_id) else {
                continue;
            };
            for (key, value) in inputs {
                if NodeLink::parse(value).is_some() {
                    continue;
                }
                let mut param = Param::from_input(node_id, title, key, value);
                param.visible = visible(node_id, key);
                params.push(param);
            }
        }
        params
    }

    /// Write shot and workflow params into the graph.
    ///
    /// Shot params are applied first, workflow params second so they win
    /// on conflicts. A param only writes into nodes listed in its
    /// `nodeIDs`, matching input keys case-insensitively. Image params
    /// flagged `useShotImage` take `shot_still` when it is non-empty.
    /// Finally a shot param named `positive prompt` sets the `text` input
    /// of every node whose title mentions "positive prompt".
    ///
    /// Returns the number of inputs written.
    pub fn apply_params(
        &mut self,
        shot_params: &[Param],
        workflow_params: &[Param],
        shot_still: Option<&str>,
    ) -> usize {
        let mut written = 0;
        let ids: Vec<String> = self.nodes.keys().cloned().collect();

        for node_id in &ids {
            let title = self.title(node_id).to_lowercase();
            let Some(inputs) = self
                .nodes
                .get_mut(node_id)
                .and_then(|n| n.get_mut("inputs"))
                .and_then(Value::as_object_mut)
            else {
                continue;
            };

            for params in [shot_params, workflow_params] {
                let keys: Vec<String> = inputs.keys().cloned().collect();
                for key in &keys {
                    for param in params {
                        if !param.targets(node_id) || !param.matches_input(key) {
                            continue;
                        }
                        let value = resolve_value(param, shot_still);
                        tracing::trace!(node_id = %node_id, input = %key, param = %param.name, "Injecting param");
                        inputs.insert(key.clone(), value);
                        written += 1;
                    }
                }
            }

            if title.contains(POSITIVE_PROMPT_PARAM) {
                for param in shot_params
                    .iter()
                    .filter(|p| p.name.eq_ignore_ascii_case(POSITIVE_PROMPT_PARAM))
                {
                    if param.node_ids.is_empty() || param.targets(node_id) {
                        inputs.insert("text".to_string(), param.value.clone());
                        written += 1;
                    }
                }
            }
        }

        written
    }

    /// Node IDs that have a `text` input and whose title contains `fragment`
    /// (case-insensitive).
    pub fn text_inputs_titled(&self, fragment: &str) -> Vec<NodeId> {
        let fragment = fragment.to_lowercase();
        self.node_ids()
            .into_iter()
            .filter(|id| self.input(id, "text").is_some())
            .filter(|id| self.title(id).to_lowercase().contains(&fragment))
            .map(str::to_string)
            .collect()
    }

    /// Replace every `seed` input with a fresh random value.
    pub fn randomize_seeds<R: Rng + ?Sized>(&mut self, rng: &mut R) -> usize {
        let mut count = 0;
        for node in self.nodes.values_mut() {
            if let Some(inputs) = node.get_mut("inputs").and_then(Value::as_object_mut) {
                if let Some(seed) = inputs.get_mut("seed") {
                    *seed = Value::from(rng.random_range(0..=MAX_SEED));
                    count += 1;
                }
            }
        }
        count
    }

    /// Consume the graph, yielding the `prompt` payload for submission.
    pub fn into_value(self) -> Value {
        Value::Object(self.nodes)
    }

    fn inputs_of(&self, node_id: &str) -> Option<&Map<String, Value>> {
        self.nodes.get(node_id)?.get("inputs")?.as_object()
    }
}

fn resolve_value(param: &Param, shot_still: Option<&str>) -> Value {
    match (param.source(), shot_still) {
        (ParamSource::ShotImage, Some(still)) if !still.is_empty() => Value::from(still),
        _ => param.value.clone(),
    }
}

fn natural_key(id: &str) -> (u8, u64, &str) {
    match id.parse::<u64>() {
        Ok(n) => (0, n, id),
        Err(_) => (1, 0, id),
    }
}
