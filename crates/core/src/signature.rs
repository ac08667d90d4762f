//! Render signatures.
//!
//! A signature hashes everything that influences a render so the UI (and
//! the render engine) can tell whether a stored output is still current.

use serde_json::{json, Value};

use crate::hashing::{canonical_json, sha256_hex};
use crate::shot::{MediaKind, Shot};

/// Signature of a single workflow run on a shot.
///
/// Covers the shot params, the workflow params, the workflow path and its
/// media kind. Returns `None` when the workflow index is out of range.
pub fn workflow_signature(shot: &Shot, workflow_index: usize) -> Option<String> {
    let workflow = shot.workflows.get(workflow_index)?;
    let data = json!({
        "shotParams": shot.params,
        "workflowParams": workflow.parameters,
        "workflowPath": workflow.path,
        "isVideo": workflow.is_video,
    });
    Some(sha256_hex(canonical_json(&data).as_bytes()))
}

/// Signature of a shot's still or video as a whole.
///
/// Covers every workflow of the given kind plus the name, type and value
/// of every shot param, sorted so reordering shot params does not change
/// the result.
pub fn render_signature(shot: &Shot, kind: MediaKind) -> String {
    let mut entries: Vec<(String, Value)> = Vec::new();

    for wf in shot
        .workflows
        .iter()
        .filter(|wf| wf.is_video == kind.is_video())
    {
        entries.push((
            wf.path.clone(),
            json!({
                "workflow_path": wf.path,
                "enabled": wf.enabled,
                "parameters": wf.parameters,
            }),
        ));
    }
    for p in &shot.params {
        entries.push((
            p.name.clone(),
            json!({ "name": p.name, "type": p.kind, "value": p.value }),
        ));
    }

    // Stable sort keeps duplicate keys in insertion order.
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    let data = json!({
        "shotParams": entries.into_iter().map(|(_, v)| v).collect::<Vec<_>>(),
    });
    let signature = sha256_hex(canonical_json(&data).as_bytes());
    tracing::debug!(shot = %shot.name, kind = ?kind, %signature, "Computed render signature");
    signature
}
