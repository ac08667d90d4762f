//! Output extraction from ComfyUI history records.
//!
//! A history response looks like:
//!
//! ```json
//! {
//!   "<prompt_id>": {
//!     "outputs": {
//!       "9": { "images": [{ "filename": "x.png", "subfolder": "", "type": "output" }] },
//!       "12": { "gifs": [{ "filename": "x.mp4", "subfolder": "", "type": "output" }] },
//!       "15": { "text": ["line one\nline two"] }
//!     }
//!   }
//! }
//! ```

use serde::Deserialize;
use serde_json::Value;

/// A file reference inside a node output.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OutputFile {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(rename = "type", default)]
    pub kind: String,
}

impl OutputFile {
    /// Path relative to the ComfyUI output root.
    pub fn relative_path(&self) -> String {
        if self.subfolder.is_empty() {
            self.filename.clone()
        } else {
            format!("{}/{}", self.subfolder, self.filename)
        }
    }

    /// The `type` query value for `/view`, defaulting to `output`.
    pub fn kind_or_output(&self) -> &str {
        if self.kind.is_empty() {
            "output"
        } else {
            &self.kind
        }
    }

    /// File extension including the leading dot, or an empty string.
    pub fn extension(&self) -> String {
        std::path::Path::new(&self.filename)
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default()
    }
}

/// The main artifact of a finished prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimaryOutput {
    pub file: OutputFile,
    /// Reported under `gifs` or `videos` rather than `images`.
    pub is_video: bool,
}

/// Keys under which ComfyUI nodes report files, with their media kind.
const FILE_KEYS: [(&str, bool); 3] = [("images", false), ("gifs", true), ("videos", true)];

/// The first file produced by the prompt.
///
/// Nodes are visited in ascending ID order; within a node `images` are
/// checked before `gifs` and `videos`.
pub fn find_primary_output(history: &Value, prompt_id: &str) -> Option<PrimaryOutput> {
    let outputs = prompt_outputs(history, prompt_id)?;
    for (_, output) in sorted_nodes(outputs) {
        for (key, is_video) in FILE_KEYS {
            let Some(files) = output.get(key).and_then(Value::as_array) else {
                continue;
            };
            let found = files
                .iter()
                .filter_map(|f| serde_json::from_value::<OutputFile>(f.clone()).ok())
                .find(|f| !f.filename.is_empty());
            if let Some(file) = found {
                return Some(PrimaryOutput { file, is_video });
            }
        }
    }
    None
}

/// Every `text` output of the prompt, split into trimmed non-empty lines.
pub fn collect_text_lines(history: &Value, prompt_id: &str) -> Vec<String> {
    let Some(outputs) = prompt_outputs(history, prompt_id) else {
        return Vec::new();
    };

    let mut lines = Vec::new();
    for (_, output) in sorted_nodes(outputs) {
        let chunks: Vec<&str> = match output.get("text") {
            Some(Value::Array(items)) => items.iter().filter_map(Value::as_str).collect(),
            Some(Value::String(s)) => vec![s.as_str()],
            _ => continue,
        };
        lines.extend(
            chunks
                .into_iter()
                .flat_map(str::lines)
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string),
        );
    }
    lines
}

/// `outputs` of the prompt's record, falling back to the only record
/// present when the server keyed it differently.
fn prompt_outputs<'a>(history: &'a Value, prompt_id: &str) -> Option<&'a serde_json::Map<String, Value>> {
    let record = history.get(prompt_id).or_else(|| {
        let map = history.as_object()?;
        (map.len() == 1).then(|| map.values().next()).flatten()
    })?;
    record.get("outputs")?.as_object()
}

fn sorted_nodes(outputs: &serde_json::Map<String, Value>) -> Vec<(&String, &Value)> {
    let mut nodes: Vec<(&String, &Value)> = outputs.iter().collect();
    nodes.sort_by_key(|(id, _)| (id.parse::<u64>().unwrap_or(u64::MAX), id.as_str()));
    nodes
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn finds_first_image_in_node_order() {
        let history = json!({
            "p": {"outputs": {
                "10": {"images": [{"filename": "late.png", "subfolder": "", "type": "output"}]},
                "9": {"images": [{"filename": "early.png", "subfolder": "sub", "type": "output"}]}
            }}
        });
        let out = find_primary_output(&history, "p").unwrap();
        assert_eq!(out.file.filename, "early.png");
        assert_eq!(out.file.relative_path(), "sub/early.png");
        assert!(!out.is_video);
    }

    #[test]
    fn gifs_are_video() {
        let history = json!({
            "p": {"outputs": {
                "3": {"text": ["hi"]},
                "5": {"gifs": [{"filename": "clip.mp4", "subfolder": "", "type": "output"}]}
            }}
        });
        let out = find_primary_output(&history, "p").unwrap();
        assert!(out.is_video);
        assert_eq!(out.file.extension(), ".mp4");
        assert_eq!(out.file.kind_or_output(), "output");
    }

    #[test]
    fn missing_outputs() {
        assert!(find_primary_output(&json!({}), "p").is_none());
        assert!(find_primary_output(&json!({"p": {"outputs": {}}}), "p").is_none());
        assert!(find_primary_output(&json!({"p": {"outputs": {"1": {"images": [{"filename": ""}]}}}}), "p").is_none());
    }

    #[test]
    fn single_record_fallback() {
        let history = json!({"other": {"outputs": {"1": {"images": [{"filename": "a.png"}]}}}});
        assert!(find_primary_output(&history, "p").is_some());
    }

    #[test]
    fn text_lines_are_split_and_trimmed() {
        let history = json!({
            "p": {"outputs": {
                "2": {"text": "  single  "},
                "1": {"text": ["first\n\n  second ", "third"]},
                "3": {"images": []}
            }}
        });
        assert_eq!(
            collect_text_lines(&history, "p"),
            vec!["first", "second", "third", "single"]
        );
        assert!(collect_text_lines(&json!({}), "p").is_empty());
    }
}
