//! Named parameters bound to ComfyUI node inputs.
//!
//! A [`Param`] carries a value plus the node IDs whose inputs it writes.
//! Shot-level params and workflow-level params share this shape; the
//! serialized form keeps the camelCase keys used by project files.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CoreError;
use crate::types::NodeId;

/// Placeholder value for a param waiting on the previous workflow's image.
pub const AWAITING_PREVIOUS_IMAGE: &str = "(Awaiting previous workflow image)";

/// Placeholder value for a param waiting on the previous workflow's video.
pub const AWAITING_PREVIOUS_VIDEO: &str = "(Awaiting previous workflow video)";

/// Dynamic override type written for previous-result bindings.
pub const OVERRIDE_TYPE_PREVIOUS: &str = "previous";

/// Value type of a parameter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    Int,
    Float,
    #[default]
    String,
    Image,
    Video,
}

impl ParamKind {
    /// Infer the kind of a raw workflow input value.
    ///
    /// Integers map to `Int`, other numbers to `Float`, everything else
    /// (strings, booleans, lists) is edited as a `String`.
    pub fn infer(value: &Value) -> Self {
        match value {
            Value::Number(n) if n.is_i64() || n.is_u64() => ParamKind::Int,
            Value::Number(_) => ParamKind::Float,
            _ => ParamKind::String,
        }
    }
}

/// Which rendered asset a dynamic param pulls its value from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetKind {
    Image,
    Video,
}

impl AssetKind {
    pub fn from_is_video(is_video: bool) -> Self {
        if is_video {
            AssetKind::Video
        } else {
            AssetKind::Image
        }
    }

    pub fn is_video(self) -> bool {
        self == AssetKind::Video
    }
}

/// Persisted description of a dynamic binding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DynamicOverride {
    #[serde(rename = "type", default)]
    pub kind: String,
    pub asset_type: AssetKind,
}

/// Where a param's value comes from at dispatch time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamSource {
    /// The stored value is used as is.
    Literal,
    /// The shot's current still, falling back to the stored value.
    ShotImage,
    /// The image produced by the previous workflow of the same shot.
    PreviousImage,
    /// The video produced by the previous workflow of the same shot.
    PreviousVideo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Param {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: ParamKind,
    #[serde(default)]
    pub value: Value,
    #[serde(rename = "nodeIDs", default)]
    pub node_ids: Vec<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default)]
    pub visible: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub node_meta_title: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub use_shot_image: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub use_prev_result_image: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub use_prev_result_video: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dynamic_overrides: Option<DynamicOverride>,
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl Param {
    /// A plain string param not bound to any node.
    pub fn new(name: impl Into<String>, kind: ParamKind, value: Value) -> Self {
        Self {
            name: name.into(),
            kind,
            value,
            node_ids: Vec::new(),
            display_name: None,
            visible: false,
            node_meta_title: String::new(),
            use_shot_image: false,
            use_prev_result_image: false,
            use_prev_result_video: false,
            dynamic_overrides: None,
        }
    }

    /// Expose a single node input as a param bound to that node.
    pub fn from_input(node_id: &str, node_title: &str, key: &str, value: &Value) -> Self {
        let mut param = Self::new(key, ParamKind::infer(value), value.clone());
        param.node_ids = vec![node_id.to_string()];
        param.display_name = Some(key.to_string());
        param.node_meta_title = node_title.to_string();
        param
    }

    /// Builder: bind the param to the given node IDs.
    pub fn with_nodes<I, S>(mut self, node_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<NodeId>,
    {
        self.node_ids = node_ids.into_iter().map(Into::into).collect();
        self
    }

    /// Human-facing label: the display name when set, else the name.
    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.name)
    }

    /// Case-insensitive comparison of the param name with an input key.
    pub fn matches_input(&self, key: &str) -> bool {
        self.name.eq_ignore_ascii_case(key)
    }

    /// Whether this param writes into the given node.
    pub fn targets(&self, node_id: &str) -> bool {
        self.node_ids.iter().any(|id| id == node_id)
    }

    /// Derive the dispatch-time source from the persisted flags.
    pub fn source(&self) -> ParamSource {
        if self.use_prev_result_image {
            ParamSource::PreviousImage
        } else if self.use_prev_result_video {
            ParamSource::PreviousVideo
        } else if self.use_shot_image && self.kind == ParamKind::Image {
            ParamSource::ShotImage
        } else {
            ParamSource::Literal
        }
    }

    /// Whether the value is filled in from a previous render at dispatch.
    pub fn is_dynamic(&self) -> bool {
        matches!(
            self.source(),
            ParamSource::PreviousImage | ParamSource::PreviousVideo
        )
    }

    /// Flag the param to receive the previous workflow's result.
    ///
    /// Only string params can be rebound this way.
    pub fn set_previous_result(&mut self, asset: AssetKind) -> Result<(), CoreError> {
        if self.kind != ParamKind::String {
            return Err(CoreError::Validation(format!(
                "Param '{}' is not a string param and cannot take a previous result",
                self.name
            )));
        }
        self.use_prev_result_image = asset == AssetKind::Image;
        self.use_prev_result_video = asset == AssetKind::Video;
        self.value = Value::String(
            match asset {
                AssetKind::Image => AWAITING_PREVIOUS_IMAGE,
                AssetKind::Video => AWAITING_PREVIOUS_VIDEO,
            }
            .to_string(),
        );
        self.dynamic_overrides = Some(DynamicOverride {
            kind: OVERRIDE_TYPE_PREVIOUS.to_string(),
            asset_type: asset,
        });
        Ok(())
    }

    /// Drop any previous-result binding, keeping the current value.
    pub fn clear_dynamic_override(&mut self) {
        self.use_prev_result_image = false;
        self.use_prev_result_video = false;
        self.dynamic_overrides = None;
    }

    /// Restore the flags implied by a saved dynamic override.
    ///
    /// Non-string params keep their literal value.
    pub fn apply_dynamic_override(&mut self, over: &DynamicOverride) {
        if self.set_previous_result(over.asset_type).is_ok() {
            self.dynamic_overrides = Some(over.clone());
        }
    }

    /// Parse a user-supplied string into a value of this param's kind.
    pub fn parse_value(&self, raw: &str) -> Result<Value, CoreError> {
        match self.kind {
            ParamKind::Int => raw.trim().parse::<i64>().map(Value::from).map_err(|e| {
                CoreError::Validation(format!("'{raw}' is not an integer for '{}': {e}", self.name))
            }),
            ParamKind::Float => raw.trim().parse::<f64>().map(Value::from).map_err(|e| {
                CoreError::Validation(format!("'{raw}' is not a number for '{}': {e}", self.name))
            }),
            ParamKind::String | ParamKind::Image | ParamKind::Video => {
                Ok(Value::String(raw.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    #[test]
    fn infer_kinds() {
        assert_eq!(ParamKind::infer(&json!(42)), ParamKind::Int);
        assert_eq!(ParamKind::infer(&json!(7.5)), ParamKind::Float);
        assert_eq!(ParamKind::infer(&json!("hi")), ParamKind::String);
        assert_eq!(ParamKind::infer(&json!(true)), ParamKind::String);
    }

    #[test]
    fn from_input_binds_node() {
        let p = Param::from_input("3", "KSampler", "seed", &json!(5));
        assert_eq!(p.kind, ParamKind::Int);
        assert!(p.targets("3"));
        assert!(!p.targets("4"));
        assert_eq!(p.label(), "seed");
        assert_eq!(p.node_meta_title, "KSampler");
    }

    #[test]
    fn matches_input_ignores_case() {
        let p = Param::new("Seed", ParamKind::Int, json!(1));
        assert!(p.matches_input("seed"));
        assert!(!p.matches_input("steps"));
    }

    #[test]
    fn previous_result_sets_placeholder() {
        let mut p = Param::new("image", ParamKind::String, json!("a.png"));
        p.set_previous_result(AssetKind::Video).unwrap();
        assert_eq!(p.source(), ParamSource::PreviousVideo);
        assert_eq!(p.value, json!(AWAITING_PREVIOUS_VIDEO));
        assert!(p.is_dynamic());

        p.clear_dynamic_override();
        assert_eq!(p.source(), ParamSource::Literal);
        assert!(p.dynamic_overrides.is_none());
    }

    #[test]
    fn previous_result_rejected_for_numbers() {
        let mut p = Param::new("steps", ParamKind::Int, json!(20));
        assert_matches!(
            p.set_previous_result(AssetKind::Image),
            Err(CoreError::Validation(_))
        );
    }

    #[test]
    fn shot_image_only_applies_to_image_params() {
        let mut p = Param::new("Image", ParamKind::Image, json!(""));
        p.use_shot_image = true;
        assert_eq!(p.source(), ParamSource::ShotImage);
        p.kind = ParamKind::String;
        assert_eq!(p.source(), ParamSource::Literal);
    }

    #[test]
    fn deserializes_legacy_shape() {
        let raw = json!({
            "type": "image",
            "name": "Image",
            "value": "",
            "useShotImage": true,
            "nodeIDs": ["1"]
        });
        let p: Param = serde_json::from_value(raw).unwrap();
        assert_eq!(p.kind, ParamKind::Image);
        assert!(p.use_shot_image);
        assert_eq!(p.node_ids, vec!["1"]);
    }

    #[test]
    fn serializes_camel_case_without_unset_flags() {
        let p = Param::from_input("7", "Positive", "text", &json!("a cat"));
        let v = serde_json::to_value(&p).unwrap();
        assert_eq!(v["nodeIDs"], json!(["7"]));
        assert_eq!(v["displayName"], json!("text"));
        assert!(v.get("usePrevResultImage").is_none());
    }

    #[test]
    fn parse_value_by_kind() {
        let p = Param::new("steps", ParamKind::Int, json!(1));
        assert_eq!(p.parse_value("30").unwrap(), json!(30));
        assert!(p.parse_value("thirty").is_err());
        let f = Param::new("cfg", ParamKind::Float, json!(1.0));
        assert_eq!(f.parse_value("7.5").unwrap(), json!(7.5));
        let s = Param::new("text", ParamKind::String, json!(""));
        assert_eq!(s.parse_value("hello").unwrap(), json!("hello"));
    }
}
