//! Structured configuration documents
//!
//! A configuration document is a JSON-like tree rooted at a map. Layers
//! (common, per-application, per-instance) are composed with a deep merge,
//! property references are expanded through every key and value, and each
//! consumer kind retains only its recognized top-level sections.

mod merge;
mod views;

pub use views::{ContainerView, PlatformProcessView, PortMapping, RemoteDebug, UdpLog, VolumeMapping};

use serde_json::{Map, Value};

use crate::properties::{PropertyError, PropertyStore};

/// Default launch-script filename when a document does not name one
pub const DEFAULT_START_SCRIPT: &str = "start_app.sh";

/// Errors raised while shaping configuration documents
#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error("configuration root must be a map, got {found}")]
    RootNotMap { found: &'static str },

    #[error("malformed configuration at '{path}': {reason}")]
    Malformed { path: String, reason: String },
}

/// The consumer kinds a document can be resolved for.
///
/// Each kind declares the top-level sections it recognizes; anything else
/// is discarded after merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigKind {
    PlatformProcess,
    Container,
}

impl ConfigKind {
    /// Recognized top-level keys for this kind
    pub fn known_keys(self) -> &'static [&'static str] {
        match self {
            ConfigKind::PlatformProcess => &["vmArgs", "appName", "startScript"],
            ConfigKind::Container => &["dockerContainer", "startScript"],
        }
    }

    /// Kind name used in logs and error messages
    pub fn name(self) -> &'static str {
        match self {
            ConfigKind::PlatformProcess => "platform-process",
            ConfigKind::Container => "container",
        }
    }
}

/// A nested map/sequence/scalar document, always rooted at a map
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigDocument {
    root: Map<String, Value>,
}

impl ConfigDocument {
    /// Create an empty document
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap a parsed JSON value, which must be a map at the root
    pub fn from_value(value: Value) -> Result<Self, DocumentError> {
        match value {
            Value::Object(root) => Ok(Self { root }),
            other => Err(DocumentError::RootNotMap {
                found: type_name(&other),
            }),
        }
    }

    /// Look up a top-level section
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.root.get(key)
    }

    /// Walk a dot-separated path into the tree
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let mut current = self.root.get(parts.next()?)?;
        for part in parts {
            current = current.get(part)?;
        }
        Some(current)
    }

    /// Merge another document layer over this one, producing a new document.
    ///
    /// For a key present in both trees: maps merge recursively, sequences
    /// concatenate (incoming appended), and a scalar slot takes the
    /// incoming value's text form. A shape change (scalar vs. container)
    /// replaces the slot wholesale.
    pub fn merge_with(&self, other: &Value) -> Self {
        let mut root = self.root.clone();
        if let Value::Object(overlay) = other {
            merge::merge_maps(&mut root, overlay);
        }
        Self { root }
    }

    /// Drop top-level keys the given kind does not recognize.
    ///
    /// Unknown keys are tolerated for forward compatibility but each drop
    /// is logged.
    pub fn retain_known_keys(mut self, kind: ConfigKind) -> Self {
        let known = kind.known_keys();
        self.root.retain(|key, _| {
            let keep = known.contains(&key.as_str());
            if !keep {
                tracing::warn!(
                    key = %key,
                    kind = kind.name(),
                    "dropping unrecognized top-level configuration key"
                );
            }
            keep
        });
        self
    }

    /// Expand property references through every key and value, producing a
    /// new document.
    ///
    /// A key whose expansion differs from its template is renamed in the
    /// result. Values are expanded recursively through maps and sequences;
    /// non-string scalars pass through unchanged.
    pub fn apply_properties(&self, properties: &PropertyStore) -> Result<Self, PropertyError> {
        let mut root = Map::new();
        for (key, value) in &self.root {
            root.insert(
                properties.resolve(key)?,
                substitute_value(value, properties)?,
            );
        }
        Ok(Self { root })
    }

    /// The launch-script filename for this document
    pub fn start_script_filename(&self) -> &str {
        self.root
            .get("startScript")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_START_SCRIPT)
    }

    /// The application name section, when present
    pub fn app_name(&self) -> Option<&str> {
        self.root.get("appName").and_then(Value::as_str)
    }

    /// View this document as platform-process configuration
    pub fn platform_process(&self) -> PlatformProcessView<'_> {
        PlatformProcessView::new(self)
    }

    /// View this document as container configuration
    pub fn container(&self) -> ContainerView<'_> {
        ContainerView::new(self)
    }
}

fn substitute_value(value: &Value, properties: &PropertyStore) -> Result<Value, PropertyError> {
    match value {
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, val) in map {
                out.insert(properties.resolve(key)?, substitute_value(val, properties)?);
            }
            Ok(Value::Object(out))
        }
        Value::Array(items) => {
            let out = items
                .iter()
                .map(|item| substitute_value(item, properties))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Value::Array(out))
        }
        Value::String(text) => Ok(Value::String(properties.resolve(text)?)),
        other => Ok(other.clone()),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "sequence",
        Value::Object(_) => "map",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::properties::SavePolicy;
    use serde_json::json;

    fn doc(value: Value) -> ConfigDocument {
        ConfigDocument::from_value(value).unwrap()
    }

    #[test]
    fn test_root_must_be_map() {
        let err = ConfigDocument::from_value(json!([1, 2])).unwrap_err();
        assert!(matches!(err, DocumentError::RootNotMap { found: "sequence" }));
    }

    #[test]
    fn test_scalar_override_preserves_siblings() {
        let base = doc(json!({"a": {"max": "2g", "min": "1g"}}));
        let merged = base.merge_with(&json!({"a": {"max": "3g"}}));

        assert_eq!(merged, doc(json!({"a": {"max": "3g", "min": "1g"}})));
    }

    #[test]
    fn test_scalar_override_stringifies_incoming() {
        let base = doc(json!({"port": "1501"}));
        let merged = base.merge_with(&json!({"port": 1601}));

        assert_eq!(merged.get("port"), Some(&json!("1601")));
    }

    #[test]
    fn test_sequence_merge_concatenates() {
        let base = doc(json!({"list": [1, 2]}));
        let merged = base.merge_with(&json!({"list": [3]}));

        assert_eq!(merged.get("list"), Some(&json!([1, 2, 3])));
    }

    #[test]
    fn test_new_key_insertion() {
        let base = doc(json!({}));
        let merged = base.merge_with(&json!({"a": {"b": 1}}));

        assert_eq!(merged, doc(json!({"a": {"b": 1}})));
    }

    #[test]
    fn test_empty_overlay_is_identity() {
        let base = doc(json!({"a": {"b": [1, 2]}, "c": "x"}));
        let merged = base.merge_with(&json!({}));

        assert_eq!(merged, base);
    }

    #[test]
    fn test_merge_does_not_mutate_receiver() {
        let base = doc(json!({"a": "1"}));
        let _ = base.merge_with(&json!({"a": "2"}));

        assert_eq!(base.get("a"), Some(&json!("1")));
    }

    #[test]
    fn test_shape_change_replaces_wholesale() {
        let base = doc(json!({"a": "scalar"}));
        let merged = base.merge_with(&json!({"a": {"b": 1}}));

        assert_eq!(merged.get("a"), Some(&json!({"b": 1})));
    }

    #[test]
    fn test_retain_known_keys() {
        let merged = doc(json!({
            "vmArgs": {},
            "appName": "app",
            "dockerContainer": {},
            "stray": true
        }));

        let platform = merged.clone().retain_known_keys(ConfigKind::PlatformProcess);
        assert!(platform.get("vmArgs").is_some());
        assert!(platform.get("appName").is_some());
        assert!(platform.get("dockerContainer").is_none());
        assert!(platform.get("stray").is_none());

        let container = merged.retain_known_keys(ConfigKind::Container);
        assert!(container.get("dockerContainer").is_some());
        assert!(container.get("vmArgs").is_none());
    }

    #[test]
    fn test_apply_properties_to_values() {
        let mut properties = PropertyStore::new();
        properties.save("STRIPE", "OMS01", SavePolicy::UPSERT).unwrap();

        let document = doc(json!({
            "appName": "${STRIPE}-agent",
            "vmArgs": {"baseArgs": ["-Dname=${STRIPE}"], "textAdmin": 1501}
        }));
        let resolved = document.apply_properties(&properties).unwrap();

        assert_eq!(resolved.get("appName"), Some(&json!("OMS01-agent")));
        assert_eq!(
            resolved.get_path("vmArgs.baseArgs"),
            Some(&json!(["-Dname=OMS01"]))
        );
        assert_eq!(resolved.get_path("vmArgs.textAdmin"), Some(&json!(1501)));
    }

    #[test]
    fn test_apply_properties_renames_keys() {
        let mut properties = PropertyStore::new();
        properties.save("ENVIRONMENT", "dev", SavePolicy::UPSERT).unwrap();

        let document = doc(json!({"vmArgs": {"platform": {"${ENVIRONMENT}.path": "logs"}}}));
        let resolved = document.apply_properties(&properties).unwrap();

        assert_eq!(
            resolved.get_path("vmArgs.platform.dev.path"),
            Some(&json!("logs"))
        );
    }

    #[test]
    fn test_apply_properties_unresolved_fails() {
        let document = doc(json!({"appName": "${MISSING}"}));
        let err = document.apply_properties(&PropertyStore::new()).unwrap_err();

        assert!(matches!(err, PropertyError::UnresolvedReference { .. }));
    }

    #[test]
    fn test_start_script_default() {
        assert_eq!(doc(json!({})).start_script_filename(), DEFAULT_START_SCRIPT);
        assert_eq!(
            doc(json!({"startScript": "launch.sh"})).start_script_filename(),
            "launch.sh"
        );
    }
}
