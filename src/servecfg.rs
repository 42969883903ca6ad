use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::Serialize;
use serde_json::{Map, Value};

pub const KIND_GPU: &str = "KIND_GPU";
pub const KIND_CPU: &str = "KIND_CPU";

/// One candidate server-side configuration: the base map from the model
/// repository with a parameter overlay applied and a unique variant name
/// assigned.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ServeConfig {
    doc: Map<String, Value>,
}

impl ServeConfig {
    pub fn from_map(doc: Map<String, Value>) -> Self {
        Self { doc }
    }

    pub fn name(&self) -> Option<&str> {
        self.doc.get("name").and_then(Value::as_str)
    }

    pub fn set_name(&mut self, name: &str) {
        self.doc
            .insert("name".to_string(), Value::String(name.to_string()));
    }

    pub fn max_batch_size(&self) -> Option<u64> {
        self.doc.get("max_batch_size").and_then(Value::as_u64)
    }

    /// The `kind` of every instance group entry, in declaration order.
    pub fn instance_kinds(&self) -> Vec<&str> {
        self.doc
            .get("instance_group")
            .and_then(Value::as_array)
            .map(|groups| {
                groups
                    .iter()
                    .filter_map(|g| g.get("kind").and_then(Value::as_str))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.doc
    }
}

/// Loads the stored base serving config for one model from the repository
/// layout `<repository>/<model>/config.json`.
pub fn load_base(repository: &Path, model_name: &str) -> Result<Map<String, Value>> {
    let path = repository.join(model_name).join("config.json");
    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("reading serving config {}", path.display()))?;
    let doc: Value = serde_json::from_str(&raw)
        .with_context(|| format!("parsing serving config {}", path.display()))?;
    match doc {
        Value::Object(map) => Ok(map),
        _ => bail!("serving config {} is not a JSON object", path.display()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    #[test]
    fn accessors_read_through() {
        let mut config = ServeConfig::from_map(object(json!({
            "max_batch_size": 8,
            "instance_group": [
                {"count": 2, "kind": "KIND_GPU"},
                {"count": 1, "kind": "KIND_CPU"},
            ],
        })));
        assert_eq!(config.name(), None);
        config.set_name("resnet_config_0");
        assert_eq!(config.name(), Some("resnet_config_0"));
        assert_eq!(config.max_batch_size(), Some(8));
        assert_eq!(config.instance_kinds(), vec![KIND_GPU, KIND_CPU]);
    }

    #[test]
    fn load_base_reads_repository_layout() {
        let repo = tempfile::tempdir().expect("tempdir");
        let model_dir = repo.path().join("resnet");
        std::fs::create_dir_all(&model_dir).expect("mkdir");
        std::fs::write(
            model_dir.join("config.json"),
            r#"{"platform": "onnx", "max_batch_size": 4}"#,
        )
        .expect("write");

        let base = load_base(repo.path(), "resnet").expect("load");
        assert_eq!(base.get("platform"), Some(&json!("onnx")));
        assert_eq!(base.get("max_batch_size"), Some(&json!(4)));
    }

    #[test]
    fn load_base_rejects_non_object_and_missing() {
        let repo = tempfile::tempdir().expect("tempdir");
        let model_dir = repo.path().join("broken");
        std::fs::create_dir_all(&model_dir).expect("mkdir");
        std::fs::write(model_dir.join("config.json"), "[1, 2]").expect("write");

        assert!(load_base(repo.path(), "broken").is_err());
        assert!(load_base(repo.path(), "absent").is_err());
    }
}
