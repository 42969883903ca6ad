use anyhow::{Result, bail};
use serde::Serialize;
use serde_json::{Map, Value};

pub const DEFAULT_MEASUREMENT_MODE: &str = "count_windows";

/// Long keys that render as short command-line options (`-m value`).
const OPTIONS: &[(&str, &str)] = &[
    ("model-name", "-m"),
    ("model-version", "-x"),
    ("batch-size", "-b"),
    ("protocol", "-i"),
    ("url", "-u"),
    ("latency-report-file", "-f"),
];

/// Long keys that render as `--key=value`.
const ARGS: &[&str] = &[
    "concurrency-range",
    "measurement-mode",
    "measurement-interval",
    "measurement-request-count",
    "warmup-request-count",
    "stability-percentage",
    "percentile",
    "request-rate-range",
    "service-kind",
    "triton-server-directory",
    "model-repository",
    "shape",
    "input-data",
];

/// Long keys that render as bare `--key` flags when truthy and disappear
/// when falsy.
const FLAGS: &[&str] = &["verbose", "extra-verbose", "streaming", "async"];

/// Keys whose list values render additively (`--shape=a --shape=b`).
const ADDITIVE: &[&str] = &["shape", "input-data"];

/// One load-generator invocation. Keys live in a single map in insertion
/// order; the option/arg/flag split only matters when rendering the
/// command line. Unknown keys are rejected at set time.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct LoadConfig {
    values: Map<String, Value>,
}

impl LoadConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_known_key(key: &str) -> bool {
        OPTIONS.iter().any(|(k, _)| *k == key)
            || ARGS.contains(&key)
            || FLAGS.contains(&key)
    }

    pub fn set(&mut self, key: &str, value: Value) -> Result<()> {
        if !Self::is_known_key(key) {
            bail!("unsupported load-generator flag: {key}");
        }
        if value.is_null() {
            self.values.shift_remove(key);
        } else {
            self.values.insert(key.to_string(), value);
        }
        Ok(())
    }

    /// Applies every entry of `params`, later keys overriding earlier ones.
    pub fn update(&mut self, params: &Map<String, Value>) -> Result<()> {
        for (key, value) in params {
            self.set(key, value.clone())?;
        }
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn model_name(&self) -> Option<&str> {
        self.values.get("model-name").and_then(Value::as_str)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.values
    }

    /// Renders the invocation as an argument vector in key insertion
    /// order.
    pub fn to_args(&self) -> Result<Vec<String>> {
        let mut args = Vec::with_capacity(self.values.len());
        for (key, value) in &self.values {
            if let Some((_, short)) = OPTIONS.iter().find(|(k, _)| *k == key.as_str()) {
                args.push(short.to_string());
                args.push(render_scalar(key, value)?);
            } else if FLAGS.contains(&key.as_str()) {
                if is_truthy(value) {
                    args.push(format!("--{key}"));
                }
            } else if ADDITIVE.contains(&key.as_str()) {
                match value {
                    Value::Array(items) => {
                        for item in items {
                            args.push(format!("--{key}={}", render_scalar(key, item)?));
                        }
                    }
                    Value::String(s) => args.push(format!("--{key}={s}")),
                    other => bail!("flag {key} takes a string or list, got {other}"),
                }
            } else {
                args.push(format!("--{key}={}", render_scalar(key, value)?));
            }
        }
        Ok(args)
    }

    /// The argument vector joined for display and logging.
    pub fn to_cli_string(&self) -> Result<String> {
        Ok(self.to_args()?.join(" "))
    }
}

fn render_scalar(key: &str, value: &Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => bail!("flag {key} has non-scalar value {other}"),
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64() != Some(0.0),
        Value::String(s) => !matches!(s.as_str(), "" | "0" | "false" | "False"),
        Value::Null => false,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn base_config() -> LoadConfig {
        let mut config = LoadConfig::new();
        config.set("model-name", json!("test_model")).expect("set");
        config
            .set("measurement-interval", json!(1000))
            .expect("set");
        config
    }

    #[test]
    fn rejects_unknown_keys() {
        let mut config = LoadConfig::new();
        assert!(config.set("dummy", json!(1)).is_err());
        assert!(LoadConfig::is_known_key("concurrency-range"));
        assert!(!LoadConfig::is_known_key("dummy"));
    }

    #[test]
    fn renders_options_short_and_args_long() {
        let mut config = base_config();
        config.set("concurrency-range", json!(4)).expect("set");
        assert_eq!(
            config.to_cli_string().expect("cli"),
            "-m test_model --measurement-interval=1000 --concurrency-range=4"
        );
    }

    #[test]
    fn additive_args_render_per_element() {
        let mut config = base_config();
        config
            .set("shape", json!(["name1:1,2,3", "name2:4,5,6"]))
            .expect("set");
        config
            .set("measurement-request-count", json!(50))
            .expect("set");
        assert_eq!(
            config.to_cli_string().expect("cli"),
            "-m test_model --measurement-interval=1000 \
             --shape=name1:1,2,3 --shape=name2:4,5,6 \
             --measurement-request-count=50"
        );

        config.set("shape", json!("name1:1,2,3")).expect("set");
        assert_eq!(
            config.to_cli_string().expect("cli"),
            "-m test_model --measurement-interval=1000 \
             --shape=name1:1,2,3 --measurement-request-count=50"
        );

        config.set("shape", json!(5)).expect("set");
        assert!(config.to_cli_string().is_err());
    }

    #[test]
    fn falsy_flags_drop_out_of_rendering() {
        let mut config = base_config();
        config.set("extra-verbose", json!(true)).expect("set");
        assert_eq!(
            config.to_cli_string().expect("cli"),
            "-m test_model --measurement-interval=1000 --extra-verbose"
        );

        config.set("extra-verbose", json!("False")).expect("set");
        assert_eq!(
            config.to_cli_string().expect("cli"),
            "-m test_model --measurement-interval=1000"
        );
    }

    #[test]
    fn null_unsets_a_key() {
        let mut config = base_config();
        config.set("measurement-interval", json!(null)).expect("set");
        assert_eq!(config.to_cli_string().expect("cli"), "-m test_model");
    }

    #[test]
    fn update_overrides_in_place() {
        let mut config = base_config();
        let mut overlay = Map::new();
        overlay.insert("model-name".to_string(), json!("other_model"));
        overlay.insert("percentile".to_string(), json!(96));
        config.update(&overlay).expect("update");
        assert_eq!(config.model_name(), Some("other_model"));
        assert_eq!(config.get("percentile"), Some(&json!(96)));
    }
}
