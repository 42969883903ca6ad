use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::ValueEnum;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::loadcfg::LoadConfig;
use crate::measure::ConstraintSet;

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum LaunchMode {
    /// Serving runtime is spawned locally per candidate run
    Local,
    /// Serving runtime is operated externally; configs cannot be reloaded
    Remote,
    /// Serving runtime runs in a managed container
    Docker,
    /// Load tool drives the runtime in-process through its C API
    CApi,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum ClientProtocol {
    Http,
    Grpc,
}

impl ClientProtocol {
    pub fn as_str(self) -> &'static str {
        match self {
            ClientProtocol::Http => "http",
            ClientProtocol::Grpc => "grpc",
        }
    }
}

/// Explicit per-model sweep lists; overrides the global CLI lists.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelParameters {
    #[serde(default)]
    pub batch_sizes: Option<Vec<u64>>,
    #[serde(default)]
    pub concurrency: Option<Vec<u64>>,
}

/// One model to profile, as declared in the YAML model list.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelSpec {
    pub model_name: String,
    #[serde(default)]
    pub cpu_only: bool,
    /// Nested parameter map enabling the manual serving sweep.
    #[serde(default)]
    pub model_config_parameters: Option<Map<String, Value>>,
    /// Fixed load-tool flags, overriding anything the sweep generates.
    #[serde(default)]
    pub loadgen_flags: Option<Map<String, Value>>,
    #[serde(default)]
    pub parameters: Option<ModelParameters>,
    /// Opaque runtime-environment descriptor; must match across models
    /// profiled together.
    #[serde(default)]
    pub environment: Map<String, Value>,
    #[serde(default)]
    pub constraints: Option<ConstraintSet>,
}

impl ModelSpec {
    pub fn named(name: &str) -> Self {
        Self {
            model_name: name.to_string(),
            cpu_only: false,
            model_config_parameters: None,
            loadgen_flags: None,
            parameters: None,
            environment: Map::new(),
            constraints: None,
        }
    }

    pub fn batch_sizes(&self) -> Option<&[u64]> {
        self.parameters
            .as_ref()
            .and_then(|p| p.batch_sizes.as_deref())
    }

    pub fn concurrency(&self) -> Option<&[u64]> {
        self.parameters
            .as_ref()
            .and_then(|p| p.concurrency.as_deref())
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ModelEntry {
    Name(String),
    Spec(ModelSpec),
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ProfileFile {
    #[serde(default)]
    profile_models: Vec<ModelEntry>,
    #[serde(default)]
    constraints: ConstraintSet,
}

/// Parses the YAML model list: a sequence of model names or full specs,
/// plus optional default constraints applied to models without their own.
pub fn load_model_file(path: &Path) -> Result<(Vec<ModelSpec>, ConstraintSet)> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading model file {}", path.display()))?;
    let file: ProfileFile = serde_yaml::from_str(&raw)
        .with_context(|| format!("parsing model file {}", path.display()))?;
    let models = file
        .profile_models
        .into_iter()
        .map(|entry| match entry {
            ModelEntry::Name(name) => ModelSpec::named(&name),
            ModelEntry::Spec(spec) => spec,
        })
        .collect();
    Ok((models, file.constraints))
}

/// Fully merged profile configuration: CLI options plus the YAML model
/// list. Immutable once validated.
#[derive(Debug, Clone)]
pub struct ProfileConfig {
    pub model_repository: PathBuf,
    pub output_repository: PathBuf,
    pub batch_sizes: Vec<u64>,
    pub concurrency: Vec<u64>,
    pub search_disable: bool,
    pub min_instance_count: u32,
    pub max_instance_count: u32,
    pub min_model_batch_size: u64,
    pub max_model_batch_size: u64,
    pub max_concurrency: u64,
    pub launch_mode: LaunchMode,
    pub client_protocol: ClientProtocol,
    pub http_endpoint: String,
    pub grpc_endpoint: String,
    pub server_path: PathBuf,
    pub loadgen_path: PathBuf,
    pub profile_models: Vec<ModelSpec>,
    pub constraints: ConstraintSet,
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            model_repository: PathBuf::new(),
            output_repository: PathBuf::from("output_models"),
            batch_sizes: vec![1],
            concurrency: Vec::new(),
            search_disable: false,
            min_instance_count: 1,
            max_instance_count: 5,
            min_model_batch_size: 1,
            max_model_batch_size: 128,
            max_concurrency: 1024,
            launch_mode: LaunchMode::Local,
            client_protocol: ClientProtocol::Grpc,
            http_endpoint: "localhost:8000".to_string(),
            grpc_endpoint: "localhost:8001".to_string(),
            server_path: PathBuf::from("model-server"),
            loadgen_path: PathBuf::from("loadgen"),
            profile_models: Vec::new(),
            constraints: ConstraintSet::new(),
        }
    }
}

impl ProfileConfig {
    /// Structural checks that must fail before any search begins.
    pub fn validate(&self) -> Result<()> {
        if self.profile_models.is_empty() {
            bail!("no models to profile; provide profile_models in the model file");
        }
        if self.min_instance_count < 1 || self.min_instance_count > self.max_instance_count {
            bail!(
                "invalid instance count range [{}, {}]",
                self.min_instance_count,
                self.max_instance_count
            );
        }
        if self.min_model_batch_size < 1
            || self.min_model_batch_size > self.max_model_batch_size
        {
            bail!(
                "invalid model batch size range [{}, {}]",
                self.min_model_batch_size,
                self.max_model_batch_size
            );
        }
        if self.max_concurrency < 1 {
            bail!("run-config-search-max-concurrency must be at least 1");
        }
        if self.batch_sizes.is_empty() {
            bail!("batch-sizes must not be empty");
        }

        let mut seen = std::collections::BTreeSet::new();
        for model in &self.profile_models {
            if model.model_name.is_empty() {
                bail!("model_name must not be empty");
            }
            if !seen.insert(model.model_name.as_str()) {
                bail!("duplicate model {} in profile_models", model.model_name);
            }
            if let Some(flags) = &model.loadgen_flags {
                for key in flags.keys() {
                    if !LoadConfig::is_known_key(key) {
                        bail!(
                            "model {}: unsupported load-generator flag: {key}",
                            model.model_name
                        );
                    }
                }
            }
        }
        Ok(())
    }

    /// The model's own constraints when declared, else the global default.
    pub fn constraints_for<'a>(&'a self, model: &'a ModelSpec) -> &'a ConstraintSet {
        model.constraints.as_ref().unwrap_or(&self.constraints)
    }

    /// Load-tool URL for the selected client protocol.
    pub fn endpoint(&self) -> &str {
        match self.client_protocol {
            ClientProtocol::Http => &self.http_endpoint,
            ClientProtocol::Grpc => &self.grpc_endpoint,
        }
    }
}
