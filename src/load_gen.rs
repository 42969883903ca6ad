use anyhow::{Context, Result};
use serde_json::{Map, json};

use crate::combos::{parameter_combinations, power_of_two_ladder};
use crate::config::{LaunchMode, ModelSpec, ProfileConfig};
use crate::generate::ConfigGenerator;
use crate::loadcfg::{DEFAULT_MEASUREMENT_MODE, LoadConfig};
use crate::measure::Measurement;

/// Relative throughput gain below which a sweep step counts towards the
/// plateau.
pub const THROUGHPUT_GAIN_THRESHOLD: f64 = 0.05;

/// Enumerates load-tool invocations for one serving candidate.
///
/// The full candidate list is materialized at construction; feedback can
/// only cut it short, via an empty result batch or a throughput plateau.
#[derive(Debug)]
pub struct LoadConfigGenerator {
    configs: Vec<LoadConfig>,
    cursor: usize,
    last_results: Option<Vec<Option<Measurement>>>,
    history: Vec<Measurement>,
}

impl LoadConfigGenerator {
    /// Builds the sweep for `target_name` (the serving variant under
    /// test). Fails when the model's fixed flags contain an unknown key.
    pub fn new(config: &ProfileConfig, model: &ModelSpec, target_name: &str) -> Result<Self> {
        let batch_sizes = model
            .batch_sizes()
            .map(<[u64]>::to_vec)
            .unwrap_or_else(|| config.batch_sizes.clone());
        let concurrencies = concurrency_list(config, model);

        let mut params = Map::new();
        params.insert("model-name".to_string(), json!([target_name]));
        params.insert("batch-size".to_string(), json!(batch_sizes));
        params.insert("concurrency-range".to_string(), json!(concurrencies));
        params.insert(
            "measurement-mode".to_string(),
            json!([DEFAULT_MEASUREMENT_MODE]),
        );
        if config.launch_mode == LaunchMode::CApi {
            params.insert("service-kind".to_string(), json!(["triton_c_api"]));
            params.insert(
                "triton-server-directory".to_string(),
                json!([config.server_path.display().to_string()]),
            );
            params.insert(
                "model-repository".to_string(),
                json!([config.output_repository.display().to_string()]),
            );
        } else {
            params.insert(
                "protocol".to_string(),
                json!([config.client_protocol.as_str()]),
            );
            params.insert("url".to_string(), json!([config.endpoint()]));
        }

        let mut configs = Vec::new();
        for combo in parameter_combinations(&params) {
            let mut load_config = LoadConfig::new();
            load_config.update(&combo)?;
            // User-provided flags override the search parameters.
            if let Some(flags) = &model.loadgen_flags {
                load_config
                    .update(flags)
                    .with_context(|| format!("loadgen_flags for model {}", model.model_name))?;
            }
            configs.push(load_config);
        }

        Ok(Self {
            configs,
            cursor: 0,
            last_results: None,
            history: Vec::new(),
        })
    }

    fn all_returned(&self) -> bool {
        self.cursor == self.configs.len()
    }

    fn last_results_empty(&self) -> bool {
        self.last_results.as_ref().is_some_and(Vec::is_empty)
    }

    /// The sweep keeps going while any of the last three relative gains
    /// exceeds the threshold; three consecutive sub-threshold steps mean
    /// saturation. A short history is always considered improving.
    fn throughput_gain_valid(&self) -> bool {
        if self.history.len() < 4 {
            return true;
        }
        (1..=3).any(|back| self.throughput_gain(back) > THROUGHPUT_GAIN_THRESHOLD)
    }

    fn throughput_gain(&self, back: usize) -> f64 {
        let after = self.history[self.history.len() - back].throughput();
        let before = self.history[self.history.len() - back - 1].throughput();
        (after - before) / before
    }
}

impl ConfigGenerator for LoadConfigGenerator {
    type Config = LoadConfig;

    fn is_done(&self) -> bool {
        self.all_returned() || self.last_results_empty() || !self.throughput_gain_valid()
    }

    fn next_config(&mut self) -> Result<LoadConfig> {
        let config = self
            .configs
            .get(self.cursor)
            .cloned()
            .context("load sweep pulled past its end")?;
        self.cursor += 1;
        Ok(config)
    }

    fn set_last_results(&mut self, results: &[Option<Measurement>]) {
        self.last_results = Some(results.to_vec());
        self.history.extend(results.iter().flatten().cloned());
    }
}

fn concurrency_list(config: &ProfileConfig, model: &ModelSpec) -> Vec<u64> {
    if let Some(explicit) = model.concurrency() {
        if !explicit.is_empty() {
            return explicit.to_vec();
        }
    }
    if !config.concurrency.is_empty() {
        return config.concurrency.clone();
    }
    if config.search_disable {
        return vec![1];
    }
    power_of_two_ladder(config.max_concurrency)
}
