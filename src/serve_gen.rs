use anyhow::Result;
use serde_json::{Map, Value, json};

use crate::combos::{config_combinations, deep_merge_maps};
use crate::config::{LaunchMode, ModelSpec, ProfileConfig};
use crate::generate::ConfigGenerator;
use crate::measure::Measurement;
use crate::servecfg::{KIND_CPU, KIND_GPU, ServeConfig};

/// Enumerates serving configurations for one model.
///
/// Three walk variants share the emission protocol: `Remote` when the
/// runtime is operated externally (only the live config is observable),
/// `Manual` when the user enumerated their own parameter space, and
/// `Automatic` for the instance-count × max-batch-size sweep. Every
/// emitted config is the stored base overlaid with the walk's current
/// parameter combination, under a unique variant name.
#[derive(Debug)]
pub struct ServeConfigGenerator {
    model_name: String,
    base: Map<String, Value>,
    mode: SearchMode,
    name_index: usize,
    live: bool,
    last_results: Vec<Option<Measurement>>,
}

#[derive(Debug)]
enum SearchMode {
    Remote,
    Manual {
        combos: Vec<Map<String, Value>>,
        cursor: usize,
    },
    Automatic(AutoWalk),
}

#[derive(Debug)]
struct AutoWalk {
    min_instances: u32,
    max_instances: u32,
    min_batch: u64,
    max_batch: u64,
    kind: &'static str,
    instances: u32,
    batch: u64,
    started: bool,
}

impl AutoWalk {
    fn new(config: &ProfileConfig, model: &ModelSpec) -> Self {
        Self {
            min_instances: config.min_instance_count,
            max_instances: config.max_instance_count,
            min_batch: config.min_model_batch_size,
            max_batch: config.max_model_batch_size,
            kind: if model.cpu_only { KIND_CPU } else { KIND_GPU },
            instances: 0,
            batch: 0,
            started: false,
        }
    }

    /// None until the walk starts: the first pull is the default probe.
    fn overlay(&self) -> Option<Map<String, Value>> {
        if !self.started {
            return None;
        }
        let combo = json!({
            "dynamic_batching": {},
            "max_batch_size": self.batch,
            "instance_group": [{"count": self.instances, "kind": self.kind}],
        });
        match combo {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }

    fn step(&mut self, erroneous: bool) {
        if !self.started {
            self.started = true;
            self.instances = self.min_instances;
            self.batch = self.min_batch;
        } else if self.batch_axis_done(erroneous) {
            self.batch = self.min_batch;
            self.instances += 1;
        } else {
            self.batch *= 2;
        }
    }

    /// The batch axis at the current instance count is exhausted once
    /// doubling would pass the cap, or once a run at this point blew
    /// through server resources (larger batches are presumed infeasible).
    fn batch_axis_done(&self, erroneous: bool) -> bool {
        self.batch.saturating_mul(2) > self.max_batch || erroneous
    }

    fn complete(&self, erroneous: bool) -> bool {
        self.batch_axis_done(erroneous) && self.instances >= self.max_instances
    }
}

impl ServeConfigGenerator {
    pub fn new(
        config: &ProfileConfig,
        model: &ModelSpec,
        base: Map<String, Value>,
    ) -> Self {
        let mode = if config.launch_mode == LaunchMode::Remote {
            SearchMode::Remote
        } else if let Some(params) = &model.model_config_parameters {
            SearchMode::Manual {
                combos: config_combinations(params),
                cursor: 0,
            }
        } else if config.search_disable {
            // No parameters to combine: only the default probe remains.
            SearchMode::Manual {
                combos: Vec::new(),
                cursor: 0,
            }
        } else {
            SearchMode::Automatic(AutoWalk::new(config, model))
        };

        Self {
            model_name: model.model_name.clone(),
            base,
            mode,
            name_index: 0,
            live: false,
            last_results: Vec::new(),
        }
    }

    fn erroneous(&self) -> bool {
        self.last_results.iter().any(Option::is_none)
    }

    fn walk_complete(&self) -> bool {
        match &self.mode {
            SearchMode::Remote => true,
            SearchMode::Manual { combos, cursor } => *cursor >= combos.len(),
            SearchMode::Automatic(walk) => walk.complete(self.erroneous()),
        }
    }

    fn step(&mut self) {
        let erroneous = self.erroneous();
        match &mut self.mode {
            SearchMode::Remote => {}
            SearchMode::Manual { cursor, .. } => *cursor += 1,
            SearchMode::Automatic(walk) => walk.step(erroneous),
        }
    }

    fn current_overlay(&self) -> Option<Map<String, Value>> {
        match &self.mode {
            SearchMode::Remote => None,
            SearchMode::Manual { combos, cursor } => combos.get(*cursor).cloned(),
            SearchMode::Automatic(walk) => walk.overlay(),
        }
    }

    fn build(&mut self, overlay: Option<Map<String, Value>>) -> ServeConfig {
        let name = match &overlay {
            None => format!("{}_config_default", self.model_name),
            Some(_) => {
                let name = format!("{}_config_{}", self.model_name, self.name_index);
                self.name_index += 1;
                name
            }
        };
        let doc = match overlay {
            Some(combo) => deep_merge_maps(&self.base, &combo),
            None => self.base.clone(),
        };
        let mut config = ServeConfig::from_map(doc);
        config.set_name(&name);
        config
    }
}

impl ConfigGenerator for ServeConfigGenerator {
    type Config = ServeConfig;

    fn is_done(&self) -> bool {
        self.live && self.walk_complete()
    }

    fn next_config(&mut self) -> Result<ServeConfig> {
        if self.live {
            self.step();
        } else {
            self.live = true;
        }
        let overlay = self.current_overlay();
        Ok(self.build(overlay))
    }

    fn set_last_results(&mut self, results: &[Option<Measurement>]) {
        self.last_results = results.to_vec();
    }
}
