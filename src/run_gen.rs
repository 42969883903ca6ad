use anyhow::{Context, Result, bail};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::config::{ModelSpec, ProfileConfig};
use crate::generate::ConfigGenerator;
use crate::load_gen::LoadConfigGenerator;
use crate::loadcfg::LoadConfig;
use crate::measure::Measurement;
use crate::serve_gen::ServeConfigGenerator;
use crate::servecfg::{self, ServeConfig};

/// One model's share of a run: the serving variant to stage and the load
/// sweep point to drive against it.
#[derive(Debug, Clone, Serialize)]
pub struct ModelRunConfig {
    pub serve_config: ServeConfig,
    pub load_config: LoadConfig,
}

/// One executable candidate: the runtime environment plus one
/// (serving, load) pair per co-located model.
#[derive(Debug, Clone, Serialize)]
pub struct RunConfig {
    pub environment: Map<String, Value>,
    pub models: Vec<ModelRunConfig>,
}

/// Pairs a serving walk with a fresh load sweep for every serving
/// candidate. Feedback goes to the live load sweep; once that sweep is
/// done the next batch drives the serving walk's step instead.
#[derive(Debug)]
pub struct ModelRunConfigGenerator<'a> {
    config: &'a ProfileConfig,
    model: &'a ModelSpec,
    serve_gen: ServeConfigGenerator,
    load_gen: Option<LoadConfigGenerator>,
    curr_serve: Option<ServeConfig>,
}

impl<'a> ModelRunConfigGenerator<'a> {
    pub fn new(config: &'a ProfileConfig, model: &'a ModelSpec) -> Result<Self> {
        let base = servecfg::load_base(&config.model_repository, &model.model_name)?;
        Ok(Self {
            config,
            model,
            serve_gen: ServeConfigGenerator::new(config, model, base),
            load_gen: None,
            curr_serve: None,
        })
    }
}

impl ConfigGenerator for ModelRunConfigGenerator<'_> {
    type Config = ModelRunConfig;

    fn is_done(&self) -> bool {
        self.serve_gen.is_done()
            && self.load_gen.as_ref().is_none_or(|g| g.is_done())
    }

    fn next_config(&mut self) -> Result<ModelRunConfig> {
        if self.load_gen.as_ref().is_none_or(|g| g.is_done()) {
            let serve = self.serve_gen.next_config()?;
            let target = serve.name().unwrap_or(&self.model.model_name).to_string();
            self.load_gen = Some(LoadConfigGenerator::new(self.config, self.model, &target)?);
            self.curr_serve = Some(serve);
        }
        let load_gen = self.load_gen.as_mut().context("no live load sweep")?;
        let load_config = load_gen.next_config()?;
        let serve_config = self.curr_serve.clone().context("no serving candidate")?;
        Ok(ModelRunConfig {
            serve_config,
            load_config,
        })
    }

    fn set_last_results(&mut self, results: &[Option<Measurement>]) {
        match self.load_gen.as_mut() {
            Some(load_gen) if !load_gen.is_done() => load_gen.set_last_results(results),
            _ => self.serve_gen.set_last_results(results),
        }
    }
}

/// Composes N per-model generators into runs covering the Cartesian
/// product of their outputs. The descent is an explicit odometer: the
/// innermost live generator advances per pull, and every level below an
/// advanced level is rebuilt fresh.
#[derive(Debug)]
pub struct RunConfigGenerator<'a> {
    config: &'a ProfileConfig,
    environment: Map<String, Value>,
    generators: Vec<Option<ModelRunConfigGenerator<'a>>>,
    slots: Vec<Option<ModelRunConfig>>,
    pending: Vec<Vec<Option<Measurement>>>,
}

impl<'a> RunConfigGenerator<'a> {
    pub fn new(config: &'a ProfileConfig) -> Result<Self> {
        let environment = coherent_environment(&config.profile_models)?;
        let count = config.profile_models.len();
        Ok(Self {
            config,
            environment,
            generators: (0..count).map(|_| None).collect(),
            slots: vec![None; count],
            pending: vec![Vec::new(); count],
        })
    }

    fn descend(&mut self, index: usize) -> Result<()> {
        let config = self.config;
        let mut generator =
            ModelRunConfigGenerator::new(config, &config.profile_models[index])?;
        self.slots[index] = Some(generator.next_config()?);
        self.generators[index] = Some(generator);
        Ok(())
    }

    fn assemble(&self) -> RunConfig {
        RunConfig {
            environment: self.environment.clone(),
            models: self.slots.iter().flatten().cloned().collect(),
        }
    }
}

impl ConfigGenerator for RunConfigGenerator<'_> {
    type Config = RunConfig;

    fn is_done(&self) -> bool {
        match self.generators.first() {
            Some(Some(_)) => self.generators.iter().flatten().all(|g| g.is_done()),
            _ => false,
        }
    }

    fn next_config(&mut self) -> Result<RunConfig> {
        let count = self.generators.len();
        if self.generators[0].is_none() {
            for index in 0..count {
                self.descend(index)?;
            }
        } else {
            let level = self
                .generators
                .iter()
                .rposition(|g| g.as_ref().is_some_and(|g| !g.is_done()))
                .context("run config search exhausted")?;
            let generator = self.generators[level]
                .as_mut()
                .context("missing generator")?;
            self.slots[level] = Some(generator.next_config()?);
            for index in level + 1..count {
                self.descend(index)?;
            }
        }
        Ok(self.assemble())
    }

    /// Fans the batch into every level's pending queue, then drains the
    /// queues innermost-first, stopping at the first generator still
    /// alive after consuming. Outer generators thereby absorb the
    /// cumulative feedback since their last step in one delivery.
    fn set_last_results(&mut self, results: &[Option<Measurement>]) {
        for queue in &mut self.pending {
            queue.extend(results.iter().cloned());
        }
        for index in (0..self.generators.len()).rev() {
            let batch = std::mem::take(&mut self.pending[index]);
            if let Some(generator) = self.generators[index].as_mut() {
                generator.set_last_results(&batch);
                if !generator.is_done() {
                    break;
                }
            }
        }
    }
}

fn coherent_environment(models: &[ModelSpec]) -> Result<Map<String, Value>> {
    let first = models.first().context("no models to profile")?;
    for model in models {
        if model.environment != first.environment {
            bail!(
                "mismatching runtime environments: models profiled together must \
                 request the same environment ({} differs from {})",
                model.model_name,
                first.model_name
            );
        }
    }
    Ok(first.environment.clone())
}
