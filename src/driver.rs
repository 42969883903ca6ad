use std::collections::BTreeMap;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::config::ProfileConfig;
use crate::generate::ConfigGenerator;
use crate::loadcfg::LoadConfig;
use crate::measure::{Measurement, satisfies};
use crate::run_gen::{RunConfig, RunConfigGenerator};

/// Lifecycle of the serving runtime hosting one candidate run.
pub trait ServerControl {
    fn start(&mut self, run: &RunConfig) -> Result<()>;

    fn stop(&mut self) -> Result<()>;

    /// Captured runtime output, for diagnostics after a failed run.
    fn logs(&mut self) -> Result<String>;
}

/// One load-tool invocation against a running server. `Ok(None)` signals
/// a run that exhausted server resources; `Err` signals a tool failure.
pub trait LoadRunner {
    fn run(&mut self, load_config: &LoadConfig) -> Result<Option<Measurement>>;
}

#[derive(Debug, Clone, Serialize)]
pub struct CandidateResult {
    pub model_name: String,
    pub variant_name: String,
    pub max_batch_size: Option<u64>,
    pub instance_kinds: Vec<String>,
    pub load_args: Map<String, Value>,
    pub measurement: Option<Measurement>,
    pub satisfies_constraints: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct BestEntry {
    pub variant_name: String,
    pub throughput: f64,
    pub load_args: Map<String, Value>,
}

#[derive(Debug, Serialize)]
pub struct ProfileSummary {
    pub generated_at: String,
    pub runs_measured: usize,
    pub best: BTreeMap<String, BestEntry>,
    pub candidates: Vec<CandidateResult>,
}

/// The sequential measurement loop: pull one candidate run, execute it
/// against the collaborators, feed the results back, repeat until the
/// search converges. Candidates are never evaluated in parallel; their
/// measurements would interfere.
pub struct Profiler<'a, S, L> {
    config: &'a ProfileConfig,
    server: S,
    load_runner: L,
}

impl<'a, S: ServerControl, L: LoadRunner> Profiler<'a, S, L> {
    pub fn new(config: &'a ProfileConfig, server: S, load_runner: L) -> Self {
        Self {
            config,
            server,
            load_runner,
        }
    }

    pub fn profile(&mut self) -> Result<ProfileSummary> {
        let mut generator = RunConfigGenerator::new(self.config)?;
        let mut candidates = Vec::new();
        let mut runs_measured = 0usize;
        let started = std::time::Instant::now();

        while !generator.is_done() {
            let run = generator.next_config()?;
            runs_measured += 1;
            let run_summary = run
                .models
                .iter()
                .map(|m| {
                    format!(
                        "{} (concurrency {})",
                        m.serve_config.name().unwrap_or("unnamed"),
                        m.load_config
                            .get("concurrency-range")
                            .and_then(Value::as_u64)
                            .unwrap_or(1)
                    )
                })
                .collect::<Vec<_>>()
                .join(", ");
            tracing::info!("run {}: {}", runs_measured, run_summary);

            let results = self.execute(&run)?;
            self.record(&run, &results, &mut candidates);
            generator.set_last_results(&results);
        }

        tracing::info!(
            "search finished: {} runs, {} candidate measurements, {:.2}s",
            runs_measured,
            candidates.len(),
            started.elapsed().as_secs_f64()
        );
        Ok(summarize(runs_measured, candidates))
    }

    /// Runs the load tool once per co-located model. A tool failure turns
    /// the whole batch into empty feedback, which stops the current load
    /// sweep and moves the search to the next serving candidate.
    fn execute(&mut self, run: &RunConfig) -> Result<Vec<Option<Measurement>>> {
        self.server
            .start(run)
            .context("starting serving runtime")?;

        let mut results = Vec::with_capacity(run.models.len());
        let mut failed = false;
        for model_run in &run.models {
            match self.load_runner.run(&model_run.load_config) {
                Ok(result) => results.push(result),
                Err(error) => {
                    tracing::warn!(
                        "load tool failed for {}: {error:#}",
                        model_run
                            .load_config
                            .model_name()
                            .unwrap_or("unknown model")
                    );
                    if let Ok(logs) = self.server.logs() {
                        if !logs.is_empty() {
                            tracing::debug!("server output:\n{logs}");
                        }
                    }
                    failed = true;
                    break;
                }
            }
        }

        self.server.stop().context("stopping serving runtime")?;
        if failed {
            return Ok(Vec::new());
        }
        Ok(results)
    }

    fn record(
        &self,
        run: &RunConfig,
        results: &[Option<Measurement>],
        candidates: &mut Vec<CandidateResult>,
    ) {
        for (index, model_run) in run.models.iter().enumerate() {
            let spec = &self.config.profile_models[index];
            let measurement = results.get(index).cloned().flatten();
            let passes = measurement
                .as_ref()
                .map(|m| satisfies(self.config.constraints_for(spec), m))
                .unwrap_or(false);
            candidates.push(CandidateResult {
                model_name: spec.model_name.clone(),
                variant_name: model_run
                    .serve_config
                    .name()
                    .unwrap_or(&spec.model_name)
                    .to_string(),
                max_batch_size: model_run.serve_config.max_batch_size(),
                instance_kinds: model_run
                    .serve_config
                    .instance_kinds()
                    .iter()
                    .map(|kind| kind.to_string())
                    .collect(),
                load_args: model_run.load_config.as_map().clone(),
                measurement,
                satisfies_constraints: passes,
            });
        }
    }
}

fn summarize(runs_measured: usize, candidates: Vec<CandidateResult>) -> ProfileSummary {
    let mut best: BTreeMap<String, BestEntry> = BTreeMap::new();
    for candidate in &candidates {
        let Some(measurement) = &candidate.measurement else {
            continue;
        };
        if !candidate.satisfies_constraints {
            continue;
        }
        let throughput = measurement.throughput();
        let better = best
            .get(&candidate.model_name)
            .map_or(true, |entry| throughput > entry.throughput);
        if better {
            best.insert(
                candidate.model_name.clone(),
                BestEntry {
                    variant_name: candidate.variant_name.clone(),
                    throughput,
                    load_args: candidate.load_args.clone(),
                },
            );
        }
    }
    ProfileSummary {
        generated_at: chrono::Utc::now().to_rfc3339(),
        runs_measured,
        best,
        candidates,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PlannedModel {
    pub model_name: String,
    pub variant_name: String,
    pub load_command: String,
    pub load_args: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlanEntry {
    pub run: usize,
    pub models: Vec<PlannedModel>,
}

/// Dry run: walks the full search space with synthetic ever-improving
/// feedback, so no early-stop heuristic fires and no external tool is
/// touched.
pub fn plan(config: &ProfileConfig) -> Result<Vec<PlanEntry>> {
    let mut generator = RunConfigGenerator::new(config)?;
    let mut entries = Vec::new();
    let mut throughput = 1.0;

    while !generator.is_done() {
        let run = generator.next_config()?;
        let mut models = Vec::with_capacity(run.models.len());
        for (index, model_run) in run.models.iter().enumerate() {
            models.push(PlannedModel {
                model_name: config.profile_models[index].model_name.clone(),
                variant_name: model_run
                    .serve_config
                    .name()
                    .unwrap_or(&config.profile_models[index].model_name)
                    .to_string(),
                load_command: model_run.load_config.to_cli_string()?,
                load_args: model_run.load_config.as_map().clone(),
            });
        }
        entries.push(PlanEntry {
            run: entries.len() + 1,
            models,
        });

        let mut measurement = Measurement::new();
        measurement.insert(crate::measure::PERF_THROUGHPUT, throughput);
        throughput *= 2.0;
        let feedback = vec![Some(measurement); run.models.len()];
        generator.set_last_results(&feedback);
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelSpec;
    use crate::measure::{MetricBound, PERF_LATENCY_P99, PERF_THROUGHPUT};
    use serde_json::json;
    use std::path::PathBuf;

    #[derive(Default)]
    struct RecordingServer {
        starts: usize,
        stops: usize,
    }

    impl ServerControl for RecordingServer {
        fn start(&mut self, _run: &RunConfig) -> Result<()> {
            self.starts += 1;
            Ok(())
        }

        fn stop(&mut self) -> Result<()> {
            self.stops += 1;
            Ok(())
        }

        fn logs(&mut self) -> Result<String> {
            Ok(String::new())
        }
    }

    /// Yields scripted (throughput, p99) pairs, then keeps doubling.
    struct ScriptedLoad {
        scripted: Vec<(f64, f64)>,
        cursor: usize,
        fallback: f64,
    }

    impl ScriptedLoad {
        fn new(scripted: Vec<(f64, f64)>) -> Self {
            Self {
                scripted,
                cursor: 0,
                fallback: 1000.0,
            }
        }
    }

    impl LoadRunner for ScriptedLoad {
        fn run(&mut self, _load_config: &LoadConfig) -> Result<Option<Measurement>> {
            let (throughput, p99) = if self.cursor < self.scripted.len() {
                self.scripted[self.cursor]
            } else {
                self.fallback *= 2.0;
                (self.fallback, 1.0)
            };
            self.cursor += 1;
            let mut m = Measurement::new();
            m.insert(PERF_THROUGHPUT, throughput);
            m.insert(PERF_LATENCY_P99, p99);
            Ok(Some(m))
        }
    }

    fn repository(models: &[&str]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().expect("tempdir");
        for model in models {
            let model_dir = dir.path().join(model);
            std::fs::create_dir_all(&model_dir).expect("mkdir");
            std::fs::write(model_dir.join("config.json"), r#"{"max_batch_size": 8}"#)
                .expect("write");
        }
        dir
    }

    fn tiny_config(repo: &tempfile::TempDir) -> ProfileConfig {
        // 3 serving candidates (default + 2 batch sizes) x 1 load config.
        ProfileConfig {
            model_repository: PathBuf::from(repo.path()),
            max_instance_count: 1,
            min_model_batch_size: 8,
            max_model_batch_size: 16,
            concurrency: vec![1],
            profile_models: vec![ModelSpec::named("my-model")],
            ..ProfileConfig::default()
        }
    }

    #[test]
    fn profile_measures_every_candidate_once() {
        let repo = repository(&["my-model"]);
        let config = tiny_config(&repo);
        let mut profiler = Profiler::new(
            &config,
            RecordingServer::default(),
            ScriptedLoad::new(Vec::new()),
        );
        let summary = profiler.profile().expect("profile");

        assert_eq!(summary.runs_measured, 3);
        assert_eq!(summary.candidates.len(), 3);
        assert_eq!(profiler.server.starts, 3);
        assert_eq!(profiler.server.stops, 3);

        let variants: Vec<&str> = summary
            .candidates
            .iter()
            .map(|c| c.variant_name.as_str())
            .collect();
        assert_eq!(
            variants,
            vec![
                "my-model_config_default",
                "my-model_config_0",
                "my-model_config_1",
            ]
        );
    }

    #[test]
    fn summary_picks_best_constraint_passing_candidate() {
        let repo = repository(&["my-model"]);
        let mut config = tiny_config(&repo);
        config.constraints.insert(
            PERF_LATENCY_P99.to_string(),
            MetricBound {
                min: None,
                max: Some(10.0),
            },
        );
        // Highest throughput misses the latency bound; second-best wins.
        let load = ScriptedLoad::new(vec![(100.0, 5.0), (900.0, 50.0), (300.0, 8.0)]);
        let mut profiler = Profiler::new(&config, RecordingServer::default(), load);
        let summary = profiler.profile().expect("profile");

        let best = summary.best.get("my-model").expect("best entry");
        assert_eq!(best.variant_name, "my-model_config_1");
        assert_eq!(best.throughput, 300.0);
        let failing = &summary.candidates[1];
        assert!(!failing.satisfies_constraints);
        assert_eq!(failing.variant_name, "my-model_config_0");
    }

    struct FailingLoad {
        calls: usize,
        fail_on: usize,
        fallback: f64,
    }

    impl LoadRunner for FailingLoad {
        fn run(&mut self, _load_config: &LoadConfig) -> Result<Option<Measurement>> {
            self.calls += 1;
            if self.calls == self.fail_on {
                anyhow::bail!("connection refused");
            }
            self.fallback *= 2.0;
            let mut m = Measurement::new();
            m.insert(PERF_THROUGHPUT, self.fallback);
            Ok(Some(m))
        }
    }

    #[test]
    fn load_failure_skips_to_next_serving_candidate() {
        let repo = repository(&["my-model"]);
        let mut config = tiny_config(&repo);
        config.concurrency = vec![1, 2];

        // Failure on the first load config of the default probe: the rest
        // of that sweep is abandoned, the serving walk continues.
        let load = FailingLoad {
            calls: 0,
            fail_on: 1,
            fallback: 100.0,
        };
        let mut profiler = Profiler::new(&config, RecordingServer::default(), load);
        let summary = profiler.profile().expect("profile");

        // default (1 aborted run) + 2 sweep candidates x 2 loads each.
        assert_eq!(summary.runs_measured, 5);
        assert!(summary.candidates[0].measurement.is_none());
        assert!(!summary.candidates[0].satisfies_constraints);
        assert_eq!(summary.best["my-model"].variant_name, "my-model_config_1");
    }

    #[test]
    fn resource_exhaustion_prunes_but_still_records() {
        let repo = repository(&["my-model"]);
        let config = tiny_config(&repo);

        struct ExhaustedSecond {
            calls: usize,
        }
        impl LoadRunner for ExhaustedSecond {
            fn run(&mut self, _load_config: &LoadConfig) -> Result<Option<Measurement>> {
                self.calls += 1;
                if self.calls == 2 {
                    return Ok(None);
                }
                let mut m = Measurement::new();
                m.insert(PERF_THROUGHPUT, 100.0 * self.calls as f64);
                Ok(Some(m))
            }
        }

        let mut profiler = Profiler::new(
            &config,
            RecordingServer::default(),
            ExhaustedSecond { calls: 0 },
        );
        let summary = profiler.profile().expect("profile");

        // The None at (1,8) exhausts the batch axis at the only instance
        // count, so (1,16) is never tried.
        assert_eq!(summary.runs_measured, 2);
        assert!(summary.candidates[1].measurement.is_none());
    }

    #[test]
    fn plan_enumerates_the_search_space_without_collaborators() {
        let repo = repository(&["my-model"]);
        let config = ProfileConfig {
            model_repository: PathBuf::from(repo.path()),
            max_instance_count: 2,
            min_model_batch_size: 8,
            max_model_batch_size: 16,
            concurrency: vec![1, 2],
            profile_models: vec![ModelSpec::named("my-model")],
            ..ProfileConfig::default()
        };
        let entries = plan(&config).expect("plan");

        // 5 serving candidates x 2 load configs.
        assert_eq!(entries.len(), 10);
        assert_eq!(entries[0].run, 1);
        assert_eq!(entries[0].models[0].variant_name, "my-model_config_default");
        assert_eq!(
            entries[0].models[0].load_args.get("concurrency-range"),
            Some(&json!(1))
        );
        assert_eq!(entries[9].models[0].variant_name, "my-model_config_3");
    }
}
