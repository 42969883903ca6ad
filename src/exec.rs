use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

use anyhow::{Context, Result, bail};
use serde_json::{Value, json};

use crate::config::ProfileConfig;
use crate::driver::{LoadRunner, ServerControl};
use crate::loadcfg::LoadConfig;
use crate::measure::{
    Measurement, PERF_CLIENT_RESPONSE_WAIT, PERF_CLIENT_SEND_RECV, PERF_LATENCY_AVG,
    PERF_LATENCY_P50, PERF_LATENCY_P90, PERF_LATENCY_P95, PERF_LATENCY_P99,
    PERF_SERVER_COMPUTE_INFER, PERF_SERVER_COMPUTE_INPUT, PERF_SERVER_COMPUTE_OUTPUT,
    PERF_SERVER_QUEUE, PERF_THROUGHPUT,
};
use crate::run_gen::RunConfig;

/// Writes each serving variant of a run into the output repository, where
/// the spawned runtime picks it up.
pub fn stage_run(repository: &Path, run: &RunConfig) -> Result<()> {
    for model_run in &run.models {
        let name = model_run
            .serve_config
            .name()
            .context("serving config has no name")?;
        let model_dir = repository.join(name);
        std::fs::create_dir_all(&model_dir)
            .with_context(|| format!("creating {}", model_dir.display()))?;
        let json = serde_json::to_string_pretty(model_run.serve_config.as_map())?;
        std::fs::write(model_dir.join("config.json"), json)
            .with_context(|| format!("staging serving config for {name}"))?;
    }
    Ok(())
}

/// Spawns the serving runtime binary over the staged output repository,
/// one process per candidate run.
pub struct ProcessServer {
    binary: PathBuf,
    repository: PathBuf,
    child: Option<Child>,
    captured: String,
}

impl ProcessServer {
    pub fn new(config: &ProfileConfig) -> Self {
        Self {
            binary: config.server_path.clone(),
            repository: config.output_repository.clone(),
            child: None,
            captured: String::new(),
        }
    }
}

impl ServerControl for ProcessServer {
    fn start(&mut self, run: &RunConfig) -> Result<()> {
        stage_run(&self.repository, run)?;

        let mut command = Command::new(&self.binary);
        command
            .arg("--model-repository")
            .arg(&self.repository)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in &run.environment {
            command.env(key, env_value(value));
        }

        tracing::debug!("starting {} over {}", self.binary.display(), self.repository.display());
        let child = command
            .spawn()
            .with_context(|| format!("spawning serving runtime {}", self.binary.display()))?;
        self.child = Some(child);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if let Some(mut child) = self.child.take() {
            child.kill().ok();
            let output = child
                .wait_with_output()
                .context("collecting serving runtime output")?;
            self.captured = format!(
                "{}{}",
                String::from_utf8_lossy(&output.stdout),
                String::from_utf8_lossy(&output.stderr)
            );
        }
        Ok(())
    }

    fn logs(&mut self) -> Result<String> {
        Ok(self.captured.clone())
    }
}

fn env_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Invokes the load-generator binary and reads back its latency report.
pub struct LoadTool {
    binary: PathBuf,
    report_dir: PathBuf,
}

impl LoadTool {
    pub fn new(config: &ProfileConfig) -> Self {
        Self {
            binary: config.loadgen_path.clone(),
            report_dir: config.output_repository.clone(),
        }
    }
}

impl LoadRunner for LoadTool {
    fn run(&mut self, load_config: &LoadConfig) -> Result<Option<Measurement>> {
        let target = load_config.model_name().unwrap_or("model");
        let report_path = self.report_dir.join(format!("{target}-report.csv"));

        let mut invocation = load_config.clone();
        invocation.set(
            "latency-report-file",
            json!(report_path.display().to_string()),
        )?;
        let args = invocation.to_args()?;
        tracing::debug!("{} {}", self.binary.display(), args.join(" "));

        let output = Command::new(&self.binary)
            .args(&args)
            .output()
            .with_context(|| format!("running load tool {}", self.binary.display()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if is_resource_exhaustion(&stderr) {
                tracing::warn!("load run against {target} exhausted server resources");
                return Ok(None);
            }
            bail!(
                "load tool exited with {}: {}",
                output.status,
                stderr.trim()
            );
        }

        let measurement = parse_latency_report(&report_path)?;
        Ok(Some(measurement))
    }
}

fn is_resource_exhaustion(stderr: &str) -> bool {
    ["out of memory", "OOM", "resource exhausted"]
        .iter()
        .any(|needle| stderr.contains(needle))
}

/// Maps a latency-report column onto a metric tag and unit divisor
/// (latencies arrive in microseconds and are recorded in milliseconds).
fn metric_tag(header: &str) -> Option<(&'static str, f64)> {
    match header.trim() {
        "Inferences/Second" => Some((PERF_THROUGHPUT, 1.0)),
        "Avg latency" => Some((PERF_LATENCY_AVG, 1000.0)),
        "p50 latency" => Some((PERF_LATENCY_P50, 1000.0)),
        "p90 latency" => Some((PERF_LATENCY_P90, 1000.0)),
        "p95 latency" => Some((PERF_LATENCY_P95, 1000.0)),
        "p99 latency" => Some((PERF_LATENCY_P99, 1000.0)),
        "request/response" => Some((PERF_CLIENT_SEND_RECV, 1000.0)),
        "response wait" => Some((PERF_CLIENT_RESPONSE_WAIT, 1000.0)),
        "Server Queue" => Some((PERF_SERVER_QUEUE, 1000.0)),
        "Server Compute Input" => Some((PERF_SERVER_COMPUTE_INPUT, 1000.0)),
        "Server Compute Infer" => Some((PERF_SERVER_COMPUTE_INFER, 1000.0)),
        "Server Compute Output" => Some((PERF_SERVER_COMPUTE_OUTPUT, 1000.0)),
        _ => None,
    }
}

pub fn parse_latency_report(path: &Path) -> Result<Measurement> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("opening latency report {}", path.display()))?;
    let headers = reader.headers()?.clone();
    let record = reader
        .records()
        .next()
        .with_context(|| format!("latency report {} is empty", path.display()))??;

    let mut measurement = Measurement::new();
    for (header, field) in headers.iter().zip(record.iter()) {
        let Some((tag, divisor)) = metric_tag(header) else {
            continue;
        };
        let value: f64 = field
            .trim()
            .parse()
            .with_context(|| format!("column {header} in {}", path.display()))?;
        measurement.insert(tag, value / divisor);
    }
    Ok(measurement)
}
