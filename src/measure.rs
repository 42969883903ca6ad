use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub const PERF_THROUGHPUT: &str = "perf_throughput";
pub const PERF_LATENCY_AVG: &str = "perf_latency_avg";
pub const PERF_LATENCY_P50: &str = "perf_latency_p50";
pub const PERF_LATENCY_P90: &str = "perf_latency_p90";
pub const PERF_LATENCY_P95: &str = "perf_latency_p95";
pub const PERF_LATENCY_P99: &str = "perf_latency_p99";
pub const PERF_CLIENT_SEND_RECV: &str = "perf_client_send_recv";
pub const PERF_CLIENT_RESPONSE_WAIT: &str = "perf_client_response_wait";
pub const PERF_SERVER_QUEUE: &str = "perf_server_queue";
pub const PERF_SERVER_COMPUTE_INPUT: &str = "perf_server_compute_input";
pub const PERF_SERVER_COMPUTE_INFER: &str = "perf_server_compute_infer";
pub const PERF_SERVER_COMPUTE_OUTPUT: &str = "perf_server_compute_output";

/// One completed measurement of a candidate: a bag of metric values keyed
/// by tag. The search core only ever reads `perf_throughput`; the rest is
/// carried for constraints and reporting.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Measurement {
    metrics: BTreeMap<String, f64>,
}

impl Measurement {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, tag: &str, value: f64) {
        self.metrics.insert(tag.to_string(), value);
    }

    pub fn metric(&self, tag: &str) -> Option<f64> {
        self.metrics.get(tag).copied()
    }

    pub fn throughput(&self) -> f64 {
        self.metric(PERF_THROUGHPUT).unwrap_or(0.0)
    }
}

impl FromIterator<(String, f64)> for Measurement {
    fn from_iter<I: IntoIterator<Item = (String, f64)>>(iter: I) -> Self {
        Self {
            metrics: iter.into_iter().collect(),
        }
    }
}

/// Inclusive bounds on one metric tag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricBound {
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
}

pub type ConstraintSet = BTreeMap<String, MetricBound>;

/// True when every bounded tag present in the measurement is within its
/// bounds. Tags the measurement does not carry are not judged.
pub fn satisfies(constraints: &ConstraintSet, measurement: &Measurement) -> bool {
    constraints.iter().all(|(tag, bound)| {
        measurement.metric(tag).map_or(true, |value| {
            bound.min.map_or(true, |min| value >= min)
                && bound.max.map_or(true, |max| value <= max)
        })
    })
}
