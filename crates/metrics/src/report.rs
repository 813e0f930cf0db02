//! Serializable metric reports.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::reservoir::Reservoir;
use crate::timeseries::Bucket;

/// Latency statistics in milliseconds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LatencySummary {
    /// Smallest observed latency.
    pub min: f64,
    /// Largest observed latency.
    pub max: f64,
    /// Mean latency.
    pub avg: f64,
    /// Median.
    pub p50: f64,
    /// 90th percentile.
    pub p90: f64,
    /// 95th percentile.
    pub p95: f64,
    /// 99th percentile.
    pub p99: f64,
}

impl LatencySummary {
    /// Summarize a reservoir.
    #[must_use]
    pub fn from_reservoir(reservoir: &Reservoir) -> Self {
        Self {
            min: reservoir.min(),
            max: reservoir.max(),
            avg: reservoir.mean(),
            p50: reservoir.percentile(50.0),
            p90: reservoir.percentile(90.0),
            p95: reservoir.percentile(95.0),
            p99: reservoir.percentile(99.0),
        }
    }

    /// Look up a statistic by name.
    #[must_use]
    pub fn stat(&self, name: &str) -> Option<f64> {
        match name {
            "min" => Some(self.min),
            "max" => Some(self.max),
            "avg" => Some(self.avg),
            "p50" => Some(self.p50),
            "p90" => Some(self.p90),
            "p95" => Some(self.p95),
            "p99" => Some(self.p99),
            _ => None,
        }
    }
}

/// Counters and latency statistics for one step.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepMetricsSummary {
    /// Invocations observed.
    pub count: u64,
    /// Successful invocations.
    pub success_count: u64,
    /// Failed invocations.
    pub failure_count: u64,
    /// Latency statistics.
    pub latency: LatencySummary,
}

impl StepMetricsSummary {
    /// Look up a statistic by name, counters included.
    #[must_use]
    pub fn stat(&self, name: &str) -> Option<f64> {
        match name {
            "count" => Some(self.count as f64),
            "success_count" => Some(self.success_count as f64),
            "failure_count" => Some(self.failure_count as f64),
            other => self.latency.stat(other),
        }
    }
}

/// One threshold evaluation outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdResult {
    /// Metric name.
    pub metric: String,
    /// Condition text.
    pub condition: String,
    /// Whether the condition held.
    pub passed: bool,
    /// The metric value at evaluation time, when the metric existed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
}

/// A point-in-time aggregate of an execution's metrics.
///
/// Reports are what slaves ship to the master and what the REST surface
/// returns; [`crate::MetricsEngine::merge_report`] folds one in.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsReport {
    /// When the snapshot was taken.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_at: Option<DateTime<Utc>>,
    /// Per-step summaries keyed by step id.
    #[serde(default)]
    pub steps: HashMap<String, StepMetricsSummary>,
    /// Custom metrics.
    #[serde(default)]
    pub custom: HashMap<String, f64>,
    /// Latest threshold outcomes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub thresholds: Vec<ThresholdResult>,
    /// Retained time-series buckets, oldest first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub buckets: Vec<Bucket>,
}

impl MetricsReport {
    /// `true` when every evaluated threshold passed.
    #[must_use]
    pub fn thresholds_passed(&self) -> bool {
        self.thresholds.iter().all(|t| t.passed)
    }
}
