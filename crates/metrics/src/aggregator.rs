//! The per-execution metrics engine.

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;
use tracing::warn;

use trellis_expression::{EvalScope, Expression};

use crate::report::{LatencySummary, MetricsReport, StepMetricsSummary, ThresholdResult};
use crate::reservoir::Reservoir;
use crate::threshold::Threshold;
use crate::timeseries::TimeSeries;

#[derive(Debug, Default)]
struct StepAccumulator {
    count: u64,
    success_count: u64,
    failure_count: u64,
    latency: Reservoir,
}

impl StepAccumulator {
    fn summarize(&self) -> StepMetricsSummary {
        StepMetricsSummary {
            count: self.count,
            success_count: self.success_count,
            failure_count: self.failure_count,
            latency: LatencySummary::from_reservoir(&self.latency),
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    steps: HashMap<String, StepAccumulator>,
    custom: HashMap<String, f64>,
    series: TimeSeries,
    thresholds: Vec<Threshold>,
    threshold_results: Vec<ThresholdResult>,
}

/// Aggregates step samples, custom metrics, the live time series, and
/// threshold outcomes for one execution.
///
/// Shared behind `Arc`; a single mutex guards the accumulator maps.
#[derive(Debug, Default)]
pub struct MetricsEngine {
    inner: Mutex<Inner>,
}

impl MetricsEngine {
    /// An engine with default time-series settings and no thresholds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// An engine with explicit time-series settings and thresholds.
    #[must_use]
    pub fn with_config(
        bucket_interval: Duration,
        bucket_capacity: usize,
        thresholds: Vec<Threshold>,
    ) -> Self {
        Self {
            inner: Mutex::new(Inner {
                series: TimeSeries::new(bucket_interval, bucket_capacity),
                thresholds,
                ..Inner::default()
            }),
        }
    }

    /// Record one step invocation.
    ///
    /// Thresholds re-evaluate when the sample closes a time-series bucket.
    pub fn record_step(&self, step_id: &str, success: bool, duration: Duration) {
        let latency_ms = duration.as_secs_f64() * 1000.0;
        let mut inner = self.inner.lock();

        let acc = inner.steps.entry(step_id.to_owned()).or_default();
        acc.count += 1;
        if success {
            acc.success_count += 1;
        } else {
            acc.failure_count += 1;
        }
        acc.latency.record(latency_ms);

        if inner.series.record(Utc::now(), success, latency_ms).is_some() {
            Self::evaluate_thresholds_locked(&mut inner);
        }
    }

    /// Record a custom metric (last write wins).
    pub fn record_custom(&self, name: &str, value: f64) {
        self.inner.lock().custom.insert(name.to_owned(), value);
    }

    /// Merge a slave's report into this aggregator.
    ///
    /// Counters add; latency summaries fold approximately by re-offering the
    /// summary quantiles weighted by count; custom metrics overwrite.
    pub fn merge_report(&self, report: &MetricsReport) {
        let mut inner = self.inner.lock();
        for (step_id, summary) in &report.steps {
            let acc = inner.steps.entry(step_id.clone()).or_default();
            acc.count += summary.count;
            acc.success_count += summary.success_count;
            acc.failure_count += summary.failure_count;
            acc.latency.merge(&reservoir_from_summary(summary));
        }
        for (name, value) in &report.custom {
            inner.custom.insert(name.clone(), *value);
        }
    }

    /// Evaluate all thresholds against current values.
    pub fn evaluate_thresholds(&self) -> Vec<ThresholdResult> {
        let mut inner = self.inner.lock();
        Self::evaluate_thresholds_locked(&mut inner);
        inner.threshold_results.clone()
    }

    fn evaluate_thresholds_locked(inner: &mut Inner) {
        let mut results = Vec::with_capacity(inner.thresholds.len());
        for threshold in &inner.thresholds {
            let value = Self::metric_value_locked(inner, &threshold.metric);
            let passed = match value {
                Some(value) => {
                    let mut scope = EvalScope::new();
                    scope.set_variable("value", json!(value));
                    match Expression::parse(&threshold.condition)
                        .and_then(|expr| expr.evaluate(&scope))
                    {
                        Ok(passed) => passed,
                        Err(error) => {
                            warn!(
                                metric = %threshold.metric,
                                condition = %threshold.condition,
                                %error,
                                "threshold condition failed to evaluate"
                            );
                            false
                        }
                    }
                }
                None => false,
            };
            if !passed {
                warn!(metric = %threshold.metric, condition = %threshold.condition, "threshold failing");
            }
            results.push(ThresholdResult {
                metric: threshold.metric.clone(),
                condition: threshold.condition.clone(),
                passed,
                value,
            });
        }
        inner.threshold_results = results;
    }

    fn metric_value_locked(inner: &Inner, metric: &str) -> Option<f64> {
        if let Some(value) = inner.custom.get(metric) {
            return Some(*value);
        }
        // `<step_id>.<stat>` — the step id itself may contain dots, so try
        // the longest prefix first.
        let (step_id, stat) = metric.rsplit_once('.')?;
        inner.steps.get(step_id).and_then(|acc| acc.summarize().stat(stat))
    }

    /// A point-in-time report.
    #[must_use]
    pub fn snapshot(&self) -> MetricsReport {
        let inner = self.inner.lock();
        MetricsReport {
            generated_at: Some(Utc::now()),
            steps: inner
                .steps
                .iter()
                .map(|(id, acc)| (id.clone(), acc.summarize()))
                .collect(),
            custom: inner.custom.clone(),
            thresholds: inner.threshold_results.clone(),
            buckets: inner.series.buckets(),
        }
    }

    /// The final report: thresholds re-evaluated, then snapshotted.
    #[must_use]
    pub fn final_report(&self) -> MetricsReport {
        self.evaluate_thresholds();
        self.snapshot()
    }
}

/// Rebuild an approximate reservoir from a summary for merging.
fn reservoir_from_summary(summary: &StepMetricsSummary) -> Reservoir {
    let mut reservoir = Reservoir::default();
    if summary.count == 0 {
        return reservoir;
    }
    // Re-offer the quantiles proportionally to the observed count, capped so
    // a huge remote count cannot flush local samples entirely.
    let weight = (summary.count.min(256) / 4).max(1);
    for quantile in [
        summary.latency.p50,
        summary.latency.p90,
        summary.latency.p95,
        summary.latency.p99,
    ] {
        for _ in 0..weight {
            reservoir.record(quantile);
        }
    }
    // Fold exact extremes back in.
    reservoir.record(summary.latency.min);
    reservoir.record(summary.latency.max);
    reservoir
}
