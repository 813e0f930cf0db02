//! Threshold specifications.

use serde::{Deserialize, Serialize};

/// A pass/fail gate over one metric.
///
/// `metric` names either a custom metric or a step statistic as
/// `<step_id>.<stat>` with stat one of `count`, `success_count`,
/// `failure_count`, `min`, `max`, `avg`, `p50`, `p90`, `p95`, `p99`.
/// `condition` is a trellis-expression over `value`, e.g.
/// `"${value} < 800"`. Thresholds are evaluated on every time-series bucket
/// boundary and in the final report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Threshold {
    /// Metric name.
    pub metric: String,
    /// Condition over `value`.
    pub condition: String,
}

impl Threshold {
    /// Create a threshold.
    pub fn new(metric: impl Into<String>, condition: impl Into<String>) -> Self {
        Self {
            metric: metric.into(),
            condition: condition.into(),
        }
    }
}
