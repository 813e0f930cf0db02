//! Fixed-interval time-series buckets for live dashboards.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;

/// Default bucket interval.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

/// Default ring capacity (5 minutes at 1 s buckets).
pub const DEFAULT_CAPACITY: usize = 300;

/// One aggregation window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bucket {
    /// Window start.
    pub start: DateTime<Utc>,
    /// Samples in the window.
    pub count: u64,
    /// Failed samples in the window.
    pub failures: u64,
    /// Sum of latencies, milliseconds.
    pub total_latency_ms: f64,
    /// Smallest latency in the window.
    pub min_latency_ms: f64,
    /// Largest latency in the window.
    pub max_latency_ms: f64,
}

impl Bucket {
    fn new(start: DateTime<Utc>) -> Self {
        Self {
            start,
            count: 0,
            failures: 0,
            total_latency_ms: 0.0,
            min_latency_ms: f64::INFINITY,
            max_latency_ms: 0.0,
        }
    }

    fn record(&mut self, success: bool, latency_ms: f64) {
        self.count += 1;
        if !success {
            self.failures += 1;
        }
        self.total_latency_ms += latency_ms;
        self.min_latency_ms = self.min_latency_ms.min(latency_ms);
        self.max_latency_ms = self.max_latency_ms.max(latency_ms);
    }

    /// Mean latency of the window.
    #[must_use]
    pub fn mean_latency_ms(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total_latency_ms / self.count as f64
        }
    }
}

/// A bounded ring of fixed-interval buckets. Overflow discards the oldest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeSeries {
    #[serde(with = "serde_interval")]
    interval: Duration,
    capacity: usize,
    buckets: VecDeque<Bucket>,
}

impl Default for TimeSeries {
    fn default() -> Self {
        Self::new(DEFAULT_INTERVAL, DEFAULT_CAPACITY)
    }
}

impl TimeSeries {
    /// A ring with the given bucket interval and capacity.
    #[must_use]
    pub fn new(interval: Duration, capacity: usize) -> Self {
        Self {
            interval: interval.max(Duration::from_millis(1)),
            capacity: capacity.max(1),
            buckets: VecDeque::new(),
        }
    }

    /// Record a sample at time `at`.
    ///
    /// Returns the just-closed bucket when `at` opens a new window, which is
    /// the aggregator's cue to run threshold evaluation.
    pub fn record(&mut self, at: DateTime<Utc>, success: bool, latency_ms: f64) -> Option<Bucket> {
        let window = self.window_start(at);
        let rolled = match self.buckets.back() {
            Some(current) if current.start == window => None,
            Some(current) => {
                let closed = current.clone();
                self.open(window);
                Some(closed)
            }
            None => {
                self.open(window);
                None
            }
        };

        if let Some(current) = self.buckets.back_mut() {
            current.record(success, latency_ms);
        }
        rolled
    }

    fn open(&mut self, window: DateTime<Utc>) {
        if self.buckets.len() == self.capacity {
            self.buckets.pop_front();
        }
        self.buckets.push_back(Bucket::new(window));
    }

    fn window_start(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        let interval_ms = self.interval.as_millis() as i64;
        let ms = at.timestamp_millis();
        let aligned = ms - ms.rem_euclid(interval_ms);
        DateTime::from_timestamp_millis(aligned).unwrap_or(at)
    }

    /// All retained buckets, oldest first.
    #[must_use]
    pub fn buckets(&self) -> Vec<Bucket> {
        self.buckets.iter().cloned().collect()
    }

    /// Number of retained buckets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    /// Returns `true` if no samples were recorded yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

mod serde_interval {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(interval: &Duration, s: S) -> Result<S::Ok, S::Error> {
        (interval.as_millis() as u64).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn at(secs: i64, millis: u32) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, millis * 1_000_000).unwrap()
    }

    #[test]
    fn samples_in_one_window_share_a_bucket() {
        let mut series = TimeSeries::new(Duration::from_secs(1), 10);
        assert!(series.record(at(100, 0), true, 10.0).is_none());
        assert!(series.record(at(100, 500), false, 30.0).is_none());

        let buckets = series.buckets();
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].count, 2);
        assert_eq!(buckets[0].failures, 1);
        assert_eq!(buckets[0].mean_latency_ms(), 20.0);
    }

    #[test]
    fn window_rollover_returns_closed_bucket() {
        let mut series = TimeSeries::new(Duration::from_secs(1), 10);
        series.record(at(100, 0), true, 10.0);
        let closed = series.record(at(101, 0), true, 20.0).unwrap();
        assert_eq!(closed.count, 1);
        assert_eq!(series.len(), 2);
    }

    #[test]
    fn overflow_discards_oldest() {
        let mut series = TimeSeries::new(Duration::from_secs(1), 3);
        for s in 0..5 {
            series.record(at(100 + s, 0), true, 1.0);
        }
        let buckets = series.buckets();
        assert_eq!(buckets.len(), 3);
        assert_eq!(buckets[0].start, at(102, 0));
        assert_eq!(buckets[2].start, at(104, 0));
    }

    #[test]
    fn min_max_latency_tracked_per_bucket() {
        let mut series = TimeSeries::default();
        let now = Utc::now();
        series.record(now, true, 5.0);
        series.record(now, true, 50.0);
        let bucket = &series.buckets()[0];
        assert_eq!(bucket.min_latency_ms, 5.0);
        assert_eq!(bucket.max_latency_ms, 50.0);
    }
}
