//! Bounded reservoir sampling for latency percentiles.

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Default sample capacity per step.
pub const DEFAULT_CAPACITY: usize = 1024;

/// A fixed-capacity random-replacement reservoir.
///
/// Classic algorithm R: the first `capacity` observations are kept, after
/// which each new observation replaces a random slot with probability
/// `capacity / seen`. Percentile queries sort a copy of the samples.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reservoir {
    capacity: usize,
    samples: Vec<f64>,
    seen: u64,
    min: f64,
    max: f64,
    sum: f64,
}

impl Default for Reservoir {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl Reservoir {
    /// A reservoir holding at most `capacity` samples.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            samples: Vec::new(),
            seen: 0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            sum: 0.0,
        }
    }

    /// Record one observation.
    pub fn record(&mut self, value: f64) {
        self.seen += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);

        if self.samples.len() < self.capacity {
            self.samples.push(value);
        } else {
            let slot = rand::rng().random_range(0..self.seen);
            if let Some(sample) = self.samples.get_mut(slot as usize) {
                *sample = value;
            }
        }
    }

    /// Observations recorded so far (not the retained sample count).
    #[must_use]
    pub fn seen(&self) -> u64 {
        self.seen
    }

    /// Smallest observation, exact.
    #[must_use]
    pub fn min(&self) -> f64 {
        if self.seen == 0 { 0.0 } else { self.min }
    }

    /// Largest observation, exact.
    #[must_use]
    pub fn max(&self) -> f64 {
        if self.seen == 0 { 0.0 } else { self.max }
    }

    /// Mean of all observations, exact.
    #[must_use]
    pub fn mean(&self) -> f64 {
        if self.seen == 0 {
            0.0
        } else {
            self.sum / self.seen as f64
        }
    }

    /// Estimated percentile (`p` in `[0, 100]`) from the retained samples.
    #[must_use]
    pub fn percentile(&self, p: f64) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let mut sorted = self.samples.clone();
        sorted.sort_by(f64::total_cmp);
        let rank = (p / 100.0 * (sorted.len() - 1) as f64).round() as usize;
        sorted[rank.min(sorted.len() - 1)]
    }

    /// Fold another reservoir into this one.
    ///
    /// Each retained sample of `other` is re-offered to the replacement
    /// scheme; exact min/max/mean fold losslessly. Percentiles after a merge
    /// are an approximation weighted toward retained samples.
    pub fn merge(&mut self, other: &Reservoir) {
        if other.seen == 0 {
            return;
        }
        let foreign_seen = other.seen;
        let foreign_samples = other.samples.len() as u64;
        for &sample in &other.samples {
            self.seen += 1;
            if self.samples.len() < self.capacity {
                self.samples.push(sample);
            } else {
                let slot = rand::rng().random_range(0..self.seen);
                if let Some(kept) = self.samples.get_mut(slot as usize) {
                    *kept = sample;
                }
            }
        }
        // Account for observations the other side saw but did not retain.
        self.seen += foreign_seen - foreign_samples;
        self.sum += other.sum;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn empty_reservoir_reports_zeros() {
        let r = Reservoir::default();
        assert_eq!(r.seen(), 0);
        assert_eq!(r.min(), 0.0);
        assert_eq!(r.max(), 0.0);
        assert_eq!(r.mean(), 0.0);
        assert_eq!(r.percentile(95.0), 0.0);
    }

    #[test]
    fn exact_stats_below_capacity() {
        let mut r = Reservoir::with_capacity(100);
        for v in 1..=10 {
            r.record(f64::from(v));
        }
        assert_eq!(r.seen(), 10);
        assert_eq!(r.min(), 1.0);
        assert_eq!(r.max(), 10.0);
        assert_eq!(r.mean(), 5.5);
        assert_eq!(r.percentile(50.0), 6.0);
        assert_eq!(r.percentile(100.0), 10.0);
    }

    #[test]
    fn capacity_is_bounded_under_load() {
        let mut r = Reservoir::with_capacity(64);
        for v in 0..10_000 {
            r.record(f64::from(v));
        }
        assert_eq!(r.seen(), 10_000);
        assert!(r.samples.len() <= 64);
        assert_eq!(r.min(), 0.0);
        assert_eq!(r.max(), 9999.0);
    }

    #[test]
    fn percentiles_within_tolerance_on_uniform_distribution() {
        let mut r = Reservoir::with_capacity(1024);
        for v in 0..100_000u32 {
            r.record(f64::from(v));
        }
        let p95 = r.percentile(95.0);
        // Uniform 0..100_000: p95 is ~95_000; the reservoir is a sample, so
        // allow a generous band.
        assert!((85_000.0..=100_000.0).contains(&p95), "p95 was {p95}");
    }

    #[test]
    fn merge_folds_exact_stats() {
        let mut a = Reservoir::with_capacity(16);
        let mut b = Reservoir::with_capacity(16);
        for v in 1..=4 {
            a.record(f64::from(v));
        }
        for v in 5..=8 {
            b.record(f64::from(v));
        }
        a.merge(&b);
        assert_eq!(a.seen(), 8);
        assert_eq!(a.min(), 1.0);
        assert_eq!(a.max(), 8.0);
        assert_eq!(a.mean(), 4.5);
    }
}
