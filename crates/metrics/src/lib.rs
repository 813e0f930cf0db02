#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! # Trellis Metrics
//!
//! The per-execution metrics aggregator: step counters and latency
//! percentiles, custom metrics, a fixed-interval time-series ring for live
//! dashboards, and threshold evaluation.
//!
//! Latency percentiles come from a bounded random-replacement reservoir per
//! step, which keeps memory constant under load runs and merges cheaply when
//! slaves report in. Threshold conditions are trellis-expression strings
//! evaluated over a scope exposing `value`.

pub mod aggregator;
pub mod error;
pub mod report;
pub mod reservoir;
pub mod threshold;
pub mod timeseries;

pub use aggregator::MetricsEngine;
pub use error::MetricsError;
pub use report::{LatencySummary, MetricsReport, StepMetricsSummary, ThresholdResult};
pub use reservoir::Reservoir;
pub use threshold::Threshold;
pub use timeseries::{Bucket, TimeSeries};
