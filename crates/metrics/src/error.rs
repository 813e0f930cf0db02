//! Metrics error types.

use thiserror::Error;

/// Errors raised by the metrics aggregator.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// A threshold condition failed to parse or evaluate.
    #[error("threshold condition '{condition}': {source}")]
    Threshold {
        /// The condition text.
        condition: String,
        /// The underlying expression error.
        #[source]
        source: trellis_expression::ExpressionError,
    },

    /// A threshold names a metric the aggregator does not track.
    #[error("unknown metric: {0}")]
    UnknownMetric(String),
}
