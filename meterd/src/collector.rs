//! Per-window usage collection.
//!
//! For one window the collector issues one point-in-time query per configured dimension at the
//! window's end instant. Dimensions are evaluated independently: a failed, slow or nonsensical
//! dimension yields [`DimensionValue::Missing`] and never affects its siblings.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::backend::{MetricsBackend, QueryError, QueryValue};
use crate::metrics::MeteringMetrics;
use crate::window::TimeWindow;

/// A named usage axis and the query that measures it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Dimension {
    pub name: String,
    pub query: String,
}

impl Dimension {
    pub fn new(name: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            query: query.into(),
        }
    }
}

/// Why a dimension has no usable quantity for a window.
#[derive(Debug, Clone, PartialEq)]
pub enum MissingReason {
    /// The backend returned an error for this query
    QueryFailed(QueryError),
    /// The query did not finish within the per-query or per-window deadline
    TimedOut(Duration),
    /// No series matched at the evaluation instant
    NotFound,
    /// More than one series matched
    Ambiguous { series: usize },
    /// The sample was negative
    Negative(f64),
    /// The sample was NaN or infinite
    NotFinite,
    /// The sample does not fit in an unsigned 64-bit quantity
    OutOfRange(f64),
}

impl std::fmt::Display for MissingReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::QueryFailed(e) => write!(f, "{e}"),
            Self::TimedOut(after) => write!(f, "timed out after {after:?}"),
            Self::NotFound => write!(f, "no series matched"),
            Self::Ambiguous { series } => write!(f, "{series} series matched, expected one"),
            Self::Negative(v) => write!(f, "negative sample {v}"),
            Self::NotFinite => write!(f, "non-finite sample"),
            Self::OutOfRange(v) => write!(f, "sample {v} out of range"),
        }
    }
}

/// Outcome of measuring one dimension. A failed measurement carries its reason, never a quantity.
#[derive(Debug, Clone, PartialEq)]
pub enum DimensionValue {
    Found(u64),
    Missing(MissingReason),
}

impl DimensionValue {
    pub fn is_found(&self) -> bool {
        matches!(self, Self::Found(_))
    }

    /// Convert a raw backend value. Fractional usage is truncated toward zero.
    pub fn from_query_value(value: QueryValue) -> Self {
        match value {
            QueryValue::NotFound => Self::Missing(MissingReason::NotFound),
            QueryValue::Ambiguous { series } => Self::Missing(MissingReason::Ambiguous { series }),
            QueryValue::Found(v) if !v.is_finite() => Self::Missing(MissingReason::NotFinite),
            QueryValue::Found(v) if v < 0.0 => Self::Missing(MissingReason::Negative(v)),
            QueryValue::Found(v) if v.trunc() >= u64::MAX as f64 => Self::Missing(MissingReason::OutOfRange(v)),
            QueryValue::Found(v) => Self::Found(v.trunc() as u64),
        }
    }
}

/// Per-dimension results for one window, in configured dimension order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CollectedUsage {
    values: Vec<(String, DimensionValue)>,
}

impl CollectedUsage {
    pub fn get(&self, name: &str) -> Option<&DimensionValue> {
        self.values.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &DimensionValue)> {
        self.values.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn missing(&self) -> impl Iterator<Item = (&str, &MissingReason)> {
        self.values.iter().filter_map(|(n, v)| match v {
            DimensionValue::Missing(reason) => Some((n.as_str(), reason)),
            DimensionValue::Found(_) => None,
        })
    }
}

impl FromIterator<(String, DimensionValue)> for CollectedUsage {
    fn from_iter<T: IntoIterator<Item = (String, DimensionValue)>>(iter: T) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

/// Collection failed as a whole; no per-dimension results are available.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CollectorError {
    #[error("metrics backend unavailable for all {dimensions} dimensions: {reason}")]
    BackendUnavailable { dimensions: usize, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectorConfig {
    /// Deadline for a single dimension query
    pub query_timeout: Duration,
    /// Deadline for all queries of one window together
    pub window_timeout: Duration,
    /// Maximum number of dimension queries in flight at once
    pub max_concurrent_queries: usize,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            query_timeout: Duration::from_secs(5),
            window_timeout: Duration::from_secs(10),
            max_concurrent_queries: 4,
        }
    }
}

pub struct UsageCollector {
    backend: Arc<dyn MetricsBackend>,
    metrics: MeteringMetrics,
    config: CollectorConfig,
}

impl UsageCollector {
    pub fn new(backend: Arc<dyn MetricsBackend>, metrics: MeteringMetrics, config: CollectorConfig) -> Self {
        Self {
            backend,
            metrics,
            config,
        }
    }

    /// Measure every dimension for `window`, evaluated at `window.end()`.
    ///
    /// Returns one entry per dimension in the given order. Only fails when every dimension
    /// failed because the backend could not be reached.
    #[tracing::instrument(skip_all, fields(window = %window))]
    pub async fn collect(
        &self,
        window: &TimeWindow,
        dimensions: &[Dimension],
    ) -> Result<CollectedUsage, CollectorError> {
        let at = window.end();
        let deadline = Instant::now() + self.config.window_timeout;
        let query_timeout = self.config.query_timeout;
        let window_timeout = self.config.window_timeout;

        let results: Vec<(String, Result<QueryValue, MissingReason>)> = stream::iter(dimensions)
            .map(|dimension| {
                let backend = Arc::clone(&self.backend);
                async move {
                    self.metrics.record_query_attempt(&dimension.name);
                    let call = tokio::time::timeout(query_timeout, backend.query(&dimension.query, at, query_timeout));
                    let result = match tokio::time::timeout_at(deadline, call).await {
                        Ok(Ok(Ok(value))) => Ok(value),
                        Ok(Ok(Err(QueryError::TimedOut(after)))) => Err(MissingReason::TimedOut(after)),
                        Ok(Ok(Err(e))) => Err(MissingReason::QueryFailed(e)),
                        Ok(Err(_)) => Err(MissingReason::TimedOut(query_timeout)),
                        Err(_) => Err(MissingReason::TimedOut(window_timeout)),
                    };
                    (dimension.name.clone(), result)
                }
            })
            .buffered(self.config.max_concurrent_queries.max(1))
            .collect()
            .await;

        let unreachable = results
            .iter()
            .filter_map(|(_, r)| match r {
                Err(MissingReason::QueryFailed(QueryError::Unreachable(msg))) => Some(msg),
                _ => None,
            })
            .collect::<Vec<_>>();
        if !results.is_empty() && unreachable.len() == results.len() {
            let reason = unreachable[0].clone();
            for (name, _) in &results {
                self.metrics.record_query_error(name);
            }
            warn!(dimensions = results.len(), %reason, "Metrics backend unreachable, skipping collection");
            return Err(CollectorError::BackendUnavailable {
                dimensions: results.len(),
                reason,
            });
        }

        let usage: CollectedUsage = results
            .into_iter()
            .map(|(name, result)| {
                let value = match result {
                    Ok(raw) => DimensionValue::from_query_value(raw),
                    Err(reason) => DimensionValue::Missing(reason),
                };
                match &value {
                    DimensionValue::Found(quantity) => debug!(dimension = %name, quantity, "Dimension measured"),
                    DimensionValue::Missing(reason) => {
                        self.metrics.record_query_error(&name);
                        warn!(dimension = %name, %reason, "Dimension has no usable value");
                    }
                }
                (name, value)
            })
            .collect();

        Ok(usage)
    }
}
