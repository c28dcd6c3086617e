//! Persistent usage store and the dedup gate in front of it.
//!
//! The store is the only authority on which windows have been recorded. Uniqueness of
//! `(customer_id, window_end)` is enforced by the store itself through a conditional insert, so
//! concurrent processes cannot both record the same window.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::error;

use crate::metrics::MeteringMetrics;
use crate::record::UsageRecord;
use crate::window::TimeWindow;

pub mod in_memory;
pub mod postgres;

#[cfg(test)]
mod tests;

pub use in_memory::InMemoryUsageStore;
pub use postgres::PostgresUsageStore;

/// Result of a conditional insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// A record with the same `(customer_id, window_end)` was already present; nothing written
    AlreadyExists,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The store could not be reached or did not answer in time
    #[error("usage store unavailable: {0}")]
    Unavailable(String),

    #[error("unique constraint violation{}", .constraint.as_deref().map(|c| format!(" on {c}")).unwrap_or_default())]
    UniqueViolation { constraint: Option<String> },

    #[error("no usage record for customer {customer_id} at {window_end}")]
    NotFound {
        customer_id: String,
        window_end: DateTime<Utc>,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => StoreError::UniqueViolation {
                constraint: db_err.constraint().map(|s| s.to_string()),
            },
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => StoreError::Unavailable(err.to_string()),
            _ => StoreError::Other(anyhow::Error::from(err)),
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Storage for usage records.
#[async_trait]
pub trait UsageStore: Send + Sync {
    /// Whether a record exists for `customer_id` with `after < window_end <= up_to`.
    async fn exists_in_range(&self, customer_id: &str, after: DateTime<Utc>, up_to: DateTime<Utc>) -> Result<bool>;

    /// Write `record` unless one with the same key already exists.
    async fn insert_if_absent(&self, record: &UsageRecord) -> Result<InsertOutcome>;

    async fn get(&self, customer_id: &str, window_end: DateTime<Utc>) -> Result<Option<UsageRecord>>;

    /// Records of `customer_id` not yet confirmed by the billing sink, oldest first.
    async fn pending_records(&self, customer_id: &str) -> Result<Vec<UsageRecord>>;

    /// Clear the pending flag once the billing sink has accepted the record.
    ///
    /// # Errors
    /// - `NotFound` if no record has this key
    async fn mark_submitted(&self, customer_id: &str, window_end: DateTime<Utc>) -> Result<()>;
}

/// Answers "has this window already been recorded for this customer?".
///
/// A window `[start, end)` counts as recorded when the store holds a record for the customer
/// keyed anywhere in `(start, end]`. Contiguous windows give disjoint ranges, so one record never
/// satisfies two windows.
#[derive(Clone)]
pub struct DedupGate {
    store: Arc<dyn UsageStore>,
    metrics: MeteringMetrics,
}

impl DedupGate {
    pub fn new(store: Arc<dyn UsageStore>, metrics: MeteringMetrics) -> Self {
        Self { store, metrics }
    }

    /// Check whether `window` is already recorded for `customer_id`.
    ///
    /// A lookup failure is returned as an error, never as `false`: callers must skip the window
    /// (fail closed) and let the next cycle retry.
    pub async fn exists(&self, customer_id: &str, window: &TimeWindow) -> Result<bool> {
        self.metrics.record_store_operation("exists");
        match self.store.exists_in_range(customer_id, window.start(), window.end()).await {
            Ok(found) => Ok(found),
            Err(e) => {
                self.metrics.record_store_error("exists");
                error!(
                    customer_id,
                    window_start = %window.start(),
                    window_end = %window.end(),
                    error = %e,
                    "Dedup lookup failed"
                );
                Err(e)
            }
        }
    }
}
