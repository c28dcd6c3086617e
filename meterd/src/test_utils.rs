//! Test doubles for the metering pipeline collaborators.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use prometheus::Registry;

use crate::backend::{MetricsBackend, QueryError, QueryValue};
use crate::billing::{BillingError, BillingSink, MeterUsageBatch, SubmitReceipt};
use crate::collector::Dimension;
use crate::metrics::MeteringMetrics;
use crate::record::UsageRecord;
use crate::store::{InMemoryUsageStore, InsertOutcome, StoreError, UsageStore};

pub fn test_metrics() -> MeteringMetrics {
    MeteringMetrics::new(&Registry::new()).unwrap()
}

/// cpu, memory and storage, queried by `<name>_query`
pub fn acme_dimensions() -> Vec<Dimension> {
    ["cpu", "memory", "storage"]
        .into_iter()
        .map(|name| Dimension::new(name, format!("{name}_query")))
        .collect()
}

#[derive(Clone)]
struct Scripted {
    delay: Option<Duration>,
    result: Result<QueryValue, QueryError>,
}

/// Metrics backend answering from a per-query script. Unscripted queries match no series.
#[derive(Clone, Default)]
pub struct ScriptedBackend {
    scripts: Arc<Mutex<HashMap<String, Scripted>>>,
    calls: Arc<Mutex<Vec<(String, DateTime<Utc>)>>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn found(self, query: &str, value: f64) -> Self {
        self.returning(query, QueryValue::Found(value))
    }

    pub fn returning(self, query: &str, value: QueryValue) -> Self {
        self.set(query, Ok(value));
        self
    }

    pub fn failing(self, query: &str, error: QueryError) -> Self {
        self.set(query, Err(error));
        self
    }

    /// Answer `value` after sleeping for `delay` (tokio time, so it honours a paused clock)
    pub fn delayed(self, query: &str, delay: Duration, value: QueryValue) -> Self {
        self.scripts.lock().insert(
            query.to_string(),
            Scripted {
                delay: Some(delay),
                result: Ok(value),
            },
        );
        self
    }

    /// Replace the script for `query`
    pub fn set(&self, query: &str, result: Result<QueryValue, QueryError>) {
        self.scripts
            .lock()
            .insert(query.to_string(), Scripted { delay: None, result });
    }

    pub fn calls(&self) -> Vec<(String, DateTime<Utc>)> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl MetricsBackend for ScriptedBackend {
    async fn query(&self, query: &str, at: DateTime<Utc>, _timeout: Duration) -> Result<QueryValue, QueryError> {
        self.calls.lock().push((query.to_string(), at));
        let scripted = self.scripts.lock().get(query).cloned();
        match scripted {
            Some(Scripted { delay, result }) => {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                result
            }
            None => Ok(QueryValue::NotFound),
        }
    }
}

/// In-memory store with switchable failures per operation.
#[derive(Clone, Default)]
pub struct FlakyStore {
    inner: InMemoryUsageStore,
    fail_exists: Arc<AtomicBool>,
    fail_insert: Arc<AtomicBool>,
    fail_mark: Arc<AtomicBool>,
    hide_records: Arc<AtomicBool>,
    inserts: Arc<AtomicUsize>,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_exists(&self, fail: bool) {
        self.fail_exists.store(fail, Ordering::SeqCst);
    }

    pub fn fail_insert(&self, fail: bool) {
        self.fail_insert.store(fail, Ordering::SeqCst);
    }

    pub fn fail_mark(&self, fail: bool) {
        self.fail_mark.store(fail, Ordering::SeqCst);
    }

    /// Make the range lookup miss existing records, as if another process wrote them after it ran
    pub fn hide_records(&self, hide: bool) {
        self.hide_records.store(hide, Ordering::SeqCst);
    }

    /// Number of insert attempts, including failed and rejected ones
    pub fn insert_attempts(&self) -> usize {
        self.inserts.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &InMemoryUsageStore {
        &self.inner
    }

    fn unavailable() -> StoreError {
        StoreError::Unavailable("connection refused".to_string())
    }
}

#[async_trait]
impl UsageStore for FlakyStore {
    async fn exists_in_range(
        &self,
        customer_id: &str,
        after: DateTime<Utc>,
        up_to: DateTime<Utc>,
    ) -> crate::store::Result<bool> {
        if self.fail_exists.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        if self.hide_records.load(Ordering::SeqCst) {
            return Ok(false);
        }
        self.inner.exists_in_range(customer_id, after, up_to).await
    }

    async fn insert_if_absent(&self, record: &UsageRecord) -> crate::store::Result<InsertOutcome> {
        self.inserts.fetch_add(1, Ordering::SeqCst);
        if self.fail_insert.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        self.inner.insert_if_absent(record).await
    }

    async fn get(&self, customer_id: &str, window_end: DateTime<Utc>) -> crate::store::Result<Option<UsageRecord>> {
        self.inner.get(customer_id, window_end).await
    }

    async fn pending_records(&self, customer_id: &str) -> crate::store::Result<Vec<UsageRecord>> {
        self.inner.pending_records(customer_id).await
    }

    async fn mark_submitted(&self, customer_id: &str, window_end: DateTime<Utc>) -> crate::store::Result<()> {
        if self.fail_mark.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        self.inner.mark_submitted(customer_id, window_end).await
    }
}

/// Billing sink that records every batch and answers with a fixed result.
#[derive(Clone)]
pub struct RecordingBillingSink {
    batches: Arc<Mutex<Vec<MeterUsageBatch>>>,
    response: Arc<Mutex<Result<SubmitReceipt, BillingError>>>,
}

impl RecordingBillingSink {
    pub fn accepting() -> Self {
        Self {
            batches: Arc::new(Mutex::new(Vec::new())),
            response: Arc::new(Mutex::new(Ok(SubmitReceipt { status: 200 }))),
        }
    }

    pub fn rejecting(error: BillingError) -> Self {
        let sink = Self::accepting();
        *sink.response.lock() = Err(error);
        sink
    }

    pub fn batches(&self) -> Vec<MeterUsageBatch> {
        self.batches.lock().clone()
    }
}

#[async_trait]
impl BillingSink for RecordingBillingSink {
    async fn submit(&self, batch: &MeterUsageBatch) -> Result<SubmitReceipt, BillingError> {
        self.batches.lock().push(batch.clone());
        self.response.lock().clone()
    }
}
