//! In-memory usage store.
//!
//! Records live in an ordered map keyed by `(customer_id, window_end)`, so the dedup range
//! lookup is a `BTreeMap::range`. Suitable for tests and single-process deployments; records are
//! lost on restart.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use super::{InsertOutcome, Result, StoreError, UsageStore};
use crate::record::UsageRecord;

type RecordKey = (String, DateTime<Utc>);

#[derive(Clone, Default)]
pub struct InMemoryUsageStore {
    records: Arc<RwLock<BTreeMap<RecordKey, UsageRecord>>>,
}

impl InMemoryUsageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Every stored record, ordered by customer then window end.
    pub fn records(&self) -> Vec<UsageRecord> {
        self.records.read().values().cloned().collect()
    }
}

#[async_trait]
impl UsageStore for InMemoryUsageStore {
    async fn exists_in_range(&self, customer_id: &str, after: DateTime<Utc>, up_to: DateTime<Utc>) -> Result<bool> {
        // BTreeMap::range panics on an empty (Excluded(x), Included(y)) with x >= y
        if after >= up_to {
            return Ok(false);
        }
        let records = self.records.read();
        let lower = Bound::Excluded((customer_id.to_string(), after));
        let upper = Bound::Included((customer_id.to_string(), up_to));
        Ok(records.range((lower, upper)).next().is_some())
    }

    async fn insert_if_absent(&self, record: &UsageRecord) -> Result<InsertOutcome> {
        let mut records = self.records.write();
        let key = (record.customer_id.clone(), record.window_end);
        if records.contains_key(&key) {
            return Ok(InsertOutcome::AlreadyExists);
        }
        records.insert(key, record.clone());
        Ok(InsertOutcome::Inserted)
    }

    async fn get(&self, customer_id: &str, window_end: DateTime<Utc>) -> Result<Option<UsageRecord>> {
        Ok(self
            .records
            .read()
            .get(&(customer_id.to_string(), window_end))
            .cloned())
    }

    async fn pending_records(&self, customer_id: &str) -> Result<Vec<UsageRecord>> {
        Ok(self
            .records
            .read()
            .values()
            .filter(|r| r.customer_id == customer_id && r.pending)
            .cloned()
            .collect())
    }

    async fn mark_submitted(&self, customer_id: &str, window_end: DateTime<Utc>) -> Result<()> {
        let mut records = self.records.write();
        match records.get_mut(&(customer_id.to_string(), window_end)) {
            Some(record) => {
                record.pending = false;
                Ok(())
            }
            None => Err(StoreError::NotFound {
                customer_id: customer_id.to_string(),
                window_end,
            }),
        }
    }
}
