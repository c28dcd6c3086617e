//! Billing sink abstraction.
//!
//! A recorded window is forwarded to the billing sink as a batch of per-dimension usage entries
//! tagged with the product code. The sink makes exactly one attempt; a failed submission leaves
//! the stored record pending for reconciliation.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::record::UsageRecord;

/// One usage entry of a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeterUsageEntry {
    pub customer_identifier: String,
    pub dimension: String,
    pub quantity: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeterUsageBatch {
    pub product_code: String,
    pub usage_records: Vec<MeterUsageEntry>,
}

impl MeterUsageBatch {
    /// One entry per dimension of `record`, all stamped with the window end.
    pub fn from_record(product_code: &str, record: &UsageRecord) -> Self {
        Self {
            product_code: product_code.to_string(),
            usage_records: record
                .dimensions
                .iter()
                .map(|sample| MeterUsageEntry {
                    customer_identifier: record.customer_id.clone(),
                    dimension: sample.name.clone(),
                    quantity: sample.quantity,
                    timestamp: record.window_end,
                })
                .collect(),
        }
    }
}

/// Accepted submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitReceipt {
    pub status: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BillingError {
    #[error("billing sink unreachable: {0}")]
    Unreachable(String),

    #[error("billing sink rejected batch (status {status}): {body}")]
    Rejected { status: u16, body: String },
}

impl BillingError {
    /// Label used for the `status` dimension of the billing request counter
    pub fn status_label(&self) -> String {
        match self {
            Self::Unreachable(_) => "unreachable".to_string(),
            Self::Rejected { status, .. } => status.to_string(),
        }
    }
}

#[async_trait]
pub trait BillingSink: Send + Sync {
    async fn submit(&self, batch: &MeterUsageBatch) -> Result<SubmitReceipt, BillingError>;
}

/// Billing sink that POSTs each batch as JSON.
#[derive(Clone)]
pub struct HttpBillingSink {
    client: reqwest::Client,
    url: Url,
    timeout: Duration,
}

impl HttpBillingSink {
    pub fn new(url: Url, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
            timeout,
        }
    }
}

#[async_trait]
impl BillingSink for HttpBillingSink {
    #[tracing::instrument(skip(self, batch), fields(product_code = %batch.product_code, entries = batch.usage_records.len()))]
    async fn submit(&self, batch: &MeterUsageBatch) -> Result<SubmitReceipt, BillingError> {
        let response = self
            .client
            .post(self.url.clone())
            .timeout(self.timeout)
            .json(batch)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(url = %self.url, error = %e, "Billing request failed");
                BillingError::Unreachable(e.to_string())
            })?;

        let status = response.status().as_u16();
        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BillingError::Rejected { status, body });
        }

        tracing::info!(status, "Usage batch submitted");
        Ok(SubmitReceipt { status })
    }
}
