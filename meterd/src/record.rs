//! Usage records and the completeness gate that builds them.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::collector::{CollectedUsage, Dimension, DimensionValue, MissingReason};
use crate::window::TimeWindow;

/// Measured quantity of one dimension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimensionSample {
    #[serde(rename = "dimension")]
    pub name: String,
    #[serde(rename = "value")]
    pub quantity: u64,
}

impl DimensionSample {
    pub fn new(name: impl Into<String>, quantity: u64) -> Self {
        Self {
            name: name.into(),
            quantity,
        }
    }
}

/// Usage of one customer for one window, keyed by `(customer_id, window_end)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub customer_id: String,
    pub window_end: DateTime<Utc>,
    /// One sample per configured dimension, in configured order
    pub dimensions: Vec<DimensionSample>,
    /// Not yet confirmed by the billing sink
    pub pending: bool,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error(
        "incomplete dimensions (missing: {missing:?}, duplicated: {duplicated:?}, unexpected: {unexpected:?})"
    )]
    IncompleteDimensions {
        missing: Vec<String>,
        duplicated: Vec<String>,
        unexpected: Vec<String>,
    },

    #[error("degenerate values: {}", describe_failures(.failures))]
    DegenerateValue { failures: Vec<(String, MissingReason)> },
}

fn describe_failures(failures: &[(String, MissingReason)]) -> String {
    failures
        .iter()
        .map(|(name, reason)| format!("{name} ({reason})"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Builds [`UsageRecord`]s, rejecting anything short of one usable sample per configured
/// dimension.
#[derive(Debug, Clone)]
pub struct RecordAssembler {
    dimension_names: Vec<String>,
}

impl RecordAssembler {
    pub fn new<I, S>(dimension_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            dimension_names: dimension_names.into_iter().map(Into::into).collect(),
        }
    }

    pub fn for_dimensions(dimensions: &[Dimension]) -> Self {
        Self::new(dimensions.iter().map(|d| d.name.clone()))
    }

    pub fn dimension_names(&self) -> &[String] {
        &self.dimension_names
    }

    /// Validate `usage` and build the record for `window`.
    ///
    /// Checks run in order: every configured dimension present exactly once and nothing else,
    /// then every value found. The record is created pending.
    pub fn assemble(
        &self,
        window: &TimeWindow,
        customer_id: &str,
        usage: &CollectedUsage,
    ) -> Result<UsageRecord, ValidationError> {
        let mut seen: HashMap<&str, usize> = HashMap::new();
        for (name, _) in usage.iter() {
            *seen.entry(name).or_default() += 1;
        }

        let missing: Vec<String> = self
            .dimension_names
            .iter()
            .filter(|name| !seen.contains_key(name.as_str()))
            .cloned()
            .collect();
        let mut duplicated: Vec<String> = seen
            .iter()
            .filter(|(_, count)| **count > 1)
            .map(|(name, _)| name.to_string())
            .collect();
        let mut unexpected: Vec<String> = seen
            .keys()
            .filter(|name| !self.dimension_names.iter().any(|configured| configured.as_str() == **name))
            .map(|name| name.to_string())
            .collect();

        if !missing.is_empty() || !duplicated.is_empty() || !unexpected.is_empty() {
            duplicated.sort();
            unexpected.sort();
            return Err(ValidationError::IncompleteDimensions {
                missing,
                duplicated,
                unexpected,
            });
        }

        let mut samples = Vec::with_capacity(self.dimension_names.len());
        let mut failures = Vec::new();
        for name in &self.dimension_names {
            match usage.get(name) {
                Some(DimensionValue::Found(quantity)) => samples.push(DimensionSample::new(name.clone(), *quantity)),
                Some(DimensionValue::Missing(reason)) => failures.push((name.clone(), reason.clone())),
                None => failures.push((name.clone(), MissingReason::NotFound)),
            }
        }

        if !failures.is_empty() {
            return Err(ValidationError::DegenerateValue { failures });
        }

        Ok(UsageRecord {
            customer_id: customer_id.to_string(),
            window_end: window.end(),
            dimensions: samples,
            pending: true,
        })
    }
}
