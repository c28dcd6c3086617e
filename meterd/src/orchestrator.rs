//! One metering cycle.
//!
//! For every candidate window, oldest first: skip it if the store already has it, otherwise
//! collect, validate, conditionally insert and (optionally) bill. Windows are independent; any
//! failure is logged, counted and left for the next cycle, which is the only retry mechanism.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::billing::{BillingSink, MeterUsageBatch};
use crate::collector::{CollectorError, Dimension, UsageCollector};
use crate::metrics::MeteringMetrics;
use crate::record::{RecordAssembler, UsageRecord, ValidationError};
use crate::store::{DedupGate, InsertOutcome, UsageStore};
use crate::window::{TimeWindow, WindowClock};

/// What to meter: one customer, a fixed set of dimensions, and the window grid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeteringPlan {
    pub customer_id: String,
    pub dimensions: Vec<Dimension>,
    pub window_width: Duration,
    pub lookback: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BillingStatus {
    /// No billing sink configured; the record stays pending for reconciliation
    Disabled,
    /// The sink accepted the batch. `pending_cleared` is false when the store could not be
    /// updated afterwards.
    Submitted { pending_cleared: bool },
    /// The sink failed or refused the batch; the record stays pending
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WindowOutcome {
    /// The store already holds a record for this window
    AlreadyRecorded,
    /// A record was written during this cycle
    Recorded { billing: BillingStatus },
    /// Collected usage failed validation; nothing written
    Rejected(ValidationError),
    /// The metrics backend was unreachable; nothing written
    CollectionFailed(CollectorError),
    /// The dedup lookup failed; skipped without collecting
    DedupUnavailable,
    /// The conditional insert failed
    PersistFailed,
}

impl WindowOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::AlreadyRecorded => "already_recorded",
            Self::Recorded { .. } => "recorded",
            Self::Rejected(_) => "rejected",
            Self::CollectionFailed(_) => "collection_failed",
            Self::DedupUnavailable => "dedup_unavailable",
            Self::PersistFailed => "persist_failed",
        }
    }

    /// Whether the store holds a record for the window after this outcome
    pub fn is_recorded(&self) -> bool {
        matches!(self, Self::AlreadyRecorded | Self::Recorded { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WindowReport {
    pub window: TimeWindow,
    pub outcome: WindowOutcome,
}

/// Per-window outcomes of one cycle, oldest window first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    pub windows: Vec<WindowReport>,
}

impl CycleReport {
    /// Number of windows whose outcome has the given label
    pub fn count(&self, label: &str) -> usize {
        self.windows.iter().filter(|w| w.outcome.label() == label).count()
    }

    pub fn recorded(&self) -> usize {
        self.count("recorded")
    }
}

struct BillingTarget {
    sink: Arc<dyn BillingSink>,
    product_code: String,
}

pub struct MeteringOrchestrator {
    store: Arc<dyn UsageStore>,
    gate: DedupGate,
    collector: UsageCollector,
    billing: Option<BillingTarget>,
    metrics: MeteringMetrics,
}

impl MeteringOrchestrator {
    pub fn new(store: Arc<dyn UsageStore>, collector: UsageCollector, metrics: MeteringMetrics) -> Self {
        Self {
            gate: DedupGate::new(Arc::clone(&store), metrics.clone()),
            store,
            collector,
            billing: None,
            metrics,
        }
    }

    /// Forward every newly recorded window to `sink`, tagged with `product_code`.
    pub fn with_billing(mut self, sink: Arc<dyn BillingSink>, product_code: impl Into<String>) -> Self {
        self.billing = Some(BillingTarget {
            sink,
            product_code: product_code.into(),
        });
        self
    }

    /// Run one cycle over the windows that have elapsed at `now`.
    ///
    /// Never fails: an invalid plan (bad width or lookback, no dimensions) yields an empty report and every per-window failure is
    /// reflected in that window's outcome.
    #[tracing::instrument(skip_all, fields(customer_id = %plan.customer_id, now = %now))]
    pub async fn run_cycle(&self, plan: &MeteringPlan, now: DateTime<Utc>) -> CycleReport {
        let windows = match WindowClock::new(plan.window_width, plan.lookback).and_then(|c| c.enumerate(now)) {
            Ok(windows) => windows,
            Err(e) => {
                error!(error = %e, "Cannot enumerate billing windows");
                return CycleReport::default();
            }
        };

        if plan.dimensions.is_empty() {
            error!("Metering plan has no dimensions; refusing to record empty usage");
            return CycleReport::default();
        }

        let assembler = RecordAssembler::for_dimensions(&plan.dimensions);
        let newest = windows.len().saturating_sub(1);
        let mut report = CycleReport::default();

        for (index, window) in windows.into_iter().enumerate() {
            let outcome = self.process_window(plan, &assembler, &window).await;
            self.metrics.record_window(outcome.label());

            if matches!(outcome, WindowOutcome::Recorded { .. }) && index < newest {
                self.metrics.record_billed_late();
                info!(
                    window_start = %window.start(),
                    window_end = %window.end(),
                    "Window recorded late"
                );
            }

            report.windows.push(WindowReport { window, outcome });
        }

        if let Some(oldest) = report.windows.first() {
            match &oldest.outcome {
                outcome if outcome.is_recorded() => {}
                // Store state unknown; the outage is already counted as a store error
                WindowOutcome::DedupUnavailable => {}
                outcome => {
                    self.metrics.record_expired_unbilled();
                    warn!(
                        window_start = %oldest.window.start(),
                        window_end = %oldest.window.end(),
                        outcome = outcome.label(),
                        "Oldest window in lookback is still unrecorded; it leaves the lookback horizon at the next window boundary"
                    );
                }
            }
        }

        info!(
            windows = report.windows.len(),
            recorded = report.recorded(),
            already_recorded = report.count("already_recorded"),
            "Metering cycle complete"
        );
        report
    }

    async fn process_window(&self, plan: &MeteringPlan, assembler: &RecordAssembler, window: &TimeWindow) -> WindowOutcome {
        let customer_id = plan.customer_id.as_str();

        match self.gate.exists(customer_id, window).await {
            Ok(true) => {
                debug!(window_end = %window.end(), "Window already recorded");
                return WindowOutcome::AlreadyRecorded;
            }
            Ok(false) => {}
            // Logged and counted by the gate
            Err(_) => return WindowOutcome::DedupUnavailable,
        }

        let usage = match self.collector.collect(window, &plan.dimensions).await {
            Ok(usage) => usage,
            Err(e) => {
                error!(
                    customer_id,
                    window_start = %window.start(),
                    window_end = %window.end(),
                    error = %e,
                    "Usage collection failed"
                );
                return WindowOutcome::CollectionFailed(e);
            }
        };

        let record = match assembler.assemble(window, customer_id, &usage) {
            Ok(record) => record,
            Err(e) => {
                warn!(
                    customer_id,
                    window_start = %window.start(),
                    window_end = %window.end(),
                    error = %e,
                    "Usage record rejected"
                );
                return WindowOutcome::Rejected(e);
            }
        };

        self.metrics.record_store_operation("insert");
        match self.store.insert_if_absent(&record).await {
            Ok(InsertOutcome::Inserted) => {
                info!(
                    customer_id,
                    window_end = %record.window_end,
                    dimensions = ?record.dimensions,
                    "Usage record stored"
                );
                let billing = self.bill(&record).await;
                WindowOutcome::Recorded { billing }
            }
            Ok(InsertOutcome::AlreadyExists) => {
                info!(
                    customer_id,
                    window_end = %record.window_end,
                    "Usage record written concurrently by another process"
                );
                WindowOutcome::AlreadyRecorded
            }
            Err(e) => {
                self.metrics.record_store_error("insert");
                error!(
                    customer_id,
                    window_start = %window.start(),
                    window_end = %window.end(),
                    error = %e,
                    "Failed to store usage record"
                );
                WindowOutcome::PersistFailed
            }
        }
    }

    async fn bill(&self, record: &UsageRecord) -> BillingStatus {
        let Some(target) = &self.billing else {
            return BillingStatus::Disabled;
        };

        let batch = MeterUsageBatch::from_record(&target.product_code, record);
        match target.sink.submit(&batch).await {
            Ok(receipt) => {
                self.metrics.record_billing_request(&receipt.status.to_string());
                self.metrics.record_store_operation("mark_submitted");
                match self.store.mark_submitted(&record.customer_id, record.window_end).await {
                    Ok(()) => BillingStatus::Submitted { pending_cleared: true },
                    Err(e) => {
                        self.metrics.record_store_error("mark_submitted");
                        error!(
                            customer_id = %record.customer_id,
                            window_end = %record.window_end,
                            error = %e,
                            "Usage submitted but record could not be marked; it stays pending"
                        );
                        BillingStatus::Submitted { pending_cleared: false }
                    }
                }
            }
            Err(e) => {
                self.metrics.record_billing_request(&e.status_label());
                error!(
                    customer_id = %record.customer_id,
                    window_end = %record.window_end,
                    error = %e,
                    "Billing submission failed; record stays pending"
                );
                BillingStatus::Failed
            }
        }
    }
}
