//! Prometheus counters for the metering pipeline.
//!
//! Counters are registered against an injected [`Registry`] rather than the process-global
//! default, so every test can observe an isolated set and the binary can hand the registry to
//! whatever exposes it.

use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

/// Metering counters
#[derive(Clone)]
pub struct MeteringMetrics {
    /// Metrics backend queries attempted, by dimension
    query_operations: IntCounterVec,
    /// Metrics backend queries that produced no usable value, by dimension
    query_errors: IntCounterVec,
    /// Usage store calls, by operation
    store_operations: IntCounterVec,
    /// Failed usage store calls, by operation
    store_errors: IntCounterVec,
    /// Billing sink submissions, by status code (or "unreachable")
    billing_requests: IntCounterVec,
    /// Processed windows, by outcome
    windows: IntCounterVec,
    windows_expired_unbilled: IntCounter,
    windows_billed_late: IntCounter,
    registry: Registry,
}

impl MeteringMetrics {
    /// Create the counters and register them with `registry`
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let query_operations = IntCounterVec::new(
            Opts::new(
                "meterd_prometheus_query_operations_total",
                "Total number of queries issued to the metrics backend",
            ),
            &["dimension"],
        )?;
        registry.register(Box::new(query_operations.clone()))?;

        let query_errors = IntCounterVec::new(
            Opts::new(
                "meterd_prometheus_query_errors_total",
                "Total number of metrics backend queries that failed or returned no usable value",
            ),
            &["dimension"],
        )?;
        registry.register(Box::new(query_errors.clone()))?;

        let store_operations = IntCounterVec::new(
            Opts::new("meterd_store_operations_total", "Total number of usage store operations"),
            &["operation"],
        )?;
        registry.register(Box::new(store_operations.clone()))?;

        let store_errors = IntCounterVec::new(
            Opts::new("meterd_store_errors_total", "Total number of failed usage store operations"),
            &["operation"],
        )?;
        registry.register(Box::new(store_errors.clone()))?;

        let billing_requests = IntCounterVec::new(
            Opts::new("meterd_billing_requests_total", "Total number of billing sink submissions"),
            &["status"],
        )?;
        registry.register(Box::new(billing_requests.clone()))?;

        let windows = IntCounterVec::new(
            Opts::new("meterd_windows_total", "Total number of candidate windows processed"),
            &["outcome"],
        )?;
        registry.register(Box::new(windows.clone()))?;

        let windows_expired_unbilled = IntCounter::new(
            "meterd_windows_expired_unbilled_total",
            "Windows that left the lookback horizon without a usage record",
        )?;
        registry.register(Box::new(windows_expired_unbilled.clone()))?;

        let windows_billed_late = IntCounter::new(
            "meterd_windows_billed_late_total",
            "Windows recorded after the cycle in which they first became eligible",
        )?;
        registry.register(Box::new(windows_billed_late.clone()))?;

        Ok(Self {
            query_operations,
            query_errors,
            store_operations,
            store_errors,
            billing_requests,
            windows,
            windows_expired_unbilled,
            windows_billed_late,
            registry: registry.clone(),
        })
    }

    pub fn record_query_attempt(&self, dimension: &str) {
        self.query_operations.with_label_values(&[dimension]).inc();
    }

    pub fn record_query_error(&self, dimension: &str) {
        self.query_errors.with_label_values(&[dimension]).inc();
    }

    pub fn record_store_operation(&self, operation: &str) {
        self.store_operations.with_label_values(&[operation]).inc();
    }

    pub fn record_store_error(&self, operation: &str) {
        self.store_errors.with_label_values(&[operation]).inc();
    }

    pub fn record_billing_request(&self, status: &str) {
        self.billing_requests.with_label_values(&[status]).inc();
    }

    pub fn record_window(&self, outcome: &str) {
        self.windows.with_label_values(&[outcome]).inc();
    }

    pub fn record_expired_unbilled(&self) {
        self.windows_expired_unbilled.inc();
    }

    pub fn record_billed_late(&self) {
        self.windows_billed_late.inc();
    }

    pub fn query_operations(&self, dimension: &str) -> u64 {
        self.query_operations.with_label_values(&[dimension]).get()
    }

    pub fn query_errors(&self, dimension: &str) -> u64 {
        self.query_errors.with_label_values(&[dimension]).get()
    }

    pub fn store_operations(&self, operation: &str) -> u64 {
        self.store_operations.with_label_values(&[operation]).get()
    }

    pub fn store_errors(&self, operation: &str) -> u64 {
        self.store_errors.with_label_values(&[operation]).get()
    }

    pub fn billing_requests(&self, status: &str) -> u64 {
        self.billing_requests.with_label_values(&[status]).get()
    }

    pub fn windows(&self, outcome: &str) -> u64 {
        self.windows.with_label_values(&[outcome]).get()
    }

    pub fn expired_unbilled(&self) -> u64 {
        self.windows_expired_unbilled.get()
    }

    pub fn billed_late(&self) -> u64 {
        self.windows_billed_late.get()
    }

    /// Render every metric in the registry in the Prometheus text exposition format
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}
