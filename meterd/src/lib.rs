//! # meterd: windowed usage metering
//!
//! `meterd` periodically measures a customer's resource consumption from Prometheus and records
//! it exactly once per billing window, even though it runs repeatedly, may crash, and may overlap
//! with other instances.
//!
//! ## Pipeline
//!
//! Each cycle walks the most recent fully elapsed windows, oldest first:
//!
//! 1. [`window::WindowClock`] enumerates the candidate windows from the current time.
//! 2. [`store::DedupGate`] skips windows the usage store already holds. If the store cannot be
//!    reached the window is skipped (fail closed).
//! 3. [`collector::UsageCollector`] queries every dimension at the window end, concurrently and
//!    with per-query deadlines. Failed dimensions are reported as missing, never as zero.
//! 4. [`record::RecordAssembler`] rejects the window unless every configured dimension has a
//!    usable value.
//! 5. The record is written with a conditional insert keyed by `(customer, window_end)`, and
//!    optionally forwarded to the billing sink.
//!
//! Nothing is retried in-process. A window that fails at any step is simply offered again by the
//! next cycle, for as long as it remains within the `lookback` horizon.
//!
//! ## Running
//!
//! ```bash
//! meterd -f config.yaml            # run until SIGTERM / Ctrl+C
//! meterd -f config.yaml --once     # run a single cycle and exit
//! meterd -f config.yaml --validate # check the configuration only
//! ```
//!
//! See [`config`] for the available settings.

use std::future::Future;
use std::sync::Arc;

use prometheus::Registry;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub mod backend;
pub mod billing;
pub mod collector;
pub mod config;
pub mod errors;
pub mod metrics;
pub mod orchestrator;
pub mod record;
pub mod scheduler;
pub mod store;
pub mod telemetry;
pub mod window;

#[cfg(test)]
mod test_utils;

pub use config::{Args, Config};
pub use errors::{Error, Result};
pub use metrics::MeteringMetrics;
pub use orchestrator::{CycleReport, MeteringOrchestrator, MeteringPlan, WindowOutcome};

use backend::PrometheusBackend;
use billing::HttpBillingSink;
use collector::UsageCollector;
use config::StoreConfig;
use scheduler::MeteringScheduler;
use store::{InMemoryUsageStore, PostgresUsageStore, UsageStore};

/// The wired-up metering daemon.
///
/// All collaborators are built once here and handed to the pipeline explicitly.
pub struct Application {
    scheduler: MeteringScheduler,
    metrics: MeteringMetrics,
}

impl Application {
    /// Build every collaborator from `config`. Connects to (and migrates) the PostgreSQL store
    /// when one is configured.
    pub async fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let registry = Registry::new();
        let metrics = MeteringMetrics::new(&registry)?;

        let store: Arc<dyn UsageStore> = match &config.store {
            StoreConfig::Memory => {
                warn!("Using the in-memory usage store; recorded windows are lost on restart");
                Arc::new(InMemoryUsageStore::new())
            }
            StoreConfig::Postgres { url, pool } => {
                info!(max_connections = pool.max_connections, "Connecting to PostgreSQL usage store");
                Arc::new(PostgresUsageStore::connect(url, pool).await?)
            }
        };

        let backend = Arc::new(PrometheusBackend::new(config.prometheus_url.clone()));
        let collector = UsageCollector::new(backend, metrics.clone(), config.collector_config());
        let mut orchestrator = MeteringOrchestrator::new(store, collector, metrics.clone());

        if config.billing.enabled {
            let url = config
                .billing
                .url
                .clone()
                .ok_or_else(|| Error::invalid_configuration("billing.url must be set when billing is enabled"))?;
            info!(url = %url, product_code = %config.product_code, "Billing submission enabled");
            orchestrator = orchestrator.with_billing(
                Arc::new(HttpBillingSink::new(url, config.billing.timeout)),
                config.product_code.clone(),
            );
        }

        let scheduler = MeteringScheduler::new(Arc::new(orchestrator), config.plan(), config.interval);

        Ok(Self { scheduler, metrics })
    }

    pub fn metrics(&self) -> &MeteringMetrics {
        &self.metrics
    }

    /// Run a single metering cycle.
    pub async fn run_once(&self) -> CycleReport {
        self.scheduler.run_once().await
    }

    /// Run cycles until `shutdown` resolves. A cycle in progress is allowed to finish.
    pub async fn run<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            shutdown.await;
            trigger.cancel();
        });

        self.scheduler.run(token).await;
        info!("Metering stopped");
        Ok(())
    }
}
