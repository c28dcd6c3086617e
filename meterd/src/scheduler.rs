//! Periodic driver for metering cycles.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::orchestrator::{CycleReport, MeteringOrchestrator, MeteringPlan};

/// Runs one cycle on start and then one per interval tick.
///
/// Cycles never overlap: the next tick is only awaited once the current cycle has finished, and
/// ticks missed while a cycle overran are skipped rather than replayed.
pub struct MeteringScheduler {
    orchestrator: Arc<MeteringOrchestrator>,
    plan: MeteringPlan,
    interval: Duration,
}

impl MeteringScheduler {
    pub fn new(orchestrator: Arc<MeteringOrchestrator>, plan: MeteringPlan, interval: Duration) -> Self {
        Self {
            orchestrator,
            plan,
            interval,
        }
    }

    /// Run a single cycle against the current time.
    pub async fn run_once(&self) -> CycleReport {
        self.orchestrator.run_cycle(&self.plan, Utc::now()).await
    }

    /// Run until `shutdown` is cancelled. Cancellation is honoured between cycles.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            customer_id = %self.plan.customer_id,
            interval = %humantime::format_duration(self.interval),
            window_width = %humantime::format_duration(self.plan.window_width),
            lookback = self.plan.lookback,
            "Starting metering scheduler"
        );

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("Metering scheduler shutting down");
                    break;
                }
                _ = interval.tick() => {}
            }

            self.run_once().await;
        }
    }
}
