//! Daemon configuration.
//!
//! Configuration is loaded from a YAML file with environment variable overrides. The file path
//! defaults to `config.yaml` and can be set with `-f` or `METERD_CONFIG`.
//!
//! ## Loading Priority
//!
//! Later sources override earlier ones:
//!
//! 1. **YAML config file** (default: `config.yaml`)
//! 2. **Environment variables** prefixed with `METERD_`; nested keys use `__`, for example
//!    `METERD_BILLING__ENABLED=true`
//! 3. **DATABASE_URL** switches the usage store to PostgreSQL at that URL, keeping any pool
//!    settings from the file
//!
//! ## Example
//!
//! ```yaml
//! prometheus_url: http://prometheus:9090
//! product_code: prod-abc123
//! customer_identifier: ACME
//! window_width: 1h
//! lookback: 3
//! interval: 1h
//! dimensions:
//!   - name: cpu
//!     query: billing:cpu_capacity:last1h
//! store:
//!   type: postgres
//!   url: postgres://meterd@localhost/meterd
//! ```

use std::collections::HashSet;
use std::time::Duration;

use clap::Parser;
use figment::providers::{Env, Format, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::collector::{CollectorConfig, Dimension};
use crate::errors::Error;
use crate::orchestrator::MeteringPlan;

/// Simple CLI args - just for specifying config file
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short = 'f', long, env = "METERD_CONFIG", default_value = "config.yaml")]
    pub config: String,

    /// Validate configuration and exit without starting the pipeline.
    #[arg(long)]
    pub validate: bool,

    /// Run a single metering cycle and exit.
    #[arg(long)]
    pub once: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Base URL of the Prometheus server
    pub prometheus_url: Url,
    /// Product code attached to billing submissions
    pub product_code: String,
    /// Customer whose usage this instance meters
    pub customer_identifier: String,
    pub dimensions: Vec<Dimension>,
    /// Width of a billing window; windows are aligned to the Unix epoch
    #[serde(with = "humantime_serde")]
    pub window_width: Duration,
    /// Number of most recent elapsed windows considered each cycle
    pub lookback: u32,
    /// Time between metering cycles
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Deadline for one dimension query
    #[serde(with = "humantime_serde")]
    pub query_timeout: Duration,
    /// Deadline for all dimension queries of one window
    #[serde(with = "humantime_serde")]
    pub window_timeout: Duration,
    pub max_concurrent_queries: usize,
    pub store: StoreConfig,
    pub billing: BillingConfig,
    /// Export spans over OTLP (see `telemetry`)
    pub enable_otel_export: bool,
    /// Set from the `DATABASE_URL` environment variable
    #[serde(skip_serializing)]
    pub database_url: Option<String>,
}

/// Where usage records are kept.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StoreConfig {
    /// Process memory; records are lost on restart
    Memory,
    Postgres {
        url: String,
        #[serde(default)]
        pool: PoolSettings,
    },
}

/// Individual pool configuration with all SQLx parameters.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolSettings {
    /// Maximum number of connections in the pool
    pub max_connections: u32,
    /// Minimum number of idle connections to maintain
    pub min_connections: u32,
    /// Maximum time to wait for a connection (seconds)
    pub acquire_timeout_secs: u64,
    /// Time before idle connections are closed (seconds, 0 = never)
    pub idle_timeout_secs: u64,
    /// Maximum lifetime of a connection (seconds, 0 = never)
    pub max_lifetime_secs: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 4,
            min_connections: 0,
            acquire_timeout_secs: 10,
            idle_timeout_secs: 600,
            max_lifetime_secs: 1800,
        }
    }
}

/// Forwarding of recorded usage to the billing sink.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct BillingConfig {
    pub enabled: bool,
    /// Endpoint receiving usage batches as JSON
    pub url: Option<Url>,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: None,
            timeout: Duration::from_secs(10),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            prometheus_url: Url::parse("http://localhost:9090").unwrap(),
            product_code: String::new(),
            customer_identifier: String::new(),
            dimensions: vec![
                Dimension::new("cpu", "billing:cpu_capacity:last1h"),
                Dimension::new("memory", "billing:mem_capacity:last1h"),
                Dimension::new("storage", "billing:storage_capacity:last1h"),
            ],
            window_width: Duration::from_secs(3600),
            lookback: 3,
            interval: Duration::from_secs(3600),
            query_timeout: Duration::from_secs(5),
            window_timeout: Duration::from_secs(10),
            max_concurrent_queries: 4,
            store: StoreConfig::Memory,
            billing: BillingConfig::default(),
            enable_otel_export: false,
            database_url: None,
        }
    }
}

impl Config {
    #[allow(clippy::result_large_err)]
    pub fn load(args: &Args) -> Result<Self, figment::Error> {
        let mut config: Self = Self::figment(args).extract()?;

        // DATABASE_URL wins over the configured store, keeping pool settings if any
        if let Some(url) = config.database_url.take() {
            let pool = match &config.store {
                StoreConfig::Postgres { pool, .. } => pool.clone(),
                StoreConfig::Memory => PoolSettings::default(),
            };
            config.store = StoreConfig::Postgres { url, pool };
        }

        config.validate().map_err(|e| figment::Error::from(e.to_string()))?;
        Ok(config)
    }

    pub fn figment(args: &Args) -> Figment {
        Figment::new()
            .merge(Yaml::file(&args.config))
            // METERD_CONFIG names the file itself and is not a setting
            .merge(Env::prefixed("METERD_").ignore(&["config"]).split("__"))
            .merge(Env::raw().only(&["DATABASE_URL"]))
    }

    /// Validate the configuration for consistency and required fields
    pub fn validate(&self) -> Result<(), Error> {
        if self.customer_identifier.trim().is_empty() {
            return Err(Error::invalid_configuration("customer_identifier must be set"));
        }
        if self.product_code.trim().is_empty() {
            return Err(Error::invalid_configuration("product_code must be set"));
        }

        if self.dimensions.is_empty() {
            return Err(Error::invalid_configuration("at least one dimension must be configured"));
        }
        let mut names = HashSet::new();
        for dimension in &self.dimensions {
            if dimension.name.trim().is_empty() {
                return Err(Error::invalid_configuration("dimension names must not be empty"));
            }
            if dimension.query.trim().is_empty() {
                return Err(Error::invalid_configuration(format!(
                    "dimension '{}' has an empty query",
                    dimension.name
                )));
            }
            if !names.insert(dimension.name.as_str()) {
                return Err(Error::invalid_configuration(format!(
                    "dimension '{}' is configured more than once",
                    dimension.name
                )));
            }
        }

        if self.window_width.is_zero() || self.window_width.subsec_nanos() != 0 {
            return Err(Error::invalid_configuration(format!(
                "window_width must be a positive whole number of seconds, got {}",
                humantime::format_duration(self.window_width)
            )));
        }
        if self.lookback == 0 {
            return Err(Error::invalid_configuration("lookback must be at least 1"));
        }
        if self.interval.is_zero() {
            return Err(Error::invalid_configuration("interval must be greater than zero"));
        }

        if self.query_timeout.is_zero() || self.window_timeout.is_zero() {
            return Err(Error::invalid_configuration("query_timeout and window_timeout must be greater than zero"));
        }
        if self.query_timeout > self.window_timeout {
            return Err(Error::invalid_configuration(format!(
                "query_timeout ({}) cannot be greater than window_timeout ({})",
                humantime::format_duration(self.query_timeout),
                humantime::format_duration(self.window_timeout)
            )));
        }
        if self.max_concurrent_queries == 0 {
            return Err(Error::invalid_configuration("max_concurrent_queries must be at least 1"));
        }

        if let StoreConfig::Postgres { url, .. } = &self.store {
            if url.trim().is_empty() {
                return Err(Error::invalid_configuration("store.url must be set for the postgres store"));
            }
        }

        if self.billing.enabled {
            if self.billing.url.is_none() {
                return Err(Error::invalid_configuration("billing.url must be set when billing is enabled"));
            }
            if self.billing.timeout.is_zero() {
                return Err(Error::invalid_configuration("billing.timeout must be greater than zero"));
            }
        }

        Ok(())
    }

    pub fn plan(&self) -> MeteringPlan {
        MeteringPlan {
            customer_id: self.customer_identifier.clone(),
            dimensions: self.dimensions.clone(),
            window_width: self.window_width,
            lookback: self.lookback,
        }
    }

    pub fn collector_config(&self) -> CollectorConfig {
        CollectorConfig {
            query_timeout: self.query_timeout,
            window_timeout: self.window_timeout,
            max_concurrent_queries: self.max_concurrent_queries,
        }
    }
}
