//! PostgreSQL usage store.
//!
//! One row per `(customer_identifier, window_end)`; the primary key is what makes the insert
//! conditional across processes. Dimension usage is stored as a JSONB list of
//! `{"dimension": .., "value": ..}` objects.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use tracing::instrument;

use super::{InsertOutcome, Result, StoreError, UsageStore};
use crate::config::PoolSettings;
use crate::record::{DimensionSample, UsageRecord};

/// Get the usage store migrator
pub fn migrator() -> sqlx::migrate::Migrator {
    sqlx::migrate!("./migrations")
}

#[derive(Clone)]
pub struct PostgresUsageStore {
    pool: PgPool,
}

#[derive(sqlx::FromRow)]
struct UsageRecordRow {
    customer_identifier: String,
    window_end: DateTime<Utc>,
    dimension_usage: Json<Vec<DimensionSample>>,
    metering_pending: bool,
}

impl From<UsageRecordRow> for UsageRecord {
    fn from(row: UsageRecordRow) -> Self {
        Self {
            customer_id: row.customer_identifier,
            window_end: row.window_end,
            dimensions: row.dimension_usage.0,
            pending: row.metering_pending,
        }
    }
}

impl PostgresUsageStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect with the given pool settings and bring the schema up to date.
    pub async fn connect(url: &str, settings: &PoolSettings) -> Result<Self> {
        let mut options = PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .min_connections(settings.min_connections)
            .acquire_timeout(Duration::from_secs(settings.acquire_timeout_secs));

        if settings.idle_timeout_secs > 0 {
            options = options.idle_timeout(Duration::from_secs(settings.idle_timeout_secs));
        }
        if settings.max_lifetime_secs > 0 {
            options = options.max_lifetime(Duration::from_secs(settings.max_lifetime_secs));
        }

        let pool = options.connect(url).await?;
        migrator()
            .run(&pool)
            .await
            .map_err(|e| StoreError::Other(anyhow::anyhow!("failed to run migrations: {}", e)))?;

        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl UsageStore for PostgresUsageStore {
    #[instrument(skip(self), err)]
    async fn exists_in_range(&self, customer_id: &str, after: DateTime<Utc>, up_to: DateTime<Utc>) -> Result<bool> {
        let exists = sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM usage_records
                WHERE customer_identifier = $1
                  AND window_end > $2
                  AND window_end <= $3
            )
            "#,
        )
        .bind(customer_id)
        .bind(after)
        .bind(up_to)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }

    #[instrument(skip(self, record), fields(customer_id = %record.customer_id, window_end = %record.window_end), err)]
    async fn insert_if_absent(&self, record: &UsageRecord) -> Result<InsertOutcome> {
        let result = sqlx::query(
            r#"
            INSERT INTO usage_records (customer_identifier, window_end, dimension_usage, metering_pending)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (customer_identifier, window_end) DO NOTHING
            "#,
        )
        .bind(&record.customer_id)
        .bind(record.window_end)
        .bind(Json(&record.dimensions))
        .bind(record.pending)
        .execute(&self.pool)
        .await
        .map_err(StoreError::from);

        match result {
            Ok(done) if done.rows_affected() == 0 => Ok(InsertOutcome::AlreadyExists),
            Ok(_) => Ok(InsertOutcome::Inserted),
            Err(StoreError::UniqueViolation { .. }) => Ok(InsertOutcome::AlreadyExists),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self), err)]
    async fn get(&self, customer_id: &str, window_end: DateTime<Utc>) -> Result<Option<UsageRecord>> {
        let row = sqlx::query_as::<_, UsageRecordRow>(
            r#"
            SELECT customer_identifier, window_end, dimension_usage, metering_pending
            FROM usage_records
            WHERE customer_identifier = $1 AND window_end = $2
            "#,
        )
        .bind(customer_id)
        .bind(window_end)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(UsageRecord::from))
    }

    #[instrument(skip(self), err)]
    async fn pending_records(&self, customer_id: &str) -> Result<Vec<UsageRecord>> {
        let rows = sqlx::query_as::<_, UsageRecordRow>(
            r#"
            SELECT customer_identifier, window_end, dimension_usage, metering_pending
            FROM usage_records
            WHERE customer_identifier = $1 AND metering_pending
            ORDER BY window_end ASC
            "#,
        )
        .bind(customer_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(UsageRecord::from).collect())
    }

    #[instrument(skip(self), err)]
    async fn mark_submitted(&self, customer_id: &str, window_end: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE usage_records
            SET metering_pending = FALSE
            WHERE customer_identifier = $1 AND window_end = $2
            "#,
        )
        .bind(customer_id)
        .bind(window_end)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                customer_id: customer_id.to_string(),
                window_end,
            });
        }
        Ok(())
    }
}
