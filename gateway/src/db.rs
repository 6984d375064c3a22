use crate::errors::{Error, Result};
use crate::metrics::DB_FAILURES_TOTAL;
use crate::model::{DeviceRecord, DeviceStatus, TelemetrySample};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use std::time::Duration;
use tracing::{error, info, warn};

/// Durable write path for accepted samples.
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    /// Marks the device online (creating it on first sight) and appends the
    /// sample. Idempotent on the device row.
    async fn upsert_device_and_sample(&self, sample: &TelemetrySample) -> Result<DeviceRecord>;
}

pub async fn make_pool(database_url: &str) -> Result<PgPool> {
    info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(20)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await?;

    info!("Database connection established");
    info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Migrations completed");

    Ok(pool)
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    max_attempts: u32,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            max_attempts: 5,
        }
    }

    async fn upsert_inner(&self, sample: &TelemetrySample) -> Result<DeviceRecord> {
        let recorded_at = sample.recorded_at();
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            r#"
            INSERT INTO devices (id, name, status, last_seen, created_at)
            VALUES ($1, $1, $2, NOW(), NOW())
            ON CONFLICT (id) DO UPDATE
                SET status = EXCLUDED.status, last_seen = EXCLUDED.last_seen
            RETURNING id, name, status, last_seen, created_at
            "#,
        )
        .bind(&sample.device_id)
        .bind(DeviceStatus::Online.as_str())
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO device_data (device_id, temperature, humidity, weight, battery, ts)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(&sample.device_id)
        .bind(sample.temperature)
        .bind(sample.humidity)
        .bind(sample.weight)
        .bind(sample.battery)
        .bind(recorded_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        let status: String = row.try_get("status")?;
        Ok(DeviceRecord {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            status: status.parse().map_err(Error::Validation)?,
            last_seen: row.try_get::<DateTime<Utc>, _>("last_seen")?,
            created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        })
    }
}

#[async_trait]
impl PersistenceGateway for PgStore {
    async fn upsert_device_and_sample(&self, sample: &TelemetrySample) -> Result<DeviceRecord> {
        let mut attempts = 0;

        loop {
            attempts += 1;
            match self.upsert_inner(sample).await {
                Ok(record) => return Ok(record),
                Err(Error::Database(db_err))
                    if attempts < self.max_attempts && is_transient_error(&db_err) =>
                {
                    let wait_ms = 100 * 2_u64.pow(attempts - 1).min(32);
                    warn!(
                        "Upsert for {} failed (attempt {}/{}), retrying in {}ms: {}",
                        sample.device_id, attempts, self.max_attempts, wait_ms, db_err
                    );
                    DB_FAILURES_TOTAL.inc();
                    tokio::time::sleep(Duration::from_millis(wait_ms)).await;
                }
                Err(e) => {
                    error!(
                        "Upsert for {} failed permanently after {} attempts: {}",
                        sample.device_id, attempts, e
                    );
                    return Err(e);
                }
            }
        }
    }
}

fn is_transient_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed => true,
        sqlx::Error::Database(db_err) => {
            db_err.code().is_some_and(|code| {
                code == "08000" || // connection_exception
                code == "08003" || // connection_does_not_exist
                code == "08006" || // connection_failure
                code == "57P03" || // cannot_connect_now
                code == "53300" || // too_many_connections
                code == "40001" // serialization_failure
            })
        }
        _ => false,
    }
}
