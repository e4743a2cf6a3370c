//! Database connection pool, migrations, and the PostgreSQL result store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use speedtest_common::ids;
use speedtest_common::models::{SpeedTestRecord, StoredSpeedTest};
use speedtest_engine::error::StoreError;
use speedtest_engine::store::ResultStore;

/// Connect to PostgreSQL and return a connection pool.
pub async fn connect(database_url: &str) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?;

    tracing::info!("connected to PostgreSQL");
    Ok(pool)
}

/// Run embedded SQL migrations.
pub async fn migrate(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    tracing::info!("database migrations complete");
    Ok(())
}

/// Result history in the `speed_tests` table.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

type SpeedTestRow = (String, f64, f64, Option<f64>, DateTime<Utc>);

#[async_trait]
impl ResultStore for PgStore {
    async fn list(&self) -> Result<Vec<StoredSpeedTest>, StoreError> {
        let rows = sqlx::query_as::<_, SpeedTestRow>(
            "SELECT id, download_speed, upload_speed, ping, timestamp \
             FROM speed_tests ORDER BY timestamp DESC, id DESC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;

        Ok(rows
            .into_iter()
            .map(|(id, download, upload, ping, timestamp)| StoredSpeedTest {
                id,
                record: SpeedTestRecord {
                    download_speed_mbps: download,
                    upload_speed_mbps: upload,
                    ping_ms: ping,
                    timestamp,
                },
            })
            .collect())
    }

    async fn insert(&self, record: SpeedTestRecord) -> Result<StoredSpeedTest, StoreError> {
        record.validate().map_err(StoreError::Invalid)?;
        let id = ids::speed_test_id();

        sqlx::query(
            "INSERT INTO speed_tests (id, download_speed, upload_speed, ping, timestamp) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(&id)
        .bind(record.download_speed_mbps)
        .bind(record.upload_speed_mbps)
        .bind(record.ping_ms)
        .bind(record.timestamp)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;

        tracing::info!(result_id = %id, "speed test stored");
        Ok(StoredSpeedTest { id, record })
    }
}
