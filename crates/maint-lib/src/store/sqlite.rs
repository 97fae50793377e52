//! SQLite-backed data store

use super::DataStore;
use crate::error::{MaintenanceError, MaintenanceResult};
use crate::models::{BatchQuery, BatchRecord, NewRecord, PublishedModel};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, instrument};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS ml_data (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        model_name TEXT NOT NULL,
        payload TEXT NOT NULL,
        is_training_data INTEGER NOT NULL,
        can_be_deleted INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_ml_data_model
        ON ml_data (model_name, is_training_data, can_be_deleted, id)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS ml_model (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        model_name TEXT NOT NULL,
        checksum TEXT NOT NULL,
        score REAL NOT NULL,
        last_id_processed INTEGER NOT NULL,
        published_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS ml_service_status (
        service_id TEXT PRIMARY KEY,
        status TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
];

/// Connection settings for the SQLite store
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database URL, e.g. `sqlite://maintenance.db` or `sqlite::memory:`
    pub database_url: String,
    /// Maximum pooled connections
    pub max_connections: u32,
    /// Timeout applied to every statement except the bulk delete
    pub command_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://maintenance.db".to_string(),
            max_connections: 4,
            command_timeout: Duration::from_secs(30),
        }
    }
}

/// [`DataStore`] over a SQLite connection pool
#[derive(Debug, Clone)]
pub struct SqliteDataStore {
    pool: SqlitePool,
    command_timeout: Duration,
}

impl SqliteDataStore {
    /// Connect and bootstrap the schema
    pub async fn connect(config: &StoreConfig) -> MaintenanceResult<Self> {
        let options = SqliteConnectOptions::from_str(&config.database_url)?.create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .acquire_timeout(config.command_timeout)
            .connect_with(options)
            .await?;

        let store = Self::from_pool(pool, config.command_timeout);
        store.ensure_schema().await?;

        info!(url = %config.database_url, "Connected to data store");
        Ok(store)
    }

    /// Wrap an existing pool without touching the schema
    pub fn from_pool(pool: SqlitePool, command_timeout: Duration) -> Self {
        Self {
            pool,
            command_timeout,
        }
    }

    /// Create the tables the engine reads and writes
    pub async fn ensure_schema(&self) -> MaintenanceResult<()> {
        for statement in SCHEMA {
            self.timed("ensure schema", sqlx::query(statement).execute(&self.pool))
                .await?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn command_timeout(&self) -> Duration {
        self.command_timeout
    }

    /// Run a statement under the command timeout
    pub(crate) async fn timed<T, F>(&self, operation: &str, fut: F) -> MaintenanceResult<T>
    where
        F: Future<Output = Result<T, sqlx::Error>>,
    {
        match tokio::time::timeout(self.command_timeout, fut).await {
            Ok(result) => {
                result.map_err(|e| MaintenanceError::DataAccess(format!("{}: {}", operation, e)))
            }
            Err(_) => Err(MaintenanceError::DataAccess(format!(
                "{} timed out after {}s",
                operation,
                self.command_timeout.as_secs()
            ))),
        }
    }
}

#[async_trait]
impl DataStore for SqliteDataStore {
    #[instrument(skip(self), fields(model = %query.model_name, training = query.is_training))]
    async fn fetch_batch(&self, query: &BatchQuery) -> MaintenanceResult<Vec<BatchRecord>> {
        let rows = self
            .timed(
                "fetch batch",
                sqlx::query(
                    r#"
                    SELECT id, payload FROM (
                        SELECT id, payload FROM ml_data
                        WHERE model_name = ?1
                          AND is_training_data = ?2
                          AND can_be_deleted = 0
                          AND id > ?3
                        ORDER BY created_at DESC, id DESC
                        LIMIT ?4
                    )
                    ORDER BY id ASC
                    "#,
                )
                .bind(&query.model_name)
                .bind(query.is_training)
                .bind(query.after_id)
                .bind(query.max_records.max(0))
                .fetch_all(&self.pool),
            )
            .await?;

        let records = rows
            .iter()
            .map(|row| {
                Ok(BatchRecord {
                    id: row.try_get("id")?,
                    payload: row.try_get("payload")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()?;

        debug!(records = records.len(), after_id = query.after_id, "Fetched batch");
        Ok(records)
    }

    async fn count_unprocessed(
        &self,
        model_name: &str,
        is_training: bool,
        last_id: i64,
    ) -> MaintenanceResult<u64> {
        let count: i64 = self
            .timed(
                "count unprocessed",
                sqlx::query_scalar(
                    r#"
                    SELECT COUNT(*) FROM ml_data
                    WHERE model_name = ?1 AND is_training_data = ?2
                      AND can_be_deleted = 0 AND id > ?3
                    "#,
                )
                .bind(model_name)
                .bind(is_training)
                .bind(last_id)
                .fetch_one(&self.pool),
            )
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn count_processed_under_cap(
        &self,
        model_name: &str,
        is_training: bool,
        last_id: i64,
        cap: i64,
    ) -> MaintenanceResult<u64> {
        let count: i64 = self
            .timed(
                "count processed",
                sqlx::query_scalar(
                    r#"
                    SELECT COUNT(*) FROM (
                        SELECT id FROM ml_data
                        WHERE model_name = ?1 AND is_training_data = ?2 AND id <= ?3
                        ORDER BY id DESC
                        LIMIT ?4
                    )
                    "#,
                )
                .bind(model_name)
                .bind(is_training)
                .bind(last_id)
                .bind(cap.max(0))
                .fetch_one(&self.pool),
            )
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn delete_marked(&self) -> MaintenanceResult<u64> {
        // Background maintenance: no command timeout
        let result = sqlx::query("DELETE FROM ml_data WHERE can_be_deleted = 1")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn insert_records(&self, records: &[NewRecord]) -> MaintenanceResult<u64> {
        if records.is_empty() {
            return Ok(0);
        }

        let pool = &self.pool;
        self.timed("insert records", async move {
            let mut tx = pool.begin().await?;
            let now = Utc::now();
            for record in records {
                sqlx::query(
                    r#"
                    INSERT INTO ml_data (model_name, payload, is_training_data, can_be_deleted, created_at)
                    VALUES (?1, ?2, ?3, 0, ?4)
                    "#,
                )
                .bind(&record.model_name)
                .bind(&record.payload)
                .bind(record.is_training_data)
                .bind(now)
                .execute(&mut *tx)
                .await?;
            }
            tx.commit().await?;
            Ok::<_, sqlx::Error>(records.len() as u64)
        })
        .await
    }

    async fn mark_model_deletable(&self, model_name: &str) -> MaintenanceResult<u64> {
        let result = self
            .timed(
                "mark deletable",
                sqlx::query("UPDATE ml_data SET can_be_deleted = 1 WHERE model_name = ?1")
                    .bind(model_name)
                    .execute(&self.pool),
            )
            .await?;
        Ok(result.rows_affected())
    }

    async fn record_published_model(&self, model: &PublishedModel) -> MaintenanceResult<()> {
        self.timed(
            "record published model",
            sqlx::query(
                r#"
                INSERT INTO ml_model (model_name, checksum, score, last_id_processed, published_at)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
            )
            .bind(&model.model_name)
            .bind(&model.checksum)
            .bind(model.score)
            .bind(model.last_id_processed)
            .bind(model.published_at)
            .execute(&self.pool),
        )
        .await?;
        Ok(())
    }

    async fn load_status(&self, key: &str) -> MaintenanceResult<Option<String>> {
        self.timed(
            "load status",
            sqlx::query_scalar("SELECT status FROM ml_service_status WHERE service_id = ?1")
                .bind(key)
                .fetch_optional(&self.pool),
        )
        .await
    }

    async fn save_status(&self, key: &str, blob: &str) -> MaintenanceResult<()> {
        self.timed(
            "save status",
            sqlx::query(
                r#"
                INSERT INTO ml_service_status (service_id, status, updated_at)
                VALUES (?1, ?2, ?3)
                ON CONFLICT(service_id) DO UPDATE
                    SET status = excluded.status, updated_at = excluded.updated_at
                "#,
            )
            .bind(key)
            .bind(blob)
            .bind(Utc::now())
            .execute(&self.pool),
        )
        .await?;
        Ok(())
    }
}
