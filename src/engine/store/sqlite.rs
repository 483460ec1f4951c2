use std::{str::FromStr, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Sqlite,
};
use tracing::{debug, info};
use uuid::Uuid;

use super::{
    affected_one, collect_states, error::StoreError, is_stale, CheckboxStatus,
    CheckboxStore, CheckboxUpdate, UpdateOutcome,
};
use crate::config::DatabaseConfig;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS checkbox_t (
    checkbox_nbr INTEGER PRIMARY KEY,
    checked_state BOOLEAN NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS checkbox_details_t (
    checkbox_nbr INTEGER PRIMARY KEY REFERENCES checkbox_t (checkbox_nbr),
    last_updated_by BLOB,
    last_request_id BLOB,
    last_sequence_number TEXT,
    last_updated_date TEXT NOT NULL,
    init_date TEXT NOT NULL
);
"#;

/// SQLite-backed checkbox store for local runs and tests.
///
/// Holds a single connection: SQLite serializes writers anyway, and an
/// in-memory database lives exactly as long as its connection.
pub struct SqliteCheckboxStore {
    pool: Pool<Sqlite>,
    checkbox_count: u32,
}

impl SqliteCheckboxStore {
    /// Opens `url`, creating the schema and seeding `checkbox_count` unchecked
    /// checkboxes if the database is empty.
    pub async fn connect(
        url: &str,
        config: &DatabaseConfig,
        checkbox_count: u32,
    ) -> Result<Self, StoreError> {
        let opts = SqliteConnectOptions::from_str(url)
            .map_err(|e| StoreError::from_sqlx("connect", None, e))?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .acquire_timeout(config.acquire_timeout())
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await
            .map_err(|e| StoreError::from_sqlx("connect", None, e))?;

        let store = Self {
            pool,
            checkbox_count,
        };
        store.bootstrap().await?;
        Ok(store)
    }

    /// A private in-memory database with `checkbox_count` checkboxes.
    pub async fn memory(checkbox_count: u32) -> Result<Self, StoreError> {
        Self::connect("sqlite::memory:", &DatabaseConfig::default(), checkbox_count)
            .await
    }

    /// Creates both tables and seeds them when empty. Returns the number of
    /// checkboxes seeded, zero if the store was already populated.
    pub async fn bootstrap(&self) -> Result<u32, StoreError> {
        const OP: &str = "bootstrap";
        let err = |e| StoreError::from_sqlx(OP, None, e);

        sqlx::raw_sql(SCHEMA_SQL)
            .execute(&self.pool)
            .await
            .map_err(err)?;

        let populated: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM checkbox_t)")
                .fetch_one(&self.pool)
                .await
                .map_err(err)?;
        if populated {
            debug!("sqlite checkbox store already seeded");
            return Ok(0);
        }

        let mut tx = self.pool.begin().await.map_err(err)?;
        sqlx::query(
            "WITH RECURSIVE seq(n) AS (SELECT 0 UNION ALL SELECT n + 1 FROM seq WHERE n + 1 < ?) \
             INSERT INTO checkbox_t (checkbox_nbr, checked_state) SELECT n, 0 FROM seq",
        )
        .bind(i64::from(self.checkbox_count))
        .execute(&mut *tx)
        .await
        .map_err(err)?;
        let seeded_at = Utc::now();
        sqlx::query(
            "INSERT INTO checkbox_details_t (checkbox_nbr, last_updated_date, init_date) \
             SELECT checkbox_nbr, ?, ? FROM checkbox_t",
        )
        .bind(seeded_at)
        .bind(seeded_at)
        .execute(&mut *tx)
        .await
        .map_err(err)?;
        tx.commit().await.map_err(err)?;

        info!(checkboxes = self.checkbox_count, "sqlite checkbox store seeded");
        Ok(self.checkbox_count)
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

#[async_trait]
impl CheckboxStore for SqliteCheckboxStore {
    fn checkbox_count(&self) -> u32 {
        self.checkbox_count
    }

    async fn status(&self, checkbox_nbr: u32) -> Result<CheckboxStatus, StoreError> {
        const OP: &str = "status";
        let row: Option<(bool, DateTime<Utc>)> = sqlx::query_as(
            "SELECT c.checked_state, d.last_updated_date \
             FROM checkbox_t c \
             JOIN checkbox_details_t d ON c.checkbox_nbr = d.checkbox_nbr \
             WHERE c.checkbox_nbr = ?",
        )
        .bind(i64::from(checkbox_nbr))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::from_sqlx(OP, Some(checkbox_nbr), e))?;

        let (checked, last_updated) = row.ok_or(StoreError::NotFound {
            operation: OP,
            checkbox_nbr,
        })?;
        Ok(CheckboxStatus {
            checked,
            last_updated,
        })
    }

    async fn update_checkbox(
        &self,
        update: &CheckboxUpdate,
    ) -> Result<UpdateOutcome, StoreError> {
        const OP: &str = "update_checkbox";
        let nbr = update.checkbox_nbr;
        let err = |e| StoreError::from_sqlx(OP, Some(nbr), e);

        let mut tx = self.pool.begin().await.map_err(err)?;

        let last: Option<(Option<Uuid>, Option<String>)> = sqlx::query_as(
            "SELECT last_request_id, last_sequence_number \
             FROM checkbox_details_t WHERE checkbox_nbr = ?",
        )
        .bind(i64::from(nbr))
        .fetch_optional(&mut *tx)
        .await
        .map_err(err)?;
        let (last_request, last_sequence) = last.unwrap_or_default();
        if last_request == Some(update.request_id) {
            tx.rollback().await.map_err(err)?;
            return Ok(UpdateOutcome::Replayed);
        }
        if is_stale(last_sequence.as_deref(), update.sequence) {
            tx.rollback().await.map_err(err)?;
            return Ok(UpdateOutcome::Stale);
        }

        let result = sqlx::query(
            "UPDATE checkbox_t SET checked_state = ? WHERE checkbox_nbr = ?",
        )
        .bind(update.checked)
        .bind(i64::from(nbr))
        .execute(&mut *tx)
        .await
        .map_err(err)?;
        affected_one(OP, nbr, result.rows_affected())?;

        let result = sqlx::query(
            "UPDATE checkbox_details_t \
             SET last_updated_by = ?, last_request_id = ?, \
                 last_sequence_number = ?, last_updated_date = ? \
             WHERE checkbox_nbr = ?",
        )
        .bind(update.user_id)
        .bind(update.request_id)
        .bind(update.sequence.map(|s| s.to_string()))
        .bind(Utc::now())
        .bind(i64::from(nbr))
        .execute(&mut *tx)
        .await
        .map_err(err)?;
        affected_one(OP, nbr, result.rows_affected())?;

        tx.commit().await.map_err(err)?;
        Ok(UpdateOutcome::Applied)
    }

    async fn full_store(&self) -> Result<Vec<bool>, StoreError> {
        let rows = sqlx::query_as::<_, (i64, bool)>(
            "SELECT checkbox_nbr, checked_state FROM checkbox_t ORDER BY checkbox_nbr",
        )
        .fetch(&self.pool);
        collect_states(rows, self.checkbox_count).await
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::from_sqlx("health_check", None, e))?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
