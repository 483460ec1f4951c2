use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    postgres::{PgConnectOptions, PgPoolOptions},
    PgPool,
};
use tracing::info;
use uuid::Uuid;

use super::{
    affected_one, collect_states, error::StoreError, is_stale, CheckboxStatus,
    CheckboxStore, CheckboxUpdate, UpdateOutcome,
};
use crate::config::DatabaseConfig;

/// Production checkbox store. The schema (`mcb.checkbox_t`,
/// `mcb.checkbox_details_t`) is provisioned outside this process.
pub struct PgCheckboxStore {
    pool: PgPool,
    checkbox_count: u32,
}

impl PgCheckboxStore {
    pub async fn connect(
        url: &str,
        config: &DatabaseConfig,
        checkbox_count: u32,
    ) -> Result<Self, StoreError> {
        let mut opts = PgConnectOptions::from_str(url)
            .map_err(|e| StoreError::from_sqlx("connect", None, e))?;
        if let Some(user) = &config.user {
            opts = opts.username(user);
        }
        if let Some(password) = &config.password {
            opts = opts.password(password);
        }

        let pool = PgPoolOptions::new()
            .min_connections(config.min_connections)
            .max_connections(config.max_connections)
            .max_lifetime(config.max_lifetime())
            .idle_timeout(config.idle_timeout())
            .acquire_timeout(config.acquire_timeout())
            .test_before_acquire(true)
            .connect_with(opts)
            .await
            .map_err(|e| StoreError::from_sqlx("connect", None, e))?;

        info!(
            min = config.min_connections,
            max = config.max_connections,
            "postgres pool ready"
        );
        Ok(Self {
            pool,
            checkbox_count,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl CheckboxStore for PgCheckboxStore {
    fn checkbox_count(&self) -> u32 {
        self.checkbox_count
    }

    async fn status(&self, checkbox_nbr: u32) -> Result<CheckboxStatus, StoreError> {
        const OP: &str = "status";
        let row: Option<(bool, DateTime<Utc>)> = sqlx::query_as(
            "SELECT c.checked_state, d.last_updated_date \
             FROM mcb.checkbox_t c \
             JOIN mcb.checkbox_details_t d ON c.checkbox_nbr = d.checkbox_nbr \
             WHERE c.checkbox_nbr = $1",
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

        // the row lock serializes concurrent consumers on one checkbox
        let last: Option<(Option<Uuid>, Option<String>)> = sqlx::query_as(
            "SELECT last_request_id, last_sequence_number FROM mcb.checkbox_details_t \
             WHERE checkbox_nbr = $1 FOR UPDATE",
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
            "UPDATE mcb.checkbox_t SET checked_state = $1 WHERE checkbox_nbr = $2",
        )
        .bind(update.checked)
        .bind(i64::from(nbr))
        .execute(&mut *tx)
        .await
        .map_err(err)?;
        affected_one(OP, nbr, result.rows_affected())?;

        let result = sqlx::query(
            "UPDATE mcb.checkbox_details_t \
             SET last_updated_by = $1, last_request_id = $2, \
                 last_sequence_number = $3, last_updated_date = $4 \
             WHERE checkbox_nbr = $5",
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
            "SELECT checkbox_nbr::BIGINT, checked_state \
             FROM mcb.checkbox_t ORDER BY checkbox_nbr",
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
