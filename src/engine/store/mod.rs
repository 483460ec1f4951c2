//! Durable checkbox state.
//!
//! Two tables keyed by checkbox number: `checkbox_t` holds the state itself
//! and `checkbox_details_t` who last changed it, with which request, and
//! when. Both are written in one transaction, and the request id recorded in
//! the details row is what makes a redelivered action a no-op. The details
//! row also keeps the transport sequence number of the last applied action,
//! so an action that arrives after a newer one has landed is refused.

use std::{future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{Stream, TryStreamExt};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, debug_span, error, warn, Instrument};
use uuid::Uuid;

use crate::{config::Config, engine::queue::wire::ValidatedAction, Error, Result};

pub mod error;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod sqlite;

use self::error::StoreError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CheckboxStatus {
    pub checked: bool,
    pub last_updated: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CheckboxUpdate {
    pub checkbox_nbr: u32,
    pub checked: bool,
    pub user_id: Uuid,
    pub request_id: Uuid,
    /// Position of the action in its checkbox's transport order, when the
    /// transport assigns one.
    pub sequence: Option<u128>,
}

impl CheckboxUpdate {
    pub fn with_sequence(mut self, sequence: Option<u128>) -> Self {
        self.sequence = sequence;
        self
    }
}

impl From<&ValidatedAction> for CheckboxUpdate {
    fn from(action: &ValidatedAction) -> Self {
        Self {
            checkbox_nbr: action.checkbox_nbr,
            checked: action.checked,
            user_id: action.user_id,
            request_id: action.request_id,
            sequence: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Both rows were written and committed.
    Applied,
    /// The details row already carries this request id; nothing was written.
    Replayed,
    /// A later action on the same checkbox is already applied; nothing was
    /// written.
    Stale,
}

/// Whether an update at `incoming` must be refused because the details row
/// already records `stored`. Unknown or unparseable positions never refuse.
pub(crate) fn is_stale(stored: Option<&str>, incoming: Option<u128>) -> bool {
    match (stored.and_then(|s| s.parse::<u128>().ok()), incoming) {
        (Some(stored), Some(incoming)) => stored >= incoming,
        _ => false,
    }
}

#[async_trait]
pub trait CheckboxStore: Send + Sync {
    /// Number of checkboxes the store holds, numbered `0..count`.
    fn checkbox_count(&self) -> u32;

    async fn status(&self, checkbox_nbr: u32) -> Result<CheckboxStatus, StoreError>;

    /// Writes the state row and then the details row in one transaction.
    /// Either both change or neither does.
    async fn update_checkbox(
        &self,
        update: &CheckboxUpdate,
    ) -> Result<UpdateOutcome, StoreError>;

    /// Every checkbox state, indexed by checkbox number.
    async fn full_store(&self) -> Result<Vec<bool>, StoreError>;

    async fn health_check(&self) -> Result<(), StoreError>;

    async fn close(&self);
}

/// Drains `(checkbox_nbr, checked_state)` rows ordered by number, insisting
/// on exactly `0..count`.
pub(crate) async fn collect_states<S>(
    mut rows: S,
    count: u32,
) -> Result<Vec<bool>, StoreError>
where
    S: Stream<Item = Result<(i64, bool), sqlx::Error>> + Unpin,
{
    let mut states = Vec::with_capacity(count as usize);
    while let Some((nbr, checked)) = rows
        .try_next()
        .await
        .map_err(|e| StoreError::from_sqlx("full_store", None, e))?
    {
        let expected = states.len() as u32;
        if nbr != i64::from(expected) {
            return Err(StoreError::Gap {
                expected,
                found: nbr,
            });
        }
        states.push(checked);
    }
    if states.len() != count as usize {
        return Err(StoreError::RowCount {
            expected: count,
            found: states.len() as u64,
        });
    }
    Ok(states)
}

pub(crate) fn affected_one(
    operation: &'static str,
    checkbox_nbr: u32,
    rows_affected: u64,
) -> Result<(), StoreError> {
    match rows_affected {
        1 => Ok(()),
        0 => Err(StoreError::NotFound {
            operation,
            checkbox_nbr,
        }),
        n => Err(StoreError::Constraint {
            operation,
            checkbox_nbr: Some(checkbox_nbr),
            reason: format!("{n} rows matched a single checkbox"),
        }),
    }
}

/// The handle the rest of the engine holds on the store. Every call is
/// bounded by the operation timeout and every failure is logged here with its
/// operation and checkbox before it is returned.
#[derive(Clone)]
pub struct Gateway {
    store: Arc<dyn CheckboxStore>,
    operation_timeout: Duration,
}

impl Gateway {
    pub fn new(store: Arc<dyn CheckboxStore>, operation_timeout: Duration) -> Self {
        Self {
            store,
            operation_timeout,
        }
    }

    /// Opens the store named by `database.url`: `postgres://` or `sqlite:`.
    pub async fn connect(config: &Config) -> Result<Self> {
        let url = config.database.require_url()?;
        let count = config.checkbox_count;
        let store: Arc<dyn CheckboxStore> = if url.starts_with("sqlite:") {
            Arc::new(
                sqlite::SqliteCheckboxStore::connect(url, &config.database, count)
                    .await?,
            )
        } else if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            connect_postgres(url, config).await?
        } else {
            return Err(Error::Config(format!(
                "unsupported database url scheme in {url:?}"
            )));
        };
        Ok(Self::new(store, config.database.operation_timeout()))
    }

    pub fn checkbox_count(&self) -> u32 {
        self.store.checkbox_count()
    }

    pub async fn status(&self, checkbox_nbr: u32) -> Result<CheckboxStatus> {
        self.check_range(checkbox_nbr)?;
        self.bounded("status", Some(checkbox_nbr), self.store.status(checkbox_nbr))
            .await
    }

    pub async fn update_checkbox(
        &self,
        update: &CheckboxUpdate,
    ) -> Result<UpdateOutcome> {
        self.check_range(update.checkbox_nbr)?;
        let outcome = self
            .bounded(
                "update_checkbox",
                Some(update.checkbox_nbr),
                self.store.update_checkbox(update),
            )
            .await?;
        debug!(
            checkbox_nbr = update.checkbox_nbr,
            checked = update.checked,
            request_id = %update.request_id,
            ?outcome,
            "checkbox update committed"
        );
        Ok(outcome)
    }

    pub async fn full_store(&self) -> Result<Vec<bool>> {
        self.bounded("full_store", None, self.store.full_store()).await
    }

    pub async fn health_check(&self) -> Result<()> {
        self.bounded("health_check", None, self.store.health_check())
            .await
    }

    pub async fn close(&self) {
        self.store.close().await;
    }

    /// Runs [`Gateway::health_check`] every `period` until `shutdown` flips.
    pub fn spawn_health_check(
        &self,
        period: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let gateway = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        // failures are already logged by `bounded`
                        let _ = gateway.health_check().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            return;
                        }
                    }
                }
            }
        })
    }

    fn check_range(&self, checkbox_nbr: u32) -> Result<()> {
        let count = self.store.checkbox_count();
        if checkbox_nbr >= count {
            return Err(StoreError::InvalidCheckbox {
                checkbox_nbr,
                count,
            }
            .into());
        }
        Ok(())
    }

    async fn bounded<T, F>(
        &self,
        operation: &'static str,
        checkbox_nbr: Option<u32>,
        call: F,
    ) -> Result<T>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        let span = debug_span!("gateway", operation, checkbox_nbr);
        let result = tokio::time::timeout(self.operation_timeout, call)
            .instrument(span)
            .await
            .unwrap_or(Err(StoreError::Timeout {
                operation,
                checkbox_nbr,
            }));

        match result {
            Ok(value) => Ok(value),
            Err(e) => {
                match &e {
                    StoreError::NotFound { .. } => {
                        debug!(operation, ?checkbox_nbr, "checkbox not found")
                    }
                    StoreError::RowCount { .. } | StoreError::Gap { .. } => {
                        error!(operation, error = %e, "checkbox store is inconsistent")
                    }
                    _ => warn!(operation, ?checkbox_nbr, error = %e, "store call failed"),
                }
                Err(Error::Store(e))
            }
        }
    }
}

#[cfg(feature = "postgres")]
async fn connect_postgres(url: &str, config: &Config) -> Result<Arc<dyn CheckboxStore>> {
    let store =
        postgres::PgCheckboxStore::connect(url, &config.database, config.checkbox_count)
            .await?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "postgres"))]
async fn connect_postgres(_url: &str, _config: &Config) -> Result<Arc<dyn CheckboxStore>> {
    Err(Error::Config(
        "postgres database urls require the `postgres` feature".into(),
    ))
}

#[cfg(test)]
mod tests {
    use futures::stream;

    use super::*;

    fn rows(
        items: Vec<(i64, bool)>,
    ) -> impl Stream<Item = Result<(i64, bool), sqlx::Error>> + Unpin {
        stream::iter(items.into_iter().map(Ok))
    }

    #[tokio::test]
    async fn collects_contiguous_rows() {
        let states = collect_states(rows(vec![(0, true), (1, false), (2, true)]), 3)
            .await
            .unwrap();
        assert_eq!(states, [true, false, true]);
    }

    #[tokio::test]
    async fn short_store_is_a_row_count_error() {
        let err = collect_states(rows(vec![(0, true), (1, false)]), 3)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::RowCount { expected: 3, found: 2 }));
    }

    #[tokio::test]
    async fn long_store_is_a_row_count_error() {
        let err = collect_states(rows(vec![(0, true), (1, false), (2, true)]), 2)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::RowCount { expected: 2, found: 3 }));
    }

    #[tokio::test]
    async fn missing_number_is_a_gap() {
        let err = collect_states(rows(vec![(0, true), (2, false)]), 2)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Gap { expected: 1, found: 2 }));
    }

    #[test]
    fn only_known_older_positions_are_stale() {
        assert!(is_stale(Some("00000000000000000007"), Some(7)));
        assert!(is_stale(Some("00000000000000000009"), Some(7)));
        assert!(!is_stale(Some("00000000000000000006"), Some(7)));
        assert!(!is_stale(None, Some(7)));
        assert!(!is_stale(Some("00000000000000000009"), None));
        assert!(!is_stale(Some("not a number"), Some(7)));
    }

    #[test]
    fn affected_rows_must_be_exactly_one() {
        assert!(affected_one("update_checkbox", 4, 1).is_ok());
        assert!(affected_one("update_checkbox", 4, 0).unwrap_err().is_not_found());
        assert!(matches!(
            affected_one("update_checkbox", 4, 2),
            Err(StoreError::Constraint { .. })
        ));
    }
}
