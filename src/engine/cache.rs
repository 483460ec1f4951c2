//! The serving layer's fast read path: one boolean per checkbox, held in
//! memory and converging on the durable store.
//!
//! Reads never take a lock. Each element is an `AtomicBool`, so a point
//! update is visible to readers as soon as it lands. A bulk reload builds a
//! fresh array and swaps it in whole through an [`ArcSwap`]: a reader that
//! sees any checkbox from the new load sees all of them. Writers serialize
//! on one store-wide mutex so a point update never lands in an array that is
//! about to be replaced.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, OnceLock,
    },
    time::{Duration, Instant},
};

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{config::DEFAULT_CHECKBOX_COUNT, engine::store::Gateway, Result};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("checkbox {checkbox_nbr} outside [0, {len})")]
    InvalidCheckbox { checkbox_nbr: u32, len: usize },
    #[error("state cache used before init")]
    NotInitialized,
    #[error("state cache initialized more than once")]
    AlreadyInitialized,
    #[error("bulk load expected {expected} rows, got {found}")]
    RowCountMismatch { expected: usize, found: usize },
}

pub struct StateCache {
    len: usize,
    // set once by `init`; the swap inside is what reloads replace
    store: OnceLock<ArcSwap<Box<[AtomicBool]>>>,
    write_lock: Mutex<()>,
}

impl Default for StateCache {
    fn default() -> Self {
        Self::new(DEFAULT_CHECKBOX_COUNT as usize)
    }
}

impl StateCache {
    /// Creates an unallocated cache for `len` checkboxes. Call
    /// [`StateCache::init`] exactly once before use.
    pub fn new(len: usize) -> Self {
        Self {
            len,
            store: OnceLock::new(),
            write_lock: Mutex::new(()),
        }
    }

    /// Allocates the backing array with every checkbox unchecked.
    ///
    /// A second call means startup ran out of order; it fails with
    /// [`CacheError::AlreadyInitialized`] and leaves the existing array alone.
    pub fn init(&self) -> Result<(), CacheError> {
        if self.is_initialized() {
            return Err(CacheError::AlreadyInitialized);
        }
        let cells = ArcSwap::from_pointee(allocate(self.len, |_| false));
        self.store
            .set(cells)
            .map_err(|_| CacheError::AlreadyInitialized)?;
        debug!(len = self.len, "state cache allocated");
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.store.get().is_some()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, checkbox_nbr: u32) -> Result<bool, CacheError> {
        let cells = self.cells()?.load();
        Ok(self.cell(&cells, checkbox_nbr)?.load(Ordering::Relaxed))
    }

    pub fn set(&self, checkbox_nbr: u32, checked: bool) -> Result<(), CacheError> {
        let current = self.cells()?;
        let _guard = self.write_lock.lock();
        let cells = current.load();
        self.cell(&cells, checkbox_nbr)?
            .store(checked, Ordering::Relaxed);
        Ok(())
    }

    /// Replaces every checkbox with `rows`, indexed by checkbox number.
    ///
    /// `rows` must cover exactly [`StateCache::len`] checkboxes; anything else
    /// is a data-integrity failure and the current contents are kept.
    pub fn bulk_load(&self, rows: &[bool]) -> Result<(), CacheError> {
        let current = self.cells()?;
        if rows.len() != self.len {
            return Err(CacheError::RowCountMismatch {
                expected: self.len,
                found: rows.len(),
            });
        }
        let fresh = allocate(self.len, |n| rows[n]);
        let _guard = self.write_lock.lock();
        current.store(Arc::new(fresh));
        Ok(())
    }

    /// Reads the full store through `gateway` and swaps it in. On any failure
    /// the cache keeps what it had.
    pub async fn reload_from(&self, gateway: &Gateway) -> Result<usize> {
        let started = Instant::now();
        let rows = gateway.full_store().await?;
        self.bulk_load(&rows)?;
        let checked = rows.iter().filter(|&&c| c).count();
        info!(
            rows = rows.len(),
            checked,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "state cache reloaded"
        );
        Ok(checked)
    }

    pub fn count_checked(&self) -> Result<usize, CacheError> {
        let cells = self.cells()?.load();
        Ok(cells.iter().filter(|c| c.load(Ordering::Relaxed)).count())
    }

    fn cells(&self) -> Result<&ArcSwap<Box<[AtomicBool]>>, CacheError> {
        self.store.get().ok_or(CacheError::NotInitialized)
    }

    fn cell<'a>(
        &self,
        cells: &'a [AtomicBool],
        checkbox_nbr: u32,
    ) -> Result<&'a AtomicBool, CacheError> {
        cells
            .get(checkbox_nbr as usize)
            .ok_or(CacheError::InvalidCheckbox {
                checkbox_nbr,
                len: self.len,
            })
    }
}

fn allocate(len: usize, state: impl Fn(usize) -> bool) -> Box<[AtomicBool]> {
    (0..len).map(|n| AtomicBool::new(state(n))).collect()
}

/// Reloads `cache` from `gateway` every `period` until `shutdown` flips.
/// Failed reloads are logged and retried on the next tick.
pub fn spawn_refresher(
    cache: Arc<StateCache>,
    gateway: Gateway,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // the first tick completes immediately; startup already loaded
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = cache.reload_from(&gateway).await {
                        warn!(
                            error = %e,
                            "state cache refresh failed, keeping previous contents"
                        );
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("state cache refresher stopping");
                        return;
                    }
                }
            }
        }
    })
}
