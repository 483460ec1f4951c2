#![allow(dead_code)]

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use hashbrown::HashMap;
use millionboxes::{
    config::Config,
    engine::{
        cache::StateCache,
        consumer::{handler::MessageHandler, Consumer},
        queue::{
            error::TransportError,
            memory::{MemoryQueue, MemoryQueueConfig},
            CheckboxQueue, OutgoingMessage, PublishReceipt, QueueProvider,
            QueueTransport, TransportMessage,
        },
        store::{
            error::StoreError, sqlite::SqliteCheckboxStore, CheckboxStatus, CheckboxStore,
            CheckboxUpdate, Gateway, UpdateOutcome,
        },
    },
    ids::UuidV7,
    service::CheckboxService,
    Error, Result,
};

pub const CHECKBOXES: u32 = 100;

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.checkbox_count = CHECKBOXES;
    config.server_name = "api-test".into();
    config.queue.batch_size = 10;
    config.consumer.workers = 4;
    config.consumer.batch_ceiling = 100;
    config.consumer.min_sleep_ms = 10;
    config.consumer.stats_interval_secs = 60;
    config
}

/// A seeded in-memory store, a memory queue that never waits, and a cache
/// loaded from the store.
pub struct Harness {
    pub config: Config,
    pub memory: Arc<MemoryQueue>,
    pub queue: CheckboxQueue,
    pub store: Arc<SqliteCheckboxStore>,
    pub gateway: Gateway,
    pub cache: Arc<StateCache>,
    pub service: CheckboxService,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_visibility(Duration::from_secs(30)).await
    }

    /// A harness whose queue hides a received message for `visibility`.
    pub async fn with_visibility(visibility: Duration) -> Self {
        let config = test_config();
        let memory = Arc::new(MemoryQueue::new(
            MemoryQueueConfig::builder()
                .wait_time(Duration::ZERO)
                .visibility_timeout(visibility)
                .build(),
        ));
        let queue = CheckboxQueue::new(memory.clone());
        let store = Arc::new(SqliteCheckboxStore::memory(CHECKBOXES).await.unwrap());
        let gateway = Gateway::new(store.clone(), Duration::from_secs(5));

        let cache = Arc::new(StateCache::new(CHECKBOXES as usize));
        cache.init().unwrap();
        cache.reload_from(&gateway).await.unwrap();

        let service = CheckboxService::new(
            cache.clone(),
            gateway.clone(),
            queue.clone(),
            Arc::new(UuidV7),
            config.server_name.clone(),
        );
        Self {
            config,
            memory,
            queue,
            store,
            gateway,
            cache,
            service,
        }
    }

    pub fn consumer(&self, handler: Arc<dyn MessageHandler>) -> Consumer {
        Consumer::new(self.queue.clone(), handler, &self.config)
    }
}

/// A transport that hands out `batch` fresh messages on every receive and
/// counts deletes.
pub struct FloodTransport {
    pub batch: usize,
    pub deletes: AtomicUsize,
}

impl FloodTransport {
    pub fn new(batch: usize) -> Self {
        Self {
            batch,
            deletes: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl QueueTransport for FloodTransport {
    fn provider(&self) -> QueueProvider {
        QueueProvider::Memory
    }

    async fn send(
        &self,
        _message: OutgoingMessage,
    ) -> std::result::Result<PublishReceipt, TransportError> {
        Ok(PublishReceipt {
            message_id: "flood".into(),
            sequence_number: "0".into(),
            publish_time: Utc::now(),
        })
    }

    async fn receive(
        &self,
        _max_messages: usize,
    ) -> std::result::Result<Vec<TransportMessage>, TransportError> {
        Ok((0..self.batch)
            .map(|i| TransportMessage {
                message_id: format!("flood-{i}"),
                receipt_handle: format!("rh-{i}"),
                body: "{}".into(),
                partition_key: format!("checkbox-{}", i % CHECKBOXES as usize),
                sequence_number: format!("{i:020}"),
                attributes: HashMap::new(),
            })
            .collect())
    }

    async fn delete(
        &self,
        _message: &TransportMessage,
    ) -> std::result::Result<(), TransportError> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Counts calls and succeeds without touching anything.
#[derive(Default)]
pub struct CountingHandler {
    pub calls: AtomicUsize,
}

#[async_trait]
impl MessageHandler for CountingHandler {
    async fn handle(&self, _message: &TransportMessage) -> Result<UpdateOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(UpdateOutcome::Applied)
    }
}

pub struct PanickingHandler;

#[async_trait]
impl MessageHandler for PanickingHandler {
    async fn handle(&self, message: &TransportMessage) -> Result<UpdateOutcome> {
        panic!("cannot handle {}", message.message_id);
    }
}

/// Delegates to `inner` except on the listed calls, counted from one, which
/// fail without reaching it.
pub struct FlakyHandler {
    inner: Arc<dyn MessageHandler>,
    failing: Vec<usize>,
    calls: AtomicUsize,
}

impl FlakyHandler {
    pub fn new(inner: Arc<dyn MessageHandler>, failing: Vec<usize>) -> Self {
        Self {
            inner,
            failing,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl MessageHandler for FlakyHandler {
    async fn handle(&self, message: &TransportMessage) -> Result<UpdateOutcome> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.failing.contains(&call) {
            return Err(Error::Internal(format!("transient failure on call {call}")));
        }
        self.inner.handle(message).await
    }
}

/// A store whose calls never complete.
pub struct StuckStore;

#[async_trait]
impl CheckboxStore for StuckStore {
    fn checkbox_count(&self) -> u32 {
        CHECKBOXES
    }

    async fn status(
        &self,
        _checkbox_nbr: u32,
    ) -> std::result::Result<CheckboxStatus, StoreError> {
        std::future::pending().await
    }

    async fn update_checkbox(
        &self,
        _update: &CheckboxUpdate,
    ) -> std::result::Result<UpdateOutcome, StoreError> {
        std::future::pending().await
    }

    async fn full_store(&self) -> std::result::Result<Vec<bool>, StoreError> {
        std::future::pending().await
    }

    async fn health_check(&self) -> std::result::Result<(), StoreError> {
        std::future::pending().await
    }

    async fn close(&self) {}
}
