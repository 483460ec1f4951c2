//! An in-process queue with the delivery rules of an SQS FIFO queue.
//!
//! Used for local runs and tests. Everything lives behind one mutex that is
//! never held across an await; waiting receivers park on a [`Notify`] that
//! sends and deletes poke.

use std::{collections::VecDeque, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hashbrown::HashMap;
use parking_lot::Mutex;
use tokio::{sync::Notify, time::Instant};
use tracing::debug;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use super::{
    attributes, error::TransportError, OutgoingMessage, PublishReceipt,
    QueueProvider, QueueTransport, TransportMessage,
};
use crate::config::QueueConfig;

#[derive(Clone, Debug, TypedBuilder)]
pub struct MemoryQueueConfig {
    /// Longest a receive waits for the first message.
    #[builder(default = Duration::from_secs(20))]
    pub wait_time: Duration,
    #[builder(default = Duration::from_secs(30))]
    pub visibility_timeout: Duration,
    /// Un-deleted messages the queue will hold.
    #[builder(default = 100_000)]
    pub capacity: usize,
    #[builder(default = Duration::from_secs(5 * 60))]
    pub dedup_window: Duration,
}

impl Default for MemoryQueueConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl From<&QueueConfig> for MemoryQueueConfig {
    fn from(config: &QueueConfig) -> Self {
        Self::builder()
            .wait_time(config.wait_time())
            .visibility_timeout(config.visibility_timeout())
            .capacity(config.capacity)
            .build()
    }
}

pub struct MemoryQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    config: MemoryQueueConfig,
}

#[derive(Default)]
struct QueueState {
    /// Pending messages per partition key, oldest first. Leased messages
    /// always form a prefix of their group.
    groups: HashMap<String, VecDeque<StoredMessage>>,
    dedup: HashMap<String, PublishReceipt>,
    /// Dedup ids in insertion order, for expiry.
    dedup_order: VecDeque<(Instant, String)>,
    next_sequence: u64,
    len: usize,
}

struct StoredMessage {
    message_id: String,
    body: String,
    sequence: u64,
    sent_at: DateTime<Utc>,
    receive_count: u32,
    lease: Option<Lease>,
}

struct Lease {
    receipt_handle: String,
    visible_at: Instant,
}

impl MemoryQueue {
    pub fn new(config: MemoryQueueConfig) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            config,
        }
    }

    pub fn from_config(config: &QueueConfig) -> Self {
        Self::new(config.into())
    }

    /// Messages not yet deleted, in flight or not.
    pub fn len(&self) -> usize {
        self.state.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Messages currently leased to a receiver.
    pub fn in_flight(&self) -> usize {
        let now = Instant::now();
        self.state
            .lock()
            .groups
            .values()
            .flat_map(|group| group.iter())
            .filter(|msg| {
                msg.lease.as_ref().is_some_and(|lease| lease.visible_at > now)
            })
            .count()
    }
}

impl QueueState {
    fn forget_expired_dedup(&mut self, now: Instant, window: Duration) {
        while let Some((at, _)) = self.dedup_order.front() {
            if now.duration_since(*at) < window {
                break;
            }
            if let Some((_, id)) = self.dedup_order.pop_front() {
                self.dedup.remove(&id);
            }
        }
    }

    /// Leases up to `max` deliverable messages. When nothing is deliverable,
    /// also returns the earliest instant an outstanding lease lapses.
    fn lease_batch(
        &mut self,
        max: usize,
        now: Instant,
        visibility_timeout: Duration,
    ) -> (Vec<TransportMessage>, Option<Instant>) {
        let mut next_expiry: Option<Instant> = None;
        let mut ready = Vec::new();

        for (key, group) in self.groups.iter_mut() {
            for msg in group.iter_mut().take_while(|m| m.lease.is_some()) {
                if msg.lease.as_ref().is_some_and(|l| l.visible_at <= now) {
                    msg.lease = None;
                }
            }
            let Some(head) = group.front() else { continue };
            match &head.lease {
                Some(lease) => {
                    next_expiry = Some(match next_expiry {
                        Some(at) => at.min(lease.visible_at),
                        None => lease.visible_at,
                    });
                }
                None => ready.push((head.sequence, key.clone())),
            }
        }
        ready.sort_unstable();

        let mut batch = Vec::new();
        for (_, key) in ready {
            if batch.len() >= max {
                break;
            }
            let Some(group) = self.groups.get_mut(&key) else { continue };
            for msg in group.iter_mut() {
                if batch.len() >= max || msg.lease.is_some() {
                    break;
                }
                let receipt_handle = new_receipt_handle();
                msg.receive_count += 1;
                msg.lease = Some(Lease {
                    receipt_handle: receipt_handle.clone(),
                    visible_at: now + visibility_timeout,
                });
                batch.push(msg.deliver(&key, receipt_handle));
            }
        }
        (batch, next_expiry)
    }

    fn remove_leased(&mut self, partition_key: &str, receipt_handle: &str) -> bool {
        let Some(group) = self.groups.get_mut(partition_key) else {
            return false;
        };
        let position = group.iter().position(|msg| {
            msg.lease
                .as_ref()
                .is_some_and(|lease| lease.receipt_handle == receipt_handle)
        });
        let Some(position) = position else {
            return false;
        };
        group.remove(position);
        if group.is_empty() {
            self.groups.remove(partition_key);
        }
        self.len -= 1;
        true
    }
}

impl StoredMessage {
    fn deliver(&self, partition_key: &str, receipt_handle: String) -> TransportMessage {
        let sequence_number = format_sequence(self.sequence);
        let mut attrs = HashMap::with_capacity(4);
        attrs.insert(attributes::GROUP_ID.to_string(), partition_key.to_string());
        attrs.insert(
            attributes::SEQUENCE_NUMBER.to_string(),
            sequence_number.clone(),
        );
        attrs.insert(
            attributes::RECEIVE_COUNT.to_string(),
            self.receive_count.to_string(),
        );
        attrs.insert(
            attributes::SENT_TIMESTAMP.to_string(),
            self.sent_at.timestamp_millis().to_string(),
        );
        TransportMessage {
            message_id: self.message_id.clone(),
            receipt_handle,
            body: self.body.clone(),
            partition_key: partition_key.to_string(),
            sequence_number,
            attributes: attrs,
        }
    }
}

fn format_sequence(sequence: u64) -> String {
    format!("{sequence:020}")
}

fn new_receipt_handle() -> String {
    format!("{:032x}", rand::random::<u128>())
}

#[async_trait]
impl QueueTransport for MemoryQueue {
    fn provider(&self) -> QueueProvider {
        QueueProvider::Memory
    }

    async fn send(
        &self,
        message: OutgoingMessage,
    ) -> Result<PublishReceipt, TransportError> {
        let dedup_id = message.deduplication_id.unwrap_or_else(|| {
            blake3::hash(message.body.as_bytes()).to_hex().to_string()
        });
        let now = Instant::now();

        let receipt = {
            let mut state = self.state.lock();
            state.forget_expired_dedup(now, self.config.dedup_window);
            if let Some(receipt) = state.dedup.get(&dedup_id) {
                debug!(%dedup_id, "duplicate send suppressed");
                return Ok(receipt.clone());
            }
            if state.len >= self.config.capacity {
                return Err(TransportError::Full {
                    operation: "send",
                    reason: format!(
                        "{} messages outstanding",
                        self.config.capacity
                    ),
                });
            }

            state.next_sequence += 1;
            let sequence = state.next_sequence;
            let receipt = PublishReceipt {
                message_id: Uuid::now_v7().to_string(),
                sequence_number: format_sequence(sequence),
                publish_time: Utc::now(),
            };
            state
                .groups
                .entry(message.partition_key)
                .or_default()
                .push_back(StoredMessage {
                    message_id: receipt.message_id.clone(),
                    body: message.body,
                    sequence,
                    sent_at: receipt.publish_time,
                    receive_count: 0,
                    lease: None,
                });
            state.len += 1;
            state.dedup.insert(dedup_id.clone(), receipt.clone());
            state.dedup_order.push_back((now, dedup_id));
            receipt
        };

        self.notify.notify_waiters();
        Ok(receipt)
    }

    async fn receive(
        &self,
        max_messages: usize,
    ) -> Result<Vec<TransportMessage>, TransportError> {
        let max = max_messages.max(1);
        let deadline = Instant::now() + self.config.wait_time;
        loop {
            // registered before looking, so a send in between still wakes us
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (batch, next_expiry) = self.state.lock().lease_batch(
                max,
                Instant::now(),
                self.config.visibility_timeout,
            );
            if !batch.is_empty() {
                return Ok(batch);
            }
            if Instant::now() >= deadline {
                return Ok(batch);
            }

            let wake_at = next_expiry.map_or(deadline, |at| at.min(deadline));
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn delete(
        &self,
        message: &TransportMessage,
    ) -> Result<(), TransportError> {
        let removed = self
            .state
            .lock()
            .remove_leased(&message.partition_key, &message.receipt_handle);
        if removed {
            self.notify.notify_waiters();
        } else {
            debug!(
                message_id = %message.message_id,
                "delete with stale or unknown receipt handle ignored"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn queue(wait: Duration) -> MemoryQueue {
        MemoryQueue::new(
            MemoryQueueConfig::builder()
                .wait_time(wait)
                .capacity(8)
                .build(),
        )
    }

    fn outgoing(key: &str, body: &str) -> OutgoingMessage {
        OutgoingMessage {
            body: body.to_string(),
            partition_key: key.to_string(),
            deduplication_id: Some(Uuid::now_v7().to_string()),
        }
    }

    fn bodies(batch: &[TransportMessage]) -> Vec<&str> {
        batch.iter().map(|m| m.body.as_str()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn one_partition_is_delivered_in_order() {
        let q = queue(Duration::ZERO);
        for body in ["a1", "a2", "a3"] {
            q.send(outgoing("checkbox-1", body)).await.unwrap();
        }
        let batch = q.receive(10).await.unwrap();
        assert_eq!(bodies(&batch), ["a1", "a2", "a3"]);
        assert!(batch.windows(2).all(|w| w[0].sequence_number < w[1].sequence_number));
        assert_eq!(batch[0].attributes[attributes::GROUP_ID], "checkbox-1");
        assert_eq!(batch[0].receive_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_partition_blocks_until_deleted() {
        let q = queue(Duration::ZERO);
        q.send(outgoing("checkbox-1", "a1")).await.unwrap();
        q.send(outgoing("checkbox-1", "a2")).await.unwrap();
        q.send(outgoing("checkbox-2", "b1")).await.unwrap();

        let first = q.receive(1).await.unwrap();
        assert_eq!(bodies(&first), ["a1"]);
        let second = q.receive(10).await.unwrap();
        assert_eq!(bodies(&second), ["b1"]);
        assert_eq!(q.in_flight(), 2);

        q.delete(&first[0]).await.unwrap();
        let third = q.receive(10).await.unwrap();
        assert_eq!(bodies(&third), ["a2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_lease_redelivers_with_new_handle() {
        let q = queue(Duration::ZERO);
        q.send(outgoing("checkbox-7", "x")).await.unwrap();
        let first = q.receive(10).await.unwrap().remove(0);
        assert!(q.receive(10).await.unwrap().is_empty());

        tokio::time::advance(Duration::from_secs(31)).await;
        let again = q.receive(10).await.unwrap().remove(0);
        assert_eq!(again.message_id, first.message_id);
        assert_ne!(again.receipt_handle, first.receipt_handle);
        assert_eq!(again.receive_count(), 2);

        q.delete(&first).await.unwrap();
        assert_eq!(q.len(), 1);
        q.delete(&again).await.unwrap();
        assert!(q.is_empty());
        q.delete(&again).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_ids_enqueue_once() {
        let q = queue(Duration::ZERO);
        let msg = outgoing("checkbox-3", "x");
        let a = q.send(msg.clone()).await.unwrap();
        let b = q.send(msg.clone()).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(q.len(), 1);

        // the window is five minutes
        tokio::time::advance(Duration::from_secs(301)).await;
        let c = q.send(msg).await.unwrap();
        assert_ne!(a.message_id, c.message_id);
        assert_eq!(q.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_dedup_id_falls_back_to_content() {
        let q = queue(Duration::ZERO);
        let mut msg = outgoing("checkbox-3", "same body");
        msg.deduplication_id = None;
        q.send(msg.clone()).await.unwrap();
        q.send(msg.clone()).await.unwrap();
        assert_eq!(q.len(), 1);
        msg.body = "other body".into();
        q.send(msg).await.unwrap();
        assert_eq!(q.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn full_queue_rejects_sends() {
        let q = queue(Duration::ZERO);
        for i in 0..8 {
            q.send(outgoing(&format!("checkbox-{i}"), "x")).await.unwrap();
        }
        let err = q.send(outgoing("checkbox-9", "x")).await.unwrap_err();
        assert!(matches!(err, TransportError::Full { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn long_poll_wakes_on_send() {
        let q = Arc::new(queue(Duration::from_secs(20)));
        let started = Instant::now();
        let receiver = {
            let q = q.clone();
            tokio::spawn(async move { q.receive(10).await })
        };
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_secs(2)).await;
        q.send(outgoing("checkbox-1", "late")).await.unwrap();

        let batch = receiver.await.unwrap().unwrap();
        assert_eq!(bodies(&batch), ["late"]);
        assert!(started.elapsed() < Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn empty_long_poll_returns_after_wait_time() {
        let q = queue(Duration::from_secs(20));
        let started = Instant::now();
        assert!(q.receive(10).await.unwrap().is_empty());
        assert!(started.elapsed() >= Duration::from_secs(20));
    }
}
