//! What an API server calls: fast cached reads, authoritative reads, and
//! action submission.

use std::sync::Arc;

use uuid::Uuid;

use crate::{
    engine::{
        cache::StateCache,
        queue::{
            error::ProtocolError,
            wire::{CheckboxAction, CheckboxActionPayload},
            CheckboxQueue, PublishReceipt,
        },
        store::{CheckboxStatus, Gateway},
    },
    ids::IdGenerator,
    Result,
};

/// Turns a user's request into a queued action. Needs only the queue, so
/// processes without a store can publish too.
#[derive(Clone)]
pub struct ActionPublisher {
    queue: CheckboxQueue,
    ids: Arc<dyn IdGenerator>,
    server_name: String,
    checkbox_count: u32,
}

impl ActionPublisher {
    pub fn new(
        queue: CheckboxQueue,
        ids: Arc<dyn IdGenerator>,
        server_name: impl Into<String>,
        checkbox_count: u32,
    ) -> Self {
        Self {
            queue,
            ids,
            server_name: server_name.into(),
            checkbox_count,
        }
    }

    pub async fn publish_action(
        &self,
        payload: CheckboxActionPayload,
    ) -> Result<PublishReceipt> {
        self.queue.publish(payload).await
    }

    /// Mints a request id and submits `action` on behalf of `user_id`. The
    /// returned request id is what the caller can later correlate on.
    pub async fn request_action(
        &self,
        action: CheckboxAction,
        checkbox_nbr: u32,
        user_id: Uuid,
        origin_ip: &str,
    ) -> Result<(Uuid, PublishReceipt)> {
        if checkbox_nbr >= self.checkbox_count {
            return Err(ProtocolError::CheckboxOutOfRange {
                nbr: i64::from(checkbox_nbr),
                count: self.checkbox_count,
            }
            .into());
        }

        let request_id = self.ids.new_id()?;
        let payload = CheckboxActionPayload::builder()
            .action(action)
            .checkbox_nbr(i64::from(checkbox_nbr))
            .user_uuid(user_id)
            .request_uuid(request_id)
            .user_ip(origin_ip)
            .api_server(self.server_name.as_str())
            .build();
        let receipt = self.publish_action(payload).await?;
        Ok((request_id, receipt))
    }
}

#[derive(Clone)]
pub struct CheckboxService {
    cache: Arc<StateCache>,
    gateway: Gateway,
    publisher: ActionPublisher,
}

impl CheckboxService {
    pub fn new(
        cache: Arc<StateCache>,
        gateway: Gateway,
        queue: CheckboxQueue,
        ids: Arc<dyn IdGenerator>,
        server_name: impl Into<String>,
    ) -> Self {
        let publisher =
            ActionPublisher::new(queue, ids, server_name, gateway.checkbox_count());
        Self {
            cache,
            gateway,
            publisher,
        }
    }

    pub fn cache(&self) -> &Arc<StateCache> {
        &self.cache
    }

    pub fn publisher(&self) -> &ActionPublisher {
        &self.publisher
    }

    /// The cached state, possibly behind the store by up to one refresh.
    pub fn cached_state(&self, checkbox_nbr: u32) -> Result<bool> {
        Ok(self.cache.get(checkbox_nbr)?)
    }

    pub async fn status(&self, checkbox_nbr: u32) -> Result<CheckboxStatus> {
        self.gateway.status(checkbox_nbr).await
    }

    pub async fn publish_action(
        &self,
        payload: CheckboxActionPayload,
    ) -> Result<PublishReceipt> {
        self.publisher.publish_action(payload).await
    }

    pub async fn request_action(
        &self,
        action: CheckboxAction,
        checkbox_nbr: u32,
        user_id: Uuid,
        origin_ip: &str,
    ) -> Result<(Uuid, PublishReceipt)> {
        self.publisher
            .request_action(action, checkbox_nbr, user_id, origin_ip)
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        engine::queue::{
            memory::{MemoryQueue, MemoryQueueConfig},
            wire::CheckboxActionMessage,
        },
        ids::UuidV7,
        ErrorKind,
    };

    fn publisher(memory: &Arc<MemoryQueue>) -> ActionPublisher {
        ActionPublisher::new(
            CheckboxQueue::new(memory.clone()),
            Arc::new(UuidV7),
            "api-1",
            10,
        )
    }

    #[tokio::test]
    async fn publishes_without_a_store() {
        let memory = Arc::new(MemoryQueue::new(
            MemoryQueueConfig::builder().wait_time(Duration::ZERO).build(),
        ));
        let user = Uuid::now_v7();
        let (request_id, _) = publisher(&memory)
            .request_action(CheckboxAction::Uncheck, 9, user, "10.0.0.9")
            .await
            .unwrap();

        let queue = CheckboxQueue::new(memory.clone());
        let messages = queue.receive(10).await.unwrap();
        let action = CheckboxActionMessage::decode(&messages[0].body)
            .unwrap()
            .validate(10)
            .unwrap();
        assert_eq!((action.checkbox_nbr, action.checked), (9, false));
        assert_eq!((action.user_id, action.request_id), (user, request_id));
    }

    #[tokio::test]
    async fn out_of_range_is_refused() {
        let memory = Arc::new(MemoryQueue::new(MemoryQueueConfig::default()));
        let err = publisher(&memory)
            .request_action(CheckboxAction::Check, 10, Uuid::now_v7(), "10.0.0.9")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(memory.is_empty());
    }
}
