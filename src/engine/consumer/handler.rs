use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::{
    engine::{
        cache::StateCache,
        queue::{wire::CheckboxActionMessage, CheckboxQueue, TransportMessage},
        store::{CheckboxUpdate, Gateway, UpdateOutcome},
    },
    Result,
};

/// Applies one queue message. Returning `Ok` means the message's effect is
/// durable and the message has been acknowledged.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &TransportMessage) -> Result<UpdateOutcome>;
}

/// Decodes a checkbox action, commits it, and only then deletes the message.
/// Anything failing along the way leaves the message in the queue for
/// redelivery. An action older than the one already applied is acknowledged
/// without a write.
pub struct CheckboxActionHandler {
    gateway: Gateway,
    queue: CheckboxQueue,
    cache: Option<Arc<StateCache>>,
}

impl CheckboxActionHandler {
    pub fn new(gateway: Gateway, queue: CheckboxQueue) -> Self {
        Self {
            gateway,
            queue,
            cache: None,
        }
    }

    /// Writes each committed action through to `cache` as well.
    pub fn with_cache(mut self, cache: Arc<StateCache>) -> Self {
        self.cache = Some(cache);
        self
    }
}

#[async_trait]
impl MessageHandler for CheckboxActionHandler {
    async fn handle(&self, message: &TransportMessage) -> Result<UpdateOutcome> {
        let envelope = CheckboxActionMessage::decode(&message.body)?;
        let action = envelope.validate(self.gateway.checkbox_count())?;

        let update = CheckboxUpdate::from(&action)
            .with_sequence(message.sequence_number.parse().ok());
        let outcome = self.gateway.update_checkbox(&update).await?;
        match outcome {
            UpdateOutcome::Applied => {}
            UpdateOutcome::Replayed => debug!(
                message_id = %message.message_id,
                request_id = %action.request_id,
                receive_count = message.receive_count(),
                "redelivered action already applied"
            ),
            UpdateOutcome::Stale => debug!(
                message_id = %message.message_id,
                request_id = %action.request_id,
                sequence_number = %message.sequence_number,
                "newer action already applied, dropping"
            ),
        }

        match &self.cache {
            Some(cache) if outcome != UpdateOutcome::Stale => {
                if let Err(e) = cache.set(action.checkbox_nbr, action.checked) {
                    warn!(
                        checkbox_nbr = action.checkbox_nbr,
                        error = %e,
                        "cache write-through skipped"
                    );
                }
            }
            _ => {}
        }

        self.queue.delete(message).await?;
        Ok(outcome)
    }
}
