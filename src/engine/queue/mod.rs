//! Provider-agnostic access to the checkbox action queue.
//!
//! A [`QueueTransport`] moves opaque bodies through an ordered, at-least-once
//! queue: messages sharing a partition key are delivered in publish order, a
//! received message stays hidden until it is deleted or its lease expires, and
//! an undeleted message comes back. [`CheckboxQueue`] layers the checkbox
//! action protocol on top of whichever transport the process was started
//! with.

use std::{fmt, str::FromStr, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{config::QueueConfig, telemetry, Error, Result};

pub mod error;
pub mod memory;
#[cfg(feature = "sqs")]
pub mod sqs;
pub mod wire;

use self::{
    error::TransportError,
    memory::MemoryQueue,
    wire::{CheckboxActionMessage, CheckboxActionPayload},
};

/// Attribute names shared by every provider.
pub mod attributes {
    pub const GROUP_ID: &str = "MessageGroupId";
    pub const SEQUENCE_NUMBER: &str = "SequenceNumber";
    pub const RECEIVE_COUNT: &str = "ApproximateReceiveCount";
    pub const SENT_TIMESTAMP: &str = "SentTimestamp";
}

/// A message as handed out by a transport. Keep it intact until it is
/// deleted: `receipt_handle` is what acknowledges it.
#[derive(Clone, Debug)]
pub struct TransportMessage {
    pub message_id: String,
    pub receipt_handle: String,
    pub body: String,
    pub partition_key: String,
    pub sequence_number: String,
    pub attributes: HashMap<String, String>,
}

impl TransportMessage {
    /// How many times this message has been handed out, this delivery
    /// included.
    pub fn receive_count(&self) -> u32 {
        self.attributes
            .get(attributes::RECEIVE_COUNT)
            .and_then(|count| count.parse().ok())
            .unwrap_or(1)
    }
}

#[derive(Clone, Debug)]
pub struct OutgoingMessage {
    pub body: String,
    pub partition_key: String,
    /// Publishing the same id again within the dedup window is a no-op. When
    /// absent, providers deduplicate on the body's content.
    pub deduplication_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishReceipt {
    pub message_id: String,
    pub sequence_number: String,
    pub publish_time: DateTime<Utc>,
}

#[async_trait]
pub trait QueueTransport: Send + Sync {
    fn provider(&self) -> QueueProvider;

    async fn send(
        &self,
        message: OutgoingMessage,
    ) -> Result<PublishReceipt, TransportError>;

    /// Long-polls for up to `max_messages`. An empty result means nothing
    /// arrived within the provider's wait window.
    async fn receive(
        &self,
        max_messages: usize,
    ) -> Result<Vec<TransportMessage>, TransportError>;

    /// Acknowledges `message`. Deleting a message twice, or with a receipt
    /// handle that has since expired, is not an error.
    async fn delete(
        &self,
        message: &TransportMessage,
    ) -> Result<(), TransportError>;
}

#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum QueueProvider {
    #[default]
    Memory,
    Sqs,
}

impl fmt::Display for QueueProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Memory => "memory",
            Self::Sqs => "sqs",
        })
    }
}

impl FromStr for QueueProvider {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "sqs" | "aws" => Ok(Self::Sqs),
            other => Err(format!("unknown queue provider {other:?}")),
        }
    }
}

/// Builds the transport named by `config`. Call once at startup and share the
/// result.
pub async fn connect_transport(
    config: &QueueConfig,
) -> Result<Arc<dyn QueueTransport>> {
    debug!(provider = %config.provider, "connecting queue transport");
    match config.provider {
        QueueProvider::Memory => Ok(Arc::new(MemoryQueue::from_config(config))),
        #[cfg(feature = "sqs")]
        QueueProvider::Sqs => Ok(Arc::new(sqs::SqsQueue::connect(config).await?)),
        #[cfg(not(feature = "sqs"))]
        QueueProvider::Sqs => Err(Error::Config(
            "queue provider sqs requires the `sqs` feature".into(),
        )),
    }
}

/// The checkbox action queue: typed publish on the producer side, receive and
/// delete on the consumer side.
#[derive(Clone)]
pub struct CheckboxQueue {
    transport: Arc<dyn QueueTransport>,
}

impl CheckboxQueue {
    pub fn new(transport: Arc<dyn QueueTransport>) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &Arc<dyn QueueTransport> {
        &self.transport
    }

    /// Wraps `payload` in an envelope keyed by its checkbox and request id and
    /// submits it. Submission failures are returned, never dropped.
    pub async fn publish(
        &self,
        payload: CheckboxActionPayload,
    ) -> Result<PublishReceipt> {
        let trace_id = payload.request_uuid.clone();
        telemetry::record(
            &trace_id,
            "publish_checkbox_action",
            &[
                ("action", &payload.action),
                ("checkbox_nbr", &payload.checkbox_nbr),
                ("user_uuid", &payload.user_uuid),
                ("user_ip", &payload.user_ip),
                ("api_server", &payload.api_server),
            ],
        );

        let message = CheckboxActionMessage::new(payload);
        let outgoing = OutgoingMessage {
            body: message.encode()?,
            partition_key: message.header.group_id.clone(),
            deduplication_id: Some(message.header.deduplication_id.clone()),
        };

        match self.transport.send(outgoing).await {
            Ok(receipt) => {
                telemetry::record(
                    &trace_id,
                    "publish_checkbox_action_success",
                    &[
                        ("message_id", &receipt.message_id),
                        ("sequence_number", &receipt.sequence_number),
                    ],
                );
                Ok(receipt)
            }
            Err(e) => {
                telemetry::record(
                    &trace_id,
                    "publish_checkbox_action_failed",
                    &[("error", &e)],
                );
                Err(Error::Transport(e))
            }
        }
    }

    pub async fn receive(
        &self,
        batch_size_hint: usize,
    ) -> Result<Vec<TransportMessage>, TransportError> {
        let messages = self.transport.receive(batch_size_hint).await?;
        telemetry::record(
            "",
            "pull_checkbox_action_messages",
            &[
                ("provider", &self.transport.provider()),
                ("received", &messages.len()),
            ],
        );
        Ok(messages)
    }

    pub async fn delete(
        &self,
        message: &TransportMessage,
    ) -> Result<(), TransportError> {
        telemetry::record(
            "",
            "delete_message",
            &[
                ("message_id", &message.message_id),
                ("sequence_number", &message.sequence_number),
            ],
        );
        self.transport.delete(message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_names_round_trip() {
        for provider in [QueueProvider::Memory, QueueProvider::Sqs] {
            assert_eq!(provider.to_string().parse(), Ok(provider));
        }
        assert_eq!("AWS".parse(), Ok(QueueProvider::Sqs));
        assert!("kafka".parse::<QueueProvider>().is_err());
    }

    #[test]
    fn receive_count_defaults_to_first_delivery() {
        let mut msg = TransportMessage {
            message_id: "m".into(),
            receipt_handle: "r".into(),
            body: String::new(),
            partition_key: "checkbox-1".into(),
            sequence_number: "1".into(),
            attributes: HashMap::new(),
        };
        assert_eq!(msg.receive_count(), 1);
        msg.attributes
            .insert(attributes::RECEIVE_COUNT.into(), "3".into());
        assert_eq!(msg.receive_count(), 3);
    }
}
