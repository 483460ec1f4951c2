//! SQS FIFO transport.

use std::time::Duration;

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_sqs::{
    error::{DisplayErrorContext, SdkError},
    types::{Message, MessageSystemAttributeName},
    Client,
};
use chrono::Utc;
use hashbrown::HashMap;
use tracing::{debug, warn};

use super::{
    attributes, error::TransportError, OutgoingMessage, PublishReceipt,
    QueueProvider, QueueTransport, TransportMessage,
};
use crate::{config::QueueConfig, Error, Result};

/// SQS refuses larger receive batches.
const MAX_RECEIVE_BATCH: usize = 10;

pub struct SqsQueue {
    client: Client,
    queue_url: String,
    wait_time: Duration,
    visibility_timeout: Duration,
}

impl SqsQueue {
    /// Resolves credentials and region the usual AWS way, with the configured
    /// profile and region taking precedence.
    pub async fn connect(config: &QueueConfig) -> Result<Self> {
        let queue_url = config
            .sqs
            .queue_url
            .clone()
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| {
                Error::Config("queue.sqs.queue_url is required for sqs".into())
            })?;

        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(profile) = &config.sqs.profile {
            loader = loader.profile_name(profile);
        }
        if let Some(region) = &config.sqs.region {
            loader = loader.region(Region::new(region.clone()));
        }
        let sdk_config = loader.load().await;
        debug!(%queue_url, region = ?sdk_config.region(), "sqs client ready");

        Ok(Self::with_client(
            Client::new(&sdk_config),
            queue_url,
            config.wait_time(),
            config.visibility_timeout(),
        ))
    }

    pub fn with_client(
        client: Client,
        queue_url: String,
        wait_time: Duration,
        visibility_timeout: Duration,
    ) -> Self {
        Self {
            client,
            queue_url,
            wait_time,
            visibility_timeout,
        }
    }
}

#[async_trait]
impl QueueTransport for SqsQueue {
    fn provider(&self) -> QueueProvider {
        QueueProvider::Sqs
    }

    async fn send(
        &self,
        message: OutgoingMessage,
    ) -> Result<PublishReceipt, TransportError> {
        let output = self
            .client
            .send_message()
            .queue_url(&self.queue_url)
            .message_body(message.body)
            .message_group_id(message.partition_key)
            .set_message_deduplication_id(message.deduplication_id)
            .send()
            .await
            .map_err(|e| classify("send", e))?;

        Ok(PublishReceipt {
            message_id: output.message_id().unwrap_or_default().to_string(),
            sequence_number: output
                .sequence_number()
                .unwrap_or_default()
                .to_string(),
            publish_time: Utc::now(),
        })
    }

    async fn receive(
        &self,
        max_messages: usize,
    ) -> Result<Vec<TransportMessage>, TransportError> {
        let max = max_messages.clamp(1, MAX_RECEIVE_BATCH) as i32;
        let output = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(max)
            .wait_time_seconds(self.wait_time.as_secs() as i32)
            .visibility_timeout(self.visibility_timeout.as_secs() as i32)
            .message_system_attribute_names(MessageSystemAttributeName::All)
            .send()
            .await
            .map_err(|e| classify("receive", e))?;

        Ok(output.messages().iter().filter_map(convert).collect())
    }

    async fn delete(
        &self,
        message: &TransportMessage,
    ) -> Result<(), TransportError> {
        let result = self
            .client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(&message.receipt_handle)
            .send()
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(e)
                if e.as_service_error()
                    .is_some_and(|e| e.is_receipt_handle_is_invalid()) =>
            {
                debug!(
                    message_id = %message.message_id,
                    "receipt handle no longer valid, delete ignored"
                );
                Ok(())
            }
            Err(e) => Err(classify("delete", e)),
        }
    }
}

/// Messages without a receipt handle cannot be acknowledged and are skipped;
/// SQS redelivers them.
fn convert(message: &Message) -> Option<TransportMessage> {
    let Some(receipt_handle) = message.receipt_handle() else {
        warn!(message_id = ?message.message_id(), "sqs message without receipt handle");
        return None;
    };

    let attrs: HashMap<String, String> = message
        .attributes()
        .map(|attrs| {
            attrs
                .iter()
                .map(|(name, value)| (name.as_str().to_string(), value.clone()))
                .collect()
        })
        .unwrap_or_default();

    Some(TransportMessage {
        message_id: message.message_id().unwrap_or_default().to_string(),
        receipt_handle: receipt_handle.to_string(),
        body: message.body().unwrap_or_default().to_string(),
        partition_key: attrs
            .get(attributes::GROUP_ID)
            .cloned()
            .unwrap_or_default(),
        sequence_number: attrs
            .get(attributes::SEQUENCE_NUMBER)
            .cloned()
            .unwrap_or_default(),
        attributes: attrs,
    })
}

fn classify<E, R>(operation: &'static str, err: SdkError<E, R>) -> TransportError
where
    E: std::error::Error + 'static,
    R: std::fmt::Debug,
{
    match err {
        SdkError::TimeoutError(_) => TransportError::Timeout { operation },
        other => TransportError::unavailable(
            operation,
            DisplayErrorContext(other).to_string(),
        ),
    }
}
