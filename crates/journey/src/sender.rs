//! Message senders that stay inside the process: a logging sender for
//! deployments without a provider integration, and a recording fake.

use std::collections::VecDeque;

use async_trait::async_trait;
use chrono::Utc;
use courier_core::contracts::MessageSender;
use courier_core::types::{Channel, DeliveryReceipt, RenderedMessage};
use courier_core::SendFault;
use parking_lot::Mutex;
use tracing::info;
use uuid::Uuid;

/// Accepts every send and logs it.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingSender;

#[async_trait]
impl MessageSender for LoggingSender {
    async fn send(
        &self,
        channel: Channel,
        content: &RenderedMessage,
        destination: &str,
    ) -> Result<DeliveryReceipt, SendFault> {
        let provider_message_id = Uuid::new_v4().to_string();
        info!(
            channel = channel.as_str(),
            destination = %destination,
            bytes = content.body.len(),
            provider_message_id = %provider_message_id,
            "Message handed to provider"
        );
        Ok(DeliveryReceipt {
            provider_message_id: Some(provider_message_id),
            accepted_at: Utc::now(),
        })
    }
}

/// A send observed by [`RecordingSender`].
#[derive(Debug, Clone, PartialEq)]
pub struct SentMessage {
    pub channel: Channel,
    pub content: RenderedMessage,
    pub destination: String,
}

/// Records every send; queued faults are returned by the next sends in order.
#[derive(Default)]
pub struct RecordingSender {
    sent: Mutex<Vec<SentMessage>>,
    faults: Mutex<VecDeque<SendFault>>,
}

impl RecordingSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, fault: SendFault) {
        self.faults.lock().push_back(fault);
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.sent.lock().len()
    }

    pub fn count_channel(&self, channel: Channel) -> usize {
        self.sent.lock().iter().filter(|m| m.channel == channel).count()
    }
}

#[async_trait]
impl MessageSender for RecordingSender {
    async fn send(
        &self,
        channel: Channel,
        content: &RenderedMessage,
        destination: &str,
    ) -> Result<DeliveryReceipt, SendFault> {
        if let Some(fault) = self.faults.lock().pop_front() {
            return Err(fault);
        }
        self.sent.lock().push(SentMessage {
            channel,
            content: content.clone(),
            destination: destination.to_string(),
        });
        Ok(DeliveryReceipt {
            provider_message_id: None,
            accepted_at: Utc::now(),
        })
    }
}
