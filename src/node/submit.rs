//! Connector entry point: `submit(EntityKey, payload)`

use std::sync::Arc;

use serde::Serialize;
use tracing::{Level, event};

use crate::{
    domain::{
        constant::node,
        entity::EntityKey,
        error::PipelineError,
        message::{Message, MessageType},
        record::QueuePosition
    },
    port::queue::PartitionedQueue
};

pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 256 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum SubmitResult {
    Accepted { position: QueuePosition },
    Rejected { reason: String }
}

impl SubmitResult {
    pub fn is_accepted(&self) -> bool {
        matches!(self, SubmitResult::Accepted { .. })
    }
}

/// Validates inbound messages and appends them to the queue under their entity's routing key
pub struct Submitter {
    queue:             Arc<dyn PartitionedQueue>,
    max_payload_bytes: usize
}

impl Submitter {
    pub fn new(queue: Arc<dyn PartitionedQueue>, max_payload_bytes: usize) -> Self {
        Self { queue, max_payload_bytes }
    }

    /// Rejections are answers to the connector; `Err` means the queue itself failed
    pub async fn submit(
        &self,
        key: EntityKey,
        msg_type: MessageType,
        payload: serde_json::Value
    ) -> Result<SubmitResult, PipelineError> {
        if let Err(reason) = self.check(&key, &payload) {
            event!(Level::WARN, event = node::SUBMIT_REJECTED, entity = %key, reason = %reason);
            return Ok(SubmitResult::Rejected { reason });
        }

        let message = Message::new(key, msg_type, payload);
        let bytes = message.encode()?;
        if bytes.len() > self.max_payload_bytes {
            let reason = format!("payload of {} bytes exceeds the limit of {}", bytes.len(), self.max_payload_bytes);
            event!(Level::WARN, event = node::SUBMIT_REJECTED, entity = %message.originator, reason = %reason);
            return Ok(SubmitResult::Rejected { reason });
        }

        let position = self.queue.publish(&message.originator.routing_key(), bytes).await?;
        event!(Level::DEBUG, event = node::SUBMIT_ACCEPTED, entity = %message.originator, id = %message.id,
               partition = %position.partition, offset = position.offset);
        Ok(SubmitResult::Accepted { position })
    }

    fn check(&self, key: &EntityKey, payload: &serde_json::Value) -> Result<(), String> {
        key.validate().map_err(|e| e.to_string())?;
        if payload.is_null() {
            return Err("payload must not be null".to_string());
        }
        Ok(())
    }
}
