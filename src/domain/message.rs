//! Canonical message carried through the pipeline

use std::{collections::BTreeMap, fmt::Display};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{entity::EntityKey, error::PipelineError};

/// Type of a message as decoded by the transport connector
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageType {
    PostTelemetry,
    PostAttributes,
    RpcCall,
    Custom(String)
}

impl MessageType {
    pub fn as_str(&self) -> &str {
        match self {
            MessageType::PostTelemetry => "POST_TELEMETRY_REQUEST",
            MessageType::PostAttributes => "POST_ATTRIBUTES_REQUEST",
            MessageType::RpcCall => "RPC_CALL",
            MessageType::Custom(name) => name
        }
    }
}

impl From<String> for MessageType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "POST_TELEMETRY_REQUEST" => MessageType::PostTelemetry,
            "POST_ATTRIBUTES_REQUEST" => MessageType::PostAttributes,
            "RPC_CALL" => MessageType::RpcCall,
            _ => MessageType::Custom(value)
        }
    }
}

impl From<MessageType> for String {
    fn from(value: MessageType) -> Self {
        value.as_str().to_string()
    }
}

impl Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message as submitted by a connector and transformed by rule nodes.
///
/// The payload is a JSON document; metadata is a flat string map that rule
/// nodes use to pass context along a path (enriched attributes, errors, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message identifier, stable across redeliveries
    pub id:         Uuid,
    /// Message type
    pub msg_type:   MessageType,
    /// Entity the message originates from
    pub originator: EntityKey,
    /// JSON payload
    pub payload:    serde_json::Value,
    /// String metadata
    #[serde(default)]
    pub metadata:   BTreeMap<String, String>,
    /// Time the connector accepted the message
    pub ts:         DateTime<Utc>
}

impl Message {
    pub fn new(originator: EntityKey, msg_type: MessageType, payload: serde_json::Value) -> Self {
        Self { id: Uuid::new_v4(), msg_type, originator, payload, metadata: BTreeMap::new(), ts: Utc::now() }
    }

    pub fn telemetry(originator: EntityKey, payload: serde_json::Value) -> Self {
        Self::new(originator, MessageType::PostTelemetry, payload)
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Timestamp in milliseconds, honouring a `ts` metadata override
    pub fn ts_millis(&self) -> i64 {
        self.metadata.get("ts").and_then(|ts| ts.parse::<i64>().ok()).unwrap_or_else(|| self.ts.timestamp_millis())
    }

    pub fn encode(&self) -> Result<Vec<u8>, PipelineError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, PipelineError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_custom_message_type_survives_encoding() {
        let message = Message::new(
            EntityKey::device("acme", "d1"),
            MessageType::from("CONNECT_EVENT".to_string()),
            json!({"online": true})
        );
        let decoded = Message::decode(&message.encode().unwrap()).unwrap();
        assert_eq!(decoded.msg_type, MessageType::Custom("CONNECT_EVENT".into()));
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_ts_metadata_override() {
        let message = Message::telemetry(EntityKey::device("acme", "d1"), json!({})).with_metadata("ts", "1700000000000");
        assert_eq!(message.ts_millis(), 1_700_000_000_000);
    }
}
