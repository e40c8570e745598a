//! Entity state and side-effect payloads exchanged with collaborators

use std::{collections::BTreeMap, fmt::Display};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::entity::EntityKey;

/// One timestamped telemetry value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryValue {
    /// Milliseconds since the epoch
    pub ts:    i64,
    pub key:   String,
    pub value: serde_json::Value
}

/// Attribute scope, mirrors where an attribute is owned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AttributeScope {
    Client,
    #[default]
    Server,
    Shared
}

impl Display for AttributeScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AttributeScope::Client => "client",
            AttributeScope::Server => "server",
            AttributeScope::Shared => "shared"
        };
        f.write_str(name)
    }
}

/// Durable state of an entity as seen by rule nodes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityState {
    pub attributes:       BTreeMap<String, serde_json::Value>,
    /// Latest value per telemetry key
    pub latest_telemetry: BTreeMap<String, TelemetryValue>
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Critical,
    Major,
    #[default]
    Minor,
    Warning,
    Indeterminate
}

/// Alert raised by a rule chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub originator: EntityKey,
    pub alert_type: String,
    pub severity:   AlertSeverity,
    /// Message that raised the alert; alerts are idempotent per (originator, type, message)
    pub message_id: Uuid,
    pub details:    serde_json::Value,
    pub created_at: DateTime<Utc>
}

/// Command delivered to a device through the outbound gateway
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceCommand {
    pub method:         String,
    pub params:         serde_json::Value,
    pub correlation_id: Uuid
}
