use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{
    chain::ChainId,
    entity::EntityKey,
    error::ErrorClass,
    outcome::AttemptRecord,
    record::{Offset, PartitionId}
};

/// Append-only record of a message the pipeline gave up on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    /// Absent when the record could not be decoded
    pub entity_key:       Option<EntityKey>,
    pub chain_id:         Option<ChainId>,
    pub failing_node:     Option<String>,
    pub reason:           String,
    pub class:            ErrorClass,
    pub attempt_count:    u32,
    pub attempts:         Vec<AttemptRecord>,
    /// The message as submitted, or the raw record payload as a string when undecodable
    pub payload:          serde_json::Value,
    pub partition:        PartitionId,
    pub offset:           Offset,
    pub dead_lettered_at: DateTime<Utc>
}

impl DeadLetterEntry {
    /// Entry for a record that never reached an entity actor
    pub fn unprocessable(
        partition: PartitionId,
        offset: Offset,
        entity_key: Option<EntityKey>,
        payload: serde_json::Value,
        reason: impl Into<String>
    ) -> Self {
        Self {
            entity_key,
            chain_id: None,
            failing_node: None,
            reason: reason.into(),
            class: ErrorClass::Configuration,
            attempt_count: 0,
            attempts: Vec::new(),
            payload,
            partition,
            offset,
            dead_lettered_at: Utc::now()
        }
    }

    pub fn to_json_line(&self) -> Result<String, crate::domain::error::PipelineError> {
        Ok(serde_json::to_string(self)?)
    }
}
