use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::domain::{
    entity::EntityKey,
    error::PipelineError,
    state::{Alert, AttributeScope, EntityState, TelemetryValue}
};

/// Durable entity state owned by the persistence collaborator.
///
/// Every write is an idempotent upsert so a redelivered message leaves the
/// same state as a single delivery.
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn read_entity_state(&self, key: &EntityKey) -> Result<EntityState, PipelineError>;

    /// Upsert values keyed by (key, ts)
    async fn append_telemetry(&self, key: &EntityKey, values: Vec<TelemetryValue>) -> Result<(), PipelineError>;

    async fn write_entity_attribute(
        &self,
        key: &EntityKey,
        scope: AttributeScope,
        attributes: BTreeMap<String, serde_json::Value>
    ) -> Result<(), PipelineError>;

    /// Upsert keyed by (originator, alert type, message id)
    async fn create_alert(&self, alert: Alert) -> Result<(), PipelineError>;
}
