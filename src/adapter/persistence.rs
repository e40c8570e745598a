//! In-memory persistence and outbound command collaborators

use std::{
    collections::{BTreeMap, HashMap},
    sync::atomic::{AtomicU32, Ordering}
};

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{
    domain::{
        entity::EntityKey,
        error::PipelineError,
        state::{Alert, AttributeScope, DeviceCommand, EntityState, TelemetryValue}
    },
    port::{outbound::CommandGateway, persistence::EntityStore}
};

#[derive(Debug, Default, Clone)]
struct StoredEntity {
    attributes: BTreeMap<(AttributeScope, String), serde_json::Value>,
    /// (key, ts) → value
    telemetry:  BTreeMap<(String, i64), serde_json::Value>
}

/// Entity store keeping everything in memory. Writes are upserts.
#[derive(Default)]
pub struct InMemoryEntityStore {
    entities: RwLock<HashMap<EntityKey, StoredEntity>>,
    alerts:   RwLock<BTreeMap<(EntityKey, String, Uuid), Alert>>
}

impl InMemoryEntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stored telemetry value for an entity, ordered by key then timestamp
    pub async fn telemetry(&self, key: &EntityKey) -> Vec<TelemetryValue> {
        self.entities
            .read()
            .await
            .get(key)
            .map(|entity| {
                entity
                    .telemetry
                    .iter()
                    .map(|((name, ts), value)| TelemetryValue { ts: *ts, key: name.clone(), value: value.clone() })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn alerts(&self) -> Vec<Alert> {
        self.alerts.read().await.values().cloned().collect()
    }
}

#[async_trait]
impl EntityStore for InMemoryEntityStore {
    async fn read_entity_state(&self, key: &EntityKey) -> Result<EntityState, PipelineError> {
        let entities = self.entities.read().await;
        let Some(entity) = entities.get(key) else {
            return Ok(EntityState::default());
        };

        let attributes = entity.attributes.iter().map(|((_, name), value)| (name.clone(), value.clone())).collect();
        let mut latest_telemetry = BTreeMap::new();
        for ((name, ts), value) in &entity.telemetry {
            latest_telemetry.insert(name.clone(), TelemetryValue { ts: *ts, key: name.clone(), value: value.clone() });
        }

        Ok(EntityState { attributes, latest_telemetry })
    }

    async fn append_telemetry(&self, key: &EntityKey, values: Vec<TelemetryValue>) -> Result<(), PipelineError> {
        let mut entities = self.entities.write().await;
        let entity = entities.entry(key.clone()).or_default();
        for value in values {
            entity.telemetry.insert((value.key, value.ts), value.value);
        }
        Ok(())
    }

    async fn write_entity_attribute(
        &self,
        key: &EntityKey,
        scope: AttributeScope,
        attributes: BTreeMap<String, serde_json::Value>
    ) -> Result<(), PipelineError> {
        let mut entities = self.entities.write().await;
        let entity = entities.entry(key.clone()).or_default();
        for (name, value) in attributes {
            entity.attributes.insert((scope, name), value);
        }
        Ok(())
    }

    async fn create_alert(&self, alert: Alert) -> Result<(), PipelineError> {
        let id = (alert.originator.clone(), alert.alert_type.clone(), alert.message_id);
        self.alerts.write().await.entry(id).or_insert(alert);
        Ok(())
    }
}

/// Command gateway that records deliveries. Failures can be injected.
#[derive(Default)]
pub struct RecordingCommandGateway {
    delivered:     RwLock<Vec<(EntityKey, DeviceCommand)>>,
    failures_left: AtomicU32
}

impl RecordingCommandGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` deliveries fail with a transient error
    pub fn fail_next(&self, count: u32) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    pub async fn delivered(&self) -> Vec<(EntityKey, DeviceCommand)> {
        self.delivered.read().await.clone()
    }
}

#[async_trait]
impl CommandGateway for RecordingCommandGateway {
    async fn deliver(&self, key: &EntityKey, command: DeviceCommand) -> Result<(), PipelineError> {
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(PipelineError::Unreachable(format!("device {} did not acknowledge {}", key, command.method)));
        }

        self.delivered.write().await.push((key.clone(), command));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn test_telemetry_upsert_is_idempotent() {
        let store = InMemoryEntityStore::new();
        let key = EntityKey::device("acme", "d1");
        let values = vec![TelemetryValue { ts: 1, key: "temperature".into(), value: json!(50) }];

        store.append_telemetry(&key, values.clone()).await.unwrap();
        store.append_telemetry(&key, values).await.unwrap();
        assert_eq!(store.telemetry(&key).await.len(), 1);

        store
            .append_telemetry(&key, vec![TelemetryValue { ts: 2, key: "temperature".into(), value: json!(95) }])
            .await
            .unwrap();
        let state = store.read_entity_state(&key).await.unwrap();
        assert_eq!(state.latest_telemetry["temperature"].value, json!(95));
    }

    #[tokio::test]
    async fn test_gateway_failure_injection() {
        let gateway = RecordingCommandGateway::new();
        let key = EntityKey::device("acme", "d1");
        let command = DeviceCommand { method: "reboot".into(), params: json!({}), correlation_id: Uuid::new_v4() };

        gateway.fail_next(1);
        assert!(gateway.deliver(&key, command.clone()).await.is_err());
        assert!(gateway.deliver(&key, command).await.is_ok());
        assert_eq!(gateway.delivered().await.len(), 1);
    }
}
