//! Entity addressing
//!
//! An [`EntityKey`] is the stable identity of a device or asset. It is the queue
//! routing key (so every message for one entity lands on one partition) and the
//! path of the entity's actor in the hierarchy.

use std::{fmt::Display, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::domain::error::PipelineError;

/// Tenant identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(pub String);

impl TenantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of entity a message originates from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Device,
    Asset,
    Gateway
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Device => "device",
            EntityType::Asset => "asset",
            EntityType::Gateway => "gateway"
        }
    }
}

impl Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "device" => Ok(EntityType::Device),
            "asset" => Ok(EntityType::Asset),
            "gateway" => Ok(EntityType::Gateway),
            other => Err(PipelineError::Validation(format!("unknown entity type: {}", other)))
        }
    }
}

/// (tenant, type, id) identity of an entity
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    pub tenant_id:   TenantId,
    pub entity_type: EntityType,
    pub entity_id:   String
}

impl EntityKey {
    pub fn new(tenant_id: impl Into<String>, entity_type: EntityType, entity_id: impl Into<String>) -> Self {
        Self { tenant_id: TenantId::new(tenant_id), entity_type, entity_id: entity_id.into() }
    }

    pub fn device(tenant_id: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self::new(tenant_id, EntityType::Device, entity_id)
    }

    /// Key used to route records to a partition. Stable across releases.
    pub fn routing_key(&self) -> String {
        format!("{}/{}/{}", self.tenant_id, self.entity_type, self.entity_id)
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.tenant_id.0.trim().is_empty() {
            return Err(PipelineError::Validation("tenant id must not be empty".to_string()));
        }
        if self.entity_id.trim().is_empty() {
            return Err(PipelineError::Validation("entity id must not be empty".to_string()));
        }
        if self.tenant_id.0.contains('/') {
            return Err(PipelineError::Validation(format!("tenant id must not contain '/': {}", self.tenant_id)));
        }
        Ok(())
    }
}

impl Display for EntityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.routing_key())
    }
}

impl FromStr for EntityKey {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, '/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(tenant), Some(kind), Some(id)) => {
                let key = EntityKey::new(tenant, kind.parse()?, id);
                key.validate()?;
                Ok(key)
            }
            _ => Err(PipelineError::Validation(format!("malformed entity key: {}", s)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_routing_key_round_trips() {
        let key = EntityKey::device("acme", "sensor/7");
        assert_eq!(key.routing_key(), "acme/device/sensor/7");
        assert_eq!("acme/device/sensor/7".parse::<EntityKey>().unwrap(), key);
    }

    #[test]
    fn test_rejects_blank_identifiers() {
        assert!(EntityKey::device("", "d1").validate().is_err());
        assert!(EntityKey::device("acme", "  ").validate().is_err());
        assert!("acme/pump/d1".parse::<EntityKey>().is_err());
    }
}
