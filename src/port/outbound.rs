use async_trait::async_trait;

use crate::domain::{entity::EntityKey, error::PipelineError, state::DeviceCommand};

/// Outbound command delivery to connected devices
#[async_trait]
pub trait CommandGateway: Send + Sync {
    async fn deliver(&self, key: &EntityKey, command: DeviceCommand) -> Result<(), PipelineError>;
}
