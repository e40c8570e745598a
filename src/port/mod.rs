//! Ports: contracts the pipeline consumes from its collaborators

use std::sync::Arc;

pub mod assignment;
pub mod dead_letter;
pub mod membership;
pub mod outbound;
pub mod persistence;
pub mod queue;

/// Side-effect collaborators reachable from rule nodes
#[derive(Clone)]
pub struct Collaborators {
    pub entities: Arc<dyn persistence::EntityStore>,
    pub commands: Arc<dyn outbound::CommandGateway>
}
