//! Typed messages for actor communication

use ractor::{ActorId, Message, RpcReplyPort};
use serde::Serialize;

use crate::{
    context::ProcessingContext,
    domain::entity::{EntityKey, TenantId}
};

/// Messages for the root actor (one per node)
#[derive(Debug)]
pub enum RootMessage {
    /// Route a context to its tenant, spawning the tenant on first use
    Route { context: Box<ProcessingContext> },
    /// A tenant has no entities left; `received` is how many contexts it saw
    TenantIdle { tenant: TenantId, received: u64 },
    /// System health check
    Health { reply: RpcReplyPort<SystemHealth> }
}

/// Messages for tenant actors
#[derive(Debug)]
pub enum TenantMessage {
    /// Route a context to its entity, spawning the entity on first use
    Route { context: Box<ProcessingContext> },
    /// An entity actor finished its `processed`-th context
    EntitySettled { key: EntityKey, actor: ActorId, processed: u64 },
    /// Evict idle entities
    Sweep,
    /// Number of live entities
    Entities { reply: RpcReplyPort<usize> }
}

/// Messages for entity actors
#[derive(Debug)]
pub enum EntityMessage {
    Process { context: Box<ProcessingContext> }
}

/// System health information
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SystemHealth {
    pub tenants:        usize,
    pub entities:       usize,
    pub processed:      u64,
    pub failed:         u64,
    pub dead_lettered:  u64,
    pub fenced:         u64,
    pub uptime_seconds: u64
}

// Implement Message trait for Ractor
impl Message for RootMessage {}
impl Message for TenantMessage {}
impl Message for EntityMessage {}
