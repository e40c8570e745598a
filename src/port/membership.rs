use std::collections::BTreeSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::domain::{assignment::NodeId, error::PipelineError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberStatus {
    Joined,
    Left,
    Dead
}

/// `(node, status)` change in cluster membership
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipEvent {
    pub node_id: NodeId,
    pub status:  MemberStatus
}

impl MembershipEvent {
    pub fn new(node_id: NodeId, status: MemberStatus) -> Self {
        Self { node_id, status }
    }
}

/// Cluster membership feed
#[async_trait]
pub trait MembershipFeed: Send + Sync {
    /// Nodes currently joined
    async fn members(&self) -> Result<BTreeSet<NodeId>, PipelineError>;

    /// Stream of changes after subscription
    async fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<MembershipEvent>, PipelineError>;

    async fn announce(&self, event: MembershipEvent) -> Result<(), PipelineError>;
}
