//! In-memory coordination store
//!
//! Holds the assignment table and heartbeats for an in-process cluster. Node
//! connectivity can be cut with [`InMemoryAssignmentStore::isolate`] to model
//! a network partition between a node and the store.

use std::{
    collections::{BTreeMap, BTreeSet},
    time::Duration
};

use async_trait::async_trait;
use tokio::{sync::RwLock, time::Instant};

use crate::{
    domain::{
        assignment::{AssignmentProposal, AssignmentSnapshot, FencingToken, NodeId},
        error::PipelineError,
        record::PartitionId
    },
    port::assignment::AssignmentStore
};

#[derive(Default)]
pub struct InMemoryAssignmentStore {
    table:      RwLock<AssignmentSnapshot>,
    heartbeats: RwLock<BTreeMap<NodeId, Instant>>,
    isolated:   RwLock<BTreeSet<NodeId>>
}

impl InMemoryAssignmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cut the node off from the store
    pub async fn isolate(&self, node: &NodeId) {
        self.isolated.write().await.insert(node.clone());
    }

    pub async fn heal(&self, node: &NodeId) {
        self.isolated.write().await.remove(node);
    }

    /// Current table, bypassing connectivity checks
    pub async fn table(&self) -> AssignmentSnapshot {
        self.table.read().await.clone()
    }

    async fn reachable(&self, caller: &NodeId) -> Result<(), PipelineError> {
        if self.isolated.read().await.contains(caller) {
            return Err(PipelineError::Unreachable(format!("assignment store unreachable from {}", caller)));
        }
        Ok(())
    }
}

#[async_trait]
impl AssignmentStore for InMemoryAssignmentStore {
    async fn snapshot(&self, caller: &NodeId) -> Result<AssignmentSnapshot, PipelineError> {
        self.reachable(caller).await?;
        Ok(self.table.read().await.clone())
    }

    async fn propose(&self, caller: &NodeId, proposal: AssignmentProposal) -> Result<AssignmentSnapshot, PipelineError> {
        self.reachable(caller).await?;
        let mut table = self.table.write().await;
        if table.epoch != proposal.expected_epoch {
            return Err(PipelineError::Rejected(format!(
                "stale proposal from {}: expected {}, table at {}",
                caller, proposal.expected_epoch, table.epoch
            )));
        }

        *table = table.advance(proposal.owners, &proposal.dead);
        Ok(table.clone())
    }

    async fn release(&self, caller: &NodeId, partition: PartitionId) -> Result<AssignmentSnapshot, PipelineError> {
        self.reachable(caller).await?;
        let mut table = self.table.write().await;
        table.release(partition, caller);
        Ok(table.clone())
    }

    async fn heartbeat(&self, caller: &NodeId) -> Result<(), PipelineError> {
        self.reachable(caller).await?;
        self.heartbeats.write().await.insert(caller.clone(), Instant::now());
        Ok(())
    }

    async fn heartbeat_ages(&self, caller: &NodeId) -> Result<BTreeMap<NodeId, Duration>, PipelineError> {
        self.reachable(caller).await?;
        let now = Instant::now();
        Ok(self.heartbeats.read().await.iter().map(|(node, at)| (node.clone(), now.duration_since(*at))).collect())
    }

    async fn validate(&self, token: &FencingToken) -> Result<bool, PipelineError> {
        self.reachable(&token.node).await?;
        Ok(self.table.read().await.validate(token))
    }
}
