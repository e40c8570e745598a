use std::{collections::BTreeMap, time::Duration};

use async_trait::async_trait;

use crate::domain::{
    assignment::{AssignmentProposal, AssignmentSnapshot, FencingToken, NodeId},
    error::PipelineError,
    record::PartitionId
};

/// Coordination store holding the partition assignment table and node heartbeats.
///
/// Every call names the calling node so that connectivity can be modelled per
/// node; an unreachable node gets [`PipelineError::Unreachable`].
#[async_trait]
pub trait AssignmentStore: Send + Sync {
    async fn snapshot(&self, caller: &NodeId) -> Result<AssignmentSnapshot, PipelineError>;

    /// Compare-and-set: applied only if the table is still at `proposal.expected_epoch`
    async fn propose(&self, caller: &NodeId, proposal: AssignmentProposal) -> Result<AssignmentSnapshot, PipelineError>;

    /// Confirm the caller stopped consuming a partition it was handing off
    async fn release(&self, caller: &NodeId, partition: PartitionId) -> Result<AssignmentSnapshot, PipelineError>;

    async fn heartbeat(&self, caller: &NodeId) -> Result<(), PipelineError>;

    /// Time since each known node last heartbeated
    async fn heartbeat_ages(&self, caller: &NodeId) -> Result<BTreeMap<NodeId, Duration>, PipelineError>;

    /// Whether the token still designates the active owner of its partition
    async fn validate(&self, token: &FencingToken) -> Result<bool, PipelineError>;
}
