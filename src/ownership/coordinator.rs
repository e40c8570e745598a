//! Assignment planning
//!
//! Every node computes the same plan from the same inputs; only the leader
//! (smallest live node id) submits it to the store.

use std::{
    collections::{BTreeMap, BTreeSet},
    time::Duration
};

use crate::{
    domain::assignment::{AssignmentProposal, AssignmentSnapshot, NodeId},
    ownership::strategy::AssignmentStrategy
};

/// Joined nodes whose last heartbeat is within `node_timeout`
pub fn live_nodes(
    members: &BTreeSet<NodeId>,
    heartbeat_ages: &BTreeMap<NodeId, Duration>,
    node_timeout: Duration
) -> BTreeSet<NodeId> {
    members.iter().filter(|node| heartbeat_ages.get(*node).is_some_and(|age| *age <= node_timeout)).cloned().collect()
}

pub fn leader(live: &BTreeSet<NodeId>) -> Option<&NodeId> {
    live.first()
}

/// Nodes the table still references that are no longer live
pub fn dead_nodes(snapshot: &AssignmentSnapshot, live: &BTreeSet<NodeId>) -> BTreeSet<NodeId> {
    snapshot.owners.values().chain(snapshot.handoffs.values()).filter(|node| !live.contains(*node)).cloned().collect()
}

/// Proposal moving the table to the strategy's assignment for `live`, if anything changes
pub fn plan(
    snapshot: &AssignmentSnapshot,
    live: &BTreeSet<NodeId>,
    strategy: AssignmentStrategy,
    partition_count: u32
) -> Option<AssignmentProposal> {
    let owners = strategy.assign(partition_count, live);
    let dead = dead_nodes(snapshot, live);
    let stale_handoffs = snapshot.handoffs.values().any(|node| dead.contains(node));

    if owners == snapshot.owners && !stale_handoffs {
        return None;
    }

    Some(AssignmentProposal { expected_epoch: snapshot.epoch, owners, dead })
}
