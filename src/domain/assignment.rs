//! Partition assignment table
//!
//! The assignment table is the only cluster-wide shared mutable state. It is
//! versioned by a monotonically increasing [`Epoch`]; every partition also
//! remembers the epoch at which its current owner was assigned, which is the
//! epoch carried by fencing tokens. A partition that moved away from a live
//! node stays in `handoffs` until that node confirms it stopped consuming, and
//! the new owner must not start before then.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::Display
};

use serde::{Deserialize, Serialize};

use crate::domain::record::PartitionId;

/// Processing node identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Monotonic assignment version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct Epoch(pub u64);

impl Epoch {
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl Display for Epoch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "e{}", self.0)
    }
}

/// Proof of ownership presented with every commit
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FencingToken {
    pub partition: PartitionId,
    pub epoch:     Epoch,
    pub node:      NodeId
}

impl Display for FencingToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}/{}", self.partition, self.epoch, self.node)
    }
}

/// New assignment computed by the coordinator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssignmentProposal {
    /// Epoch the proposal was computed against; the store rejects it if the table moved on
    pub expected_epoch: Epoch,
    pub owners:         BTreeMap<PartitionId, NodeId>,
    /// Nodes considered dead; they are not waited on during handoff
    pub dead:           BTreeSet<NodeId>
}

/// Versioned partition → owner mapping
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentSnapshot {
    pub epoch:            Epoch,
    pub owners:           BTreeMap<PartitionId, NodeId>,
    /// Epoch at which each partition's current owner was assigned
    pub partition_epochs: BTreeMap<PartitionId, Epoch>,
    /// Partitions whose previous owner has not yet released them
    pub handoffs:         BTreeMap<PartitionId, NodeId>,
    /// Bumped on every change, including releases that keep the epoch
    pub revision:         u64
}

impl AssignmentSnapshot {
    pub fn owner(&self, partition: PartitionId) -> Option<&NodeId> {
        self.owners.get(&partition)
    }

    pub fn partition_epoch(&self, partition: PartitionId) -> Epoch {
        self.partition_epochs.get(&partition).copied().unwrap_or_default()
    }

    /// Owner may consume: assigned to it and no previous owner still draining.
    pub fn is_active_owner(&self, partition: PartitionId, node: &NodeId) -> bool {
        self.owners.get(&partition) == Some(node) && self.handoffs.get(&partition).is_none_or(|from| from == node)
    }

    pub fn active_partitions(&self, node: &NodeId) -> BTreeSet<PartitionId> {
        self.owners.keys().copied().filter(|partition| self.is_active_owner(*partition, node)).collect()
    }

    /// Partitions the node must release before their new owner can start
    pub fn pending_releases(&self, node: &NodeId) -> BTreeSet<PartitionId> {
        self.handoffs.iter().filter(|(_, from)| *from == node).map(|(partition, _)| *partition).collect()
    }

    pub fn token_for(&self, partition: PartitionId, node: &NodeId) -> Option<FencingToken> {
        self.is_active_owner(partition, node).then(|| FencingToken {
            partition,
            epoch: self.partition_epoch(partition),
            node: node.clone()
        })
    }

    pub fn validate(&self, token: &FencingToken) -> bool {
        self.is_active_owner(token.partition, &token.node) && self.partition_epoch(token.partition) == token.epoch
    }

    /// Compute the next snapshot for a set of owners.
    ///
    /// Partitions keep their epoch when their owner does not change. A partition
    /// moving away from a live node gets a handoff entry; dead nodes never do.
    pub fn advance(&self, owners: BTreeMap<PartitionId, NodeId>, dead: &BTreeSet<NodeId>) -> AssignmentSnapshot {
        let epoch = self.epoch.next();
        let mut partition_epochs = BTreeMap::new();
        let mut handoffs = BTreeMap::new();

        let partitions: BTreeSet<PartitionId> = self.owners.keys().chain(owners.keys()).copied().collect();

        for partition in partitions {
            let previous = self.owners.get(&partition);
            let next = owners.get(&partition);
            let pending = self.handoffs.get(&partition).filter(|from| !dead.contains(*from));

            if let Some(next_owner) = next {
                if previous == Some(next_owner) {
                    partition_epochs.insert(partition, self.partition_epoch(partition));
                } else {
                    partition_epochs.insert(partition, epoch);
                }
            }

            let handoff = match (pending, previous) {
                (Some(from), _) => Some(from),
                (None, Some(from)) if Some(from) != next && !dead.contains(from) && self.handoff_done(partition) => {
                    Some(from)
                }
                _ => None
            };

            if let Some(from) = handoff
                && Some(from) != next
            {
                handoffs.insert(partition, from.clone());
            }
        }

        AssignmentSnapshot { epoch, owners, partition_epochs, handoffs, revision: self.revision + 1 }
    }

    /// Previous owner could have been consuming: nothing was pending in front of it.
    fn handoff_done(&self, partition: PartitionId) -> bool {
        !self.handoffs.contains_key(&partition)
    }

    /// Record that `node` stopped consuming `partition`.
    pub fn release(&mut self, partition: PartitionId, node: &NodeId) -> bool {
        if self.handoffs.get(&partition) == Some(node) {
            self.handoffs.remove(&partition);
            self.revision += 1;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str) -> NodeId {
        NodeId::new(id)
    }

    fn owners(pairs: &[(u32, &str)]) -> BTreeMap<PartitionId, NodeId> {
        pairs.iter().map(|(p, n)| (PartitionId(*p), node(n))).collect()
    }

    #[test]
    fn test_initial_assignment_has_no_handoffs() {
        let snapshot = AssignmentSnapshot::default().advance(owners(&[(0, "a"), (1, "a")]), &BTreeSet::new());
        assert_eq!(snapshot.epoch, Epoch(1));
        assert!(snapshot.handoffs.is_empty());
        assert!(snapshot.is_active_owner(PartitionId(0), &node("a")));
    }

    #[test]
    fn test_moved_partition_waits_for_release() {
        let first = AssignmentSnapshot::default().advance(owners(&[(0, "a"), (1, "a")]), &BTreeSet::new());
        let mut second = first.advance(owners(&[(0, "a"), (1, "b")]), &BTreeSet::new());

        assert_eq!(second.partition_epoch(PartitionId(0)), Epoch(1));
        assert_eq!(second.partition_epoch(PartitionId(1)), Epoch(2));
        assert!(!second.is_active_owner(PartitionId(1), &node("b")));
        assert!(!second.is_active_owner(PartitionId(1), &node("a")));
        assert_eq!(second.pending_releases(&node("a")), BTreeSet::from([PartitionId(1)]));

        assert!(second.release(PartitionId(1), &node("a")));
        assert!(second.is_active_owner(PartitionId(1), &node("b")));
    }

    #[test]
    fn test_dead_owner_is_not_waited_on() {
        let first = AssignmentSnapshot::default().advance(owners(&[(0, "a")]), &BTreeSet::new());
        let second = first.advance(owners(&[(0, "b")]), &BTreeSet::from([node("a")]));
        assert!(second.is_active_owner(PartitionId(0), &node("b")));
    }

    #[test]
    fn test_pending_handoff_survives_second_move() {
        let first = AssignmentSnapshot::default().advance(owners(&[(0, "a")]), &BTreeSet::new());
        let second = first.advance(owners(&[(0, "b")]), &BTreeSet::new());
        let third = second.advance(owners(&[(0, "c")]), &BTreeSet::new());
        assert_eq!(third.handoffs.get(&PartitionId(0)), Some(&node("a")));
        assert!(third.pending_releases(&node("b")).is_empty());
    }

    #[test]
    fn test_stale_token_is_rejected() {
        let first = AssignmentSnapshot::default().advance(owners(&[(0, "a")]), &BTreeSet::new());
        let token = first.token_for(PartitionId(0), &node("a")).unwrap();
        assert!(first.validate(&token));

        let mut second = first.advance(owners(&[(0, "b")]), &BTreeSet::new());
        assert!(!second.validate(&token));
        second.release(PartitionId(0), &node("a"));
        let moved_back = second.advance(owners(&[(0, "a")]), &BTreeSet::new());
        assert!(!moved_back.validate(&token));
    }
}
