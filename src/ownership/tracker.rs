use std::collections::{BTreeMap, BTreeSet};

use crate::domain::{
    assignment::{AssignmentSnapshot, Epoch, FencingToken, NodeId},
    record::PartitionId
};

/// Local consumption state of a partition. Absent means idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionState {
    Running { epoch: Epoch },
    Draining { epoch: Epoch }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OwnershipCommand {
    /// Begin consuming with this token
    Start(FencingToken),
    /// Revoke the lease; the consumer reports back once it stopped
    Stop(PartitionId),
    /// Tell the store the partition is no longer consumed here
    Release(PartitionId)
}

/// Reconciles observed assignment snapshots with what this node consumes
#[derive(Debug)]
pub struct PartitionTracker {
    node:   NodeId,
    states: BTreeMap<PartitionId, PartitionState>
}

impl PartitionTracker {
    pub fn new(node: NodeId) -> Self {
        Self { node, states: BTreeMap::new() }
    }

    pub fn reconcile(&mut self, snapshot: &AssignmentSnapshot) -> Vec<OwnershipCommand> {
        let active = snapshot.active_partitions(&self.node);
        let mut commands = Vec::new();

        for (partition, state) in self.states.iter_mut() {
            if let PartitionState::Running { epoch } = *state
                && (!active.contains(partition) || snapshot.partition_epoch(*partition) != epoch)
            {
                *state = PartitionState::Draining { epoch };
                commands.push(OwnershipCommand::Stop(*partition));
            }
        }

        for partition in active {
            if self.states.contains_key(&partition) {
                continue;
            }
            if let Some(token) = snapshot.token_for(partition, &self.node) {
                self.states.insert(partition, PartitionState::Running { epoch: token.epoch });
                commands.push(OwnershipCommand::Start(token));
            }
        }

        for partition in snapshot.pending_releases(&self.node) {
            if !self.states.contains_key(&partition) {
                commands.push(OwnershipCommand::Release(partition));
            }
        }

        commands
    }

    /// Consumer for the partition exited
    pub fn stopped(&mut self, partition: PartitionId) {
        self.states.remove(&partition);
    }

    /// Mark every running partition as draining; returns them
    pub fn fence_all(&mut self) -> Vec<PartitionId> {
        let mut fenced = Vec::new();
        for (partition, state) in self.states.iter_mut() {
            if let PartitionState::Running { epoch } = *state {
                *state = PartitionState::Draining { epoch };
                fenced.push(*partition);
            }
        }
        fenced
    }

    pub fn running(&self) -> BTreeSet<PartitionId> {
        self.states
            .iter()
            .filter(|(_, state)| matches!(state, PartitionState::Running { .. }))
            .map(|(partition, _)| *partition)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owners(pairs: &[(u32, &str)]) -> BTreeMap<PartitionId, NodeId> {
        pairs.iter().map(|(p, n)| (PartitionId(*p), NodeId::new(*n))).collect()
    }

    #[test]
    fn test_handoff_sequence() {
        let a = NodeId::new("a");
        let b = NodeId::new("b");
        let mut tracker_a = PartitionTracker::new(a.clone());
        let mut tracker_b = PartitionTracker::new(b.clone());

        let first = AssignmentSnapshot::default().advance(owners(&[(0, "a")]), &BTreeSet::new());
        assert!(matches!(tracker_a.reconcile(&first).as_slice(), [OwnershipCommand::Start(_)]));

        let mut second = first.advance(owners(&[(0, "b")]), &BTreeSet::new());
        assert_eq!(tracker_a.reconcile(&second), vec![OwnershipCommand::Stop(PartitionId(0))]);
        assert!(tracker_b.reconcile(&second).is_empty());

        // still draining: nothing to release yet
        assert!(tracker_a.reconcile(&second).is_empty());
        tracker_a.stopped(PartitionId(0));
        assert_eq!(tracker_a.reconcile(&second), vec![OwnershipCommand::Release(PartitionId(0))]);

        second.release(PartitionId(0), &a);
        match tracker_b.reconcile(&second).as_slice() {
            [OwnershipCommand::Start(token)] => assert_eq!(token.epoch, Epoch(2)),
            other => panic!("unexpected commands {:?}", other)
        }
    }

    #[test]
    fn test_fence_all_drains_running() {
        let mut tracker = PartitionTracker::new(NodeId::new("a"));
        let snapshot = AssignmentSnapshot::default().advance(owners(&[(0, "a"), (1, "a")]), &BTreeSet::new());
        tracker.reconcile(&snapshot);

        assert_eq!(tracker.fence_all(), vec![PartitionId(0), PartitionId(1)]);
        assert!(tracker.running().is_empty());
        assert!(tracker.reconcile(&snapshot).is_empty());
    }
}
