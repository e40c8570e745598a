//! Deterministic partition → node assignment strategies

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::domain::{
    assignment::NodeId,
    record::{PartitionId, stable_hash}
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum, Default)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStrategy {
    /// Partition `i` goes to the `i mod n`-th node in sorted order
    #[value(name = "round_robin")]
    RoundRobin,
    /// Highest-random-weight hashing; only partitions of joining or leaving nodes move
    #[default]
    #[value(name = "rendezvous")]
    Rendezvous
}

impl AssignmentStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssignmentStrategy::RoundRobin => "round_robin",
            AssignmentStrategy::Rendezvous => "rendezvous"
        }
    }

    /// Same inputs give the same owners on every node
    pub fn assign(&self, partition_count: u32, nodes: &BTreeSet<NodeId>) -> BTreeMap<PartitionId, NodeId> {
        if nodes.is_empty() {
            return BTreeMap::new();
        }

        match self {
            AssignmentStrategy::RoundRobin => {
                let sorted: Vec<&NodeId> = nodes.iter().collect();
                PartitionId::all(partition_count)
                    .map(|partition| (partition, sorted[partition.0 as usize % sorted.len()].clone()))
                    .collect()
            }
            AssignmentStrategy::Rendezvous => PartitionId::all(partition_count)
                .filter_map(|partition| {
                    nodes
                        .iter()
                        .max_by_key(|node| (stable_hash(format!("{}:{}", node, partition.0)), (*node).clone()))
                        .map(|node| (partition, node.clone()))
                })
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes(ids: &[&str]) -> BTreeSet<NodeId> {
        ids.iter().map(|id| NodeId::new(*id)).collect()
    }

    #[test]
    fn test_round_robin_over_sorted_ids() {
        let owners = AssignmentStrategy::RoundRobin.assign(4, &nodes(&["b", "a"]));
        assert_eq!(owners[&PartitionId(0)], NodeId::new("a"));
        assert_eq!(owners[&PartitionId(1)], NodeId::new("b"));
        assert_eq!(owners[&PartitionId(2)], NodeId::new("a"));
    }

    #[test]
    fn test_rendezvous_moves_only_departing_partitions() {
        let before = AssignmentStrategy::Rendezvous.assign(64, &nodes(&["a", "b", "c"]));
        let after = AssignmentStrategy::Rendezvous.assign(64, &nodes(&["a", "b"]));

        for (partition, owner) in &before {
            if owner.as_str() != "c" {
                assert_eq!(&after[partition], owner);
            }
        }
        assert!(after.values().all(|owner| owner.as_str() != "c"));
    }

    #[test]
    fn test_every_partition_has_one_owner() {
        for strategy in [AssignmentStrategy::RoundRobin, AssignmentStrategy::Rendezvous] {
            let owners = strategy.assign(16, &nodes(&["a", "b", "c"]));
            assert_eq!(owners.len(), 16);
        }
        assert!(AssignmentStrategy::Rendezvous.assign(16, &BTreeSet::new()).is_empty());
    }
}
