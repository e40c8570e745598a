//! Queue records and partition addressing

use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Offset of a record inside a partition. Offsets start at zero and are dense.
pub type Offset = u64;

/// Deterministic 64-bit FNV-1a hash, stable across toolchains and processes.
pub fn stable_hash(bytes: impl AsRef<[u8]>) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;
    bytes.as_ref().iter().fold(OFFSET_BASIS, |hash, byte| (hash ^ u64::from(*byte)).wrapping_mul(PRIME))
}

/// Partition number within the topic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionId(pub u32);

impl PartitionId {
    /// Partition a routing key maps to; the same key always maps to the same partition.
    pub fn for_key(key: &str, partition_count: u32) -> Self {
        Self((stable_hash(key) % u64::from(partition_count.max(1))) as u32)
    }

    pub fn all(partition_count: u32) -> impl Iterator<Item = PartitionId> {
        (0..partition_count).map(PartitionId)
    }
}

impl Display for PartitionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "p{}", self.0)
    }
}

/// Position of a record after publication
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueuePosition {
    pub partition: PartitionId,
    pub offset:    Offset
}

/// Immutable record stored in a partition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueRecord {
    pub partition:   PartitionId,
    pub offset:      Offset,
    pub key:         String,
    pub payload:     Vec<u8>,
    pub enqueued_at: DateTime<Utc>
}

impl QueueRecord {
    pub fn position(&self) -> QueuePosition {
        QueuePosition { partition: self.partition, offset: self.offset }
    }
}

/// A commit as observed by the queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRecord {
    pub group:     String,
    pub partition: PartitionId,
    /// Next offset the group will read, i.e. every offset below it is processed
    pub offset:    Offset
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_routing_is_stable() {
        let first = PartitionId::for_key("acme/device/d1", 12);
        for _ in 0..10 {
            assert_eq!(PartitionId::for_key("acme/device/d1", 12), first);
        }
        assert!(first.0 < 12);
    }

    #[test]
    fn test_routing_spreads_keys() {
        let used: std::collections::HashSet<_> =
            (0..200).map(|i| PartitionId::for_key(&format!("acme/device/d{}", i), 8)).collect();
        assert_eq!(used.len(), 8);
    }
}
