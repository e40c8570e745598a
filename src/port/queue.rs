use std::time::Duration;

use async_trait::async_trait;

use crate::domain::{
    error::PipelineError,
    record::{Offset, PartitionId, QueuePosition, QueueRecord}
};

/// Durable, ordered, replayable log split into a fixed number of partitions.
///
/// Records with the same key always land on the same partition and are read
/// back in publish order. Consumer groups track their progress per partition
/// through committed offsets; a record stays re-deliverable until committed.
#[async_trait]
pub trait PartitionedQueue: Send + Sync {
    /// Number of partitions, fixed at creation
    fn partition_count(&self) -> u32;

    fn partition_for(&self, key: &str) -> PartitionId {
        PartitionId::for_key(key, self.partition_count())
    }

    /// Append a record; returns its position
    async fn publish(&self, key: &str, payload: Vec<u8>) -> Result<QueuePosition, PipelineError>;

    /// Read up to `max` records starting at `from`
    async fn fetch(&self, partition: PartitionId, from: Offset, max: usize) -> Result<Vec<QueueRecord>, PipelineError>;

    /// Offset the next published record will get
    async fn end_offset(&self, partition: PartitionId) -> Result<Offset, PipelineError>;

    /// Wait until a record at `from` exists or the timeout elapses. Returns whether one exists.
    async fn wait_for_records(
        &self,
        partition: PartitionId,
        from: Offset,
        timeout: Duration
    ) -> Result<bool, PipelineError>;

    /// Advance the group's committed offset. Commits never move backwards.
    async fn commit(&self, group: &str, partition: PartitionId, offset: Offset) -> Result<(), PipelineError>;

    /// Next offset the group reads from; zero when nothing was committed
    async fn committed(&self, group: &str, partition: PartitionId) -> Result<Offset, PipelineError>;

    /// Move the committed offset to exactly `offset`, backwards included
    async fn seek(&self, group: &str, partition: PartitionId, offset: Offset) -> Result<(), PipelineError>;
}
