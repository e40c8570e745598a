//! Partitioned queue implementations
//!
//! - InMemoryQueue: shared by every node of an in-process cluster, used for
//!   development and tests
//! - RocksDbQueue: durable partition log, see [`super::rocksdb_queue`]

use std::{collections::HashMap, path::Path, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{RwLock, watch};
use tracing::{Level, event};

use crate::{
    adapter::rocksdb_queue::RocksDbQueue,
    domain::{
        constant::queue,
        error::PipelineError,
        record::{CommitRecord, Offset, PartitionId, QueuePosition, QueueRecord}
    },
    port::queue::PartitionedQueue
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize, clap::ValueEnum, Default)]
pub enum QueueBackend {
    #[serde(rename = "inmemory")]
    #[value(name = "inmemory")]
    #[default]
    InMemory,
    #[serde(rename = "rocksdb")]
    #[value(name = "rocksdb")]
    RocksDb
}

impl QueueBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueBackend::InMemory => "inmemory",
            QueueBackend::RocksDb => "rocksdb"
        }
    }
}

struct PartitionLog {
    records: RwLock<Vec<QueueRecord>>,
    /// Offset of the next record; receivers wake up on publish
    end:     watch::Sender<Offset>
}

impl PartitionLog {
    fn new() -> Self {
        let (end, _) = watch::channel(0);
        Self { records: RwLock::new(Vec::new()), end }
    }
}

/// In-memory partition log with consumer-group offsets
pub struct InMemoryQueue {
    partitions: Vec<PartitionLog>,
    commits:    RwLock<HashMap<(String, PartitionId), Offset>>,
    /// Every commit that moved an offset, in order
    commit_log: RwLock<Vec<CommitRecord>>
}

impl InMemoryQueue {
    pub fn new(partition_count: u32) -> Self {
        let partitions = (0..partition_count.max(1)).map(|_| PartitionLog::new()).collect();
        Self { partitions, commits: RwLock::new(HashMap::new()), commit_log: RwLock::new(Vec::new()) }
    }

    fn log(&self, partition: PartitionId) -> Result<&PartitionLog, PipelineError> {
        self.partitions
            .get(partition.0 as usize)
            .ok_or_else(|| PipelineError::Queue(format!("unknown partition {}", partition)))
    }

    /// Commits observed for a group on one partition
    pub async fn commit_history(&self, group: &str, partition: PartitionId) -> Vec<Offset> {
        self.commit_log
            .read()
            .await
            .iter()
            .filter(|commit| commit.group == group && commit.partition == partition)
            .map(|commit| commit.offset)
            .collect()
    }
}

#[async_trait]
impl PartitionedQueue for InMemoryQueue {
    fn partition_count(&self) -> u32 {
        self.partitions.len() as u32
    }

    async fn publish(&self, key: &str, payload: Vec<u8>) -> Result<QueuePosition, PipelineError> {
        let partition = self.partition_for(key);
        let log = self.log(partition)?;

        let mut records = log.records.write().await;
        let offset = records.len() as Offset;
        records.push(QueueRecord { partition, offset, key: key.to_string(), payload, enqueued_at: Utc::now() });
        log.end.send_modify(|end| *end = offset + 1);
        drop(records);

        event!(Level::TRACE, event = queue::RECORD_PUBLISHED, partition = %partition, offset = offset, key = %key);
        Ok(QueuePosition { partition, offset })
    }

    async fn fetch(&self, partition: PartitionId, from: Offset, max: usize) -> Result<Vec<QueueRecord>, PipelineError> {
        let records = self.log(partition)?.records.read().await;
        Ok(records.iter().skip(from as usize).take(max).cloned().collect())
    }

    async fn end_offset(&self, partition: PartitionId) -> Result<Offset, PipelineError> {
        Ok(*self.log(partition)?.end.borrow())
    }

    async fn wait_for_records(
        &self,
        partition: PartitionId,
        from: Offset,
        timeout: Duration
    ) -> Result<bool, PipelineError> {
        let mut end = self.log(partition)?.end.subscribe();
        match tokio::time::timeout(timeout, end.wait_for(|end| *end > from)).await {
            Ok(Ok(_)) => Ok(true),
            Ok(Err(_)) | Err(_) => Ok(false)
        }
    }

    async fn commit(&self, group: &str, partition: PartitionId, offset: Offset) -> Result<(), PipelineError> {
        self.log(partition)?;
        let mut commits = self.commits.write().await;
        let current = commits.entry((group.to_string(), partition)).or_insert(0);
        if offset <= *current {
            return Ok(());
        }
        *current = offset;
        drop(commits);

        self.commit_log.write().await.push(CommitRecord { group: group.to_string(), partition, offset });
        event!(Level::DEBUG, event = queue::OFFSET_COMMITTED, group = %group, partition = %partition, offset = offset);
        Ok(())
    }

    async fn committed(&self, group: &str, partition: PartitionId) -> Result<Offset, PipelineError> {
        self.log(partition)?;
        Ok(self.commits.read().await.get(&(group.to_string(), partition)).copied().unwrap_or(0))
    }

    async fn seek(&self, group: &str, partition: PartitionId, offset: Offset) -> Result<(), PipelineError> {
        self.log(partition)?;
        self.commits.write().await.insert((group.to_string(), partition), offset);
        event!(Level::INFO, event = queue::OFFSET_SEEK, group = %group, partition = %partition, offset = offset);
        Ok(())
    }
}

/// Factory for creating queues based on configuration
pub struct QueueFactory;

impl QueueFactory {
    pub fn create(
        backend: QueueBackend,
        partition_count: u32,
        path: Option<&Path>
    ) -> Result<Arc<dyn PartitionedQueue>, PipelineError> {
        let queue: Arc<dyn PartitionedQueue> = match backend {
            QueueBackend::InMemory => Arc::new(InMemoryQueue::new(partition_count)),
            QueueBackend::RocksDb => {
                let path = path.ok_or_else(|| {
                    PipelineError::Configuration("queue.path is required for the rocksdb backend".to_string())
                })?;
                Arc::new(RocksDbQueue::open(path, partition_count)?)
            }
        };

        event!(Level::INFO, event = queue::QUEUE_OPENED, backend = backend.as_str(), partitions = partition_count);
        Ok(queue)
    }
}
