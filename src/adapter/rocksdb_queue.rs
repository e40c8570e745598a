//! RocksDB partition log
//!
//! Key layout:
//! - `r:{partition:05}:{offset:020}` → JSON encoded [`QueueRecord`]
//! - `c:{group length}:{group}:{partition:05}` → committed offset, big-endian u64
//! - `m:partitions` → partition count fixed at creation

use std::{path::Path, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use rocksdb::{DB, Direction, IteratorMode, Options};
use tokio::sync::{Mutex, watch};
use tracing::{Level, event};

use crate::{
    domain::{
        constant::queue,
        error::PipelineError,
        record::{Offset, PartitionId, QueuePosition, QueueRecord}
    },
    port::queue::PartitionedQueue
};

const META_PARTITIONS: &str = "m:partitions";

fn record_key(partition: PartitionId, offset: Offset) -> String {
    format!("r:{:05}:{:020}", partition.0, offset)
}

fn record_prefix(partition: PartitionId) -> String {
    format!("r:{:05}:", partition.0)
}

fn commit_key(group: &str, partition: PartitionId) -> String {
    format!("c:{}:{}:{:05}", group.len(), group, partition.0)
}

fn decode_offset(bytes: &[u8]) -> Result<Offset, PipelineError> {
    let raw: [u8; 8] =
        bytes.try_into().map_err(|_| PipelineError::Queue(format!("corrupt offset value ({} bytes)", bytes.len())))?;
    Ok(Offset::from_be_bytes(raw))
}

struct PartitionTail {
    /// Serializes publishers of one partition
    next: Mutex<Offset>,
    end:  watch::Sender<Offset>
}

/// Durable queue on a local RocksDB instance
pub struct RocksDbQueue {
    db:    Arc<DB>,
    tails: Vec<PartitionTail>
}

impl RocksDbQueue {
    pub fn open<P: AsRef<Path>>(path: P, partition_count: u32) -> Result<Self, PipelineError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);

        let db = DB::open(&opts, path).map_err(|e| PipelineError::Queue(format!("Failed to open RocksDB: {}", e)))?;

        match db.get(META_PARTITIONS)? {
            Some(stored) => {
                let stored = decode_offset(&stored)? as u32;
                if stored != partition_count {
                    return Err(PipelineError::Configuration(format!(
                        "queue was created with {} partitions, configured with {}",
                        stored, partition_count
                    )));
                }
            }
            None => db.put(META_PARTITIONS, u64::from(partition_count).to_be_bytes())?
        }

        let mut tails = Vec::with_capacity(partition_count as usize);
        for partition in PartitionId::all(partition_count) {
            let next = Self::recover_next_offset(&db, partition)?;
            let (end, _) = watch::channel(next);
            tails.push(PartitionTail { next: Mutex::new(next), end });
        }

        Ok(Self { db: Arc::new(db), tails })
    }

    /// Last stored offset + 1, found by seeking backwards from the end of the partition range
    fn recover_next_offset(db: &DB, partition: PartitionId) -> Result<Offset, PipelineError> {
        let prefix = record_prefix(partition);
        let upper = format!("{}~", prefix);
        let mut iter = db.iterator(IteratorMode::From(upper.as_bytes(), Direction::Reverse));

        match iter.next() {
            Some(item) => {
                let (key, _) = item?;
                let key = String::from_utf8_lossy(&key);
                match key.strip_prefix(&prefix) {
                    Some(offset) => offset
                        .parse::<Offset>()
                        .map(|offset| offset + 1)
                        .map_err(|e| PipelineError::Queue(format!("corrupt record key {}: {}", key, e))),
                    None => Ok(0)
                }
            }
            None => Ok(0)
        }
    }

    fn tail(&self, partition: PartitionId) -> Result<&PartitionTail, PipelineError> {
        self.tails
            .get(partition.0 as usize)
            .ok_or_else(|| PipelineError::Queue(format!("unknown partition {}", partition)))
    }

    async fn write_offset(&self, key: String, offset: Offset) -> Result<(), PipelineError> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || -> Result<(), PipelineError> {
            db.put(key.as_bytes(), offset.to_be_bytes())?;
            Ok(())
        })
        .await
        .map_err(|e| PipelineError::Queue(format!("Failed to write offset: {}", e)))?
    }
}

#[async_trait]
impl PartitionedQueue for RocksDbQueue {
    fn partition_count(&self) -> u32 {
        self.tails.len() as u32
    }

    async fn publish(&self, key: &str, payload: Vec<u8>) -> Result<QueuePosition, PipelineError> {
        let partition = self.partition_for(key);
        let tail = self.tail(partition)?;

        let mut next = tail.next.lock().await;
        let offset = *next;
        let record = QueueRecord { partition, offset, key: key.to_string(), payload, enqueued_at: Utc::now() };
        let value = serde_json::to_vec(&record)?;

        let db = self.db.clone();
        tokio::task::spawn_blocking(move || -> Result<(), PipelineError> {
            db.put(record_key(partition, offset).as_bytes(), value)?;
            Ok(())
        })
        .await
        .map_err(|e| PipelineError::Queue(format!("Failed to publish record: {}", e)))??;

        *next = offset + 1;
        tail.end.send_modify(|end| *end = offset + 1);
        drop(next);

        event!(Level::TRACE, event = queue::RECORD_PUBLISHED, partition = %partition, offset = offset, key = %key);
        Ok(QueuePosition { partition, offset })
    }

    async fn fetch(&self, partition: PartitionId, from: Offset, max: usize) -> Result<Vec<QueueRecord>, PipelineError> {
        self.tail(partition)?;
        let db = self.db.clone();

        tokio::task::spawn_blocking(move || -> Result<Vec<QueueRecord>, PipelineError> {
            let prefix = record_prefix(partition);
            let start = record_key(partition, from);
            let mut records = Vec::new();

            for item in db.iterator(IteratorMode::From(start.as_bytes(), Direction::Forward)) {
                let (key, value) = item?;
                if !key.starts_with(prefix.as_bytes()) || records.len() >= max {
                    break;
                }
                records.push(serde_json::from_slice::<QueueRecord>(&value)?);
            }

            Ok(records)
        })
        .await
        .map_err(|e| PipelineError::Queue(format!("Failed to fetch records: {}", e)))?
    }

    async fn end_offset(&self, partition: PartitionId) -> Result<Offset, PipelineError> {
        Ok(*self.tail(partition)?.end.borrow())
    }

    async fn wait_for_records(
        &self,
        partition: PartitionId,
        from: Offset,
        timeout: Duration
    ) -> Result<bool, PipelineError> {
        let mut end = self.tail(partition)?.end.subscribe();
        match tokio::time::timeout(timeout, end.wait_for(|end| *end > from)).await {
            Ok(Ok(_)) => Ok(true),
            Ok(Err(_)) | Err(_) => Ok(false)
        }
    }

    async fn commit(&self, group: &str, partition: PartitionId, offset: Offset) -> Result<(), PipelineError> {
        if offset <= self.committed(group, partition).await? {
            return Ok(());
        }
        self.write_offset(commit_key(group, partition), offset).await?;
        event!(Level::DEBUG, event = queue::OFFSET_COMMITTED, group = %group, partition = %partition, offset = offset);
        Ok(())
    }

    async fn committed(&self, group: &str, partition: PartitionId) -> Result<Offset, PipelineError> {
        self.tail(partition)?;
        let db = self.db.clone();
        let key = commit_key(group, partition);

        tokio::task::spawn_blocking(move || -> Result<Offset, PipelineError> {
            match db.get(key.as_bytes())? {
                Some(bytes) => decode_offset(&bytes),
                None => Ok(0)
            }
        })
        .await
        .map_err(|e| PipelineError::Queue(format!("Failed to read offset: {}", e)))?
    }

    async fn seek(&self, group: &str, partition: PartitionId, offset: Offset) -> Result<(), PipelineError> {
        self.tail(partition)?;
        self.write_offset(commit_key(group, partition), offset).await?;
        event!(Level::INFO, event = queue::OFFSET_SEEK, group = %group, partition = %partition, offset = offset);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[tokio::test]
    async fn test_records_and_offsets_survive_reopen() {
        let dir = TempDir::new().unwrap();

        let partition = {
            let queue = RocksDbQueue::open(dir.path(), 3).unwrap();
            let first = queue.publish("acme/device/d1", b"one".to_vec()).await.unwrap();
            queue.publish("acme/device/d1", b"two".to_vec()).await.unwrap();
            queue.commit("g", first.partition, 1).await.unwrap();
            first.partition
        };

        let queue = RocksDbQueue::open(dir.path(), 3).unwrap();
        assert_eq!(queue.end_offset(partition).await.unwrap(), 2);
        assert_eq!(queue.committed("g", partition).await.unwrap(), 1);

        let third = queue.publish("acme/device/d1", b"three".to_vec()).await.unwrap();
        assert_eq!(third.offset, 2);

        let records = queue.fetch(partition, 1, 10).await.unwrap();
        let payloads: Vec<&[u8]> = records.iter().map(|record| record.payload.as_slice()).collect();
        assert_eq!(payloads, vec![b"two".as_slice(), b"three".as_slice()]);
    }

    #[tokio::test]
    async fn test_groups_with_separators_commit_independently() {
        let dir = TempDir::new().unwrap();
        let queue = RocksDbQueue::open(dir.path(), 2).unwrap();
        queue.commit("a:00001", PartitionId(0), 7).await.unwrap();
        queue.commit("a", PartitionId(1), 3).await.unwrap();

        assert_eq!(queue.committed("a:00001", PartitionId(0)).await.unwrap(), 7);
        assert_eq!(queue.committed("a", PartitionId(1)).await.unwrap(), 3);
        assert_eq!(queue.committed("a", PartitionId(0)).await.unwrap(), 0);
        assert_ne!(commit_key("a:00001", PartitionId(0)), commit_key("a", PartitionId(1)));
    }

    #[tokio::test]
    async fn test_partition_count_is_fixed() {
        let dir = TempDir::new().unwrap();
        drop(RocksDbQueue::open(dir.path(), 4).unwrap());
        assert!(matches!(RocksDbQueue::open(dir.path(), 8), Err(PipelineError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_fetch_stops_at_partition_boundary() {
        let dir = TempDir::new().unwrap();
        let queue = RocksDbQueue::open(dir.path(), 2).unwrap();
        for i in 0..20 {
            queue.publish(&format!("acme/device/d{}", i), vec![i as u8]).await.unwrap();
        }

        let total: usize = {
            let mut total = 0;
            for partition in PartitionId::all(2) {
                let records = queue.fetch(partition, 0, 100).await.unwrap();
                assert!(records.iter().all(|record| record.partition == partition));
                total += records.len();
            }
            total
        };
        assert_eq!(total, 20);
    }
}
