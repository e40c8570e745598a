//! Lazy record streams over the partitioned queue
//!
//! A stream never ends on its own: when the log is drained it waits for new
//! records. Dropping a pending `next()` keeps the cursor, so the stream can be
//! polled from a `select!` loop.

use std::{collections::VecDeque, sync::Arc, time::Duration};

use futures::stream::{self, BoxStream, SelectAll, StreamExt};

use crate::{
    domain::{
        error::PipelineError,
        record::{Offset, PartitionId, QueueRecord}
    },
    port::queue::PartitionedQueue
};

pub type RecordStream = BoxStream<'static, Result<QueueRecord, PipelineError>>;

struct Cursor {
    queue:     Arc<dyn PartitionedQueue>,
    partition: PartitionId,
    next:      Offset,
    batch:     usize,
    poll:      Duration,
    buffer:    VecDeque<QueueRecord>
}

/// Records of `partition` in offset order, starting at `from`
pub fn record_stream(
    queue: Arc<dyn PartitionedQueue>,
    partition: PartitionId,
    from: Offset,
    batch: usize,
    poll: Duration
) -> RecordStream {
    let cursor = Cursor { queue, partition, next: from, batch: batch.max(1), poll, buffer: VecDeque::new() };

    stream::unfold(cursor, |mut cursor| async move {
        loop {
            if let Some(record) = cursor.buffer.pop_front() {
                cursor.next = record.offset + 1;
                return Some((Ok(record), cursor));
            }

            match cursor.queue.fetch(cursor.partition, cursor.next, cursor.batch).await {
                Ok(records) if !records.is_empty() => cursor.buffer.extend(records),
                Ok(_) => {
                    if let Err(e) = cursor.queue.wait_for_records(cursor.partition, cursor.next, cursor.poll).await {
                        return Some((Err(e), cursor));
                    }
                }
                Err(e) => return Some((Err(e), cursor))
            }
        }
    })
    .boxed()
}

/// Merge the streams of `partitions` for `group`, each resuming from its committed offset.
/// Order holds within a partition only.
pub async fn consume(
    queue: Arc<dyn PartitionedQueue>,
    group: &str,
    partitions: &[PartitionId],
    batch: usize,
    poll: Duration
) -> Result<SelectAll<RecordStream>, PipelineError> {
    let mut streams = Vec::with_capacity(partitions.len());
    for partition in partitions {
        let from = queue.committed(group, *partition).await?;
        streams.push(record_stream(queue.clone(), *partition, from, batch, poll));
    }
    Ok(stream::select_all(streams))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::queue::InMemoryQueue;

    #[tokio::test]
    async fn test_stream_waits_for_new_records() {
        let queue: Arc<dyn PartitionedQueue> = Arc::new(InMemoryQueue::new(1));
        let mut records = record_stream(queue.clone(), PartitionId(0), 0, 2, Duration::from_millis(10));

        for i in 0..3u8 {
            queue.publish("k", vec![i]).await.unwrap();
        }
        for expected in 0..3 {
            assert_eq!(records.next().await.unwrap().unwrap().offset, expected);
        }

        let publisher = queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            publisher.publish("k", vec![9]).await.unwrap();
        });
        let late = records.next().await.unwrap().unwrap();
        assert_eq!((late.offset, late.payload), (3, vec![9]));
    }

    #[tokio::test]
    async fn test_consume_resumes_from_committed_offsets() {
        let queue: Arc<dyn PartitionedQueue> = Arc::new(InMemoryQueue::new(2));
        let mut published = Vec::new();
        for i in 0..6u8 {
            published.push(queue.publish(&format!("device-{}", i), vec![i]).await.unwrap());
        }
        let first = published[0];
        queue.commit("g", first.partition, first.offset + 1).await.unwrap();

        let mut merged =
            consume(queue.clone(), "g", &[PartitionId(0), PartitionId(1)], 4, Duration::from_millis(10)).await.unwrap();
        let mut seen = Vec::new();
        for _ in 0..5 {
            let record = merged.next().await.unwrap().unwrap();
            seen.push(record.position());
        }

        assert!(!seen.contains(&first));
        for partition in [PartitionId(0), PartitionId(1)] {
            let offsets: Vec<Offset> = seen
                .iter()
                .filter(|position| position.partition == partition)
                .map(|position| position.offset)
                .collect();
            assert!(offsets.windows(2).all(|pair| pair[0] < pair[1]));
        }
    }
}
