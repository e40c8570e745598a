//! Consumer of one owned partition
//!
//! Each round reads the partition from its committed offset, turns records
//! into processing contexts and routes them to the actor hierarchy, keeping at
//! most `in_flight_window` contexts outstanding. Settlements come back on a
//! per-round channel; the contiguous settled prefix is committed after the
//! fencing token was validated against the assignment store.
//!
//! A round ends when the lease is revoked and nothing is in flight (released),
//! when the lease is fenced, or when a context was abandoned. An abandoned
//! context restarts the partition from the committed offset in a new round;
//! contexts of the old round that did not start yet are skipped.

use std::{sync::Arc, time::Duration};

use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{Level, event};

use crate::{
    actor::ActorSystem,
    consumer::{stream::record_stream, tracker::OffsetTracker},
    context::{Completion, ProcessingContext, RecordOrigin, SettlementSender},
    domain::{
        constant::{consumer, queue},
        dead_letter::DeadLetterEntry,
        message::Message,
        outcome::Settlement,
        record::{Offset, PartitionId, QueueRecord}
    },
    engine::ChainRegistry,
    ownership::lease::PartitionLease,
    port::{assignment::AssignmentStore, dead_letter::DeadLetterSink, queue::PartitionedQueue}
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerSettings {
    pub group:            String,
    pub fetch_batch:      usize,
    pub in_flight_window: usize,
    pub poll_interval:    Duration,
    pub restart_backoff:  Duration,
    /// How long a revoked partition may drain before it is fenced
    pub shutdown_grace:   Duration
}

/// Shared collaborators of all partition consumers of a node
pub struct PartitionDeps {
    pub settings:     ConsumerSettings,
    pub queue:        Arc<dyn PartitionedQueue>,
    pub registry:     Arc<ChainRegistry>,
    pub actors:       ActorSystem,
    pub dead_letters: Arc<dyn DeadLetterSink>,
    pub assignments:  Arc<dyn AssignmentStore>
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionExit {
    /// Revoked and drained; every settled offset was committed
    Released,
    /// Ownership lost; uncommitted offsets are left to the next owner
    Fenced
}

enum RoundExit {
    Exit(PartitionExit),
    Restart(String)
}

pub struct PartitionWorker {
    deps:      Arc<PartitionDeps>,
    partition: PartitionId
}

impl PartitionWorker {
    pub fn new(deps: Arc<PartitionDeps>, partition: PartitionId) -> Self {
        Self { deps, partition }
    }

    pub async fn run(self, lease: PartitionLease) -> PartitionExit {
        let settings = &self.deps.settings;
        let mut lease = lease;
        event!(Level::INFO, event = consumer::PARTITION_STARTED, partition = %self.partition, epoch = %lease.epoch());

        loop {
            if lease.is_fenced() {
                return PartitionExit::Fenced;
            }
            if lease.is_revoked() {
                return PartitionExit::Released;
            }

            let reason = match self.deps.queue.committed(&settings.group, self.partition).await {
                Ok(committed) => match self.round(&lease, committed).await {
                    RoundExit::Exit(exit) => return exit,
                    RoundExit::Restart(reason) => reason
                },
                Err(e) => e.to_string()
            };

            event!(Level::WARN, event = consumer::PARTITION_RESTARTED, partition = %self.partition, reason = %reason);
            lease = lease.next_round();
            tokio::select! {
                _ = lease.fenced() => return PartitionExit::Fenced,
                _ = lease.revoked() => return PartitionExit::Released,
                _ = tokio::time::sleep(settings.restart_backoff) => {}
            }
        }
    }

    async fn round(&self, lease: &PartitionLease, committed: Offset) -> RoundExit {
        let settings = &self.deps.settings;
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        let mut tracker = OffsetTracker::new(committed);
        let mut records = record_stream(
            self.deps.queue.clone(),
            self.partition,
            committed,
            settings.fetch_batch,
            settings.poll_interval
        );
        let mut commit_retry = tokio::time::interval(settings.poll_interval);
        let mut draining = false;

        loop {
            let step = tokio::select! {
                biased;
                _ = lease.fenced() => Err(RoundExit::Exit(PartitionExit::Fenced)),
                Some((offset, settlement)) = done_rx.recv() => {
                    match self.settle(offset, settlement, &mut tracker).await {
                        Ok(()) => self.commit(lease, &mut tracker).await,
                        Err(exit) => Err(exit)
                    }
                }
                _ = lease.revoked(), if tracker.in_flight() == 0 => {
                    match self.commit(lease, &mut tracker).await {
                        Ok(()) => {
                            event!(Level::INFO, event = consumer::PARTITION_STOPPED, partition = %self.partition,
                                   committed = tracker.committed());
                            Err(RoundExit::Exit(PartitionExit::Released))
                        }
                        Err(exit) => Err(exit)
                    }
                }
                item = records.next(), if tracker.in_flight() < settings.in_flight_window && !lease.is_revoked() => {
                    match item {
                        Some(Ok(record)) => self.dispatch(record, lease, &done_tx, &mut tracker).await,
                        Some(Err(e)) => {
                            event!(Level::WARN, event = queue::FETCH_FAILED, partition = %self.partition, error = %e);
                            Err(RoundExit::Restart(format!("fetch failed: {}", e)))
                        }
                        None => Err(RoundExit::Restart("record stream ended".to_string()))
                    }
                }
                _ = commit_retry.tick() => {
                    if lease.is_revoked() && !draining {
                        draining = true;
                        event!(Level::DEBUG, event = consumer::PARTITION_DRAINING, partition = %self.partition,
                               in_flight = tracker.in_flight());
                    }
                    self.commit(lease, &mut tracker).await
                }
            };

            if let Err(exit) = step {
                return exit;
            }
        }
    }

    async fn dispatch(
        &self,
        record: QueueRecord,
        lease: &PartitionLease,
        done_tx: &SettlementSender,
        tracker: &mut OffsetTracker
    ) -> Result<(), RoundExit> {
        tracker.dispatched(record.offset);
        let origin =
            RecordOrigin { partition: record.partition, offset: record.offset, enqueued_at: record.enqueued_at };

        let message = match Message::decode(&record.payload) {
            Ok(message) => message,
            Err(e) => {
                let entry = DeadLetterEntry::unprocessable(
                    record.partition,
                    record.offset,
                    None,
                    serde_json::Value::String(String::from_utf8_lossy(&record.payload).into_owned()),
                    format!("undecodable record: {}", e)
                );
                return self.unprocessable(entry, tracker).await;
            }
        };

        let Some(chain) = self.deps.registry.resolve(&message.originator).await else {
            let reason = format!("no rule chain bound for {}", message.originator);
            let payload = serde_json::to_value(&message).unwrap_or(serde_json::Value::Null);
            let entry = DeadLetterEntry::unprocessable(
                record.partition,
                record.offset,
                Some(message.originator.clone()),
                payload,
                reason
            );
            return self.unprocessable(entry, tracker).await;
        };

        event!(Level::TRACE, event = consumer::RECORD_DISPATCHED, partition = %self.partition, offset = record.offset,
               entity = %message.originator, chain = %chain.id);
        let completion = Completion::new(record.offset, done_tx.clone());
        let context = ProcessingContext::new(message, origin, chain, lease.clone(), completion);
        if let Err(e) = self.deps.actors.route(context) {
            // The dropped context reports abandoned and restarts the round.
            event!(Level::ERROR, event = consumer::RECORD_DISPATCHED, partition = %self.partition,
                   offset = record.offset, error = %e);
        }
        Ok(())
    }

    /// Dead-letter a record that never reaches an entity, then let its offset commit
    async fn unprocessable(&self, entry: DeadLetterEntry, tracker: &mut OffsetTracker) -> Result<(), RoundExit> {
        let offset = entry.offset;
        event!(Level::WARN, event = consumer::RECORD_UNROUTABLE, partition = %self.partition, offset = offset,
               reason = %entry.reason);
        self.publish_dead_letter(entry).await?;
        tracker.complete(offset);
        Ok(())
    }

    async fn settle(
        &self,
        offset: Offset,
        settlement: Settlement,
        tracker: &mut OffsetTracker
    ) -> Result<(), RoundExit> {
        event!(Level::TRACE, event = consumer::CONTEXT_SETTLED, partition = %self.partition, offset = offset,
               settlement = settlement.name());
        match settlement {
            Settlement::Acked { .. } => tracker.complete(offset),
            Settlement::DeadLettered(entry) => {
                self.publish_dead_letter(*entry).await?;
                tracker.complete(offset);
            }
            Settlement::Fenced => tracker.block(offset),
            Settlement::Abandoned => return Err(RoundExit::Restart(format!("context at offset {} abandoned", offset)))
        }
        Ok(())
    }

    async fn publish_dead_letter(&self, entry: DeadLetterEntry) -> Result<(), RoundExit> {
        let offset = entry.offset;
        self.deps.dead_letters.publish(entry).await.map_err(|e| {
            event!(Level::ERROR, event = consumer::DEAD_LETTER_FAILED, partition = %self.partition, offset = offset,
                   error = %e);
            RoundExit::Restart(format!("dead-letter publish failed at offset {}: {}", offset, e))
        })
    }

    /// Commit the settled prefix if the fencing token is still current
    async fn commit(&self, lease: &PartitionLease, tracker: &mut OffsetTracker) -> Result<(), RoundExit> {
        let Some(offset) = tracker.pending_commit() else {
            return Ok(());
        };

        match self.deps.assignments.validate(lease.token()).await {
            Ok(true) => {}
            Ok(false) => {
                event!(Level::WARN, event = consumer::COMMIT_FENCED, partition = %self.partition, offset = offset,
                       token = %lease.token());
                lease.fence();
                return Err(RoundExit::Exit(PartitionExit::Fenced));
            }
            Err(e) => {
                event!(Level::DEBUG, event = consumer::COMMIT_FENCED, partition = %self.partition, offset = offset,
                       error = %e);
                return Ok(());
            }
        }

        match self.deps.queue.commit(&self.deps.settings.group, self.partition, offset).await {
            Ok(()) => tracker.mark_committed(offset),
            Err(e) => {
                event!(Level::WARN, event = consumer::COMMIT_FENCED, partition = %self.partition, offset = offset,
                       error = %e);
            }
        }
        Ok(())
    }
}
