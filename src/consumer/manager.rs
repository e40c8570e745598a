//! ConsumerManager Actor - runs the partition consumers of a node
//!
//! - Starts a consumer task per partition lease handed over by ownership
//! - Revokes partitions, fencing those that do not drain within the grace period
//! - Reports stopped consumers back to the ownership service
//! - Drains every partition on node shutdown

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc
};

use ractor::{Actor, ActorProcessingErr, ActorRef, Message, RpcReplyPort};
use tokio::{task::JoinHandle, time::Instant};
use tracing::{Level, event};

use crate::{
    consumer::partition::{PartitionDeps, PartitionExit, PartitionWorker},
    domain::{assignment::Epoch, constant::consumer, record::PartitionId},
    ownership::{lease::PartitionLease, service::OwnershipMessage}
};

#[derive(Debug)]
pub enum ConsumerMessage {
    /// Begin consuming the lease's partition
    Start { lease: PartitionLease },
    /// Stop consuming after the current messages; fence after the grace period
    Revoke { partition: PartitionId },
    /// A consumer task finished
    Exited { partition: PartitionId, epoch: Epoch, exit: PartitionExit },
    /// Abort all work immediately (lost contact with the assignment store)
    FenceAll,
    /// Revoke everything and wait for the consumers; replies with the number drained
    Drain { reply: RpcReplyPort<usize> },
    Running { reply: RpcReplyPort<BTreeSet<PartitionId>> },
    AttachOwnership { ownership: ActorRef<OwnershipMessage> }
}

impl Message for ConsumerMessage {}

struct Worker {
    lease:  PartitionLease,
    handle: JoinHandle<()>
}

/// ConsumerManager Actor State - one worker per consumed partition
pub struct ConsumerManagerState {
    deps:      Arc<PartitionDeps>,
    workers:   BTreeMap<PartitionId, Worker>,
    ownership: Option<ActorRef<OwnershipMessage>>
}

pub struct ConsumerManager;

#[async_trait::async_trait]
impl Actor for ConsumerManager {
    type Arguments = Arc<PartitionDeps>;
    type Msg = ConsumerMessage;
    type State = ConsumerManagerState;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        deps: Self::Arguments
    ) -> Result<Self::State, ActorProcessingErr> {
        event!(Level::DEBUG, event = consumer::MANAGER_STARTED, group = %deps.settings.group);
        Ok(ConsumerManagerState { deps, workers: BTreeMap::new(), ownership: None })
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State
    ) -> Result<(), ActorProcessingErr> {
        match message {
            ConsumerMessage::Start { lease } => self.handle_start(myself, lease, state),
            ConsumerMessage::Revoke { partition } => self.handle_revoke(partition, state),
            ConsumerMessage::Exited { partition, epoch, exit } => self.handle_exited(partition, epoch, exit, state),
            ConsumerMessage::FenceAll => {
                for worker in state.workers.values() {
                    worker.lease.fence();
                }
            }
            ConsumerMessage::Drain { reply } => {
                let drained = self.handle_drain(state).await;
                if let Err(e) = reply.send(drained) {
                    event!(Level::ERROR, event = consumer::PARTITION_STOPPED, error = %e);
                }
            }
            ConsumerMessage::Running { reply } => {
                if let Err(e) = reply.send(state.workers.keys().copied().collect()) {
                    event!(Level::ERROR, event = consumer::PARTITION_STOPPED, error = %e);
                }
            }
            ConsumerMessage::AttachOwnership { ownership } => state.ownership = Some(ownership)
        }
        Ok(())
    }

    async fn post_stop(&self, _myself: ActorRef<Self::Msg>, state: &mut Self::State) -> Result<(), ActorProcessingErr> {
        for worker in state.workers.values() {
            worker.lease.fence();
        }
        Ok(())
    }
}

impl ConsumerManager {
    fn handle_start(&self, myself: ActorRef<ConsumerMessage>, lease: PartitionLease, state: &mut ConsumerManagerState) {
        let partition = lease.partition();
        let epoch = lease.epoch();
        if let Some(previous) = state.workers.remove(&partition) {
            event!(Level::WARN, event = consumer::PARTITION_STARTED, partition = %partition,
                   previous_epoch = %previous.lease.epoch(), epoch = %epoch);
            previous.lease.fence();
        }

        let worker = PartitionWorker::new(state.deps.clone(), partition);
        let handle = tokio::spawn({
            let lease = lease.clone();
            async move {
                let exit = worker.run(lease).await;
                // The manager may be gone during shutdown.
                let _ = myself.cast(ConsumerMessage::Exited { partition, epoch, exit });
            }
        });
        state.workers.insert(partition, Worker { lease, handle });
    }

    fn handle_revoke(&self, partition: PartitionId, state: &ConsumerManagerState) {
        let Some(worker) = state.workers.get(&partition) else {
            return;
        };
        event!(Level::INFO, event = consumer::PARTITION_DRAINING, partition = %partition, epoch = %worker.lease.epoch());
        worker.lease.revoke();

        let lease = worker.lease.clone();
        let grace = state.deps.settings.shutdown_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if !lease.is_fenced() {
                lease.fence();
            }
        });
    }

    fn handle_exited(&self, partition: PartitionId, epoch: Epoch, exit: PartitionExit, state: &mut ConsumerManagerState) {
        if state.workers.get(&partition).is_some_and(|worker| worker.lease.epoch() == epoch) {
            state.workers.remove(&partition);
        } else {
            return;
        }

        event!(Level::INFO, event = consumer::PARTITION_STOPPED, partition = %partition, epoch = %epoch,
               exit = ?exit);
        if let Some(ownership) = &state.ownership
            && let Err(e) = ownership.cast(OwnershipMessage::PartitionStopped { partition })
        {
            event!(Level::WARN, event = consumer::PARTITION_STOPPED, partition = %partition, error = ?e);
        }
    }

    async fn handle_drain(&self, state: &mut ConsumerManagerState) -> usize {
        let workers = std::mem::take(&mut state.workers);
        for worker in workers.values() {
            worker.lease.revoke();
        }

        let deadline = Instant::now() + state.deps.settings.shutdown_grace;
        let drained = workers.len();
        for (partition, mut worker) in workers {
            if tokio::time::timeout_at(deadline, &mut worker.handle).await.is_err() {
                event!(Level::WARN, event = consumer::DRAIN_TIMED_OUT, partition = %partition);
                worker.lease.fence();
                let _ = worker.handle.await;
            }
        }
        drained
    }
}
