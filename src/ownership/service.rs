//! OwnershipService Actor - keeps local consumption in line with the assignment table
//!
//! On every tick the service heartbeats, reads the table, lets the leader
//! propose a new assignment when membership changed, and reconciles what this
//! node consumes with what it owns. A node that cannot reach the store for
//! longer than its lease fences all of its partitions.

use std::{collections::BTreeSet, sync::Arc, time::Duration};

use ractor::{Actor, ActorProcessingErr, ActorRef, Message, RpcReplyPort};
use tokio::task::JoinHandle;
use tracing::{Level, event};

use crate::{
    consumer::ConsumerMessage,
    domain::{
        assignment::{AssignmentSnapshot, Epoch, NodeId},
        constant::ownership,
        record::PartitionId
    },
    ownership::{
        coordinator,
        lease::{NodeLease, PartitionLease},
        strategy::AssignmentStrategy,
        tracker::{OwnershipCommand, PartitionTracker}
    },
    port::{
        assignment::AssignmentStore,
        membership::{MemberStatus, MembershipEvent, MembershipFeed}
    }
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnershipSettings {
    pub node:               NodeId,
    pub strategy:           AssignmentStrategy,
    pub partition_count:    u32,
    pub heartbeat_interval: Duration,
    /// Store unreachable for longer than this: fence everything
    pub lease_timeout:      Duration,
    /// Peers silent for longer than this are considered dead
    pub node_timeout:       Duration
}

#[derive(Debug)]
pub enum OwnershipMessage {
    Tick,
    Membership(MembershipEvent),
    /// The consumer of a partition exited
    PartitionStopped { partition: PartitionId },
    /// Partitions this node is currently consuming
    Owned { reply: RpcReplyPort<BTreeSet<PartitionId>> }
}

impl Message for OwnershipMessage {}

pub struct OwnershipArguments {
    pub settings:   OwnershipSettings,
    pub store:      Arc<dyn AssignmentStore>,
    pub membership: Arc<dyn MembershipFeed>,
    pub consumers:  ActorRef<ConsumerMessage>
}

/// OwnershipService Actor State
pub struct OwnershipState {
    settings:   OwnershipSettings,
    store:      Arc<dyn AssignmentStore>,
    membership: Arc<dyn MembershipFeed>,
    consumers:  ActorRef<ConsumerMessage>,
    tracker:    PartitionTracker,
    node_lease: NodeLease,
    members:    BTreeSet<NodeId>,
    epoch:      Option<Epoch>,
    fenced:     bool,
    ticker:     Option<JoinHandle<()>>,
    forwarder:  Option<JoinHandle<()>>
}

pub struct OwnershipService;

#[async_trait::async_trait]
impl Actor for OwnershipService {
    type Arguments = OwnershipArguments;
    type Msg = OwnershipMessage;
    type State = OwnershipState;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments
    ) -> Result<Self::State, ActorProcessingErr> {
        let settings = args.settings;
        event!(Level::INFO, event = ownership::SERVICE_STARTED, node = %settings.node,
               strategy = settings.strategy.as_str(), partitions = settings.partition_count);

        let members = args.membership.members().await?;
        let mut events = args.membership.subscribe().await?;
        let forwarder = tokio::spawn({
            let myself = myself.clone();
            async move {
                while let Some(change) = events.recv().await {
                    if myself.cast(OwnershipMessage::Membership(change)).is_err() {
                        break;
                    }
                }
            }
        });
        let ticker = myself.send_interval(settings.heartbeat_interval, || OwnershipMessage::Tick);
        myself.cast(OwnershipMessage::Tick)?;

        Ok(OwnershipState {
            tracker: PartitionTracker::new(settings.node.clone()),
            node_lease: NodeLease::new(settings.lease_timeout),
            settings,
            store: args.store,
            membership: args.membership,
            consumers: args.consumers,
            members,
            epoch: None,
            fenced: false,
            ticker: Some(ticker),
            forwarder: Some(forwarder)
        })
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State
    ) -> Result<(), ActorProcessingErr> {
        match message {
            OwnershipMessage::Tick => self.tick(state).await,
            OwnershipMessage::Membership(change) => {
                event!(Level::INFO, event = ownership::MEMBERSHIP_CHANGED, node = %change.node_id,
                       status = ?change.status);
                match change.status {
                    MemberStatus::Joined => state.members.insert(change.node_id),
                    MemberStatus::Left | MemberStatus::Dead => state.members.remove(&change.node_id)
                };
                myself.cast(OwnershipMessage::Tick)?;
            }
            OwnershipMessage::PartitionStopped { partition } => {
                state.tracker.stopped(partition);
                myself.cast(OwnershipMessage::Tick)?;
            }
            OwnershipMessage::Owned { reply } => {
                if let Err(e) = reply.send(state.tracker.running()) {
                    event!(Level::ERROR, event = ownership::EPOCH_OBSERVED, error = %e);
                }
            }
        }
        Ok(())
    }

    async fn post_stop(&self, _myself: ActorRef<Self::Msg>, state: &mut Self::State) -> Result<(), ActorProcessingErr> {
        if let Some(ticker) = state.ticker.take() {
            ticker.abort();
        }
        if let Some(forwarder) = state.forwarder.take() {
            forwarder.abort();
        }
        event!(Level::INFO, event = ownership::SERVICE_STOPPED, node = %state.settings.node,
               running = state.tracker.running().len());
        Ok(())
    }
}

impl OwnershipService {
    async fn tick(&self, state: &mut OwnershipState) {
        let node = state.settings.node.clone();

        if let Err(e) = state.store.heartbeat(&node).await {
            event!(Level::WARN, event = ownership::HEARTBEAT_FAILED, node = %node, error = %e);
            if state.node_lease.expired() && !state.fenced {
                self.fence_all(state);
            }
            return;
        }
        state.node_lease.renew();
        state.fenced = false;

        let Ok(mut snapshot) = state.store.snapshot(&node).await else {
            return;
        };

        if let Ok(members) = state.membership.members().await {
            state.members = members;
        }
        if let Some(proposed) = self.coordinate(state, &snapshot).await {
            snapshot = proposed;
        }

        if state.epoch != Some(snapshot.epoch) {
            event!(Level::INFO, event = ownership::EPOCH_OBSERVED, node = %node, epoch = %snapshot.epoch,
                   owned = snapshot.active_partitions(&node).len(), handoffs = snapshot.handoffs.len());
            state.epoch = Some(snapshot.epoch);
        }

        for command in state.tracker.reconcile(&snapshot) {
            self.apply(state, command).await;
        }
    }

    /// Leader only: propose the assignment for the current live nodes
    async fn coordinate(&self, state: &OwnershipState, snapshot: &AssignmentSnapshot) -> Option<AssignmentSnapshot> {
        let node = &state.settings.node;
        let ages = state.store.heartbeat_ages(node).await.ok()?;
        let live = coordinator::live_nodes(&state.members, &ages, state.settings.node_timeout);
        if coordinator::leader(&live) != Some(node) {
            return None;
        }

        let proposal = coordinator::plan(snapshot, &live, state.settings.strategy, state.settings.partition_count)?;
        for dead in &proposal.dead {
            event!(Level::WARN, event = ownership::NODE_DECLARED_DEAD, node = %dead, leader = %node);
        }

        let expected = proposal.expected_epoch;
        match state.store.propose(node, proposal).await {
            Ok(applied) => {
                event!(Level::INFO, event = ownership::ASSIGNMENT_PROPOSED, leader = %node, epoch = %applied.epoch,
                       live = live.len());
                Some(applied)
            }
            Err(e) => {
                event!(Level::WARN, event = ownership::ASSIGNMENT_REJECTED, leader = %node, expected = %expected,
                       error = %e);
                None
            }
        }
    }

    async fn apply(&self, state: &OwnershipState, command: OwnershipCommand) {
        let node = &state.settings.node;
        match command {
            OwnershipCommand::Start(token) => {
                event!(Level::INFO, event = ownership::PARTITION_GAINED, node = %node, token = %token);
                let lease = PartitionLease::new(token);
                if let Err(e) = state.consumers.cast(ConsumerMessage::Start { lease }) {
                    event!(Level::ERROR, event = ownership::PARTITION_GAINED, node = %node, error = ?e);
                }
            }
            OwnershipCommand::Stop(partition) => {
                event!(Level::INFO, event = ownership::PARTITION_REVOKED, node = %node, partition = %partition);
                if let Err(e) = state.consumers.cast(ConsumerMessage::Revoke { partition }) {
                    event!(Level::ERROR, event = ownership::PARTITION_REVOKED, node = %node, error = ?e);
                }
            }
            OwnershipCommand::Release(partition) => match state.store.release(node, partition).await {
                Ok(_) => {
                    event!(Level::INFO, event = ownership::PARTITION_RELEASED, node = %node, partition = %partition)
                }
                Err(e) => {
                    event!(Level::WARN, event = ownership::PARTITION_RELEASED, node = %node, partition = %partition,
                           error = %e)
                }
            }
        }
    }

    fn fence_all(&self, state: &mut OwnershipState) {
        let fenced = state.tracker.fence_all();
        event!(Level::ERROR, event = ownership::SELF_FENCED, node = %state.settings.node, partitions = fenced.len());
        state.fenced = true;
        if let Err(e) = state.consumers.cast(ConsumerMessage::FenceAll) {
            event!(Level::ERROR, event = ownership::SELF_FENCED, error = ?e);
        }
    }
}
