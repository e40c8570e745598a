//! Processing node runtime
//!
//! Wires the actor system, the partition consumers and the ownership service
//! of one node together. Several nodes can run in one process against shared
//! queue, assignment store and membership feed.

use std::{collections::BTreeSet, sync::Arc, time::Duration};

use ractor::{
    Actor, ActorRef,
    rpc::{CallResult, call}
};
use tokio::task::JoinHandle;
use tracing::{Level, event};

use crate::{
    actor::{ActorSettings, ActorSystem, SystemHealth},
    consumer::{ConsumerManager, ConsumerMessage, ConsumerSettings, PartitionDeps},
    domain::{
        assignment::NodeId,
        constant::node,
        entity::EntityKey,
        error::PipelineError,
        message::MessageType,
        record::PartitionId
    },
    engine::ChainRegistry,
    ownership::{AssignmentStrategy, OwnershipArguments, OwnershipMessage, OwnershipService, OwnershipSettings},
    port::{
        Collaborators,
        assignment::AssignmentStore,
        dead_letter::DeadLetterSink,
        membership::{MemberStatus, MembershipEvent, MembershipFeed},
        queue::PartitionedQueue
    }
};

pub mod submit;

#[cfg(test)]
mod tests;

pub use submit::{DEFAULT_MAX_PAYLOAD_BYTES, SubmitResult, Submitter};

const QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-node settings, usually built from `PipelineConfig`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSettings {
    pub node_id:            NodeId,
    pub max_payload_bytes:  usize,
    pub strategy:           AssignmentStrategy,
    pub heartbeat_interval: Duration,
    pub lease_timeout:      Duration,
    pub node_timeout:       Duration,
    pub consumer:           ConsumerSettings,
    pub actors:             ActorSettings
}

/// Collaborators a node runs against
#[derive(Clone)]
pub struct NodeDeps {
    pub queue:         Arc<dyn PartitionedQueue>,
    pub assignments:   Arc<dyn AssignmentStore>,
    pub membership:    Arc<dyn MembershipFeed>,
    pub dead_letters:  Arc<dyn DeadLetterSink>,
    pub collaborators: Collaborators,
    pub registry:      Arc<ChainRegistry>
}

pub struct PipelineNode {
    settings:         NodeSettings,
    membership:       Arc<dyn MembershipFeed>,
    submitter:        Submitter,
    actors:           ActorSystem,
    consumers:        ActorRef<ConsumerMessage>,
    consumers_handle: JoinHandle<()>,
    ownership:        ActorRef<OwnershipMessage>,
    ownership_handle: JoinHandle<()>
}

impl PipelineNode {
    /// Start the node: actor system, consumers, then join the cluster and take part in assignment
    pub async fn start(settings: NodeSettings, deps: NodeDeps) -> Result<Self, PipelineError> {
        let node_id = settings.node_id.clone();
        event!(Level::INFO, event = node::NODE_STARTING, node = %node_id,
               partitions = deps.queue.partition_count(), group = %settings.consumer.group);

        let actors = ActorSystem::start(settings.actors, deps.collaborators.clone()).await?;
        let partition_deps = Arc::new(PartitionDeps {
            settings:     settings.consumer.clone(),
            queue:        deps.queue.clone(),
            registry:     deps.registry.clone(),
            actors:       actors.clone(),
            dead_letters: deps.dead_letters.clone(),
            assignments:  deps.assignments.clone()
        });
        let (consumers, consumers_handle) = Actor::spawn(None, ConsumerManager, partition_deps).await?;

        deps.membership.announce(MembershipEvent::new(node_id.clone(), MemberStatus::Joined)).await?;
        let ownership_args = OwnershipArguments {
            settings:   OwnershipSettings {
                node:               node_id.clone(),
                strategy:           settings.strategy,
                partition_count:    deps.queue.partition_count(),
                heartbeat_interval: settings.heartbeat_interval,
                lease_timeout:      settings.lease_timeout,
                node_timeout:       settings.node_timeout
            },
            store:      deps.assignments.clone(),
            membership: deps.membership.clone(),
            consumers:  consumers.clone()
        };
        let (ownership, ownership_handle) = Actor::spawn(None, OwnershipService, ownership_args).await?;
        consumers
            .cast(ConsumerMessage::AttachOwnership { ownership: ownership.clone() })
            .map_err(|e| PipelineError::Unreachable(format!("consumer manager unavailable: {:?}", e)))?;

        event!(Level::INFO, event = node::NODE_STARTED, node = %node_id);
        Ok(Self {
            submitter: Submitter::new(deps.queue.clone(), settings.max_payload_bytes),
            membership: deps.membership,
            settings,
            actors,
            consumers,
            consumers_handle,
            ownership,
            ownership_handle
        })
    }

    pub fn id(&self) -> &NodeId {
        &self.settings.node_id
    }

    pub async fn submit(
        &self,
        key: EntityKey,
        msg_type: MessageType,
        payload: serde_json::Value
    ) -> Result<SubmitResult, PipelineError> {
        self.submitter.submit(key, msg_type, payload).await
    }

    pub async fn health(&self) -> Result<SystemHealth, PipelineError> {
        self.actors.health().await
    }

    pub fn actors(&self) -> &ActorSystem {
        &self.actors
    }

    /// Partitions this node owns and consumes under the current epoch
    pub async fn owned_partitions(&self) -> Result<BTreeSet<PartitionId>, PipelineError> {
        match call(&self.ownership, |reply| OwnershipMessage::Owned { reply }, Some(QUERY_TIMEOUT)).await {
            Ok(CallResult::Success(owned)) => Ok(owned),
            Ok(CallResult::Timeout) => Err(PipelineError::Timeout("ownership query timed out".to_string())),
            Ok(CallResult::SenderError) => Err(PipelineError::Unreachable("ownership query dropped".to_string())),
            Err(e) => Err(PipelineError::Unreachable(format!("ownership service unavailable: {:?}", e)))
        }
    }

    /// Partitions with a running consumer, including those still draining
    pub async fn consuming(&self) -> Result<BTreeSet<PartitionId>, PipelineError> {
        match call(&self.consumers, |reply| ConsumerMessage::Running { reply }, Some(QUERY_TIMEOUT)).await {
            Ok(CallResult::Success(running)) => Ok(running),
            Ok(CallResult::Timeout) => Err(PipelineError::Timeout("consumer query timed out".to_string())),
            Ok(CallResult::SenderError) => Err(PipelineError::Unreachable("consumer query dropped".to_string())),
            Err(e) => Err(PipelineError::Unreachable(format!("consumer manager unavailable: {:?}", e)))
        }
    }

    /// Graceful shutdown.
    ///
    /// Ownership stops first so no partition starts again, then every consumer
    /// drains within the grace period (leftovers are fenced and redelivered by
    /// the next owner), then the node leaves the cluster.
    pub async fn shutdown(self) {
        let grace = self.settings.consumer.shutdown_grace;
        let node_id = self.settings.node_id.clone();
        event!(Level::INFO, event = node::NODE_SHUTDOWN_STARTED, node = %node_id, grace_ms = grace.as_millis() as u64);

        if let Err(e) = self.ownership.stop_and_wait(Some("shutdown".to_string()), Some(grace)).await {
            event!(Level::WARN, event = node::NODE_SHUTDOWN_STARTED, node = %node_id, error = ?e);
            self.ownership.kill();
        }
        let _ = self.ownership_handle.await;

        let drained =
            match call(&self.consumers, |reply| ConsumerMessage::Drain { reply }, Some(grace + QUERY_TIMEOUT)).await {
                Ok(CallResult::Success(drained)) => drained,
                Ok(_) => {
                    event!(Level::WARN, event = node::NODE_SHUTDOWN_STARTED, node = %node_id, drain = "incomplete");
                    0
                }
                Err(e) => {
                    event!(Level::WARN, event = node::NODE_SHUTDOWN_STARTED, node = %node_id, error = ?e);
                    0
                }
            };

        if let Err(e) = self.membership.announce(MembershipEvent::new(node_id.clone(), MemberStatus::Left)).await {
            event!(Level::WARN, event = node::NODE_SHUTDOWN_STARTED, node = %node_id, error = %e);
        }

        self.consumers.stop(Some("shutdown".to_string()));
        let _ = self.consumers_handle.await;
        self.actors.shutdown(grace).await;

        event!(Level::INFO, event = node::NODE_SHUTDOWN_COMPLETED, node = %node_id, drained = drained);
    }
}
