use std::collections::BTreeSet;

use async_trait::async_trait;
use tokio::sync::{RwLock, mpsc};

use crate::{
    domain::{assignment::NodeId, error::PipelineError},
    port::membership::{MemberStatus, MembershipEvent, MembershipFeed}
};

/// Membership feed shared by the nodes of one process
#[derive(Default)]
pub struct LocalMembership {
    members:     RwLock<BTreeSet<NodeId>>,
    subscribers: RwLock<Vec<mpsc::UnboundedSender<MembershipEvent>>>
}

impl LocalMembership {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MembershipFeed for LocalMembership {
    async fn members(&self) -> Result<BTreeSet<NodeId>, PipelineError> {
        Ok(self.members.read().await.clone())
    }

    async fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<MembershipEvent>, PipelineError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.write().await.push(tx);
        Ok(rx)
    }

    async fn announce(&self, event: MembershipEvent) -> Result<(), PipelineError> {
        {
            let mut members = self.members.write().await;
            match event.status {
                MemberStatus::Joined => members.insert(event.node_id.clone()),
                MemberStatus::Left | MemberStatus::Dead => members.remove(&event.node_id)
            };
        }

        let mut subscribers = self.subscribers.write().await;
        subscribers.retain(|subscriber| subscriber.send(event.clone()).is_ok());
        Ok(())
    }
}
