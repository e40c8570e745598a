//! Explicit actor system handle
//!
//! Created at node startup, passed to whoever needs to route contexts and torn
//! down at shutdown. There is no global registry: actors are unnamed and
//! reachable only through this handle.

use std::{sync::Arc, time::Duration};

use ractor::{
    Actor, ActorRef,
    rpc::{CallResult, call}
};
use tracing::{Level, event};

use crate::{
    actor::{
        message::{RootMessage, SystemHealth},
        root::RootActor,
        stats::PipelineStats
    },
    context::{ProcessingContext, RetryPolicy},
    domain::{constant::root, error::PipelineError},
    port::Collaborators
};

const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Actor tuning shared by the whole hierarchy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActorSettings {
    pub retry:              RetryPolicy,
    pub processing_timeout: Duration,
    pub idle_timeout:       Duration,
    pub sweep_interval:     Duration
}

/// Everything an actor needs besides its own state
pub struct ActorRuntime {
    pub settings:      ActorSettings,
    pub collaborators: Collaborators,
    pub stats:         Arc<PipelineStats>
}

#[derive(Clone)]
pub struct ActorSystem {
    root:  ActorRef<RootMessage>,
    stats: Arc<PipelineStats>
}

impl ActorSystem {
    pub async fn start(settings: ActorSettings, collaborators: Collaborators) -> Result<Self, PipelineError> {
        let stats = Arc::new(PipelineStats::default());
        let runtime = Arc::new(ActorRuntime { settings, collaborators, stats: stats.clone() });
        let (root, _handle) = Actor::spawn(None, RootActor, runtime).await?;
        Ok(Self { root, stats })
    }

    /// Hand a context to the hierarchy. On failure the context is dropped and reports abandoned.
    pub fn route(&self, context: ProcessingContext) -> Result<(), PipelineError> {
        self.root
            .cast(RootMessage::Route { context: Box::new(context) })
            .map_err(|e| PipelineError::Unreachable(format!("root actor unavailable: {:?}", e)))
    }

    pub async fn health(&self) -> Result<SystemHealth, PipelineError> {
        match call(&self.root, |reply| RootMessage::Health { reply }, Some(HEALTH_TIMEOUT)).await {
            Ok(CallResult::Success(health)) => Ok(health),
            Ok(CallResult::Timeout) => Err(PipelineError::Timeout("health check timed out".to_string())),
            Ok(CallResult::SenderError) => Err(PipelineError::Unreachable("health check dropped".to_string())),
            Err(e) => Err(PipelineError::Unreachable(format!("root actor unavailable: {:?}", e)))
        }
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    /// Stop the hierarchy, killing it after `grace`. Queued contexts are dropped and report abandoned.
    pub async fn shutdown(&self, grace: Duration) {
        if let Err(e) = self.root.stop_and_wait(Some("shutdown".to_string()), Some(grace)).await {
            event!(Level::WARN, event = root::ROOT_STOPPED, error = ?e);
            self.root.kill();
        }
    }
}
