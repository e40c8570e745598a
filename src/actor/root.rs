//! Root Actor - top of the per-node actor hierarchy
//!
//! - Spawns and supervises one tenant actor per tenant, lazily
//! - Routes processing contexts to their tenant
//! - Evicts tenants that reported idle and saw no new contexts since
//! - Answers health checks

use std::{collections::HashMap, sync::Arc, time::Duration};

use ractor::{
    Actor, ActorId, ActorProcessingErr, ActorRef, RpcReplyPort, SpawnErr, SupervisionEvent,
    rpc::{CallResult, call}
};
use tokio::time::Instant;
use tracing::{Level, event};

use crate::{
    actor::{
        message::{RootMessage, SystemHealth, TenantMessage},
        system::ActorRuntime,
        tenant::TenantActor
    },
    context::ProcessingContext,
    domain::{constant::root, entity::TenantId}
};

const ENTITY_COUNT_TIMEOUT: Duration = Duration::from_secs(1);

struct TenantSlot {
    actor:  ActorRef<TenantMessage>,
    /// Contexts routed to the tenant actor
    routed: u64
}

/// Root Actor State - tracks tenant actors
pub struct RootActorState {
    runtime:    Arc<ActorRuntime>,
    tenants:    HashMap<TenantId, TenantSlot>,
    by_actor:   HashMap<ActorId, TenantId>,
    started_at: Instant
}

pub struct RootActor;

#[async_trait::async_trait]
impl Actor for RootActor {
    type Arguments = Arc<ActorRuntime>;
    type Msg = RootMessage;
    type State = RootActorState;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        runtime: Self::Arguments
    ) -> Result<Self::State, ActorProcessingErr> {
        event!(Level::DEBUG, event = root::ROOT_STARTED);

        Ok(RootActorState {
            runtime,
            tenants: HashMap::new(),
            by_actor: HashMap::new(),
            started_at: Instant::now()
        })
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State
    ) -> Result<(), ActorProcessingErr> {
        match message {
            RootMessage::Route { context } => self.handle_route(myself, *context, state).await,
            RootMessage::TenantIdle { tenant, received } => {
                self.handle_tenant_idle(tenant, received, state);
                Ok(())
            }
            RootMessage::Health { reply } => self.handle_health(reply, state).await
        }
    }

    async fn handle_supervisor_evt(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: SupervisionEvent,
        state: &mut Self::State
    ) -> Result<(), ActorProcessingErr> {
        match message {
            SupervisionEvent::ActorTerminated(cell, _, reason) => {
                if let Some(tenant) = state.by_actor.remove(&cell.get_id()) {
                    state.tenants.remove(&tenant);
                    event!(Level::DEBUG, event = root::TENANT_TERMINATED, tenant = %tenant,
                           reason = reason.as_deref().unwrap_or("stopped"));
                }
            }
            SupervisionEvent::ActorFailed(cell, error) => {
                if let Some(tenant) = state.by_actor.remove(&cell.get_id()) {
                    state.tenants.remove(&tenant);
                    event!(Level::ERROR, event = root::TENANT_TERMINATED, tenant = %tenant, error = %error);
                }
            }
            _ => {}
        }
        Ok(())
    }

    async fn post_stop(&self, _myself: ActorRef<Self::Msg>, state: &mut Self::State) -> Result<(), ActorProcessingErr> {
        for slot in state.tenants.values() {
            slot.actor.stop(Some("shutdown".to_string()));
        }
        event!(Level::INFO, event = root::ROOT_STOPPED, tenants = state.tenants.len(),
               uptime_seconds = state.started_at.elapsed().as_secs());
        Ok(())
    }
}

impl RootActor {
    async fn handle_route(
        &self,
        myself: ActorRef<RootMessage>,
        context: ProcessingContext,
        state: &mut RootActorState
    ) -> Result<(), ActorProcessingErr> {
        let tenant = context.entity_key().tenant_id.clone();

        if !state.tenants.contains_key(&tenant) {
            match self.spawn_tenant(&myself, &tenant, state.runtime.clone()).await {
                Ok(actor) => {
                    state.by_actor.insert(actor.get_id(), tenant.clone());
                    state.tenants.insert(tenant.clone(), TenantSlot { actor, routed: 0 });
                    event!(Level::DEBUG, event = root::TENANT_SPAWNED, tenant = %tenant, tenants = state.tenants.len());
                }
                Err(e) => {
                    event!(Level::ERROR, event = root::TENANT_SPAWN_FAILED, tenant = %tenant, error = %e);
                    return Ok(());
                }
            }
        }

        let Some(slot) = state.tenants.get_mut(&tenant) else {
            return Ok(());
        };
        event!(Level::TRACE, event = root::CONTEXT_ROUTED, tenant = %tenant, entity = %context.entity_key(),
               partition = %context.origin.partition, offset = context.origin.offset);
        slot.routed += 1;
        if let Err(e) = slot.actor.cast(TenantMessage::Route { context: Box::new(context) }) {
            event!(Level::WARN, event = root::TENANT_TERMINATED, tenant = %tenant, error = ?e);
            if let Some(slot) = state.tenants.remove(&tenant) {
                state.by_actor.remove(&slot.actor.get_id());
            }
        }
        Ok(())
    }

    async fn spawn_tenant(
        &self,
        myself: &ActorRef<RootMessage>,
        tenant: &TenantId,
        runtime: Arc<ActorRuntime>
    ) -> Result<ActorRef<TenantMessage>, SpawnErr> {
        let (actor, _handle) =
            Actor::spawn_linked(None, TenantActor, (tenant.clone(), myself.clone(), runtime), myself.get_cell())
                .await?;
        Ok(actor)
    }

    /// Evict the tenant only if nothing was routed to it after it went idle
    fn handle_tenant_idle(&self, tenant: TenantId, received: u64, state: &mut RootActorState) {
        let Some(slot) = state.tenants.get(&tenant) else {
            return;
        };
        if slot.routed != received {
            return;
        }
        if let Some(slot) = state.tenants.remove(&tenant) {
            state.by_actor.remove(&slot.actor.get_id());
            slot.actor.stop(Some("idle".to_string()));
            event!(Level::DEBUG, event = root::TENANT_EVICTED, tenant = %tenant, routed = received);
        }
    }

    async fn handle_health(
        &self,
        reply: RpcReplyPort<SystemHealth>,
        state: &RootActorState
    ) -> Result<(), ActorProcessingErr> {
        let mut entities = 0;
        for slot in state.tenants.values() {
            if let Ok(CallResult::Success(count)) =
                call(&slot.actor, |reply| TenantMessage::Entities { reply }, Some(ENTITY_COUNT_TIMEOUT)).await
            {
                entities += count;
            }
        }

        let stats = &state.runtime.stats;
        let health = SystemHealth {
            tenants: state.tenants.len(),
            entities,
            processed: stats.processed(),
            failed: stats.failed(),
            dead_lettered: stats.dead_lettered(),
            fenced: stats.fenced(),
            uptime_seconds: state.started_at.elapsed().as_secs()
        };

        event!(Level::DEBUG, event = root::HEALTH_CHECK_COMPLETED, tenants = health.tenants,
               entities = health.entities, processed = health.processed);

        if let Err(e) = reply.send(health) {
            event!(Level::ERROR, event = root::HEALTH_CHECK_COMPLETED, error = %e);
        }
        Ok(())
    }
}
