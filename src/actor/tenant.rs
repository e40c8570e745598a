//! Tenant Actor - supervises the entity actors of one tenant
//!
//! - Spawns entity actors lazily on their first context
//! - Tracks dispatched/settled counts per entity so that only entities with an
//!   empty mailbox are evicted
//! - Reports itself idle to the root once it holds no entities

use std::{collections::HashMap, sync::Arc, time::Duration};

use ractor::{Actor, ActorId, ActorProcessingErr, ActorRef, SpawnErr, SupervisionEvent};
use tokio::{task::JoinHandle, time::Instant};
use tracing::{Level, event};

use crate::{
    actor::{
        entity::EntityActor,
        message::{EntityMessage, RootMessage, TenantMessage},
        system::ActorRuntime
    },
    context::ProcessingContext,
    domain::{
        constant::tenant,
        entity::{EntityKey, TenantId}
    }
};

struct EntitySlot {
    actor:       ActorRef<EntityMessage>,
    dispatched:  u64,
    processed:   u64,
    last_active: Instant
}

impl EntitySlot {
    fn is_idle(&self, idle_timeout: Duration) -> bool {
        self.dispatched == self.processed && self.last_active.elapsed() >= idle_timeout
    }
}

/// Tenant Actor State - live entities and their mailbox accounting
pub struct TenantActorState {
    tenant:        TenantId,
    root:          ActorRef<RootMessage>,
    runtime:       Arc<ActorRuntime>,
    entities:      HashMap<EntityKey, EntitySlot>,
    by_actor:      HashMap<ActorId, EntityKey>,
    /// Contexts routed to this tenant since it started
    received:      u64,
    last_active:   Instant,
    idle_reported: bool,
    sweeper:       Option<JoinHandle<()>>
}

pub struct TenantActor;

#[async_trait::async_trait]
impl Actor for TenantActor {
    type Arguments = (TenantId, ActorRef<RootMessage>, Arc<ActorRuntime>);
    type Msg = TenantMessage;
    type State = TenantActorState;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        (tenant, root, runtime): Self::Arguments
    ) -> Result<Self::State, ActorProcessingErr> {
        event!(Level::DEBUG, event = tenant::TENANT_STARTED, tenant = %tenant);

        let sweeper = myself.send_interval(runtime.settings.sweep_interval, || TenantMessage::Sweep);

        Ok(TenantActorState {
            tenant,
            root,
            runtime,
            entities: HashMap::new(),
            by_actor: HashMap::new(),
            received: 0,
            last_active: Instant::now(),
            idle_reported: false,
            sweeper: Some(sweeper)
        })
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State
    ) -> Result<(), ActorProcessingErr> {
        match message {
            TenantMessage::Route { context } => self.handle_route(myself, *context, state).await,
            TenantMessage::EntitySettled { key, actor, processed } => {
                if let Some(slot) = state.entities.get_mut(&key)
                    && slot.actor.get_id() == actor
                {
                    slot.processed = slot.processed.max(processed);
                    slot.last_active = Instant::now();
                }
                state.last_active = Instant::now();
                Ok(())
            }
            TenantMessage::Sweep => self.handle_sweep(state),
            TenantMessage::Entities { reply } => {
                if let Err(e) = reply.send(state.entities.len()) {
                    event!(Level::ERROR, event = tenant::SWEEP_COMPLETED, tenant = %state.tenant, error = %e);
                }
                Ok(())
            }
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
                if let Some(key) = state.by_actor.remove(&cell.get_id()) {
                    state.entities.remove(&key);
                    event!(Level::DEBUG, event = tenant::ENTITY_TERMINATED, tenant = %state.tenant, entity = %key,
                           reason = reason.as_deref().unwrap_or("stopped"));
                }
            }
            SupervisionEvent::ActorFailed(cell, error) => {
                // Contexts still queued in the failed mailbox are dropped and report abandoned.
                if let Some(key) = state.by_actor.remove(&cell.get_id()) {
                    state.entities.remove(&key);
                    state.runtime.stats.record_crash();
                    event!(Level::ERROR, event = tenant::ENTITY_FAILED, tenant = %state.tenant, entity = %key,
                           error = %error);
                }
            }
            _ => {}
        }
        Ok(())
    }

    async fn post_stop(&self, _myself: ActorRef<Self::Msg>, state: &mut Self::State) -> Result<(), ActorProcessingErr> {
        if let Some(sweeper) = state.sweeper.take() {
            sweeper.abort();
        }
        for slot in state.entities.values() {
            slot.actor.stop(Some("tenant stopped".to_string()));
        }
        event!(Level::DEBUG, event = tenant::TENANT_STOPPED, tenant = %state.tenant, received = state.received);
        Ok(())
    }
}

impl TenantActor {
    async fn handle_route(
        &self,
        myself: ActorRef<TenantMessage>,
        context: ProcessingContext,
        state: &mut TenantActorState
    ) -> Result<(), ActorProcessingErr> {
        let key = context.entity_key().clone();
        state.received += 1;
        state.last_active = Instant::now();
        state.idle_reported = false;

        if !state.entities.contains_key(&key) {
            match self.spawn_entity(&myself, &key, state.runtime.clone()).await {
                Ok(actor) => {
                    state.by_actor.insert(actor.get_id(), key.clone());
                    state.entities.insert(key.clone(), EntitySlot {
                        actor,
                        dispatched: 0,
                        processed: 0,
                        last_active: Instant::now()
                    });
                    event!(Level::DEBUG, event = tenant::ENTITY_SPAWNED, tenant = %state.tenant, entity = %key,
                           entities = state.entities.len());
                }
                Err(e) => {
                    // Dropping the context reports it abandoned; the consumer redelivers it.
                    event!(Level::ERROR, event = tenant::ENTITY_SPAWN_FAILED, tenant = %state.tenant, entity = %key,
                           error = %e);
                    return Ok(());
                }
            }
        }

        let Some(slot) = state.entities.get_mut(&key) else {
            return Ok(());
        };
        slot.dispatched += 1;
        slot.last_active = Instant::now();
        if let Err(e) = slot.actor.cast(EntityMessage::Process { context: Box::new(context) }) {
            event!(Level::WARN, event = tenant::ENTITY_FAILED, tenant = %state.tenant, entity = %key, error = ?e);
            if let Some(slot) = state.entities.remove(&key) {
                state.by_actor.remove(&slot.actor.get_id());
            }
        }
        Ok(())
    }

    async fn spawn_entity(
        &self,
        myself: &ActorRef<TenantMessage>,
        key: &EntityKey,
        runtime: Arc<ActorRuntime>
    ) -> Result<ActorRef<EntityMessage>, SpawnErr> {
        let (actor, _handle) =
            Actor::spawn_linked(None, EntityActor, (key.clone(), myself.clone(), runtime), myself.get_cell()).await?;
        Ok(actor)
    }

    fn handle_sweep(&self, state: &mut TenantActorState) -> Result<(), ActorProcessingErr> {
        let idle_timeout = state.runtime.settings.idle_timeout;
        let idle: Vec<EntityKey> =
            state.entities.iter().filter(|(_, slot)| slot.is_idle(idle_timeout)).map(|(key, _)| key.clone()).collect();

        for key in &idle {
            if let Some(slot) = state.entities.remove(key) {
                state.by_actor.remove(&slot.actor.get_id());
                slot.actor.stop(Some("idle".to_string()));
                event!(Level::DEBUG, event = tenant::ENTITY_EVICTED, tenant = %state.tenant, entity = %key);
            }
        }

        event!(Level::TRACE, event = tenant::SWEEP_COMPLETED, tenant = %state.tenant, evicted = idle.len(),
               entities = state.entities.len());

        if state.entities.is_empty() && !state.idle_reported && state.last_active.elapsed() >= idle_timeout {
            state.idle_reported = true;
            if let Err(e) =
                state.root.cast(RootMessage::TenantIdle { tenant: state.tenant.clone(), received: state.received })
            {
                event!(Level::WARN, event = tenant::SWEEP_COMPLETED, tenant = %state.tenant, error = ?e);
            }
        }
        Ok(())
    }
}
