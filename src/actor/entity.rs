//! Entity Actor - one per EntityKey
//!
//! Processes its contexts strictly one at a time. For each context it:
//! - refuses to start work when the partition lease no longer allows it
//! - executes the resolved rule chain under the context deadline
//! - retries transient failures and crashes with backoff, dead-letters the rest
//!
//! A panic inside chain execution suspends the actor: its node-local state is
//! discarded and the message is redelivered to freshly initialized sessions,
//! up to the retry bound.

use std::{any::Any, collections::HashMap, panic::AssertUnwindSafe, sync::Arc};

use futures::FutureExt;
use ractor::{Actor, ActorProcessingErr, ActorRef};
use tracing::{Level, event};

use crate::{
    actor::{
        message::{EntityMessage, TenantMessage},
        system::ActorRuntime
    },
    context::ProcessingContext,
    domain::{
        chain::ChainId,
        constant::entity,
        entity::EntityKey,
        error::{ErrorClass, PipelineError},
        outcome::{ChainFailure, ChainOutcome, Settlement}
    },
    engine::{CompiledChain, execute, node::NodeState}
};

/// Node id reported for failures not attributable to a rule node
const ENTITY_NODE: &str = "entity";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityLifecycle {
    Active,
    Suspended
}

/// Node-local state of one installed chain
struct ChainSession {
    generation: u64,
    states:     Vec<NodeState>
}

/// Entity Actor State - owned exclusively by the actor
pub struct EntityActorState {
    key:       EntityKey,
    tenant:    ActorRef<TenantMessage>,
    runtime:   Arc<ActorRuntime>,
    lifecycle: EntityLifecycle,
    sessions:  HashMap<ChainId, ChainSession>,
    /// Contexts settled so far
    processed: u64
}

impl EntityActorState {
    /// Working copy of the session states; committed back only on ack
    fn checkout(&mut self, chain: &CompiledChain) -> Vec<NodeState> {
        let session = self
            .sessions
            .entry(chain.id.clone())
            .or_insert_with(|| ChainSession { generation: chain.generation, states: chain.initial_states() });
        if session.generation != chain.generation {
            *session = ChainSession { generation: chain.generation, states: chain.initial_states() };
        }
        session.states.clone()
    }

    fn commit(&mut self, chain: &CompiledChain, states: Vec<NodeState>) {
        self.sessions.insert(chain.id.clone(), ChainSession { generation: chain.generation, states });
    }
}

enum Attempt {
    Acked,
    Failed(ChainFailure),
    Fenced
}

pub struct EntityActor;

#[async_trait::async_trait]
impl Actor for EntityActor {
    type Arguments = (EntityKey, ActorRef<TenantMessage>, Arc<ActorRuntime>);
    type Msg = EntityMessage;
    type State = EntityActorState;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        (key, tenant, runtime): Self::Arguments
    ) -> Result<Self::State, ActorProcessingErr> {
        event!(Level::DEBUG, event = entity::ENTITY_STARTED, entity = %key);

        Ok(EntityActorState {
            key,
            tenant,
            runtime,
            lifecycle: EntityLifecycle::Active,
            sessions: HashMap::new(),
            processed: 0
        })
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State
    ) -> Result<(), ActorProcessingErr> {
        match message {
            EntityMessage::Process { context } => {
                event!(Level::DEBUG, event = entity::CONTEXT_RECEIVED, entity = %state.key,
                       partition = %context.origin.partition, offset = context.origin.offset);
                self.process(*context, state).await;

                state.processed += 1;
                let settled = TenantMessage::EntitySettled {
                    key:       state.key.clone(),
                    actor:     myself.get_id(),
                    processed: state.processed
                };
                if let Err(e) = state.tenant.cast(settled) {
                    event!(Level::WARN, event = entity::ENTITY_STOPPED, entity = %state.key, error = ?e);
                }
                Ok(())
            }
        }
    }

    async fn post_stop(&self, _myself: ActorRef<Self::Msg>, state: &mut Self::State) -> Result<(), ActorProcessingErr> {
        event!(Level::DEBUG, event = entity::ENTITY_STOPPED, entity = %state.key, processed = state.processed);
        Ok(())
    }
}

impl EntityActor {
    /// Drive one context to its settlement
    async fn process(&self, mut context: ProcessingContext, state: &mut EntityActorState) {
        let runtime = state.runtime.clone();
        let policy = runtime.settings.retry;

        loop {
            if let Err(e) = context.lease.check() {
                return Self::fenced(context, &runtime, &e);
            }
            if state.lifecycle == EntityLifecycle::Suspended {
                state.lifecycle = EntityLifecycle::Active;
                event!(Level::INFO, event = entity::ACTOR_RESTARTED, entity = %state.key,
                       attempt = context.attempt + 1);
            }

            let attempt = context.begin_attempt(runtime.settings.processing_timeout);
            event!(Level::DEBUG, event = entity::ATTEMPT_STARTED, entity = %state.key, chain = %context.chain.id,
                   offset = context.origin.offset, attempt = attempt, correlation_id = %context.correlation_id);

            let failure = match self.attempt(&context, state).await {
                Attempt::Acked => {
                    runtime.stats.record_processed();
                    event!(Level::DEBUG, event = entity::CONTEXT_ACKED, entity = %state.key,
                           offset = context.origin.offset, attempts = attempt);
                    context.settle(Settlement::Acked { attempts: attempt });
                    return;
                }
                Attempt::Fenced => {
                    let error = PipelineError::fenced(context.origin.partition, "fenced during execution");
                    return Self::fenced(context, &runtime, &error);
                }
                Attempt::Failed(failure) => failure
            };

            runtime.stats.record_failed();
            context.record_failure(&failure);
            event!(Level::WARN, event = entity::ATTEMPT_FAILED, entity = %state.key, node = %failure.node_id,
                   attempt = attempt, class = %failure.class(), error = %failure.error);

            match failure.class() {
                ErrorClass::Fencing => return Self::fenced(context, &runtime, &failure.error),
                ErrorClass::Configuration => return Self::dead_letter(context, &runtime, &failure),
                ErrorClass::Crash => {
                    runtime.stats.record_crash();
                    Self::suspend(state);
                }
                ErrorClass::Transient => {}
            }

            if policy.exhausted(attempt) {
                return Self::dead_letter(context, &runtime, &failure);
            }

            let backoff = policy.backoff(attempt);
            let lease = context.lease.clone();
            tokio::select! {
                _ = lease.revoked() => {}
                _ = lease.fenced() => {}
                _ = tokio::time::sleep(backoff) => {}
            }
        }
    }

    /// One execution of the chain on a working copy of the session state
    async fn attempt(&self, context: &ProcessingContext, state: &mut EntityActorState) -> Attempt {
        let chain = context.chain.clone();
        let mut working = state.checkout(&chain);
        let deadline = context.deadline.unwrap_or_else(tokio::time::Instant::now);

        let run = AssertUnwindSafe(execute(
            &chain,
            context.message.clone(),
            &mut working,
            &state.runtime.collaborators
        ))
        .catch_unwind();

        let attempt = tokio::select! {
            biased;
            _ = context.lease.fenced() => Attempt::Fenced,
            result = tokio::time::timeout_at(deadline, run) => match result {
                Err(_) => Attempt::Failed(ChainFailure::new(
                    ENTITY_NODE,
                    PipelineError::Timeout(format!("processing deadline exceeded for offset {}", context.origin.offset))
                )),
                Ok(Err(panic)) => {
                    Attempt::Failed(ChainFailure::new(ENTITY_NODE, PipelineError::ActorCrash(panic_message(&*panic))))
                }
                Ok(Ok(report)) => match report.outcome {
                    ChainOutcome::Ack => Attempt::Acked,
                    ChainOutcome::Fail(failure) => Attempt::Failed(failure)
                }
            }
        };

        if let Attempt::Acked = attempt {
            state.commit(&chain, working);
        }
        attempt
    }

    /// Drop all transient state; the next attempt starts from fresh sessions
    fn suspend(state: &mut EntityActorState) {
        state.lifecycle = EntityLifecycle::Suspended;
        state.sessions.clear();
        event!(Level::WARN, event = entity::ACTOR_SUSPENDED, entity = %state.key);
    }

    fn fenced(context: ProcessingContext, runtime: &ActorRuntime, reason: &PipelineError) {
        runtime.stats.record_fenced();
        event!(Level::INFO, event = entity::CONTEXT_FENCED, entity = %context.entity_key(),
               offset = context.origin.offset, reason = %reason);
        context.settle(Settlement::Fenced);
    }

    fn dead_letter(context: ProcessingContext, runtime: &ActorRuntime, failure: &ChainFailure) {
        runtime.stats.record_dead_lettered();
        event!(Level::ERROR, event = entity::CONTEXT_DEAD_LETTERED, entity = %context.entity_key(),
               offset = context.origin.offset, node = %failure.node_id, attempts = context.attempt,
               error = %failure.error);
        let entry = context.dead_letter_entry(failure);
        context.settle(Settlement::DeadLettered(Box::new(entry)));
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("panic: {}", message)
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("panic: {}", message)
    } else {
        "panic".to_string()
    }
}
