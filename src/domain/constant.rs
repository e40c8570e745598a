//! Structured log event names, grouped per component

/// Partitioned queue events
pub mod queue {
    pub const QUEUE_OPENED: &str = "queue.opened";
    pub const RECORD_PUBLISHED: &str = "record.published";
    pub const OFFSET_COMMITTED: &str = "offset.committed";
    pub const OFFSET_SEEK: &str = "offset.seek";
    pub const FETCH_FAILED: &str = "fetch.failed";
}

/// Partition ownership events
pub mod ownership {
    pub const SERVICE_STARTED: &str = "ownership.started";
    pub const MEMBERSHIP_CHANGED: &str = "membership.changed";
    pub const HEARTBEAT_FAILED: &str = "heartbeat.failed";
    pub const NODE_DECLARED_DEAD: &str = "node.declared_dead";
    pub const ASSIGNMENT_PROPOSED: &str = "assignment.proposed";
    pub const ASSIGNMENT_REJECTED: &str = "assignment.rejected";
    pub const EPOCH_OBSERVED: &str = "epoch.observed";
    pub const PARTITION_GAINED: &str = "partition.gained";
    pub const PARTITION_REVOKED: &str = "partition.revoked";
    pub const PARTITION_RELEASED: &str = "partition.released";
    pub const SELF_FENCED: &str = "node.self_fenced";
    pub const SERVICE_STOPPED: &str = "ownership.stopped";
}

/// Root actor events
pub mod root {
    pub const ROOT_STARTED: &str = "root.started";
    pub const TENANT_SPAWNED: &str = "tenant.spawned";
    pub const TENANT_SPAWN_FAILED: &str = "tenant.spawn_failed";
    pub const TENANT_EVICTED: &str = "tenant.evicted";
    pub const TENANT_TERMINATED: &str = "tenant.terminated";
    pub const CONTEXT_ROUTED: &str = "context.routed";
    pub const HEALTH_CHECK_COMPLETED: &str = "health.check_completed";
    pub const ROOT_STOPPED: &str = "root.stopped";
}

/// Tenant actor events
pub mod tenant {
    pub const TENANT_STARTED: &str = "tenant.started";
    pub const ENTITY_SPAWNED: &str = "entity.spawned";
    pub const ENTITY_SPAWN_FAILED: &str = "entity.spawn_failed";
    pub const ENTITY_EVICTED: &str = "entity.evicted";
    pub const ENTITY_TERMINATED: &str = "entity.terminated";
    pub const ENTITY_FAILED: &str = "entity.failed";
    pub const SWEEP_COMPLETED: &str = "sweep.completed";
    pub const TENANT_STOPPED: &str = "tenant.stopped";
}

/// Entity actor events
pub mod entity {
    pub const ENTITY_STARTED: &str = "entity.started";
    pub const CONTEXT_RECEIVED: &str = "context.received";
    pub const CONTEXT_FENCED: &str = "context.fenced";
    pub const ATTEMPT_STARTED: &str = "attempt.started";
    pub const ATTEMPT_FAILED: &str = "attempt.failed";
    pub const ACTOR_SUSPENDED: &str = "actor.suspended";
    pub const ACTOR_RESTARTED: &str = "actor.restarted";
    pub const CONTEXT_ACKED: &str = "context.acked";
    pub const CONTEXT_DEAD_LETTERED: &str = "context.dead_lettered";
    pub const ENTITY_STOPPED: &str = "entity.stopped";
}

/// Rule chain engine events
pub mod engine {
    pub const CHAIN_INSTALLED: &str = "chain.installed";
    pub const CHAIN_BOUND: &str = "chain.bound";
    pub const CHAIN_REJECTED: &str = "chain.rejected";
    pub const NODE_INVOKED: &str = "node.invoked";
    pub const NODE_SUSPENDED: &str = "node.suspended";
    pub const PATH_TERMINATED: &str = "path.terminated";
    pub const LOOP_EXCEEDED: &str = "chain.loop_exceeded";
    pub const NODE_LOG: &str = "node.log";
}

/// Partition consumer events
pub mod consumer {
    pub const MANAGER_STARTED: &str = "consumer.manager_started";
    pub const PARTITION_STARTED: &str = "partition.started";
    pub const PARTITION_DRAINING: &str = "partition.draining";
    pub const PARTITION_STOPPED: &str = "partition.stopped";
    pub const PARTITION_RESTARTED: &str = "partition.restarted";
    pub const RECORD_DISPATCHED: &str = "record.dispatched";
    pub const RECORD_UNROUTABLE: &str = "record.unroutable";
    pub const CONTEXT_SETTLED: &str = "context.settled";
    pub const COMMIT_FENCED: &str = "commit.fenced";
    pub const DEAD_LETTER_FAILED: &str = "dead_letter.failed";
    pub const DRAIN_TIMED_OUT: &str = "drain.timed_out";
}

/// Node runtime events
pub mod node {
    pub const NODE_STARTING: &str = "node.starting";
    pub const NODE_STARTED: &str = "node.started";
    pub const SUBMIT_ACCEPTED: &str = "submit.accepted";
    pub const SUBMIT_REJECTED: &str = "submit.rejected";
    pub const NODE_SHUTDOWN_STARTED: &str = "node.shutdown_started";
    pub const NODE_SHUTDOWN_COMPLETED: &str = "node.shutdown_completed";
}
