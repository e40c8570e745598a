//! Message processing context
//!
//! One context exists per in-flight queue record. It is created by the
//! partition consumer on dequeue, travels through the actor hierarchy and is
//! consumed by [`ProcessingContext::settle`] once its terminal outcome is known.
//! A context dropped without settling reports itself as abandoned so the
//! consumer never waits on it forever.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tokio::{sync::mpsc, time::Instant};
use uuid::Uuid;

use crate::{
    domain::{
        dead_letter::DeadLetterEntry,
        entity::EntityKey,
        message::Message,
        outcome::{AttemptRecord, ChainFailure, Settlement},
        record::{Offset, PartitionId}
    },
    engine::compiled::CompiledChain,
    ownership::lease::PartitionLease
};

pub type SettlementSender = mpsc::UnboundedSender<(Offset, Settlement)>;

/// Queue record a context was created from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordOrigin {
    pub partition:   PartitionId,
    pub offset:      Offset,
    pub enqueued_at: DateTime<Utc>
}

/// Reports the settlement of one offset back to its partition consumer
#[derive(Debug)]
pub struct Completion {
    offset: Offset,
    tx:     Option<SettlementSender>
}

impl Completion {
    pub fn new(offset: Offset, tx: SettlementSender) -> Self {
        Self { offset, tx: Some(tx) }
    }

    fn send(&mut self, settlement: Settlement) {
        if let Some(tx) = self.tx.take() {
            // The consumer round may already be gone; the record is then redelivered.
            let _ = tx.send((self.offset, settlement));
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        self.send(Settlement::Abandoned);
    }
}

/// Bounded redelivery with exponential backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total deliveries allowed, the first one included
    pub max_attempts:    u32,
    pub backoff_initial: Duration,
    pub backoff_max:     Duration
}

impl RetryPolicy {
    /// Delay before the attempt following `attempt`
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.backoff_initial.saturating_mul(factor).min(self.backoff_max)
    }

    pub fn exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }
}

#[derive(Debug)]
pub struct ProcessingContext {
    pub message:        Message,
    pub origin:         RecordOrigin,
    /// Deliveries started so far
    pub attempt:        u32,
    /// Deadline of the current attempt
    pub deadline:       Option<Instant>,
    pub correlation_id: Uuid,
    /// Chain resolved at dequeue
    pub chain:          Arc<CompiledChain>,
    pub lease:          PartitionLease,
    history:            Vec<AttemptRecord>,
    completion:         Completion
}

impl ProcessingContext {
    pub fn new(
        message: Message,
        origin: RecordOrigin,
        chain: Arc<CompiledChain>,
        lease: PartitionLease,
        completion: Completion
    ) -> Self {
        Self {
            message,
            origin,
            attempt: 0,
            deadline: None,
            correlation_id: Uuid::new_v4(),
            chain,
            lease,
            history: Vec::new(),
            completion
        }
    }

    pub fn entity_key(&self) -> &EntityKey {
        &self.message.originator
    }

    /// Start the next attempt; returns its number
    pub fn begin_attempt(&mut self, timeout: Duration) -> u32 {
        self.attempt += 1;
        self.deadline = Some(Instant::now() + timeout);
        self.attempt
    }

    pub fn record_failure(&mut self, failure: &ChainFailure) {
        self.history.push(AttemptRecord {
            attempt:      self.attempt,
            failing_node: Some(failure.node_id.clone()),
            reason:       failure.error.to_string(),
            class:        failure.class(),
            at:           Utc::now()
        });
    }

    pub fn history(&self) -> &[AttemptRecord] {
        &self.history
    }

    pub fn dead_letter_entry(&self, failure: &ChainFailure) -> DeadLetterEntry {
        DeadLetterEntry {
            entity_key:       Some(self.message.originator.clone()),
            chain_id:         Some(self.chain.id.clone()),
            failing_node:     Some(failure.node_id.clone()),
            reason:           failure.error.to_string(),
            class:            failure.class(),
            attempt_count:    self.attempt,
            attempts:         self.history.clone(),
            payload:          serde_json::to_value(&self.message).unwrap_or(serde_json::Value::Null),
            partition:        self.origin.partition,
            offset:           self.origin.offset,
            dead_lettered_at: Utc::now()
        }
    }

    /// Report the terminal outcome and release the context
    pub fn settle(mut self, settlement: Settlement) {
        self.completion.send(settlement);
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::domain::{
        assignment::{Epoch, FencingToken, NodeId},
        chain::RuleChainDef,
        error::{ErrorClass, PipelineError}
    };

    fn context(tx: SettlementSender) -> ProcessingContext {
        let chain = RuleChainDef::from_yaml("id: c\nname: c\nroot: a\nnodes:\n  - { id: a, type: ack }\n").unwrap();
        let lease =
            PartitionLease::new(FencingToken { partition: PartitionId(0), epoch: Epoch(1), node: NodeId::new("n") });
        ProcessingContext::new(
            Message::telemetry(EntityKey::device("acme", "d1"), json!({"temperature": 50})),
            RecordOrigin { partition: PartitionId(0), offset: 7, enqueued_at: Utc::now() },
            Arc::new(CompiledChain::compile(&chain, 10).unwrap()),
            lease,
            Completion::new(7, tx)
        )
    }

    #[test]
    fn test_settle_reports_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        context(tx).settle(Settlement::Acked { attempts: 1 });
        assert_eq!(rx.try_recv().unwrap(), (7, Settlement::Acked { attempts: 1 }));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_drop_reports_abandoned() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        drop(context(tx));
        assert_eq!(rx.try_recv().unwrap(), (7, Settlement::Abandoned));
    }

    #[tokio::test]
    async fn test_dead_letter_entry_carries_history() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut context = context(tx);
        let failure = ChainFailure::new("save", PipelineError::Unreachable("store down".into()));
        for _ in 0..3 {
            context.begin_attempt(Duration::from_secs(1));
            context.record_failure(&failure);
        }

        let entry = context.dead_letter_entry(&failure);
        assert_eq!(entry.attempt_count, 3);
        assert_eq!(entry.attempts.len(), 3);
        assert_eq!(entry.failing_node.as_deref(), Some("save"));
        assert_eq!(entry.class, ErrorClass::Transient);
        assert_eq!(entry.offset, 7);
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy {
            max_attempts:    5,
            backoff_initial: Duration::from_millis(100),
            backoff_max:     Duration::from_millis(250)
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(250));
        assert!(!policy.exhausted(4));
        assert!(policy.exhausted(5));
    }
}
