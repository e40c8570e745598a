//! Rule chain execution
//!
//! Walks the chain from its root. Every node invocation costs one hop from the
//! chain's budget; fan-out creates independent paths that share the budget.
//! Synchronous nodes run inline, pending nodes are polled concurrently and the
//! entity stays suspended until the message reaches a terminal outcome under
//! the chain's completion policy. Dropping the returned future cancels every
//! pending node.

use std::collections::VecDeque;

use futures::{FutureExt, StreamExt, future::BoxFuture, stream::FuturesUnordered};
use tracing::{Level, event};

use crate::{
    domain::{
        chain::{CompletionPolicy, label},
        constant::engine,
        error::PipelineError,
        message::Message,
        outcome::{ChainFailure, ChainOutcome}
    },
    engine::{
        compiled::CompiledChain,
        node::{NodeOutcome, NodeState, Step}
    },
    port::Collaborators
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionReport {
    pub outcome: ChainOutcome,
    /// Node invocations performed
    pub hops:    u32
}

struct Walk<'a> {
    chain:    &'a CompiledChain,
    ready:    VecDeque<(usize, Message)>,
    acked:    u32,
    failures: Vec<ChainFailure>
}

impl Walk<'_> {
    /// Route a node outcome; returns a failure that ends the walk immediately
    fn apply(&mut self, index: usize, outcome: NodeOutcome) -> Option<ChainFailure> {
        let chain = self.chain;
        let node_id = &chain.node(index).id;
        match outcome {
            NodeOutcome::Emit(emitted) => {
                if emitted.is_empty() {
                    self.acked += 1;
                }
                for (relation, message) in emitted {
                    let targets = chain.targets(index, &relation);
                    if targets.is_empty() {
                        if relation == label::FAILURE {
                            let reason = message.metadata.get("error").cloned().unwrap_or_else(|| relation.clone());
                            return self.path_failed(ChainFailure::new(node_id, PipelineError::Evaluation(reason)));
                        }
                        event!(Level::TRACE, event = engine::PATH_TERMINATED, node = %node_id, label = %relation);
                        self.acked += 1;
                        continue;
                    }
                    for target in targets {
                        self.ready.push_back((*target, message.clone()));
                    }
                }
                None
            }
            NodeOutcome::Failure { error, mut message } => {
                let targets = chain.targets(index, label::FAILURE);
                if targets.is_empty() {
                    return self.path_failed(ChainFailure::new(node_id, error));
                }
                message.metadata.insert("error".to_string(), error.to_string());
                for target in targets {
                    self.ready.push_back((*target, message.clone()));
                }
                None
            }
            NodeOutcome::Ack => {
                self.acked += 1;
                None
            }
            NodeOutcome::Fail(error) => self.path_failed(ChainFailure::new(node_id, error))
        }
    }

    fn path_failed(&mut self, failure: ChainFailure) -> Option<ChainFailure> {
        match self.chain.completion {
            CompletionPolicy::FailFast => Some(failure),
            CompletionPolicy::AllSettled | CompletionPolicy::AnySuccess => {
                self.failures.push(failure);
                None
            }
        }
    }

    fn settle(mut self) -> ChainOutcome {
        match self.chain.completion {
            CompletionPolicy::AnySuccess if self.acked > 0 => ChainOutcome::Ack,
            _ if self.failures.is_empty() => ChainOutcome::Ack,
            _ => ChainOutcome::Fail(self.failures.remove(0))
        }
    }
}

/// Execute `chain` for one message. `states` holds node-local state indexed like the chain's nodes.
pub async fn execute(
    chain: &CompiledChain,
    message: Message,
    states: &mut [NodeState],
    collaborators: &Collaborators
) -> ExecutionReport {
    let mut walk = Walk { chain, ready: VecDeque::from([(chain.root, message)]), acked: 0, failures: Vec::new() };
    let mut pending: FuturesUnordered<BoxFuture<'static, (usize, NodeOutcome)>> = FuturesUnordered::new();
    let mut hops = 0u32;

    loop {
        while let Some((index, message)) = walk.ready.pop_front() {
            let node = chain.node(index);
            if hops >= chain.hop_budget {
                event!(Level::WARN, event = engine::LOOP_EXCEEDED, chain = %chain.id, node = %node.id, hops = hops);
                let failure = ChainFailure::new(&node.id, PipelineError::LoopExceeded { hops });
                return ExecutionReport { outcome: ChainOutcome::Fail(failure), hops };
            }
            hops += 1;

            event!(Level::TRACE, event = engine::NODE_INVOKED, chain = %chain.id, node = %node.id, kind = node.kind);
            let Some(state) = states.get_mut(index) else {
                let error = PipelineError::ChainConfiguration(format!("no state slot for node {}", node.id));
                return ExecutionReport { outcome: ChainOutcome::Fail(ChainFailure::new(&node.id, error)), hops };
            };

            match node.node.process(&node.id, message, state, chain.templates(), collaborators) {
                Step::Done(outcome) => {
                    if let Some(failure) = walk.apply(index, outcome) {
                        return ExecutionReport { outcome: ChainOutcome::Fail(failure), hops };
                    }
                }
                Step::Pending(future) => {
                    event!(Level::TRACE, event = engine::NODE_SUSPENDED, chain = %chain.id, node = %node.id);
                    pending.push(future.map(move |outcome| (index, outcome)).boxed());
                }
            }
        }

        let Some((index, outcome)) = pending.next().await else {
            break;
        };
        if let Some(failure) = walk.apply(index, outcome) {
            return ExecutionReport { outcome: ChainOutcome::Fail(failure), hops };
        }
    }

    ExecutionReport { outcome: walk.settle(), hops }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::{
        adapter::persistence::{InMemoryEntityStore, RecordingCommandGateway},
        domain::{chain::RuleChainDef, entity::EntityKey}
    };

    struct Harness {
        entities:      Arc<InMemoryEntityStore>,
        commands:      Arc<RecordingCommandGateway>,
        collaborators: Collaborators
    }

    fn harness() -> Harness {
        let entities = Arc::new(InMemoryEntityStore::new());
        let commands = Arc::new(RecordingCommandGateway::new());
        let collaborators = Collaborators { entities: entities.clone(), commands: commands.clone() };
        Harness { entities, commands, collaborators }
    }

    fn compile(yaml: &str) -> CompiledChain {
        CompiledChain::compile(&RuleChainDef::from_yaml(yaml).unwrap(), 10).unwrap()
    }

    async fn run(chain: &CompiledChain, harness: &Harness, payload: serde_json::Value) -> ExecutionReport {
        let mut states = chain.initial_states();
        let message = Message::telemetry(EntityKey::device("acme", "d1"), payload);
        execute(chain, message, &mut states, &harness.collaborators).await
    }

    const THERMOSTAT: &str = r#"
id: thermostat
name: Thermostat
root: hot
nodes:
  - { id: hot, type: filter, condition: "msg.temperature > 80" }
  - { id: alert, type: create_alert, alert_type: HighTemperature, severity: critical }
  - { id: ok, type: ack }
relations:
  - { from: hot, label: "True", to: alert }
  - { from: hot, label: "False", to: ok }
"#;

    #[tokio::test]
    async fn test_filter_alert_scenario() {
        let chain = compile(THERMOSTAT);
        let harness = harness();

        let cold = run(&chain, &harness, json!({"temperature": 50})).await;
        assert_eq!(cold.outcome, ChainOutcome::Ack);
        assert!(harness.entities.alerts().await.is_empty());

        let hot = run(&chain, &harness, json!({"temperature": 95})).await;
        assert_eq!(hot.outcome, ChainOutcome::Ack);
        assert_eq!(hot.hops, 2);
        let alerts = harness.entities.alerts().await;
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert_type, "HighTemperature");
    }

    #[tokio::test]
    async fn test_cycle_exhausts_hop_budget_exactly() {
        let chain = compile(
            r#"
id: loop
name: Loop
root: a
nodes:
  - { id: a, type: log }
  - { id: b, type: log }
  - { id: c, type: log }
relations:
  - { from: a, label: Success, to: b }
  - { from: b, label: Success, to: c }
  - { from: c, label: Success, to: a }
"#
        );
        let report = run(&chain, &harness(), json!({})).await;
        assert_eq!(report.hops, 10);
        match report.outcome {
            ChainOutcome::Fail(failure) => {
                assert_eq!(failure.error, PipelineError::LoopExceeded { hops: 10 });
                assert_eq!(failure.error.to_string(), "chain loop exceeded after 10 hops");
                assert_eq!(failure.node_id, "b");
            }
            other => panic!("unexpected {:?}", other)
        }
    }

    #[tokio::test]
    async fn test_evaluation_error_follows_failure_relation() {
        let chain = compile(
            r#"
id: c
name: c
root: hot
nodes:
  - { id: hot, type: filter, condition: "msg.temperature > 80" }
  - { id: broken, type: save_attributes }
relations:
  - { from: hot, label: Failure, to: broken }
"#
        );
        let harness = harness();
        let report = run(&chain, &harness, json!({"humidity": 3})).await;
        assert_eq!(report.outcome, ChainOutcome::Ack);

        let unrouted = compile(
            "id: c\nname: c\nroot: hot\nnodes:\n  - { id: hot, type: filter, condition: \"msg.temperature > 80\" }\n"
        );
        match run(&unrouted, &harness, json!({"humidity": 3})).await.outcome {
            ChainOutcome::Fail(failure) => {
                assert_eq!(failure.node_id, "hot");
                assert!(!failure.error.is_retryable());
            }
            other => panic!("unexpected {:?}", other)
        }
    }

    #[tokio::test]
    async fn test_fan_out_fail_fast_and_any_success() {
        let fan_out = |policy: &str| {
            compile(&format!(
                r#"
id: fan
name: fan
root: start
completion: {}
nodes:
  - {{ id: start, type: log }}
  - {{ id: command, type: send_command, method: reboot }}
  - {{ id: save, type: save_telemetry }}
relations:
  - {{ from: start, label: Success, to: command }}
  - {{ from: start, label: Success, to: save }}
"#,
                policy
            ))
        };

        let harness = harness();
        harness.commands.fail_next(1);
        let report = run(&fan_out("fail_fast"), &harness, json!({"temperature": 1})).await;
        assert!(matches!(report.outcome, ChainOutcome::Fail(ref failure) if failure.node_id == "command"));

        harness.commands.fail_next(1);
        let report = run(&fan_out("any_success"), &harness, json!({"temperature": 1})).await;
        assert_eq!(report.outcome, ChainOutcome::Ack);
        assert_eq!(report.hops, 3);

        harness.commands.fail_next(1);
        let report = run(&fan_out("all_settled"), &harness, json!({"temperature": 1})).await;
        assert!(!report.outcome.is_ack());
        assert!(!harness.entities.telemetry(&EntityKey::device("acme", "d1")).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_suspends_without_blocking() {
        let chain = compile(
            r#"
id: slow
name: slow
root: wait
nodes:
  - { id: wait, type: delay, delay_ms: 5000 }
  - { id: save, type: save_telemetry }
relations:
  - { from: wait, label: Success, to: save }
"#
        );
        let harness = harness();
        let started = tokio::time::Instant::now();
        let report = run(&chain, &harness, json!({"temperature": 1})).await;
        assert_eq!(report.outcome, ChainOutcome::Ack);
        assert!(started.elapsed() >= std::time::Duration::from_secs(5));
    }
}
