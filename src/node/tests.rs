//! Cluster scenarios: several in-process nodes sharing one queue, one
//! assignment store and one membership feed.

use std::{
    collections::{BTreeMap, BTreeSet},
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering}
    },
    time::Duration
};

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Mutex;

use super::*;
use crate::{
    adapter::{
        assignment::InMemoryAssignmentStore,
        dead_letter::InMemoryDeadLetterSink,
        membership::LocalMembership,
        persistence::{InMemoryEntityStore, RecordingCommandGateway},
        queue::InMemoryQueue
    },
    context::RetryPolicy,
    domain::{
        chain::{ChainId, RuleChainDef},
        entity::TenantId,
        state::{Alert, AttributeScope, EntityState, TelemetryValue}
    },
    port::persistence::EntityStore
};

const GROUP: &str = "rule-engine";
const TENANT: &str = "acme";

const THERMOSTAT: &str = r#"
id: thermostat
name: Thermostat
root: save
nodes:
  - { id: save, type: save_telemetry }
  - { id: hot, type: filter, condition: "msg.temperature > 80" }
  - { id: alert, type: create_alert, alert_type: HighTemperature, severity: critical }
  - { id: ok, type: ack }
relations:
  - { from: save, label: Success, to: hot }
  - { from: hot, label: "True", to: alert }
  - { from: hot, label: "False", to: ok }
"#;

/// Entity store that records the `seq` of every telemetry write and can panic on demand
#[derive(Default)]
struct ObservingStore {
    inner:    InMemoryEntityStore,
    observed: Mutex<Vec<(EntityKey, u64)>>,
    writes:   AtomicU32,
    panics:   AtomicU32
}

impl ObservingStore {
    fn panic_next(&self, count: u32) {
        self.panics.store(count, Ordering::SeqCst);
    }

    async fn sequence(&self, key: &EntityKey) -> Vec<u64> {
        self.observed.lock().await.iter().filter(|(observed, _)| observed == key).map(|(_, seq)| *seq).collect()
    }

    async fn observed(&self) -> usize {
        self.observed.lock().await.len()
    }
}

#[async_trait]
impl EntityStore for ObservingStore {
    async fn read_entity_state(&self, key: &EntityKey) -> Result<EntityState, PipelineError> {
        self.inner.read_entity_state(key).await
    }

    async fn append_telemetry(&self, key: &EntityKey, values: Vec<TelemetryValue>) -> Result<(), PipelineError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if self.panics.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1)).is_ok() {
            panic!("storage driver crashed");
        }
        if let Some(seq) = values.iter().find(|value| value.key == "seq").and_then(|value| value.value.as_u64()) {
            self.observed.lock().await.push((key.clone(), seq));
        }
        self.inner.append_telemetry(key, values).await
    }

    async fn write_entity_attribute(
        &self,
        key: &EntityKey,
        scope: AttributeScope,
        attributes: BTreeMap<String, serde_json::Value>
    ) -> Result<(), PipelineError> {
        self.inner.write_entity_attribute(key, scope, attributes).await
    }

    async fn create_alert(&self, alert: Alert) -> Result<(), PipelineError> {
        self.inner.create_alert(alert).await
    }
}

struct Cluster {
    queue:        Arc<InMemoryQueue>,
    store:        Arc<InMemoryAssignmentStore>,
    membership:   Arc<LocalMembership>,
    dead_letters: Arc<InMemoryDeadLetterSink>,
    entities:     Arc<ObservingStore>,
    commands:     Arc<RecordingCommandGateway>,
    registry:     Arc<ChainRegistry>
}

impl Cluster {
    async fn new(partitions: u32, chain: &str) -> Self {
        let registry = Arc::new(ChainRegistry::new(10));
        let installed = registry.install(&RuleChainDef::from_yaml(chain).unwrap()).await.unwrap();
        registry.bind(TenantId::new(TENANT), None, installed.id.clone()).await.unwrap();
        Self {
            queue: Arc::new(InMemoryQueue::new(partitions)),
            store: Arc::new(InMemoryAssignmentStore::new()),
            membership: Arc::new(LocalMembership::new()),
            dead_letters: Arc::new(InMemoryDeadLetterSink::new()),
            entities: Arc::new(ObservingStore::default()),
            commands: Arc::new(RecordingCommandGateway::new()),
            registry
        }
    }

    fn settings(&self, node: &str) -> NodeSettings {
        NodeSettings {
            node_id:            NodeId::new(node),
            max_payload_bytes:  DEFAULT_MAX_PAYLOAD_BYTES,
            strategy:           AssignmentStrategy::RoundRobin,
            heartbeat_interval: Duration::from_millis(20),
            lease_timeout:      Duration::from_millis(200),
            node_timeout:       Duration::from_millis(500),
            consumer:           ConsumerSettings {
                group:            GROUP.to_string(),
                fetch_batch:      8,
                in_flight_window: 16,
                poll_interval:    Duration::from_millis(10),
                restart_backoff:  Duration::from_millis(20),
                shutdown_grace:   Duration::from_secs(2)
            },
            actors:             ActorSettings {
                retry:              RetryPolicy {
                    max_attempts:    3,
                    backoff_initial: Duration::from_millis(5),
                    backoff_max:     Duration::from_millis(20)
                },
                processing_timeout: Duration::from_secs(2),
                idle_timeout:       Duration::from_secs(60),
                sweep_interval:     Duration::from_secs(1)
            }
        }
    }

    async fn node(&self, id: &str) -> PipelineNode {
        let deps = NodeDeps {
            queue:         self.queue.clone(),
            assignments:   self.store.clone(),
            membership:    self.membership.clone(),
            dead_letters:  self.dead_letters.clone(),
            collaborators: Collaborators { entities: self.entities.clone(), commands: self.commands.clone() },
            registry:      self.registry.clone()
        };
        PipelineNode::start(self.settings(id), deps).await.unwrap()
    }

    /// A device whose records land on `partition`
    fn device_on(&self, partition: PartitionId) -> EntityKey {
        (0..)
            .map(|i| EntityKey::device(TENANT, format!("device-{}", i)))
            .find(|key| self.queue.partition_for(&key.routing_key()) == partition)
            .unwrap()
    }

    async fn publish(&self, key: &EntityKey, payload: serde_json::Value) {
        let submitter = Submitter::new(self.queue.clone(), DEFAULT_MAX_PAYLOAD_BYTES);
        let result = submitter.submit(key.clone(), MessageType::PostTelemetry, payload).await.unwrap();
        assert!(result.is_accepted());
    }

    /// Every published record is committed
    async fn fully_committed(&self) -> bool {
        for partition in PartitionId::all(self.queue.partition_count()) {
            let end = self.queue.end_offset(partition).await.unwrap();
            if self.queue.committed(GROUP, partition).await.unwrap() < end {
                return false;
            }
        }
        true
    }
}

async fn eventually<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition().await
}

/// Order of first deliveries; redeliveries after a handoff repeat a suffix
fn first_seen(sequence: &[u64]) -> Vec<u64> {
    let mut seen = BTreeSet::new();
    sequence.iter().copied().filter(|seq| seen.insert(*seq)).collect()
}

#[tokio::test]
async fn test_ack_commits_exactly_once() {
    let cluster = Cluster::new(2, THERMOSTAT).await;
    let node = cluster.node("a").await;
    let device = cluster.device_on(PartitionId(1));

    cluster.publish(&device, json!({"temperature": 21, "seq": 1})).await;
    assert!(eventually(Duration::from_secs(5), || cluster.fully_committed()).await);
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(cluster.queue.commit_history(GROUP, PartitionId(1)).await, vec![1]);
    assert_eq!(cluster.entities.sequence(&device).await, vec![1]);
    assert_eq!(node.health().await.unwrap().processed, 1);
    node.shutdown().await;
}

#[tokio::test]
async fn test_filter_alert_in_order_across_rebalance() {
    let cluster = Cluster::new(4, THERMOSTAT).await;
    let devices: Vec<EntityKey> = PartitionId::all(4).map(|partition| cluster.device_on(partition)).collect();
    let a = cluster.node("a").await;
    let owner = &a;
    let assigned = move || async move { owner.owned_partitions().await.unwrap().len() == 4 };
    assert!(eventually(Duration::from_secs(5), assigned).await);

    let temperatures = [50, 95, 60, 99, 20, 85];
    for (seq, temperature) in temperatures.iter().enumerate().take(3) {
        for device in &devices {
            cluster.publish(device, json!({"temperature": temperature, "seq": seq as u64 + 1})).await;
        }
    }

    let b = cluster.node("b").await;
    for (seq, temperature) in temperatures.iter().enumerate().skip(3) {
        for device in &devices {
            cluster.publish(device, json!({"temperature": temperature, "seq": seq as u64 + 1})).await;
        }
    }

    let joiner = &b;
    let rebalanced = move || async move { joiner.owned_partitions().await.unwrap().len() == 2 };
    assert!(eventually(Duration::from_secs(10), rebalanced).await);
    assert!(eventually(Duration::from_secs(10), || cluster.fully_committed()).await);

    let owned_a = a.owned_partitions().await.unwrap();
    let owned_b = b.owned_partitions().await.unwrap();
    assert!(owned_a.is_disjoint(&owned_b));
    assert_eq!(owned_a.len() + owned_b.len(), 4);

    for device in &devices {
        assert_eq!(first_seen(&cluster.entities.sequence(device).await), vec![1, 2, 3, 4, 5, 6]);
    }
    let mut alerted: BTreeMap<EntityKey, usize> = BTreeMap::new();
    for alert in cluster.entities.inner.alerts().await {
        *alerted.entry(alert.originator).or_default() += 1;
    }
    assert!(devices.iter().all(|device| alerted.get(device) == Some(&3)));
    assert!(cluster.dead_letters.entries().await.unwrap().is_empty());

    b.shutdown().await;
    a.shutdown().await;
}

#[tokio::test]
async fn test_isolated_node_fences_before_takeover() {
    let cluster = Cluster::new(2, THERMOSTAT).await;
    let a = cluster.node("a").await;
    let b = cluster.node("b").await;
    let (first, second) = (&a, &b);
    let settled = move || async move {
        first.owned_partitions().await.unwrap().len() == 1 && second.owned_partitions().await.unwrap().len() == 1
    };
    assert!(eventually(Duration::from_secs(10), settled).await);
    let lost = *a.owned_partitions().await.unwrap().first().unwrap();

    cluster.store.isolate(a.id()).await;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let owned_a = a.owned_partitions().await.unwrap();
        let owned_b = b.owned_partitions().await.unwrap();
        assert!(owned_a.is_disjoint(&owned_b), "split ownership: a={:?} b={:?}", owned_a, owned_b);
        if owned_b.len() == 2 {
            assert!(owned_a.is_empty());
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "partition {} never moved", lost);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let device = cluster.device_on(lost);
    cluster.publish(&device, json!({"temperature": 30, "seq": 1})).await;
    assert!(eventually(Duration::from_secs(5), || cluster.fully_committed()).await);
    assert_eq!(cluster.entities.sequence(&device).await, vec![1]);

    cluster.store.heal(a.id()).await;
    assert!(eventually(Duration::from_secs(10), settled).await);
    assert!(a.owned_partitions().await.unwrap().is_disjoint(&b.owned_partitions().await.unwrap()));

    b.shutdown().await;
    a.shutdown().await;
}

#[tokio::test]
async fn test_exhausted_retries_dead_letter_once_and_commit() {
    let chain = r#"
id: commands
name: Commands
root: reboot
nodes:
  - { id: reboot, type: send_command, method: reboot }
"#;
    let cluster = Cluster::new(1, chain).await;
    cluster.commands.fail_next(10);
    let node = cluster.node("a").await;

    cluster.publish(&EntityKey::device(TENANT, "d1"), json!({"seq": 1})).await;
    assert!(eventually(Duration::from_secs(5), || cluster.fully_committed()).await);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let entries = cluster.dead_letters.entries().await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].attempt_count, 3);
    assert_eq!(entries[0].attempts.len(), 3);
    assert_eq!(entries[0].failing_node.as_deref(), Some("reboot"));
    assert_eq!(entries[0].chain_id, Some(ChainId::new("commands")));
    assert_eq!(cluster.queue.commit_history(GROUP, PartitionId(0)).await, vec![1]);
    assert!(cluster.commands.delivered().await.is_empty());
    node.shutdown().await;
}

#[tokio::test]
async fn test_chain_loop_is_dead_lettered_without_retry() {
    let chain = r#"
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
"#;
    let cluster = Cluster::new(1, chain).await;
    let node = cluster.node("a").await;

    cluster.publish(&EntityKey::device(TENANT, "d1"), json!({"seq": 1})).await;
    assert!(eventually(Duration::from_secs(5), || cluster.fully_committed()).await);

    let entries = cluster.dead_letters.entries().await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].reason, "chain loop exceeded after 10 hops");
    assert_eq!(entries[0].attempt_count, 1);
    assert_eq!(node.actors().stats().dead_lettered(), 1);
    node.shutdown().await;
}

#[tokio::test]
async fn test_crashes_are_retried_until_success() {
    let cluster = Cluster::new(1, THERMOSTAT).await;
    cluster.entities.panic_next(2);
    let node = cluster.node("a").await;
    let device = EntityKey::device(TENANT, "d1");

    cluster.publish(&device, json!({"temperature": 40, "seq": 1})).await;
    assert!(eventually(Duration::from_secs(5), || cluster.fully_committed()).await);

    assert_eq!(cluster.entities.writes.load(Ordering::SeqCst), 3);
    assert_eq!(cluster.entities.sequence(&device).await, vec![1]);
    assert_eq!(node.actors().stats().crashes(), 2);
    assert_eq!(node.actors().stats().processed(), 1);
    assert!(cluster.dead_letters.entries().await.unwrap().is_empty());
    node.shutdown().await;
}

#[tokio::test]
async fn test_replay_leaves_the_same_entity_state() {
    let cluster = Cluster::new(1, THERMOSTAT).await;
    let device = EntityKey::device(TENANT, "d1");
    let node = cluster.node("a").await;
    for (seq, temperature) in [(1, 50), (2, 95), (3, 70)] {
        cluster.publish(&device, json!({"temperature": temperature, "seq": seq})).await;
    }
    assert!(eventually(Duration::from_secs(5), || cluster.fully_committed()).await);
    let telemetry = cluster.entities.inner.telemetry(&device).await;
    let alerts = cluster.entities.inner.alerts().await;
    node.shutdown().await;

    cluster.queue.seek(GROUP, PartitionId(0), 0).await.unwrap();
    let node = cluster.node("a").await;
    let entities = &cluster.entities;
    assert!(eventually(Duration::from_secs(5), move || async move { entities.observed().await == 6 }).await);
    assert!(eventually(Duration::from_secs(5), || cluster.fully_committed()).await);

    assert_eq!(cluster.entities.inner.telemetry(&device).await, telemetry);
    assert_eq!(cluster.entities.inner.alerts().await, alerts);
    assert_eq!(cluster.entities.sequence(&device).await, vec![1, 2, 3, 1, 2, 3]);
    node.shutdown().await;
}
