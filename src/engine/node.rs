//! Rule node behaviours
//!
//! Nodes are a closed set of variants. Processing a message yields a [`Step`]:
//! either an immediate [`NodeOutcome`] or a pending future for nodes that call
//! collaborators or wait. Pending futures own everything they need so the
//! executor can drive several of them while the chain is suspended.

use std::{
    collections::{BTreeMap, HashSet, VecDeque},
    time::Duration
};

use futures::{FutureExt, future::BoxFuture};
use tracing::{Level, event};
use uuid::Uuid;

use crate::{
    domain::{
        chain::{NodeConfig, label},
        constant::engine,
        error::PipelineError,
        message::Message,
        state::{Alert, AlertSeverity, AttributeScope, DeviceCommand, TelemetryValue}
    },
    engine::template::TemplateSet,
    port::Collaborators
};

/// What a node did with a message
#[derive(Debug)]
pub enum NodeOutcome {
    /// Continue along the given labels
    Emit(Vec<(String, Message)>),
    /// Deterministic failure; routed along `Failure` when connected
    Failure { error: PipelineError, message: Message },
    /// Path finished successfully
    Ack,
    /// Path failed; not routable
    Fail(PipelineError)
}

impl NodeOutcome {
    fn success(message: Message) -> Self {
        NodeOutcome::Emit(vec![(label::SUCCESS.to_string(), message)])
    }

    fn failure(error: PipelineError, message: Message) -> Self {
        NodeOutcome::Failure { error, message }
    }
}

pub enum Step {
    Done(NodeOutcome),
    /// Suspension point; the executor awaits it
    Pending(BoxFuture<'static, NodeOutcome>)
}

/// Node-local state, owned by one node instance of one entity session
#[derive(Debug, Clone, Default)]
pub enum NodeState {
    #[default]
    Stateless,
    Seen(SeenWindow)
}

/// Bounded set of recently seen message ids
#[derive(Debug, Clone, Default)]
pub struct SeenWindow {
    order: VecDeque<Uuid>,
    ids:   HashSet<Uuid>
}

impl SeenWindow {
    /// Returns false when the id was already in the window
    fn insert(&mut self, id: Uuid, capacity: usize) -> bool {
        if !self.ids.insert(id) {
            return false;
        }
        self.order.push_back(id);
        while self.order.len() > capacity.max(1) {
            if let Some(evicted) = self.order.pop_front() {
                self.ids.remove(&evicted);
            }
        }
        true
    }
}

/// Runtime form of a node: templates resolved to names in the chain's [`TemplateSet`]
#[derive(Debug, Clone)]
pub enum RuleNode {
    Filter { condition: String },
    Switch { routes: BTreeMap<String, String> },
    Transform { payload: Vec<(String, String)>, metadata: Vec<(String, String)> },
    EnrichAttributes { keys: Vec<String>, prefix: String, include_telemetry: bool },
    SaveTelemetry,
    SaveAttributes { scope: AttributeScope },
    SendCommand { method: String, params: Option<String> },
    CreateAlert { alert_type: String, severity: AlertSeverity },
    Deduplicate { window: usize },
    Log { template: Option<String> },
    Delay { delay: Duration },
    Ack,
    Fail { reason: String }
}

fn template_name(node_id: &str, field: &str) -> String {
    format!("{}:{}", node_id, field)
}

impl RuleNode {
    /// Build the runtime node, registering its templates
    pub fn compile(node_id: &str, config: &NodeConfig, templates: &mut TemplateSet) -> Result<Self, PipelineError> {
        let node = match config {
            NodeConfig::Filter { condition } => {
                let name = template_name(node_id, "condition");
                templates.add_condition(&name, condition)?;
                RuleNode::Filter { condition: name }
            }
            NodeConfig::Switch { routes } => RuleNode::Switch { routes: routes.clone() },
            NodeConfig::Transform { payload, metadata } => {
                let mut compile_fields = |section: &str, fields: &BTreeMap<String, String>| {
                    fields
                        .iter()
                        .map(|(field, source)| {
                            let name = template_name(node_id, &format!("{}.{}", section, field));
                            templates.add(&name, source).map(|_| (field.clone(), name))
                        })
                        .collect::<Result<Vec<_>, PipelineError>>()
                };
                let payload = compile_fields("payload", payload)?;
                let metadata = compile_fields("metadata", metadata)?;
                RuleNode::Transform { payload, metadata }
            }
            NodeConfig::EnrichAttributes { keys, prefix, include_telemetry } => RuleNode::EnrichAttributes {
                keys:              keys.clone(),
                prefix:            prefix.clone(),
                include_telemetry: *include_telemetry
            },
            NodeConfig::SaveTelemetry => RuleNode::SaveTelemetry,
            NodeConfig::SaveAttributes { scope } => RuleNode::SaveAttributes { scope: *scope },
            NodeConfig::SendCommand { method, params } => {
                let params = match params {
                    Some(source) => {
                        let name = template_name(node_id, "params");
                        templates.add(&name, source)?;
                        Some(name)
                    }
                    None => None
                };
                RuleNode::SendCommand { method: method.clone(), params }
            }
            NodeConfig::CreateAlert { alert_type, severity } => {
                RuleNode::CreateAlert { alert_type: alert_type.clone(), severity: *severity }
            }
            NodeConfig::Deduplicate { window } => {
                if *window == 0 {
                    return Err(PipelineError::ChainConfiguration(format!(
                        "node {}: deduplicate window must be positive",
                        node_id
                    )));
                }
                RuleNode::Deduplicate { window: *window }
            }
            NodeConfig::Log { template } => {
                let template = match template {
                    Some(source) => {
                        let name = template_name(node_id, "log");
                        templates.add(&name, source)?;
                        Some(name)
                    }
                    None => None
                };
                RuleNode::Log { template }
            }
            NodeConfig::Delay { delay_ms } => RuleNode::Delay { delay: Duration::from_millis(*delay_ms) },
            NodeConfig::Ack => RuleNode::Ack,
            NodeConfig::Fail { reason } => RuleNode::Fail {
                reason: reason.clone().unwrap_or_else(|| format!("message rejected by node {}", node_id))
            }
        };
        Ok(node)
    }

    pub fn initial_state(&self) -> NodeState {
        match self {
            RuleNode::Deduplicate { .. } => NodeState::Seen(SeenWindow::default()),
            _ => NodeState::Stateless
        }
    }

    pub fn process(
        &self,
        node_id: &str,
        mut message: Message,
        state: &mut NodeState,
        templates: &TemplateSet,
        collaborators: &Collaborators
    ) -> Step {
        match self {
            RuleNode::Filter { condition } => Step::Done(match templates.evaluate(condition, &message) {
                Ok(true) => NodeOutcome::Emit(vec![(label::TRUE.to_string(), message)]),
                Ok(false) => NodeOutcome::Emit(vec![(label::FALSE.to_string(), message)]),
                Err(error) => NodeOutcome::failure(error, message)
            }),

            RuleNode::Switch { routes } => {
                let route = routes.get(message.msg_type.as_str()).cloned().unwrap_or_else(|| label::OTHER.to_string());
                Step::Done(NodeOutcome::Emit(vec![(route, message)]))
            }

            RuleNode::Transform { payload, metadata } => {
                Step::Done(match Self::transform(message.clone(), payload, metadata, templates) {
                    Ok(transformed) => NodeOutcome::success(transformed),
                    Err(error) => NodeOutcome::failure(error, message)
                })
            }

            RuleNode::EnrichAttributes { keys, prefix, include_telemetry } => {
                let entities = collaborators.entities.clone();
                let keys = keys.clone();
                let prefix = prefix.clone();
                let include_telemetry = *include_telemetry;
                Step::Pending(
                    async move {
                        let entity_state = match entities.read_entity_state(&message.originator).await {
                            Ok(entity_state) => entity_state,
                            Err(error) => return NodeOutcome::Fail(error)
                        };
                        let wanted = |name: &String| keys.is_empty() || keys.contains(name);
                        for (name, value) in entity_state.attributes.iter().filter(|(name, _)| wanted(*name)) {
                            message.metadata.insert(format!("{}{}", prefix, name), json_to_metadata(value));
                        }
                        if include_telemetry {
                            let latest = entity_state.latest_telemetry.iter().filter(|(name, _)| wanted(*name));
                            for (name, value) in latest {
                                message.metadata.insert(format!("{}{}", prefix, name), json_to_metadata(&value.value));
                            }
                        }
                        NodeOutcome::success(message)
                    }
                    .boxed()
                )
            }

            RuleNode::SaveTelemetry => {
                let Some(fields) = message.payload.as_object() else {
                    let error = PipelineError::Evaluation("telemetry payload must be a JSON object".to_string());
                    return Step::Done(NodeOutcome::failure(error, message));
                };
                let ts = message.ts_millis();
                let values: Vec<TelemetryValue> = fields
                    .iter()
                    .map(|(key, value)| TelemetryValue { ts, key: key.clone(), value: value.clone() })
                    .collect();
                let entities = collaborators.entities.clone();
                Step::Pending(
                    async move {
                        match entities.append_telemetry(&message.originator, values).await {
                            Ok(()) => NodeOutcome::success(message),
                            Err(error) => NodeOutcome::Fail(error)
                        }
                    }
                    .boxed()
                )
            }

            RuleNode::SaveAttributes { scope } => {
                let Some(fields) = message.payload.as_object() else {
                    let error = PipelineError::Evaluation("attributes payload must be a JSON object".to_string());
                    return Step::Done(NodeOutcome::failure(error, message));
                };
                let attributes: BTreeMap<String, serde_json::Value> =
                    fields.iter().map(|(key, value)| (key.clone(), value.clone())).collect();
                let entities = collaborators.entities.clone();
                let scope = *scope;
                Step::Pending(
                    async move {
                        match entities.write_entity_attribute(&message.originator, scope, attributes).await {
                            Ok(()) => NodeOutcome::success(message),
                            Err(error) => NodeOutcome::Fail(error)
                        }
                    }
                    .boxed()
                )
            }

            RuleNode::SendCommand { method, params } => {
                let params = match params {
                    Some(name) => match templates
                        .render(name, &message)
                        .and_then(|rendered| Ok(serde_json::from_str::<serde_json::Value>(&rendered)?))
                    {
                        Ok(params) => params,
                        Err(error) => return Step::Done(NodeOutcome::failure(error, message))
                    },
                    None => message.payload.clone()
                };
                let command = DeviceCommand { method: method.clone(), params, correlation_id: message.id };
                let commands = collaborators.commands.clone();
                Step::Pending(
                    async move {
                        match commands.deliver(&message.originator, command).await {
                            Ok(()) => NodeOutcome::success(message),
                            Err(error) => NodeOutcome::Fail(error)
                        }
                    }
                    .boxed()
                )
            }

            RuleNode::CreateAlert { alert_type, severity } => {
                let alert = Alert {
                    originator: message.originator.clone(),
                    alert_type: alert_type.clone(),
                    severity:   *severity,
                    message_id: message.id,
                    details:    message.payload.clone(),
                    created_at: message.ts
                };
                let entities = collaborators.entities.clone();
                Step::Pending(
                    async move {
                        match entities.create_alert(alert).await {
                            Ok(()) => NodeOutcome::success(message),
                            Err(error) => NodeOutcome::Fail(error)
                        }
                    }
                    .boxed()
                )
            }

            RuleNode::Deduplicate { window } => {
                let NodeState::Seen(seen) = state else {
                    *state = NodeState::Seen(SeenWindow::default());
                    return self.process(node_id, message, state, templates, collaborators);
                };
                if seen.insert(message.id, *window) {
                    Step::Done(NodeOutcome::success(message))
                } else {
                    Step::Done(NodeOutcome::Ack)
                }
            }

            RuleNode::Log { template } => {
                let text = match template {
                    Some(name) => templates.render(name, &message),
                    None => serde_json::to_string(&message.payload).map_err(PipelineError::from)
                };
                match text {
                    Ok(text) => {
                        event!(Level::INFO, event = engine::NODE_LOG, node = %node_id,
                               entity = %message.originator, text = %text);
                        Step::Done(NodeOutcome::success(message))
                    }
                    Err(error) => Step::Done(NodeOutcome::failure(error, message))
                }
            }

            RuleNode::Delay { delay } => {
                let delay = *delay;
                Step::Pending(
                    async move {
                        tokio::time::sleep(delay).await;
                        NodeOutcome::success(message)
                    }
                    .boxed()
                )
            }

            RuleNode::Ack => Step::Done(NodeOutcome::Ack),

            RuleNode::Fail { reason } => Step::Done(NodeOutcome::Fail(PipelineError::Rejected(reason.clone())))
        }
    }

    fn transform(
        mut message: Message,
        payload: &[(String, String)],
        metadata: &[(String, String)],
        templates: &TemplateSet
    ) -> Result<Message, PipelineError> {
        let mut rendered_payload = Vec::with_capacity(payload.len());
        for (field, name) in payload {
            let rendered = templates.render(name, &message)?;
            let value = serde_json::from_str(&rendered).unwrap_or(serde_json::Value::String(rendered));
            rendered_payload.push((field.clone(), value));
        }
        let mut rendered_metadata = Vec::with_capacity(metadata.len());
        for (field, name) in metadata {
            rendered_metadata.push((field.clone(), templates.render(name, &message)?));
        }

        if !rendered_payload.is_empty() {
            let Some(object) = message.payload.as_object_mut() else {
                return Err(PipelineError::Evaluation("transform payload must be a JSON object".to_string()));
            };
            object.extend(rendered_payload);
        }
        message.metadata.extend(rendered_metadata);
        Ok(message)
    }
}

/// Metadata is flat strings: strings stay unquoted, everything else is JSON
fn json_to_metadata(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(text) => text.clone(),
        other => other.to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::{
        adapter::persistence::{InMemoryEntityStore, RecordingCommandGateway},
        domain::{entity::EntityKey, message::MessageType},
        port::persistence::EntityStore
    };

    fn collaborators() -> (Arc<InMemoryEntityStore>, Collaborators) {
        let entities = Arc::new(InMemoryEntityStore::new());
        let collaborators =
            Collaborators { entities: entities.clone(), commands: Arc::new(RecordingCommandGateway::new()) };
        (entities, collaborators)
    }

    async fn run(node: &RuleNode, message: Message, state: &mut NodeState, templates: &TemplateSet) -> NodeOutcome {
        let (_, collaborators) = collaborators();
        match node.process("n", message, state, templates, &collaborators) {
            Step::Done(outcome) => outcome,
            Step::Pending(future) => future.await
        }
    }

    fn labels(outcome: &NodeOutcome) -> Vec<String> {
        match outcome {
            NodeOutcome::Emit(emitted) => emitted.iter().map(|(label, _)| label.clone()).collect(),
            other => panic!("expected emit, got {:?}", other)
        }
    }

    #[tokio::test]
    async fn test_switch_routes_by_message_type() {
        let node = RuleNode::Switch { routes: BTreeMap::from([("RPC_CALL".to_string(), "Rpc".to_string())]) };
        let templates = TemplateSet::new();
        let key = EntityKey::device("acme", "d1");

        let rpc = Message::new(key.clone(), MessageType::RpcCall, json!({}));
        assert_eq!(labels(&run(&node, rpc, &mut NodeState::Stateless, &templates).await), vec!["Rpc"]);
        let telemetry = Message::telemetry(key, json!({}));
        assert_eq!(labels(&run(&node, telemetry, &mut NodeState::Stateless, &templates).await), vec![label::OTHER]);
    }

    #[tokio::test]
    async fn test_transform_rewrites_payload_and_metadata() {
        let mut templates = TemplateSet::new();
        let config = NodeConfig::Transform {
            payload:  BTreeMap::from([("fahrenheit".to_string(), "{{ msg.celsius * 9 / 5 + 32 }}".to_string())]),
            metadata: BTreeMap::from([("unit".to_string(), "F".to_string())])
        };
        let node = RuleNode::compile("t", &config, &mut templates).unwrap();
        let message = Message::telemetry(EntityKey::device("acme", "d1"), json!({"celsius": 100}));

        match run(&node, message, &mut NodeState::Stateless, &templates).await {
            NodeOutcome::Emit(emitted) => {
                assert_eq!(emitted[0].1.payload["fahrenheit"], json!(212));
                assert_eq!(emitted[0].1.metadata["unit"], "F");
            }
            other => panic!("unexpected {:?}", other)
        }
    }

    #[tokio::test]
    async fn test_deduplicate_acks_repeated_ids() {
        let node = RuleNode::Deduplicate { window: 2 };
        let templates = TemplateSet::new();
        let mut state = node.initial_state();
        let message = Message::telemetry(EntityKey::device("acme", "d1"), json!({}));

        assert!(matches!(run(&node, message.clone(), &mut state, &templates).await, NodeOutcome::Emit(_)));
        assert!(matches!(run(&node, message.clone(), &mut state, &templates).await, NodeOutcome::Ack));

        for _ in 0..2 {
            let other = Message::telemetry(EntityKey::device("acme", "d1"), json!({}));
            run(&node, other, &mut state, &templates).await;
        }
        assert!(matches!(run(&node, message, &mut state, &templates).await, NodeOutcome::Emit(_)));
    }

    #[tokio::test]
    async fn test_enrich_reads_entity_state() {
        let (entities, collaborators) = collaborators();
        let key = EntityKey::device("acme", "d1");
        entities
            .write_entity_attribute(&key, AttributeScope::Server, BTreeMap::from([("threshold".into(), json!(80))]))
            .await
            .unwrap();

        let node = RuleNode::EnrichAttributes { keys: vec![], prefix: "attr_".into(), include_telemetry: false };
        let message = Message::telemetry(key, json!({}));
        let step = node.process("e", message, &mut NodeState::Stateless, &TemplateSet::new(), &collaborators);
        let Step::Pending(future) = step else { panic!("enrichment must suspend") };
        match future.await {
            NodeOutcome::Emit(emitted) => assert_eq!(emitted[0].1.metadata["attr_threshold"], "80"),
            other => panic!("unexpected {:?}", other)
        }
    }

    #[tokio::test]
    async fn test_save_telemetry_rejects_non_object_payload() {
        let message = Message::telemetry(EntityKey::device("acme", "d1"), json!(42));
        let outcome = run(&RuleNode::SaveTelemetry, message, &mut NodeState::Stateless, &TemplateSet::new()).await;
        assert!(matches!(outcome, NodeOutcome::Failure { error: PipelineError::Evaluation(_), .. }));
    }

    #[tokio::test]
    async fn test_fail_node_is_not_retryable() {
        let node = RuleNode::Fail { reason: "blocked device".into() };
        let message = Message::telemetry(EntityKey::device("acme", "d1"), json!({}));
        match run(&node, message, &mut NodeState::Stateless, &TemplateSet::new()).await {
            NodeOutcome::Fail(error) => assert!(!error.is_retryable()),
            other => panic!("unexpected {:?}", other)
        }
    }
}
