//! Rule chain definitions as loaded from YAML
//!
//! A definition is a list of typed nodes plus labeled relations between them.
//! Definitions are validated and turned into an indexed graph by
//! [`crate::engine::compiled::CompiledChain`].

use std::{collections::BTreeMap, fmt::Display};

use serde::{Deserialize, Serialize};

use crate::domain::{
    error::PipelineError,
    state::{AlertSeverity, AttributeScope}
};

/// Well-known relation labels
pub mod label {
    pub const SUCCESS: &str = "Success";
    pub const FAILURE: &str = "Failure";
    pub const TRUE: &str = "True";
    pub const FALSE: &str = "False";
    pub const OTHER: &str = "Other";
}

/// Rule chain identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChainId(pub String);

impl ChainId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl Display for ChainId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// When a message with several parallel paths is terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CompletionPolicy {
    /// Ack once every path acked, fail as soon as one path fails
    #[default]
    FailFast,
    /// Wait for every path, fail if any path failed
    AllSettled,
    /// Wait for every path, ack if at least one path acked
    AnySuccess
}

/// Typed node configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeConfig {
    /// Boolean template condition, emits `True` or `False`
    Filter { condition: String },
    /// Route by message type; unmatched types go to `Other`
    Switch {
        #[serde(default)]
        routes: BTreeMap<String, String>
    },
    /// Rewrite payload and metadata fields from templates
    Transform {
        #[serde(default)]
        payload:  BTreeMap<String, String>,
        #[serde(default)]
        metadata: BTreeMap<String, String>
    },
    /// Copy durable entity attributes into metadata
    EnrichAttributes {
        #[serde(default)]
        keys:              Vec<String>,
        #[serde(default = "default_prefix")]
        prefix:            String,
        #[serde(default)]
        include_telemetry: bool
    },
    SaveTelemetry,
    SaveAttributes {
        #[serde(default)]
        scope: AttributeScope
    },
    /// Deliver a command to the originating device
    SendCommand {
        method: String,
        /// Template rendering the JSON params; the payload is sent when absent
        #[serde(default)]
        params: Option<String>
    },
    CreateAlert {
        alert_type: String,
        #[serde(default)]
        severity:   AlertSeverity
    },
    /// Drop messages whose id was already seen by this entity
    Deduplicate {
        #[serde(default = "default_window")]
        window: usize
    },
    Log {
        #[serde(default)]
        template: Option<String>
    },
    Delay { delay_ms: u64 },
    Ack,
    Fail {
        #[serde(default)]
        reason: Option<String>
    }
}

fn default_prefix() -> String {
    "attr_".to_string()
}

fn default_window() -> usize {
    1024
}

impl NodeConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            NodeConfig::Filter { .. } => "filter",
            NodeConfig::Switch { .. } => "switch",
            NodeConfig::Transform { .. } => "transform",
            NodeConfig::EnrichAttributes { .. } => "enrich_attributes",
            NodeConfig::SaveTelemetry => "save_telemetry",
            NodeConfig::SaveAttributes { .. } => "save_attributes",
            NodeConfig::SendCommand { .. } => "send_command",
            NodeConfig::CreateAlert { .. } => "create_alert",
            NodeConfig::Deduplicate { .. } => "deduplicate",
            NodeConfig::Log { .. } => "log",
            NodeConfig::Delay { .. } => "delay",
            NodeConfig::Ack => "ack",
            NodeConfig::Fail { .. } => "fail"
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleNodeDef {
    pub id:     String,
    #[serde(default)]
    pub name:   Option<String>,
    #[serde(flatten)]
    pub config: NodeConfig
}

/// `(from, label, to)` edge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationDef {
    pub from:  String,
    pub label: String,
    pub to:    String
}

/// Versioned rule chain graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleChainDef {
    pub id:         ChainId,
    pub name:       String,
    #[serde(default = "default_version")]
    pub version:    u64,
    /// Id of the node every message enters through
    pub root:       String,
    /// Overrides the engine-wide hop budget
    #[serde(default)]
    pub hop_budget: Option<u32>,
    #[serde(default)]
    pub completion: CompletionPolicy,
    pub nodes:      Vec<RuleNodeDef>,
    #[serde(default)]
    pub relations:  Vec<RelationDef>
}

fn default_version() -> u64 {
    1
}

impl RuleChainDef {
    pub fn from_yaml(content: &str) -> Result<Self, PipelineError> {
        serde_yaml::from_str(content)
            .map_err(|e| PipelineError::ChainConfiguration(format!("invalid rule chain definition: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHAIN: &str = r#"
id: thermostat
name: Thermostat
root: hot
completion: all_settled
nodes:
  - id: hot
    type: filter
    condition: "msg.temperature > 80"
  - id: alert
    type: create_alert
    alert_type: HighTemperature
    severity: critical
  - id: done
    type: ack
relations:
  - { from: hot, label: "True", to: alert }
  - { from: hot, label: "False", to: done }
"#;

    #[test]
    fn test_parse_chain_yaml() {
        let chain = RuleChainDef::from_yaml(CHAIN).unwrap();
        assert_eq!(chain.version, 1);
        assert_eq!(chain.completion, CompletionPolicy::AllSettled);
        assert_eq!(chain.nodes.len(), 3);
        assert_eq!(chain.nodes[0].config, NodeConfig::Filter { condition: "msg.temperature > 80".into() });
        assert_eq!(
            chain.nodes[1].config,
            NodeConfig::CreateAlert { alert_type: "HighTemperature".into(), severity: AlertSeverity::Critical }
        );
        assert_eq!(chain.nodes[2].config.kind(), "ack");
        assert_eq!(chain.relations[0].label, label::TRUE);
    }

    #[test]
    fn test_unknown_node_type_is_a_chain_error() {
        let err = RuleChainDef::from_yaml("id: c\nname: c\nroot: a\nnodes:\n  - id: a\n    type: teleport\n").unwrap_err();
        assert!(matches!(err, PipelineError::ChainConfiguration(_)));
    }
}
