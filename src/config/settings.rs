use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration
};

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::{
    actor::ActorSettings,
    adapter::queue::QueueBackend,
    consumer::ConsumerSettings,
    context::RetryPolicy,
    domain::{
        assignment::NodeId,
        chain::ChainId,
        entity::{EntityType, TenantId},
        error::PipelineError
    },
    engine::ChainRegistry,
    node::{DEFAULT_MAX_PAYLOAD_BYTES, NodeSettings},
    ownership::AssignmentStrategy
};

/// Durations are written as milliseconds
mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Node configuration, loaded from YAML
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub node:             NodeSection,
    pub queue:            QueueSection,
    pub ownership:        OwnershipSection,
    pub actors:           ActorSection,
    pub engine:           EngineSection,
    #[serde(rename = "shutdown_grace_ms", with = "millis")]
    pub shutdown_grace:   Duration,
    pub log_level:        String,
    /// JSON-lines dead-letter file; dead letters stay in memory when unset
    pub dead_letter_path: Option<PathBuf>,
    pub chains:           ChainSection
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    /// Defaults to the host name
    pub id:                Option<String>,
    pub group:             String,
    pub max_payload_bytes: usize
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSection {
    pub backend:          QueueBackend,
    pub partitions:       u32,
    pub path:             Option<PathBuf>,
    pub fetch_batch:      usize,
    pub in_flight_window: usize,
    #[serde(rename = "poll_interval_ms", with = "millis")]
    pub poll_interval:    Duration,
    #[serde(rename = "restart_backoff_ms", with = "millis")]
    pub restart_backoff:  Duration
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OwnershipSection {
    pub strategy:           AssignmentStrategy,
    #[serde(rename = "heartbeat_interval_ms", with = "millis")]
    pub heartbeat_interval: Duration,
    #[serde(rename = "lease_timeout_ms", with = "millis")]
    pub lease_timeout:      Duration,
    #[serde(rename = "node_timeout_ms", with = "millis")]
    pub node_timeout:       Duration
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActorSection {
    #[serde(rename = "idle_timeout_ms", with = "millis")]
    pub idle_timeout:    Duration,
    #[serde(rename = "sweep_interval_ms", with = "millis")]
    pub sweep_interval:  Duration,
    pub max_attempts:    u32,
    #[serde(rename = "backoff_initial_ms", with = "millis")]
    pub backoff_initial: Duration,
    #[serde(rename = "backoff_max_ms", with = "millis")]
    pub backoff_max:     Duration
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    pub hop_budget:         u32,
    #[serde(rename = "processing_timeout_ms", with = "millis")]
    pub processing_timeout: Duration
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainSection {
    /// Rule chain YAML files, relative paths resolve against the config file
    pub files:    Vec<PathBuf>,
    pub bindings: Vec<ChainBinding>
}

/// Binds a chain to a tenant, or to one entity type of the tenant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainBinding {
    pub tenant:      String,
    #[serde(default)]
    pub entity_type: Option<EntityType>,
    pub chain:       String
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            node:             NodeSection::default(),
            queue:            QueueSection::default(),
            ownership:        OwnershipSection::default(),
            actors:           ActorSection::default(),
            engine:           EngineSection::default(),
            shutdown_grace:   Duration::from_secs(10),
            log_level:        "info".to_string(),
            dead_letter_path: None,
            chains:           ChainSection::default()
        }
    }
}

impl Default for NodeSection {
    fn default() -> Self {
        Self { id: None, group: "rule-engine".to_string(), max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES }
    }
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            backend:          QueueBackend::InMemory,
            partitions:       8,
            path:             None,
            fetch_batch:      64,
            in_flight_window: 256,
            poll_interval:    Duration::from_millis(50),
            restart_backoff:  Duration::from_millis(500)
        }
    }
}

impl Default for OwnershipSection {
    fn default() -> Self {
        Self {
            strategy:           AssignmentStrategy::Rendezvous,
            heartbeat_interval: Duration::from_secs(1),
            lease_timeout:      Duration::from_secs(5),
            node_timeout:       Duration::from_secs(10)
        }
    }
}

impl Default for ActorSection {
    fn default() -> Self {
        Self {
            idle_timeout:    Duration::from_secs(300),
            sweep_interval:  Duration::from_secs(30),
            max_attempts:    3,
            backoff_initial: Duration::from_millis(100),
            backoff_max:     Duration::from_secs(5)
        }
    }
}

impl Default for EngineSection {
    fn default() -> Self {
        Self { hop_budget: 32, processing_timeout: Duration::from_secs(30) }
    }
}

/// Get the project directories for cross-platform config path resolution
pub fn get_project_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from("", "", "pipeline-node").context("Failed to determine project directories")
}

/// Get the default config file path
pub fn get_config_file_path() -> Result<PathBuf> {
    let project_dirs = get_project_dirs()?;
    Ok(project_dirs.config_dir().join("config.yaml"))
}

fn host_name() -> String {
    ["HOSTNAME", "COMPUTERNAME"]
        .iter()
        .filter_map(|name| std::env::var(name).ok())
        .find(|value| !value.trim().is_empty())
        .unwrap_or_else(|| "pipeline-node".to_string())
}

impl PipelineConfig {
    /// Load the configuration.
    ///
    /// An explicit path must exist. Without one the default location is used,
    /// falling back to built-in defaults when nothing is there.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (config_path, required) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => (get_config_file_path()?, false)
        };

        if !config_path.exists() {
            if required {
                anyhow::bail!("Config file not found: {}", config_path.display());
            }
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;
        let mut config = Self::from_yaml(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;
        if let Some(base) = config_path.parent() {
            config.resolve_paths(base);
        }
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn resolve_paths(&mut self, base: &Path) {
        for file in self.chains.files.iter_mut() {
            if file.is_relative() {
                *file = base.join(&*file);
            }
        }
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        let invalid = |reason: &str| Err(PipelineError::Configuration(reason.to_string()));

        if self.queue.partitions == 0 {
            return invalid("queue.partitions must be positive");
        }
        if self.queue.backend == QueueBackend::RocksDb && self.queue.path.is_none() {
            return invalid("queue.path is required for the rocksdb backend");
        }
        if self.queue.fetch_batch == 0 || self.queue.in_flight_window == 0 {
            return invalid("queue.fetch_batch and queue.in_flight_window must be positive");
        }
        if self.queue.poll_interval.is_zero() {
            return invalid("queue.poll_interval_ms must be positive");
        }
        if self.actors.sweep_interval.is_zero() {
            return invalid("actors.sweep_interval_ms must be positive");
        }
        if self.ownership.heartbeat_interval.is_zero() {
            return invalid("ownership.heartbeat_interval_ms must be positive");
        }
        if self.ownership.lease_timeout >= self.ownership.node_timeout {
            return invalid("ownership.lease_timeout_ms must be below ownership.node_timeout_ms");
        }
        if self.actors.max_attempts == 0 {
            return invalid("actors.max_attempts must be positive");
        }
        if self.actors.backoff_initial > self.actors.backoff_max {
            return invalid("actors.backoff_initial_ms must not exceed actors.backoff_max_ms");
        }
        if self.engine.hop_budget == 0 {
            return invalid("engine.hop_budget must be positive");
        }
        if self.node.group.trim().is_empty() {
            return invalid("node.group must not be empty");
        }
        Ok(())
    }

    pub fn node_id(&self) -> NodeId {
        NodeId::new(self.node.id.clone().unwrap_or_else(host_name))
    }

    pub fn node_settings(&self) -> NodeSettings {
        NodeSettings {
            node_id:            self.node_id(),
            max_payload_bytes:  self.node.max_payload_bytes,
            strategy:           self.ownership.strategy,
            heartbeat_interval: self.ownership.heartbeat_interval,
            lease_timeout:      self.ownership.lease_timeout,
            node_timeout:       self.ownership.node_timeout,
            consumer:           ConsumerSettings {
                group:            self.node.group.clone(),
                fetch_batch:      self.queue.fetch_batch,
                in_flight_window: self.queue.in_flight_window,
                poll_interval:    self.queue.poll_interval,
                restart_backoff:  self.queue.restart_backoff,
                shutdown_grace:   self.shutdown_grace
            },
            actors:             ActorSettings {
                retry:              RetryPolicy {
                    max_attempts:    self.actors.max_attempts,
                    backoff_initial: self.actors.backoff_initial,
                    backoff_max:     self.actors.backoff_max
                },
                processing_timeout: self.engine.processing_timeout,
                idle_timeout:       self.actors.idle_timeout,
                sweep_interval:     self.actors.sweep_interval
            }
        }
    }

    /// Install every configured chain file and apply the bindings
    pub async fn build_registry(&self) -> Result<ChainRegistry, PipelineError> {
        let registry = ChainRegistry::new(self.engine.hop_budget);
        for file in &self.chains.files {
            registry.install_file(file).await?;
        }
        for binding in &self.chains.bindings {
            registry.bind(TenantId::new(&binding.tenant), binding.entity_type, ChainId::new(&binding.chain)).await?;
        }
        Ok(registry)
    }
}
