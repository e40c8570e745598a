//! CLI command handlers

use std::{path::Path, sync::Arc};

use anyhow::{Context, Result};
use tracing::{Level, event};

use crate::{
    adapter::{
        assignment::InMemoryAssignmentStore,
        dead_letter::{DeadLetterSinkFactory, JsonLinesDeadLetterSink},
        membership::LocalMembership,
        persistence::{InMemoryEntityStore, RecordingCommandGateway},
        queue::{QueueBackend, QueueFactory}
    },
    config::PipelineConfig,
    domain::{
        chain::RuleChainDef,
        constant::node,
        entity::EntityKey,
        message::MessageType,
        record::PartitionId
    },
    engine::CompiledChain,
    node::{NodeDeps, PipelineNode, SubmitResult, Submitter},
    port::{Collaborators, queue::PartitionedQueue}
};

fn open_queue(config: &PipelineConfig) -> Result<Arc<dyn PartitionedQueue>> {
    Ok(QueueFactory::create(config.queue.backend, config.queue.partitions, config.queue.path.as_deref())?)
}

/// Offline commands only make sense against a queue that outlives the process
fn open_durable_queue(config: &PipelineConfig) -> Result<Arc<dyn PartitionedQueue>> {
    if config.queue.backend == QueueBackend::InMemory {
        anyhow::bail!("this command needs a durable queue, set queue.backend to rocksdb");
    }
    open_queue(config)
}

/// Handle the run command - start a node and drain it on Ctrl-C
pub async fn handle_run_command(mut config: PipelineConfig, node_id: Option<String>) -> Result<()> {
    if node_id.is_some() {
        config.node.id = node_id;
    }

    let registry = config.build_registry().await.context("Failed to load rule chains")?;
    let deps = NodeDeps {
        queue:         open_queue(&config)?,
        assignments:   Arc::new(InMemoryAssignmentStore::new()),
        membership:    Arc::new(LocalMembership::new()),
        dead_letters:  DeadLetterSinkFactory::create(config.dead_letter_path.as_deref()),
        collaborators: Collaborators {
            entities: Arc::new(InMemoryEntityStore::new()),
            commands: Arc::new(RecordingCommandGateway::new())
        },
        registry:      Arc::new(registry)
    };

    let pipeline = PipelineNode::start(config.node_settings(), deps).await.context("Failed to start node")?;
    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;

    match pipeline.health().await {
        Ok(health) => println!("{}", serde_json::to_string(&health)?),
        Err(e) => event!(Level::WARN, event = node::NODE_SHUTDOWN_STARTED, error = %e)
    }
    pipeline.shutdown().await;
    Ok(())
}

/// Handle the validate-chain command
pub async fn handle_validate_chain_command(config: &PipelineConfig, file: &Path) -> Result<()> {
    let content = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("Failed to read chain file: {}", file.display()))?;
    let def = RuleChainDef::from_yaml(&content)?;
    let chain = CompiledChain::compile(&def, config.engine.hop_budget)?;

    println!(
        "chain {} (v{}) is valid: {} nodes, {} relations, hop budget {}",
        chain.id,
        chain.version,
        def.nodes.len(),
        def.relations.len(),
        def.hop_budget.unwrap_or(config.engine.hop_budget)
    );
    Ok(())
}

/// Handle the publish command
pub async fn handle_publish_command(
    config: &PipelineConfig,
    key: EntityKey,
    msg_type: &str,
    payload: &str
) -> Result<()> {
    let payload: serde_json::Value = serde_json::from_str(payload).context("Payload is not valid JSON")?;
    let submitter = Submitter::new(open_durable_queue(config)?, config.node.max_payload_bytes);

    match submitter.submit(key, MessageType::from(msg_type.to_string()), payload).await? {
        SubmitResult::Accepted { position } => {
            println!("accepted at {} offset {}", position.partition, position.offset);
            Ok(())
        }
        SubmitResult::Rejected { reason } => anyhow::bail!("rejected: {}", reason)
    }
}

/// Handle the dead-letters command
pub async fn handle_dead_letters_command(config: &PipelineConfig, path: Option<&Path>) -> Result<()> {
    let path = path
        .or(config.dead_letter_path.as_deref())
        .context("No dead-letter file given and dead_letter_path is not configured")?;

    for entry in JsonLinesDeadLetterSink::read_entries(path).await? {
        println!("{}", entry.to_json_line()?);
    }
    Ok(())
}

/// Handle the replay command
pub async fn handle_replay_command(config: &PipelineConfig, partition: u32, offset: u64) -> Result<()> {
    if partition >= config.queue.partitions {
        anyhow::bail!("partition {} out of range, the queue has {}", partition, config.queue.partitions);
    }

    let queue = open_durable_queue(config)?;
    let partition = PartitionId(partition);
    let previous = queue.committed(&config.node.group, partition).await?;
    queue.seek(&config.node.group, partition, offset).await?;
    println!("group {} on {} moved from offset {} to {}", config.node.group, partition, previous, offset);
    Ok(())
}

