//! # Pipeline
//!
//! Partitioned, actor-based rule-chain pipeline for device messages.
//!
//! - Records are appended to a partitioned queue keyed by entity
//! - Partitions are owned by exactly one live node per epoch, with fencing
//! - Each entity has one actor that processes its messages in order
//! - Every message runs through the rule chain bound to its tenant
//! - Offsets are committed after the terminal outcome; failures are retried
//!   or dead-lettered

pub mod actor;
pub mod adapter;
pub mod cli;
pub mod config;
pub mod consumer;
pub mod context;
pub mod domain;
pub mod engine;
pub mod node;
pub mod ownership;
pub mod port;

pub use config::PipelineConfig;
pub use domain::error::PipelineError;
pub use node::{NodeDeps, NodeSettings, PipelineNode, SubmitResult};
