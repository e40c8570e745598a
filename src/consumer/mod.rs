//! Partition consumers
//!
//! One worker per owned partition reads records in offset order, routes them
//! into the actor hierarchy and commits the settled prefix.

pub mod manager;
pub mod partition;
pub mod stream;
pub mod tracker;

pub use manager::{ConsumerManager, ConsumerMessage};
pub use partition::{ConsumerSettings, PartitionDeps, PartitionExit};
