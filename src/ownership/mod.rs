//! Partition ownership
//!
//! Assignment planning, fencing leases and the per-node service that keeps
//! the partition consumers in line with the shared assignment table.

pub mod coordinator;
pub mod lease;
pub mod service;
pub mod strategy;
pub mod tracker;

pub use lease::PartitionLease;
pub use service::{OwnershipArguments, OwnershipMessage, OwnershipService, OwnershipSettings};
pub use strategy::AssignmentStrategy;
