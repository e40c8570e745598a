//! Entity actor hierarchy
//!
//! Root → tenant → entity, built on Ractor. Each entity actor owns the state
//! of one EntityKey and processes its contexts one at a time; siblings run in
//! parallel. Parents spawn children lazily and evict them when idle.

pub mod entity;
pub mod message;
pub mod root;
pub mod stats;
pub mod system;
pub mod tenant;

pub use message::*;
pub use stats::PipelineStats;
pub use system::{ActorSettings, ActorSystem};
