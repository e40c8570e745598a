//! Rule chain engine

pub mod compiled;
pub mod executor;
pub mod node;
pub mod registry;
pub mod template;

pub use compiled::CompiledChain;
pub use executor::{ExecutionReport, execute};
pub use registry::ChainRegistry;
