//! Terminal outcomes of rule chain execution and of a processing context

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{
    dead_letter::DeadLetterEntry,
    error::{ErrorClass, PipelineError}
};

/// Failure of a chain, attributed to the node that produced it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainFailure {
    pub node_id: String,
    pub error:   PipelineError
}

impl ChainFailure {
    pub fn new(node_id: impl Into<String>, error: PipelineError) -> Self {
        Self { node_id: node_id.into(), error }
    }

    pub fn class(&self) -> ErrorClass {
        self.error.class()
    }
}

/// Result of executing a chain once for one message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainOutcome {
    Ack,
    Fail(ChainFailure)
}

impl ChainOutcome {
    pub fn is_ack(&self) -> bool {
        matches!(self, ChainOutcome::Ack)
    }
}

/// One failed delivery attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt:      u32,
    pub failing_node: Option<String>,
    pub reason:       String,
    pub class:        ErrorClass,
    pub at:           DateTime<Utc>
}

/// What the partition consumer does with a context's offset
#[derive(Debug, Clone, PartialEq)]
pub enum Settlement {
    /// Processed; the offset may be committed
    Acked { attempts: u32 },
    /// Retries exhausted or terminal failure; publish, then commit
    DeadLettered(Box<DeadLetterEntry>),
    /// Ownership lost; neither commit nor side effects
    Fenced,
    /// The context was dropped without an outcome (owning actor died)
    Abandoned
}

impl Settlement {
    pub fn name(&self) -> &'static str {
        match self {
            Settlement::Acked { .. } => "acked",
            Settlement::DeadLettered(_) => "dead_lettered",
            Settlement::Fenced => "fenced",
            Settlement::Abandoned => "abandoned"
        }
    }
}
