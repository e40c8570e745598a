use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Common error type for the pipeline
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    /// Configuration related errors
    #[error("{0}")]
    Configuration(String),

    /// Validation errors (bad input, bad entity key, rejected submission)
    #[error("{0}")]
    Validation(String),

    /// Partitioned queue errors
    #[error("{0}")]
    Queue(String),

    /// Persistence collaborator errors
    #[error("{0}")]
    Storage(String),

    /// Serialization/deserialization errors
    #[error("{0}")]
    Serialization(String),

    /// Actor spawn errors
    #[error("{0}")]
    Spawn(String),

    /// Processing deadline exceeded
    #[error("{0}")]
    Timeout(String),

    /// Collaborator could not be reached (injected or real network partition)
    #[error("{0}")]
    Unreachable(String),

    /// The local node no longer owns the partition the work belongs to
    #[error("{0}")]
    Fenced(String),

    /// Malformed rule chain graph (unknown relation target, missing root, ...)
    #[error("{0}")]
    ChainConfiguration(String),

    /// Hop budget exhausted while walking the rule chain
    #[error("chain loop exceeded after {hops} hops")]
    LoopExceeded { hops: u32 },

    /// External call inside a rule node failed
    #[error("{0}")]
    NodeFailure(String),

    /// Deterministic evaluation failure inside a rule node (template, payload shape)
    #[error("{0}")]
    Evaluation(String),

    /// Unexpected panic while processing a message
    #[error("{0}")]
    ActorCrash(String),

    /// Message explicitly rejected by the chain
    #[error("{0}")]
    Rejected(String),

    /// Generic errors with context
    #[error("{0}")]
    Generic(String)
}

/// Failure taxonomy driving retry and dead-letter decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// External call timeout/error, retried with backoff
    Transient,
    /// Deterministic misconfiguration, dead-lettered without retry
    Configuration,
    /// Lost partition ownership, abandoned without commit
    Fencing,
    /// Panic inside an actor, restarted a bounded number of times
    Crash
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Transient => "transient",
            ErrorClass::Configuration => "configuration",
            ErrorClass::Fencing => "fencing",
            ErrorClass::Crash => "crash"
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl PipelineError {
    pub fn class(&self) -> ErrorClass {
        match self {
            PipelineError::Fenced(_) => ErrorClass::Fencing,
            PipelineError::ActorCrash(_) => ErrorClass::Crash,
            PipelineError::ChainConfiguration(_)
            | PipelineError::LoopExceeded { .. }
            | PipelineError::Evaluation(_)
            | PipelineError::Rejected(_)
            | PipelineError::Configuration(_)
            | PipelineError::Validation(_)
            | PipelineError::Serialization(_) => ErrorClass::Configuration,
            PipelineError::Queue(_)
            | PipelineError::Storage(_)
            | PipelineError::Spawn(_)
            | PipelineError::Timeout(_)
            | PipelineError::Unreachable(_)
            | PipelineError::NodeFailure(_)
            | PipelineError::Generic(_) => ErrorClass::Transient
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self.class(), ErrorClass::Transient | ErrorClass::Crash)
    }

    pub fn fenced(partition: impl std::fmt::Display, reason: &str) -> Self {
        PipelineError::Fenced(format!("partition {} fenced: {}", partition, reason))
    }
}

/// Convert from anyhow::Error
impl From<anyhow::Error> for PipelineError {
    fn from(err: anyhow::Error) -> Self {
        PipelineError::Generic(err.to_string())
    }
}

/// Convert from std::io::Error
impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        PipelineError::Storage(err.to_string())
    }
}

/// Convert from serde_yaml::Error
impl From<serde_yaml::Error> for PipelineError {
    fn from(err: serde_yaml::Error) -> Self {
        PipelineError::Serialization(err.to_string())
    }
}

/// Convert from serde_json::Error
impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::Serialization(err.to_string())
    }
}

/// Convert from ractor::SpawnErr
impl From<ractor::SpawnErr> for PipelineError {
    fn from(err: ractor::SpawnErr) -> Self {
        PipelineError::Spawn(err.to_string())
    }
}

/// Convert from rocksdb::Error
impl From<rocksdb::Error> for PipelineError {
    fn from(err: rocksdb::Error) -> Self {
        PipelineError::Queue(err.to_string())
    }
}

/// Convert from tera::Error, keeping the source chain since the top-level message is terse
impl From<tera::Error> for PipelineError {
    fn from(err: tera::Error) -> Self {
        let mut message = err.to_string();
        let mut source = std::error::Error::source(&err);
        while let Some(cause) = source {
            message.push_str(": ");
            message.push_str(&cause.to_string());
            source = cause.source();
        }
        PipelineError::Evaluation(message)
    }
}
