use async_trait::async_trait;

use crate::domain::{dead_letter::DeadLetterEntry, error::PipelineError};

/// Append-only dead-letter sink
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn publish(&self, entry: DeadLetterEntry) -> Result<(), PipelineError>;

    async fn entries(&self) -> Result<Vec<DeadLetterEntry>, PipelineError>;
}
