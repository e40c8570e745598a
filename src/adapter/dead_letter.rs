//! Dead-letter sinks
//!
//! - InMemoryDeadLetterSink: for development and tests
//! - JsonLinesDeadLetterSink: one JSON document per line, appended to a file

use std::{
    path::{Path, PathBuf},
    sync::Arc
};

use async_trait::async_trait;
use tokio::{
    fs::OpenOptions,
    io::AsyncWriteExt,
    sync::{Mutex, RwLock}
};

use crate::{
    domain::{dead_letter::DeadLetterEntry, error::PipelineError},
    port::dead_letter::DeadLetterSink
};

#[derive(Default)]
pub struct InMemoryDeadLetterSink {
    entries: RwLock<Vec<DeadLetterEntry>>
}

impl InMemoryDeadLetterSink {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeadLetterSink for InMemoryDeadLetterSink {
    async fn publish(&self, entry: DeadLetterEntry) -> Result<(), PipelineError> {
        self.entries.write().await.push(entry);
        Ok(())
    }

    async fn entries(&self) -> Result<Vec<DeadLetterEntry>, PipelineError> {
        Ok(self.entries.read().await.clone())
    }
}

pub struct JsonLinesDeadLetterSink {
    path:   PathBuf,
    /// Serializes appends so lines never interleave
    writer: Mutex<()>
}

impl JsonLinesDeadLetterSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), writer: Mutex::new(()) }
    }

    pub async fn read_entries(path: &Path) -> Result<Vec<DeadLetterEntry>, PipelineError> {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into())
        };

        content.lines().filter(|line| !line.trim().is_empty()).map(|line| Ok(serde_json::from_str(line)?)).collect()
    }
}

#[async_trait]
impl DeadLetterSink for JsonLinesDeadLetterSink {
    async fn publish(&self, entry: DeadLetterEntry) -> Result<(), PipelineError> {
        let mut line = entry.to_json_line()?;
        line.push('\n');

        let _guard = self.writer.lock().await;
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path).await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn entries(&self) -> Result<Vec<DeadLetterEntry>, PipelineError> {
        Self::read_entries(&self.path).await
    }
}

pub struct DeadLetterSinkFactory;

impl DeadLetterSinkFactory {
    /// File sink when a path is configured, in-memory otherwise
    pub fn create(path: Option<&Path>) -> Arc<dyn DeadLetterSink> {
        match path {
            Some(path) => Arc::new(JsonLinesDeadLetterSink::new(path)),
            None => Arc::new(InMemoryDeadLetterSink::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tempfile::TempDir;

    use super::*;
    use crate::domain::{entity::EntityKey, record::PartitionId};

    #[tokio::test]
    async fn test_json_lines_sink_appends() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("dlq").join("dead-letters.jsonl");
        let sink = JsonLinesDeadLetterSink::new(&path);

        for offset in 0..2 {
            let entry = DeadLetterEntry::unprocessable(
                PartitionId(1),
                offset,
                Some(EntityKey::device("acme", "d1")),
                json!({"temperature": 95}),
                "no chain bound"
            );
            sink.publish(entry).await.unwrap();
        }

        let entries = sink.entries().await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].offset, 1);
        assert_eq!(entries[0].reason, "no chain bound");
    }

    #[tokio::test]
    async fn test_missing_file_reads_empty() {
        let dir = TempDir::new().unwrap();
        let entries = JsonLinesDeadLetterSink::read_entries(&dir.path().join("none.jsonl")).await.unwrap();
        assert!(entries.is_empty());
    }
}
