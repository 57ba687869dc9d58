pub mod jsonl;

use std::path::Path;

use thiserror::Error;

use crate::pipeline::events::JobEvent;

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("other error: {0}")]
    Other(String),
}

/// Run-level fields stamped on every event-log record.
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    pub run_id: String,
    pub tool_version: String,
    pub config_hash: String,
    pub device_path: String,
    pub source_sha256: String,
}

/// Destination for the job's event stream.
///
/// # Example
/// ```rust
/// use recoverability::metadata::{self, EventSink, RunContext};
/// use recoverability::pipeline::events::JobEvent;
///
/// let dir = std::env::temp_dir().join("recoverability_event_log_example");
/// std::fs::create_dir_all(&dir).unwrap();
///
/// let sink = metadata::build_sink(&dir.join("events.jsonl"), RunContext::default()).unwrap();
/// sink.record_event(&JobEvent::SkimPaused { resume_at: 4096 }).unwrap();
/// sink.flush().unwrap();
/// ```
pub trait EventSink: Send + Sync {
    fn record_event(&self, event: &JobEvent) -> Result<(), MetadataError>;
    fn flush(&self) -> Result<(), MetadataError>;
}

/// Sink used when no event log was requested.
pub struct DryRunSink;

impl EventSink for DryRunSink {
    fn record_event(&self, _event: &JobEvent) -> Result<(), MetadataError> {
        Ok(())
    }

    fn flush(&self) -> Result<(), MetadataError> {
        Ok(())
    }
}

pub fn build_sink(path: &Path, run: RunContext) -> Result<Box<dyn EventSink>, MetadataError> {
    Ok(Box::new(jsonl::JsonlSink::new(path, run)?))
}

pub fn build_dry_run_sink() -> Box<dyn EventSink> {
    Box::new(DryRunSink)
}
