use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Mutex, PoisonError};

use serde::Serialize;

use crate::metadata::{EventSink, MetadataError, RunContext};
use crate::pipeline::events::JobEvent;

pub struct JsonlSink {
    run: RunContext,
    writer: Mutex<BufWriter<File>>,
}

#[derive(Serialize)]
struct EventRecord<'a> {
    run_id: &'a str,
    recorded_at: String,
    #[serde(flatten)]
    event: &'a JobEvent,
    tool_version: &'a str,
    config_hash: &'a str,
    device_path: &'a str,
    source_sha256: &'a str,
}

impl JsonlSink {
    pub fn new(path: &Path, run: RunContext) -> Result<Self, MetadataError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(path)?;
        Ok(Self {
            run,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }
}

impl EventSink for JsonlSink {
    fn record_event(&self, event: &JobEvent) -> Result<(), MetadataError> {
        let record = EventRecord {
            run_id: &self.run.run_id,
            recorded_at: chrono::Utc::now().to_rfc3339(),
            event,
            tool_version: &self.run.tool_version,
            config_hash: &self.run.config_hash,
            device_path: &self.run.device_path,
            source_sha256: &self.run.source_sha256,
        };
        let mut guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        serde_json::to_writer(&mut *guard, &record)?;
        guard.write_all(b"\n")?;
        Ok(())
    }

    fn flush(&self) -> Result<(), MetadataError> {
        let mut guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        guard.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_one_tagged_line_per_event() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("logs").join("events.jsonl");
        let run = RunContext {
            run_id: "run1".to_string(),
            tool_version: "0.0.0".to_string(),
            ..RunContext::default()
        };
        let sink = JsonlSink::new(&path, run).expect("sink");
        sink.record_event(&JobEvent::SectorResolved {
            index: 3,
            offset: 0x2000,
        })
        .expect("record");
        sink.record_event(&JobEvent::SecondPassStarted { until: 512 })
            .expect("record");
        sink.flush().expect("flush");

        let text = std::fs::read_to_string(&path).expect("read");
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|line| serde_json::from_str(line).expect("json"))
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["event"], "sector_resolved");
        assert_eq!(lines[0]["index"], 3);
        assert_eq!(lines[0]["offset"], 0x2000);
        assert_eq!(lines[0]["run_id"], "run1");
        assert_eq!(lines[1]["event"], "second_pass_started");
        assert_eq!(lines[1]["until"], 512);
    }
}
