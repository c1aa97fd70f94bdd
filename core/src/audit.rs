//! Append-only audit log, one entry per completed document (§6). Grounded
//! directly on the teacher core crate's `AuditSink`/`JsonlAuditSink` (atomic
//! sequence counter, append-mode file, one JSON object per line), repointed at
//! the per-document event shape `var/audit/<correlation_id>.jsonl` requires
//! instead of the teacher's ingest/query-operation shape.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub sequence: u64,
    pub correlation_id: String,
    pub doc_id: String,
    pub project_id: String,
    pub source_path: String,
    pub chunks_written: u64,
    pub documents_processed: u64,
    pub duration_seconds: f64,
    pub embed_model: String,
    #[serde(default)]
    pub warnings: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit sink lock poisoned")]
    LockPoisoned,
    #[error("audit io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("audit serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl crate::error::CiteloomError for AuditError {
    fn error_code(&self) -> crate::error::ErrorCode {
        crate::error::ErrorCode::Internal
    }
}

pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent) -> Result<(), AuditError>;
}

#[derive(Default)]
pub struct InMemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
    sequence: AtomicU64,
}

impl InMemoryAuditSink {
    pub fn events(&self) -> Result<Vec<AuditEvent>, AuditError> {
        let events = self.events.lock().map_err(|_| AuditError::LockPoisoned)?;
        Ok(events.clone())
    }
}

impl AuditSink for InMemoryAuditSink {
    fn record(&self, mut event: AuditEvent) -> Result<(), AuditError> {
        let next = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        event.sequence = next;
        let mut events = self.events.lock().map_err(|_| AuditError::LockPoisoned)?;
        events.push(event);
        Ok(())
    }
}

/// One audit sink per correlation id, writing to `var/audit/<correlation_id>.jsonl`.
pub struct JsonlAuditSink {
    writer: Mutex<std::fs::File>,
    sequence: AtomicU64,
}

impl JsonlAuditSink {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AuditError> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }

        let writer = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())?;

        Ok(Self {
            writer: Mutex::new(writer),
            sequence: AtomicU64::new(0),
        })
    }

    /// Convenience constructor matching the §6 layout: `<audit_dir>/<correlation_id>.jsonl`.
    pub fn open_for_correlation(audit_dir: impl AsRef<Path>, correlation_id: &str) -> Result<Self, AuditError> {
        Self::open(audit_dir.as_ref().join(format!("{correlation_id}.jsonl")))
    }
}

impl AuditSink for JsonlAuditSink {
    fn record(&self, mut event: AuditEvent) -> Result<(), AuditError> {
        let next = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        event.sequence = next;

        let line = serde_json::to_string(&event)?;
        let mut writer = self.writer.lock().map_err(|_| AuditError::LockPoisoned)?;
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_event(doc_id: &str) -> AuditEvent {
        AuditEvent {
            sequence: 0,
            correlation_id: "11111111-1111-1111-1111-111111111111".to_string(),
            doc_id: doc_id.to_string(),
            project_id: "citeloom/demo".to_string(),
            source_path: "/tmp/a.pdf".to_string(),
            chunks_written: 5,
            documents_processed: 1,
            duration_seconds: 1.5,
            embed_model: "embedding-default-v1".to_string(),
            warnings: vec![],
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn in_memory_sink_records_monotonic_sequence() {
        let sink = InMemoryAuditSink::default();
        sink.record(sample_event("doc-1")).unwrap();
        sink.record(sample_event("doc-2")).unwrap();

        let events = sink.events().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].sequence, 1);
        assert_eq!(events[1].sequence, 2);
    }

    #[test]
    fn jsonl_sink_writes_one_line_per_document() {
        let dir = tempdir().unwrap();
        let sink = JsonlAuditSink::open_for_correlation(dir.path(), "11111111-1111-1111-1111-111111111111").unwrap();

        sink.record(sample_event("doc-1")).unwrap();
        sink.record(sample_event("doc-2")).unwrap();

        let path = dir.path().join("11111111-1111-1111-1111-111111111111.jsonl");
        let content = std::fs::read_to_string(path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("\"doc_id\":\"doc-1\""));
        assert!(lines[1].contains("\"doc_id\":\"doc-2\""));
    }
}
