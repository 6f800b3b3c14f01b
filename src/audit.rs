//! Push-only audit trail of job events and issued certificates.

use crate::crypto::Certificate;
use crate::wipe_orchestrator::job::ProgressEvent;
use crate::{WipeError, WipeResult};
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Destination for audit records. Failures are reported to the caller, which
/// logs them and carries on; an audit outage never fails a job.
pub trait AuditSink: Send + Sync {
    fn record_event(&self, event: &ProgressEvent) -> WipeResult<()>;
    fn record_certificate(&self, certificate: &Certificate) -> WipeResult<()>;
}

#[derive(Debug, Serialize)]
#[serde(tag = "record", rename_all = "snake_case")]
enum AuditRecord<'a> {
    Event(&'a ProgressEvent),
    Certificate(&'a Certificate),
}

/// Appends one JSON object per line
pub struct JsonLinesAuditSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonLinesAuditSink {
    pub fn open(path: &Path) -> WipeResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| WipeError::Audit(format!("cannot open {}: {}", path.display(), e)))?;

        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, record: &AuditRecord<'_>) -> WipeResult<()> {
        let mut line =
            serde_json::to_string(record).map_err(|e| WipeError::Audit(e.to_string()))?;
        line.push('\n');

        let mut file = self
            .file
            .lock()
            .map_err(|_| WipeError::Audit("audit file lock poisoned".to_string()))?;
        file.write_all(line.as_bytes())
            .and_then(|_| file.flush())
            .map_err(|e| WipeError::Audit(e.to_string()))
    }
}

impl AuditSink for JsonLinesAuditSink {
    fn record_event(&self, event: &ProgressEvent) -> WipeResult<()> {
        self.append(&AuditRecord::Event(event))
    }

    fn record_certificate(&self, certificate: &Certificate) -> WipeResult<()> {
        self.append(&AuditRecord::Certificate(certificate))
    }
}

/// Keeps records in memory
#[derive(Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<ProgressEvent>>,
    certificates: Mutex<Vec<Certificate>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn certificates(&self) -> Vec<Certificate> {
        self.certificates
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record_event(&self, event: &ProgressEvent) -> WipeResult<()> {
        self.events
            .lock()
            .map_err(|_| WipeError::Audit("lock poisoned".to_string()))?
            .push(event.clone());
        Ok(())
    }

    fn record_certificate(&self, certificate: &Certificate) -> WipeResult<()> {
        self.certificates
            .lock()
            .map_err(|_| WipeError::Audit("lock poisoned".to_string()))?
            .push(certificate.clone());
        Ok(())
    }
}

/// Discards everything
pub struct NullAuditSink;

impl AuditSink for NullAuditSink {
    fn record_event(&self, _event: &ProgressEvent) -> WipeResult<()> {
        Ok(())
    }

    fn record_certificate(&self, _certificate: &Certificate) -> WipeResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wipe_orchestrator::job::{EventKind, Stage};
    use chrono::Utc;
    use uuid::Uuid;

    fn event(sequence: u64) -> ProgressEvent {
        ProgressEvent {
            job_id: Uuid::new_v4(),
            device_id: "sda".to_string(),
            sequence,
            timestamp: Utc::now(),
            stage: Stage::PreCheck,
            percent: 5,
            kind: EventKind::Note {
                message: "Pre-wipe checks passed".to_string(),
            },
        }
    }

    #[test]
    fn test_json_lines_appends_one_record_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit/log.jsonl");
        let sink = JsonLinesAuditSink::open(&path).unwrap();

        sink.record_event(&event(0)).unwrap();
        sink.record_event(&event(1)).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = contents
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();

        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["record"], "event");
        assert_eq!(lines[1]["sequence"], 1);
        assert_eq!(lines[0]["kind"]["type"], "note");
    }

    #[test]
    fn test_json_lines_reopen_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.jsonl");

        JsonLinesAuditSink::open(&path)
            .unwrap()
            .record_event(&event(0))
            .unwrap();
        JsonLinesAuditSink::open(&path)
            .unwrap()
            .record_event(&event(1))
            .unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 2);
    }

    #[test]
    fn test_memory_sink_collects_events() {
        let sink = MemoryAuditSink::new();
        sink.record_event(&event(0)).unwrap();
        assert_eq!(sink.events().len(), 1);
        assert!(sink.certificates().is_empty());
    }
}
