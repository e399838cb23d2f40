//! Audit log sink (spec.md §6 "Persistence": the `audit_logs` table).
//!
//! The core only ever appends rows; it never queries them back. Modeled as
//! a trait so the production deployment can back it with the real
//! relational `audit_logs` table while tests and small deployments use the
//! JSONL default (`original_source/audit_log_manager.py`'s `log_event`
//! shape, minus SQLite).

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    BackupManual,
    BackupScheduled,
    Restore,
    Cleanup,
    DeleteBackup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Started,
    Completed,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub operation_type: OperationType,
    pub status: EventStatus,
    pub container_id: Option<String>,
    pub container_name: Option<String>,
    pub backup_filename: Option<String>,
    pub error_message: Option<String>,
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn log(&self, event: AuditEvent);
}

/// Appends one JSON line per event. Never fails the caller's operation —
/// a write error is logged and swallowed, matching the teacher's own
/// `log_event` ("return bool, never raise").
pub struct JsonlAuditSink {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonlAuditSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub async fn read_all(&self) -> Vec<AuditEvent> {
        let Ok(content) = tokio::fs::read_to_string(&self.path).await else {
            return Vec::new();
        };
        content
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }
}

#[async_trait]
impl AuditSink for JsonlAuditSink {
    async fn log(&self, event: AuditEvent) {
        let _guard = self.lock.lock().await;
        let Ok(mut line) = serde_json::to_string(&event) else {
            return;
        };
        line.push('\n');

        if let Some(parent) = Path::new(&self.path).parent() {
            if tokio::fs::create_dir_all(parent).await.is_err() {
                warn!(path = %self.path.display(), "failed to create audit log directory");
                return;
            }
        }

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await;
        match file {
            Ok(mut file) => {
                if let Err(e) = file.write_all(line.as_bytes()).await {
                    warn!(error = %e, "failed to append audit log event");
                }
            }
            Err(e) => warn!(error = %e, "failed to open audit log file"),
        }
    }
}

/// Discards every event; used by tests that don't care about the audit
/// trail and by callers that haven't wired a real sink yet.
#[derive(Debug, Default)]
pub struct NoopAuditSink;

#[async_trait]
impl AuditSink for NoopAuditSink {
    async fn log(&self, _event: AuditEvent) {}
}

pub fn start(
    operation_type: OperationType,
    container_id: &str,
    container_name: &str,
) -> AuditEvent {
    AuditEvent {
        timestamp: Utc::now(),
        operation_type,
        status: EventStatus::Started,
        container_id: Some(container_id.to_string()),
        container_name: Some(container_name.to_string()),
        backup_filename: None,
        error_message: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn logged_events_round_trip_through_jsonl() {
        let tmp = tempfile::tempdir().unwrap();
        let sink = JsonlAuditSink::new(tmp.path().join("audit.jsonl"));

        sink.log(AuditEvent {
            timestamp: Utc::now(),
            operation_type: OperationType::BackupManual,
            status: EventStatus::Completed,
            container_id: Some("abc".into()),
            container_name: Some("web".into()),
            backup_filename: Some("web_20240101_000000.tar.gz".into()),
            error_message: None,
        })
        .await;
        sink.log(AuditEvent {
            timestamp: Utc::now(),
            operation_type: OperationType::Restore,
            status: EventStatus::Error,
            container_id: None,
            container_name: None,
            backup_filename: None,
            error_message: Some("volume conflict".into()),
        })
        .await;

        let events = sink.read_all().await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].operation_type, OperationType::BackupManual);
        assert_eq!(events[1].status, EventStatus::Error);
    }

    #[tokio::test]
    async fn missing_file_reads_as_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let sink = JsonlAuditSink::new(tmp.path().join("does-not-exist.jsonl"));
        assert!(sink.read_all().await.is_empty());
    }
}
