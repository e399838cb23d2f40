//! Progress Record registry (spec.md §3 "Progress Record", §4.7 "Visibility").
//!
//! Progress polling must be cheap and lockless-but-consistent: readers get
//! a cloned snapshot, writers hold the map lock only long enough to mutate
//! one entry. `current_step` is enforced monotonic non-decreasing here so
//! every caller upstream of the registry gets that invariant for free
//! (spec.md §8 "For all Progress Records, `current_step` is monotonic
//! non-decreasing").

use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const TOTAL_STEPS: u8 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressStatus {
    Queued,
    Waiting,
    Starting,
    Running,
    Complete,
    Error,
}

impl ProgressStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ProgressStatus::Complete | ProgressStatus::Error)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub id: String,
    pub status: ProgressStatus,
    pub step: String,
    pub current_step: u8,
    pub total_steps: u8,
    pub container_id: String,
    pub is_scheduled: bool,
    pub error: Option<String>,
    pub backup_filename: Option<String>,
}

impl ProgressRecord {
    fn new(container_id: &str, is_scheduled: bool) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            status: ProgressStatus::Queued,
            step: "queued".to_string(),
            current_step: 0,
            total_steps: TOTAL_STEPS,
            container_id: container_id.to_string(),
            is_scheduled,
            error: None,
            backup_filename: None,
        }
    }
}

#[derive(Default)]
pub struct ProgressRegistry {
    records: RwLock<HashMap<String, ProgressRecord>>,
}

impl ProgressRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, container_id: &str, is_scheduled: bool) -> String {
        let record = ProgressRecord::new(container_id, is_scheduled);
        let id = record.id.clone();
        self.records.write().unwrap().insert(id.clone(), record);
        id
    }

    pub fn get(&self, id: &str) -> Option<ProgressRecord> {
        self.records.read().unwrap().get(id).cloned()
    }

    /// Advances `current_step`/`step`, refusing to regress it.
    pub fn advance(&self, id: &str, step_name: &str, current_step: u8) {
        let mut map = self.records.write().unwrap();
        if let Some(record) = map.get_mut(id) {
            if current_step >= record.current_step {
                record.current_step = current_step;
                record.step = step_name.to_string();
            }
            record.status = ProgressStatus::Running;
        }
    }

    pub fn set_status(&self, id: &str, status: ProgressStatus) {
        let mut map = self.records.write().unwrap();
        if let Some(record) = map.get_mut(id) {
            record.status = status;
        }
    }

    pub fn complete(&self, id: &str, filename: &str) {
        let mut map = self.records.write().unwrap();
        if let Some(record) = map.get_mut(id) {
            record.status = ProgressStatus::Complete;
            record.current_step = TOTAL_STEPS;
            record.step = "complete".to_string();
            record.backup_filename = Some(filename.to_string());
        }
    }

    pub fn fail(&self, id: &str, error: impl Into<String>) {
        let mut map = self.records.write().unwrap();
        if let Some(record) = map.get_mut(id) {
            record.status = ProgressStatus::Error;
            record.error = Some(error.into());
        }
    }

    /// Drops records older than `max_age` that have reached a terminal
    /// state (spec.md §3 Progress Record "implementations may age-evict").
    pub fn evict_terminal_older_than(&self, max_age: std::time::Duration, now: std::time::Instant, created_at: &HashMap<String, std::time::Instant>) {
        let mut map = self.records.write().unwrap();
        map.retain(|id, record| {
            if !record.status.is_terminal() {
                return true;
            }
            match created_at.get(id) {
                Some(created) => now.duration_since(*created) < max_age,
                None => true,
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_starts_at_step_zero_queued() {
        let registry = ProgressRegistry::new();
        let id = registry.create("abc", false);
        let record = registry.get(&id).unwrap();
        assert_eq!(record.current_step, 0);
        assert_eq!(record.status, ProgressStatus::Queued);
    }

    #[test]
    fn advance_never_regresses_current_step() {
        let registry = ProgressRegistry::new();
        let id = registry.create("abc", false);
        registry.advance(&id, "inspect", 1);
        registry.advance(&id, "serialise_config", 2);
        registry.advance(&id, "inspect", 1);
        let record = registry.get(&id).unwrap();
        assert_eq!(record.current_step, 2);
    }

    #[test]
    fn complete_sets_terminal_step_and_filename() {
        let registry = ProgressRegistry::new();
        let id = registry.create("abc", false);
        registry.complete(&id, "web_20240101_000000.tar.gz");
        let record = registry.get(&id).unwrap();
        assert_eq!(record.status, ProgressStatus::Complete);
        assert_eq!(record.current_step, TOTAL_STEPS);
        assert_eq!(
            record.backup_filename.as_deref(),
            Some("web_20240101_000000.tar.gz")
        );
    }

    #[test]
    fn unknown_id_get_returns_none() {
        let registry = ProgressRegistry::new();
        assert!(registry.get("does-not-exist").is_none());
    }
}
