//! The `Schedule` singleton and its storage seam (spec.md §3 "Schedule",
//! §6 "Persistence": the `schedules` table). Modeled as a trait so the
//! Scheduler doesn't depend on a SQL driver directly — production
//! deployments back `ScheduleStore` with the real `schedules` table;
//! `TomlScheduleStore` is the in-process default used by tests and by a
//! minimal standalone deployment.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleType {
    Daily,
    Weekly,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub schedule_type: ScheduleType,
    pub hour: u8,
    /// Sunday-origin (0..6), weekly only.
    pub day_of_week: Option<u8>,
    pub lifecycle: u32,
    pub selected_containers: Vec<String>,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Default for Schedule {
    fn default() -> Self {
        Self {
            schedule_type: ScheduleType::Daily,
            hour: 2,
            day_of_week: None,
            lifecycle: 7,
            selected_containers: Vec::new(),
            last_run: None,
            next_run: None,
            updated_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait ScheduleStore: Send + Sync {
    async fn load(&self) -> CoreResult<Schedule>;
    async fn save(&self, schedule: &Schedule) -> CoreResult<()>;
}

/// Single-TOML-file backing, sufficient for tests and small deployments;
/// the `schedules` row in the real relational store (spec.md §6) is the
/// production-grade `ScheduleStore` implementation this trait anticipates.
pub struct TomlScheduleStore {
    path: PathBuf,
}

impl TomlScheduleStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ScheduleStore for TomlScheduleStore {
    async fn load(&self) -> CoreResult<Schedule> {
        if !self.path().exists() {
            return Ok(Schedule::default());
        }
        let content = tokio::fs::read_to_string(self.path()).await?;
        Ok(toml::from_str(&content)
            .map_err(|e| crate::error::CoreError::Other(format!("invalid schedule file: {e}")))?)
    }

    async fn save(&self, schedule: &Schedule) -> CoreResult<()> {
        let content = toml::to_string_pretty(schedule)
            .map_err(|e| crate::error::CoreError::Other(e.to_string()))?;
        if let Some(parent) = self.path().parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(self.path(), content).await?;
        Ok(())
    }
}
