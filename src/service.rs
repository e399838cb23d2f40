//! `Service` (spec.md §9 "Global mutable service state"): the explicit
//! container that owns the Docker Client, Supervisor, Scheduler, and the
//! other subsystems that the teacher's source keeps as module-level
//! singletons. Built once at boot, then handed by reference (`Arc`) to
//! every caller — the CLI `main.rs` and, in the real deployment, the HTTP
//! handlers this crate doesn't implement (spec.md §1 "external
//! collaborators").

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};

use chrono::Utc;

use crate::audit::{AuditEvent, AuditSink, EventStatus, JsonlAuditSink, OperationType};
use crate::config::Config;
use crate::docker::{BollardTransport, DockerTransport};
use crate::engine::backup::SelfReference;
use crate::engine::restore::{RestoreOutcome, RestoreRequest};
use crate::engine::{BackupEngine, RestoreEngine};
use crate::error::{CoreError, CoreResult};
use crate::object_store::{self, ObjectStore};
use crate::schedule_store::{Schedule, ScheduleStore, TomlScheduleStore};
use crate::scheduler::Scheduler;
use crate::supervisor::progress::ProgressRecord;
use crate::supervisor::{Supervisor, SupervisorStatus};

pub struct Service {
    config: Config,
    transport: Arc<dyn DockerTransport>,
    supervisor: Arc<Supervisor>,
    scheduler: Arc<Scheduler>,
    restore_engine: RestoreEngine,
    audit: Arc<dyn AuditSink>,
    object_store: Option<Arc<dyn ObjectStore>>,
    remote_temp_dir: PathBuf,
}

impl Service {
    /// Boots the service: connects the Docker Client, resolves this
    /// service's own container/volume identity for self-reference
    /// refusal, sweeps orphaned helper containers left by a prior crash
    /// (spec.md §4.3 invariant), migrates the legacy data-root layout, and
    /// loads the persisted Schedule (restart-resilient per spec.md §4.8).
    /// `object_store` is `None` for a local-only deployment; when set,
    /// `restore`/`list_backups`/`delete_backup` fall back to it for
    /// archives already offloaded from the local disk.
    pub async fn boot(
        config: Config,
        own_container_id: Option<String>,
        object_store: Option<Arc<dyn ObjectStore>>,
    ) -> CoreResult<Arc<Self>> {
        config.ensure_backup_dir()?;
        config.migrate_legacy_layout()?;
        if !config.is_writable() {
            warn!(data_root = %config.data_root.display(), "data root is not writable; backup-producing endpoints should be refused by the caller");
        }

        let transport: Arc<dyn DockerTransport> = Arc::new(BollardTransport::connect(
            std::path::Path::new("/var/run/docker.sock"),
            config.timeouts,
        )?);
        transport.ping().await?;

        let swept = transport.sweep_orphaned_helpers().await.unwrap_or(0);
        if swept > 0 {
            info!(swept, "removed orphaned helper containers from a prior run");
        }

        let self_reference = Self::resolve_self_reference(transport.as_ref(), own_container_id).await;

        let audit: Arc<dyn AuditSink> =
            Arc::new(JsonlAuditSink::new(config.config_dir().join("audit_log.jsonl")));

        let backup_engine = Arc::new(BackupEngine::new(
            transport.clone(),
            config.backups_dir(),
            hostname(),
            self_reference,
            config.timeouts.seal_verify(),
            audit.clone(),
        ));
        let restore_engine = RestoreEngine::new(transport.clone(), config.timeouts.restore_volume());

        let progress = Arc::new(crate::supervisor::progress::ProgressRegistry::new());
        let supervisor = Supervisor::new(backup_engine, progress);

        let schedule_store: Arc<dyn ScheduleStore> =
            Arc::new(TomlScheduleStore::new(config.config_dir().join("schedule.toml")));
        let scheduler = Scheduler::boot(
            schedule_store,
            supervisor.clone(),
            config.backups_dir(),
            audit.clone(),
            config.timeouts.scheduler_batch(),
        )
        .await?;

        let remote_temp_dir = config.data_root.join("tmp");
        if let Err(e) = object_store::sweep_aged_temp_files(&remote_temp_dir).await {
            warn!(error = %e, "failed to sweep aged pull-through temp files at startup");
        }

        Ok(Arc::new(Self {
            config,
            transport,
            supervisor,
            scheduler,
            restore_engine,
            audit,
            object_store,
            remote_temp_dir,
        }))
    }

    async fn resolve_self_reference(
        transport: &dyn DockerTransport,
        own_container_id: Option<String>,
    ) -> SelfReference {
        let Some(container_id) = own_container_id else {
            return SelfReference::default();
        };
        let volume_names = match transport.inspect_container(&container_id).await {
            Ok(doc) => doc
                .mounts()
                .into_iter()
                .filter(|m| m.mount_type == "volume")
                .filter_map(|m| m.name)
                .collect(),
            Err(e) => {
                warn!(error = %e, "could not inspect own container to resolve self-reference; falling back to id-only refusal");
                Vec::new()
            }
        };
        SelfReference {
            container_id: Some(container_id),
            volume_names,
        }
    }

    /// Spawns the Scheduler's wall-clock loop as a background task; call
    /// once at startup. Returns immediately.
    pub fn spawn_scheduler(self: &Arc<Self>) {
        let scheduler = self.scheduler.clone();
        tokio::spawn(async move { scheduler.run().await });
    }

    pub fn shutdown(&self) {
        self.supervisor.shutdown();
        self.scheduler.shutdown();
    }

    // ---- Backup / Supervisor surface (spec.md §6 "API surface") ----

    pub fn submit_backup(&self, container_id: &str, queue_if_busy: bool) -> crate::supervisor::SubmitOutcome {
        self.supervisor.start(container_id, queue_if_busy, false)
    }

    pub fn progress(&self, id: &str) -> Option<ProgressRecord> {
        self.supervisor.progress(id)
    }

    pub fn status(&self) -> SupervisorStatus {
        self.supervisor.status()
    }

    // ---- Restore surface ----

    pub async fn restore(&self, mut request: RestoreRequest) -> CoreResult<RestoreOutcome> {
        let archive_name = request
            .archive_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned());

        let mut event = AuditEvent {
            timestamp: Utc::now(),
            operation_type: OperationType::Restore,
            status: EventStatus::Started,
            container_id: None,
            container_name: None,
            backup_filename: archive_name,
            error_message: None,
        };

        if let (Some(store), Some(key)) = (
            self.object_store.as_deref(),
            request.archive_path.file_name().and_then(|n| n.to_str()),
        ) {
            if !request.archive_path.exists() {
                match object_store::resolve_for_read(store, key, &request.archive_path, &self.remote_temp_dir).await {
                    Ok(resolved) => request.archive_path = resolved,
                    Err(e) => {
                        event.status = EventStatus::Error;
                        event.error_message = Some(e.public_message());
                        self.audit.log(event).await;
                        return Err(e);
                    }
                }
            }
        }

        let result = self.restore_engine.restore(request).await;
        match &result {
            Ok(RestoreOutcome::Restored { container_id, .. }) => {
                event.status = EventStatus::Completed;
                event.container_id = Some(container_id.clone());
            }
            Ok(RestoreOutcome::VolumeConflict { .. }) => {
                event.status = EventStatus::Error;
                event.error_message = Some("volume conflict".to_string());
            }
            Err(e) => {
                event.status = EventStatus::Error;
                event.error_message = Some(e.public_message());
            }
        }
        self.audit.log(event).await;

        result
    }

    // ---- Schedule surface ----

    pub async fn schedule(&self) -> Schedule {
        self.scheduler.snapshot().await
    }

    pub async fn update_schedule(&self, schedule: Schedule) -> CoreResult<()> {
        self.scheduler.update(schedule).await
    }

    /// Called when a container the schedule references is deleted
    /// (spec.md §4.8 "Removal").
    pub async fn container_removed(&self, container_id: &str) -> CoreResult<()> {
        self.scheduler.remove_container(container_id).await
    }

    // ---- Archive listing / deletion (spec.md §6 "DELETE backup(filename)") ----

    pub async fn list_backups(&self) -> CoreResult<Vec<BackupListEntry>> {
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        let mut entries = tokio::fs::read_dir(self.config.backups_dir()).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.ends_with(".tar.gz") {
                continue;
            }
            let sidecar_path = format!("{}.json", path.display());
            let server_name = tokio::fs::read(&sidecar_path)
                .await
                .ok()
                .and_then(|bytes| serde_json::from_slice::<crate::archive::metadata::Sidecar>(&bytes).ok())
                .map(|s| s.server_name);
            seen.insert(name.to_string());
            out.push(BackupListEntry {
                filename: name.to_string(),
                path: path.clone(),
                server_name,
            });
        }

        if let Some(store) = self.object_store.as_deref() {
            for key in store.list_objects("").await.unwrap_or_default() {
                if key.ends_with(".json") || seen.contains(&key) {
                    continue;
                }
                out.push(BackupListEntry {
                    filename: key.clone(),
                    path: self.config.backups_dir().join(&key),
                    server_name: None,
                });
                seen.insert(key);
            }
        }

        Ok(out)
    }

    pub async fn delete_backup(&self, filename: &str) -> CoreResult<()> {
        let sanitized = std::path::Path::new(filename)
            .file_name()
            .ok_or_else(|| CoreError::NotFound(filename.to_string()))?;
        let path = self.config.backups_dir().join(sanitized);
        let key = sanitized.to_string_lossy().into_owned();

        if !path.exists() && self.object_store.is_none() {
            return Err(CoreError::NotFound(filename.to_string()));
        }
        if path.exists() {
            tokio::fs::remove_file(&path).await?;
            let _ = tokio::fs::remove_file(format!("{}.json", path.display())).await;
        }
        if let Some(store) = self.object_store.as_deref() {
            let _ = store.delete_object(&key).await;
            let _ = store.delete_object(&format!("{key}.json")).await;
        }

        self.audit
            .log(AuditEvent {
                timestamp: Utc::now(),
                operation_type: OperationType::DeleteBackup,
                status: EventStatus::Completed,
                container_id: None,
                container_name: None,
                backup_filename: Some(key),
                error_message: None,
            })
            .await;

        Ok(())
    }

    /// Uploads `filename` to the configured remote store and drops its local
    /// copy (spec.md §6 "Object store (optional)"). A no-op when no store is
    /// configured, so callers can invoke it unconditionally.
    pub async fn offload_backup_to_remote(&self, filename: &str) -> CoreResult<()> {
        let Some(store) = self.object_store.as_deref() else {
            return Ok(());
        };
        let sanitized = std::path::Path::new(filename)
            .file_name()
            .ok_or_else(|| CoreError::NotFound(filename.to_string()))?;
        let path = self.config.backups_dir().join(sanitized);
        object_store::archive_to_remote(store, &sanitized.to_string_lossy(), &path).await
    }

    pub fn transport(&self) -> &Arc<dyn DockerTransport> {
        &self.transport
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

#[derive(Debug, Clone)]
pub struct BackupListEntry {
    pub filename: String,
    pub path: PathBuf,
    pub server_name: Option<String>,
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok().map(|s| s.trim().to_string()))
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "unknown-host".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hostname_never_panics() {
        assert!(!hostname().is_empty());
    }
}
