//! Backup Engine (spec.md §4.4): orchestrates one backup end to end —
//! inspect → config → image → volumes → archive → verify — against the six
//! observable progress steps. Invoked by the Supervisor's queue processor
//! (or directly for an immediate, slot-already-free submission); the
//! engine itself never touches the slot.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tracing::{info, instrument, warn};

use crate::archive::metadata::{
    BackupMetadata, BackupType, ContainerRunState, MountKind, Sidecar, VolumeInfoEntry,
};
use crate::archive::{self, ArchiveWriter};
use crate::audit::{AuditEvent, AuditSink, EventStatus, OperationType};
use crate::docker::DockerTransport;
use crate::docker::inspect::InspectDocument;
use crate::error::{CoreError, CoreResult, Step};
use crate::runspec::RunSpec;
use crate::supervisor::progress::ProgressRegistry;
use crate::volume;

/// Identifies resources that belong to this service's own container so a
/// backup request against them is refused (spec.md §4.4 "Preconditions").
#[derive(Debug, Clone, Default)]
pub struct SelfReference {
    pub container_id: Option<String>,
    pub volume_names: Vec<String>,
}

impl SelfReference {
    pub fn is_self_container(&self, container_id: &str) -> bool {
        self.container_id.as_deref() == Some(container_id)
    }

    pub fn is_self_volume(&self, volume_name: &str) -> bool {
        self.volume_names.iter().any(|v| v == volume_name)
    }
}

pub struct BackupEngine {
    transport: Arc<dyn DockerTransport>,
    backups_dir: PathBuf,
    server_name: String,
    self_reference: SelfReference,
    seal_verify_timeout: std::time::Duration,
    audit: Arc<dyn AuditSink>,
}

impl BackupEngine {
    pub fn new(
        transport: Arc<dyn DockerTransport>,
        backups_dir: PathBuf,
        server_name: String,
        self_reference: SelfReference,
        seal_verify_timeout: std::time::Duration,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            transport,
            backups_dir,
            server_name,
            self_reference,
            seal_verify_timeout,
            audit,
        }
    }

    /// Runs a backup to completion, mutating `progress_id`'s record in
    /// `progress` as each of the six steps is reached. Always releases
    /// visibility of the current operation by reaching a terminal state —
    /// callers (the Supervisor) are responsible for the slot itself.
    #[instrument(skip(self, progress), fields(container_id, progress_id))]
    pub async fn run(
        &self,
        container_id: &str,
        is_scheduled: bool,
        progress_id: &str,
        progress: &ProgressRegistry,
    ) -> CoreResult<PathBuf> {
        progress.set_status(progress_id, crate::supervisor::progress::ProgressStatus::Running);

        let operation_type = if is_scheduled {
            OperationType::BackupScheduled
        } else {
            OperationType::BackupManual
        };
        self.audit
            .log(AuditEvent {
                timestamp: chrono::Utc::now(),
                operation_type,
                status: EventStatus::Started,
                container_id: Some(container_id.to_string()),
                container_name: None,
                backup_filename: None,
                error_message: None,
            })
            .await;

        let result = self.run_inner(container_id, is_scheduled, progress_id, progress).await;

        match &result {
            Ok(path) => {
                let filename = path.file_name().unwrap_or_default().to_string_lossy().into_owned();
                progress.complete(progress_id, &filename);
                info!(path = %path.display(), "backup sealed and verified");
                self.audit
                    .log(AuditEvent {
                        timestamp: chrono::Utc::now(),
                        operation_type,
                        status: EventStatus::Completed,
                        container_id: Some(container_id.to_string()),
                        container_name: None,
                        backup_filename: Some(filename),
                        error_message: None,
                    })
                    .await;
            }
            Err(e) => {
                progress.fail(progress_id, e.public_message());
                warn!(error = %e, "backup failed");
                self.audit
                    .log(AuditEvent {
                        timestamp: chrono::Utc::now(),
                        operation_type,
                        status: EventStatus::Error,
                        container_id: Some(container_id.to_string()),
                        container_name: None,
                        backup_filename: None,
                        error_message: Some(e.public_message()),
                    })
                    .await;
            }
        }

        result
    }

    async fn run_inner(
        &self,
        container_id: &str,
        is_scheduled: bool,
        progress_id: &str,
        progress: &ProgressRegistry,
    ) -> CoreResult<PathBuf> {
        // Step 1: inspect, refuse self, allocate filename.
        if self.self_reference.is_self_container(container_id) {
            return Err(CoreError::SelfReference);
        }
        let doc = self.transport.inspect_container(container_id).await?;
        let name = doc
            .name()
            .ok_or_else(|| CoreError::step(Step::Inspect, "inspect document has no Name"))?;
        let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let prefix = if is_scheduled { "scheduled_" } else { "" };
        let filename = format!("{prefix}{name}_{timestamp}.tar.gz");
        let final_path = self.backups_dir.join(&filename);
        progress.advance(progress_id, "inspect", 1);

        let workdir = tempfile::tempdir()?;
        let mut writer = ArchiveWriter::create(&final_path)?;

        // Step 2: serialise config.
        writer.append_json(archive::CONFIG_ENTRY, &doc.0)?;
        let run_spec = RunSpec::reconstruct(&doc, &std::collections::HashMap::new());
        writer.append_bytes(
            archive::RUN_COMMAND_ENTRY,
            run_spec.render_command_line().as_bytes(),
        )?;
        writer.append_bytes(
            archive::COMPOSE_ENTRY,
            run_spec.render_compose(&name).as_bytes(),
        )?;
        progress.advance(progress_id, "serialise_config", 2);

        // Step 3: export image, non-fatal on failure.
        let image_ref = doc.image_ref().unwrap_or_default().to_string();
        let mut image_backed_up = false;
        if !image_ref.is_empty() {
            let image_path = workdir.path().join("image.tar");
            match self.transport.export_image_stream(&image_ref, &image_path).await {
                Ok(()) => {
                    writer.append_file(archive::IMAGE_ENTRY, &image_path)?;
                    image_backed_up = true;
                }
                Err(e) => {
                    warn!(error = %e, image_ref, "image export failed; writing placeholder");
                    writer.append_bytes(
                        archive::IMAGE_ENTRY,
                        format!("image export failed: {e}").as_bytes(),
                    )?;
                }
            }
        }
        progress.advance(progress_id, "export_image", 3);

        // Step 4: enumerate mounts (Mounts for type/driver, Binds for
        // authoritative destination), excluding the service's own volume.
        let volume_infos = self.enumerate_mounts(&doc);
        if !volume_infos.is_empty() {
            writer.append_json(archive::VOLUMES_INFO_ENTRY, &volume_infos)?;
        }
        progress.advance(progress_id, "enumerate_mounts", 4);

        // Step 5: snapshot volumes; each failure is a placeholder, not fatal.
        for info in &volume_infos {
            match info.kind {
                MountKind::Volume => {
                    let vol_name = match &info.name {
                        Some(n) if !self.self_reference.is_self_volume(n) => n,
                        _ => continue,
                    };
                    let data_path = workdir.path().join(format!("{vol_name}_data.tar.gz"));
                    let member = format!("volumes/{vol_name}_data.tar.gz");
                    let meta_member = format!("volumes/{vol_name}_metadata.json");
                    match volume::backup_named_volume(self.transport.as_ref(), vol_name, &data_path).await {
                        Ok(()) => {
                            writer.append_file(&member, &data_path)?;
                            writer.append_json(
                                &meta_member,
                                &volume::captured_metadata(vol_name, &info.destination),
                            )?;
                        }
                        Err(e) => {
                            volume::log_capture_failure(MountKind::Volume, vol_name, &e);
                            writer.append_json(
                                &meta_member,
                                &volume::placeholder_metadata(vol_name, &info.destination, e.public_message()),
                            )?;
                        }
                    }
                }
                MountKind::Bind => {
                    let Some(source) = info.source.as_ref().map(PathBuf::from) else {
                        continue;
                    };
                    let basename = Path::new(&info.destination)
                        .file_name()
                        .map(|s| s.to_string_lossy().into_owned())
                        .unwrap_or_else(|| "bind".to_string());
                    let member = format!("volumes/bind_{basename}_data.tar.gz");
                    if volume::bind_mount_accessible(&source) {
                        let data_path = workdir.path().join(format!("bind_{basename}_data.tar.gz"));
                        match volume::backup_bind_mount(&source, &data_path, &basename) {
                            Ok(()) => writer.append_file(&member, &data_path)?,
                            Err(e) => warn!(error = %e, "bind mount capture failed"),
                        }
                    }
                }
            }
        }
        progress.advance(progress_id, "snapshot_volumes", 5);

        // Step 6: seal and verify.
        let metadata = BackupMetadata {
            container_id: doc.id().unwrap_or(container_id).to_string(),
            container_name: name.clone(),
            backup_date: Utc::now(),
            backup_type: if is_scheduled {
                BackupType::Scheduled
            } else {
                BackupType::Manual
            },
            image: image_ref,
            image_backed_up,
            status: if doc.is_running() {
                ContainerRunState::Running
            } else {
                ContainerRunState::Stopped
            },
            server_name: self.server_name.clone(),
        };
        writer.append_json(archive::METADATA_ENTRY, &metadata)?;

        let seal_result = tokio::time::timeout(self.seal_verify_timeout, async {
            tokio::task::spawn_blocking(move || writer.seal())
                .await
                .map_err(|e| CoreError::Other(e.to_string()))?
        })
        .await
        .map_err(|_| CoreError::Timeout(self.seal_verify_timeout))?;
        seal_result?;

        let sidecar = Sidecar {
            server_name: self.server_name.clone(),
        };
        std::fs::write(
            format!("{}.json", final_path.display()),
            serde_json::to_vec_pretty(&sidecar)?,
        )?;

        progress.advance(progress_id, "seal_archive", 6);
        Ok(final_path)
    }

    fn enumerate_mounts(&self, doc: &InspectDocument) -> Vec<VolumeInfoEntry> {
        let binds = doc.binds();
        let mounts = doc.mounts();

        let mut entries = Vec::new();
        for mount in &mounts {
            // prefer the Binds-derived destination when a matching bind exists,
            // since it survives renames where the resolved Mounts entry may not.
            let bind_match = binds.iter().find_map(|b| {
                let mut parts = b.splitn(2, ':');
                let left = parts.next()?;
                let dest = parts.next()?;
                if left == mount.name.as_deref().unwrap_or_default() || left == mount.source.as_deref().unwrap_or_default() {
                    Some(dest.trim_end_matches(":ro").to_string())
                } else {
                    None
                }
            });

            let destination = bind_match.unwrap_or_else(|| mount.destination.clone());
            let kind = if mount.mount_type == "bind" {
                MountKind::Bind
            } else {
                MountKind::Volume
            };
            entries.push(VolumeInfoEntry {
                kind,
                name: mount.name.clone(),
                destination,
                driver: mount.driver.clone(),
                source: mount.source.clone(),
            });
        }
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::{ContainerSummary, MockDockerTransport};
    use serde_json::json;

    fn running_web_doc() -> InspectDocument {
        InspectDocument::new(json!({
            "Id": "abc123",
            "Name": "/web",
            "State": {"Running": true},
            "Config": {"Image": "nginx:1.25"},
            "HostConfig": {"Binds": ["webdata:/usr/share/nginx/html"]},
            "Mounts": [{"Name": "webdata", "Destination": "/usr/share/nginx/html", "Type": "volume"}]
        }))
    }

    #[tokio::test]
    async fn refuses_to_back_up_its_own_container() {
        let transport: Arc<dyn DockerTransport> = Arc::new(MockDockerTransport::new());
        let engine = BackupEngine::new(
            transport,
            std::env::temp_dir(),
            "host-1".into(),
            SelfReference {
                container_id: Some("self-id".into()),
                volume_names: vec![],
            },
            std::time::Duration::from_secs(600),
            Arc::new(crate::audit::NoopAuditSink),
        );
        let progress = ProgressRegistry::new();
        let id = progress.create("self-id", false);
        let result = engine.run("self-id", false, &id, &progress).await;
        assert!(matches!(result, Err(CoreError::SelfReference)));
    }

    #[tokio::test]
    async fn successful_backup_seals_archive_and_advances_all_steps() {
        let mut mock = MockDockerTransport::new();
        mock.expect_inspect_container()
            .returning(|_| Ok(running_web_doc()));
        mock.expect_export_image_stream().returning(|_, path| {
            std::fs::write(path, vec![0u8; 200]).unwrap();
            Ok(())
        });
        mock.expect_backup_volume_data().returning(|_, path| {
            std::fs::write(path, b"fake-tar-gz").unwrap();
            Ok(())
        });

        let tmp = tempfile::tempdir().unwrap();
        let engine = BackupEngine::new(
            Arc::new(mock),
            tmp.path().to_path_buf(),
            "host-1".into(),
            SelfReference::default(),
            std::time::Duration::from_secs(600),
            Arc::new(crate::audit::NoopAuditSink),
        );
        let progress = ProgressRegistry::new();
        let id = progress.create("abc123", false);

        let path = engine.run("abc123", false, &id, &progress).await.unwrap();
        assert!(path.exists());

        let record = progress.get(&id).unwrap();
        assert_eq!(record.current_step, 6);
        assert_eq!(
            record.status,
            crate::supervisor::progress::ProgressStatus::Complete
        );

        let members = archive::list_members(&path).unwrap();
        assert!(members.iter().any(|m| m.ends_with("backup_metadata.json")));
        assert!(members.iter().any(|m| m.ends_with("webdata_data.tar.gz")));
    }

    #[tokio::test]
    async fn image_export_failure_is_non_fatal_and_writes_placeholder() {
        let mut mock = MockDockerTransport::new();
        mock.expect_inspect_container()
            .returning(|_| Ok(running_web_doc()));
        mock.expect_export_image_stream()
            .returning(|_, _| Err(CoreError::Other("save failed".into())));
        mock.expect_backup_volume_data().returning(|_, path| {
            std::fs::write(path, b"fake-tar-gz").unwrap();
            Ok(())
        });

        let tmp = tempfile::tempdir().unwrap();
        let engine = BackupEngine::new(
            Arc::new(mock),
            tmp.path().to_path_buf(),
            "host-1".into(),
            SelfReference::default(),
            std::time::Duration::from_secs(600),
            Arc::new(crate::audit::NoopAuditSink),
        );
        let progress = ProgressRegistry::new();
        let id = progress.create("abc123", false);

        let path = engine.run("abc123", false, &id, &progress).await.unwrap();
        let meta: BackupMetadata =
            archive::read_json_member(&path, archive::METADATA_ENTRY).unwrap();
        assert!(!meta.image_backed_up);
    }
}
