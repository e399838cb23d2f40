//! Restore Engine (spec.md §4.5): the inverse of the Backup Engine, with
//! extra collision handling for names, volumes, and networks. Synchronous
//! with respect to its caller — no progress record, just a result.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use tracing::{info, instrument, warn};

use crate::archive::{self};
use crate::archive::metadata::VolumeInfoEntry;
use crate::docker::inspect::InspectDocument;
use crate::docker::{self, DockerTransport};
use crate::error::{CoreError, CoreResult};
use crate::runspec::RunSpec;
use crate::volume;

#[derive(Debug, Clone)]
pub struct RestoreRequest {
    pub archive_path: std::path::PathBuf,
    pub new_name: Option<String>,
    pub overwrite_volumes: Option<bool>,
    pub port_overrides: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub enum RestoreOutcome {
    Restored { container_id: String, stack_warning: Option<String> },
    VolumeConflict { volumes: Vec<String> },
}

pub struct RestoreEngine {
    transport: Arc<dyn DockerTransport>,
    restore_volume_timeout: std::time::Duration,
}

impl RestoreEngine {
    pub fn new(transport: Arc<dyn DockerTransport>, restore_volume_timeout: std::time::Duration) -> Self {
        Self {
            transport,
            restore_volume_timeout,
        }
    }

    #[instrument(skip(self, request))]
    pub async fn restore(&self, request: RestoreRequest) -> CoreResult<RestoreOutcome> {
        // Step 1: open archive, read container_config.json.
        let raw_config: serde_json::Value =
            archive::read_json_member(&request.archive_path, archive::CONFIG_ENTRY)
                .map_err(|_| CoreError::MalformedBackup("container_config.json missing or corrupt".into()))?;
        let doc = InspectDocument::new(raw_config);

        // Step 2: detect stack membership, informational only.
        let stack_warning = self.detect_stack_warning(&doc).await;

        // Step 3: volume conflict detection when unspecified.
        let volume_infos: Vec<VolumeInfoEntry> =
            archive::read_json_member(&request.archive_path, archive::VOLUMES_INFO_ENTRY)
                .unwrap_or_default();
        let named_volumes: Vec<String> = volume_infos
            .iter()
            .filter(|v| matches!(v.kind, crate::archive::metadata::MountKind::Volume))
            .filter_map(|v| v.name.clone())
            .collect();

        let restoring_volumes = match request.overwrite_volumes {
            Some(flag) => flag,
            None => {
                let mut colliding = Vec::new();
                for name in &named_volumes {
                    if self.transport.volume_exists(name).await? {
                        colliding.push(name.clone());
                    }
                }
                if !colliding.is_empty() {
                    return Ok(RestoreOutcome::VolumeConflict { volumes: colliding });
                }
                true
            }
        };

        // Step 4: re-derive run spec, apply overrides.
        let mut run_spec = RunSpec::reconstruct(&doc, &request.port_overrides);
        if let Some(new_name) = &request.new_name {
            run_spec.rename(new_name);
        }
        let container_name = run_spec
            .name()
            .ok_or_else(|| CoreError::MalformedBackup("archive has no container name".into()))?;
        let image = run_spec
            .image()
            .ok_or_else(|| CoreError::MalformedBackup("archive has no image reference".into()))?;

        // Step 5: restore volumes.
        if restoring_volumes {
            for name in &named_volumes {
                let member = format!("volumes/{name}_data.tar.gz");
                let tmp = tempfile::NamedTempFile::new()?;
                if archive::extract_member_to(&request.archive_path, &member, tmp.path()).is_err() {
                    warn!(volume = name, "archive has no data member for this volume, skipping");
                    continue;
                }
                let outcome = tokio::time::timeout(
                    self.restore_volume_timeout,
                    volume::restore_named_volume(self.transport.as_ref(), name, tmp.path()),
                )
                .await;
                match outcome {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        warn!(volume = name, error = %e, "volume restore failed, continuing with remaining volumes");
                    }
                    Err(_) => {
                        warn!(volume = name, timeout = ?self.restore_volume_timeout, "volume restore timed out, continuing with remaining volumes");
                    }
                }
            }
        }

        // Step 6: load image payload if present and non-placeholder.
        self.maybe_load_image(&request.archive_path).await?;

        // Step 7: ensure non-default networks exist.
        for network in doc.networks() {
            if docker::is_reserved_network(&network) {
                continue;
            }
            if self.transport.network_exists(&network).await? {
                continue;
            }
            let (subnet, gateway) = self.derive_subnet(&doc, &network);
            if self
                .transport
                .create_network(&network, subnet.as_deref(), gateway.as_deref())
                .await
                .is_err()
            {
                self.transport.create_network(&network, None, None).await?;
            }
        }

        // Step 8: normalise create args (strip -d, and --ip on default bridge).
        run_spec.normalise_for_restore();

        // Step 9: invoke docker create, reuse on name collision.
        let create_spec = run_spec.to_create_spec();
        let container_id = self
            .transport
            .create_container(&container_name, &image, create_spec)
            .await?;

        // Step 10: audit emitted by the caller (Service), which has the
        // AuditSink; the engine itself only returns the short container id.
        let short_id = container_id.chars().take(12).collect::<String>();
        info!(container_id = %short_id, "restore created container");

        Ok(RestoreOutcome::Restored {
            container_id: short_id,
            stack_warning,
        })
    }

    async fn detect_stack_warning(&self, doc: &InspectDocument) -> Option<String> {
        let project = doc.compose_project_label().or_else(|| doc.swarm_namespace_label());
        let project = project?;
        let containers = self.transport.list_containers(true).await.ok()?;
        let stack_present = containers.iter().any(|c| {
            c.labels.get("com.docker.compose.project").map(|v| v.as_str()) == Some(project.as_str())
                || c.labels.get("com.docker.stack.namespace").map(|v| v.as_str()) == Some(project.as_str())
        });
        if stack_present {
            None
        } else {
            Some(format!(
                "container belonged to stack '{project}', which is not currently present on this host"
            ))
        }
    }

    async fn maybe_load_image(&self, archive_path: &Path) -> CoreResult<()> {
        let tmp = tempfile::NamedTempFile::new()?;
        if archive::extract_member_to(archive_path, archive::IMAGE_ENTRY, tmp.path()).is_err() {
            return Ok(());
        }
        let size = std::fs::metadata(tmp.path())?.len();
        if size <= 100 {
            return Ok(());
        }
        match self.transport.load_image(tmp.path()).await {
            Ok(()) => Ok(()),
            Err(CoreError::DaemonError { message, .. }) if message.contains("already exists") => {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Computes a subnet/gateway pair from an inspect document's recorded
    /// `Gateway`/`IPPrefixLen` for the named network, zeroing the host
    /// portion of the address to get the network address (spec.md §4.5
    /// step 7).
    fn derive_subnet(&self, doc: &InspectDocument, network: &str) -> (Option<String>, Option<String>) {
        let gateway = doc
            .0
            .get("NetworkSettings")
            .and_then(|n| n.get("Networks"))
            .and_then(|n| n.get(network))
            .and_then(|n| n.get("Gateway"))
            .and_then(|g| g.as_str())
            .map(str::to_string);
        let prefix_len = doc
            .0
            .get("NetworkSettings")
            .and_then(|n| n.get("Networks"))
            .and_then(|n| n.get(network))
            .and_then(|n| n.get("IPPrefixLen"))
            .and_then(|p| p.as_u64());

        match (&gateway, prefix_len) {
            (Some(gw), Some(prefix)) => {
                let subnet = network_address(gw, prefix as u8).map(|addr| format!("{addr}/{prefix}"));
                (subnet, gateway.clone())
            }
            _ => (None, None),
        }
    }
}

fn network_address(ip: &str, prefix_len: u8) -> Option<String> {
    let addr: std::net::Ipv4Addr = ip.parse().ok()?;
    let mask = if prefix_len == 0 {
        0u32
    } else {
        u32::MAX << (32 - prefix_len)
    };
    let network = u32::from(addr) & mask;
    Some(std::net::Ipv4Addr::from(network).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::MockDockerTransport;
    use serde_json::json;

    fn archive_with(doc: serde_json::Value, volumes: Option<Vec<VolumeInfoEntry>>) -> std::path::PathBuf {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("restore_test.tar.gz").to_path_buf();
        std::mem::forget(tmp);
        let mut writer = archive::ArchiveWriter::create(&path).unwrap();
        writer.append_json(archive::CONFIG_ENTRY, &doc).unwrap();
        if let Some(volumes) = volumes {
            writer.append_json(archive::VOLUMES_INFO_ENTRY, &volumes).unwrap();
        }
        writer.seal().unwrap_or(());
        path
    }

    #[test]
    fn network_address_zeroes_host_bits() {
        assert_eq!(
            network_address("192.168.1.5", 24).as_deref(),
            Some("192.168.1.0")
        );
        assert_eq!(network_address("10.0.5.5", 16).as_deref(), Some("10.0.0.0"));
    }

    #[tokio::test]
    async fn malformed_archive_surfaces_malformed_backup_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("broken.tar.gz");
        std::fs::write(&path, b"not a tar").unwrap();
        let engine = RestoreEngine::new(Arc::new(MockDockerTransport::new()), std::time::Duration::from_secs(30));
        let result = engine
            .restore(RestoreRequest {
                archive_path: path,
                new_name: None,
                overwrite_volumes: None,
                port_overrides: HashMap::new(),
            })
            .await;
        assert!(matches!(result, Err(CoreError::MalformedBackup(_))));
    }

    #[tokio::test]
    async fn existing_volume_without_explicit_overwrite_reports_conflict() {
        let path = archive_with(
            json!({"Name": "/db", "Config": {"Image": "postgres:16"}}),
            Some(vec![VolumeInfoEntry {
                kind: crate::archive::metadata::MountKind::Volume,
                name: Some("dbdata".into()),
                destination: "/var/lib/postgresql/data".into(),
                driver: None,
                source: None,
            }]),
        );

        let mut mock = MockDockerTransport::new();
        mock.expect_volume_exists().returning(|_| Ok(true));

        let engine = RestoreEngine::new(Arc::new(mock), std::time::Duration::from_secs(30));
        let result = engine
            .restore(RestoreRequest {
                archive_path: path,
                new_name: None,
                overwrite_volumes: None,
                port_overrides: HashMap::new(),
            })
            .await
            .unwrap();

        match result {
            RestoreOutcome::VolumeConflict { volumes } => assert_eq!(volumes, vec!["dbdata".to_string()]),
            _ => panic!("expected a volume conflict"),
        }
    }
}
