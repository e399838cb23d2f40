//! Volume Data Mover (spec.md §4.3): the high-level backup/restore-volume
//! operations built on top of [`crate::docker::DockerTransport`]'s
//! ephemeral-helper primitives, plus the bind-mount special case from
//! spec.md §4.4 step 5 (a bind mount with an accessible host-side source is
//! tarred directly — no helper container needed).

use std::path::Path;

use tracing::warn;

use crate::archive::metadata::{MountKind, VolumeMetadata};
use crate::docker::DockerTransport;
use crate::error::CoreResult;

/// Streams a named volume's contents into `output_path` as a gzip tar via
/// the daemon's helper-container pattern.
pub async fn backup_named_volume(
    transport: &dyn DockerTransport,
    volume_name: &str,
    output_path: &Path,
) -> CoreResult<()> {
    transport
        .backup_volume_data(volume_name, output_path)
        .await
}

/// Restores a previously captured volume tarball into a (freshly ensured)
/// named volume.
pub async fn restore_named_volume(
    transport: &dyn DockerTransport,
    volume_name: &str,
    input_path: &Path,
) -> CoreResult<()> {
    transport.create_volume(volume_name).await?;
    transport.restore_volume_data(volume_name, input_path).await
}

/// Tars a bind-mount source directly on the host filesystem, without
/// spinning up a helper container — used only when the source path is
/// readable from the service's own container.
pub fn backup_bind_mount(source: &Path, output_path: &Path, basename: &str) -> CoreResult<()> {
    use flate2::Compression;
    use flate2::write::GzEncoder;

    let file = std::fs::File::create(output_path)?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    if source.is_dir() {
        builder.append_dir_all(".", source)?;
    } else {
        let mut f = std::fs::File::open(source)?;
        builder.append_file(basename, &mut f)?;
    }
    let encoder = builder.into_inner()?;
    encoder.finish()?;
    Ok(())
}

pub fn bind_mount_accessible(source: &Path) -> bool {
    source.exists() && std::fs::metadata(source).is_ok()
}

/// Builds the metadata record for a volume/bind-mount entry, recording a
/// placeholder when the underlying capture step failed — spec.md §4.4 step
/// 5 requires that an individual volume failure not abort the whole backup.
pub fn placeholder_metadata(name: &str, destination: &str, reason: impl Into<String>) -> VolumeMetadata {
    VolumeMetadata {
        name: name.to_string(),
        destination: destination.to_string(),
        captured_at: chrono::Utc::now(),
        placeholder: true,
        placeholder_reason: Some(reason.into()),
    }
}

pub fn captured_metadata(name: &str, destination: &str) -> VolumeMetadata {
    VolumeMetadata {
        name: name.to_string(),
        destination: destination.to_string(),
        captured_at: chrono::Utc::now(),
        placeholder: false,
        placeholder_reason: None,
    }
}

pub fn log_capture_failure(kind: MountKind, name: &str, error: &crate::error::CoreError) {
    warn!(mount_kind = ?kind, name, %error, "volume snapshot failed; recording placeholder and continuing");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn backup_named_volume_delegates_to_transport() {
        let mut mock = crate::docker::MockDockerTransport::new();
        mock.expect_backup_volume_data()
            .withf(|name, _| name == "webdata")
            .returning(|_, _| Ok(()));
        let tmp = tempfile::tempdir().unwrap();
        let out = tmp.path().join("webdata_data.tar.gz");
        backup_named_volume(&mock, "webdata", &out).await.unwrap();
    }

    #[tokio::test]
    async fn restore_named_volume_creates_then_restores() {
        let mut mock = crate::docker::MockDockerTransport::new();
        mock.expect_create_volume().returning(|_| Ok(()));
        mock.expect_restore_volume_data().returning(|_, _| Ok(()));
        let tmp = tempfile::tempdir().unwrap();
        let input = tmp.path().join("webdata_data.tar.gz");
        std::fs::write(&input, b"").unwrap();
        restore_named_volume(&mock, "webdata", &input).await.unwrap();
    }

    #[test]
    fn bind_mount_accessible_reflects_filesystem() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(bind_mount_accessible(tmp.path()));
        assert!(!bind_mount_accessible(&tmp.path().join("missing")));
    }

    #[test]
    fn backup_bind_mount_writes_readable_gzip_tar() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("src");
        std::fs::create_dir(&source).unwrap();
        std::fs::write(source.join("index.html"), b"hello").unwrap();
        let out = tmp.path().join("bind_src_data.tar.gz");
        backup_bind_mount(&source, &out, "src").unwrap();
        assert!(out.exists());
        assert!(std::fs::metadata(&out).unwrap().len() > 0);
    }
}
