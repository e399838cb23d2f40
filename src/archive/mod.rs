//! Archive Codec (spec.md §3 "Archive", §6 "Archive format").
//!
//! Builds and reads the gzipped tar layout. The write path generalises the
//! teacher's `compress_with_memory_file` (tar::Builder over an encoder,
//! `append_memory_files` for in-archive-generated JSON/text, `append_items`
//! for directory trees walked with `walkdir`) from `xz2` to `flate2`,
//! because spec.md mandates a `.tar.gz` container rather than `.tar.xz`.
//! The read path keeps the teacher's per-entry unpack shape from
//! `unpack_archive`/`read_file_from_archive`.

pub mod metadata;

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use tar::{Archive, Builder};
use walkdir::WalkDir;

use crate::error::{CoreError, CoreResult, Step};

pub const METADATA_ENTRY: &str = "backup_metadata.json";
pub const CONFIG_ENTRY: &str = "container_config.json";
pub const RUN_COMMAND_ENTRY: &str = "docker_run_command.txt";
pub const COMPOSE_ENTRY: &str = "docker-compose.yml";
pub const IMAGE_ENTRY: &str = "image.tar";
pub const VOLUMES_INFO_ENTRY: &str = "volumes_info.json";

/// Builds an archive member-by-member: callers add in-memory files (JSON,
/// text) and on-disk files (volume tarballs, the image payload) in any
/// order, then [`ArchiveWriter::seal`] closes and fsyncs the gzip stream.
pub struct ArchiveWriter {
    builder: Builder<GzEncoder<File>>,
    path: PathBuf,
}

impl ArchiveWriter {
    pub fn create(path: &Path) -> CoreResult<Self> {
        let file = File::create(path)?;
        let encoder = GzEncoder::new(file, Compression::default());
        Ok(Self {
            builder: Builder::new(encoder),
            path: path.to_path_buf(),
        })
    }

    /// Appends an in-memory buffer as `./<name>` (e.g. `backup_metadata.json`).
    pub fn append_bytes(&mut self, name: &str, data: &[u8]) -> CoreResult<()> {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        self.builder
            .append_data(&mut header, format!("./{name}"), data)?;
        Ok(())
    }

    pub fn append_json<T: serde::Serialize>(&mut self, name: &str, value: &T) -> CoreResult<()> {
        let data = serde_json::to_vec_pretty(value)?;
        self.append_bytes(name, &data)
    }

    /// Appends an existing file on disk as `./<name>`, e.g. a volume
    /// tarball already produced by the Volume Data Mover.
    pub fn append_file(&mut self, name: &str, path: &Path) -> CoreResult<()> {
        let mut file = File::open(path)?;
        self.builder
            .append_file(format!("./{name}"), &mut file)?;
        Ok(())
    }

    /// Appends every regular file under `root` (a bind-mount directory) as
    /// `./<prefix>/<relative path>`, skipping anything whose path contains
    /// one of `exclude_patterns`.
    pub fn append_tree(
        &mut self,
        prefix: &str,
        root: &Path,
        exclude_patterns: &[String],
    ) -> CoreResult<()> {
        for entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
            let path = entry.path();
            let path_str = path.to_string_lossy();
            if exclude_patterns.iter().any(|p| path_str.contains(p.as_str())) {
                continue;
            }
            if !path.is_file() {
                continue;
            }
            let relative = path.strip_prefix(root).unwrap_or(path);
            let archive_name = format!("{prefix}/{}", relative.to_string_lossy());
            self.append_file(&archive_name, path)?;
        }
        Ok(())
    }

    /// Closes the gzip stream and fsyncs, then immediately re-opens and
    /// lists every member as the verification pass spec.md §4.4 step 6
    /// requires before a backup may be advertised `complete`.
    pub fn seal(self) -> CoreResult<()> {
        let mut encoder = self.builder.into_inner()?;
        encoder.flush()?;
        let file = encoder.finish()?;
        file.sync_all()?;
        drop(file);

        verify(&self.path)
    }
}

/// Opens `path` as a gzipped tar and lists every member to EOF, matching
/// spec.md §9 "Archive verification": cheap and strictly necessary, catches
/// truncated gzip streams and mid-write kills.
pub fn verify(path: &Path) -> CoreResult<()> {
    let file = File::open(path).map_err(|e| {
        CoreError::step(Step::SealArchive, format!("cannot reopen archive: {e}"))
    })?;
    let decoder = GzDecoder::new(file);
    let mut archive = Archive::new(decoder);
    let entries = archive
        .entries()
        .map_err(|e| CoreError::step(Step::SealArchive, format!("corrupt tar stream: {e}")))?;

    let mut seen_metadata = false;
    let mut seen_config = false;
    let mut count = 0usize;

    for entry in entries {
        let mut entry = entry
            .map_err(|e| CoreError::step(Step::SealArchive, format!("truncated member: {e}")))?;
        let path = entry.path().map(|p| p.to_path_buf()).unwrap_or_default();
        let name = path.to_string_lossy();
        if name.ends_with(METADATA_ENTRY) {
            seen_metadata = true;
        }
        if name.ends_with(CONFIG_ENTRY) {
            seen_config = true;
        }
        // drains the entry to EOF, the actual integrity check.
        let mut sink = std::io::sink();
        std::io::copy(&mut entry, &mut sink)
            .map_err(|e| CoreError::step(Step::SealArchive, format!("unreadable member {name}: {e}")))?;
        count += 1;
    }

    if !seen_metadata || !seen_config {
        return Err(CoreError::MalformedBackup(format!(
            "archive is missing required members (saw {count} entries)"
        )));
    }
    Ok(())
}

/// Reads a single named member out of an archive without extracting the
/// rest (used to load `container_config.json` at restore time).
pub fn read_member(path: &Path, member_name: &str) -> CoreResult<Vec<u8>> {
    let file = File::open(path)?;
    let decoder = GzDecoder::new(file);
    let mut archive = Archive::new(decoder);
    for entry in archive.entries()? {
        let mut entry = entry?;
        let entry_path = entry.path()?.to_path_buf();
        if entry_path.to_string_lossy().ends_with(member_name) {
            let mut buf = Vec::new();
            entry.read_to_end(&mut buf)?;
            return Ok(buf);
        }
    }
    Err(CoreError::MalformedBackup(format!(
        "archive does not contain {member_name}"
    )))
}

pub fn read_json_member<T: serde::de::DeserializeOwned>(
    path: &Path,
    member_name: &str,
) -> CoreResult<T> {
    let bytes = read_member(path, member_name)?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Extracts one member whose name matches `member_name` to `dest_dir`,
/// used to pull a single volume tarball out of the outer archive before
/// piping it through the Volume Data Mover.
pub fn extract_member_to(path: &Path, member_name: &str, dest: &Path) -> CoreResult<()> {
    let bytes = read_member(path, member_name)?;
    std::fs::write(dest, bytes)?;
    Ok(())
}

/// Lists every top-level member name, used by list/preview endpoints that
/// want to show archive contents without fully reading it.
pub fn list_members(path: &Path) -> CoreResult<Vec<String>> {
    let file = File::open(path)?;
    let decoder = GzDecoder::new(file);
    let mut archive = Archive::new(decoder);
    let mut names = Vec::new();
    for entry in archive.entries()? {
        let entry = entry?;
        names.push(entry.path()?.to_string_lossy().into_owned());
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::metadata::{BackupMetadata, BackupType, ContainerRunState};

    #[test]
    fn write_then_verify_then_read_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("web_20240101_000000.tar.gz");

        let mut writer = ArchiveWriter::create(&path).unwrap();
        let meta = BackupMetadata {
            container_id: "abc".into(),
            container_name: "web".into(),
            backup_date: chrono::Utc::now(),
            backup_type: BackupType::Manual,
            image: "nginx:1.25".into(),
            image_backed_up: true,
            status: ContainerRunState::Running,
            server_name: "host-1".into(),
        };
        writer.append_json(METADATA_ENTRY, &meta).unwrap();
        writer
            .append_bytes(CONFIG_ENTRY, br#"{"Name":"/web"}"#)
            .unwrap();
        writer.seal().unwrap();

        verify(&path).unwrap();

        let members = list_members(&path).unwrap();
        assert!(members.iter().any(|m| m.ends_with(METADATA_ENTRY)));
        assert!(members.iter().any(|m| m.ends_with(CONFIG_ENTRY)));

        let read_back: BackupMetadata = read_json_member(&path, METADATA_ENTRY).unwrap();
        assert_eq!(read_back.container_name, "web");
    }

    #[test]
    fn verify_rejects_archive_missing_required_members() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("incomplete.tar.gz");
        let mut writer = ArchiveWriter::create(&path).unwrap();
        writer.append_bytes("only_this.json", b"{}").unwrap();
        // seal() itself calls verify() and would already fail; call the
        // lower-level writer path directly to exercise verify() in isolation.
        let encoder = writer.builder.into_inner().unwrap();
        let file = encoder.finish().unwrap();
        drop(file);

        let result = verify(&path);
        assert!(result.is_err());
    }

    #[test]
    fn verify_rejects_truncated_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("truncated.tar.gz");
        std::fs::write(&path, b"not a gzip stream").unwrap();
        assert!(verify(&path).is_err());
    }
}
