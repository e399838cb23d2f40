//! Remote archive store seam (spec.md §6 "Object store (optional)").
//!
//! The S3 adapter itself is an external collaborator deliberately out of
//! scope (spec.md §1) — this module only supplies the trait the core
//! consumes it through, plus the write-remote-then-drop-local,
//! read-local-preferred, and aged-temp-file-sweep behavior spec.md §6
//! describes around it. `Service` holds an `Option<Arc<dyn ObjectStore>>`;
//! `None` means the deployment runs local-only, which is a legitimate mode.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::CoreResult;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put_object(&self, key: &str, path: &Path) -> CoreResult<()>;
    async fn get_object(&self, key: &str, dest: &Path) -> CoreResult<()>;
    async fn head_object(&self, key: &str) -> CoreResult<bool>;
    async fn list_objects(&self, prefix: &str) -> CoreResult<Vec<String>>;
    async fn delete_object(&self, key: &str) -> CoreResult<()>;
}

/// Uploads `local_path` and its `.json` sidecar under `key`, deleting both
/// local copies once the uploads succeed (spec.md §6 "writes go to remote
/// first; local bodies are deleted after successful upload").
pub async fn archive_to_remote(store: &dyn ObjectStore, key: &str, local_path: &Path) -> CoreResult<()> {
    store.put_object(key, local_path).await?;

    let sidecar_path = PathBuf::from(format!("{}.json", local_path.display()));
    if sidecar_path.exists() {
        store.put_object(&format!("{key}.json"), &sidecar_path).await?;
    }

    tokio::fs::remove_file(local_path).await?;
    if sidecar_path.exists() {
        tokio::fs::remove_file(&sidecar_path).await?;
    }
    info!(key, "archive offloaded to remote object store");
    Ok(())
}

/// Resolves an archive for reading: the local path if present, otherwise a
/// pull-through copy fetched into `temp_dir`, which must sit outside the
/// served archive directory (spec.md §6 "a temp path that lives outside the
/// served archive directory").
pub async fn resolve_for_read(
    store: &dyn ObjectStore,
    key: &str,
    local_path: &Path,
    temp_dir: &Path,
) -> CoreResult<PathBuf> {
    if local_path.exists() {
        return Ok(local_path.to_path_buf());
    }
    tokio::fs::create_dir_all(temp_dir).await?;
    let dest = temp_dir.join(key);
    store.get_object(key, &dest).await?;
    Ok(dest)
}

const TEMP_FILE_MAX_AGE: Duration = Duration::from_secs(24 * 3600);

/// Deletes pull-through temp files older than 24 hours (spec.md §6 "Aged
/// temp files (>24h) are swept"). Safe to call even if `temp_dir` was never
/// created (local-only deployments).
pub async fn sweep_aged_temp_files(temp_dir: &Path) -> CoreResult<usize> {
    let mut entries = match tokio::fs::read_dir(temp_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };

    let mut swept = 0;
    while let Some(entry) = entries.next_entry().await? {
        let Ok(metadata) = entry.metadata().await else {
            continue;
        };
        let Ok(modified) = metadata.modified() else {
            continue;
        };
        let age = SystemTime::now().duration_since(modified).unwrap_or_default();
        if age <= TEMP_FILE_MAX_AGE {
            continue;
        }
        match tokio::fs::remove_file(entry.path()).await {
            Ok(()) => swept += 1,
            Err(e) => warn!(path = %entry.path().display(), error = %e, "failed to sweep aged temp file"),
        }
    }
    Ok(swept)
}
