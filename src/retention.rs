//! Retention / Lifecycle (spec.md §4.6). Triggered once after a scheduled
//! batch reaches a terminal state (see [`crate::scheduler::Scheduler`]'s
//! batch monitor); prunes each container's `scheduled_` archives beyond the
//! configured keep-N bound. Manual archives are never touched.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::audit::{AuditEvent, AuditSink, EventStatus, OperationType};
use crate::error::CoreResult;

const SCHEDULED_PREFIX: &str = "scheduled_";
const ARCHIVE_SUFFIX: &str = ".tar.gz";

/// Parses the container name out of a scheduled archive filename: strips
/// the `scheduled_` prefix and `.tar.gz` suffix, then removes the trailing
/// two underscore-separated tokens (date + time). Container names that
/// themselves contain underscores are handled because only the last two
/// tokens are ever stripped.
pub fn container_name_from_scheduled_filename(filename: &str) -> Option<String> {
    let stripped = filename.strip_prefix(SCHEDULED_PREFIX)?;
    let stripped = stripped.strip_suffix(ARCHIVE_SUFFIX)?;
    let mut parts: Vec<&str> = stripped.split('_').collect();
    if parts.len() < 3 {
        return None;
    }
    parts.truncate(parts.len() - 2);
    Some(parts.join("_"))
}

/// Runs one retention pass against `backups_dir`, grouping scheduled
/// archives by container name and deleting everything beyond `lifecycle`
/// entries (most recent `lifecycle`, by mtime, survive). Every deletion is
/// appended to `audit` as a `Cleanup` row (spec.md §6 "lifecycle prune ...
/// is a row").
pub async fn run_with_lifecycle_audited(
    backups_dir: &Path,
    lifecycle: u32,
    audit: &dyn AuditSink,
) -> CoreResult<()> {
    let mut groups: HashMap<String, Vec<(PathBuf, std::time::SystemTime)>> = HashMap::new();

    let mut entries = tokio::fs::read_dir(backups_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let Some(filename) = path.file_name().and_then(|f| f.to_str()) else {
            continue;
        };
        if !filename.starts_with(SCHEDULED_PREFIX) || !filename.ends_with(ARCHIVE_SUFFIX) {
            continue;
        }
        let Some(container_name) = container_name_from_scheduled_filename(filename) else {
            continue;
        };
        let modified = entry.metadata().await?.modified()?;
        groups.entry(container_name).or_default().push((path, modified));
    }

    for (container_name, mut archives) in groups {
        archives.sort_by(|a, b| b.1.cmp(&a.1));
        if archives.len() as u32 <= lifecycle {
            continue;
        }
        for (path, _) in archives.into_iter().skip(lifecycle as usize) {
            let filename = path.file_name().map(|f| f.to_string_lossy().into_owned());
            info!(container = container_name, path = %path.display(), "retention pruning scheduled archive");
            tokio::fs::remove_file(&path).await?;
            let sidecar = format!("{}.json", path.display());
            let _ = tokio::fs::remove_file(&sidecar).await;

            audit
                .log(AuditEvent {
                    timestamp: chrono::Utc::now(),
                    operation_type: OperationType::Cleanup,
                    status: EventStatus::Completed,
                    container_id: None,
                    container_name: Some(container_name.clone()),
                    backup_filename: filename,
                    error_message: None,
                })
                .await;
        }
    }

    Ok(())
}

/// Test/debug convenience that discards the audit trail; production
/// callers (the Scheduler's batch monitor) use
/// [`run_with_lifecycle_audited`] with a real sink.
#[cfg(test)]
pub async fn run_with_lifecycle(backups_dir: &Path, lifecycle: u32) -> CoreResult<()> {
    run_with_lifecycle_audited(backups_dir, lifecycle, &crate::audit::NoopAuditSink).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_container_name() {
        assert_eq!(
            container_name_from_scheduled_filename("scheduled_web_20240101_020000.tar.gz"),
            Some("web".to_string())
        );
    }

    #[test]
    fn parses_container_name_containing_underscores() {
        assert_eq!(
            container_name_from_scheduled_filename("scheduled_my_web_app_20240101_020000.tar.gz"),
            Some("my_web_app".to_string())
        );
    }

    #[test]
    fn non_scheduled_filename_returns_none() {
        assert_eq!(
            container_name_from_scheduled_filename("web_20240101_020000.tar.gz"),
            None
        );
    }

    #[tokio::test]
    async fn prunes_beyond_lifecycle_keeping_most_recent() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path();

        for day in 1..=7 {
            let path = dir.join(format!("scheduled_x_2024010{day}_020000.tar.gz"));
            std::fs::write(&path, b"x").unwrap();
            let mtime = std::time::SystemTime::UNIX_EPOCH
                + std::time::Duration::from_secs(day as u64 * 86400);
            let file = std::fs::File::open(&path).unwrap();
            file.set_modified(mtime).unwrap();
        }
        // a manual archive that must never be touched.
        std::fs::write(dir.join("x_manual.tar.gz"), b"x").unwrap();

        run_with_lifecycle(dir, 3).await.unwrap();

        let remaining: Vec<_> = std::fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();

        let scheduled_remaining: Vec<_> =
            remaining.iter().filter(|f| f.starts_with("scheduled_")).collect();
        assert_eq!(scheduled_remaining.len(), 3);
        assert!(remaining.contains(&"x_manual.tar.gz".to_string()));
        assert!(remaining.iter().any(|f| f.contains("20240107")));
        assert!(remaining.iter().any(|f| f.contains("20240106")));
        assert!(remaining.iter().any(|f| f.contains("20240105")));
    }
}
