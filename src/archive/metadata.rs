//! The small JSON records that travel inside and alongside an archive
//! (spec.md §3 "Backup Metadata", §6 "Companion sidecar").

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupType {
    Manual,
    Scheduled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerRunState {
    Running,
    Stopped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupMetadata {
    pub container_id: String,
    pub container_name: String,
    pub backup_date: DateTime<Utc>,
    pub backup_type: BackupType,
    pub image: String,
    pub image_backed_up: bool,
    pub status: ContainerRunState,
    pub server_name: String,
}

/// `<archive>.tar.gz.json`, kept next to the archive body for cheap listing
/// without downloading the tar (spec.md §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sidecar {
    pub server_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountKind {
    Volume,
    Bind,
}

/// One entry of `volumes_info.json` (spec.md §3 "Volume Info"). The
/// authoritative destination comes from `HostConfig.Binds`, not `Mounts`,
/// because the bind string survives container renames while the resolved
/// mount does not (spec.md §4.4 step 4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeInfoEntry {
    #[serde(rename = "type")]
    pub kind: MountKind,
    pub name: Option<String>,
    pub destination: String,
    pub driver: Option<String>,
    pub source: Option<String>,
}

/// `<vol>_metadata.json`, one per named volume inside `volumes/`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeMetadata {
    pub name: String,
    pub destination: String,
    pub captured_at: DateTime<Utc>,
    pub placeholder: bool,
    pub placeholder_reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backup_type_serialises_lowercase() {
        let json = serde_json::to_string(&BackupType::Scheduled).unwrap();
        assert_eq!(json, "\"scheduled\"");
    }

    #[test]
    fn metadata_round_trips_through_json() {
        let meta = BackupMetadata {
            container_id: "abc".into(),
            container_name: "web".into(),
            backup_date: Utc::now(),
            backup_type: BackupType::Manual,
            image: "nginx:1.25".into(),
            image_backed_up: true,
            status: ContainerRunState::Running,
            server_name: "host-1".into(),
        };
        let json = serde_json::to_string(&meta).unwrap();
        let back: BackupMetadata = serde_json::from_str(&json).unwrap();
        assert_eq!(back.container_name, "web");
        assert_eq!(back.backup_type, meta.backup_type);
    }
}
