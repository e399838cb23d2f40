//! Process-wide static configuration.
//!
//! Keeps the `Default`-able-struct-plus-TOML-load/save shape this crate has
//! always used for configuration, but reshapes the fields around the
//! knobs the backup/restore engine needs: the Docker socket path, the
//! `/backups` data root (spec.md §6 "Environment"), and the timeout
//! budgets of §5. Unlike `Schedule` (owned exclusively by the Scheduler and
//! mutated at runtime), `Config` is fixed for the lifetime of the process.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

static CONFIG: OnceLock<Config> = OnceLock::new();

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Root directory mounted into the container; `backups/` and `config/`
    /// live under it (spec.md §6 Environment).
    pub data_root: PathBuf,

    pub docker: DockerConfig,

    pub timeouts: Timeouts,

    /// Substrings that exclude a path from an archive (bind-mount backups
    /// only; named volumes are always captured in full).
    pub exclude_patterns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerConfig {
    pub host: String,
    pub tls: bool,
    pub cert_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Timeouts {
    pub helper_create_secs: u64,
    pub exec_secs: u64,
    pub volume_tar_secs: u64,
    pub image_save_secs: u64,
    pub seal_verify_secs: u64,
    pub download_all_secs: u64,
    pub restore_volume_secs: u64,
    pub scheduler_batch_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            helper_create_secs: 30,
            exec_secs: 30,
            volume_tar_secs: 300,
            image_save_secs: 300,
            seal_verify_secs: 600,
            download_all_secs: 1800,
            restore_volume_secs: 1200,
            scheduler_batch_secs: 3600,
        }
    }
}

impl Timeouts {
    pub fn seal_verify(&self) -> Duration {
        Duration::from_secs(self.seal_verify_secs)
    }
    pub fn volume_tar(&self) -> Duration {
        Duration::from_secs(self.volume_tar_secs)
    }
    pub fn image_save(&self) -> Duration {
        Duration::from_secs(self.image_save_secs)
    }
    pub fn helper_create(&self) -> Duration {
        Duration::from_secs(self.helper_create_secs)
    }
    pub fn exec(&self) -> Duration {
        Duration::from_secs(self.exec_secs)
    }
    pub fn restore_volume(&self) -> Duration {
        Duration::from_secs(self.restore_volume_secs)
    }
    pub fn scheduler_batch(&self) -> Duration {
        Duration::from_secs(self.scheduler_batch_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("/backups"),
            docker: DockerConfig {
                host: "unix:///var/run/docker.sock".to_string(),
                tls: false,
                cert_path: None,
            },
            timeouts: Timeouts::default(),
            exclude_patterns: Vec::new(),
        }
    }
}

#[allow(dead_code)]
impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.data_root.join("backups")
    }

    pub fn config_dir(&self) -> PathBuf {
        self.data_root.join("config")
    }

    pub fn ensure_backup_dir(&self) -> Result<()> {
        if !self.backups_dir().exists() {
            std::fs::create_dir_all(self.backups_dir())?;
        }
        Ok(())
    }

    /// First-run migration: move legacy files sitting directly under
    /// `data_root` into `backups/` and `config/` (spec.md §6 Environment).
    pub fn migrate_legacy_layout(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.backups_dir())?;
        std::fs::create_dir_all(self.config_dir())?;

        let entries = match std::fs::read_dir(&self.data_root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };

        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let name = entry.file_name();
            let name_str = name.to_string_lossy();
            let dest = if name_str.ends_with(".tar.gz") || name_str.ends_with(".tar.gz.json") {
                self.backups_dir().join(&name)
            } else if name_str.ends_with(".db") || name_str.ends_with(".key") {
                self.config_dir().join(&name)
            } else {
                continue;
            };
            if !dest.exists() {
                std::fs::rename(&path, &dest)?;
            }
        }
        Ok(())
    }

    /// Checks the data root is writable; a read-only mount degrades the
    /// service to read-only per spec.md §6 Environment.
    pub fn is_writable(&self) -> bool {
        let probe = self.data_root.join(".dockmon-write-probe");
        match std::fs::write(&probe, b"") {
            Ok(()) => {
                let _ = std::fs::remove_file(&probe);
                true
            }
            Err(_) => false,
        }
    }

    pub fn init(config: Config) -> std::result::Result<(), Config> {
        CONFIG.set(config)
    }

    pub fn global() -> &'static Config {
        CONFIG.get_or_init(Config::default)
    }
}

/// Default data-root discovery used when no explicit override is configured
/// (e.g. running outside the container during development); prefers a
/// platform data directory, falling back to the current directory.
pub fn discover_default_data_root() -> PathBuf {
    dirs::data_local_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("dockmon")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_timeouts_match_spec_budgets() {
        let t = Timeouts::default();
        assert_eq!(t.seal_verify_secs, 600);
        assert_eq!(t.download_all_secs, 1800);
        assert_eq!(t.restore_volume_secs, 1200);
        assert_eq!(t.scheduler_batch_secs, 3600);
    }

    #[test]
    fn save_and_load_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.toml");
        let cfg = Config::default();
        cfg.save_to_file(&path).unwrap();
        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.docker.host, cfg.docker.host);
    }

    #[test]
    fn migrate_legacy_layout_moves_known_extensions() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = Config {
            data_root: tmp.path().to_path_buf(),
            ..Config::default()
        };
        std::fs::write(tmp.path().join("web_20240101_000000.tar.gz"), b"x").unwrap();
        std::fs::write(tmp.path().join("app.db"), b"x").unwrap();

        cfg.migrate_legacy_layout().unwrap();

        assert!(
            cfg.backups_dir()
                .join("web_20240101_000000.tar.gz")
                .exists()
        );
        assert!(cfg.config_dir().join("app.db").exists());
    }
}
