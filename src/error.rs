//! Error taxonomy for the backup/restore core.
//!
//! Every public entry point into the engine returns [`CoreError`] rather than
//! `anyhow::Error` so that callers (the HTTP layer, the scheduler, the CLI)
//! can match on a stable set of kinds instead of parsing strings. Internal
//! helper code that cannot itself violate these invariants is still free to
//! use `anyhow` and `?`.

use std::fmt;

use thiserror::Error;

/// The step names used by [`CoreError::StepFailure`], matching the six
/// progress steps of the Backup Engine (§4.4) and the Restore Engine phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Inspect,
    SerialiseConfig,
    ExportImage,
    EnumerateMounts,
    SnapshotVolumes,
    SealArchive,
    RestoreConfig,
    RestoreVolumes,
    RestoreImage,
    RestoreNetworks,
    CreateContainer,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Step::Inspect => "inspect",
            Step::SerialiseConfig => "serialise_config",
            Step::ExportImage => "export_image",
            Step::EnumerateMounts => "enumerate_mounts",
            Step::SnapshotVolumes => "snapshot_volumes",
            Step::SealArchive => "seal_archive",
            Step::RestoreConfig => "restore_config",
            Step::RestoreVolumes => "restore_volumes",
            Step::RestoreImage => "restore_image",
            Step::RestoreNetworks => "restore_networks",
            Step::CreateContainer => "create_container",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("docker daemon is unavailable: {0}")]
    DockerUnavailable(String),

    #[error("refused: the target is this service's own container or volume")]
    SelfReference,

    #[error("backup supervisor is busy")]
    Busy,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("malformed backup archive: {0}")]
    MalformedBackup(String),

    #[error("restore would overwrite existing volumes: {0:?}")]
    VolumeConflict(Vec<String>),

    #[error("container name already in use: {0}")]
    NameConflict(String),

    #[error("step failed: {step}: {message}")]
    StepFailure { step: Step, message: String },

    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("docker daemon error ({code}): {message}")]
    DaemonError { code: u16, message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type CoreResult<T> = Result<T, CoreError>;

impl From<bollard::errors::Error> for CoreError {
    fn from(err: bollard::errors::Error) -> Self {
        use bollard::errors::Error as BErr;
        match &err {
            BErr::DockerResponseServerError {
                status_code,
                message,
            } => CoreError::DaemonError {
                code: *status_code,
                message: message.clone(),
            },
            BErr::HyperResponseError { .. } | BErr::IOError { .. } => {
                CoreError::DockerUnavailable(err.to_string())
            }
            _ => CoreError::Other(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::MalformedBackup(err.to_string())
    }
}

impl CoreError {
    pub fn step(step: Step, message: impl Into<String>) -> Self {
        CoreError::StepFailure {
            step,
            message: message.into(),
        }
    }

    /// A string that is safe to hand back to an HTTP client verbatim,
    /// matching spec.md §7's "the string is safe to display" rule.
    pub fn public_message(&self) -> String {
        self.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_failure_carries_step_name_in_message() {
        let err = CoreError::step(Step::SealArchive, "gzip stream truncated");
        assert!(err.to_string().contains("seal_archive"));
        assert!(err.to_string().contains("gzip stream truncated"));
    }

    #[test]
    fn public_message_never_panics_on_any_variant() {
        let variants = vec![
            CoreError::DockerUnavailable("down".into()),
            CoreError::SelfReference,
            CoreError::Busy,
            CoreError::NotFound("archive".into()),
            CoreError::VolumeConflict(vec!["dbdata".into()]),
        ];
        for v in variants {
            assert!(!v.public_message().is_empty());
        }
    }
}
