pub mod backup;
pub mod restore;

pub use backup::BackupEngine;
pub use restore::{RestoreEngine, RestoreOutcome, RestoreRequest};
