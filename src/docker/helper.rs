//! The ephemeral helper container pattern (spec.md §4.3).
//!
//! Moving bytes in or out of a named volume without mounting it in the
//! service's own container means spinning up a disposable `busybox`
//! container with the volume bind-mounted, running a `tar` pipeline inside
//! it via `docker exec`, and tearing it down on every exit path — the same
//! shape as `VolumeManager::backup_volume`/`restore_volume` in the ecosystem
//! (ephemeral alpine container + bind mount + exec), generalised here to a
//! long-lived helper reused across both the create-container step and the
//! exec step so orphans can be swept if the process dies mid-operation.

use rand::Rng;

pub const BACKUP_HELPER_PREFIX: &str = "backup-temp-";
pub const RESTORE_HELPER_PREFIX: &str = "restore-temp-";

pub const HELPER_MOUNT_BACKUP: &str = "/backup-volume";
pub const HELPER_MOUNT_RESTORE: &str = "/restore-volume";

pub const HELPER_IMAGE: &str = "busybox";

/// Builds a unique helper container name: `<prefix><volume>-<random6>`.
///
/// The reserved prefixes let the container-listing layer filter helpers out
/// of normal container listings and let the orphan sweep at startup
/// recognise leftovers from a prior crash (spec.md §4.3 invariants).
pub fn helper_name(prefix: &str, volume_name: &str) -> String {
    let suffix: String = {
        let mut rng = rand::thread_rng();
        (0..6)
            .map(|_| {
                const CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
                CHARS[rng.gen_range(0..CHARS.len())] as char
            })
            .collect()
    };
    let sanitized: String = volume_name
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' { c } else { '-' })
        .collect();
    format!("{prefix}{sanitized}-{suffix}")
}

pub fn is_helper_name(name: &str) -> bool {
    name.starts_with(BACKUP_HELPER_PREFIX) || name.starts_with(RESTORE_HELPER_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn helper_name_carries_prefix_and_volume() {
        let name = helper_name(BACKUP_HELPER_PREFIX, "webdata");
        assert!(name.starts_with("backup-temp-webdata-"));
        assert!(is_helper_name(&name));
    }

    #[test]
    fn helper_name_sanitizes_unsafe_characters() {
        let name = helper_name(RESTORE_HELPER_PREFIX, "my/volume:1");
        assert!(!name.contains('/'));
        assert!(!name.contains(':'));
    }

    #[test]
    fn distinguishes_non_helper_names() {
        assert!(!is_helper_name("web"));
        assert!(!is_helper_name("nginx-1"));
    }
}
