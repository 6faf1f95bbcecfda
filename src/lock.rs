//! File-based locking to prevent two daemons on one node.
//!
//! Uses flock-style advisory locking; two engines reconciling the same
//! firewall state would fight over every rule.

use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

/// A guard that holds an exclusive lock on the daemon lock file.
/// The lock is automatically released when the guard is dropped.
pub struct LockGuard {
    _file: File,
}

impl LockGuard {
    /// Attempt to acquire an exclusive lock on `lock_path`.
    /// Returns an error if another instance is already running.
    ///
    /// Uses OpenOptions with create+read+write to avoid TOCTOU race
    /// between file creation and lock acquisition.
    pub fn acquire(lock_path: &Path) -> Result<Self> {
        if let Some(parent) = lock_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).ok();
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(lock_path)
            .with_context(|| format!("Failed to open lock file: {:?}", lock_path))?;

        fs::set_permissions(lock_path, fs::Permissions::from_mode(0o600))
            .context("Failed to set lock file permissions")?;

        file.try_lock_exclusive().map_err(|_| {
            anyhow::anyhow!(
                "Another instance of edgeacl is already running.\n\
                 If you believe this is an error, remove the lock file: {:?}",
                lock_path
            )
        })?;

        Ok(Self { _file: file })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run").join("edgeacl.lock");

        let guard = LockGuard::acquire(&path).unwrap();
        assert!(LockGuard::acquire(&path).is_err());

        drop(guard);
        assert!(LockGuard::acquire(&path).is_ok());
    }

    #[test]
    fn test_lock_file_permissions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("edgeacl.lock");
        let _guard = LockGuard::acquire(&path).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
