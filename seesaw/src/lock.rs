use std::{
    fs::{File, OpenOptions},
    io,
    path::Path,
};

use fs2::FileExt;
use log::debug;
use nix::unistd::Uid;

use osutils::files;

use crate::{
    constants::{DIR_MODE, LOCK_FILE},
    error::UpgradeError,
};

/// Exclusive hold on the upgrade machinery, host-wide.
///
/// The flock is advisory and serialises this tool against itself; the guard
/// releases it on drop, so every exit path (success, error, panic unwind)
/// lets the next invocation through.
#[derive(Debug)]
pub struct UpgradeLock {
    _file: File,
}

impl UpgradeLock {
    /// Takes the exclusive lock below `cache_dir`.
    ///
    /// Mutating bootloader state or rootfs mounts requires uid 0, so that is
    /// checked before the lock file is even created. A held lock fails
    /// immediately with `OperationInProgress` — it does not wait.
    pub fn acquire(cache_dir: impl AsRef<Path>) -> Result<Self, UpgradeError> {
        if !Uid::effective().is_root() {
            return Err(UpgradeError::RequiresRoot);
        }

        Self::acquire_unchecked(cache_dir)
    }

    fn acquire_unchecked(cache_dir: impl AsRef<Path>) -> Result<Self, UpgradeError> {
        let path = cache_dir.as_ref().join(LOCK_FILE);
        files::create_dirs_mode(cache_dir.as_ref(), DIR_MODE)
            .map_err(|e| UpgradeError::LockFailed(io::Error::other(e)))?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(UpgradeError::LockFailed)?;

        file.try_lock_exclusive().map_err(|e| {
            if e.kind() == fs2::lock_contended_error().kind() {
                UpgradeError::OperationInProgress
            } else {
                UpgradeError::LockFailed(e)
            }
        })?;

        debug!("Acquired upgrade lock at {}", path.display());
        Ok(UpgradeLock { _file: file })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::tempdir;

    #[test]
    fn test_lock_is_exclusive() {
        let dir = tempdir().unwrap();

        let held = UpgradeLock::acquire_unchecked(dir.path()).unwrap();
        assert!(matches!(
            UpgradeLock::acquire_unchecked(dir.path()),
            Err(UpgradeError::OperationInProgress)
        ));

        // Dropping the guard releases the lock for the next acquisition.
        drop(held);
        UpgradeLock::acquire_unchecked(dir.path()).unwrap();
    }

    #[test]
    fn test_lock_creates_cache_dir() {
        let dir = tempdir().unwrap();
        let cache = dir.path().join("writable/cache");

        UpgradeLock::acquire_unchecked(&cache).unwrap();
        assert!(cache.join(LOCK_FILE).exists());
    }
}
