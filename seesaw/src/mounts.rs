use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex, Weak},
};

use log::debug;

use osutils::{fsck, mount};

use crate::error::UpgradeError;

/// Which of the two registries a mount belongs to. Bind mounts always come
/// down before the mounts they were grafted onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountKind {
    Plain,
    Bind,
}

/// The set of mounts this process currently owns, in creation order.
///
/// Non-empty state on abnormal exit is a defect: every exit path, including
/// the signal path, runs [`undo_all`] over both registries.
#[derive(Debug, Default)]
pub struct MountRegistry {
    mounts: Vec<PathBuf>,
    bind_mounts: Vec<PathBuf>,
}

impl MountRegistry {
    fn list_mut(&mut self, kind: MountKind) -> &mut Vec<PathBuf> {
        match kind {
            MountKind::Plain => &mut self.mounts,
            MountKind::Bind => &mut self.bind_mounts,
        }
    }

    fn record(&mut self, kind: MountKind, target: &Path) {
        let list = self.list_mut(kind);
        if !list.iter().any(|t| t == target) {
            list.push(target.to_owned());
        }
    }

    /// Removes `target` from whichever registry contains it.
    fn forget(&mut self, target: &Path) {
        self.mounts.retain(|t| t != target);
        self.bind_mounts.retain(|t| t != target);
    }

    pub fn is_empty(&self) -> bool {
        self.mounts.is_empty() && self.bind_mounts.is_empty()
    }

    #[cfg(test)]
    fn entries(&self, kind: MountKind) -> &[PathBuf] {
        match kind {
            MountKind::Plain => &self.mounts,
            MountKind::Bind => &self.bind_mounts,
        }
    }
}

/// Unmounts one registry's entries in strict reverse-insertion order.
///
/// The first unmount failure aborts the sweep; entries not yet processed
/// (and the failing one) stay registered so a retry can pick up where this
/// attempt stopped. Safe to call on an empty registry, and from the signal
/// thread.
pub fn undo_all(registry: &Mutex<MountRegistry>, kind: MountKind) -> Result<(), UpgradeError> {
    loop {
        let Some(target) = registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .list_mut(kind)
            .last()
            .cloned()
        else {
            return Ok(());
        };

        mount::umount(&target).map_err(|source| UpgradeError::UnmountFailed {
            target: target.clone(),
            source,
        })?;

        registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .forget(&target);
    }
}

/// Performs mounts and unmounts, recording every mount this process creates
/// so teardown can unwind them.
#[derive(Debug, Default)]
pub struct MountManager {
    registry: Arc<Mutex<MountRegistry>>,
}

impl MountManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// A weak view for the signal handler. The handler must never keep the
    /// registry alive on its own.
    pub fn registry_weak(&self) -> Weak<Mutex<MountRegistry>> {
        Arc::downgrade(&self.registry)
    }

    pub fn is_clean(&self) -> bool {
        self.registry.lock().unwrap().is_empty()
    }

    /// Mounts `source` on `target`, registering the target on success.
    pub fn mount(
        &self,
        source: impl AsRef<Path>,
        target: impl AsRef<Path>,
        options: &str,
    ) -> Result<(), UpgradeError> {
        mount::mount(source.as_ref(), target.as_ref(), options).map_err(|source| {
            UpgradeError::MountFailed {
                target: target.as_ref().to_owned(),
                source,
            }
        })?;
        self.registry
            .lock()
            .unwrap()
            .record(MountKind::Plain, target.as_ref());
        Ok(())
    }

    /// Bind-mounts `source` on `target`, registering the target on success.
    pub fn bindmount(
        &self,
        source: impl AsRef<Path>,
        target: impl AsRef<Path>,
    ) -> Result<(), UpgradeError> {
        mount::mount(source.as_ref(), target.as_ref(), "bind").map_err(|source| {
            UpgradeError::MountFailed {
                target: target.as_ref().to_owned(),
                source,
            }
        })?;
        self.registry
            .lock()
            .unwrap()
            .record(MountKind::Bind, target.as_ref());
        Ok(())
    }

    /// Unmounts `target` and drops it from whichever registry holds it.
    pub fn unmount(&self, target: impl AsRef<Path>) -> Result<(), UpgradeError> {
        mount::umount(target.as_ref()).map_err(|source| UpgradeError::UnmountFailed {
            target: target.as_ref().to_owned(),
            source,
        })?;
        self.registry.lock().unwrap().forget(target.as_ref());
        Ok(())
    }

    /// Runs fsck on a device that is about to be mounted read-write.
    pub fn fsck(&self, device: impl AsRef<Path>) -> Result<(), UpgradeError> {
        fsck::run(device.as_ref()).map_err(|source| UpgradeError::FsckFailed {
            device: device.as_ref().to_owned(),
            source,
        })
    }

    pub fn undo_bind_mounts(&self) -> Result<(), UpgradeError> {
        debug!("Unwinding bind mounts");
        undo_all(&self.registry, MountKind::Bind)
    }

    pub fn undo_mounts(&self) -> Result<(), UpgradeError> {
        debug!("Unwinding mounts");
        undo_all(&self.registry, MountKind::Plain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_is_ordered_and_deduplicated() {
        let mut registry = MountRegistry::default();
        registry.record(MountKind::Plain, Path::new("/a"));
        registry.record(MountKind::Plain, Path::new("/b"));
        registry.record(MountKind::Plain, Path::new("/a"));

        assert_eq!(
            registry.entries(MountKind::Plain),
            &[PathBuf::from("/a"), PathBuf::from("/b")]
        );
    }

    #[test]
    fn test_forget_searches_both_registries() {
        let mut registry = MountRegistry::default();
        registry.record(MountKind::Plain, Path::new("/a"));
        registry.record(MountKind::Bind, Path::new("/a/dev"));
        assert!(!registry.is_empty());

        registry.forget(Path::new("/a/dev"));
        registry.forget(Path::new("/a"));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_undo_all_empty_registry() {
        let registry = Mutex::new(MountRegistry::default());
        undo_all(&registry, MountKind::Bind).unwrap();
        undo_all(&registry, MountKind::Plain).unwrap();
    }

    #[test]
    fn test_undo_all_keeps_unfinished_entries_on_error() {
        // Nothing here is actually mounted, so umount(8) fails on the first
        // (= last-registered) entry and the sweep must stop with the
        // registry intact.
        let registry = Mutex::new(MountRegistry::default());
        registry
            .lock()
            .unwrap()
            .record(MountKind::Plain, Path::new("/nonexistent-mount-1"));
        registry
            .lock()
            .unwrap()
            .record(MountKind::Plain, Path::new("/nonexistent-mount-2"));

        let err = undo_all(&registry, MountKind::Plain).unwrap_err();
        match err {
            UpgradeError::UnmountFailed { target, .. } => {
                assert_eq!(target, PathBuf::from("/nonexistent-mount-2"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(registry.lock().unwrap().entries(MountKind::Plain).len(), 2);
    }
}
