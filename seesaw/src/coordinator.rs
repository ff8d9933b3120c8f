use std::{
    path::{Path, PathBuf},
    sync::{Mutex, Weak},
};

use log::{debug, error, info};

use osutils::{files, lsblk::BlockDevice, mountpoint};

use crate::{
    bootloader::{self, Bootloader, BOOTMODE_TRY, BOOTMODE_VAR},
    constants::{CACHE_DIR, CHROOT_MOUNTS, DIR_MODE, MOUNT_TARGET},
    error::UpgradeError,
    lock::UpgradeLock,
    mounts::{MountManager, MountRegistry},
    partitions::PartitionRoles,
};

/// How the inactive root should be mounted for a scoped operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountMode {
    ReadOnly,
    ReadWrite,
}

/// Drives the try/commit upgrade protocol over the partition model, the
/// mount manager and the installed bootloader.
#[derive(Debug)]
pub struct UpgradeCoordinator {
    roles: PartitionRoles,
    mounts: MountManager,
    root: PathBuf,
}

impl UpgradeCoordinator {
    /// Enumerates and classifies the system's partitions. Mounts nothing;
    /// operations that need the inactive root mount it themselves, after
    /// taking the upgrade lock.
    pub fn discover() -> Result<Self, UpgradeError> {
        Ok(Self::new(PartitionRoles::discover()?))
    }

    pub fn new(roles: PartitionRoles) -> Self {
        UpgradeCoordinator {
            roles,
            mounts: MountManager::new(),
            root: PathBuf::from("/"),
        }
    }

    /// Re-roots the scratch and bootloader paths, for tests.
    pub fn with_root(self, root: impl Into<PathBuf>) -> Self {
        UpgradeCoordinator {
            root: root.into(),
            ..self
        }
    }

    /// A weak view of the mount registry for the signal handler.
    pub fn registry_weak(&self) -> Weak<Mutex<MountRegistry>> {
        self.mounts.registry_weak()
    }

    /// True when this process owns no mounts.
    pub fn mounts_clean(&self) -> bool {
        self.mounts.is_clean()
    }

    pub fn roles(&self) -> &PartitionRoles {
        &self.roles
    }

    fn cache_dir(&self) -> PathBuf {
        self.root.join(CACHE_DIR)
    }

    /// Scratch directory the inactive root is mounted under.
    pub fn mount_target(&self) -> PathBuf {
        self.cache_dir().join(MOUNT_TARGET)
    }

    /// The inactive root. Only called on paths already gated on a dual
    /// topology.
    fn other_device(&self) -> Result<&BlockDevice, UpgradeError> {
        self.roles
            .other
            .as_ref()
            .ok_or(UpgradeError::TopologyUnrecognised)
    }

    /// Picks the installed bootloader variant for this system.
    pub fn bootloader(&self) -> Result<Box<dyn Bootloader>, UpgradeError> {
        let tags = self.roles.tags().ok_or(UpgradeError::BootloaderUnknown)?;
        bootloader::select(&self.root, tags, self.roles.is_dual())
    }

    /// Keeps the inactive root available read-only under the mount target.
    /// A path that is already a mountpoint is left alone. No-op on
    /// single-root systems. Callers hold the upgrade lock.
    fn ensure_other_mounted_ro(&self) -> Result<(), UpgradeError> {
        if !self.roles.is_dual() {
            return Ok(());
        }

        let target = self.mount_target();
        if matches!(mountpoint::check_is_mountpoint(&target), Ok(true)) {
            debug!("'{}' is already mounted", target.display());
            return Ok(());
        }

        self.mount_other(MountMode::ReadOnly)
    }

    fn make_mount_point(&self) -> Result<(), UpgradeError> {
        files::create_dirs_mode(self.mount_target(), DIR_MODE).map_err(|source| {
            UpgradeError::MountFailed {
                target: self.mount_target(),
                source,
            }
        })
    }

    fn mount_other(&self, mode: MountMode) -> Result<(), UpgradeError> {
        self.make_mount_point()?;
        let device = self.other_device()?.device_path.clone();

        match mode {
            MountMode::ReadOnly => self.mounts.mount(&device, self.mount_target(), "ro"),
            MountMode::ReadWrite => {
                self.mounts.fsck(&device)?;
                self.mounts.mount(&device, self.mount_target(), "")
            }
        }
    }

    /// Remounts the already-mounted inactive root.
    ///
    /// Going read-write is not a simple toggle: the partition is unmounted,
    /// checked, and mounted fresh. Going back read-only is a plain remount.
    fn remount_other(&self, mode: MountMode) -> Result<(), UpgradeError> {
        let device = self.other_device()?.device_path.clone();
        let target = self.mount_target();

        match mode {
            MountMode::ReadWrite => {
                self.mounts.unmount(&target)?;
                self.mounts.fsck(&device)?;
                self.mounts.mount(&device, &target, "")
            }
            MountMode::ReadOnly => self.mounts.mount(&device, &target, "remount,ro"),
        }
    }

    /// Grafts the filesystems a chrooted bootloader updater needs onto the
    /// inactive root: /dev, /proc, /sys, and the boot partition when a
    /// mounted one exists.
    fn bindmount_required_filesystems(&self) -> Result<(), UpgradeError> {
        let target_base = self.mount_target();

        for fs_path in CHROOT_MOUNTS {
            self.mounts
                .bindmount(fs_path, join_relative(&target_base, Path::new(fs_path)))?;
        }

        if let Some(boot) = &self.roles.boot {
            if let Some(boot_mountpoint) = &boot.mountpoint {
                self.mounts.bindmount(
                    boot_mountpoint,
                    join_relative(&target_base, boot_mountpoint),
                )?;
            }
        }

        Ok(())
    }

    /// Stages the next boot on the inactive rootfs.
    ///
    /// Single-root systems have nowhere to switch to, so this is a silent
    /// no-op. On failure the system stays bootable from the original
    /// rootfs: try mode is never entered without the full variable write
    /// sequence of the selected variant.
    pub fn update_bootloader(&self) -> Result<(), UpgradeError> {
        if !self.roles.is_dual() {
            debug!("Single root partition, no bootloader update needed");
            return Ok(());
        }

        let _lock = UpgradeLock::acquire(self.cache_dir())?;
        self.ensure_other_mounted_ro()?;
        self.toggle_bootloader_rootfs()
    }

    fn toggle_bootloader_rootfs(&self) -> Result<(), UpgradeError> {
        self.remount_other(MountMode::ReadWrite)?;

        let staged = self.bindmount_required_filesystems().and_then(|()| {
            let bootloader = self.bootloader()?;
            info!("Toggling next-boot rootfs via '{}'", bootloader.name());
            bootloader.toggle_rootfs()
        });

        // From here on teardown is unconditional; whatever failed above is
        // reported only after the mounts are unwound.
        let unbind = self.mounts.undo_bind_mounts();
        if let Err(e) = &unbind {
            error!("Failed to unwind chroot bind mounts: {e}");
        }

        let demote = self.remount_other(MountMode::ReadOnly);
        if let Err(e) = &demote {
            error!("Failed to remount inactive root read-only: {e}");
        }

        staged?;
        unbind?;
        demote?;

        self.bootloader()?.handle_assets()
    }

    /// Commits the current boot. Requires no mounts.
    pub fn mark_boot_successful(&self) -> Result<(), UpgradeError> {
        let _lock = UpgradeLock::acquire(self.cache_dir())?;
        self.bootloader()?.mark_current_boot_successful()
    }

    /// Copies per-rootfs boot files from the current slot to the other
    /// slot. Called before an upgrade payload is unpacked.
    pub fn sync_bootloader_files(&self) -> Result<(), UpgradeError> {
        let _lock = UpgradeLock::acquire(self.cache_dir())?;
        self.bootloader()?.sync_boot_files()
    }

    /// True iff the bootloader is in try mode and aimed at the inactive
    /// rootfs. Any failure to read reports false.
    pub fn next_boot_is_other(&self) -> bool {
        let Ok(bootloader) = self.bootloader() else {
            return false;
        };

        let Ok(mode) = bootloader.get_boot_var(BOOTMODE_VAR) else {
            return false;
        };
        if mode != BOOTMODE_TRY {
            return false;
        }

        let Ok(next) = bootloader.get_next_boot_rootfs() else {
            return false;
        };
        next == bootloader.other_rootfs_tag().to_string()
    }

    /// Runs `f` against the inactive root's tree.
    ///
    /// On single-root systems the only root there is, is `/`. On dual-root
    /// systems the inactive root is made available per `mode`; a
    /// read-write mount is demoted back to read-only on the way out,
    /// whether or not `f` succeeded.
    pub fn run_with_other<T>(
        &self,
        mode: MountMode,
        f: impl FnOnce(&Path) -> Result<T, UpgradeError>,
    ) -> Result<T, UpgradeError> {
        if !self.roles.is_dual() {
            return f(Path::new("/"));
        }

        match mode {
            MountMode::ReadOnly => {
                // Even a read-only mount mutates the registry and the mount
                // table, so it is serialised like every other mount.
                let _lock = UpgradeLock::acquire(self.cache_dir())?;
                self.ensure_other_mounted_ro()?;
                f(&self.mount_target())
            }
            MountMode::ReadWrite => {
                let _lock = UpgradeLock::acquire(self.cache_dir())?;
                self.ensure_other_mounted_ro()?;
                self.remount_other(MountMode::ReadWrite)?;

                let result = f(&self.mount_target());

                let demote = self.remount_other(MountMode::ReadOnly);
                if let Err(e) = &demote {
                    error!("Failed to remount inactive root read-only: {e}");
                }

                match (result, demote) {
                    (Err(e), _) => Err(e),
                    (Ok(_), Err(e)) => Err(e),
                    (Ok(v), Ok(())) => Ok(v),
                }
            }
        }
    }
}

/// Joins an absolute path onto a base directory, e.g. `/dev` under
/// `/writable/cache/system` becomes `/writable/cache/system/dev`.
fn join_relative(base: &Path, abs: &Path) -> PathBuf {
    base.join(abs.strip_prefix("/").unwrap_or(abs))
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs;

    use osutils::lsblk::BlockDevice;
    use tempfile::tempdir;

    fn device(label: &str, node: &str, mountpoint: Option<&str>) -> BlockDevice {
        BlockDevice {
            label: label.into(),
            device_path: format!("/dev/{node}").into(),
            parent_path: "/dev/sda".into(),
            mountpoint: mountpoint.map(Into::into),
        }
    }

    fn dual_coordinator(root: &Path) -> UpgradeCoordinator {
        let roles = PartitionRoles::classify(vec![
            device("system-a", "sda2", Some("/")),
            device("system-b", "sda3", None),
            device("writable", "sda4", Some("/writable")),
        ])
        .unwrap();
        UpgradeCoordinator::new(roles).with_root(root)
    }

    fn single_coordinator() -> UpgradeCoordinator {
        let roles = PartitionRoles::classify(vec![
            device("system-a", "sda2", Some("/")),
            device("writable", "sda3", Some("/writable")),
        ])
        .unwrap();
        UpgradeCoordinator::new(roles)
    }

    fn install_uboot(root: &Path, env_content: &str) {
        fs::create_dir_all(root.join("boot/uboot")).unwrap();
        fs::write(root.join("boot/uboot/uEnv.txt"), "").unwrap();
        fs::write(root.join("boot/uboot/snappy-system.txt"), env_content).unwrap();
    }

    #[test]
    fn test_update_bootloader_single_root_is_noop() {
        let coordinator = single_coordinator();
        coordinator.update_bootloader().unwrap();
        assert!(coordinator.mounts_clean());
    }

    #[test]
    fn test_ensure_other_mounted_single_root_is_noop() {
        let coordinator = single_coordinator();
        coordinator.ensure_other_mounted_ro().unwrap();
        assert!(coordinator.mounts_clean());
    }

    #[test]
    fn test_run_with_other_single_root_passes_slash() {
        let coordinator = single_coordinator();
        let seen = coordinator
            .run_with_other(MountMode::ReadOnly, |path| Ok(path.to_owned()))
            .unwrap();
        assert_eq!(seen, PathBuf::from("/"));
    }

    #[test]
    fn test_mount_target_under_writable_cache() {
        let dir = tempdir().unwrap();
        let coordinator = dual_coordinator(dir.path());
        assert_eq!(
            coordinator.mount_target(),
            dir.path().join("writable/cache/system")
        );
    }

    #[test]
    fn test_next_boot_is_other_truth_table() {
        let dir = tempdir().unwrap();
        let coordinator = dual_coordinator(dir.path());

        // No bootloader installed at all.
        assert!(!coordinator.next_boot_is_other());

        install_uboot(dir.path(), "snappy_mode=try\nsnappy_ab=b\n");
        assert!(coordinator.next_boot_is_other());

        install_uboot(dir.path(), "snappy_mode=default\nsnappy_ab=b\n");
        assert!(!coordinator.next_boot_is_other());

        install_uboot(dir.path(), "snappy_mode=try\nsnappy_ab=a\n");
        assert!(!coordinator.next_boot_is_other());

        install_uboot(dir.path(), "");
        assert!(!coordinator.next_boot_is_other());
    }

    #[test]
    fn test_bootloader_selection_requires_dual_roots() {
        let coordinator = single_coordinator();
        assert!(matches!(
            coordinator.bootloader(),
            Err(UpgradeError::BootloaderUnknown)
        ));
    }

    #[test]
    fn test_join_relative() {
        assert_eq!(
            join_relative(Path::new("/writable/cache/system"), Path::new("/dev")),
            PathBuf::from("/writable/cache/system/dev")
        );
        assert_eq!(
            join_relative(Path::new("/base"), Path::new("/boot/uboot")),
            PathBuf::from("/base/boot/uboot")
        );
    }
}
