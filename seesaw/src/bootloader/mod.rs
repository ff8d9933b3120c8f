//! Bootloader drivers.
//!
//! Each variant persists three pieces of state the running system and the
//! bootloader both read: the boot mode, the rootfs slot to pick on the next
//! boot, and (on some variants) a stamp file backing the bootloader's
//! one-shot try semantics.

use std::path::Path;

use crate::{
    error::UpgradeError,
    partitions::{RootfsTag, RootfsTags},
};

pub mod grub;
pub mod uboot;

pub use grub::GrubBootloader;
pub use uboot::UbootBootloader;

/// Variable naming the rootfs slot the bootloader selects on the next boot.
pub const ROOTFS_VAR: &str = "snappy_ab";

/// Variable recording whether the upcoming boot is tentative. Set to `try`
/// when an upgrade is staged; the booted system flips it back to `default`
/// once userspace is reached.
pub const BOOTMODE_VAR: &str = "snappy_mode";

pub const BOOTMODE_TRY: &str = "try";
pub const BOOTMODE_DEFAULT: &str = "default";

pub trait Bootloader {
    /// Stable identifier, also matched against the hardware spec.
    fn name(&self) -> &'static str;

    /// True iff this variant's signature files exist on disk.
    fn installed(&self) -> bool;

    /// Reads one variable. A missing variable is an empty string, not an
    /// error.
    fn get_boot_var(&self, name: &str) -> Result<String, UpgradeError>;

    /// Writes one variable. The stored form is the literal `name=value`
    /// line, never quoted, and the write appears atomic to a concurrent
    /// reader.
    fn set_boot_var(&self, name: &str, value: &str) -> Result<(), UpgradeError>;

    /// All name=value pairs currently stored by the bootloader.
    fn get_all_boot_vars(&self) -> Result<Vec<(String, String)>, UpgradeError>;

    /// The rootfs tag the bootloader will use on the next boot, as the
    /// bootloader itself sees it. Distinct from [`Self::other_rootfs_tag`],
    /// which is what partition classification derived.
    fn get_next_boot_rootfs(&self) -> Result<String, UpgradeError>;

    /// Tag of the currently-running rootfs.
    fn rootfs_tag(&self) -> RootfsTag;

    /// Tag of the inactive rootfs.
    fn other_rootfs_tag(&self) -> RootfsTag;

    /// Stages the next boot on the other rootfs: `next_rootfs = other`,
    /// `bootmode = try`.
    fn toggle_rootfs(&self) -> Result<(), UpgradeError>;

    /// Commits the current boot: `bootmode = default`, plus whatever
    /// variant-specific cleanup (stamp removal) the one-shot machinery
    /// needs.
    fn mark_current_boot_successful(&self) -> Result<(), UpgradeError>;

    /// Copies per-rootfs boot assets from the current slot to the other
    /// slot before an upgrade unpacks. No-op on variants whose bootloader
    /// reads a shared config.
    fn sync_boot_files(&self) -> Result<(), UpgradeError>;

    /// Consumes the upgrade's hardware spec and places kernel, initrd and
    /// device trees into the other boot slot. No-op on generic-PC variants.
    fn handle_assets(&self) -> Result<(), UpgradeError>;
}

/// Picks the installed bootloader.
///
/// The candidate order is fixed at build time and is the sole tie-breaker:
/// U-Boot is probed first, then GRUB.
pub fn select(
    root: impl AsRef<Path>,
    tags: RootfsTags,
    dual: bool,
) -> Result<Box<dyn Bootloader>, UpgradeError> {
    let candidates: [Box<dyn Bootloader>; 2] = [
        Box::new(UbootBootloader::new(tags, dual).with_root(root.as_ref())),
        Box::new(GrubBootloader::new(tags).with_root(root.as_ref())),
    ];

    candidates
        .into_iter()
        .find(|b| b.installed())
        .ok_or(UpgradeError::BootloaderUnknown)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs;

    use tempfile::tempdir;

    fn tags() -> RootfsTags {
        RootfsTags {
            current: RootfsTag('a'),
            other: RootfsTag('b'),
        }
    }

    #[test]
    fn test_select_prefers_uboot() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("boot/uboot")).unwrap();
        fs::write(dir.path().join("boot/uboot/uEnv.txt"), "").unwrap();
        fs::create_dir_all(dir.path().join("boot/grub")).unwrap();
        fs::write(dir.path().join("boot/grub/grub.cfg"), "").unwrap();
        fs::create_dir_all(dir.path().join("usr/sbin")).unwrap();
        fs::write(dir.path().join("usr/sbin/update-grub"), "").unwrap();

        let bootloader = select(dir.path(), tags(), true).unwrap();
        assert_eq!(bootloader.name(), "u-boot");
    }

    #[test]
    fn test_select_falls_back_to_grub() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("boot/grub")).unwrap();
        fs::write(dir.path().join("boot/grub/grub.cfg"), "").unwrap();
        fs::create_dir_all(dir.path().join("usr/sbin")).unwrap();
        fs::write(dir.path().join("usr/sbin/update-grub"), "").unwrap();

        let bootloader = select(dir.path(), tags(), true).unwrap();
        assert_eq!(bootloader.name(), "grub");
    }

    #[test]
    fn test_select_none_installed() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            select(dir.path(), tags(), true),
            Err(UpgradeError::BootloaderUnknown)
        ));
    }
}
