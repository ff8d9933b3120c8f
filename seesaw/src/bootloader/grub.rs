use std::path::PathBuf;

use anyhow::anyhow;
use log::debug;

use osutils::{dependencies::Dependency, envfile};

use crate::{
    bootloader::{Bootloader, BOOTMODE_DEFAULT, BOOTMODE_TRY, BOOTMODE_VAR, ROOTFS_VAR},
    constants::{CACHE_DIR, MOUNT_TARGET},
    error::UpgradeError,
    partitions::{RootfsTag, RootfsTags},
};

const GRUB_DIR: &str = "boot/grub";
const GRUB_CONFIG_FILE: &str = "grub.cfg";

/// The bootloader's environment blob. Only ever touched through
/// grub-editenv; the on-disk format is GRUB's business.
const GRUB_ENV_FILE: &str = "grubenv";

/// Path of the config updater inside each rootfs.
const GRUB_UPDATE_CMD: &str = "/usr/sbin/update-grub";

pub const GRUB_NAME: &str = "grub";

/// GRUB driver. Both rootfs slots share one config, regenerated from inside
/// whichever rootfs is being staged, so there are no per-slot boot assets
/// to sync or install.
#[derive(Debug)]
pub struct GrubBootloader {
    root: PathBuf,
    tags: RootfsTags,
}

impl GrubBootloader {
    pub fn new(tags: RootfsTags) -> Self {
        GrubBootloader {
            root: PathBuf::from("/"),
            tags,
        }
    }

    /// Re-roots every path this driver touches, for tests.
    pub fn with_root(self, root: impl Into<PathBuf>) -> Self {
        GrubBootloader {
            root: root.into(),
            ..self
        }
    }

    fn config_file(&self) -> PathBuf {
        self.root.join(GRUB_DIR).join(GRUB_CONFIG_FILE)
    }

    fn env_file(&self) -> PathBuf {
        self.root.join(GRUB_DIR).join(GRUB_ENV_FILE)
    }

    fn update_cmd(&self) -> PathBuf {
        self.root.join(GRUB_UPDATE_CMD.trim_start_matches('/'))
    }

    /// Where the inactive root is mounted while being staged.
    fn other_rootfs_target(&self) -> PathBuf {
        self.root.join(CACHE_DIR).join(MOUNT_TARGET)
    }

    /// grub-editenv has no get verb; fetch the whole listing and search it
    /// ourselves.
    fn list_vars(&self) -> Result<String, UpgradeError> {
        Dependency::GrubEditenv
            .cmd()
            .arg(self.env_file())
            .arg("list")
            .output_and_check()
            .map_err(|source| UpgradeError::BootVarReadFailed {
                name: "*".into(),
                source: anyhow!(source),
            })
    }
}

impl Bootloader for GrubBootloader {
    fn name(&self) -> &'static str {
        GRUB_NAME
    }

    fn installed(&self) -> bool {
        self.config_file().exists() && self.update_cmd().exists()
    }

    fn get_boot_var(&self, name: &str) -> Result<String, UpgradeError> {
        Ok(envfile::lookup(&self.list_vars()?, name).unwrap_or_default())
    }

    /// The value is passed as a single `name=value` argument. No shell is
    /// involved, so no quoting: quotes would be stored verbatim in the
    /// environment blob.
    fn set_boot_var(&self, name: &str, value: &str) -> Result<(), UpgradeError> {
        Dependency::GrubEditenv
            .cmd()
            .arg(self.env_file())
            .arg("set")
            .arg(format!("{name}={value}"))
            .run_and_check()
            .map_err(|source| UpgradeError::BootVarWriteFailed {
                name: name.into(),
                source: anyhow!(source),
            })
    }

    fn get_all_boot_vars(&self) -> Result<Vec<(String, String)>, UpgradeError> {
        Ok(envfile::parse_str(&self.list_vars()?))
    }

    fn get_next_boot_rootfs(&self) -> Result<String, UpgradeError> {
        self.get_boot_var(ROOTFS_VAR)
    }

    fn rootfs_tag(&self) -> RootfsTag {
        self.tags.current
    }

    fn other_rootfs_tag(&self) -> RootfsTag {
        self.tags.other
    }

    /// Regenerates the shared config from inside the other rootfs, then
    /// stages the boot variables.
    ///
    /// The variables go down in two separate grub-editenv invocations, try
    /// mode first. A crash between the two leaves `snappy_mode=try` with
    /// the old `snappy_ab`; the bootloader's one-shot semantics then fall
    /// back to the original rootfs, which is safe.
    fn toggle_rootfs(&self) -> Result<(), UpgradeError> {
        debug!(
            "Regenerating grub config inside '{}'",
            self.other_rootfs_target().display()
        );
        Dependency::Chroot
            .cmd()
            .arg(self.other_rootfs_target())
            .arg(GRUB_UPDATE_CMD)
            .run_and_check()
            .map_err(UpgradeError::from)?;

        self.set_boot_var(BOOTMODE_VAR, BOOTMODE_TRY)?;

        // Recording the next-boot rootfs is not needed for correct grub
        // operation, but it lets the next boot target be queried.
        self.set_boot_var(ROOTFS_VAR, &self.tags.other.to_string())
    }

    fn mark_current_boot_successful(&self) -> Result<(), UpgradeError> {
        self.set_boot_var(BOOTMODE_VAR, BOOTMODE_DEFAULT)
    }

    fn sync_boot_files(&self) -> Result<(), UpgradeError> {
        // The config is shared between slots; nothing to copy.
        Ok(())
    }

    fn handle_assets(&self) -> Result<(), UpgradeError> {
        // Generic-PC hardware, no hardware-specific boot assets.
        Ok(())
    }
}
