use std::{
    fs, io,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, Context};
use log::{debug, warn};

use osutils::{
    dependencies::Dependency,
    envfile::{self, Change},
    files,
};

use crate::{
    bootloader::{Bootloader, BOOTMODE_DEFAULT, BOOTMODE_TRY, BOOTMODE_VAR, ROOTFS_VAR},
    constants::{CACHE_DIR, DIR_MODE, FLASH_ASSETS_DIR, HARDWARE_SPEC_FILE},
    error::UpgradeError,
    hardware::{self, HardwareSpec, PartitionLayout},
    partitions::{RootfsTag, RootfsTags},
};

const UBOOT_DIR: &str = "boot/uboot";
const UBOOT_CONFIG_FILE: &str = "uEnv.txt";

/// Side-file sourced by the main U-Boot config; this is where the boot
/// variables live.
const UBOOT_ENV_FILE: &str = "snappy-system.txt";

/// Created by U-Boot itself on a try boot. The successfully-booted system
/// removes it to flag the slot as good; a second try boot that still finds
/// it makes the bootloader fall back.
const UBOOT_STAMP_FILE: &str = "snappy-stamp.txt";

pub const UBOOT_NAME: &str = "u-boot";

/// U-Boot driver. Boot assets are kept per slot under
/// `/boot/uboot/<tag>/`, and variables in a plain key=value side-file.
#[derive(Debug)]
pub struct UbootBootloader {
    root: PathBuf,
    tags: RootfsTags,
    dual: bool,
}

impl UbootBootloader {
    pub fn new(tags: RootfsTags, dual: bool) -> Self {
        UbootBootloader {
            root: PathBuf::from("/"),
            tags,
            dual,
        }
    }

    /// Re-roots every path this driver touches, for tests.
    pub fn with_root(self, root: impl Into<PathBuf>) -> Self {
        UbootBootloader {
            root: root.into(),
            ..self
        }
    }

    fn uboot_dir(&self) -> PathBuf {
        self.root.join(UBOOT_DIR)
    }

    fn env_file(&self) -> PathBuf {
        self.uboot_dir().join(UBOOT_ENV_FILE)
    }

    fn stamp_file(&self) -> PathBuf {
        self.uboot_dir().join(UBOOT_STAMP_FILE)
    }

    fn cache_dir(&self) -> PathBuf {
        self.root.join(CACHE_DIR)
    }

    /// Boot assets of the running slot, e.g. `/boot/uboot/a`.
    fn current_boot_path(&self) -> PathBuf {
        self.uboot_dir().join(self.tags.current.to_string())
    }

    /// Boot assets of the inactive slot, e.g. `/boot/uboot/b`.
    fn other_boot_path(&self) -> PathBuf {
        self.uboot_dir().join(self.tags.other.to_string())
    }

    /// Reads the env side-file; a file an admin removed by hand reads as
    /// empty so the next write recreates it.
    fn read_env(&self) -> Result<String, UpgradeError> {
        match fs::read_to_string(self.env_file()) {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(UpgradeError::BootVarReadFailed {
                name: "*".into(),
                source: anyhow!(e).context(format!(
                    "Could not read {}",
                    self.env_file().display()
                )),
            }),
        }
    }

    fn apply_changes(&self, changes: &[Change]) -> Result<(), UpgradeError> {
        envfile::modify_name_value_file(self.env_file(), changes).map_err(|source| {
            UpgradeError::BootVarWriteFailed {
                name: changes
                    .iter()
                    .map(|c| c.name.as_str())
                    .collect::<Vec<_>>()
                    .join(","),
                source,
            }
        })
    }

    fn install_assets(&self, spec: &HardwareSpec) -> Result<(), UpgradeError> {
        if spec.bootloader.as_deref() != Some(UBOOT_NAME) {
            return Err(UpgradeError::HardwareSpecMismatch {
                reason: format!(
                    "bootloader is of type {} but hardware spec requires {}",
                    UBOOT_NAME,
                    spec.bootloader.as_deref().unwrap_or("(unset)")
                ),
            });
        }

        if self.dual && spec.partition_layout != Some(PartitionLayout::SystemAb) {
            return Err(UpgradeError::HardwareSpecMismatch {
                reason: "hardware spec requires dual root partitions".into(),
            });
        }

        let dest_dir = self.other_boot_path();
        files::create_dirs_mode(&dest_dir, DIR_MODE).map_err(UpgradeError::AssetInstallFailed)?;

        // Sources are only removed once every copy is done; the kernel,
        // initrd and device trees may share a parent directory.
        let mut consumed: Vec<PathBuf> = Vec::new();

        for file in [&spec.kernel, &spec.initrd].into_iter().flatten() {
            if file.is_empty() {
                continue;
            }

            let src = self.cache_dir().join(file);
            if !src.exists() {
                return Err(UpgradeError::AssetInstallFailed(anyhow!(
                    "can not find file {}",
                    src.display()
                )));
            }

            Dependency::Cp
                .cmd()
                .arg(&src)
                .arg(&dest_dir)
                .run_and_check()
                .map_err(UpgradeError::from)?;

            if let Some(parent) = src.parent() {
                consumed.push(parent.to_owned());
            }
        }

        if let Some(dtb_dir) = spec.dtb_dir.as_deref().filter(|d| !d.is_empty()) {
            let dtb_src_dir = self.cache_dir().join(dtb_dir);
            if dtb_src_dir.exists() {
                let dtb_dest_dir = dest_dir.join("dtbs");
                files::create_dirs_mode(&dtb_dest_dir, DIR_MODE)
                    .map_err(UpgradeError::AssetInstallFailed)?;

                let entries = fs::read_dir(&dtb_src_dir)
                    .with_context(|| format!("Could not list {}", dtb_src_dir.display()))
                    .map_err(UpgradeError::AssetInstallFailed)?;
                for entry in entries {
                    let entry = entry
                        .context("Could not read directory entry")
                        .map_err(UpgradeError::AssetInstallFailed)?;
                    Dependency::Cp
                        .cmd()
                        .arg(entry.path())
                        .arg(&dtb_dest_dir)
                        .run_and_check()
                        .map_err(UpgradeError::from)?;
                }

                consumed.push(dtb_src_dir);
            }
        }

        for dir in consumed {
            self.remove_consumed(&dir);
        }

        // Flashing raw-storage assets is not wired up; drop them so they do
        // not go stale in the cache.
        let flash_assets_dir = self.cache_dir().join(FLASH_ASSETS_DIR);
        if flash_assets_dir.exists() {
            fs::remove_dir_all(&flash_assets_dir)
                .with_context(|| format!("Could not remove {}", flash_assets_dir.display()))
                .map_err(UpgradeError::AssetInstallFailed)?;
        }

        Ok(())
    }

    /// Removes a consumed asset source directory, leaving the cache dir
    /// itself alone when an asset was dropped directly into it.
    fn remove_consumed(&self, dir: &Path) {
        if dir == self.cache_dir() || !dir.exists() {
            return;
        }
        if let Err(e) = fs::remove_dir_all(dir) {
            warn!("Failed to remove consumed assets at {}: {e}", dir.display());
        }
    }
}

impl Bootloader for UbootBootloader {
    fn name(&self) -> &'static str {
        UBOOT_NAME
    }

    fn installed(&self) -> bool {
        self.uboot_dir().join(UBOOT_CONFIG_FILE).exists()
    }

    fn get_boot_var(&self, name: &str) -> Result<String, UpgradeError> {
        Ok(envfile::lookup(&self.read_env()?, name).unwrap_or_default())
    }

    fn set_boot_var(&self, name: &str, value: &str) -> Result<(), UpgradeError> {
        self.apply_changes(&[Change::new(name, value)])
    }

    fn get_all_boot_vars(&self) -> Result<Vec<(String, String)>, UpgradeError> {
        Ok(envfile::parse_str(&self.read_env()?))
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

    /// Both variables go to disk in one atomic file rewrite, so a
    /// crash-consistent reader sees either the committed state or the
    /// complete staged state.
    fn toggle_rootfs(&self) -> Result<(), UpgradeError> {
        debug!(
            "Staging next boot on rootfs '{}' (try mode)",
            self.tags.other
        );
        self.apply_changes(&[
            Change::new(ROOTFS_VAR, self.tags.other.to_string()),
            Change::new(BOOTMODE_VAR, BOOTMODE_TRY),
        ])
    }

    fn mark_current_boot_successful(&self) -> Result<(), UpgradeError> {
        self.apply_changes(&[Change::new(BOOTMODE_VAR, BOOTMODE_DEFAULT)])?;

        match fs::remove_file(self.stamp_file()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(UpgradeError::BootVarWriteFailed {
                name: BOOTMODE_VAR.into(),
                source: anyhow!(e).context(format!(
                    "Could not remove stamp file {}",
                    self.stamp_file().display()
                )),
            }),
        }
    }

    /// The slot directories are owned entirely by this tool, so the copy
    /// always starts from a clean destination.
    fn sync_boot_files(&self) -> Result<(), UpgradeError> {
        let src_dir = self.current_boot_path();
        let dest_dir = self.other_boot_path();

        match fs::remove_dir_all(&dest_dir) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(UpgradeError::AssetInstallFailed(anyhow!(e).context(
                    format!("Could not clear boot slot {}", dest_dir.display()),
                )))
            }
        }

        Dependency::Cp
            .cmd()
            .arg("-a")
            .arg(&src_dir)
            .arg(&dest_dir)
            .run_and_check()
            .map_err(UpgradeError::from)
    }

    fn handle_assets(&self) -> Result<(), UpgradeError> {
        let spec_file = self.cache_dir().join(HARDWARE_SPEC_FILE);
        let Some(spec) = hardware::load(&spec_file)? else {
            // No hardware spec in the payload, nothing to install.
            return Ok(());
        };

        let result = self.install_assets(&spec);

        // The spec file is consumed either way so a failed upgrade does not
        // replay stale assets on the next cycle.
        if let Err(e) = fs::remove_file(&spec_file) {
            warn!(
                "Failed to remove consumed hardware spec {}: {e}",
                spec_file.display()
            );
        }

        result
    }
}
