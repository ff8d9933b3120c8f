/// Label of the writable user-data partition as created by the image builder.
pub const WRITABLE_PARTITION_LABEL: &str = "writable";

/// Label of the primary root filesystem partition.
pub const ROOTFS_A_LABEL: &str = "system-a";

/// Label of the secondary root filesystem partition. Only present on A/B
/// upgrade systems.
pub const ROOTFS_B_LABEL: &str = "system-b";

/// Label of the boot partition, if the image carries a separate one.
pub const BOOT_PARTITION_LABEL: &str = "system-boot";

/// Scratch area on the writable partition, relative to the system root.
pub const CACHE_DIR: &str = "writable/cache";

/// Directory below the cache dir where the inactive root gets mounted.
pub const MOUNT_TARGET: &str = "system";

/// Lock file serialising this tool against itself, relative to the cache dir.
pub const LOCK_FILE: &str = ".lockfile";

/// Declarative description of the hardware an upgrade payload targets,
/// relative to the cache dir.
pub const HARDWARE_SPEC_FILE: &str = "hardware.yaml";

/// Directory the unpack step may create with updated boot assets (kernel,
/// initrd), relative to the cache dir.
pub const ASSETS_DIR: &str = "assets";

/// Directory the unpack step may create with assets that would need flashing
/// to raw storage, relative to the cache dir.
pub const FLASH_ASSETS_DIR: &str = "flashtool-assets";

/// Mode used when this tool creates directories.
pub const DIR_MODE: u32 = 0o750;

/// Filesystems a bootloader updater needs bind-mounted when run chrooted
/// into the inactive root.
pub const CHROOT_MOUNTS: &[&str] = &["/dev", "/proc", "/sys"];
