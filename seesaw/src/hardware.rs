use std::{io, path::Path};

use serde::Deserialize;

use crate::error::UpgradeError;

/// Declarative description of the hardware an upgrade payload targets.
/// Dropped into the cache directory by the unpack step; consumed by the
/// bootloader variant that installs boot assets.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct HardwareSpec {
    /// Kernel image filename, relative to the cache directory.
    #[serde(default)]
    pub kernel: Option<String>,

    /// Initrd filename, relative to the cache directory.
    #[serde(default)]
    pub initrd: Option<String>,

    /// Directory of device-tree blobs, relative to the cache directory.
    #[serde(default, rename = "dtbs")]
    pub dtb_dir: Option<String>,

    /// Partition layout this payload expects.
    #[serde(default, rename = "partition-layout")]
    pub partition_layout: Option<PartitionLayout>,

    /// Name of the bootloader this payload was built for.
    #[serde(default)]
    pub bootloader: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
pub enum PartitionLayout {
    #[serde(rename = "system-AB")]
    SystemAb,
    #[serde(rename = "single")]
    Single,
}

/// Reads the hardware spec, if the payload provided one.
pub fn load(path: impl AsRef<Path>) -> Result<Option<HardwareSpec>, UpgradeError> {
    let content = match std::fs::read_to_string(path.as_ref()) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(UpgradeError::HardwareSpecMismatch {
                reason: format!("unreadable spec file: {e}"),
            })
        }
    };

    serde_yaml::from_str(&content)
        .map(Some)
        .map_err(|e| UpgradeError::HardwareSpecMismatch {
            reason: format!("malformed spec file: {e}"),
        })
}
