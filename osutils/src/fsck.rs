use std::path::Path;

use anyhow::{Context, Error};

use crate::dependencies::Dependency;

/// Runs fsck on the file system on the block device. `-M` skips the check if
/// the device is already mounted; `-a` answers automatically so no operator
/// is needed.
pub fn run(block_device_path: impl AsRef<Path>) -> Result<(), Error> {
    Dependency::Fsck
        .cmd()
        .arg("-M")
        .arg("-av")
        .arg(block_device_path.as_ref())
        .run_and_check()
        .with_context(|| {
            format!(
                "fsck failed on device {}",
                block_device_path.as_ref().display()
            )
        })
}
