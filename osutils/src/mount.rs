use std::path::Path;

use anyhow::{Context, Error};

use crate::dependencies::Dependency;

/// Mounts a block device on a directory, passing `-o<options>` when options
/// are given.
pub fn mount(source: impl AsRef<Path>, target: impl AsRef<Path>, options: &str) -> Result<(), Error> {
    let mut command = Dependency::Mount.cmd();
    if !options.is_empty() {
        command.arg(format!("-o{options}"));
    }
    command
        .arg(source.as_ref())
        .arg(target.as_ref())
        .run_and_check()
        .with_context(|| {
            format!(
                "Failed to mount {} on {}",
                source.as_ref().display(),
                target.as_ref().display(),
            )
        })
}

/// Unmounts the given directory.
pub fn umount(target: impl AsRef<Path>) -> Result<(), Error> {
    Dependency::Umount
        .cmd()
        .arg(target.as_ref())
        .run_and_check()
        .with_context(|| format!("Failed to unmount {}", target.as_ref().display()))
}
