use std::path::Path;

use anyhow::{Context, Error};

use crate::dependencies::Dependency;

/// Asks mountpoint(1) whether the path is a mount point. A clean non-zero
/// exit means "no"; anything else is a real failure.
pub fn check_is_mountpoint(path: impl AsRef<Path>) -> Result<bool, Error> {
    let result = Dependency::Mountpoint
        .cmd()
        .arg("-q")
        .arg(path.as_ref())
        .run_and_check();
    match result {
        Ok(()) => Ok(true),
        Err(e) if !e.is_tool_missing() => Ok(false),
        Err(e) => Err(e).with_context(|| {
            format!(
                "Failed to determine whether '{}' is a mount point",
                path.as_ref().display()
            )
        }),
    }
}
