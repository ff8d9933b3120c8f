use std::path::PathBuf;

use osutils::dependencies::DependencyError;

/// Everything that can go wrong while orchestrating an upgrade cycle.
///
/// Interruption by SIGINT/SIGTERM is not represented here: the signal path
/// tears down mounts and exits the process with status 1 directly.
#[derive(Debug, thiserror::Error)]
pub enum UpgradeError {
    #[error("this operation must be run as root")]
    RequiresRoot,

    #[error("another upgrade operation is already in progress")]
    OperationInProgress,

    #[error("failed to take the upgrade lock")]
    LockFailed(#[source] std::io::Error),

    #[error("failed to query partitions")]
    ProbeFailed(#[source] anyhow::Error),

    #[error("failed to detect system partition layout")]
    TopologyUnrecognised,

    #[error("required tool '{binary}' is not available")]
    ToolMissing {
        binary: &'static str,
        #[source]
        source: Box<DependencyError>,
    },

    #[error("'{command}' failed{}", display_exit_code(.code))]
    CommandFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
        #[source]
        source: Box<DependencyError>,
    },

    #[error("failed to mount {}", target.display())]
    MountFailed {
        target: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to unmount {}", target.display())]
    UnmountFailed {
        target: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("filesystem check failed on {}", device.display())]
    FsckFailed {
        device: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("unable to determine bootloader")]
    BootloaderUnknown,

    #[error("failed to read bootloader variable '{name}'")]
    BootVarReadFailed {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to write bootloader variable '{name}'")]
    BootVarWriteFailed {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("hardware spec rejected: {reason}")]
    HardwareSpecMismatch { reason: String },

    #[error("failed to install boot assets")]
    AssetInstallFailed(#[source] anyhow::Error),
}

fn display_exit_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!(" with exit code {code}"),
        None => String::new(),
    }
}

impl From<Box<DependencyError>> for UpgradeError {
    fn from(err: Box<DependencyError>) -> Self {
        match *err {
            DependencyError::NotFound { dependency, .. }
            | DependencyError::CouldNotExecute { dependency, .. } => UpgradeError::ToolMissing {
                binary: dependency.name(),
                source: err,
            },
            DependencyError::ExecutionFailed {
                ref rendered_command,
                code,
                ref stderr,
                ..
            } => UpgradeError::CommandFailed {
                command: rendered_command.clone(),
                code,
                stderr: stderr.clone(),
                source: err,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use osutils::dependencies::Dependency;

    #[test]
    fn test_ran_and_failed_conversion() {
        let err = Box::new(DependencyError::ExecutionFailed {
            dependency: Dependency::Fsck,
            rendered_command: "fsck -M -av /dev/sda3".into(),
            code: Some(8),
            signal: None,
            stderr: "fsck: /dev/sda3: no such device\n".into(),
            explanation: "exited with status: 8".into(),
            output: "".into(),
        });

        match UpgradeError::from(err) {
            UpgradeError::CommandFailed { command, code, .. } => {
                assert_eq!(command, "fsck -M -av /dev/sda3");
                assert_eq!(code, Some(8));
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn test_missing_tool_conversion() {
        let err = Box::new(DependencyError::NotFound {
            dependency: Dependency::GrubEditenv,
            source: which::Error::CannotFindBinaryPath,
        });

        match UpgradeError::from(err) {
            UpgradeError::ToolMissing { binary, .. } => assert_eq!(binary, "grub-editenv"),
            other => panic!("unexpected variant: {other:?}"),
        }
    }
}
