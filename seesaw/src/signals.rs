use std::{
    process,
    sync::{Mutex, Weak},
    thread,
};

use anyhow::{Context, Error};
use log::{error, warn};
use signal_hook::{
    consts::signal::{SIGINT, SIGTERM},
    iterator::Signals,
};

use crate::mounts::{self, MountKind, MountRegistry};

/// Installs the supervisor thread that reverses this process's mounts when
/// it is told to stop.
///
/// On SIGINT or SIGTERM the thread unwinds bind mounts, then plain mounts,
/// and exits with status 1. In-flight subprocesses are not cancelled; only
/// mount state is reversed. The thread holds a weak view of the registry so
/// it never extends its lifetime.
pub fn install(registry: Weak<Mutex<MountRegistry>>) -> Result<(), Error> {
    let mut signals =
        Signals::new([SIGINT, SIGTERM]).context("Failed to set up signal handlers")?;

    thread::spawn(move || {
        if let Some(signal) = signals.forever().next() {
            warn!("Received signal {signal}, tearing down mounts");
            teardown(&registry);
            process::exit(1);
        }
    });

    Ok(())
}

fn teardown(registry: &Weak<Mutex<MountRegistry>>) {
    let Some(registry) = registry.upgrade() else {
        return;
    };

    if let Err(e) = mounts::undo_all(&registry, MountKind::Bind) {
        error!("Failed to unwind bind mounts on signal: {e}");
    }
    if let Err(e) = mounts::undo_all(&registry, MountKind::Plain) {
        error!("Failed to unwind mounts on signal: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    #[test]
    fn test_teardown_with_empty_registry() {
        let registry = Arc::new(Mutex::new(MountRegistry::default()));
        teardown(&Arc::downgrade(&registry));
    }

    #[test]
    fn test_teardown_after_registry_dropped() {
        let registry = Arc::new(Mutex::new(MountRegistry::default()));
        let weak = Arc::downgrade(&registry);
        drop(registry);
        teardown(&weak);
    }
}
