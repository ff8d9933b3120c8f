use std::process::ExitCode;

use anyhow::Error;
use clap::{Parser, Subcommand};
use log::{debug, error, LevelFilter};

use seesaw::{signals, UpgradeCoordinator};

#[derive(Parser, Debug)]
#[command(version, about = "Dual-rootfs (A/B) upgrade orchestrator")]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Stage the inactive rootfs as the next boot target (try mode)
    UpdateBootloader,

    /// Commit the current boot as successful
    MarkBootSuccessful,

    /// Copy per-rootfs boot files from the current slot to the other slot
    SyncBootFiles,

    /// Report which rootfs the next boot will use
    NextBoot,
}

fn main() -> ExitCode {
    init_logging();

    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging() {
    let mut builder = env_logger::builder();
    builder.format_timestamp(None);
    if std::env::var_os("SNAPPY_DEBUG").is_some_and(|v| !v.is_empty()) {
        builder.filter_level(LevelFilter::Debug);
    }
    builder.init();
}

fn run(cli: Cli) -> Result<(), Error> {
    let coordinator = UpgradeCoordinator::discover()?;

    // Teardown must be in place before any operation mounts. Mounting
    // itself is left to the operations: each one takes the upgrade lock
    // first, and commit/query paths need no mounts at all.
    signals::install(coordinator.registry_weak())?;

    match cli.command {
        Commands::UpdateBootloader => coordinator.update_bootloader()?,
        Commands::MarkBootSuccessful => coordinator.mark_boot_successful()?,
        Commands::SyncBootFiles => coordinator.sync_bootloader_files()?,
        Commands::NextBoot => {
            let bootloader = coordinator.bootloader()?;
            debug!("Boot variables: {:?}", bootloader.get_all_boot_vars()?);
            println!(
                "{}",
                if coordinator.next_boot_is_other() {
                    bootloader.other_rootfs_tag().to_string()
                } else {
                    bootloader.rootfs_tag().to_string()
                }
            );
        }
    }

    Ok(())
}
