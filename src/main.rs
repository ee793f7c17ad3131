use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod archiver;
mod config;
mod error;
mod manifest;
mod orchestrator;
mod store;

use archiver::RarArchiver;
use config::{ConfigOverrides, VaultConfig};
use store::StateFile;

/// Incremental Steam library backup: archives an app only when its
/// manifest fingerprint changed since the last successful backup.
#[derive(Debug, Parser)]
#[command(name = "steamvault", version)]
struct Cli {
    /// Config file (default: ~/.config/steamvault/config.yaml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Steam library steamapps directory
    #[arg(long)]
    library: Option<PathBuf>,

    /// Directory for archives and the state file (default: <library>/backup)
    #[arg(long)]
    backup_dir: Option<PathBuf>,

    /// Archiver executable
    #[arg(long)]
    archiver: Option<PathBuf>,
}

fn run(cli: Cli) -> Result<()> {
    let config = VaultConfig::load(
        cli.config.as_deref(),
        ConfigOverrides {
            library_path: cli.library,
            backup_dir: cli.backup_dir,
            archiver_path: cli.archiver,
        },
    )?;

    // Fatal startup checks: nothing is processed unless the library and the
    // archiver are both in place.
    config.validate()?;
    let rar = RarArchiver::new(&config.archiver_path);
    rar.check_available()?;
    config.ensure_backup_dir()?;

    let state_file = StateFile::new(config.state_path());

    // Legacy migration failing is not fatal: the run proceeds as if no prior
    // state existed, at the cost of one redundant backup pass.
    match store::migrate_legacy(&config.legacy_state_path(), &state_file) {
        Ok(store::MigrationOutcome::NoLegacy) => {}
        Ok(store::MigrationOutcome::Migrated(count)) => {
            tracing::info!("migrated {} entries from legacy state", count);
        }
        Err(err) => {
            tracing::warn!("legacy state migration failed, continuing: {:#}", err);
        }
    }

    let report = orchestrator::run_backup(
        &config.library_path,
        &config.backup_dir,
        &rar,
        &state_file,
    )?;

    tracing::info!(
        "run complete: {} apps, {} backed up, {} skipped, {} failed",
        report.total(),
        report.backed_up,
        report.skipped,
        report.failed.len()
    );
    for (label, err) in &report.failed {
        tracing::warn!("failed: {}: {}", label, err);
    }

    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    // Per-item failures are already in the report and the exit code stays 0;
    // only startup errors reach this point.
    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("{:#}", err);
            ExitCode::FAILURE
        }
    }
}
