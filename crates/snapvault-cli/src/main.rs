mod cli;
mod cmd;
mod dispatch;
mod format;
mod passphrase;
mod prompt;
mod signal;
mod table;

use std::path::Path;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use snapvault_core::config::SnapvaultConfig;

use cli::Cli;
use dispatch::dispatch_command;

fn main() {
    let cli = Cli::parse();

    let filter = match cli.log_level.as_deref() {
        Some(level) => level,
        None => match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        },
    };
    let filter = match EnvFilter::try_new(filter) {
        Ok(filter) => filter,
        Err(e) => {
            eprintln!("Error: invalid log level '{filter}': {e}");
            std::process::exit(1);
        }
    };
    // stdout is reserved for command output.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    signal::install_signal_handlers();

    if let Err(e) = dispatch_command(&cli, &config) {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

/// The config file (if any) with global flag overrides applied.
fn load_config(cli: &Cli) -> Result<SnapvaultConfig, Box<dyn std::error::Error>> {
    let mut config = SnapvaultConfig::load(cli.config.as_deref().map(Path::new))?;
    if let Some(wd) = &cli.working_directory {
        config.working_directory = wd.clone();
    }
    if let Some(zfs) = &cli.zfs_path {
        config.zfs_path = zfs.clone();
    }
    if let Some(keyring) = &cli.keyring {
        config.keyring = Some(keyring.clone());
    }
    tracing::debug!("working directory: {}", config.working_directory().display());
    Ok(config)
}
