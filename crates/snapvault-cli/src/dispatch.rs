use snapvault_core::config::SnapvaultConfig;
use snapvault_core::EngineContext;
use snapvault_crypto::Keyring;

use crate::cli::{Cli, Commands, LayoutFlags};
use crate::cmd;
use crate::signal::cancel_on_shutdown;

pub(crate) type CliResult<T = ()> = Result<T, Box<dyn std::error::Error>>;

pub(crate) fn dispatch_command(cli: &Cli, config: &SnapvaultConfig) -> CliResult {
    tracing::debug!("running {}", cli.command.name());
    match &cli.command {
        Commands::Send(args) => cmd::send::run_send(cli, args, config),
        Commands::Receive(args) => cmd::receive::run_receive(cli, args, config),
        Commands::List(args) => cmd::list::run_list(cli, args, config),
        Commands::Keygen(args) => cmd::keygen::run_keygen(cli, args, config),
    }
}

/// Apply per-command overrides and re-validate.
pub(crate) fn with_layout_flags(
    config: &SnapvaultConfig,
    flags: &LayoutFlags,
) -> CliResult<SnapvaultConfig> {
    let mut config = config.clone();
    if let Some(prefix) = &flags.manifest_prefix {
        config.manifest_prefix = prefix.clone();
    }
    if let Some(separator) = &flags.separator {
        config.separator = separator.clone();
    }
    if let Some(max_retry_time) = &flags.max_retry_time {
        config.retry.max_retry_time = max_retry_time.clone();
    }
    if let Some(max_backoff) = &flags.max_backoff_time {
        config.retry.max_backoff = max_backoff.clone();
    }
    config.validate()?;
    Ok(config)
}

/// Engine context whose cancel token fires on SIGINT/SIGTERM.
pub(crate) fn engine_context(config: &SnapvaultConfig) -> CliResult<EngineContext> {
    let ctx = EngineContext::from_config(config)?;
    cancel_on_shutdown(ctx.cancel.clone());
    Ok(ctx)
}

pub(crate) fn open_keyring(config: &SnapvaultConfig) -> CliResult<Keyring> {
    let path = config.keyring_path();
    tracing::debug!("using keyring {}", path.display());
    Ok(Keyring::load(&path)?)
}
