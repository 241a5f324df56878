use tracing::{info, warn};

use snapvault_core::backup::smart::{apply_smart_options, SmartOptions};
use snapvault_core::config::{parse_human_duration, SnapvaultConfig};
use snapvault_core::context::close_destinations;
use snapvault_core::stream::SnapshotCommands;
use snapvault_core::{run_backup, BackupReport, JobInfo};
use snapvault_crypto::{keys_for_send, KeyMaterial};
use snapvault_types::SnapshotInfo;

use crate::cli::{Cli, SendArgs};
use crate::dispatch::{engine_context, open_keyring, with_layout_flags, CliResult};
use crate::format::{format_bytes, format_elapsed, snapshot_name, split_destinations, split_snapshot};
use crate::passphrase::unlock_provider;
use crate::table::{summary_table, CliTableTheme};

fn send_config(args: &SendArgs, config: &SnapvaultConfig) -> CliResult<SnapvaultConfig> {
    let mut config = with_layout_flags(config, &args.layout)?;
    if let Some(mib) = args.volume_size {
        config.volume_size_mib = mib;
    }
    if let Some(n) = args.max_file_buffer {
        config.max_file_buffer = n;
    }
    if let Some(kib) = args.max_upload_speed {
        config.limits.max_upload_speed_kib = kib;
    }
    if let Some(algorithm) = &args.compression {
        config.compression.algorithm = algorithm.clone();
    }
    if let Some(level) = args.compression_level {
        config.compression.zstd_level = level;
    }
    if let Some(n) = args.upload_concurrency {
        config.concurrency.uploads = usize::from(n);
    }
    config.validate()?;
    Ok(config)
}

pub(crate) fn run_send(cli: &Cli, args: &SendArgs, config: &SnapvaultConfig) -> CliResult {
    let config = send_config(args, config)?;
    let smart = SmartOptions {
        incremental: args.increment,
        full_if_older_than: args
            .full_if_older_than
            .as_deref()
            .map(parse_human_duration)
            .transpose()?,
    };
    if smart.is_enabled() && args.incremental.is_some() {
        return Err("-i cannot be combined with --increment or --full-if-older-than".into());
    }

    let zfs = SnapshotCommands::new(&config.zfs_path);
    let (volume, snapshot) = split_snapshot(&args.snapshot)?;
    let local: Vec<String> = if smart.is_enabled() {
        zfs.list_snapshots(volume)?
            .into_iter()
            .map(|s| s.name)
            .collect()
    } else {
        Vec::new()
    };
    let snapshot = match snapshot {
        Some(snapshot) => snapshot.to_string(),
        None if smart.is_enabled() => local
            .last()
            .cloned()
            .ok_or_else(|| format!("'{volume}' has no snapshots"))?,
        None => return Err(format!("expected <volume>@<snapshot>, got '{}'", args.snapshot).into()),
    };

    let base = match zfs.creation_time(volume, &snapshot) {
        Ok(created) => SnapshotInfo::with_creation_time(&snapshot, created),
        Err(e) => {
            warn!("could not read creation time of {volume}@{snapshot}: {e}");
            SnapshotInfo::new(&snapshot)
        }
    };

    // Every destination is validated before any job work starts.
    let ctx = engine_context(&config)?;
    let destinations = split_destinations(&args.destinations);
    let mut job = JobInfo::from_config(&config, volume, base, destinations.clone())?;
    job.incremental_snapshot = args
        .incremental
        .as_deref()
        .map(|from| SnapshotInfo::new(snapshot_name(volume, from)));
    job.encrypt_to = args.encrypt_to.clone();
    job.sign_from = args.sign_from.clone();
    job.validate()?;
    let dests = ctx.open_destinations(&destinations)?;

    if smart.is_enabled() {
        apply_smart_options(&ctx, &mut job, &dests[0], &local, &smart)?;
    }

    let keys = if job.encrypt_to.is_empty() && job.sign_from.is_none() {
        KeyMaterial::default()
    } else {
        let keyring = open_keyring(&config)?;
        keys_for_send(
            &keyring,
            &job.encrypt_to,
            job.sign_from.as_deref(),
            &unlock_provider(),
        )?
    };

    let from = job.incremental_snapshot.as_ref().map(|s| s.name.clone());
    info!(
        "limiting the number of active files to {}",
        job.max_file_buffer
    );
    let mut source = zfs.spawn_send(volume, &snapshot, from.as_deref())?;
    let result = run_backup(&ctx, &job, &dests, &keys, &mut source);
    close_destinations(&dests);
    let report = result?;
    source.wait()?;

    if cli.json_output {
        println!("{}", serde_json::to_string_pretty(&report_json(&report))?);
    } else {
        print_report(&report);
    }
    Ok(())
}

fn report_json(report: &BackupReport) -> serde_json::Value {
    let manifest = &report.manifest;
    serde_json::json!({
        "manifest": report.manifest_key,
        "job_id": manifest.job_id.as_str(),
        "volume": manifest.volume_name,
        "snapshot": manifest.base_snapshot.name,
        "incremental_from": manifest.incremental_snapshot.as_ref().map(|s| &s.name),
        "volumes": manifest.volumes.len(),
        "total_bytes": manifest.total_size,
        "stored_bytes": report.stored_size,
        "destinations": manifest.destinations,
        "encrypted_to": manifest.encryption_recipients,
        "signed_by": manifest.signer,
        "elapsed_seconds": report.elapsed.as_secs_f64(),
    })
}

fn print_report(report: &BackupReport) {
    let manifest = &report.manifest;
    let mut rows = vec![
        ("Backup", manifest.name().to_string()),
        ("Manifest", report.manifest_key.clone()),
        ("Volumes", manifest.volumes.len().to_string()),
        ("Stream size", format_bytes(manifest.total_size)),
        ("Stored size", format_bytes(report.stored_size)),
        ("Destinations", manifest.destinations.join(", ")),
    ];
    if !manifest.encryption_recipients.is_empty() {
        rows.push(("Encrypted to", manifest.encryption_recipients.join(", ")));
    }
    if let Some(signer) = &manifest.signer {
        rows.push(("Signed by", signer.clone()));
    }
    rows.push(("Elapsed", format_elapsed(report.elapsed)));
    println!("{}", summary_table(CliTableTheme::detect(), &rows));
}
