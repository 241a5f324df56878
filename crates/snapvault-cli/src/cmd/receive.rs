use tracing::{debug, info};

use snapvault_core::config::SnapvaultConfig;
use snapvault_core::context::close_destinations;
use snapvault_core::manifest::Manifest;
use snapvault_core::stream::{ReceiveOptions, SnapshotCommands, StreamSink};
use snapvault_core::{run_restore, RestoreJob, RestoreReport};
use snapvault_crypto::{keys_for_receive, KeyMaterial};

use crate::cli::{Cli, ReceiveArgs};
use crate::dispatch::{engine_context, open_keyring, with_layout_flags, CliResult};
use crate::format::{format_bytes, format_elapsed, snapshot_name, split_destinations, split_snapshot};
use crate::passphrase::unlock_provider;
use crate::table::{summary_table, CliTableTheme};

pub(crate) fn run_receive(cli: &Cli, args: &ReceiveArgs, config: &SnapvaultConfig) -> CliResult {
    let mut config = with_layout_flags(config, &args.layout)?;
    if let Some(n) = args.download_concurrency {
        config.concurrency.downloads = usize::from(n);
    }

    let (volume, snapshot) = split_snapshot(&args.snapshot)?;
    if snapshot.is_none() && !args.auto {
        return Err(format!("expected <volume>@<snapshot>, got '{}'", args.snapshot).into());
    }
    let options = ReceiveOptions {
        force: args.force,
        unmounted: args.unmounted,
        full_path: args.full_path,
        last_path: args.last_path,
        origin: args
            .origin
            .as_deref()
            .map(|o| o.trim_start_matches("origin=").to_string()),
    };
    let zfs = SnapshotCommands::new(&config.zfs_path);
    // Rejects -d together with -e before anything is downloaded.
    zfs.receive_command(&args.local_volume, &options)?;

    let mut job = RestoreJob::from_config(
        &config,
        volume,
        snapshot.map(str::to_string),
        split_destinations(&args.destinations),
    )?;
    job.stop_at = args
        .incremental
        .as_deref()
        .map(|from| snapshot_name(volume, from).to_string());
    if let Some(n) = args.max_file_buffer {
        job.max_file_buffer = n;
    }
    if args.auto {
        if job.stop_at.is_some() {
            return Err("--auto cannot be combined with -i".into());
        }
        job.present = match zfs.list_snapshots(&args.local_volume) {
            Ok(snapshots) => snapshots.into_iter().map(|s| s.name).collect(),
            Err(e) => {
                debug!("treating {} as empty: {e}", args.local_volume);
                Vec::new()
            }
        };
    }
    job.validate()?;

    let ctx = engine_context(&config)?;
    let dests = ctx.open_destinations(&job.destinations)?;
    let keys = if args.encrypt_to.is_empty() && args.sign_from.is_none() {
        KeyMaterial::default()
    } else {
        let keyring = open_keyring(&config)?;
        keys_for_receive(
            &keyring,
            &args.encrypt_to,
            args.sign_from.as_deref(),
            &unlock_provider(),
        )?
    };

    let mut first_link = true;
    let mut open_sink = |manifest: &Manifest| -> snapvault_types::Result<Box<dyn StreamSink>> {
        let mut link_options = options.clone();
        // A clone origin only applies to the stream that creates the dataset.
        if !first_link {
            link_options.origin = None;
        }
        first_link = false;
        info!("receiving {} into {}", manifest.name(), args.local_volume);
        let stream = zfs.spawn_receive(&args.local_volume, &link_options)?;
        Ok(Box::new(stream))
    };
    let result = run_restore(&ctx, &job, &dests, &keys, &mut open_sink);
    close_destinations(&dests);
    let report = result?;

    if cli.json_output {
        println!("{}", serde_json::to_string_pretty(&report_json(&job, &report))?);
    } else if report.replayed.is_empty() {
        println!("{} is already up to date", args.local_volume);
    } else {
        let rows = [
            ("Target", args.local_volume.clone()),
            ("Backups", report.replayed.join("\n")),
            ("Volumes", report.volumes.to_string()),
            ("Stream size", format_bytes(report.bytes)),
            ("Elapsed", format_elapsed(report.elapsed)),
        ];
        println!("{}", summary_table(CliTableTheme::detect(), &rows));
    }
    Ok(())
}

fn report_json(job: &RestoreJob, report: &RestoreReport) -> serde_json::Value {
    serde_json::json!({
        "volume": job.volume_name,
        "target": job.target,
        "replayed": report.replayed,
        "volumes": report.volumes,
        "bytes": report.bytes,
        "elapsed_seconds": report.elapsed.as_secs_f64(),
    })
}
