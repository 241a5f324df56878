use chrono::{DateTime, Utc};

use snapvault_core::chain::list_manifests;
use snapvault_core::config::SnapvaultConfig;
use snapvault_core::manifest::{KeyLayout, ManifestName};

use crate::cli::{Cli, ListArgs};
use crate::dispatch::{engine_context, with_layout_flags, CliResult};
use crate::table::{backups_table, CliTableTheme};

fn parse_time(flag: &str, raw: &str) -> CliResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| format!("invalid {flag} time '{raw}': {e}").into())
}

pub(crate) fn run_list(cli: &Cli, args: &ListArgs, config: &SnapvaultConfig) -> CliResult {
    let config = with_layout_flags(config, &args.layout)?;
    let before = args.before.as_deref().map(|t| parse_time("--before", t)).transpose()?;
    let after = args.after.as_deref().map(|t| parse_time("--after", t)).transpose()?;

    let ctx = engine_context(&config)?;
    let dests = ctx.open_destinations(std::slice::from_ref(&args.destination))?;
    let layout = KeyLayout::new(&config.manifest_prefix, config.separator_char()?);
    let listed = list_manifests(
        &dests[0],
        &layout,
        args.volume_name.as_deref(),
        &config.retry_policy()?,
        &ctx.cancel,
    )?;

    let mut backups: Vec<(String, ManifestName)> = listed
        .into_iter()
        .filter(|(_, name)| {
            let started = name.job_id.started_at();
            before.map_or(true, |b| started.is_some_and(|s| s < b))
                && after.map_or(true, |a| started.is_some_and(|s| s > a))
        })
        .collect();
    backups.sort_by(|(ka, a), (kb, b)| {
        a.volume
            .cmp(&b.volume)
            .then_with(|| a.job_id.started_at().cmp(&b.job_id.started_at()))
            .then_with(|| ka.cmp(kb))
    });

    if cli.json_output {
        let entries: Vec<serde_json::Value> = backups
            .iter()
            .map(|(key, name)| {
                serde_json::json!({
                    "key": key,
                    "volume": name.volume,
                    "snapshot": name.snapshot,
                    "incremental_from": name.from_snapshot,
                    "job_id": name.job_id.as_str(),
                    "started_at": name.job_id.started_at().map(|t| t.to_rfc3339()),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if backups.is_empty() {
        println!("No backups found.");
        return Ok(());
    }

    let table = backups_table(CliTableTheme::detect(), backups.iter().map(|(_, name)| name));
    println!("{table}");
    Ok(())
}
