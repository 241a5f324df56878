//! Choosing between a full and an incremental send from what a destination
//! already holds.
//!
//! Only manifest keys are consulted, so planning works without the private
//! keys needed to open encrypted manifests.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::info;

use snapvault_types::{Result, SnapshotInfo};

use crate::chain::list_manifests;
use crate::context::{DestinationHandle, EngineContext};
use crate::job::JobInfo;
use crate::manifest::ManifestName;

#[derive(Debug, Clone, Default)]
pub struct SmartOptions {
    /// Send incrementally from the newest snapshot already backed up.
    pub incremental: bool,
    /// Force a full send when the newest full backup is older than this.
    pub full_if_older_than: Option<Duration>,
}

impl SmartOptions {
    pub fn is_enabled(&self) -> bool {
        self.incremental || self.full_if_older_than.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendPlan {
    Full,
    Incremental { from: String },
}

/// Decide how to send `target` given the backups recorded for its volume and
/// the snapshots still present locally. An incremental base must exist on
/// both sides.
pub fn plan_send(
    backups: &[ManifestName],
    target: &str,
    local_snapshots: &[String],
    options: &SmartOptions,
    now: DateTime<Utc>,
) -> SendPlan {
    if let Some(max_age) = options.full_if_older_than {
        let last_full = backups
            .iter()
            .filter(|b| b.from_snapshot.is_none())
            .filter_map(|b| b.job_id.started_at())
            .max();
        let stale = match last_full {
            Some(at) => now
                .signed_duration_since(at)
                .to_std()
                .map_or(false, |age| age > max_age),
            None => true,
        };
        if stale {
            return SendPlan::Full;
        }
    }

    let mut newest_first: Vec<&ManifestName> = backups.iter().collect();
    newest_first.sort_by(|a, b| {
        b.job_id
            .started_at()
            .cmp(&a.job_id.started_at())
            .then_with(|| b.job_id.cmp(&a.job_id))
    });
    newest_first
        .into_iter()
        .find(|b| b.snapshot != target && local_snapshots.contains(&b.snapshot))
        .map_or(SendPlan::Full, |b| SendPlan::Incremental {
            from: b.snapshot.clone(),
        })
}

/// Rewrite the job's incremental base according to `options`, using the
/// first destination as the reference.
pub fn apply_smart_options(
    ctx: &EngineContext,
    job: &mut JobInfo,
    reference: &DestinationHandle,
    local_snapshots: &[String],
    options: &SmartOptions,
) -> Result<SendPlan> {
    let listed = list_manifests(
        reference,
        &job.layout,
        Some(&job.volume_name),
        &job.retry,
        &ctx.cancel,
    )?;
    let backups: Vec<ManifestName> = listed.into_iter().map(|(_, name)| name).collect();
    let plan = plan_send(
        &backups,
        &job.base_snapshot.name,
        local_snapshots,
        options,
        Utc::now(),
    );
    match &plan {
        SendPlan::Full => {
            info!("sending {}@{} as a full backup", job.volume_name, job.base_snapshot.name);
            job.incremental_snapshot = None;
        }
        SendPlan::Incremental { from } => {
            info!(
                "sending {}@{} incrementally from {from}",
                job.volume_name, job.base_snapshot.name
            );
            job.incremental_snapshot = Some(SnapshotInfo::new(from.clone()));
        }
    }
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use snapvault_types::JobId;

    fn backup(snapshot: &str, from: Option<&str>, started: i64) -> ManifestName {
        ManifestName {
            volume: "tank".into(),
            snapshot: snapshot.into(),
            from_snapshot: from.map(str::to_string),
            job_id: JobId::parse(&format!("{started}-0a0b0c0d")).unwrap(),
        }
    }

    fn local(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[test]
    fn incremental_from_newest_backed_up_snapshot() {
        let backups = vec![backup("a", None, 100), backup("b", Some("a"), 200)];
        let opts = SmartOptions {
            incremental: true,
            ..SmartOptions::default()
        };
        assert_eq!(
            plan_send(&backups, "c", &local(&["a", "b", "c"]), &opts, at(300)),
            SendPlan::Incremental { from: "b".into() }
        );
        // "b" was destroyed locally; fall back to "a".
        assert_eq!(
            plan_send(&backups, "c", &local(&["a", "c"]), &opts, at(300)),
            SendPlan::Incremental { from: "a".into() }
        );
        assert_eq!(
            plan_send(&[], "c", &local(&["c"]), &opts, at(300)),
            SendPlan::Full
        );
    }

    #[test]
    fn stale_full_forces_full_send() {
        let backups = vec![backup("a", None, 1_000), backup("b", Some("a"), 5_000)];
        let opts = SmartOptions {
            incremental: false,
            full_if_older_than: Some(Duration::from_secs(3_600)),
        };
        assert_eq!(
            plan_send(&backups, "c", &local(&["a", "b", "c"]), &opts, at(10_000)),
            SendPlan::Full
        );
        assert_eq!(
            plan_send(&backups, "c", &local(&["a", "b", "c"]), &opts, at(2_000)),
            SendPlan::Incremental { from: "b".into() }
        );
    }
}
