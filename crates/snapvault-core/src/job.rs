use std::collections::HashSet;

use chrono::{DateTime, Utc};

use snapvault_crypto::validate_key_options;
use snapvault_storage::{parse_destination, RetryPolicy};
use snapvault_types::{JobId, Result, SnapshotInfo, SnapvaultError};

use crate::compress::Compression;
use crate::config::SnapvaultConfig;
use crate::manifest::{KeyLayout, ManifestName};

/// Parameters of one backup invocation. Built once from validated input and
/// read-only while the job runs.
#[derive(Debug, Clone)]
pub struct JobInfo {
    pub volume_name: String,
    /// Snapshot being sent.
    pub base_snapshot: SnapshotInfo,
    /// Send only the changes since this snapshot.
    pub incremental_snapshot: Option<SnapshotInfo>,
    pub destinations: Vec<String>,
    pub volume_size: u64,
    pub compression: Compression,
    /// Volume files kept on local disk at once; 0 streams directly to a
    /// single destination.
    pub max_file_buffer: usize,
    pub retry: RetryPolicy,
    pub layout: KeyLayout,
    pub encrypt_to: Vec<String>,
    pub sign_from: Option<String>,
    pub job_id: JobId,
    pub started_at: DateTime<Utc>,
}

impl JobInfo {
    /// A job with settings taken from `config`.
    pub fn from_config(
        config: &SnapvaultConfig,
        volume_name: &str,
        base_snapshot: SnapshotInfo,
        destinations: Vec<String>,
    ) -> Result<Self> {
        let started_at = Utc::now();
        Ok(Self {
            volume_name: volume_name.to_string(),
            base_snapshot,
            incremental_snapshot: None,
            destinations,
            volume_size: config.volume_size_bytes(),
            compression: config.compression()?,
            max_file_buffer: config.max_file_buffer,
            retry: config.retry_policy()?,
            layout: KeyLayout::new(&config.manifest_prefix, config.separator_char()?),
            encrypt_to: Vec::new(),
            sign_from: None,
            job_id: JobId::generate(started_at),
            started_at,
        })
    }

    pub fn manifest_name(&self) -> ManifestName {
        ManifestName {
            volume: self.volume_name.clone(),
            snapshot: self.base_snapshot.name.clone(),
            from_snapshot: self.incremental_snapshot.as_ref().map(|s| s.name.clone()),
            job_id: self.job_id.clone(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.layout.validate_component("volume name", &self.volume_name)?;
        self.layout
            .validate_component("snapshot name", &self.base_snapshot.name)?;
        if let Some(from) = &self.incremental_snapshot {
            self.layout.validate_component("incremental snapshot name", &from.name)?;
            if from.name == self.base_snapshot.name {
                return Err(SnapvaultError::InvalidInput(format!(
                    "cannot send '{}' incrementally from itself",
                    from.name
                )));
            }
        }
        validate_destination_list(&self.destinations)?;
        if self.max_file_buffer == 0 && self.destinations.len() > 1 {
            return Err(SnapvaultError::InvalidInput(
                "max file buffer 0 streams straight to storage and supports exactly one destination"
                    .into(),
            ));
        }
        if self.volume_size == 0 {
            return Err(SnapvaultError::InvalidInput(
                "volume size must be greater than zero".into(),
            ));
        }
        validate_key_options(&self.encrypt_to, self.sign_from.as_deref())
    }
}

/// Parameters of one restore invocation.
#[derive(Debug, Clone)]
pub struct RestoreJob {
    pub volume_name: String,
    /// Snapshot to restore; `None` restores the most recent one.
    pub target: Option<String>,
    /// Snapshot already present at the sink that the target is an
    /// incremental from.
    pub stop_at: Option<String>,
    /// Snapshots already present at the sink; used by auto-restore to skip
    /// links that need not be replayed.
    pub present: Vec<String>,
    pub destinations: Vec<String>,
    pub max_file_buffer: usize,
    pub retry: RetryPolicy,
    pub layout: KeyLayout,
}

impl RestoreJob {
    pub fn from_config(
        config: &SnapvaultConfig,
        volume_name: &str,
        target: Option<String>,
        destinations: Vec<String>,
    ) -> Result<Self> {
        Ok(Self {
            volume_name: volume_name.to_string(),
            target,
            stop_at: None,
            present: Vec::new(),
            destinations,
            max_file_buffer: config.max_file_buffer,
            retry: config.retry_policy()?,
            layout: KeyLayout::new(&config.manifest_prefix, config.separator_char()?),
        })
    }

    pub fn is_auto(&self) -> bool {
        self.target.is_none()
    }

    pub fn validate(&self) -> Result<()> {
        self.layout.validate_component("volume name", &self.volume_name)?;
        if let Some(target) = &self.target {
            self.layout.validate_component("snapshot name", target)?;
        }
        if self.is_auto() && self.stop_at.is_some() {
            return Err(SnapvaultError::InvalidInput(
                "an incremental base cannot be combined with auto restore".into(),
            ));
        }
        validate_destination_list(&self.destinations)
    }
}

fn validate_destination_list(destinations: &[String]) -> Result<()> {
    if destinations.is_empty() {
        return Err(SnapvaultError::InvalidInput(
            "at least one destination is required".into(),
        ));
    }
    let mut seen = HashSet::new();
    for uri in destinations {
        parse_destination(uri)?;
        if !seen.insert(uri.as_str()) {
            return Err(SnapvaultError::InvalidInput(format!(
                "destination '{uri}' is listed twice"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(destinations: &[&str]) -> JobInfo {
        JobInfo::from_config(
            &SnapvaultConfig::default(),
            "tank/data",
            SnapshotInfo::new("b"),
            destinations.iter().map(|d| d.to_string()).collect(),
        )
        .unwrap()
    }

    #[test]
    fn defaults_are_valid() {
        let job = job(&["mem://a", "mem://b"]);
        job.validate().unwrap();
        assert_eq!(job.max_file_buffer, 5);
        assert_eq!(job.layout.separator, '|');
    }

    #[test]
    fn bypass_mode_needs_single_destination() {
        let mut two = job(&["mem://a", "mem://b"]);
        two.max_file_buffer = 0;
        assert!(matches!(two.validate(), Err(SnapvaultError::InvalidInput(_))));

        let mut one = job(&["mem://a"]);
        one.max_file_buffer = 0;
        one.validate().unwrap();
    }

    #[test]
    fn rejects_bad_names_and_destinations() {
        let mut sep = job(&["mem://a"]);
        sep.base_snapshot = SnapshotInfo::new("a|b");
        assert!(sep.validate().is_err());

        let mut same = job(&["mem://a"]);
        same.incremental_snapshot = Some(SnapshotInfo::new("b"));
        assert!(same.validate().is_err());

        assert!(matches!(
            job(&["gopher://x"]).validate(),
            Err(SnapvaultError::UnsupportedPrefix(_))
        ));
        assert!(job(&["mem://a", "mem://a"]).validate().is_err());
        assert!(job(&[]).validate().is_err());
    }

    #[test]
    fn jobs_take_retry_policy_from_config() {
        let mut config = SnapvaultConfig::default();
        config.retry.max_retry_time = "5m".into();
        config.retry.max_backoff = "10s".into();
        config.retry.base_delay_ms = 250;

        let backup = JobInfo::from_config(
            &config,
            "tank",
            SnapshotInfo::new("a"),
            vec!["mem://a".into()],
        )
        .unwrap();
        let restore =
            RestoreJob::from_config(&config, "tank", None, vec!["mem://a".into()]).unwrap();
        for retry in [&backup.retry, &restore.retry] {
            assert_eq!(retry.max_retry_time, std::time::Duration::from_secs(300));
            assert_eq!(retry.max_backoff, std::time::Duration::from_secs(10));
            assert_eq!(retry.base_delay, std::time::Duration::from_millis(250));
        }
    }

    #[test]
    fn auto_restore_rejects_stop_at() {
        let mut restore = RestoreJob::from_config(
            &SnapvaultConfig::default(),
            "tank",
            None,
            vec!["mem://a".into()],
        )
        .unwrap();
        restore.validate().unwrap();
        restore.stop_at = Some("a".into());
        assert!(matches!(
            restore.validate(),
            Err(SnapvaultError::InvalidInput(_))
        ));
    }
}
