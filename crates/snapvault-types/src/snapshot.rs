use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A named snapshot of a volume and, once resolved, its creation time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub name: String,
    #[serde(default)]
    pub creation_time: Option<DateTime<Utc>>,
}

impl SnapshotInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            creation_time: None,
        }
    }

    pub fn with_creation_time(name: impl Into<String>, creation_time: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            creation_time: Some(creation_time),
        }
    }
}

impl fmt::Display for SnapshotInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Identifier distinguishing repeated jobs for the same snapshot:
/// `<unix-seconds>-<8 hex chars>`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobId(String);

impl JobId {
    pub fn generate(started: DateTime<Utc>) -> Self {
        let mut buf = [0u8; 4];
        rand::thread_rng().fill_bytes(&mut buf);
        JobId(format!("{}-{}", started.timestamp(), hex::encode(buf)))
    }

    /// Parse a job id previously produced by [`JobId::generate`].
    pub fn parse(raw: &str) -> std::result::Result<Self, String> {
        let (secs, suffix) = raw
            .split_once('-')
            .ok_or_else(|| format!("malformed job id '{raw}'"))?;
        if secs.parse::<i64>().is_err() {
            return Err(format!("malformed job id timestamp in '{raw}'"));
        }
        if suffix.len() != 8 || !suffix.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(format!("malformed job id suffix in '{raw}'"));
        }
        Ok(JobId(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Seconds since the epoch at which the job started.
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        let secs = self.0.split_once('-')?.0.parse::<i64>().ok()?;
        DateTime::from_timestamp(secs, 0)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
