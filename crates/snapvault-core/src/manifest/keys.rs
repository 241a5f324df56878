use std::fmt;

use snapvault_types::{JobId, Result, SnapvaultError};

const MANIFEST_SUFFIX: &str = ".manifest";

/// Naming scheme for objects written by one job.
///
/// ```text
/// manifest: <prefix>/<volume><sep><snapshot>[<sep><from>]<sep><job-id>.manifest
/// volume:   <volume><sep><snapshot>[<sep><from>]<sep><job-id><sep>vol<NNNNNN>
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyLayout {
    pub manifest_prefix: String,
    pub separator: char,
}

impl KeyLayout {
    pub fn new(manifest_prefix: &str, separator: char) -> Self {
        Self {
            manifest_prefix: manifest_prefix.trim_matches('/').to_string(),
            separator,
        }
    }

    /// Reject a key component that would make keys ambiguous.
    pub fn validate_component(&self, what: &str, value: &str) -> Result<()> {
        if value.is_empty() {
            return Err(SnapvaultError::InvalidInput(format!("{what} must not be empty")));
        }
        if value.contains(self.separator) {
            return Err(SnapvaultError::InvalidInput(format!(
                "{what} '{value}' contains the key separator '{}'",
                self.separator
            )));
        }
        if value.starts_with('/') || value.split('/').any(|part| part == "..") {
            return Err(SnapvaultError::InvalidInput(format!(
                "{what} '{value}' is not a safe key component"
            )));
        }
        Ok(())
    }

    fn stem(&self, name: &ManifestName) -> String {
        let sep = self.separator;
        match &name.from_snapshot {
            Some(from) => format!(
                "{}{sep}{}{sep}{from}{sep}{}",
                name.volume, name.snapshot, name.job_id
            ),
            None => format!("{}{sep}{}{sep}{}", name.volume, name.snapshot, name.job_id),
        }
    }

    pub fn manifest_key(&self, name: &ManifestName) -> String {
        format!("{}/{}{MANIFEST_SUFFIX}", self.manifest_prefix, self.stem(name))
    }

    pub fn volume_key(&self, name: &ManifestName, index: u32) -> String {
        format!("{}{}vol{index:06}", self.stem(name), self.separator)
    }

    /// Listing prefix covering every manifest, or those of one volume.
    pub fn listing_prefix(&self, volume: Option<&str>) -> String {
        match volume {
            Some(volume) => format!("{}/{volume}{}", self.manifest_prefix, self.separator),
            None => format!("{}/", self.manifest_prefix),
        }
    }

    /// Parse a manifest key back into its components. Returns `None` for keys
    /// that do not follow the layout (foreign objects under the prefix).
    pub fn parse_manifest_key(&self, key: &str) -> Option<ManifestName> {
        let stem = key
            .strip_prefix(&self.manifest_prefix)?
            .strip_prefix('/')?
            .strip_suffix(MANIFEST_SUFFIX)?;
        let parts: Vec<&str> = stem.split(self.separator).collect();
        let (volume, snapshot, from, job) = match parts.as_slice() {
            [volume, snapshot, job] => (*volume, *snapshot, None, *job),
            [volume, snapshot, from, job] => (*volume, *snapshot, Some(*from), *job),
            _ => return None,
        };
        if volume.is_empty() || snapshot.is_empty() || from.is_some_and(str::is_empty) {
            return None;
        }
        Some(ManifestName {
            volume: volume.to_string(),
            snapshot: snapshot.to_string(),
            from_snapshot: from.map(str::to_string),
            job_id: JobId::parse(job).ok()?,
        })
    }
}

/// Identity of one backup job as encoded in its object keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestName {
    pub volume: String,
    pub snapshot: String,
    pub from_snapshot: Option<String>,
    pub job_id: JobId,
}

impl fmt::Display for ManifestName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.from_snapshot {
            Some(from) => write!(f, "{}@{} (from {from}, job {})", self.volume, self.snapshot, self.job_id),
            None => write!(f, "{}@{} (full, job {})", self.volume, self.snapshot, self.job_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> JobId {
        JobId::parse("1700000000-0a1b2c3d").unwrap()
    }

    #[test]
    fn full_and_incremental_keys() {
        let layout = KeyLayout::new("manifests/", '|');
        let full = ManifestName {
            volume: "tank/data".into(),
            snapshot: "a".into(),
            from_snapshot: None,
            job_id: job(),
        };
        assert_eq!(
            layout.manifest_key(&full),
            "manifests/tank/data|a|1700000000-0a1b2c3d.manifest"
        );
        assert_eq!(
            layout.volume_key(&full, 3),
            "tank/data|a|1700000000-0a1b2c3d|vol000003"
        );

        let incr = ManifestName {
            from_snapshot: Some("a".into()),
            snapshot: "b".into(),
            ..full.clone()
        };
        let key = layout.manifest_key(&incr);
        assert_eq!(key, "manifests/tank/data|b|a|1700000000-0a1b2c3d.manifest");
        assert_eq!(layout.parse_manifest_key(&key), Some(incr));
        assert_eq!(
            layout.parse_manifest_key(&layout.manifest_key(&full)),
            Some(full)
        );
    }

    #[test]
    fn foreign_keys_are_ignored() {
        let layout = KeyLayout::new("manifests", '|');
        assert_eq!(layout.parse_manifest_key("manifests/readme.txt"), None);
        assert_eq!(layout.parse_manifest_key("other/v|a|1-0a1b2c3d.manifest"), None);
        assert_eq!(layout.parse_manifest_key("manifests/v|a|not-a-job.manifest"), None);
        assert_eq!(layout.parse_manifest_key("manifests/v|a|b|c|1-0a1b2c3d.manifest"), None);
    }

    #[test]
    fn components_with_separator_are_rejected() {
        let layout = KeyLayout::new("manifests", '|');
        assert!(layout.validate_component("snapshot", "a|b").is_err());
        assert!(layout.validate_component("snapshot", "").is_err());
        assert!(layout.validate_component("volume", "../etc").is_err());
        assert!(layout.validate_component("volume", "tank/data").is_ok());
    }

    #[test]
    fn listing_prefixes() {
        let layout = KeyLayout::new("manifests", '|');
        assert_eq!(layout.listing_prefix(None), "manifests/");
        assert_eq!(layout.listing_prefix(Some("tank")), "manifests/tank|");
    }
}
