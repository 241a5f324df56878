//! The manifest: authoritative record of one completed backup job.
//!
//! A manifest is written to a destination only after every volume it lists
//! has been stored there, so its presence is the completion marker for the
//! job. Manifests are JSON wrapped in the same envelope as volumes, which
//! keeps the volume list private for encrypted jobs.

pub mod keys;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use snapvault_crypto::{open, seal, KeyMaterial};
use snapvault_types::{Checksum, JobId, Result, SnapshotInfo, SnapvaultError};

pub use self::keys::{KeyLayout, ManifestName};

pub const MANIFEST_VERSION: u32 = 1;

/// One stored volume as recorded in the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeRecord {
    /// 1-based position in the stream.
    pub index: u32,
    /// Plaintext size.
    pub size: u64,
    /// Checksum of the plaintext, before compression and encryption.
    pub checksum: Checksum,
    pub stored_size: u64,
    /// Checksum of the bytes as stored at each destination.
    pub stored_checksum: Checksum,
    pub key: String,
    pub encrypted: bool,
    pub signed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub job_id: JobId,
    pub volume_name: String,
    /// The snapshot this job captured.
    pub base_snapshot: SnapshotInfo,
    /// The snapshot the stream is relative to. `None` for a full backup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub incremental_snapshot: Option<SnapshotInfo>,
    pub volumes: Vec<VolumeRecord>,
    pub destinations: Vec<String>,
    pub total_size: u64,
    pub created_at: DateTime<Utc>,
    pub compression: String,
    #[serde(default)]
    pub encryption_recipients: Vec<String>,
    #[serde(default)]
    pub signer: Option<String>,
}

impl Manifest {
    pub fn is_full(&self) -> bool {
        self.incremental_snapshot.is_none()
    }

    pub fn name(&self) -> ManifestName {
        ManifestName {
            volume: self.volume_name.clone(),
            snapshot: self.base_snapshot.name.clone(),
            from_snapshot: self.incremental_snapshot.as_ref().map(|s| s.name.clone()),
            job_id: self.job_id.clone(),
        }
    }

    pub fn stored_size(&self) -> u64 {
        self.volumes.iter().map(|v| v.stored_size).sum()
    }

    /// Structural checks run on every manifest read from a destination.
    pub fn validate(&self) -> Result<()> {
        if self.version != MANIFEST_VERSION {
            return Err(SnapvaultError::Integrity(format!(
                "unsupported manifest version {}",
                self.version
            )));
        }
        for (pos, volume) in self.volumes.iter().enumerate() {
            if volume.index as usize != pos + 1 {
                return Err(SnapvaultError::Integrity(format!(
                    "manifest for {} lists volume {} at position {}",
                    self.name(),
                    volume.index,
                    pos + 1
                )));
            }
        }
        let sum: u64 = self.volumes.iter().map(|v| v.size).sum();
        if sum != self.total_size {
            return Err(SnapvaultError::Integrity(format!(
                "manifest for {} records total size {} but volumes add up to {sum}",
                self.name(),
                self.total_size
            )));
        }
        Ok(())
    }

    /// Serialize and seal for upload.
    pub fn to_bytes(&self, keys: &KeyMaterial) -> Result<Vec<u8>> {
        let json = serde_json::to_vec_pretty(self)?;
        seal(&json, "none", keys)
    }

    /// Open and parse a sealed manifest.
    pub fn from_bytes(data: &[u8], keys: &KeyMaterial) -> Result<Self> {
        let opened = open(data, keys)?;
        let manifest: Manifest = serde_json::from_slice(&opened.body)
            .map_err(|e| SnapvaultError::Integrity(format!("malformed manifest: {e}")))?;
        manifest.validate()?;
        Ok(manifest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use snapvault_crypto::Identity;

    fn sample() -> Manifest {
        let data = b"0123456789";
        Manifest {
            version: MANIFEST_VERSION,
            job_id: JobId::parse("1700000000-deadbeef").unwrap(),
            volume_name: "tank/data".into(),
            base_snapshot: SnapshotInfo::new("b"),
            incremental_snapshot: Some(SnapshotInfo::new("a")),
            volumes: vec![VolumeRecord {
                index: 1,
                size: data.len() as u64,
                checksum: Checksum::compute(data),
                stored_size: 42,
                stored_checksum: Checksum::compute(b"stored"),
                key: "tank/data|b|a|1700000000-deadbeef|vol000001".into(),
                encrypted: false,
                signed: false,
            }],
            destinations: vec!["mem://one".into()],
            total_size: data.len() as u64,
            created_at: DateTime::from_timestamp(1_700_000_100, 0).unwrap(),
            compression: "lz4".into(),
            encryption_recipients: Vec::new(),
            signer: None,
        }
    }

    #[test]
    fn sealed_manifest_reads_back() {
        let manifest = sample();
        let keys = KeyMaterial::default();
        let bytes = manifest.to_bytes(&keys).unwrap();
        assert_eq!(Manifest::from_bytes(&bytes, &keys).unwrap(), manifest);
        assert!(!manifest.is_full());
        assert_eq!(manifest.name().from_snapshot.as_deref(), Some("a"));
    }

    #[test]
    fn encrypted_manifest_hides_volume_keys() {
        let id = Identity::generate("ops@example.com");
        let keys = KeyMaterial::for_identity(&id, true, false);
        let bytes = sample().to_bytes(&keys).unwrap();
        let needle = b"vol000001";
        assert!(!bytes.windows(needle.len()).any(|w| w == needle));
        assert!(Manifest::from_bytes(&bytes, &KeyMaterial::default()).is_err());
        assert_eq!(Manifest::from_bytes(&bytes, &keys).unwrap(), sample());
    }

    #[test]
    fn inconsistent_manifests_are_rejected() {
        let mut gap = sample();
        gap.volumes[0].index = 2;
        assert!(matches!(gap.validate(), Err(SnapvaultError::Integrity(_))));

        let mut size = sample();
        size.total_size += 1;
        assert!(matches!(size.validate(), Err(SnapvaultError::Integrity(_))));
    }
}
