mod defaults;

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use snapvault_storage::{RetryPolicy, S3Settings, StorageConfig};
use snapvault_types::{Result, SnapvaultError};

use crate::compress::Compression;
use crate::platform::paths;

pub use self::defaults::parse_human_duration;
use self::defaults::*;

/// Top-level configuration, loaded from YAML. Every field has a default so
/// an empty file (or no file) is valid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapvaultConfig {
    #[serde(default = "default_working_directory")]
    pub working_directory: String,
    #[serde(default = "default_manifest_prefix")]
    pub manifest_prefix: String,
    /// Single character joining key components.
    #[serde(default = "default_separator")]
    pub separator: String,
    #[serde(default = "default_zfs_path")]
    pub zfs_path: String,
    /// Path to the JSON keyring. Defaults to `<working_directory>/keyring.json`.
    #[serde(default)]
    pub keyring: Option<String>,
    /// Volume files kept on local disk at once; 0 streams straight to a
    /// single destination.
    #[serde(default = "default_max_file_buffer")]
    pub max_file_buffer: usize,
    #[serde(default = "default_volume_size_mib")]
    pub volume_size_mib: u64,
    #[serde(default)]
    pub compression: CompressionConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
    #[serde(default)]
    pub s3: S3Config,
}

impl Default for SnapvaultConfig {
    fn default() -> Self {
        Self {
            working_directory: default_working_directory(),
            manifest_prefix: default_manifest_prefix(),
            separator: default_separator(),
            zfs_path: default_zfs_path(),
            keyring: None,
            max_file_buffer: default_max_file_buffer(),
            volume_size_mib: default_volume_size_mib(),
            compression: CompressionConfig::default(),
            retry: RetryConfig::default(),
            limits: LimitsConfig::default(),
            concurrency: ConcurrencyConfig::default(),
            s3: S3Config::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionConfig {
    #[serde(default = "default_algorithm")]
    pub algorithm: String,
    #[serde(default = "default_zstd_level")]
    pub zstd_level: i32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            algorithm: default_algorithm(),
            zstd_level: default_zstd_level(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Give up on one operation after this long ("0" = never).
    #[serde(default = "default_max_retry_time")]
    pub max_retry_time: String,
    #[serde(default = "default_max_backoff")]
    pub max_backoff: String,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retry_time: default_max_retry_time(),
            max_backoff: default_max_backoff(),
            base_delay_ms: default_base_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Aggregate upload ceiling across destinations, KiB/s (0 = unlimited).
    #[serde(default)]
    pub max_upload_speed_kib: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    #[serde(default = "default_uploads")]
    pub uploads: usize,
    #[serde(default = "default_downloads")]
    pub downloads: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            uploads: default_uploads(),
            downloads: default_downloads(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct S3Config {
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub access_key_id: Option<String>,
    #[serde(default)]
    pub secret_access_key: Option<String>,
}

impl SnapvaultConfig {
    /// Load from `path`, or return defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|e| {
                    SnapvaultError::Config(format!("cannot read {}: {e}", path.display()))
                })?;
                Self::from_yaml(&raw)?
            }
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(raw).map_err(|e| SnapvaultError::Config(format!("invalid config: {e}")))
    }

    pub fn validate(&self) -> Result<()> {
        self.separator_char()?;
        self.compression()?;
        self.retry_policy()?;
        if self.manifest_prefix.trim_matches('/').is_empty() {
            return Err(SnapvaultError::Config("manifest_prefix must not be empty".into()));
        }
        if self.volume_size_mib == 0 {
            return Err(SnapvaultError::Config("volume_size_mib must be at least 1".into()));
        }
        if self.concurrency.uploads == 0 || self.concurrency.downloads == 0 {
            return Err(SnapvaultError::Config(
                "concurrency.uploads and concurrency.downloads must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn separator_char(&self) -> Result<char> {
        let mut chars = self.separator.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) if c != '/' => Ok(c),
            _ => Err(SnapvaultError::Config(format!(
                "separator must be a single character other than '/', got '{}'",
                self.separator
            ))),
        }
    }

    pub fn compression(&self) -> Result<Compression> {
        Compression::from_config(&self.compression.algorithm, self.compression.zstd_level)
    }

    pub fn retry_policy(&self) -> Result<RetryPolicy> {
        Ok(RetryPolicy {
            base_delay: Duration::from_millis(self.retry.base_delay_ms.max(1)),
            max_backoff: parse_human_duration(&self.retry.max_backoff)?,
            max_retry_time: parse_human_duration(&self.retry.max_retry_time)?,
        })
    }

    pub fn working_directory(&self) -> PathBuf {
        paths::expand_home(&self.working_directory)
    }

    pub fn keyring_path(&self) -> PathBuf {
        match &self.keyring {
            Some(path) => paths::expand_home(path),
            None => self.working_directory().join("keyring.json"),
        }
    }

    pub fn volume_size_bytes(&self) -> u64 {
        self.volume_size_mib.saturating_mul(1024 * 1024)
    }

    pub fn storage_config(&self) -> StorageConfig {
        StorageConfig {
            s3: S3Settings {
                region: self.s3.region.clone(),
                endpoint: self.s3.endpoint.clone(),
                access_key_id: self.s3.access_key_id.clone(),
                secret_access_key: self.s3.secret_access_key.clone(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_yaml_yields_defaults() {
        let cfg = SnapvaultConfig::from_yaml("").unwrap();
        assert_eq!(cfg.manifest_prefix, "manifests");
        assert_eq!(cfg.separator_char().unwrap(), '|');
        assert_eq!(cfg.max_file_buffer, 5);
        assert_eq!(cfg.volume_size_bytes(), 200 * 1024 * 1024);
        let retry = cfg.retry_policy().unwrap();
        assert_eq!(retry.max_retry_time, Duration::from_secs(12 * 3600));
        assert_eq!(retry.max_backoff, Duration::from_secs(30 * 60));
        assert_eq!(retry.base_delay, Duration::from_secs(1));
    }

    #[test]
    fn partial_yaml_keeps_other_defaults() {
        let cfg = SnapvaultConfig::from_yaml(
            "separator: '#'\nretry:\n  max_retry_time: '0'\nconcurrency:\n  uploads: 8\n",
        )
        .unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.separator_char().unwrap(), '#');
        assert_eq!(cfg.retry_policy().unwrap().max_retry_time, Duration::ZERO);
        assert_eq!(cfg.concurrency.uploads, 8);
        assert_eq!(cfg.concurrency.downloads, 4);
    }

    #[test]
    fn invalid_values_are_config_errors() {
        for yaml in [
            "separator: '||'",
            "separator: '/'",
            "compression:\n  algorithm: brotli",
            "retry:\n  max_backoff: soon",
            "volume_size_mib: 0",
            "manifest_prefix: '/'",
        ] {
            let cfg = SnapvaultConfig::from_yaml(yaml).unwrap();
            assert!(
                matches!(cfg.validate(), Err(SnapvaultError::Config(_))),
                "{yaml} should be rejected"
            );
        }
    }

    #[test]
    fn keyring_defaults_into_working_directory() {
        let mut cfg = SnapvaultConfig::from_yaml("working_directory: /srv/snapvault\n").unwrap();
        assert_eq!(cfg.keyring_path(), Path::new("/srv/snapvault/keyring.json"));
        cfg.keyring = Some("/etc/snapvault/keys.json".into());
        assert_eq!(cfg.keyring_path(), Path::new("/etc/snapvault/keys.json"));
    }
}
