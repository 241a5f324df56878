use std::path::PathBuf;
use std::sync::Arc;

use tracing::warn;

use snapvault_storage::{
    backend_for_destination, parse_destination, ByteRateLimiter, StorageBackend, StorageConfig,
};
use snapvault_types::{CancelToken, Result, SnapvaultError};

use crate::config::SnapvaultConfig;
use crate::platform::paths::create_private_dir;

/// Process-wide engine state, built once at startup and passed by reference
/// into every job.
pub struct EngineContext {
    pub working_directory: PathBuf,
    /// Shared by every upload worker of every destination.
    pub upload_limiter: Option<Arc<ByteRateLimiter>>,
    /// Cancelling this stops every job started from this context.
    pub cancel: CancelToken,
    pub upload_concurrency: usize,
    pub download_concurrency: usize,
    pub storage: StorageConfig,
}

impl EngineContext {
    pub fn new(working_directory: impl Into<PathBuf>) -> Self {
        Self {
            working_directory: working_directory.into(),
            upload_limiter: None,
            cancel: CancelToken::new(),
            upload_concurrency: 4,
            download_concurrency: 4,
            storage: StorageConfig::default(),
        }
    }

    pub fn from_config(config: &SnapvaultConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            working_directory: config.working_directory(),
            upload_limiter: ByteRateLimiter::from_kib_per_sec(config.limits.max_upload_speed_kib),
            cancel: CancelToken::new(),
            upload_concurrency: config.concurrency.uploads,
            download_concurrency: config.concurrency.downloads,
            storage: config.storage_config(),
        })
    }

    /// Parent of the per-job scratch directories.
    pub fn temp_root(&self) -> PathBuf {
        self.working_directory.join("temp")
    }

    /// Create a scratch directory for one job. It is removed when the
    /// returned handle drops, whether the job succeeded or not.
    pub fn job_temp_dir(&self, job_label: &str) -> Result<tempfile::TempDir> {
        let root = self.temp_root();
        create_private_dir(&root).map_err(|e| {
            SnapvaultError::Other(format!("cannot create {}: {e}", root.display()))
        })?;
        tempfile::Builder::new()
            .prefix(&format!("{job_label}-"))
            .tempdir_in(&root)
            .map_err(|e| {
                SnapvaultError::Other(format!("cannot create job directory in {}: {e}", root.display()))
            })
    }

    /// Validate every URI first, then connect. A bad URI anywhere in the
    /// list fails before any backend is built.
    pub fn open_destinations(&self, uris: &[String]) -> Result<Vec<DestinationHandle>> {
        if uris.is_empty() {
            return Err(SnapvaultError::InvalidInput(
                "at least one destination is required".into(),
            ));
        }
        let parsed = uris
            .iter()
            .map(|uri| parse_destination(uri))
            .collect::<Result<Vec<_>>>()?;
        parsed
            .iter()
            .map(|dest| {
                let backend = backend_for_destination(dest, &self.storage)?;
                Ok(DestinationHandle {
                    uri: dest.uri().to_string(),
                    backend: Arc::from(backend),
                })
            })
            .collect()
    }
}

/// One connected destination for the duration of a job.
#[derive(Clone)]
pub struct DestinationHandle {
    pub uri: String,
    pub backend: Arc<dyn StorageBackend>,
}

impl DestinationHandle {
    pub fn new(uri: impl Into<String>, backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            uri: uri.into(),
            backend,
        }
    }
}

impl std::fmt::Debug for DestinationHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DestinationHandle")
            .field("uri", &self.uri)
            .finish()
    }
}

/// Release every handle, logging failures instead of returning them.
pub fn close_destinations(destinations: &[DestinationHandle]) {
    for dest in destinations {
        if let Err(e) = dest.backend.close() {
            warn!(destination = %dest.uri, "failed to close destination: {e}");
        }
    }
}
