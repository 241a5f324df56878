pub mod limiter;
pub mod local_backend;
pub mod memory_backend;
pub mod retry;
pub mod s3_backend;

use std::io::Read;
use std::path::PathBuf;

use snapvault_types::{Result, SnapvaultError};

pub use limiter::{ByteRateLimiter, ThrottledReader};
pub use retry::{retry_with_backoff, RetryPolicy};

/// Lazily produced keys from [`StorageBackend::list`]. Calling `list` again
/// restarts the enumeration from the beginning.
pub type KeyListing<'a> = Box<dyn Iterator<Item = Result<String>> + Send + 'a>;

/// Uniform interface to one destination blob store.
///
/// Implementations must be safe to call concurrently for distinct keys.
/// Keys are `/`-separated relative paths.
pub trait StorageBackend: Send + Sync {
    /// Store everything `reader` yields under `key`, replacing any previous
    /// object. `size_hint` is the exact byte count when known.
    fn put(&self, key: &str, size_hint: u64, reader: &mut dyn Read) -> Result<()>;

    /// Open `key` for reading. Fails with `NotFound` when the key is absent.
    fn get(&self, key: &str) -> Result<Box<dyn Read + Send>>;

    /// Enumerate keys starting with `prefix`.
    fn list(&self, prefix: &str) -> Result<KeyListing<'_>>;

    /// Remove `key`. Removing a missing key is not an error.
    fn delete(&self, key: &str) -> Result<()>;

    /// Release the handle. Safe to call more than once.
    fn close(&self) -> Result<()> {
        Ok(())
    }

    /// Destination label used in logs and error contexts.
    fn describe(&self) -> String;

    /// Store an in-memory buffer.
    fn put_bytes(&self, key: &str, data: &[u8]) -> Result<()> {
        let mut reader = data;
        self.put(key, data.len() as u64, &mut reader)
    }

    /// Read `key` fully into memory.
    fn get_bytes(&self, key: &str) -> Result<Vec<u8>> {
        let mut reader = self.get(key)?;
        let mut buf = Vec::new();
        reader
            .read_to_end(&mut buf)
            .map_err(|e| classify_io(format!("{} GET {key}", self.describe()), e))?;
        Ok(buf)
    }

    /// Collect a full listing.
    fn list_all(&self, prefix: &str) -> Result<Vec<String>> {
        self.list(prefix)?.collect()
    }
}

/// Map an I/O failure to the storage error taxonomy.
pub fn classify_io(context: String, err: std::io::Error) -> SnapvaultError {
    if err.kind() == std::io::ErrorKind::NotFound {
        SnapvaultError::NotFound(context)
    } else if retry::is_retryable_io(&err) {
        SnapvaultError::transient(context, err)
    } else {
        SnapvaultError::fatal(context, err)
    }
}

/// A validated destination URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// `file:///absolute/path`
    Local { uri: String, root: PathBuf },
    /// `s3://bucket[/prefix]`
    S3 {
        uri: String,
        bucket: String,
        prefix: String,
    },
    /// `mem://name`, a process-local store shared by name.
    Memory { uri: String, name: String },
}

impl Destination {
    pub fn uri(&self) -> &str {
        match self {
            Destination::Local { uri, .. }
            | Destination::S3 { uri, .. }
            | Destination::Memory { uri, .. } => uri,
        }
    }
}

/// Credentials and endpoint settings for `s3://` destinations.
#[derive(Debug, Clone, Default)]
pub struct S3Settings {
    pub region: Option<String>,
    pub endpoint: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
}

/// Settings needed to construct any backend.
#[derive(Debug, Clone, Default)]
pub struct StorageConfig {
    pub s3: S3Settings,
}

/// Parse and validate a destination URI of the form `scheme://location`.
pub fn parse_destination(uri: &str) -> Result<Destination> {
    let Some((scheme, location)) = uri.split_once("://") else {
        return Err(SnapvaultError::UnsupportedPrefix(uri.to_string()));
    };
    let invalid = |reason: &str| SnapvaultError::InvalidUri {
        uri: uri.to_string(),
        reason: reason.to_string(),
    };

    match scheme.to_ascii_lowercase().as_str() {
        "file" => {
            if location.is_empty() {
                return Err(invalid("missing path"));
            }
            if !location.starts_with('/') {
                return Err(invalid("path must be absolute"));
            }
            Ok(Destination::Local {
                uri: uri.to_string(),
                root: PathBuf::from(location),
            })
        }
        "s3" => {
            let (bucket, prefix) = match location.split_once('/') {
                Some((bucket, prefix)) => (bucket, prefix.trim_matches('/')),
                None => (location, ""),
            };
            validate_bucket_name(bucket).map_err(|reason| invalid(&reason))?;
            Ok(Destination::S3 {
                uri: uri.to_string(),
                bucket: bucket.to_string(),
                prefix: prefix.to_string(),
            })
        }
        "mem" => {
            let name = location.trim_matches('/');
            if name.is_empty() {
                return Err(invalid("missing store name"));
            }
            Ok(Destination::Memory {
                uri: uri.to_string(),
                name: name.to_string(),
            })
        }
        _ => Err(SnapvaultError::UnsupportedPrefix(scheme.to_string())),
    }
}

fn validate_bucket_name(bucket: &str) -> std::result::Result<(), String> {
    if bucket.is_empty() {
        return Err("missing bucket name".into());
    }
    if bucket.len() < 3 || bucket.len() > 63 {
        return Err(format!("bucket name '{bucket}' must be 3-63 characters"));
    }
    let valid = bucket
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.');
    if !valid {
        return Err(format!("bucket name '{bucket}' contains invalid characters"));
    }
    Ok(())
}

/// Construct the backend for an already-parsed destination.
pub fn backend_for_destination(
    destination: &Destination,
    config: &StorageConfig,
) -> Result<Box<dyn StorageBackend>> {
    match destination {
        Destination::Local { uri, root } => {
            Ok(Box::new(local_backend::LocalBackend::new(root, uri)?))
        }
        Destination::S3 {
            uri,
            bucket,
            prefix,
        } => Ok(Box::new(s3_backend::S3Backend::new(
            uri, bucket, prefix, &config.s3,
        )?)),
        Destination::Memory { name, .. } => {
            Ok(Box::new(memory_backend::MemoryBackend::named(name)))
        }
    }
}

/// Parse `uri` and construct its backend.
pub fn backend_from_uri(uri: &str, config: &StorageConfig) -> Result<Box<dyn StorageBackend>> {
    backend_for_destination(&parse_destination(uri)?, config)
}
