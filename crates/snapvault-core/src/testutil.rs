use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use snapvault_storage::memory_backend::MemoryBackend;
use snapvault_storage::{KeyListing, RetryPolicy, StorageBackend};
use snapvault_types::{Result, SnapshotInfo, SnapvaultError};

use crate::config::SnapvaultConfig;
use crate::context::{DestinationHandle, EngineContext};
use crate::job::{JobInfo, RestoreJob};
use crate::stream::StreamSink;

/// Retry settings that keep tests fast.
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        base_delay: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
        max_retry_time: Duration::from_secs(5),
    }
}

pub fn test_context(dir: &tempfile::TempDir) -> EngineContext {
    let mut ctx = EngineContext::new(dir.path());
    ctx.upload_concurrency = 3;
    ctx.download_concurrency = 3;
    ctx
}

pub fn memory_destination(label: &str) -> (MemoryBackend, DestinationHandle) {
    let backend = MemoryBackend::new();
    let handle = DestinationHandle::new(format!("mem://{label}"), Arc::new(backend.clone()));
    (backend, handle)
}

pub fn backup_job(
    volume: &str,
    snapshot: &str,
    from: Option<&str>,
    destinations: &[DestinationHandle],
    volume_size: u64,
) -> JobInfo {
    let mut job = JobInfo::from_config(
        &SnapvaultConfig::default(),
        volume,
        SnapshotInfo::new(snapshot),
        destinations.iter().map(|d| d.uri.clone()).collect(),
    )
    .unwrap();
    job.incremental_snapshot = from.map(SnapshotInfo::new);
    job.volume_size = volume_size;
    job.retry = fast_retry();
    job
}

pub fn restore_job(
    volume: &str,
    target: Option<&str>,
    destinations: &[DestinationHandle],
) -> RestoreJob {
    let mut job = RestoreJob::from_config(
        &SnapvaultConfig::default(),
        volume,
        target.map(str::to_string),
        destinations.iter().map(|d| d.uri.clone()).collect(),
    )
    .unwrap();
    job.retry = fast_retry();
    job
}

/// Deterministic pseudo-random test data.
pub fn stream_bytes(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u32).wrapping_mul(2_654_435_761).rotate_left(seed as u32 % 31) as u8 ^ seed)
        .collect()
}

/// How a [`FlakyBackend`] misbehaves on `put`.
#[derive(Debug, Clone, Copy)]
pub enum PutFault {
    /// Fail the first `n` puts with a transient error, storing nothing.
    TransientBefore(usize),
    /// Store the object, then report a transient error for the first `n`
    /// puts, like a response lost after the write landed.
    LostAckBefore(usize),
    /// Fail put number `n` (1-based) and every later one with a fatal error.
    FatalFrom(usize),
}

/// Wraps a backend and injects failures into `put`.
pub struct FlakyBackend {
    inner: MemoryBackend,
    fault: PutFault,
    puts: AtomicUsize,
    failures: AtomicUsize,
}

impl FlakyBackend {
    pub fn new(inner: MemoryBackend, fault: PutFault) -> Self {
        Self {
            inner,
            fault,
            puts: AtomicUsize::new(0),
            failures: AtomicUsize::new(0),
        }
    }

    pub fn failures(&self) -> usize {
        self.failures.load(Ordering::SeqCst)
    }

    fn fail_transient(&self, key: &str) -> SnapvaultError {
        self.failures.fetch_add(1, Ordering::SeqCst);
        SnapvaultError::transient(format!("flaky PUT {key}"), "connection reset")
    }
}

impl StorageBackend for FlakyBackend {
    fn put(&self, key: &str, size_hint: u64, reader: &mut dyn Read) -> Result<()> {
        let n = self.puts.fetch_add(1, Ordering::SeqCst) + 1;
        match self.fault {
            PutFault::TransientBefore(limit) if n <= limit => Err(self.fail_transient(key)),
            PutFault::LostAckBefore(limit) if n <= limit => {
                self.inner.put(key, size_hint, reader)?;
                Err(self.fail_transient(key))
            }
            PutFault::FatalFrom(from) if n >= from => {
                self.failures.fetch_add(1, Ordering::SeqCst);
                Err(SnapvaultError::fatal(format!("flaky PUT {key}"), "access denied"))
            }
            _ => self.inner.put(key, size_hint, reader),
        }
    }

    fn get(&self, key: &str) -> Result<Box<dyn Read + Send>> {
        self.inner.get(key)
    }

    fn list(&self, prefix: &str) -> Result<KeyListing<'_>> {
        self.inner.list(prefix)
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.inner.delete(key)
    }

    fn describe(&self) -> String {
        format!("flaky({})", self.inner.describe())
    }
}

/// Every operation fails with a transient error.
pub struct AlwaysTransientBackend {
    pub attempts: AtomicUsize,
}

impl AlwaysTransientBackend {
    pub fn new() -> Self {
        Self {
            attempts: AtomicUsize::new(0),
        }
    }

    fn fail(&self, op: &str, key: &str) -> SnapvaultError {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        SnapvaultError::transient(format!("down {op} {key}"), "503 Service Unavailable")
    }
}

impl StorageBackend for AlwaysTransientBackend {
    fn put(&self, key: &str, _size_hint: u64, _reader: &mut dyn Read) -> Result<()> {
        Err(self.fail("PUT", key))
    }

    fn get(&self, key: &str) -> Result<Box<dyn Read + Send>> {
        Err(self.fail("GET", key))
    }

    fn list(&self, prefix: &str) -> Result<KeyListing<'_>> {
        Err(self.fail("LIST", prefix))
    }

    fn delete(&self, key: &str) -> Result<()> {
        Err(self.fail("DELETE", key))
    }

    fn describe(&self) -> String {
        "down://".into()
    }
}

/// A sink whose bytes stay observable after it has been boxed and finished.
#[derive(Clone, Debug, Default)]
pub struct SharedSink {
    pub data: Arc<Mutex<Vec<u8>>>,
    pub finished: Arc<AtomicUsize>,
}

impl SharedSink {
    pub fn bytes(&self) -> Vec<u8> {
        self.data.lock().unwrap().clone()
    }
}

impl Write for SharedSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.data.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl StreamSink for SharedSink {
    fn finish(self: Box<Self>) -> Result<()> {
        self.finished.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
