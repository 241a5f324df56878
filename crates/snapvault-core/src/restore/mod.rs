//! Restore side: resolve the snapshot chain, download volumes in parallel
//! and replay each manifest's stream to its sink in order.

mod fetch;
mod reorder;

use std::io::Write;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use snapvault_crypto::KeyMaterial;
use snapvault_types::{Result, SnapvaultError};

use self::reorder::ReorderBuffer;
use crate::buffer::{FileBuffer, SlotGuard};
use crate::chain::{load_catalog, CatalogEntry, ChainRequest};
use crate::context::{DestinationHandle, EngineContext};
use crate::job::RestoreJob;
use crate::manifest::Manifest;
use crate::stream::StreamSink;
use crate::volume::decode_volume;

#[derive(Debug, Clone, Default)]
pub struct RestoreReport {
    /// Manifest keys in replay order.
    pub replayed: Vec<String>,
    pub volumes: usize,
    pub bytes: u64,
    pub elapsed: Duration,
}

/// Read the catalog from the first destination that can list it and
/// compute the replay chain, oldest first.
pub fn resolve_restore_chain(
    ctx: &EngineContext,
    job: &RestoreJob,
    destinations: &[DestinationHandle],
    keys: &KeyMaterial,
) -> Result<Vec<CatalogEntry>> {
    job.validate()?;
    let mut last_err = None;
    for dest in destinations {
        match load_catalog(dest, &job.layout, &job.volume_name, keys, &job.retry, &ctx.cancel) {
            Ok(catalog) => {
                let request = ChainRequest {
                    volume: &job.volume_name,
                    target: job.target.as_deref(),
                    stop_at: job.stop_at.as_deref(),
                    present: &job.present,
                };
                return catalog.resolve(&request);
            }
            Err(e) if fetch::try_next_destination(&e) => {
                warn!(destination = %dest.uri, "cannot read manifests: {e}");
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        SnapvaultError::InvalidInput("at least one destination is required".into())
    }))
}

/// Resolve and replay a full restore. `open_sink` is called once per chain
/// link, in replay order, and the sink is finished before the next link
/// starts.
pub fn run_restore(
    ctx: &EngineContext,
    job: &RestoreJob,
    destinations: &[DestinationHandle],
    keys: &KeyMaterial,
    open_sink: &mut dyn FnMut(&Manifest) -> Result<Box<dyn StreamSink>>,
) -> Result<RestoreReport> {
    let started = Instant::now();
    let chain = resolve_restore_chain(ctx, job, destinations, keys)?;
    if chain.is_empty() {
        info!("{} is already up to date", job.volume_name);
    }

    let mut report = RestoreReport::default();
    for entry in &chain {
        info!(
            volumes = entry.manifest.volumes.len(),
            bytes = entry.manifest.total_size,
            "replaying {}",
            entry.name
        );
        let mut sink = open_sink(&entry.manifest)?;
        let bytes = restore_manifest(ctx, job, &entry.manifest, destinations, keys, &mut *sink)?;
        sink.finish()?;
        report.replayed.push(entry.key.clone());
        report.volumes += entry.manifest.volumes.len();
        report.bytes += bytes;
    }
    report.elapsed = started.elapsed();
    Ok(report)
}

/// Download, verify and write one manifest's stream to `sink`.
///
/// Up to `download_concurrency` volumes download at once, each into a temp
/// file that holds a buffer slot until the writer has consumed it. Slots
/// are taken in sequence order, so the next volume the writer needs always
/// has one. Temp files hold the stored payload as downloaded; volumes are
/// opened and decompressed only on their way into `sink`.
pub fn restore_manifest<W: Write + ?Sized>(
    ctx: &EngineContext,
    job: &RestoreJob,
    manifest: &Manifest,
    destinations: &[DestinationHandle],
    keys: &KeyMaterial,
    sink: &mut W,
) -> Result<u64> {
    if destinations.is_empty() {
        return Err(SnapvaultError::InvalidInput(
            "at least one destination is required".into(),
        ));
    }
    let cancel = ctx.cancel.child();
    if manifest.volumes.is_empty() {
        sink.flush()
            .map_err(|e| SnapvaultError::fatal("stream sink", e))?;
        return Ok(0);
    }

    let temp_dir = ctx.job_temp_dir(&format!("restore-{}", manifest.job_id))?;
    let buffer = FileBuffer::new(job.max_file_buffer);
    let reorder = ReorderBuffer::new();
    let first_error = Mutex::new(None::<SnapvaultError>);
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(ctx.download_concurrency.max(1))
        .build()
        .map_err(|e| SnapvaultError::Other(format!("failed to build thread pool: {e}")))?;

    let fail = |err: SnapvaultError| {
        if let Ok(mut slot) = first_error.lock() {
            if slot.is_none() {
                *slot = Some(err);
            }
        }
        cancel.cancel();
        buffer.poison();
        reorder.fail();
    };

    let written = std::thread::scope(|s| {
        s.spawn(|| {
            pool.in_place_scope(|ps| {
                for record in &manifest.volumes {
                    if cancel.is_cancelled() {
                        reorder.fail();
                        break;
                    }
                    let slot = match SlotGuard::acquire(&buffer) {
                        Ok(slot) => slot,
                        Err(_) => {
                            reorder.fail();
                            break;
                        }
                    };
                    let path = temp_dir.path().join(format!("vol{:06}", record.index));
                    let (reorder, cancel, fail) = (&reorder, &cancel, &fail);
                    ps.spawn(move |_| {
                        match fetch::fetch_volume(record, destinations, &job.retry, cancel, &path) {
                            Ok(()) => {
                                slot.defuse();
                                reorder.deliver(record.index, path);
                            }
                            Err(e) => fail(e),
                        }
                    });
                }
            });
        });

        match write_in_order(manifest, &reorder, &buffer, keys, sink) {
            Ok(written) => Some(written),
            Err(e) => {
                fail(e);
                None
            }
        }
    });

    let failure = first_error
        .into_inner()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(err) = failure {
        return Err(err);
    }
    let written = written.ok_or(SnapvaultError::Cancelled)?;
    if written != manifest.total_size {
        return Err(SnapvaultError::Integrity(format!(
            "restored {written} bytes but the manifest records {}",
            manifest.total_size
        )));
    }
    Ok(written)
}

fn write_in_order<W: Write + ?Sized>(
    manifest: &Manifest,
    reorder: &ReorderBuffer,
    buffer: &FileBuffer,
    keys: &KeyMaterial,
    sink: &mut W,
) -> Result<u64> {
    let mut written = 0u64;
    for record in &manifest.volumes {
        let path = reorder.wait_for(record.index)?;
        let payload = std::fs::read(&path);
        if let Err(e) = std::fs::remove_file(&path) {
            warn!("could not remove {}: {e}", path.display());
        }
        buffer.release();
        let payload = payload.map_err(|e| {
            SnapvaultError::Other(format!("cannot read {}: {e}", path.display()))
        })?;
        let data = decode_volume(record, &payload, keys)?;
        sink.write_all(&data)
            .map_err(|e| SnapvaultError::fatal("stream sink", e))?;
        written += data.len() as u64;
    }
    sink.flush()
        .map_err(|e| SnapvaultError::fatal("stream sink", e))?;
    Ok(written)
}
