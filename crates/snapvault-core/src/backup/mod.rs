//! Backup side: chunk the snapshot stream, push every volume to every
//! destination, then publish the manifest.

mod buffered;
mod direct;
pub mod smart;

use std::io::Read;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{info, warn};

use snapvault_crypto::KeyMaterial;
use snapvault_storage::{retry_with_backoff, RetryPolicy, ThrottledReader};
use snapvault_types::{CancelToken, Result, SnapvaultError};

use crate::context::{DestinationHandle, EngineContext};
use crate::job::JobInfo;
use crate::manifest::{Manifest, VolumeRecord, MANIFEST_VERSION};

/// Summary of a completed backup.
#[derive(Debug, Clone)]
pub struct BackupReport {
    pub manifest_key: String,
    pub manifest: Manifest,
    pub stored_size: u64,
    pub elapsed: Duration,
    /// Most volume files that were on local disk at the same time.
    pub peak_buffered: usize,
}

struct UploadOutcome {
    records: Vec<VolumeRecord>,
    peak_buffered: usize,
}

/// Run one backup job, reading the snapshot stream from `source`.
///
/// `destinations` must be the connected handles for `job.destinations`. On
/// any failure every object this job created is deleted again (best-effort)
/// so that no destination is left with a partial job.
pub fn run_backup(
    ctx: &EngineContext,
    job: &JobInfo,
    destinations: &[DestinationHandle],
    keys: &KeyMaterial,
    source: &mut dyn Read,
) -> Result<BackupReport> {
    job.validate()?;
    if destinations.len() != job.destinations.len() {
        return Err(SnapvaultError::InvalidInput(format!(
            "job lists {} destinations but {} are connected",
            job.destinations.len(),
            destinations.len()
        )));
    }

    let cancel = ctx.cancel.child();
    let manifest_key = job.layout.manifest_key(&job.manifest_name());
    let started = Instant::now();
    info!(
        job = %job.job_id,
        destinations = destinations.len(),
        "starting backup of {}",
        job.manifest_name()
    );

    let mut written = Vec::new();
    match upload_job(ctx, job, destinations, keys, source, &cancel, &manifest_key, &mut written) {
        Ok((manifest, peak_buffered)) => {
            let stored_size = manifest.stored_size();
            info!(
                job = %job.job_id,
                volumes = manifest.volumes.len(),
                bytes = manifest.total_size,
                "backup complete: {manifest_key}"
            );
            Ok(BackupReport {
                manifest_key,
                manifest,
                stored_size,
                elapsed: started.elapsed(),
                peak_buffered,
            })
        }
        Err(e) => {
            cancel.cancel();
            warn!(job = %job.job_id, "backup failed, removing partial upload: {e}");
            remove_partial(destinations, &written);
            Err(e)
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn upload_job(
    ctx: &EngineContext,
    job: &JobInfo,
    destinations: &[DestinationHandle],
    keys: &KeyMaterial,
    source: &mut dyn Read,
    cancel: &CancelToken,
    manifest_key: &str,
    written: &mut Vec<String>,
) -> Result<(Manifest, usize)> {
    let outcome = match destinations {
        [single] if job.max_file_buffer == 0 => {
            direct::upload_direct(ctx, job, single, keys, source, cancel, written)?
        }
        _ => buffered::upload_buffered(ctx, job, destinations, keys, source, cancel, written)?,
    };
    cancel.check()?;

    let manifest = Manifest {
        version: MANIFEST_VERSION,
        job_id: job.job_id.clone(),
        volume_name: job.volume_name.clone(),
        base_snapshot: job.base_snapshot.clone(),
        incremental_snapshot: job.incremental_snapshot.clone(),
        total_size: outcome.records.iter().map(|v| v.size).sum(),
        volumes: outcome.records,
        destinations: destinations.iter().map(|d| d.uri.clone()).collect(),
        created_at: Utc::now(),
        compression: job.compression.label().to_string(),
        encryption_recipients: keys.recipient_ids(),
        signer: keys.signer_id(),
    };
    let sealed = manifest.to_bytes(keys)?;

    // Every volume is stored everywhere; only now may the manifest appear.
    written.push(manifest_key.to_string());
    for dest in destinations {
        put_with_retry(ctx, dest, manifest_key, &sealed, &job.retry, cancel)?;
    }
    Ok((manifest, outcome.peak_buffered))
}

/// Upload an in-memory object, retrying transient failures.
fn put_with_retry(
    ctx: &EngineContext,
    dest: &DestinationHandle,
    key: &str,
    data: &[u8],
    retry: &RetryPolicy,
    cancel: &CancelToken,
) -> Result<()> {
    let op = format!("{} PUT {key}", dest.uri);
    retry_with_backoff(retry, cancel, &op, || {
        let mut reader = ThrottledReader::new(data, ctx.upload_limiter.clone());
        dest.backend.put(key, data.len() as u64, &mut reader)
    })
}

/// Best-effort delete of everything a failed job wrote. Single attempt per
/// object; failures are logged.
fn remove_partial(destinations: &[DestinationHandle], written: &[String]) {
    for dest in destinations {
        let mut removed = 0usize;
        for key in written {
            match dest.backend.delete(key) {
                Ok(()) => removed += 1,
                Err(e) => warn!(destination = %dest.uri, key = %key, "cleanup failed: {e}"),
            }
        }
        info!(destination = %dest.uri, "removed {removed} object(s) of the failed job");
    }
}
