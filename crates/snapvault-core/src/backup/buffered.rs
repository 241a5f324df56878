use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crossbeam_channel::Sender;
use tracing::debug;

use snapvault_crypto::KeyMaterial;
use snapvault_storage::{retry_with_backoff, ThrottledReader};
use snapvault_types::{CancelToken, ChecksumHasher, Result, SnapvaultError};

use super::UploadOutcome;
use crate::buffer::{FileBuffer, SlotGuard};
use crate::chunker::Chunker;
use crate::context::{DestinationHandle, EngineContext};
use crate::job::JobInfo;
use crate::manifest::VolumeRecord;
use crate::volume::encode_volume;

const VERIFY_BUF_SIZE: usize = 256 * 1024;

/// A volume file on local disk waiting for upload. Dropping it releases its
/// buffer slot.
struct PendingVolume<'b> {
    record: VolumeRecord,
    path: PathBuf,
    _slot: SlotGuard<'b>,
}

impl Drop for PendingVolume<'_> {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            debug!("could not remove {}: {e}", self.path.display());
        }
    }
}

/// Buffered upload: the calling thread chunks and encodes volumes into
/// files under the job's temp directory, holding one [`FileBuffer`] slot per
/// file; `upload_concurrency` workers push each file to every destination.
pub(super) fn upload_buffered(
    ctx: &EngineContext,
    job: &JobInfo,
    destinations: &[DestinationHandle],
    keys: &KeyMaterial,
    source: &mut dyn Read,
    cancel: &CancelToken,
    written: &mut Vec<String>,
) -> Result<UploadOutcome> {
    let temp_dir = ctx.job_temp_dir(job.job_id.as_str())?;
    let buffer = FileBuffer::new(job.max_file_buffer);
    let first_error = Mutex::new(None::<SnapvaultError>);
    let workers = ctx.upload_concurrency.max(1);

    let produced = std::thread::scope(|s| {
        let (tx, rx) = crossbeam_channel::bounded::<PendingVolume<'_>>(job.max_file_buffer);

        for _ in 0..workers {
            let rx = rx.clone();
            let buffer = &buffer;
            let first_error = &first_error;
            s.spawn(move || {
                for pending in rx.iter() {
                    if cancel.is_cancelled() {
                        continue;
                    }
                    if let Err(e) = upload_volume(ctx, job, destinations, &pending, cancel) {
                        record_failure(first_error, cancel, buffer, e);
                    }
                }
            });
        }
        drop(rx);

        let producer = Producer {
            job,
            keys,
            temp_dir: temp_dir.path(),
            buffer: &buffer,
            cancel,
        };
        match producer.run(source, tx, written) {
            Ok(records) => Some(records),
            Err(e) => {
                record_failure(&first_error, cancel, &buffer, e);
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
    cancel.check()?;
    let records = produced.ok_or(SnapvaultError::Cancelled)?;
    Ok(UploadOutcome {
        records,
        peak_buffered: buffer.peak_in_use(),
    })
}

fn record_failure(
    first_error: &Mutex<Option<SnapvaultError>>,
    cancel: &CancelToken,
    buffer: &FileBuffer,
    err: SnapvaultError,
) {
    if let Ok(mut slot) = first_error.lock() {
        if slot.is_none() {
            *slot = Some(err);
        }
    }
    cancel.cancel();
    buffer.poison();
}

struct Producer<'a, 'b> {
    job: &'a JobInfo,
    keys: &'a KeyMaterial,
    temp_dir: &'a Path,
    buffer: &'b FileBuffer,
    cancel: &'a CancelToken,
}

impl<'b> Producer<'_, 'b> {
    fn run(
        &self,
        source: &mut dyn Read,
        tx: Sender<PendingVolume<'b>>,
        written: &mut Vec<String>,
    ) -> Result<Vec<VolumeRecord>> {
        let name = self.job.manifest_name();
        let mut chunker = Chunker::new(source, self.job.volume_size)?;
        let mut records = Vec::new();

        loop {
            self.cancel.check()?;
            // Take the slot before reading so a full buffer stalls the source.
            let slot = SlotGuard::acquire(self.buffer)?;
            self.cancel.check()?;
            let Some(raw) = chunker.next_volume()? else {
                break;
            };

            let key = self.job.layout.volume_key(&name, raw.index);
            let encoded = encode_volume(raw, key, self.job.compression, self.keys)?;
            let path = self
                .temp_dir
                .join(format!("vol{:06}", encoded.record.index));
            std::fs::write(&path, &encoded.payload).map_err(|e| {
                SnapvaultError::Other(format!("cannot write {}: {e}", path.display()))
            })?;

            written.push(encoded.record.key.clone());
            records.push(encoded.record.clone());
            debug!(
                index = encoded.record.index,
                size = encoded.record.size,
                stored = encoded.record.stored_size,
                "volume ready"
            );

            let pending = PendingVolume {
                record: encoded.record,
                path,
                _slot: slot,
            };
            if tx.send(pending).is_err() {
                return Err(SnapvaultError::Cancelled);
            }
        }
        Ok(records)
    }
}

fn upload_volume(
    ctx: &EngineContext,
    job: &JobInfo,
    destinations: &[DestinationHandle],
    pending: &PendingVolume<'_>,
    cancel: &CancelToken,
) -> Result<()> {
    let record = &pending.record;
    for dest in destinations {
        cancel.check()?;
        let op = format!("{} PUT {}", dest.uri, record.key);
        retry_with_backoff(&job.retry, cancel, &op, || {
            verify_volume_file(&pending.path, record)?;
            let file = File::open(&pending.path).map_err(|e| {
                SnapvaultError::Other(format!("cannot open {}: {e}", pending.path.display()))
            })?;
            let mut reader =
                ThrottledReader::new(BufReader::new(file), ctx.upload_limiter.clone());
            dest.backend.put(&record.key, record.stored_size, &mut reader)
        })?;
        debug!(destination = %dest.uri, key = %record.key, "volume stored");
    }
    Ok(())
}

/// Re-hash the local file so bytes damaged on disk are never uploaded.
fn verify_volume_file(path: &Path, record: &VolumeRecord) -> Result<()> {
    let mut file = File::open(path)
        .map_err(|e| SnapvaultError::Other(format!("cannot open {}: {e}", path.display())))?;
    let mut hasher = ChecksumHasher::new();
    let mut buf = vec![0u8; VERIFY_BUF_SIZE];
    let mut total = 0u64;
    loop {
        let n = file
            .read(&mut buf)
            .map_err(|e| SnapvaultError::Other(format!("cannot read {}: {e}", path.display())))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    let actual = hasher.finalize();
    if actual != record.stored_checksum || total != record.stored_size {
        return Err(SnapvaultError::Corruption {
            key: record.key.clone(),
            expected: record.stored_checksum.to_hex(),
            actual: actual.to_hex(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use snapvault_types::Checksum;

    #[test]
    fn local_file_damage_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vol000001");
        std::fs::write(&path, b"payload").unwrap();
        let mut record = VolumeRecord {
            index: 1,
            size: 7,
            checksum: Checksum::compute(b"payload"),
            stored_size: 7,
            stored_checksum: Checksum::compute(b"payload"),
            key: "v|a|1-00000000|vol000001".into(),
            encrypted: false,
            signed: false,
        };
        verify_volume_file(&path, &record).unwrap();

        record.stored_checksum = Checksum::compute(b"pay1oad");
        assert!(matches!(
            verify_volume_file(&path, &record),
            Err(SnapvaultError::Corruption { .. })
        ));
    }
}
