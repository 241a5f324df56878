use std::io::Read;
use std::path::Path;

use tracing::{debug, warn};

use snapvault_storage::{classify_io, retry_with_backoff, RetryPolicy};
use snapvault_types::{CancelToken, ErrorClass, Result, SnapvaultError};

use crate::context::DestinationHandle;
use crate::manifest::VolumeRecord;
use crate::volume::verify_stored;

/// Whether a failed download should move on to the next destination.
pub(super) fn try_next_destination(err: &SnapvaultError) -> bool {
    matches!(err.class(), ErrorClass::Fatal | ErrorClass::NotFound)
}

/// Download one volume, check it against its stored checksum and write the
/// payload, still sealed, to `path`. Destinations are tried in the order
/// given.
pub(super) fn fetch_volume(
    record: &VolumeRecord,
    destinations: &[DestinationHandle],
    retry: &RetryPolicy,
    cancel: &CancelToken,
    path: &Path,
) -> Result<()> {
    let mut last_err = None;
    for dest in destinations {
        cancel.check()?;
        match download(dest, record, retry, cancel) {
            Ok(payload) => {
                verify_stored(record, &payload)?;
                std::fs::write(path, &payload).map_err(|e| {
                    SnapvaultError::Other(format!("cannot write {}: {e}", path.display()))
                })?;
                debug!(destination = %dest.uri, key = %record.key, "volume fetched");
                return Ok(());
            }
            Err(e) if try_next_destination(&e) => {
                warn!(destination = %dest.uri, key = %record.key, "download failed: {e}");
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        SnapvaultError::InvalidInput("no destinations to restore from".into())
    }))
}

fn download(
    dest: &DestinationHandle,
    record: &VolumeRecord,
    retry: &RetryPolicy,
    cancel: &CancelToken,
) -> Result<Vec<u8>> {
    let op = format!("{} GET {}", dest.uri, record.key);
    retry_with_backoff(retry, cancel, &op, || {
        let reader = dest.backend.get(&record.key)?;
        let mut payload = Vec::with_capacity(record.stored_size.min(64 * 1024 * 1024) as usize);
        // One byte past the recorded size is enough to prove a mismatch.
        reader
            .take(record.stored_size.saturating_add(1))
            .read_to_end(&mut payload)
            .map_err(|e| classify_io(op.clone(), e))?;
        Ok(payload)
    })
}
