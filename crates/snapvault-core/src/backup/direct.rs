use std::io::Read;

use tracing::debug;

use snapvault_crypto::KeyMaterial;
use snapvault_types::{CancelToken, Result};

use super::{put_with_retry, UploadOutcome};
use crate::chunker::Chunker;
use crate::context::{DestinationHandle, EngineContext};
use crate::job::JobInfo;
use crate::volume::encode_volume;

/// Unbuffered upload to exactly one destination.
///
/// Each volume goes from memory straight to the backend as soon as it is
/// encoded. Nothing touches local disk, so there is no file to re-verify
/// before an attempt and at most one volume is in flight.
pub(super) fn upload_direct(
    ctx: &EngineContext,
    job: &JobInfo,
    dest: &DestinationHandle,
    keys: &KeyMaterial,
    source: &mut dyn Read,
    cancel: &CancelToken,
    written: &mut Vec<String>,
) -> Result<UploadOutcome> {
    let name = job.manifest_name();
    let mut chunker = Chunker::new(source, job.volume_size)?;
    let mut records = Vec::new();

    while let Some(raw) = chunker.next_volume()? {
        cancel.check()?;
        let key = job.layout.volume_key(&name, raw.index);
        let encoded = encode_volume(raw, key, job.compression, keys)?;
        written.push(encoded.record.key.clone());
        put_with_retry(
            ctx,
            dest,
            &encoded.record.key,
            &encoded.payload,
            &job.retry,
            cancel,
        )?;
        debug!(destination = %dest.uri, key = %encoded.record.key, "volume stored");
        records.push(encoded.record);
    }

    Ok(UploadOutcome {
        records,
        peak_buffered: 0,
    })
}
