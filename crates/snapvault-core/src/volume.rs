use snapvault_crypto::{open, seal, KeyMaterial};
use snapvault_types::{Checksum, Result, SnapvaultError};

use crate::chunker::RawVolume;
use crate::compress::{self, Compression};
use crate::manifest::VolumeRecord;

/// A volume after compression and the crypto stage, ready for upload.
#[derive(Debug)]
pub struct EncodedVolume {
    pub record: VolumeRecord,
    pub payload: Vec<u8>,
}

/// Compress, seal and describe one volume.
pub fn encode_volume(
    raw: RawVolume,
    key: String,
    compression: Compression,
    keys: &KeyMaterial,
) -> Result<EncodedVolume> {
    let compressed = compress::compress(compression, &raw.data)?;
    let payload = seal(&compressed, compression.label(), keys)?;
    let record = VolumeRecord {
        index: raw.index,
        size: raw.data.len() as u64,
        checksum: raw.checksum,
        stored_size: payload.len() as u64,
        stored_checksum: Checksum::compute(&payload),
        key,
        encrypted: keys.encrypts(),
        signed: keys.signs(),
    };
    Ok(EncodedVolume { record, payload })
}

/// Check a stored payload against its record before any decoding.
pub fn verify_stored(record: &VolumeRecord, payload: &[u8]) -> Result<()> {
    let actual = Checksum::compute(payload);
    if actual != record.stored_checksum {
        return Err(corruption(&record.key, &record.stored_checksum, &actual));
    }
    Ok(())
}

/// Verify, open and decompress a downloaded payload, returning the original
/// plaintext of the volume.
pub fn decode_volume(record: &VolumeRecord, payload: &[u8], keys: &KeyMaterial) -> Result<Vec<u8>> {
    verify_stored(record, payload)?;

    let opened = open(payload, keys)?;
    if opened.encrypted != record.encrypted || opened.signed != record.signed {
        return Err(SnapvaultError::Integrity(format!(
            "volume '{}' envelope (encrypted={}, signed={}) does not match its manifest entry \
             (encrypted={}, signed={})",
            record.key, opened.encrypted, opened.signed, record.encrypted, record.signed
        )));
    }

    let plaintext = compress::decompress(&opened.body, record.size)?;
    verify_plaintext(record, &plaintext)?;
    Ok(plaintext)
}

/// Compare reconstructed plaintext with the checksum recorded at backup time.
pub fn verify_plaintext(record: &VolumeRecord, plaintext: &[u8]) -> Result<()> {
    let actual = Checksum::compute(plaintext);
    if actual != record.checksum || plaintext.len() as u64 != record.size {
        return Err(corruption(&record.key, &record.checksum, &actual));
    }
    Ok(())
}

fn corruption(key: &str, expected: &Checksum, actual: &Checksum) -> SnapvaultError {
    SnapvaultError::Corruption {
        key: key.to_string(),
        expected: expected.to_hex(),
        actual: actual.to_hex(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use snapvault_crypto::Identity;

    fn raw(data: &[u8]) -> RawVolume {
        RawVolume {
            index: 1,
            data: data.to_vec(),
            checksum: Checksum::compute(data),
        }
    }

    #[test]
    fn plain_volume_decodes() {
        let keys = KeyMaterial::default();
        let encoded =
            encode_volume(raw(b"zfs stream bytes"), "k".into(), Compression::Lz4, &keys).unwrap();
        assert!(!encoded.record.encrypted && !encoded.record.signed);
        let plain = decode_volume(&encoded.record, &encoded.payload, &keys).unwrap();
        assert_eq!(plain, b"zfs stream bytes");
    }

    #[test]
    fn encrypted_and_signed_volume_decodes() {
        let id = Identity::generate("ops@example.com");
        let keys = KeyMaterial::for_identity(&id, true, true);
        let data = vec![7u8; 10_000];
        let encoded = encode_volume(
            raw(&data),
            "k".into(),
            Compression::Zstd { level: 3 },
            &keys,
        )
        .unwrap();
        assert!(encoded.record.encrypted && encoded.record.signed);
        assert!(!encoded.payload.windows(64).any(|w| w == &data[..64]));
        assert_eq!(decode_volume(&encoded.record, &encoded.payload, &keys).unwrap(), data);
    }

    #[test]
    fn flipped_stored_byte_is_corruption() {
        let keys = KeyMaterial::default();
        let encoded = encode_volume(raw(b"abcdef"), "k".into(), Compression::None, &keys).unwrap();
        let mut payload = encoded.payload.clone();
        let last = payload.len() - 1;
        payload[last] ^= 0x01;
        let err = decode_volume(&encoded.record, &payload, &keys).unwrap_err();
        assert!(matches!(err, SnapvaultError::Corruption { ref key, .. } if key == "k"));
    }

    #[test]
    fn plaintext_mismatch_is_corruption() {
        let keys = KeyMaterial::default();
        let encoded = encode_volume(raw(b"abcdef"), "k".into(), Compression::None, &keys).unwrap();
        let mut record = encoded.record.clone();
        record.checksum = Checksum::compute(b"abcdeg");
        let err = decode_volume(&record, &encoded.payload, &keys).unwrap_err();
        assert!(matches!(err, SnapvaultError::Corruption { .. }));
    }

    #[test]
    fn stripped_encryption_is_rejected() {
        let id = Identity::generate("ops@example.com");
        let keys = KeyMaterial::for_identity(&id, false, false);
        let encoded = encode_volume(raw(b"abc"), "k".into(), Compression::None, &keys).unwrap();
        let mut record = encoded.record.clone();
        record.encrypted = true;
        let err = decode_volume(&record, &encoded.payload, &keys).unwrap_err();
        assert!(matches!(err, SnapvaultError::Integrity(_)));
    }
}
