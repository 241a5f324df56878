use std::io::Read;

use serde::{Deserialize, Serialize};

use snapvault_types::{Result, SnapvaultError};

const TAG_NONE: u8 = 0x00;
const TAG_LZ4: u8 = 0x01;
const TAG_ZSTD: u8 = 0x02;

/// Codec applied to each volume before encryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Compression {
    None,
    #[default]
    Lz4,
    Zstd {
        level: i32,
    },
}

impl Compression {
    /// Parse from config string like "lz4", "zstd", "none".
    pub fn from_config(algorithm: &str, zstd_level: i32) -> Result<Self> {
        match algorithm {
            "none" => Ok(Compression::None),
            "lz4" => Ok(Compression::Lz4),
            "zstd" => Ok(Compression::Zstd { level: zstd_level }),
            other => Err(SnapvaultError::Config(format!(
                "unknown compression algorithm: {other}"
            ))),
        }
    }

    /// Name recorded in manifests and envelope headers.
    pub fn label(&self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Lz4 => "lz4",
            Compression::Zstd { .. } => "zstd",
        }
    }
}

/// Compress data and prepend a 1-byte tag identifying the codec.
pub fn compress(compression: Compression, data: &[u8]) -> Result<Vec<u8>> {
    match compression {
        Compression::None => {
            let mut out = Vec::with_capacity(1 + data.len());
            out.push(TAG_NONE);
            out.extend_from_slice(data);
            Ok(out)
        }
        Compression::Lz4 => {
            let compressed = lz4_flex::compress_prepend_size(data);
            let mut out = Vec::with_capacity(1 + compressed.len());
            out.push(TAG_LZ4);
            out.extend_from_slice(&compressed);
            Ok(out)
        }
        Compression::Zstd { level } => {
            use std::cell::RefCell;
            thread_local! {
                static ZSTD_CX: RefCell<Option<(i32, zstd::bulk::Compressor<'static>)>> =
                    const { RefCell::new(None) };
            }

            ZSTD_CX.with(|cell| {
                let mut slot = cell.borrow_mut();
                // Lazily init or reinit if the compression level changed.
                if !matches!(slot.as_ref(), Some((l, _)) if *l == level) {
                    let cx = zstd::bulk::Compressor::new(level)
                        .map_err(|e| SnapvaultError::Other(format!("zstd init: {e}")))?;
                    *slot = Some((level, cx));
                }
                let Some((_, cx)) = slot.as_mut() else {
                    return Err(SnapvaultError::Other("zstd compressor unavailable".into()));
                };

                let compressed = cx
                    .compress(data)
                    .map_err(|e| SnapvaultError::Other(format!("zstd compress: {e}")))?;
                let mut out = Vec::with_capacity(1 + compressed.len());
                out.push(TAG_ZSTD);
                out.extend_from_slice(&compressed);
                Ok(out)
            })
        }
    }
}

/// Decompress tagged data, refusing to produce more than `max_size` bytes.
///
/// Restore passes the plaintext size recorded in the manifest, so a crafted
/// volume cannot inflate past what the manifest promised.
pub fn decompress(data: &[u8], max_size: u64) -> Result<Vec<u8>> {
    let Some((&tag, payload)) = data.split_first() else {
        return Err(SnapvaultError::Decompression("empty data".into()));
    };
    let out = match tag {
        TAG_NONE => payload.to_vec(),
        TAG_LZ4 => {
            let Some(prefix) = payload.get(..4) else {
                return Err(SnapvaultError::Decompression("lz4: payload too short".into()));
            };
            let uncompressed_size =
                u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as u64;
            if uncompressed_size > max_size {
                return Err(SnapvaultError::Decompression(format!(
                    "lz4: decompressed size ({uncompressed_size}) exceeds limit of {max_size} bytes"
                )));
            }
            lz4_flex::decompress_size_prepended(payload)
                .map_err(|e| SnapvaultError::Decompression(format!("lz4: {e}")))?
        }
        TAG_ZSTD => {
            let mut decoder = zstd::stream::Decoder::new(std::io::Cursor::new(payload))
                .map_err(|e| SnapvaultError::Decompression(format!("zstd init: {e}")))?;
            let mut output = Vec::with_capacity(max_size.min(64 * 1024 * 1024) as usize);
            decoder
                .by_ref()
                .take(max_size.saturating_add(1))
                .read_to_end(&mut output)
                .map_err(|e| SnapvaultError::Decompression(format!("zstd: {e}")))?;
            output
        }
        other => {
            return Err(SnapvaultError::Decompression(format!(
                "unknown compression tag {other:#04x}"
            )));
        }
    };
    if out.len() as u64 > max_size {
        return Err(SnapvaultError::Decompression(format!(
            "decompressed size exceeds limit of {max_size} bytes"
        )));
    }
    Ok(out)
}
