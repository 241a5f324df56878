use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

type Blake2b256 = Blake2b<U32>;

/// BLAKE2b-256 content checksum, rendered as lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Checksum(pub [u8; 32]);

impl Checksum {
    /// Checksum of a complete buffer.
    pub fn compute(data: &[u8]) -> Self {
        let mut hasher = ChecksumHasher::new();
        hasher.update(data);
        hasher.finalize()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(hex_str: &str) -> std::result::Result<Self, String> {
        let bytes = hex::decode(hex_str).map_err(|e| format!("invalid hex: {e}"))?;
        if bytes.len() != 32 {
            return Err(format!("expected 32 bytes, got {}", bytes.len()));
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Checksum(arr))
    }
}

/// Incremental checksum over data arriving in pieces.
pub struct ChecksumHasher {
    inner: Blake2b256,
}

impl ChecksumHasher {
    pub fn new() -> Self {
        Self {
            inner: Blake2b256::new(),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        Digest::update(&mut self.inner, data);
    }

    pub fn finalize(self) -> Checksum {
        let mut out = [0u8; 32];
        out.copy_from_slice(&self.inner.finalize());
        Checksum(out)
    }
}

impl Default for ChecksumHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Checksum({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for Checksum {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Checksum {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Checksum::from_hex(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incremental_matches_one_shot() {
        let data = b"the quick brown fox jumps over the lazy dog";
        let mut hasher = ChecksumHasher::new();
        for piece in data.chunks(7) {
            hasher.update(piece);
        }
        assert_eq!(hasher.finalize(), Checksum::compute(data));
    }

    #[test]
    fn hex_roundtrip_and_rejects_short_input() {
        let sum = Checksum::compute(b"volume");
        assert_eq!(Checksum::from_hex(&sum.to_hex()).unwrap(), sum);
        assert!(Checksum::from_hex("abcd").is_err());
        assert!(Checksum::from_hex("zz").is_err());
    }

    #[test]
    fn serializes_as_hex_string() {
        let sum = Checksum::compute(b"");
        let json = serde_json::to_string(&sum).unwrap();
        assert_eq!(json, format!("\"{}\"", sum.to_hex()));
    }
}
