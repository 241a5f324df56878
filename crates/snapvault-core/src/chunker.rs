use std::io::{ErrorKind, Read};

use snapvault_types::{Checksum, Result, SnapvaultError};

/// One plaintext slice of the snapshot stream.
#[derive(Debug, Clone)]
pub struct RawVolume {
    /// 1-based position in the stream.
    pub index: u32,
    pub data: Vec<u8>,
    pub checksum: Checksum,
}

/// Splits a byte stream into volumes of at most `volume_size` bytes.
///
/// Every volume except the last is exactly `volume_size` bytes. An empty
/// stream yields no volumes.
pub struct Chunker<R> {
    reader: R,
    volume_size: usize,
    next_index: u32,
    exhausted: bool,
}

impl<R: Read> Chunker<R> {
    pub fn new(reader: R, volume_size: u64) -> Result<Self> {
        if volume_size == 0 {
            return Err(SnapvaultError::InvalidInput(
                "volume size must be greater than zero".into(),
            ));
        }
        let volume_size = usize::try_from(volume_size).map_err(|_| {
            SnapvaultError::InvalidInput(format!("volume size {volume_size} is too large"))
        })?;
        Ok(Self {
            reader,
            volume_size,
            next_index: 1,
            exhausted: false,
        })
    }

    /// Read the next volume, or `None` at end of stream.
    pub fn next_volume(&mut self) -> Result<Option<RawVolume>> {
        if self.exhausted {
            return Ok(None);
        }

        let mut data = vec![0u8; self.volume_size];
        let mut filled = 0;
        while filled < data.len() {
            match self.reader.read(&mut data[filled..]) {
                Ok(0) => {
                    self.exhausted = true;
                    break;
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        if filled == 0 {
            return Ok(None);
        }
        data.truncate(filled);

        let index = self.next_index;
        self.next_index += 1;
        let checksum = Checksum::compute(&data);
        Ok(Some(RawVolume {
            index,
            data,
            checksum,
        }))
    }

    /// Number of volumes produced so far.
    pub fn produced(&self) -> u32 {
        self.next_index - 1
    }
}

impl<R: Read> Iterator for Chunker<R> {
    type Item = Result<RawVolume>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_volume().transpose()
    }
}
