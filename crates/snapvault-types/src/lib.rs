pub mod cancel;
pub mod checksum;
pub mod error;
pub mod snapshot;

pub use cancel::CancelToken;
pub use checksum::{Checksum, ChecksumHasher};
pub use error::{ErrorClass, Result, SnapvaultError};
pub use snapshot::{JobId, SnapshotInfo};
