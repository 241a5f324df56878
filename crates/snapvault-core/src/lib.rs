pub mod backup;
mod buffer;
pub mod chain;
pub mod chunker;
pub mod compress;
pub mod config;
pub mod context;
pub mod job;
pub mod manifest;
pub mod platform;
pub mod restore;
pub mod stream;
pub mod volume;

pub use backup::{run_backup, BackupReport};
pub use context::{DestinationHandle, EngineContext};
pub use job::{JobInfo, RestoreJob};
pub use restore::{restore_manifest, run_restore, RestoreReport};

#[cfg(test)]
mod testutil;
