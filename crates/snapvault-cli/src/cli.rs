use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "snapvault",
    version,
    about = "Off-site backups of ZFS snapshots to object storage",
    after_help = "\
Destinations are comma-separated URIs:
  file:///absolute/path
  s3://bucket[/prefix]
  mem://name                     (process-local, for testing)

Environment variables:
  SNAPVAULT_PASSPHRASE   Keyring passphrase (skips interactive prompt)
  AWS_REGION, AWS_S3_CUSTOM_ENDPOINT, AWS_ACCESS_KEY_ID, AWS_SECRET_ACCESS_KEY"
)]
pub(crate) struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    pub config: Option<String>,

    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Log level (error, warn, info, debug, trace); overrides -v
    #[arg(long)]
    pub log_level: Option<String>,

    /// Working directory for temporary volume files
    #[arg(long, global = true)]
    pub working_directory: Option<String>,

    /// Path to the zfs executable
    #[arg(long, global = true)]
    pub zfs_path: Option<String>,

    /// Path to the keyring file
    #[arg(long, global = true)]
    pub keyring: Option<String>,

    /// Print the result as JSON on stdout (on success only)
    #[arg(long, global = true)]
    pub json_output: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Back up a snapshot to one or more destinations
    Send(SendArgs),

    /// Restore a snapshot from the first destination that has it
    Receive(ReceiveArgs),

    /// List the backups stored at a destination
    List(ListArgs),

    /// Create a new keyring identity, or import someone's public keys
    Keygen(KeygenArgs),
}

impl Commands {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Commands::Send(_) => "send",
            Commands::Receive(_) => "receive",
            Commands::List(_) => "list",
            Commands::Keygen(_) => "keygen",
        }
    }
}

/// Settings shared by every command that touches a destination.
#[derive(Args)]
pub(crate) struct LayoutFlags {
    /// Prefix for manifest objects
    #[arg(long)]
    pub manifest_prefix: Option<String>,

    /// Character joining object key components
    #[arg(long)]
    pub separator: Option<String>,

    /// Give up on a failing operation after this long (e.g. 30m, 12h; 0 = never)
    #[arg(long)]
    pub max_retry_time: Option<String>,

    /// Longest sleep between retries (e.g. 30s, 30m)
    #[arg(long)]
    pub max_backoff_time: Option<String>,
}

#[derive(Args)]
pub(crate) struct SendArgs {
    /// Snapshot to send as <volume>@<snapshot>; with --increment or
    /// --full-if-older-than a bare <volume> sends its newest snapshot
    pub snapshot: String,

    /// Destination URIs, comma-separated
    pub destinations: String,

    /// Send incrementally from this snapshot
    #[arg(short = 'i', long)]
    pub incremental: Option<String>,

    /// Send incrementally from the newest snapshot already backed up
    #[arg(long)]
    pub increment: bool,

    /// Send a full backup when the newest full one is older than this (e.g. 7d)
    #[arg(long)]
    pub full_if_older_than: Option<String>,

    /// Encrypt to these keyring identities (repeatable)
    #[arg(long)]
    pub encrypt_to: Vec<String>,

    /// Sign with this keyring identity
    #[arg(long)]
    pub sign_from: Option<String>,

    /// Volume size in MiB
    #[arg(long)]
    pub volume_size: Option<u64>,

    /// Volume files kept on local disk at once; 0 streams straight to a
    /// single destination without local verification
    #[arg(long)]
    pub max_file_buffer: Option<usize>,

    /// Aggregate upload limit in KiB/s (0 = unlimited)
    #[arg(long)]
    pub max_upload_speed: Option<u64>,

    /// Compression algorithm (lz4, zstd, none)
    #[arg(long)]
    pub compression: Option<String>,

    /// zstd compression level
    #[arg(long)]
    pub compression_level: Option<i32>,

    /// Concurrent volume uploads
    #[arg(long, value_parser = clap::value_parser!(u16).range(1..=64))]
    pub upload_concurrency: Option<u16>,

    #[command(flatten)]
    pub layout: LayoutFlags,
}

#[derive(Args)]
pub(crate) struct ReceiveArgs {
    /// Snapshot to restore as <volume>@<snapshot>; with --auto a bare
    /// <volume> restores its newest backup
    pub snapshot: String,

    /// Destination URIs to read from, comma-separated, in preference order
    pub destinations: String,

    /// Local ZFS target to receive into
    pub local_volume: String,

    /// Restore every missing link of the chain up to the snapshot
    #[arg(long)]
    pub auto: bool,

    /// The snapshot to restore is an incremental from this one, which the
    /// target already has
    #[arg(short = 'i', long)]
    pub incremental: Option<String>,

    /// zfs receive -d
    #[arg(short = 'd', long)]
    pub full_path: bool,

    /// zfs receive -e
    #[arg(short = 'e', long)]
    pub last_path: bool,

    /// zfs receive -F
    #[arg(short = 'F', long)]
    pub force: bool,

    /// zfs receive -u
    #[arg(short = 'u', long)]
    pub unmounted: bool,

    /// zfs receive -o origin=<snapshot>
    #[arg(short = 'o', long)]
    pub origin: Option<String>,

    /// Decrypt with these keyring identities (repeatable)
    #[arg(long)]
    pub encrypt_to: Vec<String>,

    /// Require signatures from this keyring identity
    #[arg(long)]
    pub sign_from: Option<String>,

    /// Downloaded volume files kept on local disk at once
    #[arg(long)]
    pub max_file_buffer: Option<usize>,

    /// Concurrent volume downloads
    #[arg(long, value_parser = clap::value_parser!(u16).range(1..=64))]
    pub download_concurrency: Option<u16>,

    #[command(flatten)]
    pub layout: LayoutFlags,
}

#[derive(Args)]
pub(crate) struct ListArgs {
    /// Destination URI
    pub destination: String,

    /// Only list backups of this volume
    #[arg(long)]
    pub volume_name: Option<String>,

    /// Only list jobs started before this time (RFC 3339)
    #[arg(long)]
    pub before: Option<String>,

    /// Only list jobs started after this time (RFC 3339)
    #[arg(long)]
    pub after: Option<String>,

    #[command(flatten)]
    pub layout: LayoutFlags,
}

#[derive(Args)]
pub(crate) struct KeygenArgs {
    /// Identity name, usually an email address
    pub id: String,

    /// Import a public encryption key (hex) instead of generating one
    #[arg(long, requires = "import_signing")]
    pub import_encryption: Option<String>,

    /// Import a public signing key (hex) instead of generating one
    #[arg(long, requires = "import_encryption")]
    pub import_signing: Option<String>,
}
