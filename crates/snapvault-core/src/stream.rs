//! Adapters for the external snapshot-stream producer and consumer.
//!
//! The engine never looks inside the stream; it only needs something to
//! read from while backing up and something to write to while restoring.
//! For ZFS that is a `zfs send` or `zfs receive` child process.

use std::io::{self, Read, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

use chrono::{DateTime, Utc};
use tracing::debug;

use snapvault_types::{Result, SnapshotInfo, SnapvaultError};

/// Destination of a restored stream.
pub trait StreamSink: Write {
    /// Flush, close and wait for the consumer to accept the stream.
    fn finish(self: Box<Self>) -> Result<()>;
}

/// Any writer can act as a sink when nothing needs to be awaited.
pub struct WriterSink<W>(pub W);

impl<W: Write> Write for WriterSink<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl<W: Write> StreamSink for WriterSink<W> {
    fn finish(mut self: Box<Self>) -> Result<()> {
        self.0.flush()?;
        Ok(())
    }
}

/// Flags passed through to `zfs receive`.
#[derive(Debug, Clone, Default)]
pub struct ReceiveOptions {
    /// `-F`: roll back the target to its most recent snapshot first.
    pub force: bool,
    /// `-u`: do not mount the received file system.
    pub unmounted: bool,
    /// `-d`: keep all but the pool name of the sent path.
    pub full_path: bool,
    /// `-e`: keep only the last element of the sent path.
    pub last_path: bool,
    /// `-o origin=<snapshot>`: receive as a clone of this snapshot.
    pub origin: Option<String>,
}

/// Builds the `zfs` invocations used as stream source and sink.
#[derive(Debug, Clone)]
pub struct SnapshotCommands {
    zfs_path: String,
}

impl SnapshotCommands {
    pub fn new(zfs_path: impl Into<String>) -> Self {
        Self {
            zfs_path: zfs_path.into(),
        }
    }

    pub fn send_command(&self, volume: &str, snapshot: &str, from: Option<&str>) -> Command {
        let mut cmd = Command::new(&self.zfs_path);
        cmd.arg("send");
        if let Some(from) = from {
            cmd.arg("-i").arg(format!("{volume}@{from}"));
        }
        cmd.arg(format!("{volume}@{snapshot}"));
        cmd
    }

    pub fn receive_command(&self, target: &str, options: &ReceiveOptions) -> Result<Command> {
        if options.full_path && options.last_path {
            return Err(SnapvaultError::InvalidInput(
                "-d and -e cannot be used together".into(),
            ));
        }
        let mut cmd = Command::new(&self.zfs_path);
        cmd.arg("receive");
        if options.force {
            cmd.arg("-F");
        }
        if options.unmounted {
            cmd.arg("-u");
        }
        if options.full_path {
            cmd.arg("-d");
        }
        if options.last_path {
            cmd.arg("-e");
        }
        if let Some(origin) = &options.origin {
            cmd.arg("-o").arg(format!("origin={origin}"));
        }
        cmd.arg(target);
        Ok(cmd)
    }

    /// Start `zfs send` and return its stdout as the backup source.
    pub fn spawn_send(&self, volume: &str, snapshot: &str, from: Option<&str>) -> Result<ChildStream> {
        let cmd = self.send_command(volume, snapshot, from);
        ChildStream::spawn_reader(cmd, format!("zfs send {volume}@{snapshot}"))
    }

    /// Start `zfs receive` and return its stdin as the restore sink.
    pub fn spawn_receive(&self, target: &str, options: &ReceiveOptions) -> Result<ChildStream> {
        let cmd = self.receive_command(target, options)?;
        ChildStream::spawn_writer(cmd, format!("zfs receive {target}"))
    }

    /// Creation time of `volume@snapshot`.
    pub fn creation_time(&self, volume: &str, snapshot: &str) -> Result<DateTime<Utc>> {
        let output = self.run(&[
            "get",
            "-Hp",
            "-o",
            "value",
            "creation",
            &format!("{volume}@{snapshot}"),
        ])?;
        parse_creation(output.trim())
    }

    /// Snapshots of `volume`, oldest first.
    pub fn list_snapshots(&self, volume: &str) -> Result<Vec<SnapshotInfo>> {
        let output = self.run(&[
            "list", "-H", "-p", "-t", "snapshot", "-o", "name,creation", "-s", "creation", "-d",
            "1", volume,
        ])?;
        parse_snapshot_list(volume, &output)
    }

    fn run(&self, args: &[&str]) -> Result<String> {
        debug!("running {} {}", self.zfs_path, args.join(" "));
        let output = Command::new(&self.zfs_path)
            .args(args)
            .stderr(Stdio::piped())
            .output()
            .map_err(|e| SnapvaultError::fatal(self.zfs_path.clone(), e))?;
        if !output.status.success() {
            return Err(SnapvaultError::fatal(
                format!("{} {}", self.zfs_path, args.join(" ")),
                String::from_utf8_lossy(&output.stderr).trim(),
            ));
        }
        String::from_utf8(output.stdout)
            .map_err(|e| SnapvaultError::Other(format!("zfs output is not UTF-8: {e}")))
    }
}

fn parse_creation(raw: &str) -> Result<DateTime<Utc>> {
    let secs: i64 = raw
        .parse()
        .map_err(|_| SnapvaultError::Other(format!("unexpected creation time '{raw}'")))?;
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| SnapvaultError::Other(format!("creation time out of range: {secs}")))
}

fn parse_snapshot_list(volume: &str, output: &str) -> Result<Vec<SnapshotInfo>> {
    let prefix = format!("{volume}@");
    let mut snapshots = Vec::new();
    for line in output.lines().filter(|l| !l.trim().is_empty()) {
        let (name, creation) = line
            .split_once('\t')
            .ok_or_else(|| SnapvaultError::Other(format!("unexpected zfs list line '{line}'")))?;
        let Some(short) = name.strip_prefix(&prefix) else {
            continue;
        };
        snapshots.push(SnapshotInfo::with_creation_time(
            short,
            parse_creation(creation.trim())?,
        ));
    }
    Ok(snapshots)
}

/// A spawned child used as a byte source (its stdout) or sink (its stdin).
///
/// [`finish`](ChildStream::finish) waits for the child and turns a non-zero
/// exit into an error. A stream dropped without finishing kills the child.
pub struct ChildStream {
    label: String,
    child: Option<Child>,
    stdout: Option<ChildStdout>,
    stdin: Option<ChildStdin>,
}

impl ChildStream {
    pub fn spawn_reader(mut cmd: Command, label: String) -> Result<Self> {
        let mut child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .spawn()
            .map_err(|e| SnapvaultError::fatal(label.clone(), format!("cannot start: {e}")))?;
        let stdout = child.stdout.take();
        Ok(Self {
            label,
            child: Some(child),
            stdout,
            stdin: None,
        })
    }

    pub fn spawn_writer(mut cmd: Command, label: String) -> Result<Self> {
        let mut child = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .spawn()
            .map_err(|e| SnapvaultError::fatal(label.clone(), format!("cannot start: {e}")))?;
        let stdin = child.stdin.take();
        Ok(Self {
            label,
            child: Some(child),
            stdout: None,
            stdin,
        })
    }

    /// Close our end of the pipe and wait for the child to exit cleanly.
    pub fn wait(mut self) -> Result<()> {
        self.stdin.take();
        self.stdout.take();
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        let status = child
            .wait()
            .map_err(|e| SnapvaultError::fatal(self.label.clone(), e))?;
        if !status.success() {
            return Err(SnapvaultError::fatal(
                self.label.clone(),
                format!("exited with {status}"),
            ));
        }
        Ok(())
    }
}

impl Read for ChildStream {
    /// At end of stream the child is reaped, so a producer that dies early
    /// surfaces as a read error instead of a silently short stream.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let Some(stdout) = self.stdout.as_mut() else {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "stream is not readable",
            ));
        };
        let n = stdout.read(buf)?;
        if n == 0 && !buf.is_empty() {
            if let Some(mut child) = self.child.take() {
                let status = child.wait()?;
                if !status.success() {
                    return Err(io::Error::new(
                        io::ErrorKind::Other,
                        format!("{} exited with {status}", self.label),
                    ));
                }
            }
        }
        Ok(n)
    }
}

impl Write for ChildStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.stdin.as_mut() {
            Some(stdin) => stdin.write(buf),
            None => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "stream is not writable",
            )),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.stdin.as_mut() {
            Some(stdin) => stdin.flush(),
            None => Ok(()),
        }
    }
}

impl StreamSink for ChildStream {
    fn finish(self: Box<Self>) -> Result<()> {
        (*self).wait()
    }
}

impl Drop for ChildStream {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}
