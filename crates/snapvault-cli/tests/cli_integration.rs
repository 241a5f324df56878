#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use tempfile::TempDir;

/// Stands in for `zfs`: `send` replays prepared stream files, `receive`
/// records each incoming stream, `get` reports a fixed creation time.
const FAKE_ZFS: &str = r#"#!/bin/sh
set -e
cmd="$1"; shift
case "$cmd" in
  send)
    if [ "$1" = "-i" ]; then shift 2; fi
    cat "$FAKE_ZFS_DIR/stream-$(echo "$1" | tr '/@' '--')"
    ;;
  receive)
    n=$(ls "$FAKE_ZFS_DIR" | grep -c '^received-' || true)
    cat > "$FAKE_ZFS_DIR/received-$n"
    ;;
  get)
    echo 1700000000
    ;;
  list)
    ;;
  *)
    exit 2
    ;;
esac
"#;

struct CliFixture {
    _tmp: TempDir,
    home_dir: PathBuf,
    work_dir: PathBuf,
    zfs_dir: PathBuf,
    zfs_path: PathBuf,
    keyring: PathBuf,
    dest_uri: String,
}

impl CliFixture {
    fn new() -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let home_dir = tmp.path().join("home");
        let work_dir = tmp.path().join("work");
        let zfs_dir = tmp.path().join("zfs");
        let dest_dir = tmp.path().join("offsite");
        for dir in [&home_dir, &work_dir, &zfs_dir, &dest_dir] {
            std::fs::create_dir_all(dir).unwrap();
        }

        let zfs_path = tmp.path().join("fake-zfs");
        std::fs::write(&zfs_path, FAKE_ZFS).unwrap();
        std::fs::set_permissions(&zfs_path, std::fs::Permissions::from_mode(0o755)).unwrap();

        Self {
            keyring: tmp.path().join("keyring.json"),
            dest_uri: format!("file://{}", dest_dir.display()),
            _tmp: tmp,
            home_dir,
            work_dir,
            zfs_dir,
            zfs_path,
        }
    }

    fn stream(&self, name: &str, data: &[u8]) {
        std::fs::write(self.zfs_dir.join(format!("stream-{name}")), data).unwrap();
    }

    fn received(&self, n: usize) -> Vec<u8> {
        std::fs::read(self.zfs_dir.join(format!("received-{n}"))).unwrap()
    }

    fn run(&self, args: &[&str]) -> Output {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_snapvault"));
        cmd.arg("--working-directory")
            .arg(&self.work_dir)
            .arg("--zfs-path")
            .arg(&self.zfs_path)
            .arg("--keyring")
            .arg(&self.keyring)
            .args(args);
        cmd.env("HOME", &self.home_dir);
        cmd.env("FAKE_ZFS_DIR", &self.zfs_dir);
        cmd.env("SNAPVAULT_PASSPHRASE", "correct horse");
        cmd.env("NO_COLOR", "1");
        cmd.output().unwrap()
    }

    fn run_ok(&self, args: &[&str]) -> String {
        let output = self.run(args);
        if !output.status.success() {
            panic!(
                "command failed: {:?}\nstdout:\n{}\nstderr:\n{}",
                args,
                String::from_utf8_lossy(&output.stdout),
                String::from_utf8_lossy(&output.stderr)
            );
        }
        String::from_utf8_lossy(&output.stdout).to_string()
    }
}

fn stream_bytes(len: usize, seed: u32) -> Vec<u8> {
    (0..len as u32)
        .map(|i| (i.wrapping_mul(2_654_435_761) >> 7) as u8 ^ seed as u8)
        .collect()
}

fn json(out: &str) -> serde_json::Value {
    serde_json::from_str(out).unwrap_or_else(|e| panic!("bad JSON ({e}):\n{out}"))
}

#[test]
fn send_list_receive_roundtrip() {
    let fx = CliFixture::new();
    let full = stream_bytes(1536 * 1024, 1);
    let incr = stream_bytes(40_000, 2);
    fx.stream("tank-data-a", &full);
    fx.stream("tank-data-b", &incr);

    let sent = json(&fx.run_ok(&[
        "--json-output",
        "send",
        "tank/data@a",
        &fx.dest_uri,
        "--volume-size",
        "1",
    ]));
    assert_eq!(sent["volumes"], 2);
    assert_eq!(sent["total_bytes"], full.len() as u64);

    fx.run_ok(&["send", "tank/data@b", &fx.dest_uri, "-i", "tank/data@a"]);

    let listed = json(&fx.run_ok(&["--json-output", "list", &fx.dest_uri]));
    let listed = listed.as_array().unwrap();
    assert_eq!(listed.len(), 2);
    let incremental = listed
        .iter()
        .find(|entry| entry["snapshot"] == "b")
        .expect("incremental backup listed");
    assert_eq!(incremental["incremental_from"], "a");
    assert_eq!(incremental["volume"], "tank/data");

    let table = fx.run_ok(&["list", &fx.dest_uri, "--volume-name", "tank/data"]);
    assert!(table.contains("tank/data"));
    assert!(table.contains("(full)"));

    let restored = json(&fx.run_ok(&[
        "--json-output",
        "receive",
        "tank/data@b",
        &fx.dest_uri,
        "backup/data",
        "--auto",
    ]));
    assert_eq!(restored["replayed"].as_array().unwrap().len(), 2);
    assert_eq!(fx.received(0), full);
    assert_eq!(fx.received(1), incr);
}

#[test]
fn encrypted_and_signed_roundtrip() {
    let fx = CliFixture::new();
    let data = stream_bytes(70_000, 3);
    fx.stream("tank-a", &data);

    let key = json(&fx.run_ok(&["--json-output", "keygen", "ops@example.com"]));
    assert_eq!(key["imported"], false);

    fx.run_ok(&[
        "send",
        "tank@a",
        &fx.dest_uri,
        "--encrypt-to",
        "ops@example.com",
        "--sign-from",
        "ops@example.com",
    ]);

    // Without the private key the manifests cannot be opened.
    let denied = fx.run(&["receive", "tank@a", &fx.dest_uri, "restore/tank"]);
    assert!(!denied.status.success());

    fx.run_ok(&[
        "receive",
        "tank@a",
        &fx.dest_uri,
        "restore/tank",
        "--encrypt-to",
        "ops@example.com",
        "--sign-from",
        "ops@example.com",
    ]);
    assert_eq!(fx.received(0), data);
}

#[test]
fn invalid_destination_fails_before_any_work() {
    let fx = CliFixture::new();
    fx.stream("tank-a", b"never read");

    let output = fx.run(&["send", "tank@a", &format!("{},ftp://host/x", fx.dest_uri)]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Error:"), "{stderr}");
    assert!(stderr.contains("unsupported destination prefix"), "{stderr}");

    let dest = Path::new(fx.dest_uri.trim_start_matches("file://"));
    assert_eq!(std::fs::read_dir(dest).unwrap().count(), 0);
}

#[test]
fn bypass_mode_rejects_multiple_destinations() {
    let fx = CliFixture::new();
    fx.stream("tank-a", b"data");
    let second = fx._tmp.path().join("second");
    let dests = format!("{},file://{}", fx.dest_uri, second.display());

    let output = fx.run(&["send", "tank@a", &dests, "--max-file-buffer", "0"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("invalid input"), "{stderr}");
}
