//! End-to-end send and receive through the public API against `file://`
//! destinations.

use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use snapvault_core::chain::list_manifests;
use snapvault_core::config::SnapvaultConfig;
use snapvault_core::manifest::Manifest;
use snapvault_core::stream::StreamSink;
use snapvault_core::{run_backup, run_restore, EngineContext, JobInfo, RestoreJob};
use snapvault_crypto::{Identity, KeyMaterial};
use snapvault_types::{Result, SnapshotInfo};

#[derive(Clone, Default)]
struct Collected(Arc<Mutex<Vec<Vec<u8>>>>);

struct CollectSink {
    buf: Vec<u8>,
    into: Collected,
}

impl Write for CollectSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl StreamSink for CollectSink {
    fn finish(self: Box<Self>) -> Result<()> {
        self.into.0.lock().unwrap().push(self.buf);
        Ok(())
    }
}

fn payload(len: usize, seed: u64) -> Vec<u8> {
    let mut state = seed.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
    (0..len)
        .map(|_| {
            state = state
                .wrapping_mul(6_364_136_223_846_793_005)
                .wrapping_add(1_442_695_040_888_963_407);
            (state >> 33) as u8
        })
        .collect()
}

fn config(workdir: &std::path::Path) -> SnapvaultConfig {
    let yaml = format!(
        "working_directory: {}\nvolume_size_mib: 1\nmax_file_buffer: 2\ncompression:\n  algorithm: zstd\nretry:\n  base_delay_ms: 1\n  max_backoff: 1s\n  max_retry_time: 5s\n",
        workdir.display()
    );
    let config = SnapvaultConfig::from_yaml(&yaml).unwrap();
    config.validate().unwrap();
    config
}

#[test]
fn full_and_incremental_round_trip_over_file_destinations() {
    let work = tempfile::tempdir().unwrap();
    let site_a = tempfile::tempdir().unwrap();
    let site_b = tempfile::tempdir().unwrap();
    let config = config(work.path());
    let ctx = EngineContext::from_config(&config).unwrap();
    let uris = vec![
        format!("file://{}", site_a.path().display()),
        format!("file://{}", site_b.path().display()),
    ];
    let dests = ctx.open_destinations(&uris).unwrap();
    let owner = Identity::generate("ops@example.com");
    let keys = KeyMaterial::for_identity(&owner, true, true);

    let full = payload(2 * 1024 * 1024 + 12_345, 1);
    let job = JobInfo::from_config(&config, "pool/data", SnapshotInfo::new("monday"), uris.clone())
        .unwrap();
    let report = run_backup(&ctx, &job, &dests, &keys, &mut &full[..]).unwrap();
    assert_eq!(report.manifest.volumes.len(), 3);

    let incr = payload(70_000, 2);
    let mut job = JobInfo::from_config(&config, "pool/data", SnapshotInfo::new("tuesday"), uris.clone())
        .unwrap();
    job.incremental_snapshot = Some(SnapshotInfo::new("monday"));
    run_backup(&ctx, &job, &dests, &keys, &mut &incr[..]).unwrap();

    for dest in &dests {
        let listed =
            list_manifests(dest, &job.layout, Some("pool/data"), &job.retry, &ctx.cancel).unwrap();
        assert_eq!(listed.len(), 2, "{}", dest.uri);
    }

    // Lose the first site entirely; the second still has everything.
    let survivors = ctx.open_destinations(&uris[1..]).unwrap();
    std::fs::remove_dir_all(site_a.path()).unwrap();

    let rjob =
        RestoreJob::from_config(&config, "pool/data", Some("tuesday".into()), uris[1..].to_vec())
            .unwrap();
    let collected = Collected::default();
    let report = run_restore(&ctx, &rjob, &survivors, &keys, &mut |_m: &Manifest| {
        Ok(Box::new(CollectSink {
            buf: Vec::new(),
            into: collected.clone(),
        }) as Box<dyn StreamSink>)
    })
    .unwrap();

    assert_eq!(report.replayed.len(), 2);
    let streams = collected.0.lock().unwrap();
    assert_eq!(streams.len(), 2);
    assert_eq!(streams[0], full);
    assert_eq!(streams[1], incr);
}
