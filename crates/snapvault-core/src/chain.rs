//! Snapshot chain resolution.
//!
//! A restore target is reached by replaying a full backup followed by zero or
//! more incrementals. The resolver works on a catalog of manifests read from
//! one destination and returns the replay order, oldest first.
//!
//! Tie-breaks:
//! - several manifests for the same snapshot (re-run jobs): latest
//!   `created_at` wins, then the lexically greatest key;
//! - auto-restore picks the snapshot with the greatest creation time, then
//!   the lexically greatest snapshot name, then the latest `created_at`.

use std::collections::HashSet;

use tracing::{debug, warn};

use snapvault_crypto::KeyMaterial;
use snapvault_storage::{retry_with_backoff, RetryPolicy};
use snapvault_types::{CancelToken, ErrorClass, Result, SnapvaultError};

use crate::context::DestinationHandle;
use crate::manifest::{KeyLayout, Manifest, ManifestName};

/// A manifest together with the key it was read from.
#[derive(Debug, Clone)]
pub struct CatalogEntry {
    pub key: String,
    pub name: ManifestName,
    pub manifest: Manifest,
}

/// List manifest keys at one destination without reading them.
pub fn list_manifests(
    dest: &DestinationHandle,
    layout: &KeyLayout,
    volume: Option<&str>,
    retry: &RetryPolicy,
    cancel: &CancelToken,
) -> Result<Vec<(String, ManifestName)>> {
    let prefix = layout.listing_prefix(volume);
    let op = format!("{} LIST {prefix}", dest.uri);
    let keys = retry_with_backoff(retry, cancel, &op, || dest.backend.list_all(&prefix))?;

    let mut found = Vec::new();
    for key in keys {
        match layout.parse_manifest_key(&key) {
            Some(name) if volume.map_or(true, |v| v == name.volume) => found.push((key, name)),
            Some(_) => {}
            None => debug!(destination = %dest.uri, key = %key, "ignoring foreign object"),
        }
    }
    found.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(found)
}

/// Fetch and open one manifest.
pub fn fetch_manifest(
    dest: &DestinationHandle,
    key: &str,
    keys: &KeyMaterial,
    retry: &RetryPolicy,
    cancel: &CancelToken,
) -> Result<Manifest> {
    let op = format!("{} GET {key}", dest.uri);
    let data = retry_with_backoff(retry, cancel, &op, || dest.backend.get_bytes(key))?;
    Manifest::from_bytes(&data, keys).map_err(|e| match e {
        SnapvaultError::Integrity(msg) => {
            SnapvaultError::Integrity(format!("manifest '{key}' at {}: {msg}", dest.uri))
        }
        SnapvaultError::InvalidInput(msg) => {
            SnapvaultError::InvalidInput(format!("manifest '{key}' at {}: {msg}", dest.uri))
        }
        other => other,
    })
}

/// A manifest listed at a destination that could not be opened with the
/// keys at hand.
#[derive(Debug)]
pub struct UnreadableManifest {
    pub key: String,
    pub name: ManifestName,
    pub error: SnapvaultError,
}

/// Every manifest of one volume at one destination. Manifests that fail to
/// open are kept aside so they only matter if a chain actually needs them.
#[derive(Debug, Default)]
pub struct Catalog {
    pub entries: Vec<CatalogEntry>,
    pub unreadable: Vec<UnreadableManifest>,
}

impl Catalog {
    /// Resolve `request` against the readable manifests. When the chain
    /// breaks at a snapshot whose only manifests are unreadable, the error
    /// from opening the newest of those is returned instead.
    pub fn resolve(mut self, request: &ChainRequest<'_>) -> Result<Vec<CatalogEntry>> {
        let resolved = resolve_chain(&self.entries, request)
            .map(|chain| chain.into_iter().cloned().collect::<Vec<_>>());
        match resolved {
            Err(SnapvaultError::ChainBroken {
                volume,
                snapshot,
                reason,
            }) => Err(self.take_unreadable(Some(&snapshot)).unwrap_or(
                SnapvaultError::ChainBroken {
                    volume,
                    snapshot,
                    reason,
                },
            )),
            Err(SnapvaultError::NotFound(msg)) if self.entries.is_empty() => {
                Err(self.take_unreadable(None).unwrap_or(SnapvaultError::NotFound(msg)))
            }
            other => other,
        }
    }

    fn take_unreadable(&mut self, snapshot: Option<&str>) -> Option<SnapvaultError> {
        let pos = self
            .unreadable
            .iter()
            .enumerate()
            .filter(|(_, u)| snapshot.map_or(true, |s| u.name.snapshot == s))
            .max_by(|(_, a), (_, b)| {
                a.name
                    .job_id
                    .started_at()
                    .cmp(&b.name.job_id.started_at())
                    .then_with(|| a.key.cmp(&b.key))
            })
            .map(|(i, _)| i)?;
        Some(self.unreadable.swap_remove(pos).error)
    }
}

/// Whether a manifest failed because of its content or our keys rather than
/// the transport.
fn cannot_open(err: &SnapvaultError) -> bool {
    matches!(err.class(), ErrorClass::Integrity | ErrorClass::Input)
}

/// Read every manifest for `volume` at one destination.
///
/// Transport failures abort. A manifest that cannot be opened (bad or
/// missing signature, no matching private key, content that disagrees
/// with its key) is logged and set aside in [`Catalog::unreadable`].
pub fn load_catalog(
    dest: &DestinationHandle,
    layout: &KeyLayout,
    volume: &str,
    keys: &KeyMaterial,
    retry: &RetryPolicy,
    cancel: &CancelToken,
) -> Result<Catalog> {
    let listed = list_manifests(dest, layout, Some(volume), retry, cancel)?;
    let mut catalog = Catalog::default();
    for (key, name) in listed {
        let opened = fetch_manifest(dest, &key, keys, retry, cancel).and_then(|manifest| {
            if manifest.name() != name {
                return Err(SnapvaultError::Integrity(format!(
                    "manifest '{key}' at {} describes {} instead",
                    dest.uri,
                    manifest.name()
                )));
            }
            Ok(manifest)
        });
        match opened {
            Ok(manifest) => catalog.entries.push(CatalogEntry {
                key,
                name,
                manifest,
            }),
            Err(error) if cannot_open(&error) => {
                warn!(destination = %dest.uri, key = %key, "skipping unreadable manifest: {error}");
                catalog.unreadable.push(UnreadableManifest { key, name, error });
            }
            Err(error) => return Err(error),
        }
    }
    Ok(catalog)
}

/// What to resolve.
#[derive(Debug, Clone, Default)]
pub struct ChainRequest<'a> {
    pub volume: &'a str,
    /// Snapshot to restore; `None` picks the most recent one.
    pub target: Option<&'a str>,
    /// Snapshot already present at the sink. The target must be an
    /// incremental from exactly this snapshot.
    pub stop_at: Option<&'a str>,
    /// Snapshots already present at the sink. Resolution stops at the first
    /// link whose base is among them.
    pub present: &'a [String],
}

/// Compute the replay order for `request`, oldest first.
///
/// An empty result means the sink already holds the target.
pub fn resolve_chain<'e>(
    entries: &'e [CatalogEntry],
    request: &ChainRequest<'_>,
) -> Result<Vec<&'e CatalogEntry>> {
    let volume = request.volume;
    let candidates: Vec<&CatalogEntry> = entries
        .iter()
        .filter(|e| e.name.volume == volume)
        .collect();

    let target = match request.target {
        Some(target) => target.to_string(),
        None => latest_snapshot(&candidates)
            .ok_or_else(|| SnapvaultError::NotFound(format!("no backups found for '{volume}'")))?,
    };

    if request.present.iter().any(|p| *p == target) {
        return Ok(Vec::new());
    }

    if let Some(stop_at) = request.stop_at {
        let link = candidates
            .iter()
            .copied()
            .filter(|e| e.name.snapshot == target && e.name.from_snapshot.as_deref() == Some(stop_at))
            .max_by(|a, b| entry_order(a, b))
            .ok_or_else(|| SnapvaultError::ChainBroken {
                volume: volume.to_string(),
                snapshot: target.clone(),
                reason: format!("no incremental backup from '{stop_at}' found"),
            })?;
        return Ok(vec![link]);
    }

    let mut chain = Vec::new();
    let mut visited = HashSet::new();
    let mut wanted = target.clone();
    loop {
        if !visited.insert(wanted.clone()) {
            return Err(SnapvaultError::ChainBroken {
                volume: volume.to_string(),
                snapshot: wanted,
                reason: "snapshot chain contains a cycle".into(),
            });
        }
        let link = best_for_snapshot(&candidates, &wanted).ok_or_else(|| {
            let reason = if wanted == target {
                "no backup of this snapshot found".to_string()
            } else {
                "base manifest not found".to_string()
            };
            SnapvaultError::ChainBroken {
                volume: volume.to_string(),
                snapshot: wanted.clone(),
                reason,
            }
        })?;
        chain.push(link);
        match &link.name.from_snapshot {
            None => break,
            Some(from) if request.present.contains(from) => break,
            Some(from) => wanted = from.clone(),
        }
    }
    chain.reverse();
    Ok(chain)
}

fn entry_order(a: &CatalogEntry, b: &CatalogEntry) -> std::cmp::Ordering {
    a.manifest
        .created_at
        .cmp(&b.manifest.created_at)
        .then_with(|| a.key.cmp(&b.key))
}

fn best_for_snapshot<'e>(candidates: &[&'e CatalogEntry], snapshot: &str) -> Option<&'e CatalogEntry> {
    candidates
        .iter()
        .copied()
        .filter(|e| e.name.snapshot == snapshot)
        .max_by(|a, b| entry_order(a, b))
}

fn latest_snapshot(candidates: &[&CatalogEntry]) -> Option<String> {
    candidates
        .iter()
        .max_by(|a, b| {
            let sa = &a.manifest.base_snapshot;
            let sb = &b.manifest.base_snapshot;
            sa.creation_time
                .cmp(&sb.creation_time)
                .then_with(|| sa.name.cmp(&sb.name))
                .then_with(|| entry_order(a, b))
        })
        .map(|e| e.name.snapshot.clone())
}
