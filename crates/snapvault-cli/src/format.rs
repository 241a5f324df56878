use std::time::Duration;

pub(crate) fn format_bytes(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = KIB * 1024;
    const GIB: u64 = MIB * 1024;

    if bytes >= GIB {
        format!("{:.2} GiB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.2} MiB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.2} KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{bytes} B")
    }
}

pub(crate) fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    if secs >= 3600 {
        format!("{}h{:02}m{:02}s", secs / 3600, secs % 3600 / 60, secs % 60)
    } else if secs >= 60 {
        format!("{}m{:02}s", secs / 60, secs % 60)
    } else {
        format!("{:.1}s", elapsed.as_secs_f64())
    }
}

/// Split `<volume>@<snapshot>`; a bare volume yields no snapshot.
pub(crate) fn split_snapshot(spec: &str) -> Result<(&str, Option<&str>), String> {
    match spec.split_once('@') {
        Some((volume, snapshot)) if !volume.is_empty() && !snapshot.is_empty() => {
            Ok((volume, Some(snapshot)))
        }
        Some(_) => Err(format!("expected <volume>@<snapshot>, got '{spec}'")),
        None if spec.is_empty() => Err("volume name must not be empty".into()),
        None => Ok((spec, None)),
    }
}

/// Accept either `snap` or `volume@snap` for a snapshot of `volume`.
pub(crate) fn snapshot_name<'a>(volume: &str, spec: &'a str) -> &'a str {
    spec.strip_prefix(volume)
        .and_then(|rest| rest.strip_prefix('@'))
        .unwrap_or(spec)
        .trim_start_matches('@')
}

pub(crate) fn split_destinations(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .map(str::to_string)
        .collect()
}
