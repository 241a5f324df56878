use std::time::Duration;

use snapvault_types::{Result, SnapvaultError};

pub(super) fn default_working_directory() -> String {
    "~/.snapvault".to_string()
}

pub(super) fn default_manifest_prefix() -> String {
    "manifests".to_string()
}

pub(super) fn default_separator() -> String {
    "|".to_string()
}

pub(super) fn default_zfs_path() -> String {
    "zfs".to_string()
}

pub(super) fn default_max_file_buffer() -> usize {
    5
}

pub(super) fn default_volume_size_mib() -> u64 {
    200
}

pub(super) fn default_algorithm() -> String {
    "lz4".to_string()
}

pub(super) fn default_zstd_level() -> i32 {
    3
}

pub(super) fn default_max_retry_time() -> String {
    "12h".to_string()
}

pub(super) fn default_max_backoff() -> String {
    "30m".to_string()
}

pub(super) fn default_base_delay_ms() -> u64 {
    1000
}

pub(super) fn default_uploads() -> usize {
    4
}

pub(super) fn default_downloads() -> usize {
    4
}

/// Parse a duration string like "30s", "30m", "12h" or "2d".
///
/// A bare number is taken as seconds. `"0"` is accepted and means "no
/// limit" wherever a zero duration has that meaning.
pub fn parse_human_duration(raw: &str) -> Result<Duration> {
    let input = raw.trim();
    let (num_part, unit) = match input.chars().last() {
        Some(c) if c.is_ascii_alphabetic() => (&input[..input.len() - 1], Some(c)),
        Some(_) => (input, None),
        None => {
            return Err(SnapvaultError::Config("duration must not be empty".into()));
        }
    };

    let value: u64 = num_part
        .trim()
        .parse()
        .map_err(|_| SnapvaultError::Config(format!("invalid duration value: '{raw}'")))?;

    let secs = match unit {
        None | Some('s') | Some('S') => value,
        Some('m') | Some('M') => value.saturating_mul(60),
        Some('h') | Some('H') => value.saturating_mul(60 * 60),
        Some('d') | Some('D') => value.saturating_mul(60 * 60 * 24),
        Some(other) => {
            return Err(SnapvaultError::Config(format!(
                "unsupported duration suffix '{other}' in '{raw}' (use s/m/h/d)"
            )));
        }
    };

    Ok(Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_units() {
        assert_eq!(parse_human_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_human_duration("45").unwrap(), Duration::from_secs(45));
        assert_eq!(parse_human_duration("30m").unwrap(), Duration::from_secs(1800));
        assert_eq!(parse_human_duration("12h").unwrap(), Duration::from_secs(43_200));
        assert_eq!(parse_human_duration(" 2d ").unwrap(), Duration::from_secs(172_800));
        assert_eq!(parse_human_duration("0").unwrap(), Duration::ZERO);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_human_duration("").is_err());
        assert!(parse_human_duration("h").is_err());
        assert!(parse_human_duration("10w").is_err());
        assert!(parse_human_duration("-5m").is_err());
        assert!(parse_human_duration("1.5h").is_err());
    }
}
