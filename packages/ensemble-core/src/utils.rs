//! General utilities shared across the engine.

use std::time::{SystemTime, UNIX_EPOCH};

// ─────────────────────────────────────────────────────────────────────────────
// Time Utilities
// ─────────────────────────────────────────────────────────────────────────────

/// Returns the current Unix timestamp in milliseconds.
///
/// Returns 0 if the system clock is before the Unix epoch (shouldn't happen in practice).
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Formats milliseconds as the UPnP `H:MM:SS` time notation.
///
/// Sub-second precision is rounded to the nearest second.
#[must_use]
pub fn format_upnp_time(ms: u64) -> String {
    let total_secs = (ms + 500) / 1000;
    format!(
        "{}:{:02}:{:02}",
        total_secs / 3600,
        (total_secs % 3600) / 60,
        total_secs % 60
    )
}

/// Parses the UPnP `H:MM:SS[.fff]` notation into milliseconds.
///
/// Returns `None` for malformed values and for the `NOT_IMPLEMENTED` marker
/// Sonos reports on radio streams.
#[must_use]
pub fn parse_upnp_time(value: &str) -> Option<u64> {
    let mut parts = value.trim().split(':');
    let hours: u64 = parts.next()?.parse().ok()?;
    let minutes: u64 = parts.next()?.parse().ok()?;
    let seconds_part = parts.next()?;
    if parts.next().is_some() {
        return None;
    }

    let (secs, frac) = match seconds_part.split_once('.') {
        Some((s, f)) => (s, Some(f)),
        None => (seconds_part, None),
    };
    let secs: u64 = secs.parse().ok()?;
    let millis = match frac {
        Some(f) if !f.is_empty() => {
            let digits: String = f.chars().take(3).collect();
            let scale = 10u64.pow(3 - digits.len() as u32);
            digits.parse::<u64>().ok()? * scale
        }
        _ => 0,
    };

    Some(((hours * 60 + minutes) * 60 + secs) * 1000 + millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_upnp_time() {
        assert_eq!(format_upnp_time(0), "0:00:00");
        assert_eq!(format_upnp_time(207_000), "0:03:27");
        assert_eq!(format_upnp_time(3_723_400), "1:02:03");
        assert_eq!(format_upnp_time(1_600), "0:00:02");
    }

    #[test]
    fn parses_upnp_time() {
        assert_eq!(parse_upnp_time("0:03:27"), Some(207_000));
        assert_eq!(parse_upnp_time("1:02:03.5"), Some(3_723_500));
        assert_eq!(parse_upnp_time("NOT_IMPLEMENTED"), None);
        assert_eq!(parse_upnp_time("1:2"), None);
    }
}
