//! Modification-time storage conventions.
//!
//! Backends without a native mtime stamp it in a metadata key. The engine
//! writes RFC 3339 with nanosecond precision; parsing is deliberately
//! lenient because several formats coexist in the wild: RFC 3339, decimal
//! Unix seconds with a millisecond fraction, and bare integer seconds or
//! milliseconds.

use chrono::{DateTime, TimeZone, Utc};

use crate::error::{FsError, FsResult};

/// Metadata key holding an object's modification time.
pub const MTIME_KEY: &str = "mtime";

/// Format an mtime for storage in a metadata slot: RFC 3339 with subsecond
/// (nanosecond) precision.
pub fn format_meta_mtime(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true)
}

/// Format an mtime for a vendor header slot: decimal milliseconds.
pub fn format_header_mtime(t: DateTime<Utc>) -> String {
    format!("{}", t.timestamp_millis())
}

/// Parse a stored mtime leniently.
///
/// Accepts RFC 3339 (any subsecond precision), decimal seconds with a
/// fraction (`1609459200.123`), integer Unix seconds, and integer Unix
/// milliseconds (disambiguated by magnitude).
pub fn parse_meta_mtime(value: &str) -> FsResult<DateTime<Utc>> {
    let value = value.trim();
    if value.is_empty() {
        return Err(FsError::Validation("empty mtime value".into()));
    }

    if let Ok(t) = DateTime::parse_from_rfc3339(value) {
        return Ok(t.with_timezone(&Utc));
    }

    // Fractional Unix seconds.
    if let Some((secs, frac)) = value.split_once('.') {
        if let (Ok(secs), Ok(frac_num)) = (secs.parse::<i64>(), frac.parse::<u32>()) {
            let digits = frac.len() as u32;
            if digits > 0 && digits <= 9 {
                let nanos = frac_num * 10u32.pow(9 - digits);
                if let Some(t) = Utc.timestamp_opt(secs, nanos).single() {
                    return Ok(t);
                }
            }
        }
    }

    // Bare integers: beyond ~year 5138 in seconds means milliseconds.
    if let Ok(n) = value.parse::<i64>() {
        const MILLIS_THRESHOLD: i64 = 100_000_000_000;
        let t = if n.abs() >= MILLIS_THRESHOLD {
            Utc.timestamp_millis_opt(n).single()
        } else {
            Utc.timestamp_opt(n, 0).single()
        };
        if let Some(t) = t {
            return Ok(t);
        }
    }

    Err(FsError::Validation(format!("unparseable mtime {value:?}")))
}
