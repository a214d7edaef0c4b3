//! Lease TTL policy
//!
//! Pure helpers used by issuance to bound a lease. Revocation carries no
//! TTL logic.

use std::time::Duration;

use kubelease_common::{Error, Result};

/// Largest TTL a secrets host can represent (nanoseconds in an i64)
pub const MAX_REPRESENTABLE_TTL_SECS: i64 = i64::MAX / 1_000_000_000;

/// Compute the effective TTL in seconds
///
/// A non-positive request falls back to `default_secs`; anything above
/// `max_secs` is clamped to it rather than rejected.
pub fn clamp(requested: i64, default_secs: u64, max_secs: u64) -> u64 {
    let wanted = if requested > 0 {
        requested as u64
    } else {
        default_secs
    };
    wanted.min(max_secs)
}

/// Convert a TTL in seconds to a lease duration
pub fn to_duration(seconds: i64) -> Result<Duration> {
    if seconds <= 0 {
        return Err(Error::invalid_ttl(seconds, "lease ttl must be positive"));
    }
    if seconds > MAX_REPRESENTABLE_TTL_SECS {
        return Err(Error::invalid_ttl(
            seconds,
            format!("exceeds the maximum of {}s", MAX_REPRESENTABLE_TTL_SECS),
        ));
    }
    Ok(Duration::from_secs(seconds as u64))
}

/// Parse a caller-supplied TTL
///
/// Accepts plain seconds (`"600"`, `"-1"`) or a single-unit duration
/// (`"90s"`, `"10m"`, `"2h"`). Empty input means "use the default" and
/// parses to 0.
pub fn parse(raw: &str) -> Result<i64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(0);
    }
    let malformed = |msg: &str| Error::invalid_ttl(0, format!("'{}' {}", raw, msg));

    let (digits, multiplier) = match raw.chars().last() {
        Some('s') => (&raw[..raw.len() - 1], 1),
        Some('m') => (&raw[..raw.len() - 1], 60),
        Some('h') => (&raw[..raw.len() - 1], 3600),
        Some(c) if c.is_ascii_digit() => (raw, 1),
        _ => return Err(malformed("has an unknown unit, use s, m or h")),
    };

    let value: i64 = digits
        .parse()
        .map_err(|_| malformed("is not a valid number of seconds"))?;
    value
        .checked_mul(multiplier)
        .ok_or_else(|| malformed("is too large"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_positive_request_uses_default() {
        assert_eq!(clamp(0, 300, 600), 300);
        assert_eq!(clamp(-5, 300, 600), 300);
        assert_eq!(clamp(i64::MIN, 300, 600), 300);
    }

    #[test]
    fn request_above_max_is_clamped() {
        assert_eq!(clamp(601, 300, 600), 600);
        assert_eq!(clamp(i64::MAX, 300, 600), 600);
    }

    #[test]
    fn request_within_bounds_is_kept() {
        for requested in [1, 299, 300, 301, 600] {
            assert_eq!(clamp(requested, 300, 600), requested as u64);
        }
    }

    #[test]
    fn default_above_max_is_clamped_too() {
        assert_eq!(clamp(0, 900, 600), 600);
    }

    #[test]
    fn to_duration_rejects_unrepresentable_values() {
        assert_eq!(to_duration(300).unwrap(), Duration::from_secs(300));
        assert!(matches!(
            to_duration(0),
            Err(Error::InvalidTtl { value: 0, .. })
        ));
        assert!(to_duration(-1).is_err());
        assert!(to_duration(MAX_REPRESENTABLE_TTL_SECS).is_ok());
        assert!(to_duration(MAX_REPRESENTABLE_TTL_SECS + 1).is_err());
    }

    #[test]
    fn parse_accepts_seconds_and_units() {
        assert_eq!(parse("600").unwrap(), 600);
        assert_eq!(parse("-1").unwrap(), -1);
        assert_eq!(parse("").unwrap(), 0);
        assert_eq!(parse(" 90s ").unwrap(), 90);
        assert_eq!(parse("10m").unwrap(), 600);
        assert_eq!(parse("2h").unwrap(), 7200);
    }

    #[test]
    fn parse_rejects_malformed_values() {
        for raw in ["ten", "10d", "m", "1.5h", "99999999999999999999"] {
            let err = parse(raw).unwrap_err();
            assert!(matches!(err, Error::InvalidTtl { .. }), "{raw}");
        }
        assert!(parse(&format!("{}h", i64::MAX)).is_err());
    }
}
