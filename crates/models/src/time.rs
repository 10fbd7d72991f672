use chrono::{DateTime, SecondsFormat, Utc};
use std::cmp::Ordering;

// Upstream sources disagree on timestamp shape: `Z` vs `±hh:mm` vs `±hhmm`
// offsets, `T` vs space separators, and optional fractional seconds all
// occur in the wild.
const FALLBACK_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f%#z"];

/// Parse a source timestamp in any of its observed representations,
/// yielding a UTC instant. Returns None when the input is unparseable.
pub fn normalize(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    // Accept a space separator by rewriting it to `T` before parsing.
    let mut owned;
    let candidate = if raw.len() > 10 && raw.as_bytes()[10] == b' ' {
        owned = raw.to_string();
        owned.replace_range(10..11, "T");
        &owned
    } else {
        raw
    };

    if let Ok(parsed) = DateTime::parse_from_rfc3339(candidate) {
        return Some(parsed.with_timezone(&Utc));
    }
    for format in FALLBACK_FORMATS {
        if let Ok(parsed) = DateTime::parse_from_str(candidate, format) {
            return Some(parsed.with_timezone(&Utc));
        }
    }
    None
}

/// Canonicalize a source timestamp to UTC RFC-3339 at second precision.
/// Canonicalization is idempotent: canonicalize(canonicalize(x)) == canonicalize(x).
pub fn canonicalize(raw: &str) -> Option<String> {
    normalize(raw).map(|parsed| parsed.to_rfc3339_opts(SecondsFormat::Secs, true))
}

/// Order two source timestamps. When only one side parses it is considered
/// the newer one; when neither parses the two are equal for time purposes.
pub fn compare_source_times(left: &str, right: &str) -> Ordering {
    match (normalize(left), normalize(right)) {
        (Some(l), Some(r)) => l.cmp(&r),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        (None, None) => Ordering::Equal,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_normalize_accepts_observed_shapes() {
        let want = "2025-01-01T10:00:00Z";
        for raw in [
            "2025-01-01T10:00:00Z",
            "2025-01-01 10:00:00Z",
            "2025-01-01T10:00:00+00:00",
            "2025-01-01T11:30:00+01:30",
            "2025-01-01T11:30:00+0130",
            "2025-01-01 04:00:00-0600",
            "2025-01-01T10:00:00.000Z",
            "  2025-01-01T10:00:00Z  ",
        ] {
            assert_eq!(canonicalize(raw).as_deref(), Some(want), "raw {raw:?}");
        }
    }

    #[test]
    fn test_normalize_rejects_garbage() {
        for raw in ["", "not a time", "2025-13-40T99:00:00Z", "1736935200"] {
            assert_eq!(normalize(raw), None, "raw {raw:?}");
        }
    }

    #[test]
    fn test_canonicalize_is_idempotent() {
        for raw in [
            "2025-01-01 04:00:00-0600",
            "2025-06-30T23:59:59.123+02:00",
            "2024-02-29T00:00:00Z",
        ] {
            let once = canonicalize(raw).unwrap();
            let twice = canonicalize(&once).unwrap();
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn test_compare_prefers_the_parseable_side() {
        use Ordering::*;
        assert_eq!(
            compare_source_times("2025-01-01T10:00:00Z", "2025-01-01T09:00:00Z"),
            Greater
        );
        assert_eq!(
            compare_source_times("2025-01-01T10:00:00Z", "2025-01-01 11:00:00+0100"),
            Equal
        );
        assert_eq!(compare_source_times("2025-01-01T10:00:00Z", "garbage"), Greater);
        assert_eq!(compare_source_times("garbage", "2025-01-01T10:00:00Z"), Less);
        assert_eq!(compare_source_times("garbage", "also garbage"), Equal);
    }
}
