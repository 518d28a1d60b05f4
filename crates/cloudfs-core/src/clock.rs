//! RFC 3339 timestamp helpers.
//!
//! The index stores every timestamp as an RFC 3339 UTC string, which keeps
//! rows human-readable inside a decrypted recovery bundle and makes
//! lexicographic comparison in SQL match chronological order.

use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::error::{CloudfsError, CloudfsResult};

pub fn now() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}

pub fn to_rfc3339(t: OffsetDateTime) -> String {
    t.format(&Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}

pub fn now_rfc3339() -> String {
    to_rfc3339(now())
}

pub fn parse_rfc3339(s: &str) -> CloudfsResult<OffsetDateTime> {
    OffsetDateTime::parse(s, &Rfc3339)
        .map_err(|e| CloudfsError::Corrupt(format!("bad timestamp {s:?}: {e}")))
}

/// Whole days elapsed since `t`, clamped at zero.
pub fn days_since(t: OffsetDateTime) -> i64 {
    let elapsed = now() - t;
    elapsed.whole_days().max(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let t = now();
        let s = to_rfc3339(t);
        let back = parse_rfc3339(&s).unwrap();
        assert_eq!(t.unix_timestamp(), back.unix_timestamp());
    }

    #[test]
    fn bad_timestamp_is_corrupt() {
        assert!(matches!(
            parse_rfc3339("yesterday"),
            Err(CloudfsError::Corrupt(_))
        ));
    }

    #[test]
    fn rfc3339_sorts_chronologically() {
        let older = "2024-01-02T03:04:05Z";
        let newer = "2025-01-02T03:04:05Z";
        assert!(older < newer);
    }
}
