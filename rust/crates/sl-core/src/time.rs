//! Run timing
//!
//! The engine stamps signature records, run logs and reports with epoch
//! milliseconds: compact in JSON lines and ordered without parsing. RFC 3339
//! rendering happens only at display boundaries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Milliseconds since the Unix epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    pub fn now() -> Self {
        Self(Utc::now().timestamp_millis())
    }

    pub fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    pub fn millis(&self) -> i64 {
        self.0
    }

    /// Milliseconds between this stamp and now, clamped at zero
    pub fn elapsed_ms(&self) -> u64 {
        (Utc::now().timestamp_millis() - self.0).max(0) as u64
    }
}

impl Default for Timestamp {
    fn default() -> Self {
        Self::now()
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match DateTime::<Utc>::from_timestamp_millis(self.0) {
            Some(dt) => write!(f, "{}", dt.to_rfc3339()),
            None => write!(f, "{}ms", self.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamps_are_ordered() {
        let earlier = Timestamp::from_millis(1_000);
        let later = Timestamp::from_millis(2_000);
        assert!(earlier < later);
        assert_eq!(later.millis(), 2_000);
    }

    #[test]
    fn test_elapsed_never_negative() {
        let future = Timestamp::from_millis(i64::MAX / 2);
        assert_eq!(future.elapsed_ms(), 0);
        assert!(Timestamp::from_millis(0).elapsed_ms() > 0);
    }

    #[test]
    fn test_serializes_as_plain_number() {
        let ts = Timestamp::from_millis(1_234);
        assert_eq!(serde_json::to_string(&ts).unwrap(), "1234");
        let back: Timestamp = serde_json::from_str("1234").unwrap();
        assert_eq!(back, ts);
    }

    #[test]
    fn test_display_is_rfc3339() {
        let ts = Timestamp::from_millis(0);
        assert!(ts.to_string().starts_with("1970-01-01T00:00:00"));
    }
}
