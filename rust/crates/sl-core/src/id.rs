//! Run identifiers
//!
//! Runs are identified by ULIDs so workspace entries sort by start time.

use serde::{Deserialize, Serialize};
use std::fmt;
use ulid::Ulid;

/// Identifier of a single `execute` invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(Ulid);

impl RunId {
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Parse from string, with or without the `run_` prefix
    pub fn parse(s: &str) -> Result<Self, crate::Error> {
        let s = s.strip_prefix("run_").unwrap_or(s);
        let ulid = Ulid::from_string(s)
            .map_err(|_| crate::Error::Config(format!("invalid run id '{}'", s)))?;
        Ok(Self(ulid))
    }

    /// Millisecond timestamp embedded in the id
    pub fn timestamp(&self) -> u64 {
        self.0.timestamp_ms()
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "run_{}", self.0)
    }
}

impl std::str::FromStr for RunId {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
