//! Schema version triple and the append-only tracker row.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Error for malformed version text
#[derive(Debug, thiserror::Error)]
#[error("invalid schema version {0:?}: expected \"major.minor.patch\"")]
pub struct ParseVersionError(pub String);

/// A three-part schema version.
///
/// Ordering is lexicographic over (major, minor, patch): the first unequal
/// component decides. The derived `Ord` compares fields in declaration
/// order, which is exactly that comparison.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(try_from = "String", into = "String")]
pub struct SchemaVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl SchemaVersion {
    /// The version reported by an empty tracker.
    pub const ZERO: Self = Self {
        major: 0,
        minor: 0,
        patch: 0,
    };

    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for SchemaVersion {
    type Err = ParseVersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('.');
        let (major, minor, patch) = match (parts.next(), parts.next(), parts.next(), parts.next())
        {
            (Some(major), Some(minor), Some(patch), None) => (major, minor, patch),
            _ => return Err(ParseVersionError(s.to_string())),
        };
        let parse = |part: &str| {
            part.parse::<u32>()
                .map_err(|_| ParseVersionError(s.to_string()))
        };
        Ok(Self {
            major: parse(major)?,
            minor: parse(minor)?,
            patch: parse(patch)?,
        })
    }
}

impl TryFrom<String> for SchemaVersion {
    type Error = ParseVersionError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<SchemaVersion> for String {
    fn from(version: SchemaVersion) -> Self {
        version.to_string()
    }
}

/// One append-only row of the schema version tracker. Never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedVersion {
    pub version: SchemaVersion,
    pub applied_at: DateTime<Utc>,
}

impl AppliedVersion {
    /// Tracker row for a version applied right now.
    pub fn now(version: SchemaVersion) -> Self {
        Self {
            version,
            applied_at: Utc::now(),
        }
    }
}
