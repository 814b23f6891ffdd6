//! Version vectors for causal diffing between replicas.
//!
//! A version maps each op source to the newest date this replica has sent
//! or incorporated from it. Serialization is canonical: entries are sorted
//! by source, so equal versions always compare equal on the wire.
//!
//! Wire format: `"<source> <date>|<source> <date>"` (empty string = empty version).

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Error parsing a serialized version vector.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VersionParseError {
    #[error("malformed version entry: {0:?}")]
    MalformedEntry(String),
    #[error("invalid date in version entry {entry:?}: {reason}")]
    InvalidDate { entry: String, reason: String },
}

/// Per-source latest-date map.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionVector {
    entries: BTreeMap<String, u64>,
}

impl VersionVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `date` from `source` has been incorporated.
    pub fn observe(&mut self, source: &str, date: u64) {
        match self.entries.get_mut(source) {
            Some(current) if *current >= date => {}
            Some(current) => *current = date,
            None => {
                self.entries.insert(source.to_string(), date);
            }
        }
    }

    /// Latest date known for `source`.
    pub fn get(&self, source: &str) -> Option<u64> {
        self.entries.get(source).copied()
    }

    /// Whether an op `(source, date)` is already covered by this version.
    pub fn dominates(&self, source: &str, date: u64) -> bool {
        self.entries.get(source).is_some_and(|known| *known >= date)
    }

    /// Pointwise maximum with another version.
    pub fn merge(&mut self, other: &VersionVector) {
        for (source, date) in &other.entries {
            self.observe(source, *date);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.entries.iter().map(|(s, d)| (s.as_str(), *d))
    }
}

impl fmt::Display for VersionVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (source, date) in &self.entries {
            if !first {
                f.write_str("|")?;
            }
            write!(f, "{source} {date}")?;
            first = false;
        }
        Ok(())
    }
}

impl FromStr for VersionVector {
    type Err = VersionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut version = VersionVector::new();
        for entry in s.split('|').filter(|e| !e.is_empty()) {
            let (source, date) = entry
                .rsplit_once(' ')
                .ok_or_else(|| VersionParseError::MalformedEntry(entry.to_string()))?;
            if source.is_empty() {
                return Err(VersionParseError::MalformedEntry(entry.to_string()));
            }
            let date: u64 = date.parse().map_err(|e: std::num::ParseIntError| {
                VersionParseError::InvalidDate {
                    entry: entry.to_string(),
                    reason: e.to_string(),
                }
            })?;
            version.observe(source, date);
        }
        Ok(version)
    }
}

impl Serialize for VersionVector {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for VersionVector {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
