//! Version Parsing and Range Matching
//!
//! One comparator shared by every vendor plugin. Versions are compared as
//! `major.minor.patch` with missing segments treated as 0. Self-reported
//! version strings are noisy (`"PostgreSQL 15.3 on x86_64..."`,
//! `"10.11.2-MariaDB"`, `"8.0.35-log"`), so parsing takes the first dotted
//! numeric run in the string.
//!
//! When a version cannot be parsed numerically the comparison falls back to
//! plain string ordering and the match is flagged as degraded.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// A database or plugin version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Version {
    raw: String,
    numeric: Option<[u64; 3]>,
}

impl Version {
    /// Parse a version string. Never fails; unparsable input keeps only its raw text.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        Self { raw: raw.trim().to_string(), numeric: parse_numeric(raw) }
    }

    /// The text the version was parsed from
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// `[major, minor, patch]` when the string contained a numeric version
    #[must_use]
    pub const fn numeric(&self) -> Option<[u64; 3]> {
        self.numeric
    }

    /// Compare two versions.
    ///
    /// Returns the ordering plus `true` when the string fallback had to be used.
    #[must_use]
    pub fn compare(&self, other: &Self) -> (Ordering, bool) {
        match (self.numeric, other.numeric) {
            (Some(a), Some(b)) => (a.cmp(&b), false),
            _ => (self.raw.cmp(&other.raw), true),
        }
    }
}

impl From<String> for Version {
    fn from(raw: String) -> Self {
        Self::parse(&raw)
    }
}

impl From<Version> for String {
    fn from(version: Version) -> Self {
        version.raw
    }
}

impl From<&str> for Version {
    fn from(raw: &str) -> Self {
        Self::parse(raw)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

/// Extract the first `N[.N[.N]]` run from a version string
fn parse_numeric(raw: &str) -> Option<[u64; 3]> {
    let start = raw.find(|c: char| c.is_ascii_digit())?;
    let run: String =
        raw[start..].chars().take_while(|c| c.is_ascii_digit() || *c == '.').collect();

    let mut parts = [0u64; 3];
    for (slot, segment) in parts.iter_mut().zip(run.split('.').filter(|s| !s.is_empty())) {
        *slot = segment.parse().ok()?;
    }
    Some(parts)
}

/// Outcome of testing a version against a range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeMatch {
    /// Whether the version lies inside the range
    pub contains: bool,
    /// Whether any bound had to be compared as a plain string
    pub degraded: bool,
}

/// Inclusive version range `[min, max]`; `max = None` means unbounded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRange {
    pub min: Version,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<Version>,
}

impl VersionRange {
    /// Range starting at `min` with no upper bound
    #[must_use]
    pub fn at_least(min: &str) -> Self {
        Self { min: Version::parse(min), max: None }
    }

    /// Closed range `[min, max]`
    #[must_use]
    pub fn between(min: &str, max: &str) -> Self {
        Self { min: Version::parse(min), max: Some(Version::parse(max)) }
    }

    /// Range that accepts every version
    #[must_use]
    pub fn any() -> Self {
        Self::at_least("0")
    }

    /// Test whether `version` falls inside this range
    #[must_use]
    pub fn matches(&self, version: &Version) -> RangeMatch {
        let (lower, lower_degraded) = version.compare(&self.min);
        let (upper_ok, upper_degraded) = match &self.max {
            Some(max) => {
                let (ord, degraded) = version.compare(max);
                (ord != Ordering::Greater, degraded)
            }
            None => (true, false),
        };

        RangeMatch {
            contains: lower != Ordering::Less && upper_ok,
            degraded: lower_degraded || upper_degraded,
        }
    }

    /// Order ranges by permissiveness: unbounded first, then lowest minimum, then highest maximum.
    ///
    /// `Ordering::Greater` means `self` is wider than `other`.
    #[must_use]
    pub fn width_cmp(&self, other: &Self) -> Ordering {
        match (&self.max, &other.max) {
            (None, Some(_)) => return Ordering::Greater,
            (Some(_), None) => return Ordering::Less,
            _ => {}
        }

        let (min_ord, _) = self.min.compare(&other.min);
        if min_ord != Ordering::Equal {
            return min_ord.reverse();
        }

        match (&self.max, &other.max) {
            (Some(a), Some(b)) => a.compare(b).0,
            _ => Ordering::Equal,
        }
    }
}

impl fmt::Display for VersionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.max {
            Some(max) => write!(f, "[{}, {}]", self.min, max),
            None => write!(f, "[{}, *)", self.min),
        }
    }
}
