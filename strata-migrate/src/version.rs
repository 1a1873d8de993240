//! Migration versions.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use semver::Version;

use crate::error::{MigrateResult, MigrationError};

/// The literal used in place of a version for repeatable migrations.
pub const REPEATABLE_MARKER: &str = "R";

/// A normalized semantic version.
///
/// Accepts an optional leading `v` and pads missing minor/patch components
/// with zero, so `1`, `v1.0` and `1.0.0` all denote the same version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SchemaVersion(Version);

impl SchemaVersion {
    /// Parse and normalize a version string.
    pub fn parse(input: &str) -> MigrateResult<Self> {
        let trimmed = input.trim();
        let raw = trimmed.strip_prefix('v').unwrap_or(trimmed);

        let split = raw.find(['-', '+']).unwrap_or(raw.len());
        let (core, suffix) = raw.split_at(split);

        let components = core.split('.').count();
        if core.is_empty() || components > 3 {
            return Err(MigrationError::InvalidVersion(input.to_string()));
        }

        let mut normalized = core.to_string();
        for _ in components..3 {
            normalized.push_str(".0");
        }
        normalized.push_str(suffix);

        Version::parse(&normalized)
            .map(Self)
            .map_err(|_| MigrationError::InvalidVersion(input.to_string()))
    }

    /// Get the underlying semver value.
    pub fn as_semver(&self) -> &Version {
        &self.0
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SchemaVersion {
    type Err = MigrationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// The version of a migration.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MigrationVersion {
    /// A versioned migration, applied exactly once.
    Versioned(SchemaVersion),
    /// A repeatable migration, eligible on every run.
    Repeatable,
}

impl MigrationVersion {
    /// Parse a version string, recognizing the repeatable marker.
    pub fn parse(input: &str) -> MigrateResult<Self> {
        if input.trim() == REPEATABLE_MARKER {
            Ok(Self::Repeatable)
        } else {
            SchemaVersion::parse(input).map(Self::Versioned)
        }
    }

    /// Check if this is the repeatable marker.
    pub fn is_repeatable(&self) -> bool {
        matches!(self, Self::Repeatable)
    }

    /// Get the semantic version, if any.
    pub fn schema_version(&self) -> Option<&SchemaVersion> {
        match self {
            Self::Versioned(v) => Some(v),
            Self::Repeatable => None,
        }
    }
}

impl fmt::Display for MigrationVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Versioned(v) => write!(f, "{}", v),
            Self::Repeatable => write!(f, "{}", REPEATABLE_MARKER),
        }
    }
}

impl PartialOrd for MigrationVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Versioned migrations first in semver order, then all repeatables (equal).
impl Ord for MigrationVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Versioned(a), Self::Versioned(b)) => a.cmp(b),
            (Self::Versioned(_), Self::Repeatable) => Ordering::Less,
            (Self::Repeatable, Self::Versioned(_)) => Ordering::Greater,
            (Self::Repeatable, Self::Repeatable) => Ordering::Equal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalization() {
        assert_eq!(SchemaVersion::parse("1").unwrap().to_string(), "1.0.0");
        assert_eq!(SchemaVersion::parse("v1.2").unwrap().to_string(), "1.2.0");
        assert_eq!(SchemaVersion::parse("1.2.3").unwrap().to_string(), "1.2.3");
        assert_eq!(
            SchemaVersion::parse("2.0-beta.1").unwrap().to_string(),
            "2.0.0-beta.1"
        );
    }

    #[test]
    fn test_invalid_versions() {
        for input in ["", "abc", "1.2.3.4", "1..2", "v", "1.x"] {
            assert!(
                matches!(
                    SchemaVersion::parse(input),
                    Err(MigrationError::InvalidVersion(_))
                ),
                "{input:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_semver_ordering() {
        let v = |s: &str| SchemaVersion::parse(s).unwrap();
        assert!(v("1.2.0") < v("1.10.0"));
        assert!(v("1.0.0-alpha") < v("1.0.0"));
        assert_eq!(v("1"), v("1.0.0"));
    }

    #[test]
    fn test_repeatable_sorts_last() {
        let repeatable = MigrationVersion::parse("R").unwrap();
        let versioned = MigrationVersion::parse("99.0.0").unwrap();

        assert!(repeatable.is_repeatable());
        assert!(versioned < repeatable);
        assert_eq!(repeatable.to_string(), REPEATABLE_MARKER);
        assert_eq!(repeatable.schema_version(), None);
    }
}
