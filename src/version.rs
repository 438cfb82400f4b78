use std::fmt;

use semver::Version;

use crate::error::Error;

/// Parses a `major.minor.patch` version.
pub fn parse_version(version: &str) -> Result<Version, Error> {
    Version::parse(version).map_err(|source| Error::InvalidVersion {
        version: version.to_owned(),
        source,
    })
}

/// The half-open interval `[low, high)` over semantic versions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionRange {
    low: Version,
    high: Version,
}

impl VersionRange {
    pub fn new(low: Version, high: Version) -> Result<Self, Error> {
        if low > high {
            return Err(Error::InvalidRange { low, high });
        }
        Ok(Self { low, high })
    }

    /// Builds `[low, high)` from bounds the caller knows are ordered.
    pub(crate) const fn from_ordered(low: Version, high: Version) -> Self {
        Self { low, high }
    }

    pub fn parse(low: &str, high: &str) -> Result<Self, Error> {
        Self::new(parse_version(low)?, parse_version(high)?)
    }

    pub fn low(&self) -> &Version {
        &self.low
    }

    pub fn high(&self) -> &Version {
        &self.high
    }

    pub fn contains(&self, version: &Version) -> bool {
        &self.low <= version && version < &self.high
    }

    /// Like [`contains`](Self::contains), but an unknown version matches.
    pub fn contains_or_empty(&self, version: Option<&Version>) -> bool {
        version.map_or(true, |version| self.contains(version))
    }
}

impl fmt::Display for VersionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{},{})", self.low, self.high)
    }
}
