/// Release version parsing for Helm and Kubernetes version checks
use std::fmt;
use std::str::FromStr;

/// A `major.minor.patch` release version
///
/// Leading `v` is accepted, pre-release and build suffixes are ignored:
/// `v1.27.3-gke.100` parses as 1.27.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

#[derive(Debug, thiserror::Error)]
#[error("malformed version '{0}'")]
pub struct VersionError(String);

impl FromStr for Version {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let core = trimmed.strip_prefix('v').unwrap_or(trimmed);
        let core = core.split(['-', '+']).next().unwrap_or_default();

        let mut parts = core.split('.');
        let mut next = |required: bool| -> Result<u64, VersionError> {
            match parts.next() {
                Some(p) => p.parse().map_err(|_| VersionError(s.to_string())),
                None if required => Err(VersionError(s.to_string())),
                None => Ok(0),
            }
        };

        let version = Version {
            major: next(true)?,
            minor: next(false)?,
            patch: next(false)?,
        };
        if parts.next().is_some() {
            return Err(VersionError(s.to_string()));
        }
        Ok(version)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}
