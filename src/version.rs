//! Symbol and subsystem version handling

use crate::error::{ModuleError, ModuleResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The subsystem version this build exports to module declarations
pub const SUBSYSTEM_VERSION: Version = Version::new(1, 0, 0);

/// A `major.minor.patch` version attached to symbols and declarations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Version {
    /// Incompatible API changes
    pub major: u32,
    /// Backwards-compatible additions
    pub minor: u32,
    /// Backwards-compatible fixes
    pub patch: u32,
}

impl Version {
    /// Create a version from its components
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Whether an export of this version satisfies a request for `requested`
    ///
    /// The subsystem rule: same major; minor at least the requested minor;
    /// patch at least the requested patch when the minors are equal.
    pub fn is_compatible_with(&self, requested: &Version) -> bool {
        if self.major != requested.major {
            return false;
        }
        match self.minor.cmp(&requested.minor) {
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Equal => self.patch >= requested.patch,
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for Version {
    type Err = ModuleError;

    fn from_str(s: &str) -> ModuleResult<Self> {
        let mut parts = s.split('.');
        let mut next = || -> ModuleResult<u32> {
            parts
                .next()
                .and_then(|p| p.parse().ok())
                .ok_or_else(|| ModuleError::InvalidVersion(s.to_string()))
        };
        let version = Version::new(next()?, next()?, next()?);
        if parts.next().is_some() {
            return Err(ModuleError::InvalidVersion(s.to_string()));
        }
        Ok(version)
    }
}
