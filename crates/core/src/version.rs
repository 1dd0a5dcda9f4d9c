//! Semantic version gates for migration hooks.

use semver::{Prerelease, Version};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid version {input:?}: {reason}")]
pub struct VersionError {
    pub input: String,
    pub reason: String,
}

/// Parse `1.2.3`, `v1.2.3` or `1.2.3-rc.1`.
pub fn parse_version(raw: &str) -> Result<Version, VersionError> {
    let s = raw.trim();
    let s = s.strip_prefix('v').unwrap_or(s);
    Version::parse(s).map_err(|e| VersionError { input: raw.to_string(), reason: e.to_string() })
}

/// A threshold an installed extension crosses when it moves from below the
/// threshold to at-or-above it. Pre-releases of the threshold count as
/// at-or-above, so the floor is `X.Y.Z-0`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionGate {
    floor: Version,
}

impl VersionGate {
    pub fn at(threshold: &str) -> Result<Self, VersionError> {
        let mut floor = parse_version(threshold)?;
        if floor.pre.is_empty() {
            floor.pre = Prerelease::new("0").map_err(|e| VersionError { input: threshold.to_string(), reason: e.to_string() })?;
        }
        Ok(Self { floor })
    }

    pub fn floor(&self) -> &Version { &self.floor }

    /// `observed < threshold <= desired`. An empty observed version (nothing
    /// installed yet) never crosses.
    pub fn crossed_by(&self, observed: &str, desired: &str) -> Result<bool, VersionError> {
        if observed.trim().is_empty() {
            return Ok(false);
        }
        let observed = parse_version(observed)?;
        let desired = parse_version(desired)?;
        Ok(observed < self.floor && desired >= self.floor)
    }
}
