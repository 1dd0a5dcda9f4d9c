//! Keel core types shared by the fetch, chart, apply, hooks and upgrade crates.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub mod config;
pub mod values;
pub mod version;

pub use config::{DynamicOptions, ExtensionUpgradeHookConfig, FailurePolicy};
pub use values::{coalesce, lookup, lookup_map, merge_tree, parse_yaml, remove_at, to_yaml, PathLookup, ValuesError};
pub use version::{parse_version, VersionError, VersionGate};

pub mod prelude {
    pub use super::{Action, DeploymentRole, ExtensionUpgradeHookConfig, FailurePolicy, PathLookup, VersionGate};
}

/// Lifecycle action the hook job was started for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Install,
    Upgrade,
    Uninstall,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Install => "install",
            Action::Upgrade => "upgrade",
            Action::Uninstall => "uninstall",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {what} {value:?}; expected {expected}")]
pub struct ParseEnumError {
    what: &'static str,
    value: String,
    expected: &'static str,
}

impl FromStr for Action {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "install" => Ok(Action::Install),
            "upgrade" => Ok(Action::Upgrade),
            "uninstall" => Ok(Action::Uninstall),
            _ => Err(ParseEnumError { what: "action", value: s.to_string(), expected: "install|upgrade|uninstall" }),
        }
    }
}

/// Which half of an extension a release deploys. Bundled sub-packages carry
/// the matching tag in their dependency declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentRole {
    Extension,
    Agent,
}

impl DeploymentRole {
    pub const AGENT_SUFFIX: &'static str = "-agent";

    pub fn tag(self) -> &'static str {
        match self {
            DeploymentRole::Extension => "extension",
            DeploymentRole::Agent => "agent",
        }
    }

    /// Split a release name into the extension name and the role it implies:
    /// `foo-agent` is the agent release of extension `foo`.
    pub fn from_release(release: &str) -> (String, DeploymentRole) {
        match release.strip_suffix(Self::AGENT_SUFFIX) {
            Some(ext) if !ext.is_empty() => (ext.to_string(), DeploymentRole::Agent),
            _ => (release.to_string(), DeploymentRole::Extension),
        }
    }
}

impl fmt::Display for DeploymentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.tag()) }
}

impl FromStr for DeploymentRole {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "extension" => Ok(DeploymentRole::Extension),
            "agent" => Ok(DeploymentRole::Agent),
            _ => Err(ParseEnumError { what: "install tag", value: s.to_string(), expected: "extension|agent" }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn release_suffix_selects_agent_role() {
        assert_eq!(DeploymentRole::from_release("network-agent"), ("network".to_string(), DeploymentRole::Agent));
        assert_eq!(DeploymentRole::from_release("network"), ("network".to_string(), DeploymentRole::Extension));
        // a bare suffix is not an agent of an empty extension
        assert_eq!(DeploymentRole::from_release("-agent"), ("-agent".to_string(), DeploymentRole::Extension));
    }

    #[test]
    fn action_parse_is_case_insensitive() {
        assert_eq!("Upgrade".parse::<Action>().unwrap(), Action::Upgrade);
        let err = "rollback".parse::<Action>().unwrap_err().to_string();
        assert!(err.contains("install|upgrade|uninstall"), "err={}", err);
    }
}
