//! Per-extension upgrade hook configuration.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::values::{lookup_map, PathLookup};

/// Extension specific knobs, addressed with dotted paths.
pub type DynamicOptions = Map<String, Value>;

/// What to do when a migration hook fails.
///
/// Reads either the variant name or its numeric code (`0` ignore, `1` fail);
/// always written as the name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "PolicyRepr")]
pub enum FailurePolicy {
    /// Log the failure and let the install/upgrade proceed.
    #[default]
    IgnoreError,
    /// Surface the failure and stop the run.
    FailOnError,
}

#[derive(Deserialize)]
enum PolicyName {
    IgnoreError,
    FailOnError,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PolicyRepr {
    Code(u64),
    Name(PolicyName),
}

impl TryFrom<PolicyRepr> for FailurePolicy {
    type Error = String;

    fn try_from(repr: PolicyRepr) -> Result<Self, Self::Error> {
        match repr {
            PolicyRepr::Code(0) | PolicyRepr::Name(PolicyName::IgnoreError) => Ok(FailurePolicy::IgnoreError),
            PolicyRepr::Code(1) | PolicyRepr::Name(PolicyName::FailOnError) => Ok(FailurePolicy::FailOnError),
            PolicyRepr::Code(n) => Err(format!("unknown failure policy code {}", n)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionUpgradeHookConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Force CRD installation when the extension is first installed.
    #[serde(default)]
    pub install_crds: bool,
    /// Force CRD upgrade when the extension version changes.
    #[serde(default)]
    pub upgrade_crds: bool,
    /// Merge stored values with the new package defaults when the version changes.
    #[serde(default)]
    pub merge_values: bool,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    #[serde(default)]
    pub dynamic_options: DynamicOptions,
}

impl ExtensionUpgradeHookConfig {
    /// Defaults used for the built-in extension list.
    pub fn builtin() -> Self {
        Self {
            enabled: true,
            install_crds: true,
            upgrade_crds: true,
            merge_values: false,
            failure_policy: FailurePolicy::IgnoreError,
            dynamic_options: DynamicOptions::new(),
        }
    }

    pub fn option(&self, path: &str) -> PathLookup<'_> { lookup_map(&self.dynamic_options, path) }

    /// Boolean dynamic option; absent or non-bool values fall back to `default`.
    pub fn flag(&self, path: &str, default: bool) -> bool { self.option(path).as_bool().unwrap_or(default) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_camel_case_with_defaults() {
        let cfg: ExtensionUpgradeHookConfig = serde_json::from_str(
            r#"{"enabled":true,"upgradeCrds":true,"failurePolicy":"FailOnError","dynamicOptions":{"pro":{"install":false}}}"#,
        )
        .unwrap();
        assert!(cfg.enabled && cfg.upgrade_crds);
        assert!(!cfg.install_crds && !cfg.merge_values);
        assert_eq!(cfg.failure_policy, FailurePolicy::FailOnError);
        assert!(!cfg.flag("pro.install", true));
        assert!(cfg.flag("pro.missing", true));
    }

    #[test]
    fn failure_policy_accepts_numeric_codes() {
        let cfg: ExtensionUpgradeHookConfig = serde_json::from_str(r#"{"enabled":true,"failurePolicy":1}"#).unwrap();
        assert_eq!(cfg.failure_policy, FailurePolicy::FailOnError);
        let cfg: ExtensionUpgradeHookConfig = serde_json::from_str(r#"{"enabled":true,"failurePolicy":0}"#).unwrap();
        assert_eq!(cfg.failure_policy, FailurePolicy::IgnoreError);
        assert!(serde_json::from_str::<ExtensionUpgradeHookConfig>(r#"{"failurePolicy":2}"#).is_err());
        assert!(serde_json::from_str::<ExtensionUpgradeHookConfig>(r#"{"failurePolicy":"Sometimes"}"#).is_err());
        assert_eq!(serde_json::to_value(FailurePolicy::FailOnError).unwrap(), serde_json::json!("FailOnError"));
    }
}
