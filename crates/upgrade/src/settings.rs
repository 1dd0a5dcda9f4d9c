//! Hook settings document: download options plus per-extension hook config,
//! read from a ConfigMap. Any failure to read it falls back to built-ins.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;
use keel_core::{parse_yaml, ExtensionUpgradeHookConfig};
use keel_fetch::FetchOptions;
use keel_kubehub::{ClusterStore, ObjectRef, ResourceKind};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Extensions that get the built-in hook config.
pub const BUILTIN_EXTENSIONS: &[&str] = &["whizard-monitoring", "whizard-monitoring-pro", "whizard-alerting", "network"];

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("ConfigMap {0} not found")]
    NotFound(String),
    #[error("ConfigMap {cm} has no key {key:?}")]
    MissingKey { cm: String, key: String },
    #[error("parsing hook settings: {0}")]
    Parse(String),
    #[error(transparent)]
    Store(#[from] keel_kubehub::StoreError),
}

/// Where the settings document lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigMapRef {
    pub namespace: String,
    pub name: String,
    pub key: String,
}

impl Default for ConfigMapRef {
    fn default() -> Self {
        Self { namespace: "kubesphere-system".into(), name: "extension-upgrade-config".into(), key: "config.yaml".into() }
    }
}

impl ConfigMapRef {
    fn object_ref(&self) -> ObjectRef { ObjectRef::namespaced(ResourceKind::CONFIG_MAP, &self.namespace, &self.name) }
}

/// Settings as written by users; every field optional.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SettingsDoc {
    #[serde(default)]
    download_options: Option<FetchOptions>,
    #[serde(default)]
    extension_upgrade_hook_configs: BTreeMap<String, ExtensionUpgradeHookConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HookSettings {
    pub download_options: FetchOptions,
    pub extension_upgrade_hook_configs: BTreeMap<String, ExtensionUpgradeHookConfig>,
}

impl Default for HookSettings {
    fn default() -> Self { Self::builtin() }
}

impl HookSettings {
    pub fn builtin() -> Self {
        let configs = BUILTIN_EXTENSIONS.iter().map(|e| (e.to_string(), ExtensionUpgradeHookConfig::builtin())).collect();
        Self { download_options: FetchOptions::builtin(), extension_upgrade_hook_configs: configs }
    }

    /// Parse a YAML or JSON settings document. User entries replace the
    /// built-in entry for the same extension as a whole.
    pub fn parse(text: &str) -> Result<Self, SettingsError> {
        let tree = parse_yaml(text).map_err(|e| SettingsError::Parse(e.to_string()))?;
        let doc: SettingsDoc = serde_json::from_value(tree).map_err(|e| SettingsError::Parse(e.to_string()))?;
        let mut settings = Self::builtin();
        if let Some(opts) = doc.download_options {
            settings.download_options = opts;
        }
        settings.extension_upgrade_hook_configs.extend(doc.extension_upgrade_hook_configs);
        Ok(settings)
    }

    pub async fn try_load(store: &dyn ClusterStore, cm: &ConfigMapRef) -> Result<Self, SettingsError> {
        let r = cm.object_ref();
        let raw = store.get(&r).await?.ok_or_else(|| SettingsError::NotFound(r.to_string()))?;
        let cfg: ConfigMap = serde_json::from_value(raw).map_err(|e| SettingsError::Parse(e.to_string()))?;
        let text = cfg
            .data
            .and_then(|mut d| d.remove(&cm.key))
            .ok_or_else(|| SettingsError::MissingKey { cm: r.to_string(), key: cm.key.clone() })?;
        Self::parse(&text)
    }

    /// Settings from the ConfigMap, or the built-ins when it cannot be read.
    pub async fn load(store: &dyn ClusterStore, cm: &ConfigMapRef) -> Self {
        match Self::try_load(store, cm).await {
            Ok(settings) => {
                info!(namespace = %cm.namespace, name = %cm.name, extensions = settings.extension_upgrade_hook_configs.len(), "hook settings loaded");
                settings
            }
            Err(SettingsError::NotFound(what)) => {
                info!(configmap = %what, "no hook settings ConfigMap; using built-in defaults");
                Self::builtin()
            }
            Err(e) => {
                warn!(error = %e, "hook settings unreadable; using built-in defaults");
                Self::builtin()
            }
        }
    }

    pub fn for_extension(&self, extension: &str) -> Option<&ExtensionUpgradeHookConfig> {
        let cfg = self.extension_upgrade_hook_configs.get(extension);
        debug!(extension, found = cfg.is_some(), "hook config lookup");
        cfg
    }

    pub fn fetch_options(&self) -> &FetchOptions { &self.download_options }
}
