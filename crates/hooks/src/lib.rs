//! Keel hooks: version-gated migrations keyed by extension name.
//!
//! Hooks are registered once at startup into a [`HookRegistry`]; the
//! orchestrator looks up at most one hook per run. Every hook is idempotent:
//! it decides from the InstallPlan's observed and desired versions whether a
//! threshold is being crossed and does nothing otherwise.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use keel_core::{ExtensionUpgradeHookConfig, VersionError, VersionGate};
use keel_fetch::ArtifactResolver;
use keel_kubehub::{ClusterStore, InstallPlan, StoreError};
use tracing::{debug, info};

pub mod devops;
pub mod source;
pub mod whizard;

pub use devops::DevopsHook;
pub use source::{package_for_version, PackageSourceError};
pub use whizard::WhizardMonitoringHook;

#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Version(#[from] VersionError),
    #[error(transparent)]
    Source(#[from] PackageSourceError),
    #[error("invalid config: {0}")]
    Config(String),
}

/// What a hook gets to work with.
pub struct HookContext<'a> {
    pub extension: &'a str,
    pub store: &'a dyn ClusterStore,
    pub resolver: &'a ArtifactResolver,
}

#[async_trait::async_trait]
pub trait MigrationHook: Send + Sync {
    /// Extension this hook belongs to; also its registry key.
    fn name(&self) -> &str;

    async fn run(&self, ctx: &HookContext<'_>, config: &ExtensionUpgradeHookConfig) -> Result<(), HookError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("migration hook {0:?} registered twice")]
    Duplicate(String),
}

/// Immutable name → hook table.
pub struct HookRegistry {
    hooks: BTreeMap<String, Box<dyn MigrationHook>>,
}

impl HookRegistry {
    pub fn builder() -> HookRegistryBuilder { HookRegistryBuilder::default() }

    /// Registry with the hooks shipped in this crate.
    pub fn builtin() -> Result<Self, RegistryError> {
        Self::builder().register(WhizardMonitoringHook).register(DevopsHook).build()
    }

    pub fn lookup(&self, name: &str) -> Option<&dyn MigrationHook> { self.hooks.get(name).map(|h| h.as_ref()) }

    pub fn names(&self) -> impl Iterator<Item = &str> { self.hooks.keys().map(String::as_str) }

    pub fn len(&self) -> usize { self.hooks.len() }

    pub fn is_empty(&self) -> bool { self.hooks.is_empty() }
}

#[derive(Default)]
pub struct HookRegistryBuilder {
    hooks: Vec<Box<dyn MigrationHook>>,
}

impl HookRegistryBuilder {
    pub fn register(mut self, hook: impl MigrationHook + 'static) -> Self {
        self.hooks.push(Box::new(hook));
        self
    }

    pub fn build(self) -> Result<HookRegistry, RegistryError> {
        let mut hooks = BTreeMap::new();
        for hook in self.hooks {
            let name = hook.name().to_string();
            if hooks.contains_key(&name) {
                return Err(RegistryError::Duplicate(name));
            }
            hooks.insert(name, hook);
        }
        debug!(count = hooks.len(), "hook registry built");
        Ok(HookRegistry { hooks })
    }
}

/// InstallPlan named after `extension`, if any.
pub async fn load_install_plan(store: &dyn ClusterStore, extension: &str) -> Result<Option<InstallPlan>, StoreError> {
    Ok(store.get(&InstallPlan::object_ref(extension)).await?.map(InstallPlan::from_raw))
}

/// Load the extension's InstallPlan and check whether it crosses `threshold`.
/// `None` means there is nothing to migrate.
pub(crate) async fn plan_crossing(store: &dyn ClusterStore, extension: &str, threshold: &str) -> Result<Option<InstallPlan>, HookError> {
    let Some(plan) = load_install_plan(store, extension).await? else {
        info!(extension, "no InstallPlan; nothing to migrate");
        return Ok(None);
    };
    let gate = VersionGate::at(threshold)?;
    let crossed = gate.crossed_by(plan.observed_version(), plan.desired_version())?;
    info!(
        extension,
        observed = plan.observed_version(),
        desired = plan.desired_version(),
        threshold,
        crossed,
        "version gate"
    );
    Ok(crossed.then_some(plan))
}
