//! Keel upgrade: one extension lifecycle transition per run.
//!
//! Phases run in order and each is gated by the extension's hook config:
//! CRD sync (install/upgrade), instance config merge (extension role,
//! version change) and finally the registered migration hook. Structural
//! failures always abort the run; only hook failures follow the configured
//! [`FailurePolicy`].

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use keel_apply::{SyncError, SyncReport};
use keel_chart::{merge, LoadError, MergeError, PackageDescriptor};
use keel_core::{Action, DeploymentRole, ExtensionUpgradeHookConfig, FailurePolicy};
use keel_fetch::{ArtifactResolver, FetchError};
use keel_hooks::{load_install_plan, package_for_version, HookContext, HookError, HookRegistry, PackageSourceError};
use keel_kubehub::{ClusterStore, InstallPlan, StoreError};
use metrics::{counter, histogram};
use serde::Serialize;
use tracing::{debug, error, info, warn};

pub mod settings;

pub use settings::{ConfigMapRef, HookSettings, SettingsError};

#[derive(Debug, thiserror::Error)]
pub enum UpgradeError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error(transparent)]
    Merge(#[from] MergeError),
    #[error("InstallPlan changed concurrently: {0}")]
    RecordConflict(String),
    #[error(transparent)]
    Store(StoreError),
    #[error(transparent)]
    Source(PackageSourceError),
    #[error("migration hook {extension} failed: {source}")]
    HookFailed { extension: String, source: HookError },
    #[error("run exceeded its deadline of {0:?}")]
    DeadlineExceeded(Duration),
}

impl From<StoreError> for UpgradeError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Conflict(m) => UpgradeError::RecordConflict(m),
            other => UpgradeError::Store(other),
        }
    }
}

impl From<PackageSourceError> for UpgradeError {
    fn from(e: PackageSourceError) -> Self {
        match e {
            PackageSourceError::Fetch(e) => UpgradeError::Fetch(e),
            PackageSourceError::Load(e) => UpgradeError::Load(e),
            PackageSourceError::Store(e) => e.into(),
            other => UpgradeError::Source(other),
        }
    }
}

/// One invocation of the hook job.
#[derive(Debug, Clone, PartialEq)]
pub struct RunRequest {
    pub action: Action,
    /// Helm release; `<ext>-agent` names the agent release of `<ext>`.
    pub release_name: String,
    /// Overrides the role implied by the release name.
    pub role: Option<DeploymentRole>,
    /// Package being installed, as an artifact locator.
    pub package_locator: String,
    /// Values layered over the package defaults.
    pub overlay: Option<String>,
}

impl RunRequest {
    pub fn new(action: Action, release_name: impl Into<String>, package_locator: impl Into<String>) -> Self {
        Self { action, release_name: release_name.into(), role: None, package_locator: package_locator.into(), overlay: None }
    }

    /// Extension name and effective role.
    pub fn target(&self) -> (String, DeploymentRole) {
        let (extension, implied) = DeploymentRole::from_release(&self.release_name);
        (extension, self.role.unwrap_or(implied))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "error", rename_all = "snake_case")]
pub enum HookOutcome {
    /// Hook phase not reached (run disabled).
    #[default]
    Skipped,
    NotRegistered,
    Succeeded,
    /// Hook failed under `IgnoreError`.
    Ignored(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub extension: String,
    pub role: DeploymentRole,
    pub action: Action,
    /// No enabled hook config for the extension; nothing ran.
    pub disabled: bool,
    pub crds: Option<SyncReport>,
    pub config_merged: bool,
    pub hook: HookOutcome,
}

impl RunReport {
    fn new(extension: &str, role: DeploymentRole, action: Action) -> Self {
        Self { extension: extension.to_string(), role, action, disabled: false, crds: None, config_merged: false, hook: HookOutcome::Skipped }
    }
}

fn wants_crds(action: Action, cfg: &ExtensionUpgradeHookConfig) -> bool {
    match action {
        Action::Install => cfg.install_crds,
        Action::Upgrade => cfg.upgrade_crds,
        Action::Uninstall => false,
    }
}

pub struct UpgradeOrchestrator {
    store: Arc<dyn ClusterStore>,
    resolver: ArtifactResolver,
    hooks: HookRegistry,
    settings: HookSettings,
}

impl UpgradeOrchestrator {
    pub fn new(store: Arc<dyn ClusterStore>, resolver: ArtifactResolver, hooks: HookRegistry, settings: HookSettings) -> Self {
        Self { store, resolver, hooks, settings }
    }

    pub fn settings(&self) -> &HookSettings { &self.settings }

    /// [`run`](Self::run) bounded by `deadline`; in-flight calls are dropped when it passes.
    pub async fn run_with_deadline(&self, req: &RunRequest, deadline: Duration) -> Result<RunReport, UpgradeError> {
        match tokio::time::timeout(deadline, self.run(req)).await {
            Ok(res) => res,
            Err(_) => {
                counter!("upgrade_run_deadline_exceeded", 1u64);
                error!(release = %req.release_name, ?deadline, "run deadline exceeded");
                Err(UpgradeError::DeadlineExceeded(deadline))
            }
        }
    }

    pub async fn run(&self, req: &RunRequest) -> Result<RunReport, UpgradeError> {
        let t0 = Instant::now();
        let (extension, role) = req.target();
        let mut report = RunReport::new(&extension, role, req.action);
        info!(extension = %extension, role = %role, action = %req.action, "run started");

        let Some(cfg) = self.settings.for_extension(&extension).filter(|c| c.enabled) else {
            info!(extension = %extension, "no enabled hook config; skipping run");
            report.disabled = true;
            return Ok(report);
        };

        if wants_crds(req.action, cfg) {
            report.crds = Some(self.sync_crds(req, role).await?);
        }
        if role == DeploymentRole::Extension && req.action == Action::Upgrade && cfg.merge_values {
            report.config_merged = self.merge_config(&extension).await?;
        }
        report.hook = self.dispatch_hook(&extension, cfg).await?;

        histogram!("upgrade_run_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        info!(extension = %extension, took_ms = %t0.elapsed().as_millis(), "run finished");
        Ok(report)
    }

    async fn sync_crds(&self, req: &RunRequest, role: DeploymentRole) -> Result<SyncReport, UpgradeError> {
        info!(locator = %req.package_locator, tag = role.tag(), "syncing CRDs before {}", req.action);
        let bytes = self.resolver.resolve(&req.package_locator).await?;
        let pkg = PackageDescriptor::load(&bytes, req.overlay.as_deref())?;
        let report = keel_apply::sync(self.store.as_ref(), &pkg, Some(role.tag())).await?;
        info!(applied = report.applied.len(), unchanged = report.unchanged(), "CRDs synced");
        Ok(report)
    }

    /// Merge the stored instance config into the target version's defaults
    /// and write it back with a resourceVersion-checked update.
    async fn merge_config(&self, extension: &str) -> Result<bool, UpgradeError> {
        let store = self.store.as_ref();
        let Some(mut plan) = load_install_plan(store, extension).await? else {
            info!(extension, "no InstallPlan; skipping config merge");
            return Ok(false);
        };
        if !plan.is_version_change() {
            debug!(extension, version = plan.desired_version(), "version unchanged; skipping config merge");
            return Ok(false);
        }
        info!(extension, from = plan.observed_version(), to = plan.desired_version(), "merging instance config");
        let target = package_for_version(store, &self.resolver, extension, plan.desired_version()).await?;
        let merged = merge(plan.config(), &target)?;
        if merged == plan.config() {
            debug!(extension, "merged config identical; no update");
            return Ok(false);
        }
        plan.set_config(merged);
        store.update(&InstallPlan::object_ref(extension), plan.raw()).await?;
        counter!("upgrade_config_merges", 1u64);
        info!(extension, "instance config updated");
        Ok(true)
    }

    async fn dispatch_hook(&self, extension: &str, cfg: &ExtensionUpgradeHookConfig) -> Result<HookOutcome, UpgradeError> {
        let Some(hook) = self.hooks.lookup(extension) else {
            debug!(extension, "no migration hook registered");
            return Ok(HookOutcome::NotRegistered);
        };
        info!(hook = hook.name(), "running migration hook");
        let ctx = HookContext { extension, store: self.store.as_ref(), resolver: &self.resolver };
        match hook.run(&ctx, cfg).await {
            Ok(()) => {
                counter!("hook_run_ok", 1u64);
                Ok(HookOutcome::Succeeded)
            }
            Err(e) => {
                counter!("hook_run_err", 1u64);
                match cfg.failure_policy {
                    FailurePolicy::FailOnError => Err(UpgradeError::HookFailed { extension: extension.to_string(), source: e }),
                    FailurePolicy::IgnoreError => {
                        warn!(hook = hook.name(), error = %e, "migration hook failed; ignored by failure policy");
                        Ok(HookOutcome::Ignored(e.to_string()))
                    }
                }
            }
        }
    }
}
