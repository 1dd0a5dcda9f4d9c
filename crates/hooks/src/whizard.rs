//! `whizard-monitoring` crossing 1.2.0.
//!
//! Two steps:
//! 1. Rewrite the stored instance config so the new chart's image tags take
//!    effect (pinned tags still equal to the old chart defaults are dropped)
//!    and carry the renamed helper sub-chart's values over. Best effort.
//! 2. When the instance runs the whizard gateway, install the
//!    `whizard-monitoring-pro` companion pointed at the same gateway.

use keel_core::{lookup, parse_yaml, remove_at, to_yaml, ExtensionUpgradeHookConfig, PathLookup};
use keel_kubehub::{ClusterStore, Extension, InstallPlan, StoreError};
use metrics::counter;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::{package_for_version, plan_crossing, HookContext, HookError, MigrationHook};

pub const EXTENSION: &str = "whizard-monitoring";
pub const COMPANION: &str = "whizard-monitoring-pro";
const THRESHOLD: &str = "1.2.0";

/// Dynamic option that turns the companion install off.
pub const INSTALL_COMPANION_OPTION: &str = "installWhizardMonitoringPro";
pub const CREATOR: &str = "wiztelemetry-upgrade";

/// Image tags shipped as defaults before 1.2.0.
const STALE_IMAGE_TAGS: &[(&str, &str)] = &[
    ("kube-prometheus-stack.prometheus.prometheusSpec.image.tag", "v2.51.2"),
    ("kube-prometheus-stack.prometheusOperator.image.tag", "v0.75.1"),
    ("kube-prometheus-stack.prometheusOperator.admissionWebhooks.patch.image.tag", "v20221220-controller-v1.5.1-58-g787ea74b6"),
    ("kube-prometheus-stack.prometheusOperator.prometheusConfigReloader.image.tag", "v0.75.1"),
    ("kube-prometheus-stack.kube-state-metrics.image.tag", "v2.12.0"),
    ("kube-prometheus-stack.kube-state-metrics.kubeRBACProxy.image.tag", "v0.18.0"),
    ("kube-prometheus-stack.prometheus-node-exporter.image.tag", "v1.8.1"),
    ("kube-prometheus-stack.prometheus-node-exporter.kubeRBACProxy.image.tag", "v0.18.0"),
];

const OLD_HELPER: &str = "whizard-monitoring-helper";
const NEW_HELPER: &str = "wiztelemetry-monitoring-helper";
const GATEWAY_URL: &str = "whizard-agent-proxy.config.gatewayUrl";

#[derive(Debug, Clone, Copy, Default)]
pub struct WhizardMonitoringHook;

#[async_trait::async_trait]
impl MigrationHook for WhizardMonitoringHook {
    fn name(&self) -> &str { EXTENSION }

    async fn run(&self, ctx: &HookContext<'_>, config: &ExtensionUpgradeHookConfig) -> Result<(), HookError> {
        let Some(mut plan) = plan_crossing(ctx.store, EXTENSION, THRESHOLD).await? else {
            return Ok(());
        };
        match rewrite_instance_config(ctx.store, &plan).await {
            Ok(Some(patched)) => plan = patched,
            Ok(None) => {}
            Err(e) => warn!(error = %e, "instance config rewrite failed; continuing"),
        }
        if !config.flag(INSTALL_COMPANION_OPTION, true) {
            info!(option = INSTALL_COMPANION_OPTION, "companion install disabled");
            return Ok(());
        }
        install_companion(ctx, &plan).await
    }
}

/// Instance config with stale pinned tags removed and the helper values
/// copied under the new sub-chart name. `None` when nothing changes.
pub fn upgraded_config(text: &str) -> Result<Option<String>, HookError> {
    let mut values = parse_yaml(text).map_err(|e| HookError::Config(e.to_string()))?;
    let mut changed = false;
    for (path, stale) in STALE_IMAGE_TAGS {
        if lookup(&values, path).as_str() == Some(*stale) {
            remove_at(&mut values, path);
            changed = true;
        }
    }
    // an existing new-name entry is left as the user wrote it
    let helper = match (lookup(&values, OLD_HELPER), lookup(&values, NEW_HELPER)) {
        (PathLookup::Found(helper), PathLookup::NotFound) => Some(helper.clone()),
        _ => None,
    };
    if let (Some(helper), Value::Object(root)) = (helper, &mut values) {
        root.insert(NEW_HELPER.into(), helper);
        changed = true;
    }
    if !changed {
        return Ok(None);
    }
    to_yaml(&values).map(Some).map_err(|e| HookError::Config(e.to_string()))
}

async fn rewrite_instance_config(store: &dyn ClusterStore, plan: &InstallPlan) -> Result<Option<InstallPlan>, HookError> {
    let Some(text) = upgraded_config(plan.config())? else {
        return Ok(None);
    };
    let patch = json!({ "spec": { "config": text } });
    let patched = store.patch(&InstallPlan::object_ref(plan.name()), &patch).await?;
    counter!("whizard_config_rewrites", 1u64);
    info!(plan = plan.name(), "instance config rewritten for new image defaults");
    Ok(Some(InstallPlan::from_raw(patched)))
}

/// Gateway URL when both the gateway and the agent proxy are enabled.
fn gateway_url(config: &str) -> Result<Option<Value>, HookError> {
    let values = parse_yaml(config).map_err(|e| HookError::Config(e.to_string()))?;
    let enabled = |path: &str| lookup(&values, path).as_bool().unwrap_or(false);
    if !(enabled("whizard.enabled") && enabled("whizardAgentProxy.enabled")) {
        return Ok(None);
    }
    match lookup(&values, GATEWAY_URL) {
        PathLookup::Found(url) => Ok(Some(url.clone())),
        _ => Err(HookError::Config(format!("{} is not set", GATEWAY_URL))),
    }
}

async fn install_companion(ctx: &HookContext<'_>, plan: &InstallPlan) -> Result<(), HookError> {
    let Some(url) = gateway_url(plan.config())? else {
        info!("whizard gateway or agent proxy not enabled; skipping {}", COMPANION);
        return Ok(());
    };
    let raw = ctx
        .store
        .get(&Extension::object_ref(COMPANION))
        .await?
        .ok_or_else(|| StoreError::NotFound(Extension::object_ref(COMPANION).to_string()))?;
    let companion = Extension::from_raw(raw);
    let version = companion.recommended_version();
    if !companion.state().is_empty() || version.is_empty() {
        info!(state = companion.state(), recommended = version, "{} already handled; skipping", COMPANION);
        return Ok(());
    }

    let pkg = package_for_version(ctx.store, ctx.resolver, COMPANION, version).await?;
    let mut defaults = pkg.defaults;
    if let Value::Object(root) = &mut defaults {
        root.insert("whizard-agent-proxy".into(), json!({ "config": { "gatewayUrl": url } }));
    }
    let config = to_yaml(&defaults).map_err(|e| HookError::Config(e.to_string()))?;

    let mut companion_plan = InstallPlan::new(COMPANION, version, &config);
    companion_plan.set_annotation(InstallPlan::CREATOR_ANNOTATION, CREATOR);
    if let Some(scheduling) = plan.cluster_scheduling() {
        companion_plan.set_cluster_scheduling(scheduling.clone());
    }
    match ctx.store.create(&InstallPlan::object_ref(COMPANION), companion_plan.raw()).await {
        Ok(_) => {
            counter!("whizard_companion_installs", 1u64);
            info!(extension = COMPANION, version, "companion InstallPlan created");
            Ok(())
        }
        Err(StoreError::AlreadyExists(_)) => {
            info!(extension = COMPANION, "companion InstallPlan already exists");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}
