//! `devops` crossing 1.2.4: the 1.2.4 chart takes over IAM objects that older
//! releases created outside Helm, so they get the release annotation Helm
//! checks before adopting them.

use keel_core::ExtensionUpgradeHookConfig;
use keel_kubehub::{annotate, ObjectRef, ResourceKind};
use metrics::counter;
use tracing::{debug, info};

use crate::{plan_crossing, HookContext, HookError, MigrationHook};

pub const EXTENSION: &str = "devops";
const THRESHOLD: &str = "1.2.4";
const RELEASE_ANNOTATION: &str = "meta.helm.sh/release-name";

const ADOPTED: &[(ResourceKind, &[&str])] = &[
    (ResourceKind::GLOBAL_ROLE, &["devops-anonymous", "devops-authenticated"]),
    (ResourceKind::GLOBAL_ROLE_BINDING, &["devops-anonymous", "devops-authenticated"]),
    (ResourceKind::ROLE_TEMPLATE, &["workspace-view-devops", "workspace-create-devops", "workspace-manage-devops"]),
];

#[derive(Debug, Clone, Copy, Default)]
pub struct DevopsHook;

#[async_trait::async_trait]
impl MigrationHook for DevopsHook {
    fn name(&self) -> &str { EXTENSION }

    async fn run(&self, ctx: &HookContext<'_>, _config: &ExtensionUpgradeHookConfig) -> Result<(), HookError> {
        if plan_crossing(ctx.store, EXTENSION, THRESHOLD).await?.is_none() {
            return Ok(());
        }
        let mut updated = 0u64;
        for (kind, names) in ADOPTED {
            for name in names.iter() {
                let r = ObjectRef::cluster(*kind, *name);
                let Some(mut obj) = ctx.store.get(&r).await? else {
                    debug!(object = %r, "not present; skipping");
                    continue;
                };
                if !annotate(&mut obj, RELEASE_ANNOTATION, EXTENSION) {
                    continue;
                }
                ctx.store.update(&r, &obj).await?;
                updated += 1;
            }
        }
        counter!("devops_objects_annotated", updated);
        info!(updated, "IAM objects annotated for release {}", EXTENSION);
        Ok(())
    }
}
