use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use keel_core::{Action, DeploymentRole};
use keel_fetch::ArtifactResolver;
use keel_hooks::HookRegistry;
use keel_kubehub::{ClusterStore, KubeStore};
use keel_upgrade::{ConfigMapRef, HookSettings, RunRequest, UpgradeOrchestrator};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "keel-hook", version, about = "Run one extension install/upgrade transition")]
struct Cli {
    /// Lifecycle action: install, upgrade or uninstall
    #[arg(long, env = "HOOK_ACTION")]
    action: Action,

    /// Helm release name; `<ext>-agent` selects the agent role
    #[arg(long, env = "RELEASE_NAME")]
    release_name: String,

    /// Package locator: local path, http(s):// or oci:// URL
    #[arg(long, env = "CHART_PATH")]
    chart_path: String,

    /// Deployment role override: extension or agent
    #[arg(long, env = "INSTALL_TAG")]
    install_tag: Option<DeploymentRole>,

    /// Values file layered over the package defaults
    #[arg(long, env = "HOOK_VALUES_FILE")]
    values_file: Option<PathBuf>,

    #[arg(long, env = "HOOK_CONFIG_CM_NAMESPACE", default_value = "kubesphere-system")]
    config_namespace: String,

    #[arg(long, env = "HOOK_CONFIG_CM_NAME", default_value = "extension-upgrade-config")]
    config_name: String,

    #[arg(long, env = "HOOK_CONFIG_CM_KEY", default_value = "config.yaml")]
    config_key: String,

    /// Deadline for the whole run, in seconds
    #[arg(long, env = "HOOK_TIMEOUT_SECS", default_value_t = 300)]
    timeout_secs: u64,
}

fn init_tracing() {
    let env = std::env::var("KEEL_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KEEL_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid KEEL_METRICS_ADDR; expected host:port");
        }
    }
}

struct Job {
    orchestrator: UpgradeOrchestrator,
    request: RunRequest,
    deadline: Duration,
}

async fn prepare(cli: Cli) -> Result<Job> {
    let overlay = match &cli.values_file {
        Some(path) => Some(tokio::fs::read_to_string(path).await.with_context(|| format!("reading values file {}", path.display()))?),
        None => None,
    };
    let store: Arc<dyn ClusterStore> = Arc::new(KubeStore::try_default().await.context("connecting to cluster")?);
    let cm = ConfigMapRef { namespace: cli.config_namespace, name: cli.config_name, key: cli.config_key };
    let settings = HookSettings::load(store.as_ref(), &cm).await;
    let resolver = ArtifactResolver::new(settings.fetch_options()).context("building artifact resolver")?;
    let hooks = HookRegistry::builtin().context("registering migration hooks")?;
    info!(hooks = ?hooks.names().collect::<Vec<_>>(), "migration hooks registered");

    let request = RunRequest {
        action: cli.action,
        release_name: cli.release_name,
        role: cli.install_tag,
        package_locator: cli.chart_path,
        overlay,
    };
    Ok(Job { orchestrator: UpgradeOrchestrator::new(store, resolver, hooks, settings), request, deadline: Duration::from_secs(cli.timeout_secs) })
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let job = match prepare(cli).await {
        Ok(job) => job,
        Err(e) => {
            error!(error = ?e, "startup failed");
            eprintln!("keel-hook: {:#}", e);
            return ExitCode::from(2);
        }
    };
    match job.orchestrator.run_with_deadline(&job.request, job.deadline).await {
        Ok(report) => {
            match serde_json::to_string(&report) {
                Ok(json) => println!("{}", json),
                Err(e) => error!(error = %e, "failed to render run report"),
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, release = %job.request.release_name, "run failed");
            eprintln!("keel-hook: {}", e);
            ExitCode::from(1)
        }
    }
}
