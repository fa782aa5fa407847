use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use ferry_api::{FerryApi, InProcApi};
use ferry_core::config::{CacheConfig, EngineConfig};
use ferry_core::{AppReconcileResult, Application, ClusterId, DiffKind};
use ferry_health::HealthRegistry;
use ferry_kubehub::{ClusterConnector, KubeConnector, MemoryConnector};
use ferry_reconcile::{DirManifestGenerator, IgnoreRules, ReconcileEngine, ReconcileRecord, ReconcileResults};
use ferry_store::CacheRegistry;
use tokio::signal;
use tracing::{error, info, warn};

mod settings;

use settings::{load_apps, load_live_dir, Settings};

const IN_CLUSTER: &str = "https://kubernetes.default.svc";

#[derive(Parser, Debug)]
#[command(name = "ferryctl", version, about = "Ferry CLI: live cluster cache and drift reconciliation")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Settings file (clusters, ignoreDifferences, resourceOverrides)
    #[arg(long = "settings", global = true, env = "FERRY_SETTINGS")]
    settings: Option<PathBuf>,

    /// Serve live state from YAML files in this directory instead of a cluster
    #[arg(long = "live-dir", global = true)]
    live_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Discover served resources (incl. CRDs)
    Discover {
        #[arg(long = "cluster", default_value = IN_CLUSTER)]
        cluster: String,
    },
    /// Server version and served api versions
    Versions {
        #[arg(long = "cluster", default_value = IN_CLUSTER)]
        cluster: String,
    },
    /// List live objects tracked by one application
    Live {
        /// Applications file
        #[arg(long = "apps")]
        apps: PathBuf,
        /// Application name
        #[arg(long = "app")]
        app: String,
    },
    /// Compute sync and health for every application
    Reconcile {
        /// Applications file
        #[arg(long = "apps")]
        apps: PathBuf,
        /// Root of rendered manifests, one directory per application
        #[arg(long = "manifests")]
        manifests: PathBuf,
        /// Write results as YAML records for later `diff-results`
        #[arg(long = "out")]
        out: Option<PathBuf>,
        /// Keep reconciling every N seconds until Ctrl-C
        #[arg(long = "every")]
        every: Option<u64>,
        /// Print per-resource verdicts
        #[arg(long = "resources", action = ArgAction::SetTrue)]
        resources: bool,
    },
    /// Compare two saved result sets
    DiffResults {
        before: PathBuf,
        after: PathBuf,
    },
}

fn init_tracing() {
    let env = std::env::var("FERRY_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("FERRY_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid FERRY_METRICS_ADDR; expected host:port");
        }
    }
}

/// Builds the façade. Offline mode answers for every cluster id the
/// applications mention, plus `extra`.
fn build_api(cli: &Cli, settings: &Settings, apps: &[Application], extra: Option<&ClusterId>, manifests: &Path) -> Result<InProcApi> {
    let connector: Arc<dyn ClusterConnector> = match &cli.live_dir {
        Some(dir) => {
            let src = load_live_dir(dir)?;
            let conn = MemoryConnector::new();
            for id in apps.iter().filter_map(Application::cluster_id).chain(extra.cloned()) {
                conn.insert(id, src.clone());
            }
            Arc::new(conn)
        }
        None => Arc::new(KubeConnector::new(settings.clusters.iter().cloned())),
    };
    let health = HealthRegistry::with_overrides(&settings.resource_overrides).map_err(|e| anyhow!("resourceOverrides: {}", e))?;
    let ignore = IgnoreRules::compile(&settings.ignore_differences).map_err(|e| anyhow!("ignoreDifferences: {}", e))?;
    let registry = Arc::new(CacheRegistry::new(connector, Arc::new(health), CacheConfig::from_env()));
    let engine = ReconcileEngine::new(registry, Arc::new(DirManifestGenerator::new(manifests)), ignore, EngineConfig::from_env());
    Ok(InProcApi::new(Arc::new(engine)))
}

fn print_json<T: serde::Serialize>(v: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(v)?);
    Ok(())
}

fn print_results(output: Output, results: &[AppReconcileResult], resources: bool) -> Result<()> {
    match output {
        Output::Json => print_json(&results),
        Output::Human => {
            println!("{:<24} {:<10} {:<12} {:>9}  CONDITIONS", "NAME", "SYNC", "HEALTH", "RESOURCES");
            for r in results {
                let conds: Vec<String> = r.conditions.iter().map(|c| format!("{:?}", c.kind)).collect();
                let conds = if conds.is_empty() { "-".to_string() } else { conds.join(",") };
                println!("{:<24} {:<10} {:<12} {:>9}  {}", r.name, r.sync.status.to_string(), r.health.as_str(), r.resources.len(), conds);
                if !resources { continue; }
                for res in &r.resources {
                    let health = res.health.as_ref().map(|h| h.status.as_str()).unwrap_or("-");
                    println!("  {:<14} {:<11} {}", format!("{:?}", res.kind), health, res.key);
                    if res.kind == DiffKind::Modified {
                        for d in &res.diffs {
                            println!("      {:?} {}", d.change, d.path);
                        }
                    }
                    if let Some(m) = &res.message {
                        println!("      {}", m);
                    }
                }
            }
            Ok(())
        }
    }
}

async fn reconcile_once(api: &InProcApi, apps: &[Application]) -> Vec<AppReconcileResult> {
    metrics::counter!("ferryctl_reconcile_rounds", 1u64);
    let mut out = Vec::with_capacity(apps.len());
    for (app, res) in apps.iter().zip(api.reconcile_all(apps).await) {
        match res {
            Ok(r) => out.push(r),
            Err(e) => {
                error!(app = %app.name, error = %e, "reconcile failed");
                eprintln!("{}: {}", app.name, e);
            }
        }
    }
    out
}

fn save_results(path: &Path, results: &[AppReconcileResult]) -> Result<()> {
    let set = ReconcileResults { applications: results.iter().map(ReconcileRecord::from).collect() };
    set.save(path)?;
    info!(path = %path.display(), apps = set.applications.len(), "results saved");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let settings = Settings::load(cli.settings.as_deref())?;
    let no_manifests = PathBuf::from(".");

    match &cli.command {
        Commands::Discover { cluster } => {
            let id = ClusterId::new(cluster.as_str());
            info!(cluster = %id, "discover invoked");
            let api = build_api(&cli, &settings, &[], Some(&id), &no_manifests)?;
            let kinds = api.discover(&id).await.map_err(|e| anyhow!("discover: {}", e))?;
            match cli.output {
                Output::Human => {
                    for r in &kinds {
                        let scope = if r.namespaced { "namespaced" } else { "cluster" };
                        let gv = if r.group.is_empty() { r.version.clone() } else { format!("{}/{}", r.group, r.version) };
                        println!("{} • {} • {}", gv, r.kind, scope);
                    }
                }
                Output::Json => print_json(&kinds)?,
            }
            api.shutdown();
        }
        Commands::Versions { cluster } => {
            let id = ClusterId::new(cluster.as_str());
            let api = build_api(&cli, &settings, &[], Some(&id), &no_manifests)?;
            let v = api.versions(&id).await.map_err(|e| anyhow!("versions: {}", e))?;
            match cli.output {
                Output::Human => {
                    println!("server: {}", v.server_version);
                    for av in &v.api_versions {
                        println!("  {}", av);
                    }
                }
                Output::Json => print_json(&v)?,
            }
            api.shutdown();
        }
        Commands::Live { apps, app } => {
            let apps = load_apps(apps)?;
            let target = apps.iter().find(|a| &a.name == app).ok_or_else(|| anyhow!("application {} not in apps file", app))?;
            let api = build_api(&cli, &settings, &apps, None, &no_manifests)?;
            let objs = api.live(target).await.map_err(|e| anyhow!("live: {}", e))?;
            match cli.output {
                Output::Human => {
                    println!("{:<12} {:<40} RV", "HEALTH", "KEY");
                    for o in &objs {
                        let health = o.health.as_ref().map(|h| h.status.as_str()).unwrap_or("-");
                        println!("{:<12} {:<40} {}", health, o.key.to_string(), o.resource_version);
                    }
                }
                Output::Json => print_json(&objs)?,
            }
            api.shutdown();
        }
        Commands::Reconcile { apps, manifests, out, every, resources } => {
            let apps = load_apps(apps)?;
            info!(apps = apps.len(), manifests = %manifests.display(), "reconcile invoked");
            let api = build_api(&cli, &settings, &apps, None, manifests)?;
            let results = reconcile_once(&api, &apps).await;
            print_results(cli.output, &results, *resources)?;
            if let Some(path) = out {
                save_results(path, &results).with_context(|| format!("saving {}", path.display()))?;
            }
            if let Some(secs) = every {
                let mut tick = tokio::time::interval(Duration::from_secs((*secs).max(1)));
                tick.tick().await;
                loop {
                    tokio::select! {
                        _ = tick.tick() => {
                            let results = reconcile_once(&api, &apps).await;
                            print_results(cli.output, &results, *resources)?;
                        }
                        _ = signal::ctrl_c() => {
                            info!("Ctrl-C received; stopping reconcile loop");
                            break;
                        }
                    }
                }
                warn!("reconcile loop ended (graceful shutdown)");
            }
            api.shutdown();
        }
        Commands::DiffResults { before, after } => {
            let a = ReconcileResults::load(before)?;
            let b = ReconcileResults::load(after)?;
            print!("{}", ferry_reconcile::diff_results(&a.applications, &b.applications));
        }
    }

    Ok(())
}
