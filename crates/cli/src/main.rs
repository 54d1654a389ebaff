#![forbid(unsafe_code)]

use std::io::Read;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use helmsync_backend::HelmCli;
use helmsync_core::{DesiredState, EngineConfig};
use helmsync_extract::{parse_report, NoLookup, ResourceLookup};
use helmsync_kubehub::KubeLookup;
use helmsync_persist::SqliteStore;
use helmsync_reconcile::{Engine, StatusPublisher};
use tracing::{info, warn};

mod output;

use output::{print_live, DirPublisher, StdoutPublisher};

#[derive(Parser, Debug)]
#[command(name = "helmsyncctl", version, about = "Reconcile chart requests against helm releases")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Namespace releases are installed into
    #[arg(long = "namespace", global = true, env = "HELMSYNC_NAMESPACE")]
    namespace: Option<String>,

    /// State database path
    #[arg(long = "db", global = true, env = "HELMSYNC_DB_PATH")]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one reconciliation pass for the given chart requests
    Reconcile {
        /// YAML or JSON file mapping consumer -> [{name, repo}]
        #[arg(long = "requests")]
        requests: PathBuf,
        /// Write one <consumer>.json per consumer instead of printing
        #[arg(long = "publish-dir")]
        publish_dir: Option<PathBuf>,
    },
    /// Refresh and publish release status without changing requests
    Status {
        /// Consumers to refresh (default: every consumer in the stored state)
        #[arg(long = "consumer")]
        consumers: Vec<String>,
        #[arg(long = "publish-dir")]
        publish_dir: Option<PathBuf>,
    },
    /// Print the stored live state without contacting helm
    Show,
    /// Parse a `==>` resource report and print (type, name) pairs
    Extract {
        /// Report file (default: stdin)
        #[arg(long = "file")]
        file: Option<PathBuf>,
    },
}

fn init_tracing() {
    let env = std::env::var("HELMSYNC_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("HELMSYNC_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid HELMSYNC_METRICS_ADDR; expected host:port");
        }
    }
}

/// Parse a consumer -> chart requests mapping. serde_yaml accepts JSON too.
fn parse_requests(text: &str) -> Result<DesiredState> {
    if text.trim().is_empty() {
        return Ok(DesiredState::new());
    }
    serde_yaml::from_str(text).context("parsing chart requests")
}

fn load_requests(path: &Path) -> Result<DesiredState> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    parse_requests(&text)
}

fn engine_config(cli: &Cli) -> EngineConfig {
    let mut cfg = EngineConfig::from_env();
    if let Some(ns) = cli.namespace.as_deref().filter(|s| !s.is_empty()) {
        cfg.namespace = ns.to_string();
    }
    if let Some(db) = &cli.db {
        cfg.db_path = db.clone();
    }
    cfg
}

async fn resource_lookup(cfg: &EngineConfig) -> Arc<dyn ResourceLookup> {
    match KubeLookup::connect(cfg.kube_context.as_deref()).await {
        Ok(lookup) => Arc::new(lookup),
        Err(e) => {
            warn!(error = %format!("{e:#}"), "cluster unreachable; releases will carry no resources");
            Arc::new(NoLookup)
        }
    }
}

fn publisher(output: Output, publish_dir: Option<PathBuf>) -> Arc<dyn StatusPublisher> {
    match publish_dir {
        Some(dir) => Arc::new(DirPublisher::new(dir)),
        None => Arc::new(StdoutPublisher { output }),
    }
}

async fn build_engine(cfg: &EngineConfig, publisher: Arc<dyn StatusPublisher>) -> Result<Engine> {
    let store = SqliteStore::open(&cfg.db_path).with_context(|| format!("opening {}", cfg.db_path.display()))?;
    let backend = HelmCli::from_config(cfg);
    let lookup = resource_lookup(cfg).await;
    Ok(Engine::new(cfg, Arc::new(backend), lookup, Arc::new(store), publisher))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let cfg = engine_config(&cli);

    match cli.command {
        Commands::Reconcile { ref requests, ref publish_dir } => {
            let desired = load_requests(requests)?;
            info!(consumers = desired.len(), ns = %cfg.namespace, "reconcile invoked");
            let engine = build_engine(&cfg, publisher(cli.output, publish_dir.clone())).await?;
            engine.run_pass(&desired).await?;
        }
        Commands::Status { ref consumers, ref publish_dir } => {
            let engine = build_engine(&cfg, publisher(cli.output, publish_dir.clone())).await?;
            let subscribers = if consumers.is_empty() {
                engine.load_live()?.into_keys().collect()
            } else {
                consumers.clone()
            };
            info!(subscribers = subscribers.len(), "status invoked");
            engine.refresh_subscribers(&subscribers).await?;
        }
        Commands::Show => {
            let store = SqliteStore::open(&cfg.db_path).with_context(|| format!("opening {}", cfg.db_path.display()))?;
            let live: helmsync_core::LiveState = helmsync_persist::get_or_default(&store, &cfg.state_key)?;
            print_live(cli.output, &live)?;
        }
        Commands::Extract { ref file } => {
            let report = match file {
                Some(path) => std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?,
                None => {
                    let mut buf = String::new();
                    std::io::stdin().read_to_string(&mut buf).context("reading stdin")?;
                    buf
                }
            };
            let keys = parse_report(&report);
            match cli.output {
                Output::Human => {
                    println!("{:<24} NAME", "TYPE");
                    for k in &keys {
                        println!("{:<24} {}", k.kind, k.name);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&keys)?),
            }
        }
    }

    Ok(())
}
