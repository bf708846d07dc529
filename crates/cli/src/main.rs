use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use mirra_core::{meta_namespace_key, HandlerFns, Indexers, MirrorConfig, Resource};
use mirra_kubehub::{label_index, KubeListWatch, KubeObject};
use mirra_store::Controller;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "mirractl", version, about = "Mirror one Kubernetes GVK into an indexed cache")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubernetes namespace (default: all namespaces)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Mirror a GVK and print +/~/- lines until Ctrl-C
    Watch {
        /// GVK key, e.g. "v1/ConfigMap" or "cert-manager.io/v1/Certificate"
        gvk: String,
        /// Periodic relist interval in seconds (0 disables)
        #[arg(long = "resync-secs", env = "MIRRA_RESYNC_SECS")]
        resync_secs: Option<u64>,
    },
    /// Mirror a GVK until synced and print the cache
    Ls {
        /// GVK key, e.g. "v1/ConfigMap" or "cert-manager.io/v1/Certificate"
        gvk: String,
        /// Index the cache by this label key
        #[arg(long = "label-index", requires = "label")]
        label_index: Option<String>,
        /// Only print objects whose indexed label has this value
        #[arg(long = "label", requires = "label_index")]
        label: Option<String>,
    },
}

fn init_tracing() {
    let env = std::env::var("MIRRA_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("MIRRA_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid MIRRA_METRICS_ADDR; expected host:port");
        }
    }
}

#[derive(serde::Serialize)]
struct Line<'a> {
    event: &'a str,
    key: String,
    rv: &'a str,
}

fn print_event(output: Output, sign: char, event: &str, obj: &KubeObject) {
    let key = meta_namespace_key(obj).unwrap_or_else(|_| "<unnamed>".to_string());
    let rv = obj.resource_version().unwrap_or("");
    match output {
        Output::Human => println!("{} {} (rv {})", sign, key, rv),
        Output::Json => match serde_json::to_string(&Line { event, key, rv }) {
            Ok(s) => println!("{}", s),
            Err(e) => warn!(error = %e, "failed to encode event line"),
        },
    }
}

fn printing_handler(output: Output) -> HandlerFns<KubeObject> {
    HandlerFns::new()
        .with_add(move |o: &KubeObject| print_event(output, '+', "add", o))
        .with_update(move |_old: &KubeObject, new: &KubeObject| print_event(output, '~', "update", new))
        .with_delete(move |o: &KubeObject| print_event(output, '-', "delete", o))
}

async fn run_watch(output: Output, gvk: &str, ns: Option<&str>, resync_secs: Option<u64>) -> Result<()> {
    let mut config = MirrorConfig::from_env();
    if let Some(secs) = resync_secs {
        config = config.with_resync_period(Some(Duration::from_secs(secs)));
    }
    let lw = Arc::new(KubeListWatch::for_gvk(gvk, ns).await?);
    let cache = Arc::new(mirra_store::Cache::with_indexers(Indexers::new()));
    let controller = Controller::new(config, lw, Arc::new(printing_handler(output)), cache);

    let cancel = CancellationToken::new();
    let ctrl_c = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if signal::ctrl_c().await.is_ok() {
                info!("Ctrl-C received; draining queued deltas");
            }
            cancel.cancel();
        }
    });

    let res = controller.run(cancel).await;
    ctrl_c.abort();
    match &res {
        Ok(()) => info!(items = controller.cache().len(), rv = %controller.last_sync_resource_version(), "watch ended"),
        Err(e) => error!(error = %e, "watch aborted"),
    }
    res.context("mirror loop failed")
}

#[derive(serde::Serialize)]
struct Row<'a> {
    namespace: Option<&'a str>,
    name: &'a str,
    resource_version: Option<&'a str>,
    created: Option<DateTime<Utc>>,
}

async fn run_ls(output: Output, gvk: &str, ns: Option<&str>, label_index_key: Option<&str>, label: Option<&str>) -> Result<()> {
    let mut indexers = Indexers::new();
    if let Some(k) = label_index_key {
        indexers.insert(k.to_string(), label_index(k));
    }
    let lw = Arc::new(KubeListWatch::for_gvk(gvk, ns).await?);
    let cache = Arc::new(mirra_store::Cache::with_indexers(indexers));
    let controller = Arc::new(Controller::new(MirrorConfig::from_env(), lw, Arc::new(HandlerFns::new()), Arc::clone(&cache)));

    let cancel = CancellationToken::new();
    let task = tokio::spawn({
        let controller = Arc::clone(&controller);
        let cancel = cancel.clone();
        async move { controller.run(cancel).await }
    });

    let wait_secs = std::env::var("MIRRA_WAIT_SECS").ok().and_then(|s| s.parse::<u64>().ok()).unwrap_or(8);
    let deadline = Instant::now() + Duration::from_secs(wait_secs);
    while !controller.has_synced() {
        if task.is_finished() || Instant::now() >= deadline {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    if !controller.has_synced() {
        warn!(wait_secs, "cache not synced; printing partial contents");
    }

    let mut items = match (label_index_key, label) {
        (Some(k), Some(v)) => cache.by_index(k, v)?,
        _ => cache.list(),
    };
    items.sort_by(|a, b| a.namespace().cmp(&b.namespace()).then(a.name().cmp(&b.name())));

    match output {
        Output::Human => {
            println!("{:<20} {:<40} {}", "NAMESPACE", "NAME", "AGE");
            for o in items.iter() {
                let created = o.metadata.creation_timestamp.as_ref().map(|t| t.0);
                println!("{:<20} {:<40} {}", o.namespace().unwrap_or("-"), o.name().unwrap_or(""), render_age(created));
            }
        }
        Output::Json => {
            let rows: Vec<_> = items
                .iter()
                .map(|o| Row {
                    namespace: o.namespace(),
                    name: o.name().unwrap_or(""),
                    resource_version: o.resource_version(),
                    created: o.metadata.creation_timestamp.as_ref().map(|t| t.0),
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
    }

    cancel.cancel();
    match task.await {
        Ok(res) => res.context("mirror loop failed"),
        Err(e) => Err(anyhow!("mirror task panicked: {}", e)),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let ns = cli.namespace.as_deref();

    match cli.command {
        Commands::Watch { gvk, resync_secs } => {
            info!(gvk = %gvk, ns = ?ns, "watch invoked");
            run_watch(cli.output, &gvk, ns, resync_secs).await
        }
        Commands::Ls { gvk, label_index, label } => {
            info!(gvk = %gvk, ns = ?ns, "ls invoked");
            run_ls(cli.output, &gvk, ns, label_index.as_deref(), label.as_deref()).await
        }
    }
}

fn render_age(created: Option<DateTime<Utc>>) -> String {
    let Some(created) = created else { return "-".to_string() };
    let mut secs = (Utc::now() - created).num_seconds().max(0);
    let days = secs / 86_400; secs %= 86_400;
    let hours = secs / 3600; secs %= 3600;
    let mins = secs / 60; secs %= 60;
    if days > 0 { format!("{}d{}h", days, hours) }
    else if hours > 0 { format!("{}h{}m", hours, mins) }
    else if mins > 0 { format!("{}m", mins) }
    else { format!("{}s", secs) }
}
