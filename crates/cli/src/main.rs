use std::str::FromStr;
use std::time::Instant;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::core::DynamicObject;
use kube::{Client, CustomResourceExt, ResourceExt};
use serde::Serialize;
use tether_api::{Memcached, StoreError};
use tether_batch::run_batch;
use tether_controller::{ControllerConfig, Reconciler};
use tether_core::{Backoff, Change, ChangeKind, ResourceVersion};
use tether_kubehub::KubeStore;
use tether_watch::{ResilientWatch, WatchConfig, WatchError};
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "tetherctl", version, about = "Tether: Memcached controller and cluster tools")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubernetes namespace (default: all namespaces, or "default" for seed)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the Memcached controller against the current kube context
    Run {
        /// Default memcached image for resources that do not set one
        #[arg(long = "image", env = "TETHER_MEMCACHED_IMAGE")]
        image: Option<String>,
        /// Re-read attempts after a write conflict
        #[arg(long = "conflict-retries", env = "TETHER_CONFLICT_RETRIES")]
        conflict_retries: Option<u32>,
    },
    /// Print the Memcached CRD as YAML
    Crd,
    /// Watch objects for a GVK and print +/~/- events, resuming across disconnects
    Watch {
        /// GVK key, e.g. "v1/ConfigMap" or "cache.tether.dev/v1/Memcached"
        gvk: String,
        /// Start from this resourceVersion instead of the current state
        #[arg(long = "from")]
        from: Option<String>,
    },
    /// Create ConfigMaps in slow-start waves
    Seed {
        #[arg(long = "count", default_value_t = 10)]
        count: usize,
        /// Size of the first wave; each later wave doubles
        #[arg(long = "batch", default_value_t = 1)]
        batch: usize,
        #[arg(long = "prefix", default_value = "tether-seed")]
        prefix: String,
    },
}

fn init_tracing() {
    let env = std::env::var("TETHER_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("TETHER_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid TETHER_METRICS_ADDR; expected host:port");
        }
    }
}

#[derive(Serialize)]
struct ChangeLine<'a> {
    kind: ChangeKind,
    version: &'a str,
    namespace: Option<String>,
    name: String,
}

fn object_key(o: &DynamicObject) -> String {
    match o.namespace() {
        Some(ns) => format!("{}/{}", ns, o.name_any()),
        None => o.name_any(),
    }
}

fn print_change(output: Output, c: &Change<DynamicObject>) -> Result<()> {
    match output {
        Output::Human => println!("{} {} rv={}", c.kind.sigil(), object_key(&c.object), c.version),
        Output::Json => {
            let line = ChangeLine {
                kind: c.kind,
                version: c.version.as_str(),
                namespace: c.object.namespace(),
                name: c.object.name_any(),
            };
            println!("{}", serde_json::to_string(&line)?);
        }
    }
    Ok(())
}

fn seed_config_map(prefix: &str, ns: &str, seq: usize) -> ConfigMap {
    let mut cm = ConfigMap::default();
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    cm.metadata.name = Some(format!("{}-{}", prefix, &suffix[..8]));
    cm.metadata.namespace = Some(ns.to_string());
    cm.metadata.labels = Some([("app.kubernetes.io/managed-by".to_string(), "tetherctl".to_string())].into());
    cm.data = Some([("seq".to_string(), seq.to_string())].into());
    cm
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { image, conflict_retries } => {
            let mut cfg = ControllerConfig::from_env();
            if let Some(image) = image {
                cfg.image = image;
            }
            if let Some(n) = conflict_retries {
                cfg.conflict_retries = n;
            }
            info!(image = %cfg.image, requeue_secs = cfg.create_requeue.as_secs(), "run invoked");
            let client = Client::try_default().await?;
            let reconciler = Reconciler::new(KubeStore::new(client.clone()), cfg);
            tether_kubehub::run_controller(client, reconciler, cli.namespace.as_deref()).await?;
        }
        Commands::Crd => {
            print!("{}", serde_yaml::to_string(&Memcached::crd())?);
        }
        Commands::Watch { gvk, from } => {
            let ns = cli.namespace.as_deref();
            info!(gvk = %gvk, ns = ?ns, from = ?from, "watch invoked");
            let client = Client::try_default().await?;
            let sub = tether_kubehub::dynamic_subscription(client, &gvk, ns).await?;
            let cfg = WatchConfig::from_env();
            let mut handle = ResilientWatch::new(from.map(ResourceVersion::new), sub)
                .with_backoff(Backoff::new(cfg.backoff_initial, cfg.backoff_max))
                .spawn(&cfg);
            loop {
                tokio::select! {
                    maybe = handle.recv() => {
                        match maybe {
                            Some(Ok(change)) => print_change(cli.output, &change)?,
                            Some(Err(WatchError::Expired { cursor, message })) => {
                                warn!(cursor = ?cursor, message = %message, "history expired; events may have been missed, resuming from now");
                            }
                            Some(Err(e)) => warn!(error = %e, "watch error; retrying"),
                            None => {
                                warn!("watch channel closed; exiting watch loop");
                                break;
                            }
                        }
                    }
                    _ = signal::ctrl_c() => {
                        info!("Ctrl-C received; shutting down watch loop");
                        break;
                    }
                }
            }
            handle.close().await;
        }
        Commands::Seed { count, batch, prefix } => {
            let ns = cli.namespace.clone().unwrap_or_else(|| "default".to_string());
            info!(count, batch, prefix = %prefix, ns = %ns, "seed invoked");
            let store = KubeStore::new(Client::try_default().await?);
            let seq = std::sync::atomic::AtomicUsize::new(0);
            let started = Instant::now();
            let res = run_batch(count, batch, || {
                let cm = seed_config_map(&prefix, &ns, seq.fetch_add(1, std::sync::atomic::Ordering::Relaxed));
                let store = store.clone();
                async move {
                    match store.create_config_map(&cm).await {
                        Ok(_) | Err(StoreError::AlreadyExists(_)) => Ok(()),
                        Err(e) => Err(e),
                    }
                }
            })
            .await;
            let took_ms = started.elapsed().as_millis();
            match res {
                Ok(n) => match cli.output {
                    Output::Human => println!("created {} of {} configmaps in {} ({} ms)", n, count, ns, took_ms),
                    Output::Json => println!("{}", serde_json::json!({ "created": n, "requested": count, "namespace": ns })),
                },
                Err(failure) => {
                    error!(succeeded = failure.succeeded, error = %failure.error, "seed stopped");
                    return Err(failure.into());
                }
            }
        }
    }
    Ok(())
}
