use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Pod, Secret, Service};
use kcache_api::{FilteredCache, SelectiveCache, StoreRegistry};
use kcache_core::{
    field_extractor, gvk_key, item_gvk, parse_gvk_key, CacheOptions, DynamicObject, FieldSelector, Gvk, LabelSelector,
    ListOptions, ObjectKey,
};
use kcache_kubehub::{KubeConnector, Scheme};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "kcachectl", version, about = "Read a cluster through the kcache selective cache")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kinds served by dedicated stores, e.g. "v1/Secret,apps/v1/Deployment"
    #[arg(long = "store-kinds", env = "KCACHE_STORE_KINDS", value_delimiter = ',', global = true)]
    store_kinds: Vec<String>,

    /// Restrict dedicated stores to one namespace (overrides KCACHE_NAMESPACE)
    #[arg(long = "store-ns", global = true)]
    store_namespace: Option<String>,

    /// Namespaces watched by the fallback cache (default: all)
    #[arg(long = "watch-ns", env = "KCACHE_WATCH_NAMESPACES", value_delimiter = ',', global = true)]
    watch_namespaces: Vec<String>,

    /// Label filter for a fallback kind, as GVK=SELECTOR (repeatable)
    #[arg(long = "kind-selector", global = true)]
    kind_selectors: Vec<String>,

    /// Re-list interval in seconds (overrides KCACHE_RESYNC_SECS; 0 disables)
    #[arg(long = "resync-secs", global = true)]
    resync_secs: Option<u64>,

    /// Give up waiting for the cache to sync after this many seconds
    #[arg(long = "sync-timeout-secs", default_value_t = 60, global = true)]
    sync_timeout_secs: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Read one object
    Get {
        /// GVK key, e.g. "v1/ConfigMap" or "cert-manager.io/v1/Certificate"
        gvk: String,
        name: String,
        /// Namespace of the object (omit for cluster-scoped kinds)
        #[arg(short = 'n', long = "namespace")]
        namespace: Option<String>,
    },
    /// List objects of a kind
    Ls {
        /// GVK key, e.g. "v1/ConfigMap" or "v1/ConfigMapList"
        gvk: String,
        #[arg(short = 'n', long = "namespace")]
        namespace: Option<String>,
        /// Label selector, e.g. "app=web,tier in (fe,be)"
        #[arg(short = 'l', long = "selector")]
        labels: Option<String>,
        /// Field selector; must be a single field=value, served from an index
        #[arg(long = "field-selector")]
        fields: Option<String>,
    },
    /// Start the cache, wait for every watch to sync and report store sizes
    Sync,
}

fn init_tracing() {
    let env = std::env::var("KCACHE_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KCACHE_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid KCACHE_METRICS_ADDR; expected host:port");
        }
    }
}

fn options(cli: &Cli) -> CacheOptions {
    let mut opts = CacheOptions::from_env();
    if let Some(ns) = cli.store_namespace.as_deref() {
        opts.namespace = Some(ns.to_string()).filter(|s| !s.is_empty());
    }
    if let Some(secs) = cli.resync_secs {
        opts.resync = (secs > 0).then(|| Duration::from_secs(secs));
    }
    opts
}

fn kind_selectors(cli: &Cli) -> Result<Vec<(Gvk, LabelSelector)>> {
    cli.kind_selectors
        .iter()
        .map(|raw| {
            let (gvk, sel) = raw.split_once('=').ok_or_else(|| anyhow!("expected GVK=SELECTOR, got {:?}", raw))?;
            Ok((parse_gvk_key(gvk)?, sel.parse::<LabelSelector>()?))
        })
        .collect()
}

fn builtin_scheme() -> Scheme {
    let mut scheme = Scheme::new();
    scheme
        .register::<ConfigMap>()
        .register::<Secret>()
        .register::<Pod>()
        .register::<Service>()
        .register::<Namespace>()
        .register::<Deployment>();
    scheme
}

fn print_objects(output: Output, objs: &[DynamicObject]) -> Result<()> {
    match output {
        Output::Human => {
            println!("{:<24} {}", "NAMESPACE", "NAME");
            for o in objs {
                println!(
                    "{:<24} {}",
                    o.metadata.namespace.as_deref().unwrap_or("-"),
                    o.metadata.name.as_deref().unwrap_or("")
                );
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(objs)?),
    }
    Ok(())
}

async fn wait_synced(cache: &SelectiveCache, cancel: &CancellationToken, timeout: Duration) -> Result<()> {
    let t0 = Instant::now();
    match tokio::time::timeout(timeout, cache.wait_for_sync(cancel)).await {
        Ok(true) => {
            info!(took_ms = %t0.elapsed().as_millis(), "cache synced");
            Ok(())
        }
        Ok(false) => bail!("cancelled before the cache synced"),
        Err(_) => bail!("cache did not sync within {}s", timeout.as_secs()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let opts = options(&cli);

    let store_kinds = cli.store_kinds.iter().filter(|k| !k.is_empty()).map(|k| parse_gvk_key(k)).collect::<Result<Vec<_>, _>>()?;
    let selectors = kind_selectors(&cli)?;
    let target = match &cli.command {
        Commands::Get { gvk, .. } | Commands::Ls { gvk, .. } => Some(item_gvk(&parse_gvk_key(gvk)?)),
        Commands::Sync => None,
    };

    let config = kube::Config::infer().await.context("inferring kube config")?;
    let client = kube::Client::try_from(config).context("building kube client")?;
    let mut scheme = builtin_scheme();
    let mut wanted: Vec<Gvk> = store_kinds.clone();
    wanted.extend(selectors.iter().map(|(g, _)| g.clone()));
    wanted.extend(target.clone());
    scheme.discover_into(client.clone(), &wanted).await?;

    let connector = Arc::new(KubeConnector::from_client(client, Arc::new(scheme)));
    let registry = StoreRegistry::build(&store_kinds, connector.as_ref(), &opts)?;
    let mut fallback = FilteredCache::new(connector.clone(), opts.clone()).with_namespaces(cli.watch_namespaces.clone());
    for (gvk, sel) in selectors {
        fallback = fallback.with_selector(gvk, sel);
    }
    let cache = Arc::new(SelectiveCache::new(registry, Arc::new(fallback), connector.scheme().clone()));

    let mut list_opts = ListOptions::default();
    if let Commands::Ls { namespace, labels, fields, .. } = &cli.command {
        list_opts.namespace = namespace.clone();
        if let Some(raw) = labels {
            list_opts = list_opts.labels(raw.parse()?);
        }
        if let Some(raw) = fields {
            let sel: FieldSelector = raw.parse()?;
            if let (Some(gvk), Some((field, _))) = (&target, sel.requires_exact_match()) {
                cache.index_field_for_kind(gvk, field, field_extractor(field)).await?;
            }
            list_opts = list_opts.fields(sel);
        }
    }

    let cancel = CancellationToken::new();
    let runner = tokio::spawn({
        let cache = cache.clone();
        let cancel = cancel.clone();
        async move {
            if let Err(e) = cache.start(cancel).await {
                error!(error = %e, "cache stopped with error");
            }
        }
    });
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if signal::ctrl_c().await.is_ok() {
                info!("interrupt received; shutting down");
                cancel.cancel();
            }
        }
    });

    let timeout = Duration::from_secs(cli.sync_timeout_secs);
    let res: Result<()> = async {
        match &cli.command {
            Commands::Get { name, namespace, .. } => {
                let gvk = target.as_ref().ok_or_else(|| anyhow!("missing kind"))?;
                wait_synced(&cache, &cancel, timeout).await?;
                let key = ObjectKey::new(namespace.as_deref(), name);
                info!(gvk = %gvk_key(gvk), key = %key, "get invoked");
                let obj = cache.get_dynamic(gvk, &key).await?;
                match cli.output {
                    Output::Human => println!("{}", serde_json::to_string_pretty(&obj)?),
                    Output::Json => println!("{}", serde_json::to_string(&obj)?),
                }
            }
            Commands::Ls { .. } => {
                let gvk = target.as_ref().ok_or_else(|| anyhow!("missing kind"))?;
                wait_synced(&cache, &cancel, timeout).await?;
                info!(gvk = %gvk_key(gvk), ns = ?list_opts.namespace(), "ls invoked");
                let objs = cache.list_dynamic(gvk, &list_opts).await?;
                print_objects(cli.output, &objs)?;
            }
            Commands::Sync => {
                wait_synced(&cache, &cancel, timeout).await?;
                let sizes: Vec<(String, usize)> =
                    cache.registry().entries().iter().map(|e| (gvk_key(&e.gvk), e.store.len())).collect();
                match cli.output {
                    Output::Human => {
                        for (gvk, n) in &sizes {
                            println!("{} • {} objects", gvk, n);
                        }
                    }
                    Output::Json => {
                        let body: serde_json::Map<String, serde_json::Value> =
                            sizes.into_iter().map(|(g, n)| (g, serde_json::Value::from(n))).collect();
                        println!("{}", serde_json::to_string_pretty(&body)?);
                    }
                }
            }
        }
        Ok(())
    }
    .await;

    cancel.cancel();
    let _ = runner.await;
    res
}
