mod civitai;
mod config;
mod download;
mod health;
mod http;
mod invalidator;
mod metrics;
mod storage;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::{Config, LogFormat, StorageBackend};
use crate::download::Downloader;
use crate::invalidator::Invalidator;
use crate::metrics::MetricsRegistry;
use crate::storage::ObjectStore;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "modelcache", about = "Caching reverse proxy for model registries")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(
        short,
        long,
        env = "MODELCACHE_CONFIG",
        default_value = "/etc/modelcache/config.yaml"
    )]
    config: String,

    /// Listen address, overriding `listen` from the config file.
    #[arg(long)]
    bind: Option<String>,

    /// Default log filter, overriding `log.level` from the config file.
    #[arg(long)]
    log_level: Option<String>,
}

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// Global state shared across all request handlers and background tasks.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn ObjectStore>,
    pub downloader: Downloader,
    pub metrics: MetricsRegistry,
    /// Does not follow redirects; used for pass-through proxying and
    /// single-hop redirect resolution.
    pub passthrough_client: reqwest::Client,
    /// `None` when Civitai support is disabled.
    pub civitai: Option<civitai::MetadataCache>,
}

// ---------------------------------------------------------------------------
// Object store setup
// ---------------------------------------------------------------------------

async fn build_s3_client(config: &Config) -> Result<aws_sdk_s3::Client> {
    let s3 = &config.storage.s3;
    let mut aws_config_loader =
        aws_config::from_env().region(aws_config::Region::new(s3.region.clone()));

    if s3.use_fips {
        aws_config_loader = aws_config_loader.use_fips(true);
    }
    if let Some(endpoint) = &s3.endpoint {
        aws_config_loader = aws_config_loader.endpoint_url(endpoint);
    }

    let aws_config = aws_config_loader.load().await;

    let s3_config = aws_sdk_s3::config::Builder::from(&aws_config)
        .force_path_style(s3.force_path_style)
        .build();

    let client = aws_sdk_s3::Client::from_conf(s3_config);
    tracing::info!(
        bucket = %config.storage.bucket,
        region = %s3.region,
        endpoint = s3.endpoint.as_deref().unwrap_or("default"),
        fips = s3.use_fips,
        "S3 client initialised"
    );
    Ok(client)
}

async fn build_store(config: &Config) -> Result<Arc<dyn ObjectStore>> {
    match config.storage.backend {
        StorageBackend::S3 => {
            let client = build_s3_client(config).await?;
            Ok(Arc::new(storage::s3::S3Store::new(
                client,
                config.storage.s3.server_side_query,
            )))
        }
        StorageBackend::Local => {
            let path = config
                .storage
                .local
                .as_ref()
                .map(|local| local.path.clone())
                .context("storage.local.path is required when storage.backend is local")?;
            tokio::fs::create_dir_all(&path)
                .await
                .with_context(|| format!("failed to create local cache dir: {path}"))?;
            tracing::info!(%path, "local object store initialised");
            Ok(Arc::new(storage::local::LocalStore::new(path)))
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP server (axum)
// ---------------------------------------------------------------------------

async fn run_http_server(state: AppState, cancel: CancellationToken) -> Result<()> {
    let app = http::handler::create_router(Arc::new(state.clone()));

    let listen_addr: std::net::SocketAddr = state
        .config
        .listen
        .parse()
        .context("invalid listen address")?;

    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {listen_addr}"))?;

    tracing::info!(%listen_addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .context("HTTP server error")?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Background tasks
// ---------------------------------------------------------------------------

fn build_invalidators(state: &AppState) -> Vec<Invalidator> {
    let config = &state.config;
    if !config.invalidator.enabled {
        tracing::info!("invalidator disabled");
        return Vec::new();
    }

    let mut domains: Vec<Box<dyn invalidator::RefreshDomain>> =
        vec![Box::new(invalidator::registry::RegistryManifests::new(
            state.downloader.clone(),
            &config.storage.bucket,
            config.registry.upstream_base(),
            &config.registry.manifest_media_type,
        ))];
    if let Some(cache) = &state.civitai {
        domains.push(Box::new(invalidator::civitai::CivitaiModels::new(
            cache.clone(),
            state.downloader.clone(),
        )));
    }

    domains
        .into_iter()
        .map(|domain| {
            Invalidator::new(
                Arc::clone(&state.store),
                &config.storage.bucket,
                config.invalidator.manifest_lifetime(),
                config.invalidator.interval(),
                domain,
                Arc::clone(&state.metrics.metrics),
            )
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Config ----
    let mut config = config::load_config(&cli.config)?;
    if let Some(bind) = cli.bind {
        config.listen = bind;
    }
    if let Some(level) = cli.log_level {
        config.log.level = level;
    }
    let config = Arc::new(config);

    // ---- Tracing ----
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log.level));
    let registry = tracing_subscriber::registry().with(filter);
    match config.log.format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer().pretty()).init(),
    }

    tracing::info!(config_path = %cli.config, "starting modelcache");

    // ---- Infrastructure clients ----
    let store = build_store(&config).await?;

    let http_client = reqwest::Client::builder()
        .user_agent("modelcache/0.1")
        .build()
        .context("failed to build reqwest client")?;
    let passthrough_client = reqwest::Client::builder()
        .user_agent("modelcache/0.1")
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .context("failed to build pass-through reqwest client")?;

    // ---- Metrics ----
    let metrics = MetricsRegistry::new();

    // ---- Downloader ----
    let downloader = Downloader::new(
        Arc::clone(&store),
        http_client.clone(),
        config.downloader.clone(),
        config.registry.mislabeled_manifest_content_type.clone(),
        Arc::clone(&metrics.metrics),
    );

    // ---- Civitai ----
    let civitai = if config.civitai.enabled {
        let token = std::env::var(&config.civitai.token_env).unwrap_or_else(|_| {
            tracing::warn!(
                env = %config.civitai.token_env,
                "Civitai token not set, using anonymous API access"
            );
            String::new()
        });
        let client = civitai::Client::new(http_client.clone(), &config.civitai.api_url, token);
        tracing::info!(api_url = %config.civitai.api_url, "Civitai support enabled");
        Some(civitai::MetadataCache::new(
            Arc::clone(&store),
            &config.storage.bucket,
            client,
        ))
    } else {
        None
    };

    // ---- App state ----
    let state = AppState {
        config: Arc::clone(&config),
        store,
        downloader,
        metrics,
        passthrough_client,
        civitai,
    };

    // ---- Spawn services ----
    let cancel = CancellationToken::new();
    let mut handles = state.downloader.spawn_workers(cancel.clone());

    for invalidator in build_invalidators(&state) {
        handles.push(tokio::spawn(invalidator.run(cancel.clone())));
    }

    let http_handle = tokio::spawn({
        let s = state.clone();
        let cancel = cancel.clone();
        async move {
            if let Err(e) = run_http_server(s, cancel.clone()).await {
                tracing::error!(error = %e, "HTTP server failed");
                cancel.cancel();
            }
        }
    });

    // ---- Await shutdown ----
    tokio::select! {
        () = shutdown_signal() => {}
        () = cancel.cancelled() => {}
    }
    cancel.cancel();

    let _ = http_handle.await;
    for handle in handles {
        let _ = handle.await;
    }

    tracing::info!("modelcache shut down cleanly");
    Ok(())
}
