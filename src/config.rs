use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Socket address for the HTTP listener (e.g. `0.0.0.0:9200`).
    #[serde(default = "default_listen", alias = "bind")]
    pub listen: String,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub civitai: CivitaiConfig,
    #[serde(default)]
    pub downloader: DownloaderConfig,
    #[serde(default)]
    pub invalidator: InvalidatorConfig,
    pub storage: StorageConfig,
}

fn default_listen() -> String {
    "0.0.0.0:9200".to_string()
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    /// Default filter directive when `RUST_LOG` is not set.
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

fn default_log_level() -> String {
    "info".to_string()
}

// ---------------------------------------------------------------------------
// Proxy behaviour
// ---------------------------------------------------------------------------

/// What the cache-aside routes do with methods other than GET and HEAD.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MethodPolicy {
    /// Answer `405 Method Not Allowed`.  The proxy is a read-only cache.
    #[default]
    Reject,
    /// Forward the request to the origin untouched.
    Passthrough,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProxyConfig {
    #[serde(default)]
    pub method_policy: MethodPolicy,
}

// ---------------------------------------------------------------------------
// Registry origin
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    /// Base URL of the upstream OCI registry.
    #[serde(default = "default_upstream", alias = "upstream_registry")]
    pub upstream: String,
    /// Content type the upstream wrongly attaches to manifest JSON.
    #[serde(default = "default_mislabeled_content_type")]
    pub mislabeled_manifest_content_type: String,
    /// Content type cached manifests are stored (and swept) under.
    #[serde(default = "default_manifest_media_type")]
    pub manifest_media_type: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            upstream: default_upstream(),
            mislabeled_manifest_content_type: default_mislabeled_content_type(),
            manifest_media_type: default_manifest_media_type(),
        }
    }
}

impl RegistryConfig {
    /// Upstream base URL without a trailing slash.
    pub fn upstream_base(&self) -> &str {
        self.upstream.trim_end_matches('/')
    }
}

fn default_upstream() -> String {
    "https://registry.ollama.ai/".to_string()
}

fn default_mislabeled_content_type() -> String {
    "text/plain; charset=utf-8".to_string()
}

fn default_manifest_media_type() -> String {
    "application/vnd.docker.distribution.manifest.v2+json".to_string()
}

// ---------------------------------------------------------------------------
// Civitai (model hosting) origin
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct CivitaiConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    /// Root of the Civitai site; API paths are appended to it.
    #[serde(default = "default_civitai_api_url")]
    pub api_url: String,
    /// Name of the environment variable that holds the Civitai API token.
    #[serde(default = "default_civitai_token_env")]
    pub token_env: String,
}

impl Default for CivitaiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_url: default_civitai_api_url(),
            token_env: default_civitai_token_env(),
        }
    }
}

fn bool_true() -> bool {
    true
}

fn default_civitai_api_url() -> String {
    "https://civitai.com".to_string()
}

fn default_civitai_token_env() -> String {
    "CIVITAI_API_TOKEN".to_string()
}

// ---------------------------------------------------------------------------
// Downloader
// ---------------------------------------------------------------------------

/// Whether a pull URL leaves the in-flight set once its work item is done.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InFlightPolicy {
    /// Forget the URL after a terminal outcome so it can be fetched again.
    #[default]
    ReleaseOnCompletion,
    /// Fetch each URL at most once for the lifetime of the process.
    RetainForProcess,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DownloaderConfig {
    /// Number of worker tasks draining the fetch queue.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Capacity of the bounded fetch queue.  Producers wait when it is full.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default)]
    pub in_flight_policy: InFlightPolicy,
    /// Total attempts (first try included) before a failing store write is
    /// dead-lettered.
    #[serde(default = "default_max_put_attempts")]
    pub max_put_attempts: u32,
    /// Backoff before the first retry, doubled on every further attempt.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Upper bound on the retry backoff.
    #[serde(default = "default_max_retry_backoff_ms")]
    pub max_retry_backoff_ms: u64,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
            in_flight_policy: InFlightPolicy::default(),
            max_put_attempts: default_max_put_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            max_retry_backoff_ms: default_max_retry_backoff_ms(),
        }
    }
}

fn default_workers() -> usize {
    4
}

fn default_queue_capacity() -> usize {
    4
}

fn default_max_put_attempts() -> u32 {
    5
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_max_retry_backoff_ms() -> u64 {
    30_000
}

// ---------------------------------------------------------------------------
// Invalidator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct InvalidatorConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    /// Seconds between two sweeps.
    #[serde(default = "default_invalidator_interval", alias = "period")]
    pub interval: u64,
    /// Age (seconds) after which a cached manifest is refreshed.
    #[serde(default = "default_manifest_lifetime")]
    pub manifest_lifetime: u64,
}

impl Default for InvalidatorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: default_invalidator_interval(),
            manifest_lifetime: default_manifest_lifetime(),
        }
    }
}

impl InvalidatorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval)
    }

    pub fn manifest_lifetime(&self) -> Duration {
        Duration::from_secs(self.manifest_lifetime)
    }
}

fn default_invalidator_interval() -> u64 {
    30 * 60
}

fn default_manifest_lifetime() -> u64 {
    240 * 60 * 60
}

// ---------------------------------------------------------------------------
// Storage (S3 or local directory)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    S3,
    Local,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Bucket holding blobs, manifests and model metadata.
    #[serde(default = "default_bucket")]
    pub bucket: String,
    #[serde(default)]
    pub backend: StorageBackend,
    /// TTL (seconds) for pre-signed download URLs.
    #[serde(default = "default_presigned_url_ttl")]
    pub presigned_url_ttl: u64,
    #[serde(default)]
    pub s3: S3StorageConfig,
    #[serde(default)]
    pub local: Option<LocalStorageConfig>,
}

impl StorageConfig {
    pub fn presigned_url_ttl(&self) -> Duration {
        Duration::from_secs(self.presigned_url_ttl)
    }
}

fn default_bucket() -> String {
    "modelcache".to_string()
}

fn default_presigned_url_ttl() -> u64 {
    3600
}

#[derive(Debug, Clone, Deserialize)]
pub struct S3StorageConfig {
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint for S3-compatible stores (e.g. Tigris).
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Use the FIPS endpoints for S3 operations.
    #[serde(default)]
    pub use_fips: bool,
    #[serde(default = "bool_true")]
    pub force_path_style: bool,
    /// Send listing filters to the store as an `X-Tigris-Query` header.
    #[serde(default)]
    pub server_side_query: bool,
}

impl Default for S3StorageConfig {
    fn default() -> Self {
        Self {
            region: default_region(),
            endpoint: None,
            use_fips: false,
            force_path_style: true,
            server_side_query: false,
        }
    }
}

fn default_region() -> String {
    "auto".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct LocalStorageConfig {
    /// Root directory for cached objects.
    pub path: String,
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`Config`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let config = parse_config(&contents)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;
    Ok(config)
}

/// Parse and validate a [`Config`] from YAML text.
pub fn parse_config(contents: &str) -> Result<Config> {
    let config: Config = serde_yaml::from_str(contents)?;
    validate_config(&config)?;
    Ok(config)
}

/// Basic sanity checks that cannot be expressed purely with serde.
fn validate_config(config: &Config) -> Result<()> {
    anyhow::ensure!(config.downloader.workers >= 1, "downloader.workers must be at least 1");
    anyhow::ensure!(
        config.downloader.queue_capacity >= 1,
        "downloader.queue_capacity must be at least 1"
    );
    anyhow::ensure!(
        config.downloader.max_put_attempts >= 1,
        "downloader.max_put_attempts must be at least 1"
    );
    anyhow::ensure!(config.invalidator.interval > 0, "invalidator.interval must be positive");
    anyhow::ensure!(!config.storage.bucket.is_empty(), "storage.bucket must not be empty");

    let upstream = url::Url::parse(&config.registry.upstream)
        .with_context(|| format!("invalid registry.upstream: {}", config.registry.upstream))?;
    anyhow::ensure!(
        matches!(upstream.scheme(), "http" | "https"),
        "registry.upstream must be an http(s) URL"
    );

    if config.storage.backend == StorageBackend::Local {
        anyhow::ensure!(
            config.storage.local.is_some(),
            "storage.local.path is required when storage.backend is local"
        );
    }
    Ok(())
}
