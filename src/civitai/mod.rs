//! Civitai API client and the store-backed metadata cache.
//!
//! Model and model-version metadata is cached as JSON in the same bucket as
//! the model files:
//!
//! - `civitai/model-versions/<id>` (`application/vnd.civitai.model-version+json`)
//! - `civitai/models/<id>` (`application/vnd.civitai.model+json`)
//!
//! The model entries double as the invalidator's work list.

pub mod models;

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use reqwest::header::AUTHORIZATION;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::storage::{ObjectStore, PutObject, body_from_bytes, collect_body};

use self::models::{File, Model, ModelVersion};

pub const MODEL_CONTENT_TYPE: &str = "application/vnd.civitai.model+json";
pub const MODEL_VERSION_CONTENT_TYPE: &str = "application/vnd.civitai.model-version+json";

pub fn model_key(id: impl std::fmt::Display) -> String {
    format!("civitai/models/{id}")
}

pub fn model_version_key(id: impl std::fmt::Display) -> String {
    format!("civitai/model-versions/{id}")
}

// ---------------------------------------------------------------------------
// API client
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Client {
    http: reqwest::Client,
    api_url: String,
    token: String,
}

impl Client {
    pub fn new(http: reqwest::Client, api_url: &str, token: impl Into<String>) -> Self {
        Self {
            http,
            api_url: api_url.trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    /// `Authorization` value for API and download requests.
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.token)
    }

    #[instrument(skip(self))]
    pub async fn fetch_model(&self, id: &str) -> Result<Model> {
        self.get_json(&format!("{}/api/v1/models/{id}", self.api_url))
            .await
    }

    #[instrument(skip(self))]
    pub async fn fetch_model_version(&self, id: &str) -> Result<ModelVersion> {
        self.get_json(&format!("{}/api/v1/model-versions/{id}", self.api_url))
            .await
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        let resp = self
            .http
            .get(url)
            .header(AUTHORIZATION, self.bearer())
            .send()
            .await
            .with_context(|| format!("Civitai API request to {url} failed"))?;

        let status = resp.status();
        if !status.is_success() {
            bail!("Civitai API {url} returned {status}");
        }

        resp.json()
            .await
            .with_context(|| format!("failed to parse Civitai API response from {url}"))
    }

    /// Origin URL that downloads `file` of model version `version_id`.
    ///
    /// The endpoint answers with a redirect to a short-lived CDN URL.
    pub fn download_url(&self, version_id: u64, file: &File) -> Result<String> {
        let mut url = Url::parse(&format!(
            "{}/api/download/models/{version_id}",
            self.api_url
        ))
        .context("invalid Civitai API URL")?;

        {
            let mut query = url.query_pairs_mut();
            query.append_pair("type", &file.kind);
            let meta = &file.metadata;
            for (name, value) in [("format", &meta.format), ("size", &meta.size), ("fp", &meta.fp)] {
                if let Some(value) = value.as_deref().filter(|v| !v.is_empty()) {
                    query.append_pair(name, value);
                }
            }
        }

        Ok(url.to_string())
    }
}

// ---------------------------------------------------------------------------
// Store-backed metadata cache
// ---------------------------------------------------------------------------

/// Read-through metadata cache over an [`ObjectStore`].
#[derive(Clone)]
pub struct MetadataCache {
    pub store: Arc<dyn ObjectStore>,
    pub bucket: String,
    pub client: Client,
}

impl MetadataCache {
    pub fn new(store: Arc<dyn ObjectStore>, bucket: impl Into<String>, client: Client) -> Self {
        Self {
            store,
            bucket: bucket.into(),
            client,
        }
    }

    /// Model version metadata, from the store if present, else from the API
    /// (and then stored).
    pub async fn model_version(&self, id: &str) -> Result<ModelVersion> {
        let key = model_version_key(id);
        if let Some(cached) = self.read_cached(&key).await {
            return Ok(cached);
        }
        let version = self.client.fetch_model_version(id).await?;
        self.write_json(&key, MODEL_VERSION_CONTENT_TYPE, &version)
            .await?;
        Ok(version)
    }

    /// Model metadata, from the store if present, else from the API (and then
    /// stored).
    pub async fn model(&self, id: &str) -> Result<Model> {
        let key = model_key(id);
        if let Some(cached) = self.read_cached(&key).await {
            return Ok(cached);
        }
        let model = self.client.fetch_model(id).await?;
        self.put_model(&model).await?;
        Ok(model)
    }

    /// Write model metadata under `civitai/models/<id>`.  Rewriting an
    /// unchanged model still bumps its last-modified time.
    pub async fn put_model(&self, model: &Model) -> Result<()> {
        self.write_json(&model_key(model.id), MODEL_CONTENT_TYPE, model)
            .await
            .context("can't write model metadata to the store")
    }

    /// A cached entry that cannot be read or decoded counts as a miss.
    async fn read_cached<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.store.exists(&self.bucket, key).await {
            Ok(true) => {}
            Ok(false) => return None,
            Err(e) => {
                warn!(%key, error = %e, "metadata existence check failed");
                return None;
            }
        }

        let decoded = async {
            let obj = self.store.get(&self.bucket, key).await?;
            let raw = collect_body(obj.body).await?;
            serde_json::from_slice::<T>(&raw).context("decode cached metadata")
        }
        .await;

        match decoded {
            Ok(value) => {
                debug!(%key, "metadata served from store");
                Some(value)
            }
            Err(e) => {
                warn!(%key, error = %e, "ignoring unreadable cached metadata");
                None
            }
        }
    }

    async fn write_json<T: Serialize>(&self, key: &str, content_type: &str, value: &T) -> Result<()> {
        let raw = serde_json::to_vec(value).context("encode metadata")?;
        let object = PutObject {
            content_length: Some(raw.len() as u64),
            body: body_from_bytes(raw),
            content_type: content_type.to_string(),
            content_disposition: None,
        };
        self.store.put(&self.bucket, key, object).await
    }
}
