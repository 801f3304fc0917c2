//! Civitai models: the cached model metadata is re-fetched and every file of
//! every version is queued for download.  Files are keyed by hash, so
//! unchanged files resolve to `AlreadyCached` in the worker.

use anyhow::{Context, Result};
use tracing::{debug, warn};

use super::RefreshDomain;
use crate::civitai::{MODEL_CONTENT_TYPE, MetadataCache};
use crate::download::{DownloadWork, Downloader};
use crate::storage::ObjectInfo;

const MODEL_FILE_MEDIA_TYPE: &str = "application/octet-stream";

pub struct CivitaiModels {
    cache: MetadataCache,
    downloader: Downloader,
}

impl CivitaiModels {
    pub fn new(cache: MetadataCache, downloader: Downloader) -> Self {
        Self { cache, downloader }
    }
}

#[async_trait::async_trait]
impl RefreshDomain for CivitaiModels {
    fn name(&self) -> &'static str {
        "civitai"
    }

    fn content_type(&self) -> &str {
        MODEL_CONTENT_TYPE
    }

    async fn refresh(&self, object: &ObjectInfo) -> Result<usize> {
        let model_id = object
            .key
            .rsplit('/')
            .next()
            .filter(|id| !id.is_empty())
            .with_context(|| format!("no model id in key {}", object.key))?;

        let model = self
            .cache
            .client
            .fetch_model(model_id)
            .await
            .with_context(|| format!("can't refresh model {model_id}"))?;
        self.cache.put_model(&model).await?;

        let client = &self.cache.client;
        let mut attempted = 0;
        for version in &model.model_versions {
            for file in &version.files {
                let Some(key) = file.cache_key() else {
                    warn!(model_id, version_id = version.id, file = %file.name, "file has no SHA256, skipping");
                    continue;
                };
                let pull_url = client.download_url(version.id, file)?;
                debug!(%key, %pull_url, "refreshing model file");

                let work = DownloadWork::new(&self.cache.bucket, key, pull_url)
                    .media_type(MODEL_FILE_MEDIA_TYPE)
                    .authorization(client.bearer());
                self.downloader.fetch(work).await;
                attempted += 1;
            }
        }
        Ok(attempted)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::Utc;

    use super::*;
    use crate::civitai::{Client, model_key};
    use crate::config::DownloaderConfig;
    use crate::invalidator::Invalidator;
    use crate::metrics::MetricsRegistry;
    use crate::storage::memory::MemoryStore;

    const MODEL: &str = r#"{
        "id": 4201, "name": "Realistic", "type": "Checkpoint",
        "modelVersions": [
            {"id": 130072, "name": "v6", "files": [
                {"id": 1, "name": "a.safetensors", "type": "Model", "primary": true,
                 "metadata": {"fp": "fp16", "size": "pruned", "format": "SafeTensor"},
                 "hashes": {"SHA256": "AAA111"}},
                {"id": 2, "name": "vae.pt", "type": "VAE",
                 "metadata": {}, "hashes": {}}
            ]},
            {"id": 43533, "name": "v5", "files": [
                {"id": 3, "name": "b.ckpt", "type": "Model",
                 "metadata": {"format": "PickleTensor"},
                 "hashes": {"SHA256": "BBB222"}}
            ]}
        ]
    }"#;

    fn setup(store: Arc<MemoryStore>, api: &str) -> (Invalidator, Downloader) {
        let metrics = MetricsRegistry::new().metrics;
        let downloader = Downloader::new(
            store.clone(),
            reqwest::Client::new(),
            DownloaderConfig {
                queue_capacity: 16,
                ..DownloaderConfig::default()
            },
            "text/plain; charset=utf-8",
            Arc::clone(&metrics),
        );
        let cache = MetadataCache::new(store.clone(), "cache", Client::new(reqwest::Client::new(), api, "tok"));
        let invalidator = Invalidator::new(
            store,
            "cache",
            Duration::from_secs(240 * 60 * 60),
            Duration::from_secs(1800),
            Box::new(CivitaiModels::new(cache, downloader.clone())),
            metrics,
        );
        (invalidator, downloader)
    }

    #[tokio::test]
    async fn stale_model_refreshes_metadata_and_every_file() {
        let mut server = mockito::Server::new_async().await;
        let api = server
            .mock("GET", "/api/v1/models/4201")
            .match_header("authorization", "Bearer tok")
            .with_status(200)
            .with_body(MODEL)
            .create_async()
            .await;

        let store = Arc::new(MemoryStore::new());
        let stale = Utc::now() - chrono::Duration::days(11);
        store.insert_at("cache", &model_key(4201), b"{}", MODEL_CONTENT_TYPE, stale);

        let (invalidator, downloader) = setup(store.clone(), &server.url());
        assert_eq!(invalidator.scan_once().await, 2);
        api.assert_async().await;

        let refreshed = store.object("cache", &model_key(4201)).unwrap();
        assert!(refreshed.last_modified > stale);
        assert!(String::from_utf8_lossy(&refreshed.data).contains("Realistic"));

        let mut queued = downloader.drain_queued();
        queued.sort_by(|a, b| a.key.cmp(&b.key));
        assert_eq!(queued.len(), 2);
        assert_eq!(queued[0].key, "blobs/sha256:aaa111");
        assert!(queued[0].pull_url.contains("/api/download/models/130072?type=Model"));
        assert_eq!(queued[1].key, "blobs/sha256:bbb222");
        assert!(queued[1].pull_url.contains("/api/download/models/43533?type=Model&format=PickleTensor"));
        assert!(queued.iter().all(|w| w.authorization == "Bearer tok"));
        assert!(queued.iter().all(|w| w.media_type == MODEL_FILE_MEDIA_TYPE));
    }

    #[tokio::test]
    async fn refreshed_model_is_not_stale_on_the_next_pass() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/v1/models/4201")
            .with_status(200)
            .with_body(MODEL)
            .expect(1)
            .create_async()
            .await;

        let store = Arc::new(MemoryStore::new());
        store.insert_at(
            "cache",
            &model_key(4201),
            b"{}",
            MODEL_CONTENT_TYPE,
            Utc::now() - chrono::Duration::days(11),
        );

        let (invalidator, _downloader) = setup(store, &server.url());
        assert_eq!(invalidator.scan_once().await, 2);
        assert_eq!(invalidator.scan_once().await, 0);
    }

    #[tokio::test]
    async fn api_failure_is_logged_not_fatal() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/v1/models/4201")
            .with_status(503)
            .create_async()
            .await;

        let store = Arc::new(MemoryStore::new());
        let stale = Utc::now() - chrono::Duration::days(11);
        store.insert_at("cache", &model_key(4201), b"{}", MODEL_CONTENT_TYPE, stale);

        let (invalidator, downloader) = setup(store.clone(), &server.url());
        assert_eq!(invalidator.scan_once().await, 0);
        assert!(downloader.drain_queued().is_empty());
        assert_eq!(store.object("cache", &model_key(4201)).unwrap().last_modified, stale);
    }
}
