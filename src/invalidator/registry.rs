//! Registry manifests: refreshed by re-pulling the manifest reference they
//! were stored under.

use anyhow::Result;
use tracing::debug;

use super::RefreshDomain;
use crate::download::{DownloadWork, Downloader};
use crate::storage::ObjectInfo;

const BLOB_PREFIX: &str = "blobs/";

pub struct RegistryManifests {
    downloader: Downloader,
    bucket: String,
    upstream_base: String,
    media_type: String,
}

impl RegistryManifests {
    pub fn new(
        downloader: Downloader,
        bucket: impl Into<String>,
        upstream_base: &str,
        media_type: impl Into<String>,
    ) -> Self {
        Self {
            downloader,
            bucket: bucket.into(),
            upstream_base: upstream_base.trim_end_matches('/').to_string(),
            media_type: media_type.into(),
        }
    }
}

#[async_trait::async_trait]
impl RefreshDomain for RegistryManifests {
    fn name(&self) -> &'static str {
        "registry"
    }

    fn content_type(&self) -> &str {
        &self.media_type
    }

    async fn refresh(&self, object: &ObjectInfo) -> Result<usize> {
        // Digest-keyed objects never change.
        if object.key.starts_with(BLOB_PREFIX) {
            debug!(key = %object.key, "skipping immutable blob");
            return Ok(0);
        }

        // Reference keys are the request path without its leading slash.
        let pull_url = format!("{}/{}", self.upstream_base, object.key);
        debug!(key = %object.key, %pull_url, "refreshing manifest");

        let work = DownloadWork::new(&self.bucket, &object.key, pull_url)
            .media_type(&self.media_type)
            .force_refresh();
        self.downloader.fetch(work).await;
        Ok(1)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::Utc;

    use super::*;
    use crate::config::DownloaderConfig;
    use crate::invalidator::Invalidator;
    use crate::metrics::MetricsRegistry;
    use crate::storage::memory::MemoryStore;

    const MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
    const KEY: &str = "v2/library/llama3/manifests/latest";

    fn setup(store: Arc<MemoryStore>) -> (Invalidator, Downloader) {
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
        let domain = RegistryManifests::new(downloader.clone(), "cache", "https://registry.test/", MANIFEST);
        let invalidator = Invalidator::new(
            store,
            "cache",
            Duration::from_secs(240 * 60 * 60),
            Duration::from_secs(1800),
            Box::new(domain),
            metrics,
        );
        (invalidator, downloader)
    }

    #[tokio::test]
    async fn stale_manifest_is_force_refreshed_from_upstream() {
        let store = Arc::new(MemoryStore::new());
        let eleven_days_ago = Utc::now() - chrono::Duration::days(11);
        store.insert_at("cache", KEY, b"{}", MANIFEST, eleven_days_ago);
        store.insert_at(
            "cache",
            "blobs/sha256:aaa",
            b"layer",
            "application/vnd.ollama.image.model",
            eleven_days_ago,
        );
        store.insert("cache", "v2/library/phi3/manifests/latest", b"{}", MANIFEST);

        let (invalidator, downloader) = setup(store);
        assert_eq!(invalidator.scan_once().await, 1);

        let queued = downloader.drain_queued();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].key, KEY);
        assert_eq!(
            queued[0].pull_url,
            "https://registry.test/v2/library/llama3/manifests/latest"
        );
        assert_eq!(queued[0].media_type, MANIFEST);
        assert_eq!(queued[0].authorization, "");
        assert!(queued[0].force_refresh);
    }

    #[tokio::test]
    async fn repeated_scans_do_not_queue_duplicates() {
        let store = Arc::new(MemoryStore::new());
        store.insert_at("cache", KEY, b"{}", MANIFEST, Utc::now() - chrono::Duration::days(11));

        let (invalidator, downloader) = setup(store);
        invalidator.scan_once().await;
        invalidator.scan_once().await;

        assert_eq!(downloader.drain_queued().len(), 1);
    }

    #[tokio::test]
    async fn digest_keyed_manifests_are_never_refreshed() {
        let store = Arc::new(MemoryStore::new());
        store.insert_at(
            "cache",
            "blobs/sha256:def",
            b"{}",
            MANIFEST,
            Utc::now() - chrono::Duration::days(11),
        );

        let (invalidator, downloader) = setup(store);
        assert_eq!(invalidator.scan_once().await, 0);
        assert!(downloader.drain_queued().is_empty());
    }
}
