//! OCI / Docker image manifest handling.
//!
//! Some registries serve manifests as `text/plain; charset=utf-8`.  When the
//! downloader sees that content type it peeks at the body, stores the
//! manifest under the media type it declares for itself, and queues every
//! layer blob it references so a later pull is served entirely from cache.

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use url::Url;

use super::DownloadWork;
use super::replay::Peeked;

/// Upper bound on how much of a mislabeled body is buffered for parsing.
pub const MANIFEST_PEEK_LIMIT: usize = 16 * 1024;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    #[serde(default)]
    pub schema_version: u32,
    #[serde(default)]
    pub media_type: String,
    #[serde(default)]
    pub config: Option<Descriptor>,
    #[serde(default)]
    pub layers: Vec<Descriptor>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub digest: String,
    #[serde(default)]
    pub media_type: String,
    #[serde(default)]
    pub size: u64,
}

impl Manifest {
    /// Parse the peeked prefix of a body.  Fails when the body did not end
    /// within the peek limit or is not a manifest.
    pub fn from_peeked(peeked: &Peeked) -> Result<Self> {
        if !peeked.complete {
            bail!("manifest exceeds {MANIFEST_PEEK_LIMIT} bytes");
        }
        serde_json::from_slice(&peeked.prefix).context("parse manifest JSON")
    }

    /// Bytes a full pull transfers: the config blob plus every layer.
    pub fn total_size(&self) -> u64 {
        let config = self.config.as_ref().map_or(0, |config| config.size);
        self.layers
            .iter()
            .fold(config, |total, layer| total.saturating_add(layer.size))
    }

    /// Work items for every layer blob, rooted at the repository the
    /// manifest was pulled from.  Returns `None` when no repository can be
    /// derived from the parent's pull URL.
    ///
    /// The config blob is not fetched here; it is cached when a client
    /// requests it.
    pub fn layer_works(&self, parent: &DownloadWork) -> Option<Vec<DownloadWork>> {
        let base = repository_base(&parent.pull_url)?;
        let works = self
            .layers
            .iter()
            .filter(|layer| !layer.digest.is_empty())
            .map(|layer| {
                DownloadWork::new(
                    &parent.bucket,
                    format!("blobs/{}", layer.digest),
                    format!("{base}/blobs/{}", layer.digest),
                )
                .media_type(&layer.media_type)
                .authorization(&parent.authorization)
            })
            .collect();
        Some(works)
    }
}

/// `https://host[:port]/v2/<repo>` for a manifest pull URL of the form
/// `https://host[:port]/v2/<repo>/manifests/<reference>`.
pub fn repository_base(pull_url: &str) -> Option<String> {
    let url = Url::parse(pull_url).ok()?;
    let path = url.path();
    let rest = path.find("/v2/").map(|i| &path[i + "/v2/".len()..])?;
    let repo = &rest[..rest.find("/manifests/")?];
    if repo.is_empty() {
        return None;
    }
    Some(format!("{}/v2/{repo}", url.origin().ascii_serialization()))
}
