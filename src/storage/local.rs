//! Local-directory object store.
//!
//! Objects live under `{root}/{bucket}/{key}`; their metadata (content type,
//! content disposition) is kept in a JSON sidecar under
//! `{root}/.meta/{bucket}/{key}.json`.  Writes go to a uniquely named temp
//! file first and are renamed into place, so readers never observe a partial
//! object.

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::{debug, instrument, warn};

use super::{BodyStream, ListFilter, ObjectInfo, ObjectStore, PresignMethod, PutObject, StoredObject};

const META_DIR: &str = ".meta";

#[derive(Debug, Default, Serialize, Deserialize)]
struct Sidecar {
    content_type: Option<String>,
    content_disposition: Option<String>,
}

/// Object store backed by a directory on local disk.
#[derive(Debug, Clone)]
pub struct LocalStore {
    pub base_path: PathBuf,
}

impl LocalStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    /// Return the on-disk path for an object.
    pub fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf> {
        Ok(self.base_path.join(safe_relative(bucket)?).join(safe_relative(key)?))
    }

    fn sidecar_path(&self, bucket: &str, key: &str) -> Result<PathBuf> {
        let mut path = self
            .base_path
            .join(META_DIR)
            .join(safe_relative(bucket)?)
            .join(safe_relative(key)?);
        let mut name = path.file_name().unwrap_or_default().to_os_string();
        name.push(".json");
        path.set_file_name(name);
        Ok(path)
    }

    async fn read_sidecar(&self, bucket: &str, key: &str) -> Sidecar {
        let Ok(path) = self.sidecar_path(bucket, key) else {
            return Sidecar::default();
        };
        match tokio::fs::read(&path).await {
            Ok(raw) => serde_json::from_slice(&raw).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "ignoring unreadable metadata sidecar");
                Sidecar::default()
            }),
            Err(_) => Sidecar::default(),
        }
    }
}

/// Reject keys that would escape the store root.
fn safe_relative(key: &str) -> Result<&Path> {
    let trimmed = key.trim_start_matches('/');
    if trimmed.is_empty() || trimmed.contains('\0') || trimmed.contains('\\') {
        bail!("invalid object key: {key:?}");
    }
    let path = Path::new(trimmed);
    if !path.components().all(|c| matches!(c, Component::Normal(_))) {
        bail!("invalid object key: {key:?}");
    }
    Ok(path)
}

async fn write_atomically(dest: &Path, mut body: BodyStream) -> Result<u64> {
    let parent = dest.parent().unwrap_or_else(|| Path::new("."));
    tokio::fs::create_dir_all(parent)
        .await
        .with_context(|| format!("create parent dirs for {}", dest.display()))?;

    // Unique per writer; the `.tmp` suffix keeps it out of listings.
    let tmp = tempfile::Builder::new()
        .prefix(".")
        .suffix(".tmp")
        .tempfile_in(parent)
        .with_context(|| format!("create temp file in {}", parent.display()))?;
    let mut file = tokio::fs::File::from_std(
        tmp.reopen()
            .with_context(|| format!("open temp file {}", tmp.path().display()))?,
    );

    // Dropping `tmp` on any error below removes the temp file.
    let mut written: u64 = 0;
    while let Some(chunk) = body.next().await {
        let chunk = chunk.context("read object body")?;
        file.write_all(&chunk)
            .await
            .with_context(|| format!("write {}", tmp.path().display()))?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    drop(file);

    tmp.persist(dest)
        .map_err(|e| e.error)
        .with_context(|| format!("move temp file into place at {}", dest.display()))?;
    Ok(written)
}

#[async_trait::async_trait]
impl ObjectStore for LocalStore {
    async fn exists(&self, bucket: &str, key: &str) -> Result<bool> {
        let path = self.object_path(bucket, key)?;
        Ok(tokio::fs::metadata(&path).await.is_ok_and(|m| m.is_file()))
    }

    #[instrument(skip(self), fields(%bucket, %key))]
    async fn get(&self, bucket: &str, key: &str) -> Result<StoredObject> {
        let path = self.object_path(bucket, key)?;
        let file = tokio::fs::File::open(&path)
            .await
            .with_context(|| format!("open cached object {}", path.display()))?;
        let meta = file.metadata().await?;
        let sidecar = self.read_sidecar(bucket, key).await;

        Ok(StoredObject {
            body: Box::pin(ReaderStream::new(file)),
            content_type: sidecar.content_type,
            content_length: Some(meta.len()),
            content_disposition: sidecar.content_disposition,
            last_modified: meta.modified().ok().map(DateTime::<Utc>::from),
        })
    }

    #[instrument(skip(self, object), fields(%bucket, %key))]
    async fn put(&self, bucket: &str, key: &str, object: PutObject) -> Result<()> {
        let path = self.object_path(bucket, key)?;
        let sidecar = Sidecar {
            content_type: Some(object.content_type),
            content_disposition: object.content_disposition.filter(|d| !d.is_empty()),
        };

        let written = write_atomically(&path, object.body).await?;

        let sidecar_path = self.sidecar_path(bucket, key)?;
        let raw = serde_json::to_vec(&sidecar)?;
        write_atomically(&sidecar_path, super::body_from_bytes(raw)).await?;

        debug!(path = %path.display(), bytes = written, "object written to local store");
        Ok(())
    }

    #[instrument(skip(self, filter), fields(%bucket))]
    async fn list(&self, bucket: &str, filter: &ListFilter) -> Result<Vec<ObjectInfo>> {
        let root = self.base_path.join(safe_relative(bucket)?);
        let files = tokio::task::spawn_blocking(move || walk_files(&root))
            .await
            .context("local listing task panicked")??;

        let mut objects = Vec::new();
        for (key, last_modified) in files {
            let sidecar = self.read_sidecar(bucket, &key).await;
            if filter.matches(sidecar.content_type.as_deref(), last_modified) {
                objects.push(ObjectInfo {
                    key,
                    content_type: sidecar.content_type,
                    last_modified,
                });
            }
        }
        Ok(objects)
    }

    async fn presign(
        &self,
        _bucket: &str,
        _key: &str,
        _method: PresignMethod,
        _ttl: Duration,
    ) -> Result<Option<String>> {
        Ok(None)
    }
}

/// Recursively collect `(key, mtime)` for every finished object under `root`.
fn walk_files(root: &Path) -> Result<Vec<(String, DateTime<Utc>)>> {
    let mut out = Vec::new();
    if !root.exists() {
        return Ok(out);
    }

    let mut stack = vec![root.to_path_buf()];
    while let Some(current) = stack.pop() {
        let entries = std::fs::read_dir(&current)
            .with_context(|| format!("failed to read directory: {}", current.display()))?;
        for entry in entries {
            let entry = entry?;
            let meta = entry.metadata()?;
            if meta.is_dir() {
                stack.push(entry.path());
                continue;
            }
            let path = entry.path();
            if path.extension().is_some_and(|e| e == "tmp") {
                continue;
            }
            let Ok(rel) = path.strip_prefix(root) else {
                continue;
            };
            let key = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            let modified = meta.modified().map(DateTime::<Utc>::from)?;
            out.push((key, modified));
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{body_from_bytes, collect_body};

    fn put_request(body: &'static [u8], content_type: &str) -> PutObject {
        PutObject {
            body: body_from_bytes(body),
            content_type: content_type.to_string(),
            content_length: Some(body.len() as u64),
            content_disposition: None,
        }
    }

    #[tokio::test]
    async fn put_then_get_round_trips_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path());

        assert!(!store.exists("cache", "v2/lib/foo/manifests/latest").await.unwrap());
        store
            .put(
                "cache",
                "v2/lib/foo/manifests/latest",
                put_request(b"{}", "application/vnd.docker.distribution.manifest.v2+json"),
            )
            .await
            .unwrap();
        assert!(store.exists("cache", "v2/lib/foo/manifests/latest").await.unwrap());

        let obj = store.get("cache", "v2/lib/foo/manifests/latest").await.unwrap();
        assert_eq!(
            obj.content_type.as_deref(),
            Some("application/vnd.docker.distribution.manifest.v2+json")
        );
        assert_eq!(obj.content_length, Some(2));
        assert_eq!(&collect_body(obj.body).await.unwrap()[..], b"{}");
    }

    #[tokio::test]
    async fn list_applies_content_type_filter_and_skips_sidecars() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path());
        store
            .put("cache", "blobs/sha256:aaa", put_request(b"x", "application/octet-stream"))
            .await
            .unwrap();
        store
            .put("cache", "v2/a/b/manifests/1", put_request(b"{}", "application/json"))
            .await
            .unwrap();

        let filter = ListFilter {
            content_type: Some("application/json".into()),
            modified_before: Some(Utc::now() + chrono::Duration::minutes(1)),
        };
        let listed = store.list("cache", &filter).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].key, "v2/a/b/manifests/1");
    }

    #[tokio::test]
    async fn concurrent_puts_of_one_key_both_succeed() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path());

        let (first, second) = tokio::join!(
            store.put("cache", "blobs/sha256:aaa", put_request(b"layer", "application/octet-stream")),
            store.put("cache", "blobs/sha256:aaa", put_request(b"layer", "application/octet-stream")),
        );
        first.unwrap();
        second.unwrap();

        let obj = store.get("cache", "blobs/sha256:aaa").await.unwrap();
        assert_eq!(&collect_body(obj.body).await.unwrap()[..], b"layer");

        let listed = store.list("cache", &ListFilter::default()).await.unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn failed_body_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path());
        let body: BodyStream = Box::pin(futures::stream::iter(vec![
            Ok(bytes::Bytes::from_static(b"partial")),
            Err(std::io::Error::other("origin reset")),
        ]));
        let put = PutObject {
            body,
            content_type: "application/octet-stream".into(),
            content_length: None,
            content_disposition: None,
        };

        assert!(store.put("cache", "blobs/sha256:bad", put).await.is_err());
        assert!(!store.exists("cache", "blobs/sha256:bad").await.unwrap());
        let leftovers = std::fs::read_dir(dir.path().join("cache/blobs")).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn presign_is_unsupported() {
        let store = LocalStore::new("/nonexistent");
        let url = store
            .presign("cache", "blobs/x", PresignMethod::Get, Duration::from_secs(60))
            .await
            .unwrap();
        assert!(url.is_none());
    }

    #[test]
    fn traversal_keys_rejected() {
        let store = LocalStore::new("/var/cache/modelcache");
        assert!(store.object_path("cache", "../etc/passwd").is_err());
        assert!(store.object_path("cache", "v2/../../x").is_err());
        assert!(store.object_path("cache", "").is_err());
        assert_eq!(
            store.object_path("cache", "blobs/sha256:abc").unwrap(),
            PathBuf::from("/var/cache/modelcache/cache/blobs/sha256:abc")
        );
    }
}
