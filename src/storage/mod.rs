//! Object store layer.
//!
//! The [`ObjectStore`] trait is the single source of truth for cached content.
//! [`s3::S3Store`] talks to S3 (or an S3-compatible store such as Tigris) and
//! hands out pre-signed URLs; [`local::LocalStore`] keeps objects in a local
//! directory for single-node deployments and streams hits itself.

pub mod local;
#[cfg(test)]
pub mod memory;
pub mod s3;

use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;

/// A streamed object body.
pub type BodyStream = BoxStream<'static, std::io::Result<Bytes>>;

/// HTTP method a pre-signed URL is scoped to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresignMethod {
    Get,
    Head,
}

/// Everything needed to write one object.
pub struct PutObject {
    pub body: BodyStream,
    pub content_type: String,
    /// Exact body length when the origin announced one.
    pub content_length: Option<u64>,
    pub content_disposition: Option<String>,
}

/// An object read back from the store.
pub struct StoredObject {
    pub body: BodyStream,
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
    pub content_disposition: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
}

/// One entry returned by [`ObjectStore::list`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub key: String,
    pub content_type: Option<String>,
    pub last_modified: DateTime<Utc>,
}

/// Server- or client-side filter applied by [`ObjectStore::list`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListFilter {
    /// Only objects stored with exactly this content type.
    pub content_type: Option<String>,
    /// Only objects last modified strictly before this instant.
    pub modified_before: Option<DateTime<Utc>>,
}

impl ListFilter {
    /// Whether an object with the given metadata passes the filter.
    pub fn matches(&self, content_type: Option<&str>, last_modified: DateTime<Utc>) -> bool {
        if let Some(wanted) = &self.content_type
            && content_type != Some(wanted.as_str())
        {
            return false;
        }
        if let Some(cutoff) = self.modified_before
            && last_modified >= cutoff
        {
            return false;
        }
        true
    }

    /// Render the filter in the Tigris metadata query syntax.
    pub fn to_query(&self) -> Option<String> {
        let mut clauses = Vec::new();
        if let Some(ct) = &self.content_type {
            clauses.push(format!("`Content-Type` = {ct:?}"));
        }
        if let Some(cutoff) = self.modified_before {
            let ts = cutoff.to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
            clauses.push(format!("`Last-Modified` < {ts:?}"));
        }
        if clauses.is_empty() {
            None
        } else {
            Some(clauses.join(" AND "))
        }
    }
}

/// Durable key/value blob store backing the cache.
///
/// Concurrent writers to the same key are resolved by the store itself
/// (last write wins).
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    /// Check whether `key` exists in `bucket`.
    async fn exists(&self, bucket: &str, key: &str) -> Result<bool>;

    /// Open an object for reading.
    async fn get(&self, bucket: &str, key: &str) -> Result<StoredObject>;

    /// Write (or overwrite) an object, consuming its body stream.
    async fn put(&self, bucket: &str, key: &str, object: PutObject) -> Result<()>;

    /// List objects matching `filter`.
    async fn list(&self, bucket: &str, filter: &ListFilter) -> Result<Vec<ObjectInfo>>;

    /// Issue a time-limited URL for direct client access.
    ///
    /// Returns `Ok(None)` when the store cannot hand out URLs and the caller
    /// has to stream the object itself.
    async fn presign(
        &self,
        bucket: &str,
        key: &str,
        method: PresignMethod,
        ttl: Duration,
    ) -> Result<Option<String>>;
}

/// Wrap an in-memory buffer as a [`BodyStream`].
pub fn body_from_bytes(bytes: impl Into<Bytes>) -> BodyStream {
    Box::pin(futures::stream::once(futures::future::ready(Ok(bytes.into()))))
}

/// Adapt any fallible byte stream (e.g. a `reqwest` response) into a
/// [`BodyStream`].
pub fn into_body_stream<S, E>(stream: S) -> BodyStream
where
    S: futures::Stream<Item = std::result::Result<Bytes, E>> + Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    use futures::TryStreamExt;

    Box::pin(stream.map_err(std::io::Error::other))
}

/// Collect a [`BodyStream`] into one buffer.  Only for small objects such as
/// JSON metadata.
pub async fn collect_body(mut body: BodyStream) -> std::io::Result<Bytes> {
    use futures::StreamExt;

    let mut buf = bytes::BytesMut::new();
    while let Some(chunk) = body.next().await {
        buf.extend_from_slice(&chunk?);
    }
    Ok(buf.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn filter_matches_content_type_and_cutoff() {
        let cutoff = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let filter = ListFilter {
            content_type: Some("application/json".into()),
            modified_before: Some(cutoff),
        };
        let old = Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap();
        assert!(filter.matches(Some("application/json"), old));
        assert!(!filter.matches(Some("text/plain"), old));
        assert!(!filter.matches(None, old));
        assert!(!filter.matches(Some("application/json"), cutoff));
    }

    #[test]
    fn empty_filter_matches_everything() {
        let filter = ListFilter::default();
        assert!(filter.matches(None, Utc::now()));
        assert_eq!(filter.to_query(), None);
    }

    #[test]
    fn query_uses_tigris_syntax() {
        let filter = ListFilter {
            content_type: Some("application/vnd.civitai.model+json".into()),
            modified_before: Some(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()),
        };
        assert_eq!(
            filter.to_query().unwrap(),
            "`Content-Type` = \"application/vnd.civitai.model+json\" AND \
             `Last-Modified` < \"2024-05-01T12:00:00Z\""
        );
    }

    #[tokio::test]
    async fn body_round_trips_through_collect() {
        let body = body_from_bytes(&b"hello"[..]);
        assert_eq!(collect_body(body).await.unwrap(), Bytes::from_static(b"hello"));
    }
}
