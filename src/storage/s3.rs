use std::time::Duration;

use anyhow::{Context, Result};
use aws_sdk_s3::Client;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::{debug, instrument, warn};

use super::{BodyStream, ListFilter, ObjectInfo, ObjectStore, PresignMethod, PutObject, StoredObject};

/// S3 (or S3-compatible) implementation of [`ObjectStore`].
#[derive(Clone)]
pub struct S3Store {
    pub client: Client,
    /// Send listing filters as an `X-Tigris-Query` header instead of
    /// checking every candidate with `HeadObject`.
    pub server_side_query: bool,
}

impl S3Store {
    pub fn new(client: Client, server_side_query: bool) -> Self {
        Self {
            client,
            server_side_query,
        }
    }
}

#[async_trait::async_trait]
impl ObjectStore for S3Store {
    async fn exists(&self, bucket: &str, key: &str) -> Result<bool> {
        object_exists(&self.client, bucket, key).await
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<StoredObject> {
        get_object(&self.client, bucket, key).await
    }

    async fn put(&self, bucket: &str, key: &str, object: PutObject) -> Result<()> {
        put_object(&self.client, bucket, key, object).await
    }

    async fn list(&self, bucket: &str, filter: &ListFilter) -> Result<Vec<ObjectInfo>> {
        list_objects(&self.client, bucket, filter, self.server_side_query).await
    }

    async fn presign(
        &self,
        bucket: &str,
        key: &str,
        method: PresignMethod,
        ttl: Duration,
    ) -> Result<Option<String>> {
        generate_presigned_url(&self.client, bucket, key, method, ttl)
            .await
            .map(Some)
    }
}

// ---------------------------------------------------------------------------
// Free functions over an explicit client, bucket and key.
// ---------------------------------------------------------------------------

/// Check whether an object exists in S3 (HEAD request).
#[instrument(skip(client), fields(%bucket, %key))]
pub async fn object_exists(client: &Client, bucket: &str, key: &str) -> Result<bool> {
    match client.head_object().bucket(bucket).key(key).send().await {
        Ok(_) => {
            debug!("object exists");
            Ok(true)
        }
        Err(err) => {
            // The SDK returns a service error with code "NotFound" (or an
            // HTTP 404) when the object does not exist.
            if err.as_service_error().is_some_and(|e| e.is_not_found()) {
                debug!("object does not exist");
                Ok(false)
            } else {
                Err(err).context("S3 HeadObject")
            }
        }
    }
}

/// Open an S3 object as a stream.
#[instrument(skip(client), fields(%bucket, %key))]
pub async fn get_object(client: &Client, bucket: &str, key: &str) -> Result<StoredObject> {
    let resp = client
        .get_object()
        .bucket(bucket)
        .key(key)
        .send()
        .await
        .context("S3 GetObject")?;

    let content_type = resp.content_type().map(str::to_owned);
    let content_length = resp.content_length().and_then(|l| u64::try_from(l).ok());
    let content_disposition = resp.content_disposition().map(str::to_owned);
    let last_modified = resp.last_modified().and_then(to_chrono);

    let body: BodyStream = Box::pin(ReaderStream::new(resp.body.into_async_read()));

    Ok(StoredObject {
        body,
        content_type,
        content_length,
        content_disposition,
        last_modified,
    })
}

/// Stream a body into S3.
///
/// `PutObject` needs the length up front.  When the origin did not announce
/// one, the body is spooled to a temporary file first.
#[instrument(skip(client, object), fields(%bucket, %key, content_type = %object.content_type))]
pub async fn put_object(client: &Client, bucket: &str, key: &str, object: PutObject) -> Result<()> {
    let PutObject {
        body,
        content_type,
        content_length,
        content_disposition,
    } = object;

    // The spool file (if any) is held until the upload has finished.
    let (stream, length, _spool) = match content_length {
        Some(len) => {
            let body = reqwest::Body::wrap_stream(body);
            (ByteStream::from_body_1_x(body), len, None)
        }
        None => {
            let (file, len) = spool_to_tempfile(body).await?;
            let stream = ByteStream::from_path(file.path())
                .await
                .context("open spool file for upload")?;
            (stream, len, Some(file))
        }
    };

    let mut req = client
        .put_object()
        .bucket(bucket)
        .key(key)
        .body(stream)
        .content_type(content_type)
        .content_length(i64::try_from(length).context("object too large")?);

    if let Some(disposition) = content_disposition.filter(|d| !d.is_empty()) {
        req = req.content_disposition(disposition);
    }

    req.send().await.context("S3 PutObject")?;

    debug!(bytes = length, "object uploaded");
    Ok(())
}

async fn spool_to_tempfile(mut body: BodyStream) -> Result<(tempfile::NamedTempFile, u64)> {
    let spool = tempfile::NamedTempFile::new().context("failed to create spool file")?;
    let mut file = tokio::fs::File::create(spool.path())
        .await
        .context("open spool file")?;

    let mut written: u64 = 0;
    while let Some(chunk) = body.next().await {
        let chunk = chunk.context("read body while spooling")?;
        file.write_all(&chunk).await.context("write spool file")?;
        written += chunk.len() as u64;
    }
    file.flush().await?;

    Ok((spool, written))
}

/// Generate a pre-signed URL for an S3 object, scoped to `method`.
#[instrument(skip(client), fields(%bucket, %key, ?method))]
pub async fn generate_presigned_url(
    client: &Client,
    bucket: &str,
    key: &str,
    method: PresignMethod,
    ttl: Duration,
) -> Result<String> {
    let presigning = PresigningConfig::builder()
        .expires_in(ttl)
        .build()
        .context("build PresigningConfig")?;

    let req = match method {
        PresignMethod::Get => client
            .get_object()
            .bucket(bucket)
            .key(key)
            .presigned(presigning)
            .await
            .context("presign GetObject")?,
        PresignMethod::Head => client
            .head_object()
            .bucket(bucket)
            .key(key)
            .presigned(presigning)
            .await
            .context("presign HeadObject")?,
    };

    let url = req.uri().to_string();
    debug!("presigned URL generated");
    Ok(url)
}

/// List every object in the bucket that passes `filter`.
///
/// Automatically paginates through all results.  The last-modified cutoff is
/// always re-applied locally; the content type comes either from the
/// server-side query or from a `HeadObject` per candidate.
#[instrument(skip(client, filter), fields(%bucket))]
pub async fn list_objects(
    client: &Client,
    bucket: &str,
    filter: &ListFilter,
    server_side_query: bool,
) -> Result<Vec<ObjectInfo>> {
    let query = if server_side_query { filter.to_query() } else { None };

    let mut candidates = Vec::new();
    let mut continuation_token: Option<String> = None;

    loop {
        let mut req = client.list_objects_v2().bucket(bucket);

        if let Some(ref token) = continuation_token {
            req = req.continuation_token(token);
        }

        let resp = match &query {
            Some(q) => {
                let q = q.clone();
                req.customize()
                    .mutate_request(move |http_req| {
                        http_req.headers_mut().insert("X-Tigris-Query", q.clone());
                    })
                    .send()
                    .await
            }
            None => req.send().await,
        }
        .context("S3 ListObjectsV2")?;

        for obj in resp.contents() {
            let (Some(key), Some(modified)) = (obj.key(), obj.last_modified().and_then(to_chrono))
            else {
                continue;
            };
            if let Some(cutoff) = filter.modified_before
                && modified >= cutoff
            {
                continue;
            }
            candidates.push((key.to_string(), modified));
        }

        match resp.next_continuation_token() {
            Some(token) => continuation_token = Some(token.to_string()),
            None => break,
        }
    }

    let mut objects = Vec::with_capacity(candidates.len());
    for (key, last_modified) in candidates {
        let content_type = match (&filter.content_type, server_side_query) {
            (Some(wanted), true) => Some(wanted.clone()),
            (None, _) => None,
            (Some(_), false) => match head_content_type(client, bucket, &key).await {
                Ok(ct) => ct,
                Err(e) => {
                    warn!(%key, error = %e, "failed to read object metadata during listing");
                    continue;
                }
            },
        };
        if filter.matches(content_type.as_deref(), last_modified) {
            objects.push(ObjectInfo {
                key,
                content_type,
                last_modified,
            });
        }
    }

    debug!(count = objects.len(), "listed objects");
    Ok(objects)
}

async fn head_content_type(client: &Client, bucket: &str, key: &str) -> Result<Option<String>> {
    let resp = client
        .head_object()
        .bucket(bucket)
        .key(key)
        .send()
        .await
        .context("S3 HeadObject")?;
    Ok(resp.content_type().map(str::to_owned))
}

fn to_chrono(ts: &aws_sdk_s3::primitives::DateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(ts.secs(), ts.subsec_nanos())
}

