//! In-memory [`ObjectStore`] used by the test suites.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use bytes::Bytes;
use chrono::{DateTime, Utc};

use super::{
    BodyStream, ListFilter, ObjectInfo, ObjectStore, PresignMethod, PutObject, StoredObject,
    body_from_bytes, collect_body,
};

#[derive(Debug, Clone)]
pub struct MemoryObject {
    pub data: Bytes,
    pub content_type: String,
    pub content_length: Option<u64>,
    pub content_disposition: Option<String>,
    pub last_modified: DateTime<Utc>,
}

#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<HashMap<(String, String), MemoryObject>>,
    /// Number of upcoming puts that fail before touching the map.
    failing_puts: AtomicUsize,
    pub put_attempts: AtomicUsize,
    pub fail_presign: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, bucket: &str, key: &str, data: &[u8], content_type: &str) {
        self.insert_at(bucket, key, data, content_type, Utc::now());
    }

    pub fn insert_at(
        &self,
        bucket: &str,
        key: &str,
        data: &[u8],
        content_type: &str,
        last_modified: DateTime<Utc>,
    ) {
        self.objects.lock().unwrap().insert(
            (bucket.to_string(), key.to_string()),
            MemoryObject {
                data: Bytes::copy_from_slice(data),
                content_type: content_type.to_string(),
                content_length: Some(data.len() as u64),
                content_disposition: None,
                last_modified,
            },
        );
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<MemoryObject> {
        self.objects
            .lock()
            .unwrap()
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    pub fn fail_next_puts(&self, n: usize) {
        self.failing_puts.store(n, Ordering::SeqCst);
    }

    pub fn presigned_url(bucket: &str, key: &str, method: PresignMethod) -> String {
        format!("https://store.test/{bucket}/{key}?method={method:?}&signature=test")
    }
}

#[async_trait::async_trait]
impl ObjectStore for MemoryStore {
    async fn exists(&self, bucket: &str, key: &str) -> Result<bool> {
        Ok(self.object(bucket, key).is_some())
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<StoredObject> {
        let obj = self
            .object(bucket, key)
            .ok_or_else(|| anyhow!("no such object: {bucket}/{key}"))?;
        let body: BodyStream = body_from_bytes(obj.data);
        Ok(StoredObject {
            body,
            content_type: Some(obj.content_type),
            content_length: obj.content_length,
            content_disposition: obj.content_disposition,
            last_modified: Some(obj.last_modified),
        })
    }

    async fn put(&self, bucket: &str, key: &str, object: PutObject) -> Result<()> {
        self.put_attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self.failing_puts.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_puts.store(failing - 1, Ordering::SeqCst);
            bail!("injected put failure");
        }

        let data = collect_body(object.body).await?;
        self.objects.lock().unwrap().insert(
            (bucket.to_string(), key.to_string()),
            MemoryObject {
                data,
                content_type: object.content_type,
                content_length: object.content_length,
                content_disposition: object.content_disposition,
                last_modified: Utc::now(),
            },
        );
        Ok(())
    }

    async fn list(&self, bucket: &str, filter: &ListFilter) -> Result<Vec<ObjectInfo>> {
        let objects = self.objects.lock().unwrap();
        let mut out: Vec<ObjectInfo> = objects
            .iter()
            .filter(|((b, _), _)| b == bucket)
            .filter(|(_, obj)| filter.matches(Some(obj.content_type.as_str()), obj.last_modified))
            .map(|((_, key), obj)| ObjectInfo {
                key: key.clone(),
                content_type: Some(obj.content_type.clone()),
                last_modified: obj.last_modified,
            })
            .collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(out)
    }

    async fn presign(
        &self,
        bucket: &str,
        key: &str,
        method: PresignMethod,
        _ttl: Duration,
    ) -> Result<Option<String>> {
        if self.fail_presign.load(Ordering::SeqCst) {
            bail!("injected presign failure");
        }
        Ok(Some(Self::presigned_url(bucket, key, method)))
    }
}
