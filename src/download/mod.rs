//! Deduplicating download queue.
//!
//! Request handlers call [`Downloader::fetch`] on a cache miss.  The pull URL
//! is marked in flight, the work item is put on a bounded queue, and a fixed
//! pool of workers copies the origin body into the object store.  A URL that
//! is already in flight is silently dropped, so concurrent misses for the same
//! object cause a single origin download.
//!
//! Workers never wait on the bounded queue themselves: retries and manifest
//! layer fan-out go through [`Downloader::enqueue_from_worker`], which spills
//! into an overflow list that workers drain first.

pub mod manifest;
pub mod replay;

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use prometheus_client::encoding::EncodeLabelValue;
use reqwest::header::{AUTHORIZATION, CONTENT_DISPOSITION, CONTENT_TYPE};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{DownloaderConfig, InFlightPolicy};
use crate::metrics::Metrics;
use crate::storage::{BodyStream, ObjectStore, PutObject, into_body_stream};

use self::manifest::{MANIFEST_PEEK_LIMIT, Manifest};

const DEFAULT_MEDIA_TYPE: &str = "application/octet-stream";

// ---------------------------------------------------------------------------
// Work items
// ---------------------------------------------------------------------------

/// One object to copy from an origin into the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadWork {
    pub bucket: String,
    pub key: String,
    pub pull_url: String,
    /// Content type to store the object under.  Empty means "use whatever
    /// the origin sends".
    pub media_type: String,
    /// Forwarded verbatim as the `Authorization` header; omitted when empty.
    pub authorization: String,
    /// Download even if the key already exists (used to refresh stale
    /// mutable objects).
    pub force_refresh: bool,
    attempt: u32,
    not_before: Option<Instant>,
}

impl DownloadWork {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>, pull_url: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            pull_url: pull_url.into(),
            media_type: String::new(),
            authorization: String::new(),
            force_refresh: false,
            attempt: 0,
            not_before: None,
        }
    }

    pub fn media_type(mut self, media_type: impl Into<String>) -> Self {
        self.media_type = media_type.into();
        self
    }

    pub fn authorization(mut self, authorization: impl Into<String>) -> Self {
        self.authorization = authorization.into();
        self
    }

    pub fn force_refresh(mut self) -> Self {
        self.force_refresh = true;
        self
    }

    #[cfg(test)]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

/// Result of processing one work item.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum WorkOutcome {
    Stored,
    AlreadyCached,
    OriginFailed,
    /// The store write failed and a retry has been queued.
    Retrying,
    /// The store write failed on the last permitted attempt.
    DeadLettered,
}

impl WorkOutcome {
    /// Whether the pull URL is done with (no retry pending).
    pub fn is_terminal(self) -> bool {
        !matches!(self, WorkOutcome::Retrying)
    }
}

// ---------------------------------------------------------------------------
// In-flight set
// ---------------------------------------------------------------------------

/// Pull URLs that currently have a work item queued or being processed.
#[derive(Debug, Default)]
pub struct InFlightSet {
    urls: Mutex<HashSet<String>>,
}

impl InFlightSet {
    /// Mark `url` in flight.  Returns `false` if it already was.
    pub fn try_mark(&self, url: &str) -> bool {
        let mut urls = self.urls.lock().unwrap_or_else(PoisonError::into_inner);
        if urls.contains(url) {
            return false;
        }
        urls.insert(url.to_string())
    }

    pub fn release(&self, url: &str) {
        self.urls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(url);
    }

    #[cfg(test)]
    pub fn contains(&self, url: &str) -> bool {
        self.urls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(url)
    }

    fn len(&self) -> usize {
        self.urls.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

// ---------------------------------------------------------------------------
// Downloader
// ---------------------------------------------------------------------------

/// Cheaply cloneable handle to the shared fetch queue.
#[derive(Clone)]
pub struct Downloader {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn ObjectStore>,
    client: reqwest::Client,
    config: DownloaderConfig,
    /// Origin content type that marks a manifest served with the wrong type.
    mislabeled_content_type: String,
    metrics: Arc<Metrics>,
    in_flight: InFlightSet,
    tx: mpsc::Sender<DownloadWork>,
    rx: tokio::sync::Mutex<mpsc::Receiver<DownloadWork>>,
    overflow: Mutex<VecDeque<DownloadWork>>,
}

impl Downloader {
    /// `client` must follow redirects: blob downloads commonly bounce to a
    /// CDN.
    pub fn new(
        store: Arc<dyn ObjectStore>,
        client: reqwest::Client,
        config: DownloaderConfig,
        mislabeled_content_type: impl Into<String>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                store,
                client,
                config,
                mislabeled_content_type: mislabeled_content_type.into(),
                metrics,
                in_flight: InFlightSet::default(),
                tx,
                rx: tokio::sync::Mutex::new(rx),
                overflow: Mutex::new(VecDeque::new()),
            }),
        }
    }

    #[cfg(test)]
    pub fn in_flight(&self) -> &InFlightSet {
        &self.inner.in_flight
    }

    /// Queue `work` unless its pull URL is already in flight.
    ///
    /// Waits for room when the queue is full.  Returns whether the work was
    /// accepted.
    #[instrument(skip(self, work), fields(key = %work.key, pull_url = %work.pull_url))]
    pub async fn fetch(&self, work: DownloadWork) -> bool {
        if !self.mark(&work.pull_url) {
            return false;
        }

        let pull_url = work.pull_url.clone();
        if self.inner.tx.send(work).await.is_err() {
            warn!("fetch queue closed, dropping work");
            self.release(&pull_url);
            return false;
        }

        self.inner.metrics.fetch_enqueued.inc();
        debug!("fetch queued");
        true
    }

    /// Queue `work` from inside a worker without ever waiting on the bounded
    /// queue.
    pub fn enqueue_from_worker(&self, work: DownloadWork) -> bool {
        if !self.mark(&work.pull_url) {
            return false;
        }
        self.push_nonblocking(work);
        self.inner.metrics.fetch_enqueued.inc();
        true
    }

    fn push_nonblocking(&self, work: DownloadWork) {
        match self.inner.tx.try_send(work) {
            Ok(()) => {}
            Err(TrySendError::Full(work)) => {
                debug!(key = %work.key, "fetch queue full, using overflow");
                self.inner
                    .overflow
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push_back(work);
            }
            Err(TrySendError::Closed(work)) => {
                warn!(key = %work.key, "fetch queue closed, dropping work");
                self.release(&work.pull_url);
            }
        }
    }

    fn mark(&self, pull_url: &str) -> bool {
        if !self.inner.in_flight.try_mark(pull_url) {
            debug!(%pull_url, "already in flight");
            self.inner.metrics.fetch_deduplicated.inc();
            return false;
        }
        self.inner
            .metrics
            .fetch_in_flight
            .set(self.inner.in_flight.len() as i64);
        true
    }

    fn release(&self, pull_url: &str) {
        self.inner.in_flight.release(pull_url);
        self.inner
            .metrics
            .fetch_in_flight
            .set(self.inner.in_flight.len() as i64);
    }

    // -----------------------------------------------------------------------
    // Workers
    // -----------------------------------------------------------------------

    /// Spawn the configured number of worker tasks.
    pub fn spawn_workers(&self, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        (0..self.inner.config.workers.max(1))
            .map(|id| {
                let downloader = self.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move { downloader.run_worker(id, cancel).await })
            })
            .collect()
    }

    /// Worker loop.  Exits when `cancel` fires or the queue is closed.  Work
    /// already taken off the queue runs to completion first.
    pub async fn run_worker(self, id: usize, cancel: CancellationToken) {
        info!(worker = id, "download worker started");
        loop {
            if cancel.is_cancelled() {
                break;
            }
            let work = tokio::select! {
                _ = cancel.cancelled() => break,
                work = self.next_work() => work,
            };
            let Some(work) = work else {
                break;
            };
            self.process(work).await;
        }
        info!(worker = id, "download worker stopped");
    }

    async fn next_work(&self) -> Option<DownloadWork> {
        if let Some(work) = self.pop_overflow() {
            return Some(work);
        }
        self.inner.rx.lock().await.recv().await
    }

    fn pop_overflow(&self) -> Option<DownloadWork> {
        self.inner
            .overflow
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    /// Process one work item to an outcome, releasing its in-flight mark
    /// when no retry is pending and the release policy allows it.
    pub async fn process(&self, work: DownloadWork) -> WorkOutcome {
        let pull_url = work.pull_url.clone();
        let outcome = self.run_attempt(work).await;

        self.inner.metrics.record_outcome(outcome);
        if outcome.is_terminal()
            && self.inner.config.in_flight_policy == InFlightPolicy::ReleaseOnCompletion
        {
            self.release(&pull_url);
        }
        outcome
    }

    #[instrument(
        skip(self, work),
        fields(bucket = %work.bucket, key = %work.key, pull_url = %work.pull_url, attempt = work.attempt)
    )]
    async fn run_attempt(&self, work: DownloadWork) -> WorkOutcome {
        if let Some(not_before) = work.not_before {
            tokio::time::sleep_until(not_before).await;
        }

        if !work.force_refresh {
            match self.inner.store.exists(&work.bucket, &work.key).await {
                Ok(true) => {
                    debug!("already cached");
                    return WorkOutcome::AlreadyCached;
                }
                Ok(false) => {}
                Err(e) => warn!(error = %e, "existence check failed, downloading anyway"),
            }
        }

        let mut req = self.inner.client.get(&work.pull_url);
        if !work.authorization.is_empty() {
            req = req.header(AUTHORIZATION, &work.authorization);
        }
        let resp = match req.send().await {
            Ok(resp) if resp.status().is_success() => resp,
            Ok(resp) => {
                warn!(status = %resp.status(), "origin returned an error");
                return WorkOutcome::OriginFailed;
            }
            Err(e) => {
                warn!(error = %e, "origin request failed");
                return WorkOutcome::OriginFailed;
            }
        };

        let origin_type = header_str(&resp, CONTENT_TYPE.as_str());
        let content_disposition = header_str(&resp, CONTENT_DISPOSITION.as_str());
        let content_length = resp.content_length();

        let mut media_type = if !work.media_type.is_empty() {
            work.media_type.clone()
        } else {
            origin_type
                .clone()
                .unwrap_or_else(|| DEFAULT_MEDIA_TYPE.to_string())
        };
        let mut body = into_body_stream(resp.bytes_stream());

        if origin_type
            .as_deref()
            .is_some_and(|ct| self.is_mislabeled_manifest(ct))
        {
            match self.inspect_manifest(&work, body, media_type).await {
                Ok((replayed, resolved)) => {
                    body = replayed;
                    media_type = resolved;
                }
                Err(e) => {
                    warn!(error = %e, "failed reading manifest body from origin");
                    return WorkOutcome::OriginFailed;
                }
            }
        }

        let object = PutObject {
            body,
            content_type: media_type,
            content_length,
            content_disposition,
        };
        match self.inner.store.put(&work.bucket, &work.key, object).await {
            Ok(()) => {
                info!("object stored");
                WorkOutcome::Stored
            }
            Err(e) => self.retry_or_dead_letter(work, e),
        }
    }

    fn is_mislabeled_manifest(&self, content_type: &str) -> bool {
        content_type
            .trim()
            .eq_ignore_ascii_case(self.inner.mislabeled_content_type.trim())
    }

    /// Peek at a mislabeled body.  A parseable manifest yields its declared
    /// media type and queues its layers; anything else is stored as-is under
    /// `fallback_type`.  The returned stream replays the whole body.
    async fn inspect_manifest(
        &self,
        work: &DownloadWork,
        body: BodyStream,
        fallback_type: String,
    ) -> std::io::Result<(BodyStream, String)> {
        let peeked = replay::peek(body, MANIFEST_PEEK_LIMIT).await?;

        let manifest = match Manifest::from_peeked(&peeked) {
            Ok(manifest) => manifest,
            Err(e) => {
                warn!(error = %e, "malformed manifest, storing raw body");
                self.inner.metrics.malformed_manifests.inc();
                return Ok((peeked.into_stream(), fallback_type));
            }
        };

        self.inner.metrics.manifests_rewritten.inc();
        let media_type = if manifest.media_type.is_empty() {
            fallback_type
        } else {
            manifest.media_type.clone()
        };

        match manifest.layer_works(work) {
            Some(layers) => {
                let total = layers.len();
                let queued = layers
                    .into_iter()
                    .map(|layer| self.enqueue_from_worker(layer))
                    .filter(|accepted| *accepted)
                    .count();
                debug!(
                    %media_type,
                    config = manifest.config.as_ref().map_or("", |c| c.digest.as_str()),
                    layers = total,
                    queued,
                    total_bytes = manifest.total_size(),
                    "manifest layers queued"
                );
            }
            None => warn!("no repository in pull URL, skipping layer prefetch"),
        }

        Ok((peeked.into_stream(), media_type))
    }

    fn retry_or_dead_letter(&self, mut work: DownloadWork, err: anyhow::Error) -> WorkOutcome {
        let next_attempt = work.attempt + 1;
        if next_attempt >= self.inner.config.max_put_attempts {
            error!(error = %err, attempts = next_attempt, "store write failed, giving up");
            return WorkOutcome::DeadLettered;
        }

        let delay = self.backoff(work.attempt);
        warn!(error = %err, retry_in_ms = delay.as_millis() as u64, "store write failed, retrying");
        work.attempt = next_attempt;
        work.not_before = Some(Instant::now() + delay);
        // The URL stays marked in flight across retries.
        self.push_nonblocking(work);
        WorkOutcome::Retrying
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let cfg = &self.inner.config;
        let ms = cfg
            .retry_backoff_ms
            .saturating_mul(2u64.saturating_pow(attempt))
            .min(cfg.max_retry_backoff_ms);
        Duration::from_millis(ms)
    }

    /// Take every queued work item without processing it.
    #[cfg(test)]
    pub fn drain_queued(&self) -> Vec<DownloadWork> {
        let mut out: Vec<DownloadWork> = self
            .inner
            .overflow
            .lock()
            .unwrap()
            .drain(..)
            .collect();
        let mut rx = self.inner.rx.try_lock().unwrap();
        while let Ok(work) = rx.try_recv() {
            out.push(work);
        }
        out
    }
}

fn header_str(resp: &reqwest::Response, name: &str) -> Option<String> {
    resp.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
}
