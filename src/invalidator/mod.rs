//! Periodic staleness sweep.
//!
//! Each [`Invalidator`] owns one [`RefreshDomain`].  On every pass it lists
//! the objects of the domain's content type that were last written more than
//! `manifest_lifetime` ago and asks the domain to re-fetch them through the
//! shared [`Downloader`](crate::download::Downloader).  Errors on a single
//! object are logged and the pass carries on.

pub mod civitai;
pub mod registry;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::metrics::{DomainLabels, Metrics};
use crate::storage::{ListFilter, ObjectInfo, ObjectStore};

/// A family of cached objects that can be re-fetched from their origin.
#[async_trait::async_trait]
pub trait RefreshDomain: Send + Sync {
    /// Short name used in logs and metric labels.
    fn name(&self) -> &'static str;

    /// Content type the stale objects of this domain are stored under.
    fn content_type(&self) -> &str;

    /// Queue a refresh for one stale object.  Returns the number of fetches
    /// attempted.
    async fn refresh(&self, object: &ObjectInfo) -> Result<usize>;
}

pub struct Invalidator {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    lifetime: Duration,
    interval: Duration,
    domain: Box<dyn RefreshDomain>,
    metrics: Arc<Metrics>,
}

impl Invalidator {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        bucket: impl Into<String>,
        lifetime: Duration,
        interval: Duration,
        domain: Box<dyn RefreshDomain>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            bucket: bucket.into(),
            lifetime,
            interval,
            domain,
            metrics,
        }
    }

    /// Sweep until `cancel` fires.  A pass that has started always finishes.
    pub async fn run(self, cancel: CancellationToken) {
        let domain = self.domain.name();
        info!(%domain, interval_secs = self.interval.as_secs(), "invalidator started");

        loop {
            if cancel.is_cancelled() {
                break;
            }
            self.scan_once().await;
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        info!(%domain, "invalidator stopped");
    }

    /// One pass over the stale objects.  Returns the number of refresh
    /// fetches attempted.
    #[instrument(skip(self), fields(domain = self.domain.name(), bucket = %self.bucket))]
    pub async fn scan_once(&self) -> usize {
        let lifetime = match chrono::Duration::from_std(self.lifetime) {
            Ok(lifetime) => lifetime,
            Err(e) => {
                error!(error = %e, "manifest lifetime out of range");
                return 0;
            }
        };
        let filter = ListFilter {
            content_type: Some(self.domain.content_type().to_string()),
            modified_before: Some(Utc::now() - lifetime),
        };

        let stale = match self.store.list(&self.bucket, &filter).await {
            Ok(stale) => stale,
            Err(e) => {
                error!(error = %e, "can't list stale objects");
                return 0;
            }
        };
        debug!(count = stale.len(), "stale objects found");

        let mut attempted = 0;
        for object in &stale {
            match self.domain.refresh(object).await {
                Ok(n) => attempted += n,
                Err(e) => warn!(key = %object.key, error = %e, "refresh failed"),
            }
        }

        self.metrics
            .invalidator_refreshes
            .get_or_create(&DomainLabels {
                domain: self.domain.name().to_string(),
            })
            .inc_by(attempted as u64);
        if attempted > 0 {
            info!(attempted, "stale objects queued for refresh");
        }
        attempted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricsRegistry;
    use crate::storage::memory::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        seen: Arc<AtomicUsize>,
        fail_key: Option<&'static str>,
    }

    #[async_trait::async_trait]
    impl RefreshDomain for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn content_type(&self) -> &str {
            "application/x-stale"
        }

        async fn refresh(&self, object: &ObjectInfo) -> Result<usize> {
            if Some(object.key.as_str()) == self.fail_key {
                anyhow::bail!("origin unreachable");
            }
            self.seen.fetch_add(1, Ordering::SeqCst);
            Ok(1)
        }
    }

    fn invalidator(store: Arc<MemoryStore>, domain: Counting) -> Invalidator {
        Invalidator::new(
            store,
            "cache",
            Duration::from_secs(3600),
            Duration::from_millis(10),
            Box::new(domain),
            MetricsRegistry::new().metrics,
        )
    }

    #[tokio::test]
    async fn only_old_objects_of_the_domain_type_are_refreshed() {
        let store = Arc::new(MemoryStore::new());
        let old = Utc::now() - chrono::Duration::hours(2);
        store.insert_at("cache", "a", b"x", "application/x-stale", old);
        store.insert_at("cache", "b", b"x", "text/plain", old);
        store.insert("cache", "c", b"x", "application/x-stale");
        store.insert_at("other", "d", b"x", "application/x-stale", old);

        let seen = Arc::new(AtomicUsize::new(0));
        let inv = invalidator(
            store,
            Counting {
                seen: seen.clone(),
                fail_key: None,
            },
        );

        assert_eq!(inv.scan_once().await, 1);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn one_failing_object_does_not_abort_the_pass() {
        let store = Arc::new(MemoryStore::new());
        let old = Utc::now() - chrono::Duration::hours(2);
        store.insert_at("cache", "a", b"x", "application/x-stale", old);
        store.insert_at("cache", "b", b"x", "application/x-stale", old);
        store.insert_at("cache", "c", b"x", "application/x-stale", old);

        let seen = Arc::new(AtomicUsize::new(0));
        let inv = invalidator(
            store,
            Counting {
                seen: seen.clone(),
                fail_key: Some("b"),
            },
        );

        assert_eq!(inv.scan_once().await, 2);
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    struct Slow {
        seen: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl RefreshDomain for Slow {
        fn name(&self) -> &'static str {
            "slow"
        }

        fn content_type(&self) -> &str {
            "application/x-stale"
        }

        async fn refresh(&self, _object: &ObjectInfo) -> Result<usize> {
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.seen.fetch_add(1, Ordering::SeqCst);
            Ok(1)
        }
    }

    #[tokio::test]
    async fn cancel_waits_for_the_running_pass() {
        let store = Arc::new(MemoryStore::new());
        let old = Utc::now() - chrono::Duration::hours(2);
        for key in ["a", "b", "c", "d"] {
            store.insert_at("cache", key, b"x", "application/x-stale", old);
        }

        let seen = Arc::new(AtomicUsize::new(0));
        let inv = Invalidator::new(
            store,
            "cache",
            Duration::from_secs(3600),
            Duration::from_secs(3600),
            Box::new(Slow { seen: seen.clone() }),
            MetricsRegistry::new().metrics,
        );
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(inv.run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(75)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("invalidator did not stop")
            .unwrap();

        assert_eq!(seen.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn run_stops_on_cancellation() {
        let seen = Arc::new(AtomicUsize::new(0));
        let inv = invalidator(
            Arc::new(MemoryStore::new()),
            Counting {
                seen,
                fail_key: None,
            },
        );
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(inv.run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("invalidator did not stop")
            .unwrap();
    }
}
