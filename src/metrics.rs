use std::sync::Arc;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

use crate::download::WorkOutcome;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
    pub route: Route,
    pub result: CacheResult,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Route {
    Registry,
    Civitai,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum CacheResult {
    Hit,
    Miss,
    Passthrough,
    Rejected,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OutcomeLabels {
    pub outcome: WorkOutcome,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct DomainLabels {
    pub domain: String,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Central container for every Prometheus metric exposed by the cache.
pub struct Metrics {
    // -- request path --
    pub cache_requests_total: Family<RequestLabels, Counter>,

    // -- downloader --
    pub fetch_enqueued: Counter,
    pub fetch_deduplicated: Counter,
    pub fetch_outcomes: Family<OutcomeLabels, Counter>,
    pub fetch_in_flight: Gauge,

    // -- manifests --
    pub manifests_rewritten: Counter,
    pub malformed_manifests: Counter,

    // -- invalidator --
    pub invalidator_refreshes: Family<DomainLabels, Counter>,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let cache_requests_total = Family::<RequestLabels, Counter>::default();
        registry.register(
            "modelcache_cache_requests",
            "Proxied requests by route and cache result",
            cache_requests_total.clone(),
        );

        let fetch_enqueued = Counter::default();
        registry.register(
            "modelcache_fetch_enqueued",
            "Download work items accepted into the queue",
            fetch_enqueued.clone(),
        );

        let fetch_deduplicated = Counter::default();
        registry.register(
            "modelcache_fetch_deduplicated",
            "Fetch requests dropped because the URL was already in flight",
            fetch_deduplicated.clone(),
        );

        let fetch_outcomes = Family::<OutcomeLabels, Counter>::default();
        registry.register(
            "modelcache_fetch_outcomes",
            "Processed download work items by outcome",
            fetch_outcomes.clone(),
        );

        let fetch_in_flight: Gauge = Gauge::default();
        registry.register(
            "modelcache_fetch_in_flight",
            "Pull URLs currently marked in flight",
            fetch_in_flight.clone(),
        );

        let manifests_rewritten = Counter::default();
        registry.register(
            "modelcache_manifests_rewritten",
            "Mislabeled manifests stored under their declared media type",
            manifests_rewritten.clone(),
        );

        let malformed_manifests = Counter::default();
        registry.register(
            "modelcache_malformed_manifests",
            "Mislabeled bodies that could not be parsed as a manifest",
            malformed_manifests.clone(),
        );

        let invalidator_refreshes = Family::<DomainLabels, Counter>::default();
        registry.register(
            "modelcache_invalidator_refreshes",
            "Refresh fetches issued by the invalidator, by domain",
            invalidator_refreshes.clone(),
        );

        Self {
            cache_requests_total,
            fetch_enqueued,
            fetch_deduplicated,
            fetch_outcomes,
            fetch_in_flight,
            manifests_rewritten,
            malformed_manifests,
            invalidator_refreshes,
        }
    }

    pub fn record_request(&self, route: Route, result: CacheResult) {
        self.cache_requests_total
            .get_or_create(&RequestLabels { route, result })
            .inc();
    }

    pub fn record_outcome(&self, outcome: WorkOutcome) {
        self.fetch_outcomes
            .get_or_create(&OutcomeLabels { outcome })
            .inc();
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the metrics registry, used in [`AppState`].
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all cache metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }

    /// Render the registry in the OpenMetrics text format.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buf = String::new();
        encode(&mut buf, &self.registry)?;
        Ok(buf)
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
