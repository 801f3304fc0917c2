//! `GET /healthz`: the cache is healthy when both the object store and the
//! upstream registry answer.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::Serialize;

use crate::config::Config;
use crate::storage::ObjectStore;

/// Key probed by the store check.  It does not need to exist.
const PROBE_KEY: &str = ".modelcache-healthz";

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub checks: HealthChecks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Degraded,
}

#[derive(Debug, Serialize)]
pub struct HealthChecks {
    pub store: CheckResult,
    pub upstream: CheckResult,
}

impl HealthChecks {
    fn status(&self) -> HealthStatus {
        if self.store.ok && self.upstream.ok {
            HealthStatus::Ok
        } else {
            HealthStatus::Degraded
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CheckResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CheckResult {
    fn healthy() -> Self {
        Self {
            ok: true,
            detail: None,
        }
    }

    fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            detail: Some(detail.into()),
        }
    }
}

/// What the health handler needs from `AppState`.
#[derive(Clone)]
pub struct HealthState {
    pub config: Arc<Config>,
    pub store: Arc<dyn ObjectStore>,
    /// Must not follow redirects.
    pub http_client: reqwest::Client,
}

// ---------------------------------------------------------------------------
// Checks
// ---------------------------------------------------------------------------

async fn check_store(store: &dyn ObjectStore, bucket: &str) -> CheckResult {
    match store.exists(bucket, PROBE_KEY).await {
        Ok(_) => CheckResult::healthy(),
        Err(e) => CheckResult::unhealthy(format!("store probe failed: {e:#}")),
    }
}

/// A registry answers `/v2/` with 200 or with a 401 auth challenge; either
/// means it is reachable.
async fn check_upstream(client: &reqwest::Client, upstream_base: &str) -> CheckResult {
    let url = format!("{upstream_base}/v2/");
    match client.head(&url).send().await {
        Ok(resp)
            if resp.status().is_success()
                || resp.status().is_redirection()
                || resp.status() == reqwest::StatusCode::UNAUTHORIZED =>
        {
            CheckResult::healthy()
        }
        Ok(resp) => CheckResult::unhealthy(format!("registry answered {}", resp.status())),
        Err(e) => CheckResult::unhealthy(format!("registry unreachable: {e}")),
    }
}

/// Returns 200 when every check passes, 503 otherwise.
pub async fn health_handler(State(state): State<HealthState>) -> impl IntoResponse {
    let (store, upstream) = tokio::join!(
        check_store(state.store.as_ref(), &state.config.storage.bucket),
        check_upstream(&state.http_client, state.config.registry.upstream_base()),
    );

    let checks = HealthChecks { store, upstream };
    let status = checks.status();
    let code = match status {
        HealthStatus::Ok => StatusCode::OK,
        HealthStatus::Degraded => StatusCode::SERVICE_UNAVAILABLE,
    };

    (code, Json(HealthResponse { status, checks }))
}
