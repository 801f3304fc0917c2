//! Main axum router and shared HTTP plumbing for the model cache.
//!
//! Routes:
//! - `ANY /v2/`                                - Registry API root (always passed through)
//! - `ANY /v2/{*path}`                         - Cache-aside registry proxy
//! - `GET /civitai/download/{version_id}`      - Cache-aside Civitai model downloads
//! - `GET /healthz`                            - Health check
//! - `GET /metrics`                            - Prometheus metrics

use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    extract::State,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Redirect, Response},
    routing::{any, get},
};
use tracing::{debug, error};

use crate::AppState;
use crate::storage::PresignMethod;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the axum [`Router`] with all HTTP routes and shared state.
pub fn create_router(state: Arc<AppState>) -> Router {
    let mut router = Router::new()
        // Registry (OCI distribution) endpoints
        .route("/v2", any(super::registry::handle_api_root))
        .route("/v2/", any(super::registry::handle_api_root))
        .route("/v2/{*path}", any(super::registry::handle_registry));

    if state.civitai.is_some() {
        router = router.route(
            "/civitai/download/{version_id}",
            get(super::civitai::handle_download),
        );
    }

    router
        .route("/healthz", get(handle_health))
        .route("/metrics", get(handle_metrics))
        .with_state(state)
}

/// `GET /healthz`
async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health_state = crate::health::HealthState {
        config: Arc::clone(&state.config),
        store: Arc::clone(&state.store),
        http_client: state.passthrough_client.clone(),
    };
    crate::health::health_handler(axum::extract::State(health_state)).await
}

/// `GET /metrics`
///
/// Returns Prometheus metrics collected by the cache.
async fn handle_metrics(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    let buf = state
        .metrics
        .encode()
        .map_err(|e| AppError::Internal(anyhow::anyhow!("metrics encoding failed: {e}")))?;

    Ok((
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        buf,
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// Cache hits
// ---------------------------------------------------------------------------

/// Answer a request for an object known to be in the store.
///
/// Stores that can presign get a 307 to a URL scoped to the request method;
/// the others stream the object through this process.
pub(crate) async fn serve_cached(
    state: &AppState,
    key: &str,
    method: PresignMethod,
) -> Result<Response, AppError> {
    let bucket = &state.config.storage.bucket;
    let ttl = state.config.storage.presigned_url_ttl();

    let presigned = state
        .store
        .presign(bucket, key, method, ttl)
        .await
        .map_err(|e| AppError::Internal(e.context("can't make presigned url")))?;

    if let Some(url) = presigned {
        debug!(%key, "redirecting to presigned url");
        return Ok(Redirect::temporary(&url).into_response());
    }

    let object = state.store.get(bucket, key).await?;
    let mut response = match method {
        PresignMethod::Head => Response::new(Body::empty()),
        PresignMethod::Get => Response::new(Body::from_stream(object.body)),
    };

    let headers = response.headers_mut();
    if let Some(ct) = object.content_type.and_then(|v| HeaderValue::try_from(v).ok()) {
        headers.insert(header::CONTENT_TYPE, ct);
    }
    if let Some(len) = object.content_length {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
    }
    if let Some(cd) = object
        .content_disposition
        .and_then(|v| HeaderValue::try_from(v).ok())
    {
        headers.insert(header::CONTENT_DISPOSITION, cd);
    }
    if let Some(modified) = object.last_modified {
        let http_date = modified.format("%a, %d %b %Y %H:%M:%S GMT").to_string();
        if let Ok(v) = HeaderValue::try_from(http_date) {
            headers.insert(header::LAST_MODIFIED, v);
        }
    }

    Ok(response)
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Application-level error type that maps cleanly to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    /// The request is malformed or names something that does not exist.
    BadRequest(String),
    /// A write method reached the cache.
    MethodNotAllowed,
    /// An unexpected internal error.
    Internal(anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            AppError::MethodNotAllowed => (
                StatusCode::METHOD_NOT_ALLOWED,
                [(header::ALLOW, "GET, HEAD")],
                "method not supported, this is a cache, not a writable sink",
            )
                .into_response(),
            AppError::Internal(err) => {
                error!(error = %err, "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Internal server error: {err:#}"),
                )
                    .into_response()
            }
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err)
    }
}

// ---------------------------------------------------------------------------
// Test support
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;

    use crate::AppState;
    use crate::civitai::{Client, MetadataCache};
    use crate::config::{Config, parse_config};
    use crate::download::Downloader;
    use crate::metrics::MetricsRegistry;
    use crate::storage::memory::MemoryStore;

    pub const BUCKET: &str = "cache";

    pub fn config(upstream: &str, extra_yaml: &str) -> Config {
        parse_config(&format!(
            "registry:\n  upstream: {upstream}\nstorage:\n  bucket: {BUCKET}\n{extra_yaml}"
        ))
        .unwrap()
    }

    /// App state over `store` whose downloader has no workers running, so
    /// tests can inspect queued work with `drain_queued`.
    pub fn state(store: Arc<MemoryStore>, config: Config, civitai_api: Option<&str>) -> Arc<AppState> {
        let metrics = MetricsRegistry::new();
        let downloader = Downloader::new(
            store.clone(),
            reqwest::Client::new(),
            config.downloader.clone(),
            config.registry.mislabeled_manifest_content_type.clone(),
            Arc::clone(&metrics.metrics),
        );
        let passthrough_client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap();
        let civitai = civitai_api.map(|api| {
            MetadataCache::new(
                store.clone(),
                BUCKET,
                Client::new(reqwest::Client::new(), api, "tok"),
            )
        });

        Arc::new(AppState {
            config: Arc::new(config),
            store,
            downloader,
            metrics,
            passthrough_client,
            civitai,
        })
    }

    pub fn request(method: &str, uri: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    pub async fn body_string(response: axum::response::Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::storage::memory::MemoryStore;
    use tower::ServiceExt;

    #[tokio::test]
    async fn metrics_endpoint_serves_openmetrics() {
        let state = state(Arc::new(MemoryStore::new()), config("https://r.test", ""), None);
        let app = create_router(state);

        let response = app.oneshot(request("GET", "/metrics")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(
            response.headers()[header::CONTENT_TYPE]
                .to_str()
                .unwrap()
                .starts_with("application/openmetrics-text")
        );
        assert!(body_string(response).await.contains("modelcache_fetch_enqueued_total"));
    }

    #[tokio::test]
    async fn civitai_route_absent_when_disabled() {
        let state = state(Arc::new(MemoryStore::new()), config("https://r.test", ""), None);
        let app = create_router(state);

        let response = app
            .oneshot(request("GET", "/civitai/download/43533"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn method_not_allowed_names_allowed_methods() {
        let response = AppError::MethodNotAllowed.into_response();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(response.headers()[header::ALLOW], "GET, HEAD");
        assert_eq!(
            body_string(response).await,
            "method not supported, this is a cache, not a writable sink"
        );
    }
}
