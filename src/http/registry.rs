//! Cache-aside proxy for an OCI distribution registry (`/v2/...`).
//!
//! GET/HEAD for a cached object is answered with a redirect to the store.
//! On a miss the object is queued for download and the request is proxied to
//! the registry so the client is served immediately.

use std::sync::Arc;

use anyhow::Context as _;
use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, HeaderName, Method, Uri, header},
    response::{IntoResponse, Response},
};
use tracing::{debug, info, instrument, warn};

use super::handler::{AppError, serve_cached};
use crate::AppState;
use crate::config::MethodPolicy;
use crate::download::DownloadWork;
use crate::metrics::{CacheResult, Route};
use crate::storage::PresignMethod;

/// Headers that describe a single transport hop and are never forwarded.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `ANY /v2/`
///
/// The API root answers version checks and auth challenges; it is always
/// forwarded and never cached.
#[instrument(skip_all, fields(%method))]
pub async fn handle_api_root(
    State(state): State<Arc<AppState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    state
        .metrics
        .metrics
        .record_request(Route::Registry, CacheResult::Passthrough);
    proxy_to_origin(&state, method, &uri, headers, body).await
}

/// `ANY /v2/{*path}`
#[instrument(skip_all, fields(%method, path = %uri.path()))]
pub async fn handle_registry(
    State(state): State<Arc<AppState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    let metrics = &state.metrics.metrics;

    let presign_method = match presign_method_for(&method) {
        Some(presign_method) => presign_method,
        None => match state.config.proxy.method_policy {
            MethodPolicy::Reject => {
                warn!("method not supported, this is a cache, not a writable sink");
                metrics.record_request(Route::Registry, CacheResult::Rejected);
                return Err(AppError::MethodNotAllowed);
            }
            MethodPolicy::Passthrough => {
                metrics.record_request(Route::Registry, CacheResult::Passthrough);
                return proxy_to_origin(&state, method, &uri, headers, body).await;
            }
        },
    };

    let key = cache_key(uri.path())?;
    let bucket = &state.config.storage.bucket;

    let cached = match state.store.exists(bucket, &key).await {
        Ok(cached) => cached,
        Err(e) => {
            warn!(%key, error = %e, "existence check failed, treating as miss");
            false
        }
    };

    if cached {
        info!(%key, source = "store", "serving");
        metrics.record_request(Route::Registry, CacheResult::Hit);
        return serve_cached(&state, &key, presign_method).await;
    }

    info!(%key, source = "origin", "serving");
    metrics.record_request(Route::Registry, CacheResult::Miss);

    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let work = DownloadWork::new(bucket, &key, origin_url(&state, &uri)).authorization(authorization);
    state.downloader.fetch(work).await;

    proxy_to_origin(&state, method, &uri, headers, body).await
}

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

/// Store key for a registry request path.
///
/// Content-addressed paths (final segment `sha256:...`) share one key per
/// digest across repositories; everything else is keyed by its path.
pub fn cache_key(path: &str) -> Result<String, AppError> {
    let last = path.rsplit('/').next().unwrap_or_default();
    let key = if last.starts_with("sha256:") {
        format!("blobs/{last}")
    } else {
        path.trim_start_matches('/').to_string()
    };

    let invalid = key.is_empty()
        || key.contains('\\')
        || key.contains('\0')
        || key.split('/').any(|seg| seg == "..");
    if invalid {
        return Err(AppError::BadRequest(format!("invalid object path: {path}")));
    }
    Ok(key)
}

/// Only reads are served from the cache.
fn presign_method_for(method: &Method) -> Option<PresignMethod> {
    if *method == Method::GET {
        Some(PresignMethod::Get)
    } else if *method == Method::HEAD {
        Some(PresignMethod::Head)
    } else {
        None
    }
}

fn origin_url(state: &AppState, uri: &Uri) -> String {
    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| uri.path());
    format!("{}{}", state.config.registry.upstream_base(), path_and_query)
}

// ---------------------------------------------------------------------------
// Pass-through
// ---------------------------------------------------------------------------

/// Forward the request to the registry and stream its response back.
/// Redirects are handed to the client, not followed.
async fn proxy_to_origin(
    state: &AppState,
    method: Method,
    uri: &Uri,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    let url = origin_url(state, uri);
    debug!(%url, "proxying to origin");

    let mut outbound = strip_hop_by_hop(&headers);
    outbound.remove(header::HOST);
    outbound.remove(header::CONTENT_LENGTH);

    let mut req = state
        .passthrough_client
        .request(method.clone(), &url)
        .headers(outbound);
    if presign_method_for(&method).is_none() {
        req = req.body(reqwest::Body::wrap_stream(body.into_data_stream()));
    }

    let upstream = req
        .send()
        .await
        .with_context(|| format!("failed to reach origin at {url}"))?;

    let status = upstream.status();
    let response_headers = strip_hop_by_hop(upstream.headers());
    let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
    *response.status_mut() = status;
    *response.headers_mut() = response_headers;

    Ok(response.into_response())
}

/// Copy `headers` without hop-by-hop headers, including any listed in
/// `Connection`.
fn strip_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    let connection_listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::try_from(name.trim()).ok())
        .collect();

    let mut out = headers.clone();
    for name in HOP_BY_HOP {
        out.remove(*name);
    }
    for name in &connection_listed {
        out.remove(name);
    }
    out
}
