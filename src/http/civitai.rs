//! `GET /civitai/download/{version_id}`: cache-aside Civitai model downloads.
//!
//! Model files are keyed by their SHA-256, so a file shared between versions
//! or re-uploaded under another name is stored once.  On a miss the file is
//! queued for download and the client is sent straight to Civitai's CDN.

use std::sync::Arc;

use anyhow::{Context as _, anyhow};
use axum::{
    extract::{Path, Query, State},
    http::header,
    response::{IntoResponse, Redirect, Response},
};
use tracing::{debug, info, instrument, warn};

use super::handler::{AppError, serve_cached};
use crate::AppState;
use crate::civitai::models::{FileFilter, select_file};
use crate::download::DownloadWork;
use crate::metrics::{CacheResult, Route};
use crate::storage::PresignMethod;

const MODEL_FILE_MEDIA_TYPE: &str = "application/octet-stream";

#[instrument(skip_all, fields(%version_id))]
pub async fn handle_download(
    State(state): State<Arc<AppState>>,
    Path(version_id): Path<String>,
    Query(filter): Query<FileFilter>,
) -> Result<Response, AppError> {
    let Some(civitai) = state.civitai.as_ref() else {
        return Err(AppError::BadRequest("Civitai support is disabled".into()));
    };

    if version_id.is_empty() || !version_id.bytes().all(|b| b.is_ascii_digit()) {
        return Err(AppError::BadRequest(
            "invalid request, need a numeric {version_id}".into(),
        ));
    }

    // 1. Version and model metadata.
    let version = civitai
        .model_version(&version_id)
        .await
        .context("can't fetch model version info")?;
    let model_id = version
        .model_id
        .ok_or_else(|| anyhow!("model version {version_id} has no modelId"))?;
    let model = civitai
        .model(&model_id.to_string())
        .await
        .context("can't fetch model info")?;
    civitai.put_model(&model).await?;

    // 2. Pick the requested file.
    if version.files.is_empty() {
        return Err(AppError::BadRequest(format!(
            "model version {version_id} has no files"
        )));
    }
    let file = select_file(&version.files, &filter).ok_or_else(|| {
        AppError::BadRequest(format!(
            "no file of model version {version_id} matches the requested type/format/size/fp"
        ))
    })?;
    let key = file
        .cache_key()
        .ok_or_else(|| anyhow!("file {} of model version {version_id} has no SHA256", file.id))?;

    // 3. Serve from the store when cached.
    let bucket = &state.config.storage.bucket;
    let metrics = &state.metrics.metrics;
    let cached = match state.store.exists(bucket, &key).await {
        Ok(cached) => cached,
        Err(e) => {
            warn!(%key, error = %e, "existence check failed, treating as miss");
            false
        }
    };
    if cached {
        info!(%key, source = "store", "serving");
        metrics.record_request(Route::Civitai, CacheResult::Hit);
        return serve_cached(&state, &key, PresignMethod::Get).await;
    }

    // 4. Miss: queue the download and send the client to the origin.
    info!(%key, source = "origin", "serving");
    metrics.record_request(Route::Civitai, CacheResult::Miss);

    let origin = civitai.client.download_url(version.id, file)?;
    let work = DownloadWork::new(bucket, &key, &origin)
        .media_type(MODEL_FILE_MEDIA_TYPE)
        .authorization(civitai.client.bearer());
    state.downloader.fetch(work).await;

    let location = resolve_redirect(&state, &origin, &civitai.client.bearer()).await?;
    debug!(to = %location, "redirecting");
    Ok(Redirect::temporary(&location).into_response())
}

/// Follow exactly one redirect hop of `url` and return its target.
async fn resolve_redirect(state: &AppState, url: &str, authorization: &str) -> Result<String, AppError> {
    let resp = state
        .passthrough_client
        .get(url)
        .header(header::AUTHORIZATION, authorization)
        .send()
        .await
        .with_context(|| format!("can't get redirect url for {url}"))?;

    let status = resp.status();
    if !status.is_redirection() {
        return Err(anyhow!("expected a redirect from {url}, got {status}").into());
    }

    resp.headers()
        .get(header::LOCATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
        .ok_or_else(|| anyhow!("redirect from {url} has no Location header").into())
}
