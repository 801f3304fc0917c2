//! HTTP layer for the model cache.
//!
//! This module provides the axum-based HTTP server that fronts the registry
//! and Civitai origins, answers cache hits with redirects to the object store,
//! and queues cache misses for background download.

pub mod civitai;
pub mod handler;
pub mod registry;
