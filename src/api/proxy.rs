//! Remote image proxy.
//!
//! Browsers will not paint cross-origin images onto an exportable canvas, so
//! the client asks this service to fetch them instead. Every requested URL
//! runs through the outbound-fetch policy first, the client's redirect
//! policy vets each hop before following it, and the final URL is checked
//! once more before any byte is returned.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use futures::StreamExt;

use crate::error::ApiError;
use crate::sniff;
use crate::ssrf::{self, PolicyError};

use super::routes::AppState;
use super::types::FetchImageQuery;

/// Proxied images are immutable by URL; let browsers cache them for a while.
const CACHE_MAX_AGE_SECS: u32 = 3600;

/// `GET /api/fetch-image?url=...`: fetch a remote image on the client's
/// behalf.
pub async fn fetch_image(
    State(state): State<Arc<AppState>>,
    Query(query): Query<FetchImageQuery>,
) -> Result<Response, ApiError> {
    let target = ssrf::validate_fetch_url(&query.url, &state.config.proxy.allowed_hosts)?;
    tracing::debug!(host = %target.host_str().unwrap_or("-"), "image fetch starting");

    let response = state
        .http_client
        .get(target)
        .send()
        .await
        .map_err(classify_fetch_error)?;

    // Every hop was vetted by the redirect policy; re-check where we landed.
    ssrf::ensure_public_target(response.url())?;

    let status = response.status();
    if !status.is_success() {
        tracing::warn!(status = status.as_u16(), "upstream refused image fetch");
        return Err(ApiError::UpstreamStatus(status.as_u16()));
    }

    let cap = state.config.limits.max_image_bytes;
    if let Some(len) = response.content_length() {
        if !sniff::within_size_limit(len as usize, cap) {
            return Err(ApiError::PayloadTooLarge);
        }
    }

    let bytes = read_capped(response, cap).await?;
    let format = sniff::classify_image(&bytes)
        .ok_or_else(|| ApiError::invalid("fetched payload is not a supported image"))?;

    tracing::info!(
        bytes = bytes.len(),
        mime = format.mime_type(),
        "image fetched"
    );

    let headers = [
        (header::CONTENT_TYPE, format.mime_type().to_string()),
        (
            header::CACHE_CONTROL,
            format!("public, max-age={CACHE_MAX_AGE_SECS}"),
        ),
    ];
    Ok((headers, bytes).into_response())
}

/// Drain the upstream body, refusing to buffer past `cap` bytes. The
/// declared content length is advisory; this count is what actually holds.
async fn read_capped(response: reqwest::Response, cap: usize) -> Result<Vec<u8>, ApiError> {
    let mut buf = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(classify_fetch_error)?;
        if buf.len() + chunk.len() > cap {
            return Err(ApiError::PayloadTooLarge);
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf)
}

fn classify_fetch_error(e: reqwest::Error) -> ApiError {
    if e.is_timeout() {
        return ApiError::UpstreamTimeout;
    }
    // A hop the redirect policy refused surfaces as a redirect error with
    // the policy error buried in its source chain.
    if e.is_redirect() {
        if let Some(policy) = policy_error_in_chain(&e) {
            return ApiError::PolicyViolation(policy.to_string());
        }
    }
    ApiError::UpstreamFetch(e.to_string())
}

fn policy_error_in_chain<'a>(err: &'a (dyn std::error::Error + 'static)) -> Option<&'a PolicyError> {
    let mut source = err.source();
    while let Some(cause) = source {
        if let Some(policy) = cause.downcast_ref::<PolicyError>() {
            return Some(policy);
        }
        source = cause.source();
    }
    None
}
