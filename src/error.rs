//! Error taxonomy for the HTTP surface.
//!
//! Four classes of failure cross this service: invalid client input, input
//! blocked by security policy, upstream fetch failures, and storage failures.
//! Clients always get a generic JSON body; the detail stays in server logs.
//! Policy violations are logged under the `audit` target so they can be
//! filtered for review independently of ordinary validation noise.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::archive::ArchiveError;
use crate::ssrf::PolicyError;

/// Unified error type returned by API handlers.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Malformed or out-of-bounds client input: bad session identifier,
    /// unusable file path, disallowed extension, unparseable URL, bytes that
    /// are not a supported image.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Well-formed input forbidden by security policy: traversal attempt,
    /// domain outside the allow-list, private or loopback fetch target.
    #[error("policy violation: {0}")]
    PolicyViolation(String),

    /// Remote fetch answered with a non-success status, mirrored to the client.
    #[error("upstream returned status {0}")]
    UpstreamStatus(u16),

    /// Remote fetch exceeded the configured timeout.
    #[error("upstream fetch timed out")]
    UpstreamTimeout,

    /// Remote fetch failed below the HTTP layer (connect, TLS, body read).
    #[error("upstream fetch failed: {0}")]
    UpstreamFetch(String),

    /// Payload exceeds a configured size limit.
    #[error("payload too large")]
    PayloadTooLarge,

    /// The requested session or file does not exist.
    #[error("not found")]
    NotFound,

    /// Disk write or archive build failure. Detail never reaches the client.
    #[error("storage failure: {0}")]
    Storage(String),
}

impl ApiError {
    pub fn invalid(detail: impl Into<String>) -> Self {
        ApiError::InvalidInput(detail.into())
    }

    pub fn violation(detail: impl Into<String>) -> Self {
        ApiError::PolicyViolation(detail.into())
    }

    pub fn storage(err: impl std::fmt::Display) -> Self {
        ApiError::Storage(err.to_string())
    }
}

impl From<std::io::Error> for ApiError {
    fn from(err: std::io::Error) -> Self {
        ApiError::Storage(err.to_string())
    }
}

impl From<ArchiveError> for ApiError {
    fn from(err: ArchiveError) -> Self {
        ApiError::Storage(err.to_string())
    }
}

impl From<PolicyError> for ApiError {
    fn from(err: PolicyError) -> Self {
        match err {
            PolicyError::Malformed(_) | PolicyError::SchemeNotAllowed(_) => {
                ApiError::InvalidInput(err.to_string())
            }
            PolicyError::HostMissing
            | PolicyError::HostNotAllowed(_)
            | PolicyError::PrivateAddress(_) => ApiError::PolicyViolation(err.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, client_msg) = match &self {
            ApiError::InvalidInput(detail) => {
                tracing::warn!(detail = %detail, "rejected invalid input");
                (StatusCode::BAD_REQUEST, "invalid request")
            }
            ApiError::PolicyViolation(detail) => {
                tracing::warn!(target: "audit", detail = %detail, "security policy violation");
                (StatusCode::FORBIDDEN, "request blocked by policy")
            }
            ApiError::UpstreamStatus(code) => {
                tracing::warn!(status = code, "upstream request failed");
                (
                    StatusCode::from_u16(*code).unwrap_or(StatusCode::BAD_GATEWAY),
                    "upstream request failed",
                )
            }
            ApiError::UpstreamTimeout => {
                tracing::warn!("upstream fetch timed out");
                (StatusCode::REQUEST_TIMEOUT, "upstream request timed out")
            }
            ApiError::UpstreamFetch(detail) => {
                tracing::warn!(detail = %detail, "upstream fetch failed");
                (StatusCode::BAD_GATEWAY, "upstream request failed")
            }
            ApiError::PayloadTooLarge => {
                tracing::warn!("payload over size limit");
                (StatusCode::PAYLOAD_TOO_LARGE, "payload too large")
            }
            ApiError::NotFound => (StatusCode::NOT_FOUND, "not found"),
            ApiError::Storage(detail) => {
                tracing::error!(detail = %detail, "storage failure");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal server error")
            }
        };

        let body = Json(json!({ "success": false, "error": client_msg }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(
            ApiError::invalid("x").into_response().status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::violation("x").into_response().status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            ApiError::UpstreamTimeout.into_response().status(),
            StatusCode::REQUEST_TIMEOUT
        );
        assert_eq!(
            ApiError::PayloadTooLarge.into_response().status(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            ApiError::NotFound.into_response().status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::storage("disk full").into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn upstream_status_is_mirrored() {
        assert_eq!(
            ApiError::UpstreamStatus(404).into_response().status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::UpstreamStatus(503).into_response().status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        // Out-of-range codes fall back to 502 rather than panicking.
        assert_eq!(
            ApiError::UpstreamStatus(19).into_response().status(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn policy_errors_split_into_input_and_violation() {
        let input: ApiError = PolicyError::SchemeNotAllowed("http".to_string()).into();
        assert!(matches!(input, ApiError::InvalidInput(_)));

        let violation: ApiError = PolicyError::HostNotAllowed("evil.example".to_string()).into();
        assert!(matches!(violation, ApiError::PolicyViolation(_)));
    }
}
