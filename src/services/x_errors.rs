//! X API error classification
//!
//! Parses X API v2 error responses into structured types so the monitor can
//! tell a rate limit apart from everything else.

use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use thiserror::Error;

/// Structured X API error types
#[derive(Debug, Clone, Error)]
pub enum XApiError {
    /// 429 from the API; `reset_at` comes from `x-rate-limit-reset` when present
    #[error("rate limited by X API (reset at {reset_at:?})")]
    RateLimited { reset_at: Option<DateTime<Utc>> },
    /// Access token rejected or missing scopes
    #[error("X API authentication failed")]
    AuthenticationFailed,
    /// User or resource does not exist
    #[error("X resource not found")]
    NotFound,
    /// Network/connection error (timeout, DNS, etc.)
    #[error("network error: {0}")]
    Network(String),
    /// Response body did not match the expected shape
    #[error("unexpected X API payload: {0}")]
    Decode(String),
    /// Anything else, with status code and message
    #[error("X API error {status}: {body}")]
    Unknown { status: u16, body: String },
}

/// X API v2 error body
#[derive(Debug, Deserialize)]
struct XErrorResponse {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    detail: Option<String>,
}

impl XApiError {
    /// Classify a non-success response
    pub fn from_response(status: u16, body: &str, rate_limit_reset: Option<&str>) -> Self {
        let message = serde_json::from_str::<XErrorResponse>(body)
            .ok()
            .and_then(|e| e.detail.or(e.title))
            .unwrap_or_else(|| body.to_string());
        let lower = message.to_lowercase();

        if status == 429 || lower.contains("too many requests") {
            let reset_at = rate_limit_reset
                .and_then(|v| v.trim().parse::<i64>().ok())
                .and_then(|secs| Utc.timestamp_opt(secs, 0).single());
            return XApiError::RateLimited { reset_at };
        }

        if status == 401 || status == 403 || lower.contains("unauthorized") {
            return XApiError::AuthenticationFailed;
        }

        if status == 404 || lower.contains("could not find") {
            return XApiError::NotFound;
        }

        XApiError::Unknown {
            status,
            body: message,
        }
    }

    /// Classify a transport error
    pub fn from_network_error(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            XApiError::Network("request timed out".to_string())
        } else if err.is_connect() {
            XApiError::Network("connection failed".to_string())
        } else if err.is_decode() {
            XApiError::Decode(err.to_string())
        } else {
            XApiError::Network(err.to_string())
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, XApiError::RateLimited { .. })
    }
}
