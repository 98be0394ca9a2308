//! API route handlers

pub mod ai;
pub mod auth;
pub mod markets;
pub mod monitor;
pub mod predictions;
pub mod proposals;
pub mod stats;
pub mod x_auth;

use crate::api::server::AppState;
use crate::db::Session;
use crate::wallet::normalize_address;
use axum::{http::StatusCode, Json};
use axum_extra::{
    headers::{authorization::Bearer, Authorization},
    TypedHeader,
};
use chrono::Utc;
use serde::Serialize;
use std::fmt::Display;
use thiserror::Error;
use tracing::error;

/// API error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Rejection returned by every handler
pub type ApiError = (StatusCode, Json<ErrorResponse>);

pub type ApiResult<T> = Result<Json<T>, ApiError>;

pub fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

/// Log the cause and hide it behind a generic 500
pub fn internal_error(what: &str, err: impl Display) -> ApiError {
    error!("{}: {}", what, err);
    api_error(StatusCode::INTERNAL_SERVER_ERROR, what)
}

/// Simple acknowledgement body
#[derive(Debug, Serialize)]
pub struct SuccessResponse {
    pub success: bool,
}

/// Why a request could not be tied to a wallet
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Missing bearer token")]
    Missing,
    #[error("Invalid or expired session")]
    Invalid,
    #[error("Session lookup failed: {0}")]
    Storage(#[from] anyhow::Error),
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Missing | SessionError::Invalid => {
                api_error(StatusCode::UNAUTHORIZED, err.to_string())
            }
            SessionError::Storage(e) => internal_error("Failed to validate session", e),
        }
    }
}

/// Resolve the bearer token to a live session
pub async fn require_session(
    state: &AppState,
    auth: Option<TypedHeader<Authorization<Bearer>>>,
) -> Result<Session, SessionError> {
    let TypedHeader(auth) = auth.ok_or(SessionError::Missing)?;
    state
        .db
        .get_session(auth.token(), Utc::now())
        .await?
        .ok_or(SessionError::Invalid)
}

/// Normalize a wallet taken from a path or body
pub fn parse_wallet(raw: &str) -> Result<String, ApiError> {
    normalize_address(raw).map_err(|_| api_error(StatusCode::BAD_REQUEST, "Invalid wallet address"))
}

/// Trimmed, non-empty option labels; a market needs 2 to 4 of them
pub fn validate_options(raw: &[String]) -> Result<Vec<String>, ApiError> {
    let labels: Vec<String> = raw
        .iter()
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .collect();
    if labels.len() < 2 || labels.len() > 4 || labels.len() != raw.len() {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "A market needs between 2 and 4 non-empty options",
        ));
    }
    Ok(labels)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_options() {
        let ok = validate_options(&[" Yes ".to_string(), "No".to_string()]).unwrap();
        assert_eq!(ok, vec!["Yes", "No"]);

        assert!(validate_options(&["Only".to_string()]).is_err());
        assert!(validate_options(&["Yes".to_string(), "  ".to_string()]).is_err());
        let five: Vec<String> = (1..=5).map(|i| i.to_string()).collect();
        assert!(validate_options(&five).is_err());
    }

    #[test]
    fn test_session_error_status() {
        let (status, _) = ApiError::from(SessionError::Missing);
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, Json(body)) = ApiError::from(SessionError::Storage(anyhow::anyhow!("disk")));
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body.error, "Failed to validate session");
    }

    #[test]
    fn test_parse_wallet() {
        assert!(parse_wallet("nope").is_err());
        assert_eq!(
            parse_wallet("0x52908400098527886E0F7030069857D2E4169EE7").unwrap(),
            "0x52908400098527886e0f7030069857d2e4169ee7"
        );
    }
}
