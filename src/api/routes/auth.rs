//! Wallet sign-in: nonce challenge, signature check, session tokens

use super::{
    api_error, internal_error, parse_wallet, require_session, ApiResult, SuccessResponse,
};
use crate::api::server::AppState;
use crate::services::ExpiringStore;
use crate::wallet::{generate_nonce, sign_in_message, verify_signature};
use axum::{extract::State, http::StatusCode, Json};
use axum_extra::{
    headers::{authorization::Bearer, Authorization},
    TypedHeader,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Deserialize)]
pub struct NonceRequest {
    pub address: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NonceResponse {
    /// Message the wallet must sign
    pub message: String,
    pub nonce: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct VerifyRequest {
    pub address: String,
    pub signature: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionResponse {
    /// Bearer token for authenticated endpoints
    pub session_token: String,
    pub wallet: String,
    pub expires_at: DateTime<Utc>,
}

/// Issue a sign-in challenge for a wallet. A newer challenge replaces an
/// older one.
pub async fn request_nonce(
    State(state): State<AppState>,
    Json(req): Json<NonceRequest>,
) -> ApiResult<NonceResponse> {
    let wallet = parse_wallet(&req.address)?;
    let now = Utc::now();
    let ttl = Duration::seconds(state.config.auth.nonce_ttl_seconds);

    let nonce = generate_nonce();
    let message = sign_in_message(&wallet, &nonce, now);
    state.sign_in_nonces.put(&wallet, message.clone(), ttl, now).await;

    Ok(Json(NonceResponse {
        message,
        nonce,
        expires_at: now + ttl,
    }))
}

/// Check the signed challenge and open a session. The challenge is consumed
/// whether or not the signature matches.
pub async fn verify(
    State(state): State<AppState>,
    Json(req): Json<VerifyRequest>,
) -> ApiResult<SessionResponse> {
    let wallet = parse_wallet(&req.address)?;
    let now = Utc::now();

    // The nonce stays pending until a matching signature consumes it
    let message = state
        .sign_in_nonces
        .get(&wallet, now)
        .await
        .ok_or_else(|| api_error(StatusCode::UNAUTHORIZED, "No pending sign-in for this wallet"))?;

    let valid = verify_signature(&message, &req.signature, &wallet)
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, e.to_string()))?;
    if !valid {
        warn!("Signature for {} did not match", wallet);
        return Err(api_error(StatusCode::UNAUTHORIZED, "Signature does not match wallet"));
    }

    // A concurrent verify may have consumed it first
    if state.sign_in_nonces.take(&wallet, now).await.is_none() {
        return Err(api_error(StatusCode::UNAUTHORIZED, "No pending sign-in for this wallet"));
    }

    let session = state
        .db
        .create_session(
            &wallet,
            Duration::hours(state.config.auth.session_ttl_hours),
            now,
        )
        .await
        .map_err(|e| internal_error("Failed to create session", e))?;

    info!("Wallet {} signed in", wallet);
    Ok(Json(SessionResponse {
        session_token: session.id,
        wallet: session.wallet_address,
        expires_at: session.expires_at,
    }))
}

/// End the current session
pub async fn logout(
    State(state): State<AppState>,
    auth: Option<TypedHeader<Authorization<Bearer>>>,
) -> ApiResult<SuccessResponse> {
    let session = require_session(&state, auth).await?;
    state
        .db
        .delete_session(&session.id)
        .await
        .map_err(|e| internal_error("Failed to end session", e))?;
    Ok(Json(SuccessResponse { success: true }))
}
