//! X account linking (OAuth 2.0 with PKCE)

use super::{api_error, internal_error, parse_wallet, require_session, ApiResult, SuccessResponse};
use crate::api::server::AppState;
use crate::services::x_oauth::{authorize_url, code_challenge, generate_code_verifier, generate_state};
use crate::services::{ExpiringStore, PendingLink};
use crate::types::{BadgeType, SocialConnection};
use crate::wallet::XTokens;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Redirect,
    Json,
};
use axum_extra::{
    headers::{authorization::Bearer, Authorization, Host},
    TypedHeader,
};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

const CALLBACK_PATH: &str = "/api/auth/x/callback";
const PROFILE_PATH: &str = "/profile";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateResponse {
    pub auth_url: String,
    pub state: String,
}

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
    /// Set by X when the user denies access
    pub error: Option<String>,
}

/// Start linking an X account to the session wallet
pub async fn initiate(
    State(state): State<AppState>,
    auth: Option<TypedHeader<Authorization<Bearer>>>,
    host: Option<TypedHeader<Host>>,
) -> ApiResult<InitiateResponse> {
    let session = require_session(&state, auth).await?;

    let Some(client_id) = state.config.x_client_id.as_deref() else {
        return Err(api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "X account linking is not configured",
        ));
    };

    let base_url = match (&state.config.public_base_url, host) {
        (Some(url), _) => url.clone(),
        (None, Some(TypedHeader(host))) => format!("http://{}", host),
        (None, None) => format!("http://{}", state.config.bind_addr),
    };
    let redirect_uri = format!("{}{}", base_url, CALLBACK_PATH);

    let oauth_state = generate_state();
    let code_verifier = generate_code_verifier();
    let challenge = code_challenge(&code_verifier);

    state
        .oauth_states
        .put(
            &oauth_state,
            PendingLink {
                wallet: session.wallet_address.clone(),
                code_verifier,
                redirect_uri: redirect_uri.clone(),
            },
            Duration::seconds(state.config.auth.oauth_state_ttl_seconds),
            Utc::now(),
        )
        .await;

    info!("X link started for {}", session.wallet_address);
    Ok(Json(InitiateResponse {
        auth_url: authorize_url(client_id, &redirect_uri, &oauth_state, &challenge),
        state: oauth_state,
    }))
}

/// OAuth redirect target. Always answers with a browser redirect to the
/// profile page.
pub async fn callback(State(state): State<AppState>, Query(query): Query<CallbackQuery>) -> Redirect {
    if let Some(err) = query.error {
        warn!("X authorization denied: {}", err);
        return error_redirect("access_denied");
    }
    let (Some(code), Some(oauth_state)) = (query.code, query.state) else {
        return error_redirect("missing_parameters");
    };

    let Some(pending) = state.oauth_states.take(&oauth_state, Utc::now()).await else {
        warn!("Unknown or expired OAuth state");
        return error_redirect("invalid_state");
    };

    match complete_link(&state, &code, &pending).await {
        Ok(connection) => {
            info!("Wallet {} linked to @{}", connection.user_wallet, connection.x_username);
            Redirect::to(&format!("{}?x_connected=true", PROFILE_PATH))
        }
        Err(code) => error_redirect(code),
    }
}

async fn complete_link(
    state: &AppState,
    code: &str,
    pending: &PendingLink,
) -> Result<SocialConnection, &'static str> {
    let (Some(client_id), Some(client_secret)) = (
        state.config.x_client_id.as_deref(),
        state.config.x_client_secret.as_deref(),
    ) else {
        return Err("not_configured");
    };

    let now = Utc::now();
    let tokens = state
        .x_client
        .exchange_code(client_id, client_secret, code, &pending.redirect_uri, &pending.code_verifier)
        .await
        .map_err(|e| {
            error!("X token exchange failed: {}", e);
            "token_exchange_failed"
        })?;

    let user = state.x_client.fetch_me(&tokens.access_token).await.map_err(|e| {
        error!("Fetching X profile failed: {}", e);
        "profile_fetch_failed"
    })?;

    let sealed = state
        .vault
        .seal(&XTokens {
            access_token: tokens.access_token.clone(),
            refresh_token: tokens.refresh_token.clone(),
        })
        .map_err(|e| {
            error!("Sealing X credential failed: {}", e);
            "storage_failed"
        })?;

    let connection = state
        .db
        .upsert_connection(
            &pending.wallet,
            &user.id,
            &user.username,
            user.name.as_deref(),
            user.profile_image_url.as_deref(),
            &sealed,
            tokens.expires_at(now),
            now,
        )
        .await
        .map_err(|e| {
            error!("Storing X connection failed: {}", e);
            "storage_failed"
        })?;

    let metadata = serde_json::json!({ "xUsername": user.username }).to_string();
    if let Err(e) = state
        .db
        .award_badge(&pending.wallet, BadgeType::XVerified, Some(&metadata), now)
        .await
    {
        warn!("Failed to award x_verified badge to {}: {}", pending.wallet, e);
    }

    Ok(connection)
}

fn error_redirect(code: &str) -> Redirect {
    Redirect::to(&format!("{}?error={}", PROFILE_PATH, code))
}

/// Public part of a wallet's X link, or null
pub async fn get_connection(
    State(state): State<AppState>,
    Path(wallet): Path<String>,
) -> ApiResult<Option<SocialConnection>> {
    let wallet = parse_wallet(&wallet)?;
    let connection = state
        .db
        .get_connection(&wallet)
        .await
        .map_err(|e| internal_error("Failed to fetch X connection", e))?;
    Ok(Json(connection))
}

/// Unlink; only the wallet itself may do this
pub async fn delete_connection(
    State(state): State<AppState>,
    auth: Option<TypedHeader<Authorization<Bearer>>>,
    Path(wallet): Path<String>,
) -> ApiResult<SuccessResponse> {
    let session = require_session(&state, auth).await?;
    let wallet = parse_wallet(&wallet)?;
    if wallet != session.wallet_address {
        return Err(api_error(
            StatusCode::FORBIDDEN,
            "Cannot unlink another wallet's X account",
        ));
    }

    let removed = state
        .db
        .delete_connection(&wallet)
        .await
        .map_err(|e| internal_error("Failed to delete X connection", e))?;
    if removed {
        info!("Wallet {} unlinked its X account", wallet);
    }
    Ok(Json(SuccessResponse { success: removed }))
}
