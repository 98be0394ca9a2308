//! Stats, leaderboard and badge endpoints

use super::{api_error, internal_error, parse_wallet, require_session, ApiResult};
use crate::api::server::AppState;
use crate::types::{Badge, BadgeType, LeaderboardEntry, UserStats};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use axum_extra::{
    headers::{authorization::Bearer, Authorization},
    TypedHeader,
};
use chrono::Utc;
use serde::Deserialize;

const LEADERBOARD_SIZE: usize = 10;

/// Award badge request
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AwardBadgeRequest {
    pub badge_type: String,
    pub metadata: Option<String>,
}

pub async fn get_stats(
    State(state): State<AppState>,
    Path(wallet): Path<String>,
) -> ApiResult<UserStats> {
    let wallet = parse_wallet(&wallet)?;
    let stats = state
        .db
        .user_stats(&wallet)
        .await
        .map_err(|e| internal_error("Failed to fetch stats", e))?;
    Ok(Json(stats))
}

pub async fn get_leaderboard(State(state): State<AppState>) -> ApiResult<Vec<LeaderboardEntry>> {
    let entries = state
        .db
        .leaderboard(LEADERBOARD_SIZE)
        .await
        .map_err(|e| internal_error("Failed to fetch leaderboard", e))?;
    Ok(Json(entries))
}

pub async fn list_badges(
    State(state): State<AppState>,
    Path(wallet): Path<String>,
) -> ApiResult<Vec<Badge>> {
    let wallet = parse_wallet(&wallet)?;
    let badges = state
        .db
        .badges_for_wallet(&wallet)
        .await
        .map_err(|e| internal_error("Failed to fetch badges", e))?;
    Ok(Json(badges))
}

/// Claim a badge for the session wallet. `x_verified` is only granted by
/// linking an X account.
pub async fn award_badge(
    State(state): State<AppState>,
    auth: Option<TypedHeader<Authorization<Bearer>>>,
    Json(req): Json<AwardBadgeRequest>,
) -> ApiResult<Badge> {
    let session = require_session(&state, auth).await?;

    let badge_type = BadgeType::parse(req.badge_type.trim())
        .ok_or_else(|| api_error(StatusCode::BAD_REQUEST, "Invalid badge type"))?;
    if badge_type == BadgeType::XVerified {
        return Err(api_error(
            StatusCode::FORBIDDEN,
            "The x_verified badge is awarded by linking an X account",
        ));
    }

    let badge = state
        .db
        .award_badge(
            &session.wallet_address,
            badge_type,
            req.metadata.as_deref(),
            Utc::now(),
        )
        .await
        .map_err(|e| internal_error("Failed to award badge", e))?;
    Ok(Json(badge))
}
