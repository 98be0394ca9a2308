//! Community proposal endpoints

use super::markets::{announce_market, MarketView};
use super::{
    api_error, internal_error, parse_wallet, require_session, validate_options, ApiError,
    ApiResult,
};
use crate::api::server::AppState;
use crate::db::VoteError;
use crate::types::{Proposal, ProposalStatus};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use axum_extra::{
    headers::{authorization::Bearer, Authorization},
    TypedHeader,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Deserialize)]
pub struct ListProposalsQuery {
    /// "proposed", "created" or "rejected"; anything else lists everything
    pub status: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateProposalRequest {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub category: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConvertProposalRequest {
    pub end_date: DateTime<Utc>,
    pub options: Vec<String>,
    pub tx_hash: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteStatusResponse {
    pub has_voted: bool,
}

#[derive(Debug, Serialize)]
pub struct ConvertProposalResponse {
    pub market: MarketView,
    pub proposal: Proposal,
}

impl From<VoteError> for ApiError {
    fn from(err: VoteError) -> Self {
        match err {
            VoteError::Duplicate => api_error(StatusCode::CONFLICT, err.to_string()),
            VoteError::ProposalNotFound => api_error(StatusCode::NOT_FOUND, err.to_string()),
            VoteError::Database(e) => internal_error("Failed to record vote", e),
        }
    }
}

pub async fn create_proposal(
    State(state): State<AppState>,
    auth: Option<TypedHeader<Authorization<Bearer>>>,
    Json(req): Json<CreateProposalRequest>,
) -> Result<(StatusCode, Json<Proposal>), ApiError> {
    let session = require_session(&state, auth).await?;

    let title = req.title.trim();
    if title.is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "Title is required"));
    }
    let category = req
        .category
        .as_deref()
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .unwrap_or("Community");

    let proposal = state
        .db
        .create_proposal(
            &session.wallet_address,
            title,
            req.description.trim(),
            category,
            &req.tags,
            Utc::now(),
        )
        .await
        .map_err(|e| internal_error("Failed to create proposal", e))?;

    Ok((StatusCode::CREATED, Json(proposal)))
}

pub async fn list_proposals(
    State(state): State<AppState>,
    Query(query): Query<ListProposalsQuery>,
) -> ApiResult<Vec<Proposal>> {
    let status = query.status.as_deref().and_then(ProposalStatus::parse);
    let proposals = state
        .db
        .list_proposals(status)
        .await
        .map_err(|e| internal_error("Failed to fetch proposals", e))?;
    Ok(Json(proposals))
}

pub async fn get_proposal(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Proposal> {
    let proposal = load_proposal(&state, &id).await?;
    Ok(Json(proposal))
}

/// Vote for a proposal as the session wallet; a second vote is a 409
pub async fn vote(
    State(state): State<AppState>,
    auth: Option<TypedHeader<Authorization<Bearer>>>,
    Path(id): Path<String>,
) -> ApiResult<Proposal> {
    let session = require_session(&state, auth).await?;
    state
        .db
        .vote_proposal(&id, &session.wallet_address, Utc::now())
        .await?;
    Ok(Json(load_proposal(&state, &id).await?))
}

/// Withdraw the session wallet's vote
pub async fn unvote(
    State(state): State<AppState>,
    auth: Option<TypedHeader<Authorization<Bearer>>>,
    Path(id): Path<String>,
) -> ApiResult<Proposal> {
    let session = require_session(&state, auth).await?;
    state.db.unvote_proposal(&id, &session.wallet_address).await?;
    Ok(Json(load_proposal(&state, &id).await?))
}

pub async fn vote_status(
    State(state): State<AppState>,
    Path((id, wallet)): Path<(String, String)>,
) -> ApiResult<VoteStatusResponse> {
    let wallet = parse_wallet(&wallet)?;
    let has_voted = state
        .db
        .has_voted(&id, &wallet)
        .await
        .map_err(|e| internal_error("Failed to check vote status", e))?;
    Ok(Json(VoteStatusResponse { has_voted }))
}

/// Turn a proposal into a live market owned by the session wallet
pub async fn convert(
    State(state): State<AppState>,
    auth: Option<TypedHeader<Authorization<Bearer>>>,
    Path(id): Path<String>,
    Json(req): Json<ConvertProposalRequest>,
) -> ApiResult<ConvertProposalResponse> {
    let session = require_session(&state, auth).await?;
    let now = Utc::now();

    if req.end_date <= now {
        return Err(api_error(StatusCode::BAD_REQUEST, "End date must be in the future"));
    }
    let labels = validate_options(&req.options)?;

    let existing = load_proposal(&state, &id).await?;
    if existing.status != ProposalStatus::Proposed {
        return Err(api_error(StatusCode::CONFLICT, "Proposal was already converted"));
    }

    let (market, proposal) = state
        .db
        .convert_proposal(
            &id,
            &session.wallet_address,
            req.end_date,
            &labels,
            req.tx_hash.as_deref(),
            now,
        )
        .await
        .map_err(|e| internal_error("Failed to convert proposal", e))?
        .ok_or_else(|| api_error(StatusCode::CONFLICT, "Proposal was already converted"))?;

    info!("Proposal {} converted to market {}", proposal.id, market.id);
    announce_market(&state, &market, None);

    Ok(Json(ConvertProposalResponse {
        market: market.into(),
        proposal,
    }))
}

async fn load_proposal(state: &AppState, id: &str) -> Result<Proposal, ApiError> {
    state
        .db
        .get_proposal(id)
        .await
        .map_err(|e| internal_error("Failed to fetch proposal", e))?
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "Proposal not found"))
}
