//! Market API endpoints

use super::{
    api_error, internal_error, require_session, validate_options, ApiError, ApiResult,
};
use crate::api::server::AppState;
use crate::services::{Condition, Registration, TrackingRegistrar};
use crate::types::{Market, MarketEvent, MarketStatus, MonitoringStatus, NewMarket};
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
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Query parameters for listing markets
#[derive(Debug, Deserialize)]
pub struct ListMarketsQuery {
    /// "active" or "resolved"; anything else lists everything
    pub status: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OptionView {
    pub id: String,
    pub label: String,
    pub total_staked: Decimal,
    pub percentage: u32,
}

/// Market as served to clients, with display percentages
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketView {
    pub id: String,
    pub creator_wallet: String,
    pub title: String,
    pub description: String,
    pub category: String,
    pub tags: Vec<String>,
    pub status: MarketStatus,
    pub end_date: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub participants: i64,
    pub total_volume: Decimal,
    pub winner: Option<String>,
    pub tx_hash: Option<String>,
    pub resolution_method: Option<String>,
    pub x_target_username: Option<String>,
    pub x_condition_type: Option<String>,
    pub x_monitoring_status: MonitoringStatus,
    pub options: Vec<OptionView>,
}

impl From<Market> for MarketView {
    fn from(market: Market) -> Self {
        let percentages = market.percentages();
        let options = market
            .options
            .into_iter()
            .zip(percentages)
            .map(|(o, percentage)| OptionView {
                id: o.id,
                label: o.label,
                total_staked: o.total_staked,
                percentage,
            })
            .collect();

        Self {
            id: market.id,
            creator_wallet: market.creator_wallet,
            title: market.title,
            description: market.description,
            category: market.category,
            tags: market.tags,
            status: market.status,
            end_date: market.end_date,
            created_at: market.created_at,
            participants: market.participants,
            total_volume: market.total_volume,
            winner: market.winner_id,
            tx_hash: market.tx_hash,
            resolution_method: market.resolution_method,
            x_target_username: market.x_target_username,
            x_condition_type: market.x_condition_type,
            x_monitoring_status: market.x_monitoring_status,
            options,
        }
    }
}

/// Create market request
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateMarketRequest {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub category: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub end_date: DateTime<Utc>,
    pub options: Vec<String>,
    pub tx_hash: Option<String>,
    pub resolution_method: Option<String>,
    /// Overrides the condition detected from the title
    pub condition: Option<Condition>,
}

/// Manual resolve request
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveMarketRequest {
    pub winner_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveMarketResponse {
    pub success: bool,
    /// False when the market was already resolved
    pub changed: bool,
    pub market: MarketView,
}

/// List markets, optionally filtered by status
pub async fn list_markets(
    State(state): State<AppState>,
    Query(query): Query<ListMarketsQuery>,
) -> ApiResult<Vec<MarketView>> {
    let status = query.status.as_deref().and_then(MarketStatus::parse);
    let markets = state
        .db
        .list_markets(status)
        .await
        .map_err(|e| internal_error("Failed to fetch markets", e))?;

    Ok(Json(markets.into_iter().map(MarketView::from).collect()))
}

/// Get one market
pub async fn get_market(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<MarketView> {
    let market = state
        .db
        .get_market(&id)
        .await
        .map_err(|e| internal_error("Failed to fetch market", e))?
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "Market not found"))?;

    Ok(Json(market.into()))
}

/// Create a market for the session wallet
pub async fn create_market(
    State(state): State<AppState>,
    auth: Option<TypedHeader<Authorization<Bearer>>>,
    Json(req): Json<CreateMarketRequest>,
) -> Result<(StatusCode, Json<MarketView>), ApiError> {
    let session = require_session(&state, auth).await?;
    let now = Utc::now();

    let title = req.title.trim();
    if title.is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "Title is required"));
    }
    if req.end_date <= now {
        return Err(api_error(StatusCode::BAD_REQUEST, "End date must be in the future"));
    }
    let labels = validate_options(&req.options)?;

    let new = NewMarket {
        creator_wallet: session.wallet_address.clone(),
        title: title.to_string(),
        description: req.description.trim().to_string(),
        category: req
            .category
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| "Community".to_string()),
        tags: req.tags,
        end_date: req.end_date,
        tx_hash: req.tx_hash,
        resolution_method: req.resolution_method,
    };

    let market = state
        .db
        .create_market(&new, &labels, now)
        .await
        .map_err(|e| internal_error("Failed to create market", e))?;

    info!("Market {} created by {}", market.id, market.creator_wallet);
    announce_market(&state, &market, req.condition);

    Ok((StatusCode::CREATED, Json(market.into())))
}

/// Broadcast a new market and register it for X monitoring in the background
pub(crate) fn announce_market(state: &AppState, market: &Market, condition: Option<Condition>) {
    let _ = state.event_tx.send(MarketEvent::MarketCreated {
        market_id: market.id.clone(),
        title: market.title.clone(),
    });
    spawn_registration(state.registrar.clone(), market.clone(), condition);
}

fn spawn_registration(registrar: TrackingRegistrar, market: Market, condition: Option<Condition>) {
    tokio::spawn(async move {
        match registrar.register_market(&market, condition, Utc::now()).await {
            Ok(Registration::Tracking { usernames }) => {
                info!("Market {} now tracking @{}", market.id, usernames.join(", @"));
            }
            Ok(other) => {
                debug!("Market {} not tracked: {:?}", market.id, other);
            }
            Err(e) => {
                warn!("Error registering X tracking for market {}: {}", market.id, e);
            }
        }
    });
}

/// Resolve a market by hand. Only its creator may do this.
pub async fn resolve_market(
    State(state): State<AppState>,
    auth: Option<TypedHeader<Authorization<Bearer>>>,
    Path(id): Path<String>,
    Json(req): Json<ResolveMarketRequest>,
) -> ApiResult<ResolveMarketResponse> {
    let session = require_session(&state, auth).await?;

    let market = state
        .db
        .get_market(&id)
        .await
        .map_err(|e| internal_error("Failed to fetch market", e))?
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "Market not found"))?;

    if market.creator_wallet != session.wallet_address {
        return Err(api_error(
            StatusCode::FORBIDDEN,
            "Only the market creator can resolve it",
        ));
    }
    if market.option(&req.winner_id).is_none() {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "Winner must be one of the market's options",
        ));
    }

    let changed = state
        .db
        .resolve_market(&id, &req.winner_id, None, Utc::now())
        .await
        .map_err(|e| internal_error("Failed to resolve market", e))?;

    if changed {
        info!("Market {} resolved manually: winner {}", id, req.winner_id);
        let _ = state.event_tx.send(MarketEvent::MarketResolved {
            market_id: id.clone(),
            winner_id: req.winner_id.clone(),
            automatic: false,
        });
    }

    let market = state
        .db
        .get_market(&id)
        .await
        .map_err(|e| internal_error("Failed to fetch market", e))?
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "Market not found"))?;

    Ok(Json(ResolveMarketResponse {
        success: true,
        changed,
        market: market.into(),
    }))
}
