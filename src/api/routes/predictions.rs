//! Prediction API endpoints

use super::{api_error, internal_error, parse_wallet, require_session, ApiError, ApiResult};
use crate::api::server::AppState;
use crate::db::PredictionError;
use crate::types::{MarketEvent, Prediction, PredictionDetail};
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
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::info;

/// Place prediction request
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePredictionRequest {
    pub market_id: String,
    pub option_id: String,
    pub amount: Decimal,
    pub tx_hash: Option<String>,
}

impl From<PredictionError> for ApiError {
    fn from(err: PredictionError) -> Self {
        match err {
            PredictionError::MarketNotFound => api_error(StatusCode::NOT_FOUND, err.to_string()),
            PredictionError::MarketClosed
            | PredictionError::UnknownOption
            | PredictionError::InvalidAmount => api_error(StatusCode::BAD_REQUEST, err.to_string()),
            PredictionError::Storage(e) => internal_error("Failed to create prediction", e),
        }
    }
}

/// Stake on an option as the session wallet
pub async fn create_prediction(
    State(state): State<AppState>,
    auth: Option<TypedHeader<Authorization<Bearer>>>,
    Json(req): Json<CreatePredictionRequest>,
) -> Result<(StatusCode, Json<Prediction>), ApiError> {
    let session = require_session(&state, auth).await?;

    let prediction = state
        .db
        .place_prediction(
            &req.market_id,
            &session.wallet_address,
            &req.option_id,
            req.amount,
            req.tx_hash.as_deref(),
            Utc::now(),
        )
        .await?;

    info!(
        "{} staked {} on option {} of market {}",
        prediction.user_wallet, prediction.amount, prediction.option_id, prediction.market_id
    );
    let _ = state.event_tx.send(MarketEvent::PredictionPlaced {
        market_id: prediction.market_id.clone(),
        option_id: prediction.option_id.clone(),
        amount: prediction.amount,
    });

    Ok((StatusCode::CREATED, Json(prediction)))
}

/// Predictions of a wallet, newest first
pub async fn list_predictions(
    State(state): State<AppState>,
    Path(wallet): Path<String>,
) -> ApiResult<Vec<PredictionDetail>> {
    let wallet = parse_wallet(&wallet)?;
    let predictions = state
        .db
        .predictions_for_wallet(&wallet)
        .await
        .map_err(|e| internal_error("Failed to fetch predictions", e))?;
    Ok(Json(predictions))
}
