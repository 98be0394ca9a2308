//! AI market drafting endpoint

use super::{api_error, ApiResult};
use crate::api::server::AppState;
use crate::services::MarketDraft;
use axum::{extract::State, http::StatusCode, Json};
use chrono::Utc;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratePredictionRequest {
    #[serde(default)]
    pub user_input: String,
}

/// Turn free text into a market draft. Provider failures fall back to a
/// local draft, so this only fails on empty input.
pub async fn generate_prediction(
    State(state): State<AppState>,
    Json(req): Json<GeneratePredictionRequest>,
) -> ApiResult<MarketDraft> {
    let input = req.user_input.trim();
    if input.is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "User input is required"));
    }

    Ok(Json(state.drafter.draft(input, Utc::now()).await))
}
