//! X monitor status and manual polling

use super::{require_session, ApiResult};
use crate::api::server::AppState;
use crate::services::{CycleOutcome, CycleReport, MonitorStatus};
use axum::{extract::State, Json};
use axum_extra::{
    headers::{authorization::Bearer, Authorization},
    TypedHeader,
};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Result of a manual poll
#[derive(Debug, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PollResponse {
    Completed { report: CycleReport },
    Cooldown {
        #[serde(rename = "rateLimitedUntil")]
        rate_limited_until: DateTime<Utc>,
    },
    AlreadyRunning,
    Failed { error: String },
}

impl From<CycleOutcome> for PollResponse {
    fn from(outcome: CycleOutcome) -> Self {
        match outcome {
            CycleOutcome::Completed(report) => PollResponse::Completed { report },
            CycleOutcome::Cooldown { until } => PollResponse::Cooldown {
                rate_limited_until: until,
            },
            CycleOutcome::AlreadyRunning => PollResponse::AlreadyRunning,
            CycleOutcome::Failed(error) => PollResponse::Failed { error },
        }
    }
}

pub async fn status(State(state): State<AppState>) -> Json<MonitorStatus> {
    Json(state.monitor.status().await)
}

/// Run one cycle now. Honors the rate-limit cooldown and the running guard.
pub async fn poll(
    State(state): State<AppState>,
    auth: Option<TypedHeader<Authorization<Bearer>>>,
) -> ApiResult<PollResponse> {
    require_session(&state, auth).await?;
    Ok(Json(state.monitor.tick().await.into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_poll_response_shape() {
        let until = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();
        let json = serde_json::to_value(PollResponse::from(CycleOutcome::Cooldown { until })).unwrap();
        assert_eq!(json["outcome"], "cooldown");
        assert_eq!(json["rateLimitedUntil"], "2026-01-01T12:00:00Z");

        let json = serde_json::to_value(PollResponse::from(CycleOutcome::AlreadyRunning)).unwrap();
        assert_eq!(json["outcome"], "already_running");

        let report = CycleReport {
            records_checked: 2,
            ..Default::default()
        };
        let json = serde_json::to_value(PollResponse::from(CycleOutcome::Completed(report))).unwrap();
        assert_eq!(json["outcome"], "completed");
        assert_eq!(json["report"]["recordsChecked"], 2);
    }
}
