//! Core types for markets, predictions, proposals and X tracking

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Market lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketStatus {
    Active,
    Resolved,
}

impl MarketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketStatus::Active => "active",
            MarketStatus::Resolved => "resolved",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(MarketStatus::Active),
            "resolved" => Some(MarketStatus::Resolved),
            _ => None,
        }
    }
}

impl fmt::Display for MarketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Monitoring state, used both on markets and on tracking records.
/// Markets start `Inactive`; tracking records start `Active`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitoringStatus {
    Inactive,
    Active,
    Paused,
    Resolved,
}

impl MonitoringStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MonitoringStatus::Inactive => "inactive",
            MonitoringStatus::Active => "active",
            MonitoringStatus::Paused => "paused",
            MonitoringStatus::Resolved => "resolved",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "active" => MonitoringStatus::Active,
            "paused" => MonitoringStatus::Paused,
            "resolved" => MonitoringStatus::Resolved,
            _ => MonitoringStatus::Inactive,
        }
    }
}

/// One selectable outcome of a market
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketOption {
    pub id: String,
    pub market_id: String,
    pub label: String,
    pub total_staked: Decimal,
}

/// A predictive question with its options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Market {
    pub id: String,
    pub creator_wallet: String,
    pub title: String,
    pub description: String,
    pub category: String,
    pub tags: Vec<String>,
    pub status: MarketStatus,
    pub end_date: DateTime<Utc>,
    pub total_volume: Decimal,
    pub participants: i64,
    pub winner_id: Option<String>,
    pub tx_hash: Option<String>,
    pub resolution_method: Option<String>,
    pub created_at: DateTime<Utc>,
    pub x_target_user_id: Option<String>,
    pub x_target_username: Option<String>,
    pub x_condition_type: Option<String>,
    pub x_monitoring_status: MonitoringStatus,
    pub options: Vec<MarketOption>,
}

impl Market {
    pub fn is_active(&self) -> bool {
        self.status == MarketStatus::Active
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.end_date
    }

    /// Display percentages in option order
    pub fn percentages(&self) -> Vec<u32> {
        let staked: Vec<Decimal> = self.options.iter().map(|o| o.total_staked).collect();
        option_percentages(&staked)
    }

    pub fn option(&self, option_id: &str) -> Option<&MarketOption> {
        self.options.iter().find(|o| o.id == option_id)
    }
}

/// Fields needed to create a market
#[derive(Debug, Clone)]
pub struct NewMarket {
    pub creator_wallet: String,
    pub title: String,
    pub description: String,
    pub category: String,
    pub tags: Vec<String>,
    pub end_date: DateTime<Utc>,
    pub tx_hash: Option<String>,
    pub resolution_method: Option<String>,
}

/// Percentage shares that always sum to 100 when anything is staked.
///
/// Every option but the last rounds half-up; the last takes what is left.
/// If the rounded prefix overshoots 100, the overflow comes off the largest
/// preceding shares so the last option never goes negative.
pub fn option_percentages(staked: &[Decimal]) -> Vec<u32> {
    let total = staked
        .iter()
        .fold(Decimal::ZERO, |acc, s| acc.saturating_add(*s));
    if staked.is_empty() || total <= Decimal::ZERO {
        return vec![0; staked.len()];
    }

    let hundred = Decimal::from(100);
    let last = staked.len() - 1;
    let mut shares: Vec<i64> = staked[..last]
        .iter()
        .map(|s| {
            (*s / total * hundred)
                .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
                .to_i64()
                .unwrap_or(0)
                .max(0)
        })
        .collect();

    let mut remainder = 100 - shares.iter().sum::<i64>();
    while remainder < 0 {
        // Only reachable with 3+ rounded shares each rounding up.
        let Some((idx, _)) = shares.iter().enumerate().max_by_key(|(_, v)| **v) else {
            break;
        };
        shares[idx] -= 1;
        remainder += 1;
    }
    shares.push(remainder);

    shares.into_iter().map(|v| v.max(0) as u32).collect()
}

/// A user's stake on one option
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Prediction {
    pub id: String,
    pub market_id: String,
    pub user_wallet: String,
    pub option_id: String,
    pub amount: Decimal,
    pub tx_hash: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A prediction joined with its market and option, for profile pages
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PredictionDetail {
    pub prediction: Prediction,
    pub market_title: String,
    pub market_status: MarketStatus,
    pub market_end_date: DateTime<Utc>,
    pub market_winner_id: Option<String>,
    pub option_label: String,
}

impl PredictionDetail {
    pub fn is_win(&self) -> bool {
        self.market_winner_id.as_deref() == Some(self.prediction.option_id.as_str())
    }
}

/// Per-wallet performance summary
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserStats {
    pub markets_joined: i64,
    pub wins: i64,
    pub win_rate: i64,
    pub total_earnings: i64,
}

/// Winning stakes pay out at a flat 1.5x for display purposes
pub const EARNINGS_MULTIPLIER: Decimal = Decimal::from_parts(15, 0, 0, false, 1);

/// Largest single stake accepted
pub const MAX_STAKE: Decimal = Decimal::from_parts(1_000_000_000, 0, 0, false, 0);

impl UserStats {
    pub fn from_predictions(predictions: &[PredictionDetail]) -> Self {
        let markets_joined = predictions.len() as i64;
        let wins = predictions.iter().filter(|p| p.is_win()).count() as i64;
        let win_rate = if markets_joined > 0 {
            (wins as f64 / markets_joined as f64 * 100.0).round() as i64
        } else {
            0
        };
        // Saturating: rows written before stakes were capped can be huge
        let earnings = predictions
            .iter()
            .filter(|p| p.is_win())
            .map(|p| p.prediction.amount.saturating_mul(EARNINGS_MULTIPLIER))
            .fold(Decimal::ZERO, |acc, e| acc.saturating_add(e));

        Self {
            markets_joined,
            wins,
            win_rate,
            total_earnings: earnings
                .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
                .to_i64()
                .unwrap_or(i64::MAX),
        }
    }
}

/// Leaderboard row
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardEntry {
    pub rank: usize,
    pub wallet: String,
    pub markets_joined: i64,
    pub win_rate: i64,
    pub total_earnings: i64,
    pub accuracy: i64,
}

/// Badge kinds a wallet can earn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BadgeType {
    EarlyAdopter,
    XVerified,
    MarketCreator,
    TopPredictor,
    VolumeTrader,
}

impl BadgeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BadgeType::EarlyAdopter => "early_adopter",
            BadgeType::XVerified => "x_verified",
            BadgeType::MarketCreator => "market_creator",
            BadgeType::TopPredictor => "top_predictor",
            BadgeType::VolumeTrader => "volume_trader",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "early_adopter" => Some(BadgeType::EarlyAdopter),
            "x_verified" => Some(BadgeType::XVerified),
            "market_creator" => Some(BadgeType::MarketCreator),
            "top_predictor" => Some(BadgeType::TopPredictor),
            "volume_trader" => Some(BadgeType::VolumeTrader),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Badge {
    pub id: String,
    pub user_wallet: String,
    pub badge_type: BadgeType,
    pub earned_at: DateTime<Utc>,
    pub metadata: Option<String>,
}

/// Proposal lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProposalStatus {
    Proposed,
    Created,
    Rejected,
}

impl ProposalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProposalStatus::Proposed => "proposed",
            ProposalStatus::Created => "created",
            ProposalStatus::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "proposed" => Some(ProposalStatus::Proposed),
            "created" => Some(ProposalStatus::Created),
            "rejected" => Some(ProposalStatus::Rejected),
            _ => None,
        }
    }
}

/// A community market idea
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Proposal {
    pub id: String,
    pub proposer_wallet: String,
    pub title: String,
    pub description: String,
    pub category: String,
    pub tags: Vec<String>,
    pub votes: i64,
    pub status: ProposalStatus,
    pub market_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A linked X account. The credential stays encrypted in the database and
/// is never serialized.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SocialConnection {
    pub id: String,
    pub user_wallet: String,
    pub x_user_id: String,
    pub x_username: String,
    pub x_display_name: Option<String>,
    pub x_profile_image: Option<String>,
    pub token_expires_at: Option<DateTime<Utc>>,
    pub connected_at: DateTime<Utc>,
}

/// A post returned by the social read API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    pub id: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub author_id: Option<String>,
}

/// Proof stored on tracking records when a condition fires
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionProof {
    pub tweet_id: String,
    pub tweet_url: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub text: String,
}

/// Binds a market to one monitored X account and a condition
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackingRecord {
    pub id: String,
    pub market_id: String,
    pub x_target_user_id: String,
    pub x_target_username: String,
    pub condition: crate::services::conditions::Condition,
    pub last_checked_tweet_id: Option<String>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub monitoring_status: MonitoringStatus,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution_proof: Option<ResolutionProof>,
}

/// Ordering of post ids. X ids are snowflakes, so numeric comparison is
/// exact; anything else falls back to (length, lexical).
pub fn compare_post_ids(a: &str, b: &str) -> Ordering {
    match (a.parse::<u128>(), b.parse::<u128>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        _ => a.len().cmp(&b.len()).then_with(|| a.cmp(b)),
    }
}

/// True if `candidate` is strictly newer than `current` (or there is no cursor yet)
pub fn is_newer_cursor(candidate: &str, current: Option<&str>) -> bool {
    match current {
        None => true,
        Some(cur) => compare_post_ids(candidate, cur) == Ordering::Greater,
    }
}

/// Events pushed to WebSocket subscribers
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum MarketEvent {
    MarketCreated {
        market_id: String,
        title: String,
    },
    PredictionPlaced {
        market_id: String,
        option_id: String,
        amount: Decimal,
    },
    MarketResolved {
        market_id: String,
        winner_id: String,
        automatic: bool,
    },
}
