//! Resolution applier
//! Picks the winning option for an auto-resolved market and writes it once

use crate::db::Database;
use crate::types::{Market, MarketOption, ResolutionProof};
use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{info, warn};

/// Result of trying to resolve a market
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolutionOutcome {
    /// This call resolved the market
    Resolved { winner_id: String },
    /// The market was already resolved; nothing was written
    AlreadyResolved,
    /// No option reads as "the event happened"; the market stays active
    NoAffirmativeOption,
}

/// The option meaning "yes, it happened": first label containing "yes" or
/// "true", case-insensitive.
pub fn affirmative_option(market: &Market) -> Option<&MarketOption> {
    market.options.iter().find(|o| {
        let label = o.label.to_lowercase();
        label.contains("yes") || label.contains("true")
    })
}

/// Resolve `market` in favour of its affirmative option with `proof` as
/// evidence. The write only lands if the market is still active.
pub async fn apply_resolution(
    db: &Database,
    market: &Market,
    proof: &ResolutionProof,
    now: DateTime<Utc>,
) -> Result<ResolutionOutcome> {
    let Some(winner) = affirmative_option(market) else {
        warn!(
            "Market {} met its condition but has no affirmative option; leaving it active",
            market.id
        );
        return Ok(ResolutionOutcome::NoAffirmativeOption);
    };

    if db.resolve_market(&market.id, &winner.id, Some(proof), now).await? {
        info!(
            "Market {} resolved: winner '{}' | proof: {}",
            market.id, winner.label, proof.tweet_url
        );
        Ok(ResolutionOutcome::Resolved {
            winner_id: winner.id.clone(),
        })
    } else {
        Ok(ResolutionOutcome::AlreadyResolved)
    }
}
