//! Registers new markets for X monitoring
//!
//! Mentions in the title name the accounts to watch; the creator's linked X
//! account supplies the credential used to look them up and, later, to read
//! their timelines.

use super::conditions::{extract_mentions, Condition};
use super::x_client::SocialReader;
use crate::db::Database;
use crate::types::Market;
use crate::wallet::CredentialVault;
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What registration did for a market
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    /// Tracking records were created for these usernames
    Tracking { usernames: Vec<String> },
    NoMentions,
    NoCondition,
    CreatorNotLinked,
    NoResolvableAccounts,
}

/// Turns market titles into tracking records
#[derive(Clone)]
pub struct TrackingRegistrar {
    db: Arc<Database>,
    vault: CredentialVault,
    reader: Arc<dyn SocialReader>,
}

impl TrackingRegistrar {
    pub fn new(db: Arc<Database>, vault: CredentialVault, reader: Arc<dyn SocialReader>) -> Self {
        Self { db, vault, reader }
    }

    /// Register `market` for monitoring. An explicit condition wins over the
    /// one detected from the title.
    pub async fn register_market(
        &self,
        market: &Market,
        explicit: Option<Condition>,
        now: DateTime<Utc>,
    ) -> Result<Registration> {
        let mentions = extract_mentions(&market.title);
        if mentions.is_empty() {
            debug!("Market {} has no X mentions, skipping tracking", market.id);
            return Ok(Registration::NoMentions);
        }

        let Some(condition) = explicit.or_else(|| Condition::detect(&market.title)) else {
            info!("Market {} matches no supported condition, skipping tracking", market.id);
            return Ok(Registration::NoCondition);
        };

        let Some(sealed) = self.db.get_connection_credential(&market.creator_wallet).await? else {
            info!(
                "Creator of market {} has no linked X account, tracking disabled",
                market.id
            );
            return Ok(Registration::CreatorNotLinked);
        };
        let tokens = self.vault.open(&sealed)?;

        let mut resolved = Vec::new();
        for username in mentions {
            match self.reader.resolve_username(&username, &tokens.access_token).await {
                Ok(Some(user_id)) => {
                    debug!("Resolved @{} to user ID {}", username, user_id);
                    resolved.push((username, user_id));
                }
                Ok(None) => {
                    info!("@{} does not exist, skipping", username);
                }
                Err(e) => {
                    warn!("Failed to resolve @{}: {}", username, e);
                }
            }
        }

        let Some((primary_name, primary_id)) = resolved.first() else {
            info!("No valid X users found for market {}, tracking disabled", market.id);
            return Ok(Registration::NoResolvableAccounts);
        };

        self.db
            .set_market_monitoring(&market.id, primary_id, primary_name, condition.kind())
            .await?;

        for (username, user_id) in &resolved {
            self.db
                .create_tracking(&market.id, user_id, username, &condition, now)
                .await?;
        }

        let usernames: Vec<String> = resolved.into_iter().map(|(name, _)| name).collect();
        info!(
            "Market {} now tracking {} account(s) for {}: @{}",
            market.id,
            usernames.len(),
            condition.kind(),
            usernames.join(", @")
        );

        Ok(Registration::Tracking { usernames })
    }
}
