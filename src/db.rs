//! SQLite storage for markets, predictions, proposals, X links and tracking

use crate::services::conditions::Condition;
use crate::types::{
    Badge, BadgeType, LeaderboardEntry, Market, MarketOption, MarketStatus, MonitoringStatus,
    NewMarket, Prediction, PredictionDetail, Proposal, ProposalStatus, ResolutionProof,
    SocialConnection, TrackingRecord, UserStats, MAX_STAKE,
};
use crate::wallet::EncryptedCredential;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::collections::HashMap;
use std::str::FromStr;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

/// Wallet session issued after signature sign-in
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub wallet_address: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Why a prediction was refused
#[derive(Debug, Error)]
pub enum PredictionError {
    #[error("Market not found")]
    MarketNotFound,
    #[error("Market is no longer accepting predictions")]
    MarketClosed,
    #[error("Option does not belong to this market")]
    UnknownOption,
    #[error("Amount must be greater than zero and at most 1000000000")]
    InvalidAmount,
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl From<sqlx::Error> for PredictionError {
    fn from(e: sqlx::Error) -> Self {
        PredictionError::Storage(e.into())
    }
}

/// Proposal voting failures callers branch on
#[derive(Debug, Error)]
pub enum VoteError {
    #[error("Wallet has already voted for this proposal")]
    Duplicate,
    #[error("Proposal not found")]
    ProposalNotFound,
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// Timestamps are stored fixed-width so TEXT comparison matches time order
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("Invalid timestamp: {}", s))?
        .with_timezone(&Utc))
}

fn parse_ts_opt(s: Option<String>) -> Option<DateTime<Utc>> {
    s.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|d| d.with_timezone(&Utc))
}

fn parse_dec(s: &str) -> Result<Decimal> {
    Decimal::from_str(s).with_context(|| format!("Invalid decimal: {}", s))
}

fn parse_tags(s: &str) -> Vec<String> {
    serde_json::from_str(s).unwrap_or_default()
}

/// Database connection pool
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (or create) the database file
    pub async fn new(path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("Failed to connect to database")?;

        let db = Self { pool };
        db.initialize().await?;

        Ok(db)
    }

    /// Private in-memory database; a single connection keeps it alive
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .context("Failed to open in-memory database")?;

        let db = Self { pool };
        db.initialize().await?;

        Ok(db)
    }

    /// Additive column migrations for databases created by older builds
    async fn run_migrations(&self) -> Result<()> {
        let tracking_info: Vec<(i64, String, String, i64, Option<String>, i64)> =
            sqlx::query_as("PRAGMA table_info(x_market_tracking)")
                .fetch_all(&self.pool)
                .await
                .unwrap_or_default();

        let has_params = tracking_info.iter().any(|(_, name, _, _, _, _)| name == "condition_params");
        if !tracking_info.is_empty() && !has_params {
            info!("Migrating x_market_tracking table: adding condition_params column");
            sqlx::query("ALTER TABLE x_market_tracking ADD COLUMN condition_params TEXT")
                .execute(&self.pool)
                .await?;
        }

        let market_info: Vec<(i64, String, String, i64, Option<String>, i64)> =
            sqlx::query_as("PRAGMA table_info(markets)")
                .fetch_all(&self.pool)
                .await
                .unwrap_or_default();

        let has_resolution_method = market_info.iter().any(|(_, name, _, _, _, _)| name == "resolution_method");
        if !market_info.is_empty() && !has_resolution_method {
            info!("Migrating markets table: adding resolution_method column");
            sqlx::query("ALTER TABLE markets ADD COLUMN resolution_method TEXT")
                .execute(&self.pool)
                .await?;
        }

        Ok(())
    }

    /// Initialize database schema
    async fn initialize(&self) -> Result<()> {
        self.run_migrations().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS markets (
                id TEXT PRIMARY KEY,
                creator_wallet TEXT NOT NULL,
                title TEXT NOT NULL,
                description TEXT NOT NULL,
                category TEXT NOT NULL DEFAULT 'Community',
                tags TEXT NOT NULL DEFAULT '[]',
                status TEXT NOT NULL DEFAULT 'active',
                end_date TEXT NOT NULL,
                total_volume TEXT NOT NULL DEFAULT '0',
                participants INTEGER NOT NULL DEFAULT 0,
                winner_id TEXT,
                tx_hash TEXT,
                resolution_method TEXT,
                created_at TEXT NOT NULL,
                x_target_user_id TEXT,
                x_target_username TEXT,
                x_condition_type TEXT,
                x_monitoring_status TEXT NOT NULL DEFAULT 'inactive'
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS market_options (
                id TEXT PRIMARY KEY,
                market_id TEXT NOT NULL,
                position INTEGER NOT NULL,
                label TEXT NOT NULL,
                total_staked TEXT NOT NULL DEFAULT '0',
                FOREIGN KEY (market_id) REFERENCES markets(id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS predictions (
                id TEXT PRIMARY KEY,
                market_id TEXT NOT NULL,
                user_wallet TEXT NOT NULL,
                option_id TEXT NOT NULL,
                amount TEXT NOT NULL,
                tx_hash TEXT,
                created_at TEXT NOT NULL,
                FOREIGN KEY (market_id) REFERENCES markets(id),
                FOREIGN KEY (option_id) REFERENCES market_options(id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS user_badges (
                id TEXT PRIMARY KEY,
                user_wallet TEXT NOT NULL,
                badge_type TEXT NOT NULL,
                earned_at TEXT NOT NULL,
                metadata TEXT,
                UNIQUE (user_wallet, badge_type)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS x_connections (
                id TEXT PRIMARY KEY,
                user_wallet TEXT NOT NULL UNIQUE,
                x_user_id TEXT NOT NULL,
                x_username TEXT NOT NULL,
                x_display_name TEXT,
                x_profile_image TEXT,
                credential_ciphertext BLOB NOT NULL,
                credential_salt BLOB NOT NULL,
                credential_nonce BLOB NOT NULL,
                token_expires_at TEXT,
                connected_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS x_market_tracking (
                id TEXT PRIMARY KEY,
                market_id TEXT NOT NULL,
                x_target_user_id TEXT NOT NULL,
                x_target_username TEXT NOT NULL,
                condition_type TEXT NOT NULL,
                condition_params TEXT,
                last_checked_tweet_id TEXT,
                last_checked_at TEXT,
                monitoring_status TEXT NOT NULL DEFAULT 'active',
                created_at TEXT NOT NULL,
                resolved_at TEXT,
                resolution_proof TEXT,
                FOREIGN KEY (market_id) REFERENCES markets(id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS market_proposals (
                id TEXT PRIMARY KEY,
                proposer_wallet TEXT NOT NULL,
                title TEXT NOT NULL,
                description TEXT NOT NULL,
                category TEXT NOT NULL DEFAULT 'Community',
                tags TEXT NOT NULL DEFAULT '[]',
                votes INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'proposed',
                market_id TEXT,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS proposal_votes (
                id TEXT PRIMARY KEY,
                proposal_id TEXT NOT NULL,
                voter_wallet TEXT NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE (proposal_id, voter_wallet),
                FOREIGN KEY (proposal_id) REFERENCES market_proposals(id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                wallet_address TEXT NOT NULL,
                created_at TEXT NOT NULL,
                expires_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Indexes
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_markets_status ON markets(status)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_options_market ON market_options(market_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_predictions_wallet ON predictions(user_wallet)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_tracking_status ON x_market_tracking(monitoring_status)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_tracking_market ON x_market_tracking(market_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_sessions_expires ON sessions(expires_at)")
            .execute(&self.pool)
            .await?;

        info!("Database initialized");
        Ok(())
    }

    // ==================== MARKETS ====================

    /// Create a market with its options (2-4 labels, validated by the caller)
    pub async fn create_market(
        &self,
        new: &NewMarket,
        option_labels: &[String],
        now: DateTime<Utc>,
    ) -> Result<Market> {
        let mut tx = self.pool.begin().await?;
        let market = insert_market(&mut tx, new, option_labels, now).await?;
        tx.commit().await?;
        Ok(market)
    }

    pub async fn get_market(&self, id: &str) -> Result<Option<Market>> {
        let row = sqlx::query("SELECT * FROM markets WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let options = sqlx::query("SELECT * FROM market_options WHERE market_id = ? ORDER BY position")
            .bind(id)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(row_to_option)
            .collect::<Result<Vec<_>>>()?;

        Ok(Some(row_to_market(&row, options)?))
    }

    /// Markets newest first, optionally filtered by status
    pub async fn list_markets(&self, status: Option<MarketStatus>) -> Result<Vec<Market>> {
        let rows = match status {
            Some(s) => {
                sqlx::query("SELECT * FROM markets WHERE status = ? ORDER BY created_at DESC")
                    .bind(s.as_str())
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("SELECT * FROM markets ORDER BY created_at DESC")
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        let option_rows = sqlx::query("SELECT * FROM market_options ORDER BY market_id, position")
            .fetch_all(&self.pool)
            .await?;

        let mut options_by_market: HashMap<String, Vec<MarketOption>> = HashMap::new();
        for row in &option_rows {
            let option = row_to_option(row)?;
            options_by_market
                .entry(option.market_id.clone())
                .or_default()
                .push(option);
        }

        rows.iter()
            .map(|row| {
                let id: String = row.get("id");
                let options = options_by_market.remove(&id).unwrap_or_default();
                row_to_market(row, options)
            })
            .collect()
    }

    /// Set the X monitoring fields of a market and mark monitoring active
    pub async fn set_market_monitoring(
        &self,
        market_id: &str,
        target_user_id: &str,
        target_username: &str,
        condition_kind: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE markets
            SET x_target_user_id = ?, x_target_username = ?, x_condition_type = ?,
                x_monitoring_status = 'active'
            WHERE id = ? AND status = 'active'
            "#,
        )
        .bind(target_user_id)
        .bind(target_username)
        .bind(condition_kind)
        .bind(market_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Resolve a market if it is still active, freezing its tracking records.
    ///
    /// Returns false when the market was already resolved (or missing); in
    /// that case nothing is written.
    pub async fn resolve_market(
        &self,
        market_id: &str,
        winner_id: &str,
        proof: Option<&ResolutionProof>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE markets
            SET status = 'resolved', winner_id = ?,
                x_monitoring_status = CASE WHEN x_monitoring_status = 'inactive'
                                           THEN 'inactive' ELSE 'resolved' END
            WHERE id = ? AND status = 'active'
            "#,
        )
        .bind(winner_id)
        .bind(market_id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        let proof_json = proof.map(serde_json::to_string).transpose()?;
        sqlx::query(
            r#"
            UPDATE x_market_tracking
            SET monitoring_status = 'resolved', resolved_at = ?,
                resolution_proof = COALESCE(?, resolution_proof)
            WHERE market_id = ?
            "#,
        )
        .bind(ts(now))
        .bind(proof_json)
        .bind(market_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    // ==================== PREDICTIONS ====================

    /// Stake on an option. Option total, market volume and participant
    /// count move together in one transaction.
    pub async fn place_prediction(
        &self,
        market_id: &str,
        user_wallet: &str,
        option_id: &str,
        amount: Decimal,
        tx_hash: Option<&str>,
        now: DateTime<Utc>,
    ) -> std::result::Result<Prediction, PredictionError> {
        if amount <= Decimal::ZERO || amount > MAX_STAKE {
            return Err(PredictionError::InvalidAmount);
        }

        let mut tx = self.pool.begin().await?;

        let market: Option<(String, String, String)> =
            sqlx::query_as("SELECT status, end_date, total_volume FROM markets WHERE id = ?")
                .bind(market_id)
                .fetch_optional(&mut *tx)
                .await?;
        let Some((status, end_date, total_volume)) = market else {
            return Err(PredictionError::MarketNotFound);
        };
        if MarketStatus::parse(&status) != Some(MarketStatus::Active) || now > parse_ts(&end_date)? {
            return Err(PredictionError::MarketClosed);
        }

        let staked: Option<(String,)> =
            sqlx::query_as("SELECT total_staked FROM market_options WHERE id = ? AND market_id = ?")
                .bind(option_id)
                .bind(market_id)
                .fetch_optional(&mut *tx)
                .await?;
        let Some((staked,)) = staked else {
            return Err(PredictionError::UnknownOption);
        };

        let new_staked = parse_dec(&staked)?
            .checked_add(amount)
            .ok_or(PredictionError::InvalidAmount)?;
        let new_volume = parse_dec(&total_volume)?
            .checked_add(amount)
            .ok_or(PredictionError::InvalidAmount)?;

        sqlx::query("UPDATE market_options SET total_staked = ? WHERE id = ?")
            .bind(new_staked.to_string())
            .bind(option_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "UPDATE markets SET total_volume = ?, participants = participants + 1 WHERE id = ?",
        )
        .bind(new_volume.to_string())
        .bind(market_id)
        .execute(&mut *tx)
        .await?;

        let prediction = Prediction {
            id: Uuid::new_v4().to_string(),
            market_id: market_id.to_string(),
            user_wallet: user_wallet.to_string(),
            option_id: option_id.to_string(),
            amount,
            tx_hash: tx_hash.map(str::to_string),
            created_at: now,
        };

        sqlx::query(
            r#"
            INSERT INTO predictions (id, market_id, user_wallet, option_id, amount, tx_hash, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&prediction.id)
        .bind(&prediction.market_id)
        .bind(&prediction.user_wallet)
        .bind(&prediction.option_id)
        .bind(prediction.amount.to_string())
        .bind(&prediction.tx_hash)
        .bind(ts(now))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(prediction)
    }

    /// A wallet's predictions with market and option details, newest first
    pub async fn predictions_for_wallet(&self, wallet: &str) -> Result<Vec<PredictionDetail>> {
        let rows = sqlx::query(&format!("{} WHERE p.user_wallet = ? ORDER BY p.created_at DESC", PREDICTION_DETAIL_SELECT))
            .bind(wallet)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(row_to_prediction_detail).collect()
    }

    pub async fn user_stats(&self, wallet: &str) -> Result<UserStats> {
        let predictions = self.predictions_for_wallet(wallet).await?;
        Ok(UserStats::from_predictions(&predictions))
    }

    /// Top wallets by display earnings
    pub async fn leaderboard(&self, limit: usize) -> Result<Vec<LeaderboardEntry>> {
        let rows = sqlx::query(&format!("{} ORDER BY p.created_at", PREDICTION_DETAIL_SELECT))
            .fetch_all(&self.pool)
            .await?;

        let mut by_wallet: HashMap<String, Vec<PredictionDetail>> = HashMap::new();
        for row in &rows {
            let detail = row_to_prediction_detail(row)?;
            by_wallet
                .entry(detail.prediction.user_wallet.clone())
                .or_default()
                .push(detail);
        }

        let mut entries: Vec<(String, UserStats)> = by_wallet
            .into_iter()
            .map(|(wallet, preds)| (wallet, UserStats::from_predictions(&preds)))
            .collect();
        entries.sort_by(|a, b| {
            b.1.total_earnings
                .cmp(&a.1.total_earnings)
                .then_with(|| a.0.cmp(&b.0))
        });

        Ok(entries
            .into_iter()
            .take(limit)
            .enumerate()
            .map(|(i, (wallet, stats))| LeaderboardEntry {
                rank: i + 1,
                wallet,
                markets_joined: stats.markets_joined,
                win_rate: stats.win_rate,
                total_earnings: stats.total_earnings,
                accuracy: stats.win_rate,
            })
            .collect())
    }

    // ==================== BADGES ====================

    /// Award a badge; returns the existing one if the wallet already has it
    pub async fn award_badge(
        &self,
        wallet: &str,
        badge_type: BadgeType,
        metadata: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Badge> {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO user_badges (id, user_wallet, badge_type, earned_at, metadata)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(wallet)
        .bind(badge_type.as_str())
        .bind(ts(now))
        .bind(metadata)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query("SELECT * FROM user_badges WHERE user_wallet = ? AND badge_type = ?")
            .bind(wallet)
            .bind(badge_type.as_str())
            .fetch_one(&self.pool)
            .await?;
        row_to_badge(&row)
    }

    pub async fn badges_for_wallet(&self, wallet: &str) -> Result<Vec<Badge>> {
        let rows = sqlx::query("SELECT * FROM user_badges WHERE user_wallet = ? ORDER BY earned_at")
            .bind(wallet)
            .fetch_all(&self.pool)
            .await?;

        // Unknown badge kinds from other builds are skipped
        Ok(rows.iter().filter_map(|r| row_to_badge(r).ok()).collect())
    }

    // ==================== PROPOSALS ====================

    pub async fn create_proposal(
        &self,
        proposer_wallet: &str,
        title: &str,
        description: &str,
        category: &str,
        tags: &[String],
        now: DateTime<Utc>,
    ) -> Result<Proposal> {
        let proposal = Proposal {
            id: Uuid::new_v4().to_string(),
            proposer_wallet: proposer_wallet.to_string(),
            title: title.to_string(),
            description: description.to_string(),
            category: category.to_string(),
            tags: tags.to_vec(),
            votes: 0,
            status: ProposalStatus::Proposed,
            market_id: None,
            created_at: now,
        };

        sqlx::query(
            r#"
            INSERT INTO market_proposals (id, proposer_wallet, title, description, category, tags, votes, status, created_at)
            VALUES (?, ?, ?, ?, ?, ?, 0, 'proposed', ?)
            "#,
        )
        .bind(&proposal.id)
        .bind(&proposal.proposer_wallet)
        .bind(&proposal.title)
        .bind(&proposal.description)
        .bind(&proposal.category)
        .bind(serde_json::to_string(&proposal.tags)?)
        .bind(ts(now))
        .execute(&self.pool)
        .await?;

        Ok(proposal)
    }

    /// Proposals by vote count, then newest
    pub async fn list_proposals(&self, status: Option<ProposalStatus>) -> Result<Vec<Proposal>> {
        let rows = match status {
            Some(s) => {
                sqlx::query(
                    "SELECT * FROM market_proposals WHERE status = ? ORDER BY votes DESC, created_at DESC",
                )
                .bind(s.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT * FROM market_proposals ORDER BY votes DESC, created_at DESC")
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        rows.iter().map(row_to_proposal).collect()
    }

    pub async fn get_proposal(&self, id: &str) -> Result<Option<Proposal>> {
        let row = sqlx::query("SELECT * FROM market_proposals WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_proposal).transpose()
    }

    /// Record one vote per wallet; returns the new vote count
    pub async fn vote_proposal(
        &self,
        proposal_id: &str,
        voter_wallet: &str,
        now: DateTime<Utc>,
    ) -> std::result::Result<i64, VoteError> {
        let mut tx = self.pool.begin().await?;

        let exists: Option<(String,)> = sqlx::query_as("SELECT id FROM market_proposals WHERE id = ?")
            .bind(proposal_id)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Err(VoteError::ProposalNotFound);
        }

        let inserted = sqlx::query(
            "INSERT INTO proposal_votes (id, proposal_id, voter_wallet, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(proposal_id)
        .bind(voter_wallet)
        .bind(ts(now))
        .execute(&mut *tx)
        .await;

        match inserted {
            Ok(_) => {}
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                return Err(VoteError::Duplicate);
            }
            Err(e) => return Err(e.into()),
        }

        let (votes,): (i64,) = sqlx::query_as(
            "UPDATE market_proposals SET votes = votes + 1 WHERE id = ? RETURNING votes",
        )
        .bind(proposal_id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(votes)
    }

    /// Withdraw a vote. The counter only moves if a vote row was removed and
    /// never drops below zero.
    pub async fn unvote_proposal(
        &self,
        proposal_id: &str,
        voter_wallet: &str,
    ) -> std::result::Result<i64, VoteError> {
        let mut tx = self.pool.begin().await?;

        let current: Option<(i64,)> = sqlx::query_as("SELECT votes FROM market_proposals WHERE id = ?")
            .bind(proposal_id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some((mut votes,)) = current else {
            return Err(VoteError::ProposalNotFound);
        };

        let deleted = sqlx::query("DELETE FROM proposal_votes WHERE proposal_id = ? AND voter_wallet = ?")
            .bind(proposal_id)
            .bind(voter_wallet)
            .execute(&mut *tx)
            .await?;

        if deleted.rows_affected() > 0 {
            let (updated,): (i64,) = sqlx::query_as(
                "UPDATE market_proposals SET votes = MAX(votes - 1, 0) WHERE id = ? RETURNING votes",
            )
            .bind(proposal_id)
            .fetch_one(&mut *tx)
            .await?;
            votes = updated;
        }

        tx.commit().await?;
        Ok(votes)
    }

    pub async fn has_voted(&self, proposal_id: &str, voter_wallet: &str) -> Result<bool> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT id FROM proposal_votes WHERE proposal_id = ? AND voter_wallet = ?",
        )
        .bind(proposal_id)
        .bind(voter_wallet)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    /// Turn a proposal into a market. Returns None if the proposal is
    /// missing or was already converted; the claim and the market insert
    /// commit together.
    pub async fn convert_proposal(
        &self,
        proposal_id: &str,
        creator_wallet: &str,
        end_date: DateTime<Utc>,
        option_labels: &[String],
        tx_hash: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<(Market, Proposal)>> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT * FROM market_proposals WHERE id = ? AND status = 'proposed'")
            .bind(proposal_id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let mut proposal = row_to_proposal(&row)?;

        let new = NewMarket {
            creator_wallet: creator_wallet.to_string(),
            title: proposal.title.clone(),
            description: proposal.description.clone(),
            category: proposal.category.clone(),
            tags: proposal.tags.clone(),
            end_date,
            tx_hash: tx_hash.map(str::to_string),
            resolution_method: Some("Community Vote".to_string()),
        };
        let market = insert_market(&mut tx, &new, option_labels, now).await?;

        let claimed = sqlx::query(
            "UPDATE market_proposals SET status = 'created', market_id = ? WHERE id = ? AND status = 'proposed'",
        )
        .bind(&market.id)
        .bind(proposal_id)
        .execute(&mut *tx)
        .await?;
        if claimed.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(None);
        }

        tx.commit().await?;

        proposal.status = ProposalStatus::Created;
        proposal.market_id = Some(market.id.clone());
        Ok(Some((market, proposal)))
    }

    // ==================== X CONNECTIONS ====================

    /// Link (or relink) a wallet to an X account
    #[allow(clippy::too_many_arguments)]
    pub async fn upsert_connection(
        &self,
        wallet: &str,
        x_user_id: &str,
        x_username: &str,
        x_display_name: Option<&str>,
        x_profile_image: Option<&str>,
        credential: &EncryptedCredential,
        token_expires_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<SocialConnection> {
        sqlx::query(
            r#"
            INSERT INTO x_connections (id, user_wallet, x_user_id, x_username, x_display_name, x_profile_image,
                                       credential_ciphertext, credential_salt, credential_nonce, token_expires_at, connected_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(user_wallet) DO UPDATE SET
                x_user_id = excluded.x_user_id,
                x_username = excluded.x_username,
                x_display_name = excluded.x_display_name,
                x_profile_image = excluded.x_profile_image,
                credential_ciphertext = excluded.credential_ciphertext,
                credential_salt = excluded.credential_salt,
                credential_nonce = excluded.credential_nonce,
                token_expires_at = excluded.token_expires_at,
                connected_at = excluded.connected_at
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(wallet)
        .bind(x_user_id)
        .bind(x_username)
        .bind(x_display_name)
        .bind(x_profile_image)
        .bind(&credential.ciphertext[..])
        .bind(&credential.salt[..])
        .bind(&credential.nonce[..])
        .bind(token_expires_at.map(ts))
        .bind(ts(now))
        .execute(&self.pool)
        .await?;

        self.get_connection(wallet)
            .await?
            .ok_or_else(|| anyhow!("Connection vanished after upsert"))
    }

    pub async fn get_connection(&self, wallet: &str) -> Result<Option<SocialConnection>> {
        let row = sqlx::query("SELECT * FROM x_connections WHERE user_wallet = ?")
            .bind(wallet)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(r) => {
                let connected_at: String = r.get("connected_at");
                Ok(Some(SocialConnection {
                    id: r.get("id"),
                    user_wallet: r.get("user_wallet"),
                    x_user_id: r.get("x_user_id"),
                    x_username: r.get("x_username"),
                    x_display_name: r.get("x_display_name"),
                    x_profile_image: r.get("x_profile_image"),
                    token_expires_at: parse_ts_opt(r.get("token_expires_at")),
                    connected_at: parse_ts(&connected_at)?,
                }))
            }
            None => Ok(None),
        }
    }

    /// Encrypted credential of a wallet's linked account
    pub async fn get_connection_credential(&self, wallet: &str) -> Result<Option<EncryptedCredential>> {
        let row: Option<(Vec<u8>, Vec<u8>, Vec<u8>)> = sqlx::query_as(
            "SELECT credential_ciphertext, credential_salt, credential_nonce FROM x_connections WHERE user_wallet = ?",
        )
        .bind(wallet)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(ciphertext, salt, nonce)| EncryptedCredential {
            ciphertext,
            salt,
            nonce,
        }))
    }

    pub async fn delete_connection(&self, wallet: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM x_connections WHERE user_wallet = ?")
            .bind(wallet)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // ==================== X TRACKING ====================

    pub async fn create_tracking(
        &self,
        market_id: &str,
        x_target_user_id: &str,
        x_target_username: &str,
        condition: &Condition,
        now: DateTime<Utc>,
    ) -> Result<TrackingRecord> {
        let record = TrackingRecord {
            id: Uuid::new_v4().to_string(),
            market_id: market_id.to_string(),
            x_target_user_id: x_target_user_id.to_string(),
            x_target_username: x_target_username.to_string(),
            condition: condition.clone(),
            last_checked_tweet_id: None,
            last_checked_at: None,
            monitoring_status: MonitoringStatus::Active,
            created_at: now,
            resolved_at: None,
            resolution_proof: None,
        };

        sqlx::query(
            r#"
            INSERT INTO x_market_tracking (id, market_id, x_target_user_id, x_target_username,
                                           condition_type, condition_params, monitoring_status, created_at)
            VALUES (?, ?, ?, ?, ?, ?, 'active', ?)
            "#,
        )
        .bind(&record.id)
        .bind(&record.market_id)
        .bind(&record.x_target_user_id)
        .bind(&record.x_target_username)
        .bind(condition.kind())
        .bind(condition.params_json())
        .bind(ts(now))
        .execute(&self.pool)
        .await?;

        Ok(record)
    }

    /// All tracking records still being monitored, oldest first
    pub async fn active_tracking_records(&self) -> Result<Vec<TrackingRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM x_market_tracking WHERE monitoring_status = 'active' ORDER BY created_at, rowid",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_tracking).collect()
    }

    pub async fn tracking_for_market(&self, market_id: &str) -> Result<Vec<TrackingRecord>> {
        let rows = sqlx::query("SELECT * FROM x_market_tracking WHERE market_id = ? ORDER BY created_at, rowid")
            .bind(market_id)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(row_to_tracking).collect()
    }

    /// Record a check; the cursor is only replaced when one is given
    pub async fn record_tracking_check(
        &self,
        tracking_id: &str,
        cursor: Option<&str>,
        checked_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE x_market_tracking
            SET last_checked_tweet_id = COALESCE(?, last_checked_tweet_id), last_checked_at = ?
            WHERE id = ?
            "#,
        )
        .bind(cursor)
        .bind(ts(checked_at))
        .bind(tracking_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ==================== SESSIONS ====================

    pub async fn create_session(
        &self,
        wallet_address: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Session> {
        let session = Session {
            id: Uuid::new_v4().to_string(),
            wallet_address: wallet_address.to_string(),
            created_at: now,
            expires_at: now + ttl,
        };

        sqlx::query(
            "INSERT INTO sessions (id, wallet_address, created_at, expires_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&session.id)
        .bind(&session.wallet_address)
        .bind(ts(session.created_at))
        .bind(ts(session.expires_at))
        .execute(&self.pool)
        .await?;

        Ok(session)
    }

    /// Look up a session; expired sessions are deleted and not returned
    pub async fn get_session(&self, session_id: &str, now: DateTime<Utc>) -> Result<Option<Session>> {
        let row = sqlx::query("SELECT * FROM sessions WHERE id = ?")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(r) => {
                let created_at: String = r.get("created_at");
                let expires_at: String = r.get("expires_at");
                let expires_at = parse_ts(&expires_at)?;

                if expires_at < now {
                    self.delete_session(session_id).await?;
                    return Ok(None);
                }

                Ok(Some(Session {
                    id: r.get("id"),
                    wallet_address: r.get("wallet_address"),
                    created_at: parse_ts(&created_at)?,
                    expires_at,
                }))
            }
            None => Ok(None),
        }
    }

    pub async fn delete_session(&self, session_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn cleanup_expired_sessions(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM sessions WHERE expires_at < ?")
            .bind(ts(now))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

const PREDICTION_DETAIL_SELECT: &str = r#"
    SELECT p.*, m.title AS market_title, m.status AS market_status, m.end_date AS market_end_date,
           m.winner_id AS market_winner_id, o.label AS option_label
    FROM predictions p
    JOIN markets m ON m.id = p.market_id
    JOIN market_options o ON o.id = p.option_id
"#;

async fn insert_market(
    conn: &mut SqliteConnection,
    new: &NewMarket,
    option_labels: &[String],
    now: DateTime<Utc>,
) -> Result<Market> {
    let market_id = Uuid::new_v4().to_string();

    sqlx::query(
        r#"
        INSERT INTO markets (id, creator_wallet, title, description, category, tags, status, end_date,
                             total_volume, participants, tx_hash, resolution_method, created_at, x_monitoring_status)
        VALUES (?, ?, ?, ?, ?, ?, 'active', ?, '0', 0, ?, ?, ?, 'inactive')
        "#,
    )
    .bind(&market_id)
    .bind(&new.creator_wallet)
    .bind(&new.title)
    .bind(&new.description)
    .bind(&new.category)
    .bind(serde_json::to_string(&new.tags)?)
    .bind(ts(new.end_date))
    .bind(&new.tx_hash)
    .bind(&new.resolution_method)
    .bind(ts(now))
    .execute(&mut *conn)
    .await?;

    let mut options = Vec::with_capacity(option_labels.len());
    for (position, label) in option_labels.iter().enumerate() {
        let option = MarketOption {
            id: Uuid::new_v4().to_string(),
            market_id: market_id.clone(),
            label: label.clone(),
            total_staked: Decimal::ZERO,
        };
        sqlx::query(
            "INSERT INTO market_options (id, market_id, position, label, total_staked) VALUES (?, ?, ?, ?, '0')",
        )
        .bind(&option.id)
        .bind(&market_id)
        .bind(position as i64)
        .bind(&option.label)
        .execute(&mut *conn)
        .await?;
        options.push(option);
    }

    Ok(Market {
        id: market_id,
        creator_wallet: new.creator_wallet.clone(),
        title: new.title.clone(),
        description: new.description.clone(),
        category: new.category.clone(),
        tags: new.tags.clone(),
        status: MarketStatus::Active,
        end_date: new.end_date,
        total_volume: Decimal::ZERO,
        participants: 0,
        winner_id: None,
        tx_hash: new.tx_hash.clone(),
        resolution_method: new.resolution_method.clone(),
        created_at: now,
        x_target_user_id: None,
        x_target_username: None,
        x_condition_type: None,
        x_monitoring_status: MonitoringStatus::Inactive,
        options,
    })
}

fn row_to_option(row: &SqliteRow) -> Result<MarketOption> {
    let staked: String = row.get("total_staked");
    Ok(MarketOption {
        id: row.get("id"),
        market_id: row.get("market_id"),
        label: row.get("label"),
        total_staked: parse_dec(&staked)?,
    })
}

fn row_to_market(row: &SqliteRow, options: Vec<MarketOption>) -> Result<Market> {
    let status: String = row.get("status");
    let end_date: String = row.get("end_date");
    let created_at: String = row.get("created_at");
    let total_volume: String = row.get("total_volume");
    let tags: String = row.get("tags");
    let monitoring: String = row.get("x_monitoring_status");

    Ok(Market {
        id: row.get("id"),
        creator_wallet: row.get("creator_wallet"),
        title: row.get("title"),
        description: row.get("description"),
        category: row.get("category"),
        tags: parse_tags(&tags),
        status: MarketStatus::parse(&status).ok_or_else(|| anyhow!("Unknown market status: {}", status))?,
        end_date: parse_ts(&end_date)?,
        total_volume: parse_dec(&total_volume)?,
        participants: row.get("participants"),
        winner_id: row.get("winner_id"),
        tx_hash: row.get("tx_hash"),
        resolution_method: row.try_get("resolution_method").unwrap_or(None),
        created_at: parse_ts(&created_at)?,
        x_target_user_id: row.get("x_target_user_id"),
        x_target_username: row.get("x_target_username"),
        x_condition_type: row.get("x_condition_type"),
        x_monitoring_status: MonitoringStatus::parse(&monitoring),
        options,
    })
}

fn row_to_prediction_detail(row: &SqliteRow) -> Result<PredictionDetail> {
    let amount: String = row.get("amount");
    let created_at: String = row.get("created_at");
    let market_status: String = row.get("market_status");
    let market_end_date: String = row.get("market_end_date");

    Ok(PredictionDetail {
        prediction: Prediction {
            id: row.get("id"),
            market_id: row.get("market_id"),
            user_wallet: row.get("user_wallet"),
            option_id: row.get("option_id"),
            amount: parse_dec(&amount)?,
            tx_hash: row.get("tx_hash"),
            created_at: parse_ts(&created_at)?,
        },
        market_title: row.get("market_title"),
        market_status: MarketStatus::parse(&market_status)
            .ok_or_else(|| anyhow!("Unknown market status: {}", market_status))?,
        market_end_date: parse_ts(&market_end_date)?,
        market_winner_id: row.get("market_winner_id"),
        option_label: row.get("option_label"),
    })
}

fn row_to_badge(row: &SqliteRow) -> Result<Badge> {
    let badge_type: String = row.get("badge_type");
    let earned_at: String = row.get("earned_at");
    Ok(Badge {
        id: row.get("id"),
        user_wallet: row.get("user_wallet"),
        badge_type: BadgeType::parse(&badge_type).ok_or_else(|| anyhow!("Unknown badge type: {}", badge_type))?,
        earned_at: parse_ts(&earned_at)?,
        metadata: row.get("metadata"),
    })
}

fn row_to_proposal(row: &SqliteRow) -> Result<Proposal> {
    let status: String = row.get("status");
    let tags: String = row.get("tags");
    let created_at: String = row.get("created_at");
    Ok(Proposal {
        id: row.get("id"),
        proposer_wallet: row.get("proposer_wallet"),
        title: row.get("title"),
        description: row.get("description"),
        category: row.get("category"),
        tags: parse_tags(&tags),
        votes: row.get("votes"),
        status: ProposalStatus::parse(&status).ok_or_else(|| anyhow!("Unknown proposal status: {}", status))?,
        market_id: row.get("market_id"),
        created_at: parse_ts(&created_at)?,
    })
}

fn row_to_tracking(row: &SqliteRow) -> Result<TrackingRecord> {
    let kind: String = row.get("condition_type");
    let params: Option<String> = row.try_get("condition_params").unwrap_or(None);
    let status: String = row.get("monitoring_status");
    let created_at: String = row.get("created_at");
    let proof: Option<String> = row.get("resolution_proof");

    Ok(TrackingRecord {
        id: row.get("id"),
        market_id: row.get("market_id"),
        x_target_user_id: row.get("x_target_user_id"),
        x_target_username: row.get("x_target_username"),
        condition: Condition::from_stored(&kind, params.as_deref()),
        last_checked_tweet_id: row.get("last_checked_tweet_id"),
        last_checked_at: parse_ts_opt(row.get("last_checked_at")),
        monitoring_status: MonitoringStatus::parse(&status),
        created_at: parse_ts(&created_at)?,
        resolved_at: parse_ts_opt(row.get("resolved_at")),
        resolution_proof: proof.and_then(|p| serde_json::from_str(&p).ok()),
    })
}
