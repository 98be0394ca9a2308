//! X monitoring worker
//!
//! Polls the timelines of monitored accounts on a fixed period, evaluates
//! each active tracking record's condition against posts it has not seen,
//! and resolves the market when a condition is met. A rate-limit response
//! aborts the cycle and puts the whole worker in cooldown.

use super::conditions::evaluate;
use super::resolution::{apply_resolution, ResolutionOutcome};
use super::x_client::{PostPage, SocialReader};
use super::x_errors::XApiError;
use crate::config::MonitorConfig;
use crate::db::Database;
use crate::types::{compare_post_ids, is_newer_cursor, MarketEvent, Post, TrackingRecord};
use crate::wallet::CredentialVault;
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Timeline pages read per account per cycle
const MAX_PAGES: usize = 10;

/// Source of the current time
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// State carried from one cycle to the next
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerState {
    pub rate_limited_until: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_report: Option<CycleReport>,
}

/// Summary of one polling cycle
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleReport {
    pub started_at: Option<DateTime<Utc>>,
    pub records_checked: usize,
    pub markets_checked: usize,
    pub markets_skipped: usize,
    pub accounts_fetched: usize,
    pub fetch_errors: usize,
    pub resolved_markets: Vec<String>,
    pub rate_limited: bool,
}

/// What a tick did
#[derive(Debug, Clone)]
pub enum CycleOutcome {
    Completed(CycleReport),
    /// Still inside a rate-limit cooldown
    Cooldown { until: DateTime<Utc> },
    /// Another cycle holds the guard
    AlreadyRunning,
    Failed(String),
}

/// Snapshot served by the status endpoint
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorStatus {
    pub running: bool,
    pub poll_interval_seconds: u64,
    #[serde(flatten)]
    pub state: SchedulerState,
}

/// The polling worker
pub struct XMonitor {
    db: Arc<Database>,
    reader: Arc<dyn SocialReader>,
    vault: CredentialVault,
    clock: Arc<dyn Clock>,
    poll_interval: std::time::Duration,
    rate_limit_backoff: Duration,
    /// Doubles as the "already running" guard
    state: Mutex<SchedulerState>,
    /// Copy of `state` after the last tick, readable while a cycle runs
    snapshot: RwLock<SchedulerState>,
    events: Option<broadcast::Sender<MarketEvent>>,
}

impl XMonitor {
    pub fn new(
        db: Arc<Database>,
        reader: Arc<dyn SocialReader>,
        vault: CredentialVault,
        clock: Arc<dyn Clock>,
        config: &MonitorConfig,
    ) -> Self {
        Self {
            db,
            reader,
            vault,
            clock,
            poll_interval: std::time::Duration::from_secs(config.poll_interval_seconds),
            rate_limit_backoff: Duration::seconds(config.rate_limit_backoff_seconds as i64),
            state: Mutex::new(SchedulerState::default()),
            snapshot: RwLock::new(SchedulerState::default()),
            events: None,
        }
    }

    /// Broadcast resolutions to event subscribers
    pub fn with_events(mut self, events: broadcast::Sender<MarketEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub async fn status(&self) -> MonitorStatus {
        MonitorStatus {
            running: self.state.try_lock().is_err(),
            poll_interval_seconds: self.poll_interval.as_secs(),
            state: self.snapshot.read().await.clone(),
        }
    }

    /// Spawn the polling loop; the returned handle stops it
    pub fn spawn(self: Arc<Self>) -> MonitorHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let join = tokio::spawn(self.run(stop_rx));
        MonitorHandle { stop_tx, join }
    }

    /// Tick on the configured period until `stop` flips to true. A tick in
    /// progress always runs to completion.
    pub async fn run(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        info!("X monitor started (interval: {:?})", self.poll_interval);

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
        }

        info!("X monitor stopped");
    }

    /// Run one cycle unless one is already running or the worker is cooling
    /// down after a rate limit.
    pub async fn tick(&self) -> CycleOutcome {
        let Ok(mut state) = self.state.try_lock() else {
            info!("X monitor cycle already running, skipping");
            return CycleOutcome::AlreadyRunning;
        };

        let now = self.clock.now();
        if let Some(until) = state.rate_limited_until {
            if now <= until {
                debug!("X monitor rate limited until {}, skipping cycle", until);
                return CycleOutcome::Cooldown { until };
            }
            state.rate_limited_until = None;
        }

        let outcome = match self.run_cycle(&mut state, now).await {
            Ok(report) => CycleOutcome::Completed(report),
            Err(e) => {
                error!("X monitor cycle failed: {}", e);
                CycleOutcome::Failed(e.to_string())
            }
        };

        *self.snapshot.write().await = state.clone();
        outcome
    }

    /// One pass over every active tracking record
    pub async fn run_cycle(&self, state: &mut SchedulerState, now: DateTime<Utc>) -> Result<CycleReport> {
        let mut report = CycleReport {
            started_at: Some(now),
            ..Default::default()
        };

        let records = self.db.active_tracking_records().await?;
        report.records_checked = records.len();

        if records.is_empty() {
            debug!("No active tracking records");
        } else {
            info!("Checking {} active tracking record(s)", records.len());

            for (market_id, market_records) in group_by(records, |r| r.market_id.clone()) {
                match self.check_market(&market_id, market_records, now, &mut report).await {
                    Ok(MarketCheck::Continue) => {}
                    Ok(MarketCheck::RateLimited { reset_at }) => {
                        let until = now + self.rate_limit_backoff;
                        warn!(
                            "X API rate limited (reset: {:?}); pausing monitor until {}",
                            reset_at, until
                        );
                        state.rate_limited_until = Some(until);
                        report.rate_limited = true;
                        break;
                    }
                    Err(e) => {
                        warn!("Failed to check market {}: {}", market_id, e);
                    }
                }
            }
        }

        info!(
            "X monitor cycle done: {} market(s) checked, {} skipped, {} fetch(es), {} error(s), {} resolved",
            report.markets_checked,
            report.markets_skipped,
            report.accounts_fetched,
            report.fetch_errors,
            report.resolved_markets.len()
        );

        state.last_run_at = Some(now);
        state.last_report = Some(report.clone());
        Ok(report)
    }

    async fn check_market(
        &self,
        market_id: &str,
        records: Vec<TrackingRecord>,
        now: DateTime<Utc>,
        report: &mut CycleReport,
    ) -> Result<MarketCheck> {
        let Some(market) = self.db.get_market(market_id).await? else {
            warn!("Tracking records point at missing market {}", market_id);
            report.markets_skipped += 1;
            return Ok(MarketCheck::Continue);
        };

        if !market.is_active() || market.is_expired(now) {
            debug!("Market {} is resolved or past its end date, skipping", market.id);
            report.markets_skipped += 1;
            return Ok(MarketCheck::Continue);
        }

        let Some(sealed) = self.db.get_connection_credential(&market.creator_wallet).await? else {
            info!("Creator of market {} has no linked X account, skipping", market.id);
            report.markets_skipped += 1;
            return Ok(MarketCheck::Continue);
        };
        let token = self.vault.open(&sealed)?.access_token;

        report.markets_checked += 1;

        for (account_id, account_records) in group_by(records, |r| r.x_target_user_id.clone()) {
            let since = oldest_cursor(&account_records);

            let page = match self.read_timeline(&account_id, since.as_deref(), &token).await {
                Ok(page) => page,
                Err(XApiError::RateLimited { reset_at }) => {
                    return Ok(MarketCheck::RateLimited { reset_at });
                }
                Err(e) => {
                    warn!("Failed to fetch posts for account {}: {}", account_id, e);
                    report.fetch_errors += 1;
                    continue;
                }
            };
            report.accounts_fetched += 1;

            let newest = page
                .newest_cursor
                .clone()
                .or_else(|| newest_post_id(&page.posts));

            let mut resolved = false;
            for record in &account_records {
                let unseen = unseen_posts(record, &page.posts);
                if unseen.is_empty() {
                    continue;
                }

                let evaluation = evaluate(&market, record, &unseen);
                let Some(proof) = evaluation.proof.filter(|_| evaluation.condition_met) else {
                    continue;
                };

                match apply_resolution(&self.db, &market, &proof, now).await? {
                    ResolutionOutcome::Resolved { winner_id } => {
                        report.resolved_markets.push(market.id.clone());
                        if let Some(events) = &self.events {
                            let _ = events.send(MarketEvent::MarketResolved {
                                market_id: market.id.clone(),
                                winner_id,
                                automatic: true,
                            });
                        }
                        resolved = true;
                        break;
                    }
                    ResolutionOutcome::AlreadyResolved => {
                        resolved = true;
                        break;
                    }
                    ResolutionOutcome::NoAffirmativeOption => {}
                }
            }

            // Cursors move forward whatever the outcome
            for record in &account_records {
                let cursor = newest
                    .as_deref()
                    .filter(|c| is_newer_cursor(c, record.last_checked_tweet_id.as_deref()));
                self.db.record_tracking_check(&record.id, cursor, now).await?;
            }

            if resolved {
                break;
            }
        }

        Ok(MarketCheck::Continue)
    }
}

impl XMonitor {
    /// Every page of posts newer than `since`, up to `MAX_PAGES`. The cursor
    /// comes from the first (newest) page.
    async fn read_timeline(
        &self,
        account_id: &str,
        since: Option<&str>,
        token: &str,
    ) -> std::result::Result<PostPage, XApiError> {
        let mut page = self
            .reader
            .list_recent_posts(account_id, since, None, token)
            .await?;

        let mut pages = 1;
        while let Some(next) = page.next_token.take() {
            if pages == MAX_PAGES {
                warn!(
                    "Account {} has more than {} pages of new posts; older ones are skipped",
                    account_id, MAX_PAGES
                );
                break;
            }
            let older = self
                .reader
                .list_recent_posts(account_id, since, Some(&next), token)
                .await?;
            page.posts.extend(older.posts);
            page.next_token = older.next_token;
            pages += 1;
        }

        if pages > 1 {
            debug!("Read {} pages ({} posts) for account {}", pages, page.posts.len(), account_id);
        }
        Ok(page)
    }
}

enum MarketCheck {
    Continue,
    RateLimited { reset_at: Option<DateTime<Utc>> },
}

/// Stops a spawned monitor
pub struct MonitorHandle {
    stop_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl MonitorHandle {
    /// Prevent further ticks and wait for the loop to exit
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        if let Err(e) = self.join.await {
            error!("X monitor task ended abnormally: {}", e);
        }
    }
}

/// Group items by key, keeping first-seen key order
fn group_by<T, K: PartialEq>(items: Vec<T>, key: impl Fn(&T) -> K) -> Vec<(K, Vec<T>)> {
    let mut groups: Vec<(K, Vec<T>)> = Vec::new();
    for item in items {
        let k = key(&item);
        match groups.iter_mut().find(|(g, _)| *g == k) {
            Some((_, members)) => members.push(item),
            None => groups.push((k, vec![item])),
        }
    }
    groups
}

/// Cursor to read from for a set of records on the same account: the oldest
/// one, or none if any record has never been checked.
fn oldest_cursor(records: &[TrackingRecord]) -> Option<String> {
    let mut oldest: Option<&str> = None;
    for record in records {
        let cursor = record.last_checked_tweet_id.as_deref()?;
        oldest = match oldest {
            Some(cur) if compare_post_ids(cur, cursor).is_le() => Some(cur),
            _ => Some(cursor),
        };
    }
    oldest.map(str::to_string)
}

fn newest_post_id(posts: &[Post]) -> Option<String> {
    posts
        .iter()
        .max_by(|a, b| compare_post_ids(&a.id, &b.id))
        .map(|p| p.id.clone())
}

/// Posts this record has not evaluated yet. Without a cursor, posts that
/// predate the record are ignored.
fn unseen_posts(record: &TrackingRecord, posts: &[Post]) -> Vec<Post> {
    posts
        .iter()
        .filter(|p| match record.last_checked_tweet_id.as_deref() {
            Some(cursor) => is_newer_cursor(&p.id, Some(cursor)),
            None => p.created_at.map_or(true, |at| at >= record.created_at),
        })
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::conditions::Condition;
    use crate::types::{MarketStatus, MonitoringStatus, NewMarket};
    use crate::wallet::XTokens;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    struct ManualClock(StdMutex<DateTime<Utc>>);

    impl ManualClock {
        fn new(at: DateTime<Utc>) -> Self {
            Self(StdMutex::new(at))
        }

        fn advance(&self, by: Duration) {
            let mut now = self.0.lock().unwrap();
            *now = *now + by;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.0.lock().unwrap()
        }
    }

    #[derive(Default)]
    struct FakeReader {
        timelines: StdMutex<HashMap<String, Vec<Post>>>,
        rate_limited: AtomicBool,
        /// Return every post even if it is older than `since`
        ignore_since: AtomicBool,
        failing: StdMutex<Vec<String>>,
        calls: AtomicUsize,
        sinces: StdMutex<Vec<Option<String>>>,
        /// Posts per page; 0 returns everything in one page
        page_size: AtomicUsize,
    }

    impl FakeReader {
        fn post(&self, account: &str, id: &str, text: &str, at: DateTime<Utc>) {
            self.timelines
                .lock()
                .unwrap()
                .entry(account.to_string())
                .or_default()
                .push(Post {
                    id: id.to_string(),
                    text: text.to_string(),
                    created_at: Some(at),
                    author_id: Some(account.to_string()),
                });
        }
    }

    #[async_trait]
    impl SocialReader for FakeReader {
        async fn list_recent_posts(
            &self,
            account_id: &str,
            since: Option<&str>,
            page_token: Option<&str>,
            credential: &str,
        ) -> Result<PostPage, XApiError> {
            assert_eq!(credential, "creator-token");
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.sinces.lock().unwrap().push(since.map(str::to_string));

            if self.rate_limited.load(Ordering::SeqCst) {
                return Err(XApiError::RateLimited { reset_at: None });
            }
            if self.failing.lock().unwrap().iter().any(|a| a == account_id) {
                return Err(XApiError::Network("connection reset".to_string()));
            }

            let ignore_since = self.ignore_since.load(Ordering::SeqCst);
            let mut posts: Vec<Post> = self
                .timelines
                .lock()
                .unwrap()
                .get(account_id)
                .cloned()
                .unwrap_or_default()
                .into_iter()
                .filter(|p| ignore_since || is_newer_cursor(&p.id, since))
                .collect();
            posts.sort_by(|a, b| compare_post_ids(&b.id, &a.id));

            let offset: usize = page_token.map_or(0, |t| t.parse().unwrap());
            let size = match self.page_size.load(Ordering::SeqCst) {
                0 => posts.len(),
                n => n,
            };
            let posts: Vec<Post> = posts.into_iter().skip(offset).collect();
            let next_token = (posts.len() > size).then(|| (offset + size).to_string());
            let posts: Vec<Post> = posts.into_iter().take(size).collect();
            let newest_cursor = posts.first().map(|p| p.id.clone());

            Ok(PostPage {
                posts,
                newest_cursor,
                next_token,
            })
        }

        async fn resolve_username(
            &self,
            _username: &str,
            _credential: &str,
        ) -> Result<Option<String>, XApiError> {
            Ok(None)
        }
    }

    struct Harness {
        db: Arc<Database>,
        reader: Arc<FakeReader>,
        clock: Arc<ManualClock>,
        monitor: XMonitor,
    }

    async fn harness() -> Harness {
        let db = Arc::new(Database::in_memory().await.unwrap());
        let reader = Arc::new(FakeReader::default());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let vault = CredentialVault::new("test-secret");

        let sealed = vault
            .seal(&XTokens {
                access_token: "creator-token".to_string(),
                refresh_token: None,
            })
            .unwrap();
        db.upsert_connection("0xcreator", "7", "creator", None, None, &sealed, None, clock.now())
            .await
            .unwrap();

        let monitor = XMonitor::new(
            db.clone(),
            reader.clone(),
            vault,
            clock.clone(),
            &MonitorConfig::default(),
        );

        Harness {
            db,
            reader,
            clock,
            monitor,
        }
    }

    async fn tracked_market(h: &Harness, creator: &str, accounts: &[(&str, Condition)]) -> String {
        let now = h.clock.now();
        let new = NewMarket {
            creator_wallet: creator.to_string(),
            title: "Will @alice tweet this week?".to_string(),
            description: String::new(),
            category: "Community".to_string(),
            tags: vec![],
            end_date: now + Duration::days(7),
            tx_hash: None,
            resolution_method: None,
        };
        let market = h
            .db
            .create_market(&new, &["Yes".to_string(), "No".to_string()], now)
            .await
            .unwrap();
        for (account, condition) in accounts {
            h.db.create_tracking(&market.id, account, account, condition, now)
                .await
                .unwrap();
        }
        market.id
    }

    fn completed(outcome: CycleOutcome) -> CycleReport {
        match outcome {
            CycleOutcome::Completed(report) => report,
            other => panic!("expected a completed cycle, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_tweet_resolves_market_end_to_end() {
        let h = harness().await;
        let market_id = tracked_market(&h, "0xcreator", &[("alice", Condition::TweetPosted)]).await;

        let market = h.db.get_market(&market_id).await.unwrap().unwrap();
        assert_eq!(market.percentages(), vec![0, 0]);

        let now = h.clock.now();
        h.db.place_prediction(&market_id, "0x1", &market.options[0].id, dec!(1.0), None, now)
            .await
            .unwrap();
        h.db.place_prediction(&market_id, "0x2", &market.options[1].id, dec!(1.0), None, now)
            .await
            .unwrap();
        let market = h.db.get_market(&market_id).await.unwrap().unwrap();
        assert_eq!(market.percentages(), vec![50, 50]);

        // Nothing posted yet
        let report = completed(h.monitor.tick().await);
        assert!(report.resolved_markets.is_empty());

        h.clock.advance(Duration::minutes(5));
        h.reader.post("alice", "1000", "good morning", h.clock.now());
        let report = completed(h.monitor.tick().await);
        assert_eq!(report.resolved_markets, vec![market_id.clone()]);

        let resolved = h.db.get_market(&market_id).await.unwrap().unwrap();
        assert_eq!(resolved.status, MarketStatus::Resolved);
        assert_eq!(resolved.winner_id.as_deref(), Some(market.options[0].id.as_str()));
        let records = h.db.tracking_for_market(&market_id).await.unwrap();
        assert_eq!(records[0].monitoring_status, MonitoringStatus::Resolved);
        assert_eq!(records[0].resolution_proof.as_ref().unwrap().tweet_id, "1000");
        assert_eq!(records[0].last_checked_tweet_id.as_deref(), Some("1000"));

        // Same post again: nothing left to check, nothing changes
        h.reader.ignore_since.store(true, Ordering::SeqCst);
        h.clock.advance(Duration::minutes(5));
        let report = completed(h.monitor.tick().await);
        assert_eq!(report.records_checked, 0);
        let after = h.db.get_market(&market_id).await.unwrap().unwrap();
        assert_eq!(after.winner_id, resolved.winner_id);
        assert_eq!(after.total_volume, resolved.total_volume);
        assert_eq!(after.participants, resolved.participants);
    }

    #[tokio::test]
    async fn test_seen_posts_never_retrigger() {
        let h = harness().await;
        let keyword = Condition::KeywordPosted {
            keyword: "launch".to_string(),
        };
        let market_id = tracked_market(&h, "0xcreator", &[("alice", keyword)]).await;

        h.clock.advance(Duration::minutes(1));
        h.reader.post("alice", "2000", "just coffee", h.clock.now());
        completed(h.monitor.tick().await);
        let records = h.db.tracking_for_market(&market_id).await.unwrap();
        assert_eq!(records[0].last_checked_tweet_id.as_deref(), Some("2000"));

        // The reader replays old posts; the record must not re-evaluate them
        h.reader.ignore_since.store(true, Ordering::SeqCst);
        h.clock.advance(Duration::minutes(5));
        let report = completed(h.monitor.tick().await);
        assert!(report.resolved_markets.is_empty());
        assert_eq!(h.reader.sinces.lock().unwrap().last().unwrap().as_deref(), Some("2000"));

        h.reader.post("alice", "2001", "LAUNCH day!", h.clock.now());
        let report = completed(h.monitor.tick().await);
        assert_eq!(report.resolved_markets, vec![market_id]);
    }

    #[tokio::test]
    async fn test_keyword_found_on_older_page() {
        let h = harness().await;
        h.reader.page_size.store(10, Ordering::SeqCst);
        let keyword = Condition::KeywordPosted {
            keyword: "launch".to_string(),
        };
        let market_id = tracked_market(&h, "0xcreator", &[("alice", keyword)]).await;

        h.clock.advance(Duration::minutes(1));
        h.reader.post("alice", "100", "warming up", h.clock.now());
        completed(h.monitor.tick().await);

        // Fifteen new posts span two pages; the match sits on the older one
        h.clock.advance(Duration::minutes(5));
        for id in 101..=115 {
            let text = if id == 103 { "launch is live" } else { "filler" };
            h.reader.post("alice", &id.to_string(), text, h.clock.now());
        }
        let calls_before = h.reader.calls.load(Ordering::SeqCst);
        let report = completed(h.monitor.tick().await);

        assert_eq!(h.reader.calls.load(Ordering::SeqCst) - calls_before, 2);
        assert_eq!(report.resolved_markets, vec![market_id.clone()]);
        let records = h.db.tracking_for_market(&market_id).await.unwrap();
        assert_eq!(records[0].resolution_proof.as_ref().unwrap().tweet_id, "103");
        assert_eq!(records[0].last_checked_tweet_id.as_deref(), Some("115"));
    }

    #[tokio::test]
    async fn test_page_reads_are_bounded() {
        let h = harness().await;
        h.reader.page_size.store(1, Ordering::SeqCst);
        let keyword = Condition::KeywordPosted {
            keyword: "never".to_string(),
        };
        tracked_market(&h, "0xcreator", &[("alice", keyword)]).await;

        h.clock.advance(Duration::minutes(1));
        for id in 1..=(MAX_PAGES + 5) {
            h.reader.post("alice", &id.to_string(), "filler", h.clock.now());
        }
        let report = completed(h.monitor.tick().await);
        assert_eq!(report.accounts_fetched, 1);
        assert_eq!(h.reader.calls.load(Ordering::SeqCst), MAX_PAGES);
    }

    #[tokio::test]
    async fn test_cursor_never_moves_backward() {
        let h = harness().await;
        let keyword = Condition::KeywordPosted {
            keyword: "never".to_string(),
        };
        let market_id = tracked_market(&h, "0xcreator", &[("alice", keyword)]).await;

        h.clock.advance(Duration::minutes(1));
        h.reader.post("alice", "900", "first", h.clock.now());
        completed(h.monitor.tick().await);

        // A replayed page whose newest id is older than the cursor
        h.reader.timelines.lock().unwrap().insert(
            "alice".to_string(),
            vec![Post {
                id: "899".to_string(),
                text: "older".to_string(),
                created_at: Some(h.clock.now()),
                author_id: None,
            }],
        );
        h.reader.ignore_since.store(true, Ordering::SeqCst);
        completed(h.monitor.tick().await);

        let records = h.db.tracking_for_market(&market_id).await.unwrap();
        assert_eq!(records[0].last_checked_tweet_id.as_deref(), Some("900"));
    }

    #[tokio::test]
    async fn test_posts_before_registration_are_ignored() {
        let h = harness().await;
        let before = h.clock.now() - Duration::hours(1);
        h.reader.post("alice", "10", "old news", before);

        let market_id = tracked_market(&h, "0xcreator", &[("alice", Condition::TweetPosted)]).await;
        let report = completed(h.monitor.tick().await);
        assert!(report.resolved_markets.is_empty());

        // The old post still sets the cursor
        let records = h.db.tracking_for_market(&market_id).await.unwrap();
        assert_eq!(records[0].last_checked_tweet_id.as_deref(), Some("10"));
    }

    #[tokio::test]
    async fn test_rate_limit_skips_three_ticks() {
        let h = harness().await;
        tracked_market(&h, "0xcreator", &[("alice", Condition::TweetPosted)]).await;
        tracked_market(&h, "0xcreator", &[("bob", Condition::TweetPosted)]).await;

        h.reader.rate_limited.store(true, Ordering::SeqCst);
        let report = completed(h.monitor.tick().await);
        assert!(report.rate_limited);
        // The second market is never fetched
        assert_eq!(h.reader.calls.load(Ordering::SeqCst), 1);

        h.reader.rate_limited.store(false, Ordering::SeqCst);
        for _ in 0..3 {
            h.clock.advance(Duration::minutes(5));
            assert!(matches!(h.monitor.tick().await, CycleOutcome::Cooldown { .. }));
        }
        assert_eq!(h.reader.calls.load(Ordering::SeqCst), 1);

        h.clock.advance(Duration::minutes(5));
        let report = completed(h.monitor.tick().await);
        assert!(!report.rate_limited);
        assert_eq!(h.reader.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fetch_error_skips_only_that_account() {
        let h = harness().await;
        let market_id = tracked_market(
            &h,
            "0xcreator",
            &[("alice", Condition::TweetPosted), ("bob", Condition::TweetPosted)],
        )
        .await;
        h.reader.failing.lock().unwrap().push("alice".to_string());

        h.clock.advance(Duration::minutes(1));
        h.reader.post("bob", "77", "hi", h.clock.now());
        let report = completed(h.monitor.tick().await);
        assert_eq!(report.fetch_errors, 1);
        assert_eq!(report.resolved_markets, vec![market_id.clone()]);

        // Every record of the market is frozen, including the one whose fetch failed
        let records = h.db.tracking_for_market(&market_id).await.unwrap();
        assert!(records
            .iter()
            .all(|r| r.monitoring_status == MonitoringStatus::Resolved));
    }

    #[tokio::test]
    async fn test_skips_expired_and_unlinked_markets() {
        let h = harness().await;
        let unlinked = tracked_market(&h, "0xstranger", &[("alice", Condition::TweetPosted)]).await;
        h.reader.post("alice", "5", "hello", h.clock.now() + Duration::minutes(1));

        // Past every market's end date
        h.clock.advance(Duration::days(8));
        let report = completed(h.monitor.tick().await);
        assert_eq!(report.markets_skipped, 1);
        assert_eq!(h.reader.calls.load(Ordering::SeqCst), 0);
        assert!(h.db.get_market(&unlinked).await.unwrap().unwrap().is_active());
    }

    #[tokio::test]
    async fn test_already_running_guard() {
        let h = harness().await;
        let _held = h.monitor.state.try_lock().unwrap();
        assert!(matches!(h.monitor.tick().await, CycleOutcome::AlreadyRunning));
        assert!(h.monitor.status().await.running);
    }

    #[tokio::test]
    async fn test_resolution_is_broadcast() {
        let h = harness().await;
        let (tx, mut rx) = broadcast::channel(8);
        let monitor = XMonitor::new(
            h.db.clone(),
            h.reader.clone(),
            CredentialVault::new("test-secret"),
            h.clock.clone(),
            &MonitorConfig::default(),
        )
        .with_events(tx);
        let market_id = tracked_market(&h, "0xcreator", &[("alice", Condition::TweetPosted)]).await;

        h.reader.post("alice", "1", "gm", h.clock.now() + Duration::seconds(1));
        completed(monitor.tick().await);

        match rx.try_recv().unwrap() {
            MarketEvent::MarketResolved {
                market_id: id,
                automatic,
                ..
            } => {
                assert_eq!(id, market_id);
                assert!(automatic);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stop_handle() {
        let h = harness().await;
        let monitor = Arc::new(h.monitor);
        let handle = monitor.clone().spawn();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        handle.stop().await;
        assert!(monitor.status().await.state.last_run_at.is_some());
    }

    #[test]
    fn test_oldest_cursor() {
        let now = Utc::now();
        let record = |cursor: Option<&str>| TrackingRecord {
            id: "t".to_string(),
            market_id: "m".to_string(),
            x_target_user_id: "a".to_string(),
            x_target_username: "a".to_string(),
            condition: Condition::TweetPosted,
            last_checked_tweet_id: cursor.map(str::to_string),
            last_checked_at: None,
            monitoring_status: MonitoringStatus::Active,
            created_at: now,
            resolved_at: None,
            resolution_proof: None,
        };

        assert_eq!(
            oldest_cursor(&[record(Some("30")), record(Some("100")), record(Some("9"))]),
            Some("9".to_string())
        );
        assert_eq!(oldest_cursor(&[record(Some("30")), record(None)]), None);
    }
}
