//! Expiring key-value store
//!
//! Short-lived server-side state: OAuth `state` → PKCE verifier, and wallet
//! sign-in nonces. Entries are consumed at most once and vanish after their TTL.
//! The trait keeps the door open for an external cache in multi-process
//! deployments; the in-memory store is what the server uses today.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

#[async_trait]
pub trait ExpiringStore<V: Clone + Send + Sync + 'static>: Send + Sync {
    /// Insert or replace `key`, expiring `ttl` after `now`
    async fn put(&self, key: &str, value: V, ttl: Duration, now: DateTime<Utc>);

    /// Value of `key` if it has not expired at `now`, left in place
    async fn get(&self, key: &str, now: DateTime<Utc>) -> Option<V>;

    /// Remove and return `key` if it has not expired at `now`
    async fn take(&self, key: &str, now: DateTime<Utc>) -> Option<V>;

    /// Drop every entry expired at `now`; returns how many were removed
    async fn sweep(&self, now: DateTime<Utc>) -> usize;
}

struct Entry<V> {
    value: V,
    expires_at: DateTime<Utc>,
}

/// Thread-safe in-memory store
#[derive(Clone)]
pub struct MemoryStore<V> {
    name: &'static str,
    entries: Arc<RwLock<HashMap<String, Entry<V>>>>,
}

impl<V: Clone + Send + Sync + 'static> MemoryStore<V> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Sweep on a fixed interval for the life of the process
    pub async fn run_sweeper(self, interval: std::time::Duration) {
        info!("[{}] Sweeper started (interval: {:?})", self.name, interval);
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let removed = self.sweep(Utc::now()).await;
            if removed > 0 {
                debug!("[{}] Swept {} expired entries", self.name, removed);
            }
        }
    }
}

#[async_trait]
impl<V: Clone + Send + Sync + 'static> ExpiringStore<V> for MemoryStore<V> {
    async fn put(&self, key: &str, value: V, ttl: Duration, now: DateTime<Utc>) {
        let mut entries = self.entries.write().await;
        entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: now + ttl,
            },
        );
    }

    async fn get(&self, key: &str, now: DateTime<Utc>) -> Option<V> {
        let entries = self.entries.read().await;
        entries
            .get(key)
            .filter(|e| e.expires_at >= now)
            .map(|e| e.value.clone())
    }

    async fn take(&self, key: &str, now: DateTime<Utc>) -> Option<V> {
        let mut entries = self.entries.write().await;
        let entry = entries.remove(key)?;
        if entry.expires_at < now {
            debug!("[{}] Entry expired before use", self.name);
            return None;
        }
        Some(entry.value)
    }

    async fn sweep(&self, now: DateTime<Utc>) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| e.expires_at >= now);
        before - entries.len()
    }
}
