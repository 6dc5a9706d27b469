/// Shared key-value capability with per-key TTL
///
/// The coordinator keeps all ephemeral run state behind this trait so the
/// backing product can be swapped (an external cache in a multi-instance
/// deployment, the in-memory store for a single process and tests).

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::{sync::RwLock, task::JoinHandle};

/// Longest TTL an entry is kept for; larger requests are clamped
pub const MAX_TTL: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

fn expiry(now: Instant, ttl: Duration) -> Instant {
    now + ttl.min(MAX_TTL)
}

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Overwrite a value and reset its TTL
    async fn set(&self, key: &str, value: Value, ttl: Duration) -> Result<()>;

    /// Append to a list value, creating it if absent, and refresh its TTL
    async fn push(&self, key: &str, values: Vec<Value>, ttl: Duration) -> Result<()>;

    /// Full contents of a list value; empty when absent
    async fn range(&self, key: &str) -> Result<Vec<Value>>;

    /// Delete keys, returning how many existed
    async fn delete(&self, keys: &[String]) -> Result<usize>;

    /// Drop every expired entry, returning how many were removed
    async fn purge_expired(&self) -> Result<usize>;
}

#[derive(Debug, Clone)]
enum Slot {
    Value(Value),
    List(Vec<Value>),
}

#[derive(Debug, Clone)]
struct Entry {
    slot: Slot,
    expires_at: Instant,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// Process-local store; expired entries are invisible immediately and
/// physically removed by `purge_expired`
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    entries: RwLock<HashMap<String, Entry>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .read()
            .await
            .values()
            .filter(|e| e.is_live(now))
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl KeyValueStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let entries = self.entries.read().await;
        match entries.get(key) {
            Some(entry) if entry.is_live(Instant::now()) => match &entry.slot {
                Slot::Value(value) => Ok(Some(value.clone())),
                Slot::List(_) => bail!("Key '{}' holds a list, not a value", key),
            },
            _ => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Value, ttl: Duration) -> Result<()> {
        self.entries.write().await.insert(
            key.to_string(),
            Entry {
                slot: Slot::Value(value),
                expires_at: expiry(Instant::now(), ttl),
            },
        );
        Ok(())
    }

    async fn push(&self, key: &str, values: Vec<Value>, ttl: Duration) -> Result<()> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;

        match entries.get_mut(key) {
            Some(entry) if entry.is_live(now) => match &mut entry.slot {
                Slot::List(list) => {
                    list.extend(values);
                    entry.expires_at = expiry(now, ttl);
                }
                Slot::Value(_) => bail!("Key '{}' holds a value, not a list", key),
            },
            _ => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        slot: Slot::List(values),
                        expires_at: expiry(now, ttl),
                    },
                );
            }
        }

        Ok(())
    }

    async fn range(&self, key: &str) -> Result<Vec<Value>> {
        let entries = self.entries.read().await;
        match entries.get(key) {
            Some(entry) if entry.is_live(Instant::now()) => match &entry.slot {
                Slot::List(list) => Ok(list.clone()),
                Slot::Value(_) => bail!("Key '{}' holds a value, not a list", key),
            },
            _ => Ok(Vec::new()),
        }
    }

    async fn delete(&self, keys: &[String]) -> Result<usize> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        Ok(keys
            .iter()
            .filter_map(|k| entries.remove(k))
            .filter(|e| e.is_live(now))
            .count())
    }

    async fn purge_expired(&self) -> Result<usize> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| e.is_live(now));
        Ok(before - entries.len())
    }
}

/// Periodically purge expired keys until the task is aborted
pub fn spawn_sweeper(store: Arc<dyn KeyValueStore>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        // First tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;
            match store.purge_expired().await {
                Ok(0) => {}
                Ok(n) => tracing::debug!("🧹 Purged {} expired state keys", n),
                Err(e) => tracing::warn!("⚠️ State sweep failed: {}", e),
            }
        }
    })
}
