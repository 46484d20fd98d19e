//! In-memory cache with TTL
//!
//! Entries expire lazily: reads treat an expired entry as absent, and a
//! compaction sweep runs every `compaction_interval` operations to reclaim
//! memory. Between sweeps the map may hold expired entries.

use super::Cache;
use crate::config::deserialize_opt_duration;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};
use virta_core::{Error, Result};

/// Config fields accepted by the `memory` cache.
pub const CONFIG_FIELDS: &[&str] = &["default_ttl", "compaction_interval"];

/// Configuration for [`MemoryCache`].
#[derive(Debug, Clone, Deserialize, Default)]
pub struct MemoryCacheConfig {
    /// TTL applied when a write carries none. Absent means entries never
    /// expire.
    #[serde(default, deserialize_with = "deserialize_opt_duration")]
    pub default_ttl: Option<Duration>,
    /// Run a compaction sweep every N operations.
    #[serde(default = "default_compaction_interval")]
    pub compaction_interval: u32,
}

fn default_compaction_interval() -> u32 {
    1000
}

struct Entry {
    value: Bytes,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// In-memory TTL cache.
pub struct MemoryCache {
    entries: Mutex<HashMap<String, Entry>>,
    default_ttl: Option<Duration>,
    ops_since_compaction: AtomicU32,
    compaction_interval: u32,
}

impl MemoryCache {
    /// Create a cache from config.
    pub fn new(conf: MemoryCacheConfig) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            default_ttl: conf.default_ttl,
            ops_since_compaction: AtomicU32::new(0),
            compaction_interval: conf.compaction_interval.max(1),
        }
    }

    fn expiry(&self, ttl: Option<Duration>, now: Instant) -> Option<Instant> {
        ttl.or(self.default_ttl).map(|d| now + d)
    }

    fn maybe_compact(&self, now: Instant) {
        let ops = self.ops_since_compaction.fetch_add(1, Ordering::Relaxed);
        if ops >= self.compaction_interval
            && self
                .ops_since_compaction
                .compare_exchange(ops + 1, 0, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
        {
            self.entries.lock().retain(|_, e| !e.is_expired(now));
        }
    }

    /// Number of live entries (expired-but-unswept included).
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new(MemoryCacheConfig::default())
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Bytes> {
        let now = Instant::now();
        self.maybe_compact(now);
        let entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if !entry.is_expired(now) => Ok(entry.value.clone()),
            _ => Err(Error::KeyNotFound),
        }
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<()> {
        let now = Instant::now();
        self.maybe_compact(now);
        self.entries.lock().insert(
            key.to_string(),
            Entry {
                value,
                expires_at: self.expiry(ttl, now),
            },
        );
        Ok(())
    }

    async fn add(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<()> {
        let now = Instant::now();
        self.maybe_compact(now);
        let mut entries = self.entries.lock();
        if let Some(existing) = entries.get(key) {
            if !existing.is_expired(now) {
                return Err(Error::KeyAlreadyExists);
            }
        }
        entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: self.expiry(ttl, now),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().remove(key);
        Ok(())
    }
}
