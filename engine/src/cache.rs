//! Operation cache
//!
//! Process-wide store of operation results keyed by `(op, resolved args)`.
//! Reads share a read lock and bump atomic counters; inserts and evictions
//! take the write lock. Eviction is strict LRU on a logical access clock,
//! bounded by entry count and approximate byte size. Entries may expire
//! earlier through a TTL measured from insertion.

use crate::config::CacheConfig;
use chrono::{DateTime, Utc};
use directive_protocol::OperationKind;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

/// Deterministic cache key for an operation and its resolved arguments.
///
/// Object keys are sorted before hashing, so argument order never changes
/// the key.
pub fn cache_key(op: OperationKind, args: &Value) -> String {
    let mut canonical = String::new();
    write_canonical(args, &mut canonical);

    let mut hasher = Sha256::new();
    hasher.update(op.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(canonical.as_bytes());
    format!("{}:{:x}", op.as_str(), hasher.finalize())
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                if let Some(v) = map.get(*key) {
                    write_canonical(v, out);
                }
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

struct CacheEntry {
    value: Value,
    approx_size_bytes: usize,
    /// Logical clock value of the most recent access
    last_accessed: AtomicU64,
    hit_count: AtomicU64,
    inserted_at: Instant,
    inserted_at_utc: DateTime<Utc>,
}

/// Point-in-time view of one entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntryInfo {
    pub key: String,
    pub approx_size_bytes: usize,
    pub last_accessed: u64,
    pub hit_count: u64,
    pub inserted_at: DateTime<Utc>,
}

/// Cache counters since construction (or the last `clear`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub entries: usize,
    pub total_bytes: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, CacheEntry>,
    total_bytes: usize,
}

impl Inner {
    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.total_bytes = self.total_bytes.saturating_sub(entry.approx_size_bytes);
        Some(entry)
    }

    fn least_recently_used(&self) -> Option<String> {
        self.entries
            .iter()
            .min_by_key(|(_, e)| e.last_accessed.load(Ordering::Relaxed))
            .map(|(k, _)| k.clone())
    }
}

pub struct OperationCache {
    inner: RwLock<Inner>,
    max_entries: usize,
    max_bytes: Option<usize>,
    ttl: Option<Duration>,
    clock: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl OperationCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            max_entries: config.max_entries.max(1),
            max_bytes: config.max_bytes,
            ttl: config.ttl_secs.map(Duration::from_secs),
            clock: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    /// Entry-count bound only: no byte limit, no TTL.
    pub fn with_capacity(max_entries: usize) -> Self {
        Self::new(&CacheConfig {
            max_entries,
            max_bytes: None,
            ttl_secs: None,
        })
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn is_expired(&self, entry: &CacheEntry) -> bool {
        self.ttl
            .is_some_and(|ttl| entry.inserted_at.elapsed() >= ttl)
    }

    /// Look up a live entry, recording the access.
    pub async fn get(&self, key: &str) -> Option<Value> {
        {
            let inner = self.inner.read().await;
            match inner.entries.get(key) {
                None => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
                Some(entry) if !self.is_expired(entry) => {
                    entry.last_accessed.store(self.tick(), Ordering::Relaxed);
                    entry.hit_count.fetch_add(1, Ordering::Relaxed);
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(entry.value.clone());
                }
                Some(_) => {}
            }
        }

        let mut inner = self.inner.write().await;
        // Another writer may have replaced the entry between the two locks.
        if inner.entries.get(key).is_some_and(|e| self.is_expired(e)) {
            inner.remove(key);
            self.expirations.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(key, "cache entry expired");
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Insert or replace `key`, evicting least-recently-used entries as
    /// needed. Values larger than the byte limit are not cached.
    pub async fn insert(&self, key: impl Into<String>, value: Value) {
        let key = key.into();
        let approx_size_bytes = key.len() + approx_size(&value);
        if let Some(max) = self.max_bytes
            && approx_size_bytes > max
        {
            tracing::debug!(
                key = %key,
                approx_size_bytes,
                max_bytes = max,
                "value exceeds cache byte limit, not cached"
            );
            return;
        }

        let entry = CacheEntry {
            value,
            approx_size_bytes,
            last_accessed: AtomicU64::new(self.tick()),
            hit_count: AtomicU64::new(0),
            inserted_at: Instant::now(),
            inserted_at_utc: Utc::now(),
        };

        let mut inner = self.inner.write().await;
        inner.remove(&key);
        inner.total_bytes += approx_size_bytes;
        inner.entries.insert(key.clone(), entry);

        while inner.entries.len() > self.max_entries
            || self.max_bytes.is_some_and(|max| inner.total_bytes > max)
        {
            let Some(victim) = inner.least_recently_used() else {
                break;
            };
            inner.remove(&victim);
            self.evictions.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(key = %victim, "evicted least recently used cache entry");
        }
    }

    pub async fn contains_key(&self, key: &str) -> bool {
        let inner = self.inner.read().await;
        inner
            .entries
            .get(key)
            .is_some_and(|e| !self.is_expired(e))
    }

    /// Inspect an entry without counting an access.
    pub async fn peek(&self, key: &str) -> Option<CacheEntryInfo> {
        let inner = self.inner.read().await;
        inner.entries.get(key).map(|e| CacheEntryInfo {
            key: key.to_string(),
            approx_size_bytes: e.approx_size_bytes,
            last_accessed: e.last_accessed.load(Ordering::Relaxed),
            hit_count: e.hit_count.load(Ordering::Relaxed),
            inserted_at: e.inserted_at_utc,
        })
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn stats(&self) -> CacheStats {
        let inner = self.inner.read().await;
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            entries: inner.entries.len(),
            total_bytes: inner.total_bytes,
        }
    }

    /// Drop every entry and reset the counters.
    pub async fn clear(&self) {
        let mut inner = self.inner.write().await;
        *inner = Inner::default();
        for counter in [&self.hits, &self.misses, &self.evictions, &self.expirations] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

fn approx_size(value: &Value) -> usize {
    serde_json::to_vec(value).map(|v| v.len()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn key_ignores_argument_order() {
        let a = json!({ "name": "kubectl", "opts": { "x": 1, "y": [1, 2] } });
        let b = json!({ "opts": { "y": [1, 2], "x": 1 }, "name": "kubectl" });

        assert_eq!(
            cache_key(OperationKind::ProbeCapability, &a),
            cache_key(OperationKind::ProbeCapability, &b)
        );
    }

    #[test]
    fn key_depends_on_operation_kind() {
        let args = json!({ "name": "kubectl" });

        assert_ne!(
            cache_key(OperationKind::ProbeCapability, &args),
            cache_key(OperationKind::WebSearch, &args)
        );
        assert!(cache_key(OperationKind::ProbeCapability, &args).starts_with("probeCapability:"));
    }

    #[tokio::test]
    async fn hit_increments_counters() {
        let cache = OperationCache::with_capacity(4);
        cache.insert("k", json!(1)).await;

        assert_eq!(cache.get("k").await, Some(json!(1)));
        assert_eq!(cache.get("absent").await, None);

        let stats = cache.stats().await;
        assert_eq!((stats.hits, stats.misses), (1, 1));
        assert_eq!(stats.hit_rate(), 0.5);
        assert_eq!(cache.peek("k").await.map(|e| e.hit_count), Some(1));
    }

    #[tokio::test]
    async fn evicts_least_recently_accessed_entry() {
        let cache = OperationCache::with_capacity(2);
        cache.insert("a", json!("a")).await;
        cache.insert("b", json!("b")).await;
        // Touch "a" so "b" becomes the oldest.
        cache.get("a").await;

        cache.insert("c", json!("c")).await;

        assert!(cache.contains_key("a").await);
        assert!(!cache.contains_key("b").await);
        assert!(cache.contains_key("c").await);
        assert_eq!(cache.stats().await.evictions, 1);
    }

    #[tokio::test]
    async fn byte_limit_evicts_and_skips_oversized_values() {
        let cache = OperationCache::new(&CacheConfig {
            max_entries: 100,
            max_bytes: Some(30),
            ttl_secs: None,
        });
        cache.insert("a", json!("0123456789")).await;
        cache.insert("b", json!("0123456789")).await;
        cache.insert("c", json!("0123456789")).await;

        assert!(!cache.contains_key("a").await);
        assert!(cache.stats().await.total_bytes <= 30);

        cache.insert("huge", json!("x".repeat(100))).await;
        assert!(!cache.contains_key("huge").await);
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let cache = OperationCache::with_capacity(4).with_ttl(Duration::from_secs(10));
        cache.insert("k", json!(true)).await;

        tokio::time::advance(Duration::from_secs(11)).await;

        assert_eq!(cache.get("k").await, None);
        let stats = cache.stats().await;
        assert_eq!(stats.expirations, 1);
        assert_eq!(stats.entries, 0);
    }

    #[tokio::test]
    async fn replacing_a_key_keeps_byte_total_consistent() {
        let cache = OperationCache::with_capacity(4);
        cache.insert("k", json!("short")).await;
        cache.insert("k", json!("a much longer value")).await;

        let stats = cache.stats().await;
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.total_bytes, 1 + json!("a much longer value").to_string().len());
    }
}
