//! Per-tool result cache with TTL expiry and least-used eviction.
//!
//! Entries are keyed by `(tool, key)` and are never mutated in place: only a
//! new `set` refreshes an entry. An entry older than the tool's TTL is never
//! returned; it is dropped on access or by the periodic sweep.
//!
//! ## Eviction
//!
//! When a new key would push a tool past `max_size`, the entry with the
//! lowest `access_count` is removed first. Ties go to the entry touched
//! longest ago, ordered by a monotonic access sequence rather than a clock
//! reading so equal timestamps cannot tie.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    future::Future,
    sync::Arc,
};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::{
    sync::watch,
    time::{interval, Instant},
};
use tracing::{debug, info};

use crate::{
    core::config::{CacheSettings, ToolCacheLimits, ToolConfig},
    error::{ResourceError, ResourceResult},
    executor::Dependencies,
    gate::{ensure_enabled, flags},
};

struct CacheEntry {
    data: Value,
    timestamp: Instant,
    /// Approximate footprint: serialized length x 2
    size: usize,
    access_count: u64,
    last_access: u64,
}

#[derive(Debug, Default, Clone, Copy)]
struct CacheCounters {
    hits: u64,
    misses: u64,
    evictions: u64,
    expired: u64,
}

struct ToolCache {
    limits: ToolCacheLimits,
    entries: HashMap<String, CacheEntry>,
    total_size: usize,
    /// Monotonic counter for access ordering
    access_counter: u64,
    counters: CacheCounters,
}

impl ToolCache {
    fn new(limits: ToolCacheLimits) -> Self {
        Self {
            limits,
            entries: HashMap::new(),
            total_size: 0,
            access_counter: 0,
            counters: CacheCounters::default(),
        }
    }

    fn next_access(&mut self) -> u64 {
        self.access_counter += 1;
        self.access_counter
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.total_size = self.total_size.saturating_sub(entry.size);
        Some(entry)
    }

    fn evict_least_used(&mut self) -> Option<String> {
        let victim = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| (entry.access_count, entry.last_access))
            .map(|(key, _)| key.clone())?;
        self.remove(&victim);
        self.counters.evictions += 1;
        Some(victim)
    }

    fn sweep(&mut self, now: Instant) -> usize {
        let ttl = self.limits.ttl();
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.timestamp) > ttl)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            self.remove(key);
        }
        self.counters.expired += expired.len() as u64;
        expired.len()
    }

    fn clear(&mut self) -> usize {
        let removed = self.entries.len();
        self.entries.clear();
        self.total_size = 0;
        removed
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub tool: String,
    pub size: usize,
    pub max_size: usize,
    pub ttl_secs: u64,
    pub total_size_bytes: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expired: u64,
    /// hits / (hits + misses); 0 before the first lookup
    pub hit_rate: f64,
    /// size / max_size
    pub utilization_rate: f64,
}

pub struct CacheManager {
    deps: Dependencies,
    settings: CacheSettings,
    caches: DashMap<String, Arc<Mutex<ToolCache>>>,
}

impl CacheManager {
    pub fn new(deps: Dependencies, settings: CacheSettings) -> Self {
        Self {
            deps,
            settings,
            caches: DashMap::new(),
        }
    }

    pub fn initialize(&self, tools: &[ToolConfig]) {
        for tool in tools {
            self.caches
                .entry(tool.name.clone())
                .and_modify(|cache| cache.lock().limits = tool.cache)
                .or_insert_with(|| Arc::new(Mutex::new(ToolCache::new(tool.cache))));
            debug!(
                tool = %tool.name,
                max_size = tool.cache.max_size,
                ttl_secs = tool.cache.ttl,
                "Initialized cache"
            );
        }
    }

    fn tool_cache(&self, tool: &str) -> Option<Arc<Mutex<ToolCache>>> {
        self.caches.get(tool).map(|entry| Arc::clone(entry.value()))
    }

    /// Look up a fresh entry. Expired entries are removed and count as misses.
    pub fn get(&self, tool: &str, key: &str) -> Option<Value> {
        if !self.deps.gate.is_enabled(flags::CACHE_MANAGER) {
            return None;
        }
        let cache = self.tool_cache(tool)?;
        let mut state = cache.lock();
        let now = Instant::now();
        let ttl = state.limits.ttl();

        let expired = match state.entries.get(key) {
            None => {
                state.counters.misses += 1;
                return None;
            }
            Some(entry) => now.duration_since(entry.timestamp) > ttl,
        };

        if expired {
            state.remove(key);
            state.counters.expired += 1;
            state.counters.misses += 1;
            debug!(tool, key, "Cache entry expired on access");
            return None;
        }

        let access = state.next_access();
        state.counters.hits += 1;
        let entry = state.entries.get_mut(key)?;
        entry.access_count += 1;
        entry.last_access = access;
        Some(entry.data.clone())
    }

    /// Insert or replace an entry, evicting the least-used one when a new key
    /// would exceed `max_size`.
    pub fn set(&self, tool: &str, key: &str, data: Value) -> ResourceResult<()> {
        ensure_enabled(self.deps.gate.as_ref(), flags::CACHE_MANAGER)?;
        let cache = self
            .tool_cache(tool)
            .ok_or_else(|| ResourceError::UnknownTool(tool.to_string()))?;

        let size = serde_json::to_string(&data).map_or(0, |s| s.len()) * 2;
        let mut state = cache.lock();

        if state.remove(key).is_none() {
            while state.entries.len() >= state.limits.max_size {
                match state.evict_least_used() {
                    Some(victim) => debug!(tool, key = %victim, "Evicted least used cache entry"),
                    None => break,
                }
            }
        }

        let access = state.next_access();
        state.total_size += size;
        state.entries.insert(
            key.to_string(),
            CacheEntry {
                data,
                timestamp: Instant::now(),
                size,
                access_count: 0,
                last_access: access,
            },
        );
        Ok(())
    }

    /// Return the cached value or run `loader` and cache its `Ok` result.
    pub async fn get_or_insert_with<F, Fut, E>(
        &self,
        tool: &str,
        key: &str,
        loader: F,
    ) -> Result<Value, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, E>>,
    {
        if let Some(hit) = self.get(tool, key) {
            return Ok(hit);
        }
        let value = loader().await?;
        if let Err(e) = self.set(tool, key, value.clone()) {
            debug!(tool, key, reason = e.reason(), "Loaded value not cached");
        }
        Ok(value)
    }

    pub fn invalidate(&self, tool: &str, key: &str) -> bool {
        self.tool_cache(tool)
            .map(|cache| cache.lock().remove(key).is_some())
            .unwrap_or(false)
    }

    /// Remove expired entries across all tools.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let caches: Vec<Arc<Mutex<ToolCache>>> = self
            .caches
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        let removed: usize = caches.iter().map(|cache| cache.lock().sweep(now)).sum();
        if removed > 0 {
            info!(removed, "Swept expired cache entries");
        }
        removed
    }

    pub fn clear_cache(&self, tool: &str) -> usize {
        let removed = self
            .tool_cache(tool)
            .map(|cache| cache.lock().clear())
            .unwrap_or(0);
        debug!(tool, removed, "Cleared cache");
        removed
    }

    pub fn clear_all_caches(&self) -> usize {
        let removed = self
            .caches
            .iter()
            .map(|entry| entry.value().lock().clear())
            .sum();
        info!(removed, "Cleared all caches");
        removed
    }

    pub fn get_cache_stats(&self, tool: &str) -> Option<CacheStats> {
        let cache = self.caches.get(tool)?;
        let state = cache.lock();
        let lookups = state.counters.hits + state.counters.misses;
        let size = state.entries.len();
        Some(CacheStats {
            tool: tool.to_string(),
            size,
            max_size: state.limits.max_size,
            ttl_secs: state.limits.ttl,
            total_size_bytes: state.total_size,
            hits: state.counters.hits,
            misses: state.counters.misses,
            evictions: state.counters.evictions,
            expired: state.counters.expired,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                state.counters.hits as f64 / lookups as f64
            },
            utilization_rate: if state.limits.max_size == 0 {
                0.0
            } else {
                size as f64 / state.limits.max_size as f64
            },
        })
    }

    pub fn get_all_cache_stats(&self) -> BTreeMap<String, CacheStats> {
        let tools: Vec<String> = self.caches.iter().map(|e| e.key().clone()).collect();
        tools
            .into_iter()
            .filter_map(|tool| self.get_cache_stats(&tool).map(|stats| (tool, stats)))
            .collect()
    }

    /// Periodic sweep loop; stops when `shutdown_rx` changes.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let mut interval_timer = interval(self.settings.cleanup_interval());
        info!(
            "Starting cache sweep task with {:?} interval",
            self.settings.cleanup_interval()
        );

        loop {
            tokio::select! {
                _ = interval_timer.tick() => {
                    self.sweep_expired();
                }
                _ = shutdown_rx.changed() => {
                    info!("Cache sweep task received shutdown signal");
                    break;
                }
            }
        }
    }
}

impl fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheManager")
            .field("tools", &self.caches.len())
            .finish()
    }
}
