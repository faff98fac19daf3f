//! Cache Layer.
//!
//! Memoizes `(resource, target version, stored version, payload hash)` to a
//! transformed value, with single-flight coalescing of concurrent misses and
//! eager invalidation on write.
//!
//! # Consistency
//!
//! Every resource with cached entries or computations in flight is tracked
//! under a generation drawn from a cache-wide counter.
//! [`TransformCache::invalidate`] drops the tracking along with the entries,
//! so the next computation for the resource starts under a fresh generation:
//!
//! - a computation that started before an invalidation never populates the
//!   cache;
//! - a cached entry whose generation disagrees with the current one is a
//!   [`CacheError::Inconsistency`]: it is logged, evicted, and the request is
//!   computed directly without touching the cache.
//!
//! Tracking is released as soon as a resource has neither entries nor
//! computations in flight, so it never outgrows the cache itself.
//!
//! Compute errors are shared with every coalesced caller and never cached.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tracing::{debug, error};

use crate::error::CacheError;
use crate::events::{EngineEvent, EventSink, NoopSink};
use crate::types::{PayloadHash, Resource, ResourceKey};
use crate::version::FhirVersion;

/// Key of a cached transformation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    /// The resource the value was computed from.
    pub resource: ResourceKey,
    /// The requested version.
    pub target: FhirVersion,
    /// Version the stored payload was expressed in.
    pub schema_version: FhirVersion,
    /// Store version id of the payload.
    pub version_id: String,
    /// Hash of the stored payload the value was computed from.
    pub payload_hash: PayloadHash,
}

impl CacheKey {
    /// Creates the key for serving `stored` at `target`.
    pub fn new(stored: &Resource, target: FhirVersion) -> Result<Self, CacheError> {
        Ok(Self {
            resource: stored.key(),
            target,
            schema_version: stored.schema_version(),
            version_id: stored.version_id().to_string(),
            payload_hash: PayloadHash::of(stored.payload())?,
        })
    }
}

/// Cache sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    /// Time an entry stays valid after insertion.
    pub ttl: Duration,
    /// Maximum number of entries kept.
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            max_entries: 10_000,
        }
    }
}

/// Cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Lookups served from the cache.
    pub hits: u64,
    /// Lookups that had to wait for a computation.
    pub misses: u64,
    /// Misses that joined a computation already in flight.
    pub coalesced: u64,
    /// Inconsistent entries detected and bypassed.
    pub inconsistencies: u64,
    /// Entries removed for capacity or expiry.
    pub evictions: u64,
    /// Entries currently held.
    pub entries: usize,
}

struct Entry<V> {
    value: V,
    expires_at: Instant,
    generation: u64,
}

struct Flight<V, E> {
    cell: Arc<OnceCell<Result<V, E>>>,
    generation: u64,
}

/// Per-resource bookkeeping, alive while the resource has entries or flights.
struct Tracked {
    generation: u64,
    keys: HashSet<CacheKey>,
    flights: usize,
}

struct State<V, E> {
    entries: HashMap<CacheKey, Entry<V>>,
    resources: HashMap<ResourceKey, Tracked>,
    in_flight: HashMap<CacheKey, Flight<V, E>>,
    last_generation: u64,
    stats: CacheStats,
}

impl<V, E> State<V, E> {
    fn generation(&self, resource: &ResourceKey) -> Option<u64> {
        self.resources.get(resource).map(|t| t.generation)
    }

    fn track(&mut self, resource: &ResourceKey) -> &mut Tracked {
        let last = &mut self.last_generation;
        self.resources.entry(resource.clone()).or_insert_with(|| {
            *last += 1;
            Tracked {
                generation: *last,
                keys: HashSet::new(),
                flights: 0,
            }
        })
    }

    fn release(&mut self, resource: &ResourceKey) {
        if self
            .resources
            .get(resource)
            .is_some_and(|t| t.keys.is_empty() && t.flights == 0)
        {
            self.resources.remove(resource);
        }
    }

    fn remove(&mut self, key: &CacheKey) -> bool {
        if let Some(tracked) = self.resources.get_mut(&key.resource) {
            tracked.keys.remove(key);
        }
        self.release(&key.resource);
        self.entries.remove(key).is_some()
    }

    fn make_room(&mut self, max_entries: usize, now: Instant) {
        if self.entries.len() < max_entries {
            return;
        }
        let expired: Vec<CacheKey> = self
            .entries
            .iter()
            .filter(|(_, e)| e.expires_at <= now)
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            if self.remove(&key) {
                self.stats.evictions += 1;
            }
        }
        while self.entries.len() >= max_entries {
            let Some(oldest) = self
                .entries
                .iter()
                .min_by_key(|(_, e)| e.expires_at)
                .map(|(k, _)| k.clone())
            else {
                break;
            };
            if self.remove(&oldest) {
                self.stats.evictions += 1;
            }
        }
    }
}

enum Lookup<V, E> {
    Hit(V),
    Bypass,
    Wait {
        cell: Arc<OnceCell<Result<V, E>>>,
        generation: u64,
    },
}

/// Single-flight, generation-checked cache of transformed values.
pub struct TransformCache<V, E> {
    state: Mutex<State<V, E>>,
    config: CacheConfig,
    sink: Arc<dyn EventSink>,
}

impl<V, E> std::fmt::Debug for TransformCache<V, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformCache")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl<V, E> TransformCache<V, E> {
    /// Creates an empty cache.
    pub fn new(config: CacheConfig) -> Self {
        Self {
            state: Mutex::new(State {
                entries: HashMap::new(),
                resources: HashMap::new(),
                in_flight: HashMap::new(),
                last_generation: 0,
                stats: CacheStats::default(),
            }),
            config,
            sink: Arc::new(NoopSink),
        }
    }

    /// Replaces the event sink.
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    fn emit_lookup(&self, key: &CacheKey, hit: bool) {
        let resource_type = key.resource.resource_type.clone();
        let target = key.target;
        self.sink.emit(&if hit {
            EngineEvent::CacheHit {
                resource_type,
                target,
            }
        } else {
            EngineEvent::CacheMiss {
                resource_type,
                target,
            }
        });
    }

    /// Removes every entry for the resource, across all target versions, and
    /// detaches computations in flight for it.
    ///
    /// Call after every committed write to the resource.
    pub fn invalidate(&self, resource: &ResourceKey) {
        let mut state = self.state.lock();
        let keys = state
            .resources
            .remove(resource)
            .map(|t| t.keys)
            .unwrap_or_default();
        for key in &keys {
            state.entries.remove(key);
        }
        state.in_flight.retain(|k, _| &k.resource != resource);
        debug!(resource = %resource, removed = keys.len(), "Invalidated cached transformations");
    }

    /// Returns the cache sizing.
    pub fn config(&self) -> CacheConfig {
        self.config
    }

    /// Returns the current counters.
    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        CacheStats {
            entries: state.entries.len(),
            ..state.stats
        }
    }

    /// Returns the number of cached entries.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Returns `true` if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    fn advance_generation_only(&self, resource: &ResourceKey) {
        let mut state = self.state.lock();
        state.last_generation += 1;
        let next = state.last_generation;
        if let Some(tracked) = state.resources.get_mut(resource) {
            tracked.generation = next;
        }
    }

    #[cfg(test)]
    fn tracked_resources(&self) -> usize {
        self.state.lock().resources.len()
    }
}

impl<V, E> TransformCache<V, E>
where
    V: Clone,
    E: Clone,
{
    /// Returns the cached value for `key` or computes it.
    ///
    /// Concurrent callers missing on the same key share one invocation of
    /// `compute` and all receive its result.
    pub async fn get_or_compute<F, Fut>(&self, key: CacheKey, compute: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        match self.lookup(&key) {
            Lookup::Hit(value) => {
                self.emit_lookup(&key, true);
                Ok(value)
            }
            Lookup::Bypass => compute().await,
            Lookup::Wait { cell, generation } => {
                self.emit_lookup(&key, false);
                let result = cell.get_or_init(compute).await.clone();
                self.finish(key, &cell, generation, &result);
                result
            }
        }
    }

    fn lookup(&self, key: &CacheKey) -> Lookup<V, E> {
        let now = Instant::now();
        let mut state = self.state.lock();
        let current = state.generation(&key.resource);

        if let Some(entry) = state.entries.get(key) {
            if Some(entry.generation) != current {
                let err = CacheError::Inconsistency {
                    key: format!("{}@{}", key.resource, key.target),
                    message: format!(
                        "entry generation {} does not match resource generation {:?}",
                        entry.generation, current
                    ),
                };
                error!(error = %err, "Bypassing cache for inconsistent entry");
                state.remove(key);
                state.stats.inconsistencies += 1;
                return Lookup::Bypass;
            }
            if entry.expires_at > now {
                let value = entry.value.clone();
                state.stats.hits += 1;
                return Lookup::Hit(value);
            }
            state.remove(key);
            state.stats.evictions += 1;
        }

        state.stats.misses += 1;
        if let Some(flight) = state.in_flight.get(key) {
            let (cell, generation) = (flight.cell.clone(), flight.generation);
            state.stats.coalesced += 1;
            return Lookup::Wait { cell, generation };
        }

        let tracked = state.track(&key.resource);
        tracked.flights += 1;
        let generation = tracked.generation;
        let cell = Arc::new(OnceCell::new());
        state.in_flight.insert(
            key.clone(),
            Flight {
                cell: cell.clone(),
                generation,
            },
        );
        Lookup::Wait { cell, generation }
    }

    fn finish(
        &self,
        key: CacheKey,
        cell: &Arc<OnceCell<Result<V, E>>>,
        generation: u64,
        result: &Result<V, E>,
    ) {
        let mut state = self.state.lock();
        let owned = state
            .in_flight
            .get(&key)
            .is_some_and(|f| Arc::ptr_eq(&f.cell, cell));
        if !owned {
            return;
        }
        state.in_flight.remove(&key);
        if let Some(tracked) = state.resources.get_mut(&key.resource) {
            tracked.flights = tracked.flights.saturating_sub(1);
        }

        let resource = key.resource.clone();
        match result {
            Ok(value) if state.generation(&resource) == Some(generation) => {
                let now = Instant::now();
                state.make_room(self.config.max_entries, now);
                if self.config.max_entries > 0 {
                    // Eviction above may have released the tracking.
                    let tracked = state.track(&resource);
                    tracked.keys.insert(key.clone());
                    let generation = tracked.generation;
                    state.entries.insert(
                        key,
                        Entry {
                            value: value.clone(),
                            expires_at: now + self.config.ttl,
                            generation,
                        },
                    );
                }
            }
            Ok(_) => {
                debug!(resource = %resource, "Discarding value computed before invalidation");
            }
            Err(_) => {}
        }
        state.release(&resource);
    }
}
