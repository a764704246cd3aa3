//! Generic bounded key/value cache with pluggable eviction.
//!
//! One mutex guards the entry map; all counters are atomics so concurrent
//! readers never lose a hit/miss update. Lock hold times are map operations
//! only, never value construction or I/O.

use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::error::{GalleryError, GalleryResult};

/// Values storable in a [`CacheStore`].
///
/// `on_evict` runs exactly once per stored value, on eviction, explicit
/// removal, replacement, or clear, before the value is dropped. Implementors
/// holding native resources (GPU textures, mmap views) release them here.
pub trait CacheValue: Clone {
    /// Size in bytes, used for budget accounting.
    fn size_bytes(&self) -> usize;

    /// Cleanup hook invoked before the stored value is destroyed.
    fn on_evict(&self) {}
}

/// Eviction strategy, selectable per cache instance.
///
/// Adaptive composes the other three: it tracks a rolling window of
/// access-count variance and delegates to LFU for highly skewed workloads,
/// LRU for uniform ones, and TTL in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvictionPolicy {
    #[default]
    Lru,
    Lfu,
    Ttl,
    Adaptive,
}

/// Thresholds for proactive pressure cleanup: crossing each ratio of the
/// size budget removes the paired fraction of entries.
const PRESSURE_TIERS: [(f64, f64); 3] = [(0.95, 0.30), (0.90, 0.20), (0.85, 0.10)];

/// Rolling window length for the adaptive policy's variance scores.
const ADAPTIVE_WINDOW: usize = 10;

/// Cache statistics snapshot.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub size_bytes: usize,
    pub entry_count: usize,
}

impl CacheStats {
    /// hits / (hits + misses), 0.0 when idle.
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Per-instance configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Name used in stats and log lines.
    pub name: String,
    /// Entry-count cap (0 disables the count cap).
    pub max_entries: usize,
    /// Size budget in megabytes.
    pub max_size_mb: usize,
    pub policy: EvictionPolicy,
    /// Minimum gap between full pressure re-measurements.
    pub pressure_check_interval: Duration,
}

impl CacheConfig {
    pub fn new(name: impl Into<String>, max_entries: usize, max_size_mb: usize) -> Self {
        Self {
            name: name.into(),
            max_entries,
            max_size_mb,
            policy: EvictionPolicy::default(),
            pressure_check_interval: Duration::from_secs(5),
        }
    }

    pub fn with_policy(mut self, policy: EvictionPolicy) -> Self {
        self.policy = policy;
        self
    }
}

struct Entry<V> {
    value: V,
    size_bytes: usize,
    inserted_at: Instant,
    last_access: Instant,
    /// Monotonic sequence of the last touch; deterministic LRU order even
    /// when Instants collide.
    last_access_seq: u64,
    access_count: u64,
    ttl: Option<Duration>,
}

impl<V> Entry<V> {
    fn expired(&self, now: Instant) -> bool {
        match self.ttl {
            Some(ttl) => now.duration_since(self.inserted_at) >= ttl,
            None => false,
        }
    }
}

/// Bounded key/value cache with pluggable eviction policy.
pub struct CacheStore<K, V> {
    config: CacheConfig,
    max_size_bytes: usize,
    entries: Mutex<HashMap<K, Entry<V>>>,
    /// Rolling window of access-variance scores for the adaptive policy.
    adaptive_window: Mutex<VecDeque<f64>>,
    last_pressure_check: Mutex<Option<Instant>>,
    access_seq: AtomicU64,
    current_size: AtomicUsize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl<K, V> CacheStore<K, V>
where
    K: Hash + Eq + Clone,
    V: CacheValue,
{
    pub fn new(config: CacheConfig) -> Self {
        let max_size_bytes = config.max_size_mb * 1024 * 1024;
        Self {
            config,
            max_size_bytes,
            entries: Mutex::new(HashMap::new()),
            adaptive_window: Mutex::new(VecDeque::with_capacity(ADAPTIVE_WINDOW)),
            last_pressure_check: Mutex::new(None),
            access_seq: AtomicU64::new(0),
            current_size: AtomicUsize::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Get a value, updating access metadata on hit.
    ///
    /// An entry found past its TTL counts as a miss and is evicted in place.
    pub fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        let mut entries = self.entries.lock();

        let expired = match entries.get(key) {
            Some(entry) => entry.expired(now),
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        if expired {
            if let Some(entry) = entries.remove(key) {
                self.current_size.fetch_sub(entry.size_bytes, Ordering::Relaxed);
                self.evictions.fetch_add(1, Ordering::Relaxed);
                entry.value.on_evict();
            }
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let entry = entries.get_mut(key)?;
        entry.last_access = now;
        entry.last_access_seq = self.access_seq.fetch_add(1, Ordering::Relaxed);
        entry.access_count += 1;
        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(entry.value.clone())
    }

    /// Insert a value, evicting by policy to stay within budget.
    ///
    /// Returns false when the value alone exceeds the size budget. Inserting
    /// over an existing key runs the old value's cleanup hook before
    /// replacement.
    pub fn put(&self, key: K, value: V, ttl: Option<Duration>) -> bool {
        let size = value.size_bytes();
        if self.max_size_bytes > 0 && size > self.max_size_bytes {
            warn!(
                cache = %self.config.name,
                size_bytes = size,
                "value larger than entire cache budget, rejected"
            );
            return false;
        }

        let now = Instant::now();
        let seq = self.access_seq.fetch_add(1, Ordering::Relaxed);
        let mut entries = self.entries.lock();

        // Replacement: release the old value first so native resources are
        // never silently leaked.
        if let Some(old) = entries.remove(&key) {
            self.current_size.fetch_sub(old.size_bytes, Ordering::Relaxed);
            old.value.on_evict();
        }

        self.evict_for_budget(&mut entries, size);

        entries.insert(
            key,
            Entry {
                value,
                size_bytes: size,
                inserted_at: now,
                last_access: now,
                last_access_seq: seq,
                access_count: 0,
                ttl,
            },
        );
        self.current_size.fetch_add(size, Ordering::Relaxed);
        true
    }

    /// Remove an entry, running its cleanup hook. Returns whether it existed.
    pub fn remove(&self, key: &K) -> bool {
        let mut entries = self.entries.lock();
        match entries.remove(key) {
            Some(entry) => {
                self.current_size.fetch_sub(entry.size_bytes, Ordering::Relaxed);
                entry.value.on_evict();
                true
            }
            None => false,
        }
    }

    /// Remove everything, running cleanup hooks. Stats are kept for
    /// debugging.
    pub fn clear(&self) {
        let mut entries = self.entries.lock();
        for (_, entry) in entries.drain() {
            entry.value.on_evict();
        }
        self.current_size.store(0, Ordering::Relaxed);
    }

    /// Check membership without touching access metadata.
    pub fn contains(&self, key: &K) -> bool {
        self.entries.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Statistics snapshot.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            size_bytes: self.current_size.load(Ordering::Relaxed),
            entry_count: self.entries.lock().len(),
        }
    }

    /// Reset hit/miss/eviction counters to zero.
    pub fn reset_stats(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
    }

    /// Re-measure total size and proactively shed entries when over the
    /// pressure thresholds (85/90/95% of budget removes 10/20/30% of
    /// entries, selected by the active policy).
    ///
    /// Rate-limited by `pressure_check_interval`. Returns entries removed.
    /// A bookkeeping mismatch between the running size counter and the
    /// actual entry sizes is treated as corruption: the instance is cleared
    /// and rebuilt empty rather than crashing the process.
    pub fn check_memory_pressure(&self) -> GalleryResult<usize> {
        {
            let mut last = self.last_pressure_check.lock();
            if let Some(at) = *last {
                if at.elapsed() < self.config.pressure_check_interval {
                    return Ok(0);
                }
            }
            *last = Some(Instant::now());
        }

        let mut entries = self.entries.lock();

        let actual: usize = entries.values().map(|e| e.size_bytes).sum();
        let tracked = self.current_size.load(Ordering::Relaxed);
        if actual != tracked {
            error!(
                cache = %self.config.name,
                tracked, actual, "size accounting mismatch, clearing cache"
            );
            for (_, entry) in entries.drain() {
                entry.value.on_evict();
            }
            self.current_size.store(0, Ordering::Relaxed);
            return Err(GalleryError::CacheCorruption {
                cache: self.config.name.clone(),
                detail: format!("tracked {tracked} bytes vs actual {actual}"),
            });
        }

        if self.max_size_bytes == 0 {
            return Ok(0);
        }

        let ratio = actual as f64 / self.max_size_bytes as f64;
        let Some(&(_, shed_fraction)) = PRESSURE_TIERS.iter().find(|(t, _)| ratio >= *t) else {
            return Ok(0);
        };

        let target = ((entries.len() as f64) * shed_fraction).ceil() as usize;
        let removed = self.evict_n(&mut entries, target);
        debug!(
            cache = %self.config.name,
            ratio, removed, "pressure cleanup"
        );
        Ok(removed)
    }

    /// Evict a fraction of entries immediately, chosen by the active
    /// policy, bypassing the pressure-check rate limit. Used by owning
    /// components shedding load on demand. Returns entries removed.
    pub fn shed(&self, fraction: f64) -> usize {
        let mut entries = self.entries.lock();
        let target = ((entries.len() as f64) * fraction.clamp(0.0, 1.0)).ceil() as usize;
        self.evict_n(&mut entries, target)
    }

    /// Evict until both the entry-count cap and the size budget can absorb
    /// an incoming entry of `incoming_size` bytes.
    fn evict_for_budget(&self, entries: &mut HashMap<K, Entry<V>>, incoming_size: usize) {
        if self.config.max_entries > 0 {
            // +1 for the entry about to be inserted.
            let over = (entries.len() + 1).saturating_sub(self.config.max_entries);
            if over > 0 {
                self.evict_n(entries, over);
            }
        }

        if self.max_size_bytes > 0 {
            let budget = self.max_size_bytes.saturating_sub(incoming_size);
            while self.current_size.load(Ordering::Relaxed) > budget {
                if self.evict_n(entries, 1) == 0 {
                    break;
                }
            }
        }
    }

    /// Evict up to `n` entries chosen by the active policy. Returns the
    /// number actually evicted.
    fn evict_n(&self, entries: &mut HashMap<K, Entry<V>>, n: usize) -> usize {
        if n == 0 || entries.is_empty() {
            return 0;
        }

        let policy = self.effective_policy(entries);
        let now = Instant::now();
        let victims: Vec<K> = match policy {
            EvictionPolicy::Lru => select_victims(entries, n, |e| e.last_access_seq),
            EvictionPolicy::Lfu => {
                select_victims(entries, n, |e| (e.access_count, e.last_access_seq))
            }
            EvictionPolicy::Ttl => {
                // Expired entries first, then oldest-inserted.
                select_victims(entries, n, |e| (!e.expired(now), e.inserted_at))
            }
            // effective_policy never returns Adaptive.
            EvictionPolicy::Adaptive => Vec::new(),
        };

        let mut removed = 0;
        for key in victims {
            if let Some(entry) = entries.remove(&key) {
                self.current_size.fetch_sub(entry.size_bytes, Ordering::Relaxed);
                self.evictions.fetch_add(1, Ordering::Relaxed);
                entry.value.on_evict();
                removed += 1;
            }
        }
        removed
    }

    /// Resolve Adaptive to a concrete policy from the access-count variance
    /// window; other policies pass through.
    fn effective_policy(&self, entries: &HashMap<K, Entry<V>>) -> EvictionPolicy {
        if self.config.policy != EvictionPolicy::Adaptive {
            return self.config.policy;
        }

        let score = access_variance_score(entries);
        let mut window = self.adaptive_window.lock();
        if window.len() == ADAPTIVE_WINDOW {
            window.pop_front();
        }
        window.push_back(score);
        let mean = window.iter().sum::<f64>() / window.len() as f64;

        // Skewed access counts favour keeping the hot set (LFU); uniform
        // counts mean recency is the only signal (LRU).
        if mean > 0.7 {
            EvictionPolicy::Lfu
        } else if mean < 0.3 {
            EvictionPolicy::Lru
        } else {
            EvictionPolicy::Ttl
        }
    }
}

/// Normalized variance of access counts across entries, clamped to [0, 1].
fn access_variance_score<K, V>(entries: &HashMap<K, Entry<V>>) -> f64 {
    if entries.len() < 2 {
        return 0.0;
    }
    let n = entries.len() as f64;
    let mean = entries.values().map(|e| e.access_count as f64).sum::<f64>() / n;
    if mean == 0.0 {
        return 0.0;
    }
    let variance = entries
        .values()
        .map(|e| {
            let d = e.access_count as f64 - mean;
            d * d
        })
        .sum::<f64>()
        / n;
    (variance / (mean * mean)).min(1.0)
}

struct Candidate<K, R> {
    rank: R,
    key: K,
}

impl<K, R: Ord> PartialEq for Candidate<K, R> {
    fn eq(&self, other: &Self) -> bool {
        self.rank == other.rank
    }
}
impl<K, R: Ord> Eq for Candidate<K, R> {}
impl<K, R: Ord> PartialOrd for Candidate<K, R> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl<K, R: Ord> Ord for Candidate<K, R> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.rank.cmp(&other.rank)
    }
}

/// Pick the `n` lowest-ranked keys using a bounded max-heap: O(len log n)
/// instead of a full sort.
fn select_victims<K, V, R, F>(entries: &HashMap<K, Entry<V>>, n: usize, rank: F) -> Vec<K>
where
    K: Clone,
    R: Ord,
    F: Fn(&Entry<V>) -> R,
{
    let mut heap: BinaryHeap<Candidate<K, R>> = BinaryHeap::with_capacity(n + 1);
    for (key, entry) in entries {
        heap.push(Candidate {
            rank: rank(entry),
            key: key.clone(),
        });
        if heap.len() > n {
            heap.pop();
        }
    }
    heap.into_iter().map(|c| c.key).collect()
}
