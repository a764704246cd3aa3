//! Process-wide tile and memory accounting with tiered cleanup.
//!
//! One accountant is constructed per process and handed to whoever needs it
//! as an `Arc` — an explicit service rather than a hidden global. Tracking
//! is strictly non-owning: the accountant holds weak references and size
//! estimates, so its bookkeeping can never extend a tile's lifetime.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{MemoryPressure, ResourceLimits, CRITICAL_RATIO};
use crate::error::GalleryError;

/// Stable identifier for a tracked tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TileId(pub u64);

/// Floor for the adaptive memory-check interval while under pressure.
const MIN_CHECK_INTERVAL: Duration = Duration::from_millis(500);

/// Cap on retained usage samples; compaction halves the history.
const HISTORY_CAP: usize = 120;

/// Component hook for accountant-driven cleanup.
///
/// `maintenance_cleanup` runs on every regular cycle and on Tier 1/2 of an
/// emergency. `forced_evict` is Tier 3 and is only ever invoked on
/// components that opt in via `safely_evictable` — the accountant must not
/// destroy state a caller still depends on. A hook returning `Err` is
/// logged and skipped; it never blocks the other components' cleanup.
pub trait MaintenanceCleanup: Send + Sync {
    fn component_name(&self) -> &str;

    /// Current memory attributable to this component.
    fn memory_usage_bytes(&self) -> usize {
        0
    }

    /// Routine housekeeping. Returns bytes freed.
    fn maintenance_cleanup(&self) -> Result<usize, GalleryError> {
        Ok(0)
    }

    /// Shed cache contents under pressure (Tier 2). Returns bytes freed.
    fn shed_caches(&self) -> Result<usize, GalleryError> {
        Ok(0)
    }

    /// Whether Tier 3 may forcibly evict this component's resources.
    fn safely_evictable(&self) -> bool {
        false
    }

    /// Forced eviction (Tier 3). Only called when `safely_evictable`.
    fn forced_evict(&self) -> Result<usize, GalleryError> {
        Ok(0)
    }
}

struct TrackedTile {
    /// Non-owning handle to the tile's payload; dead weaks are pruned on
    /// every cleanup pass.
    payload: Weak<dyn Any + Send + Sync>,
    estimated_bytes: usize,
}

#[derive(Debug, Clone, Copy)]
struct UsageSample {
    #[allow(dead_code)]
    at: Instant,
    bytes: usize,
}

/// Outcome of one emergency cleanup cycle.
#[derive(Debug, Default)]
pub struct CleanupReport {
    /// Highest tier that ran (0 = none needed).
    pub tiers_run: u8,
    pub freed_bytes: usize,
    pub dead_tiles_pruned: usize,
    /// Per-component failures; cleanup of the rest proceeded regardless.
    pub errors: Vec<GalleryError>,
    pub final_pressure: MemoryPressure,
}

/// Accounting statistics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub tile_count: usize,
    pub memory_usage_mb: f64,
    pub peak_memory_mb: f64,
    pub pressure: MemoryPressure,
    pub registrations_refused: u64,
    pub cleanup_runs: u64,
    pub emergency_runs: u64,
}

/// Tracks live tiles and component memory against hard limits.
pub struct ResourceAccountant {
    limits: RwLock<ResourceLimits>,
    tiles: RwLock<HashMap<TileId, TrackedTile>>,
    components: RwLock<Vec<Arc<dyn MaintenanceCleanup>>>,
    history: Mutex<VecDeque<UsageSample>>,
    last_memory_check: Mutex<Option<Instant>>,
    last_cleanup: Mutex<Option<Instant>>,
    /// Adaptive sampling gap in milliseconds; shrinks under pressure.
    check_interval_ms: AtomicU64,
    /// Cached usage in bytes — the lock-free fast path for readers.
    cached_usage: AtomicUsize,
    /// Cached pressure tier (discriminant of MemoryPressure).
    cached_pressure: AtomicU8,
    registrations_refused: AtomicU64,
    cleanup_runs: AtomicU64,
    emergency_runs: AtomicU64,
}

impl ResourceAccountant {
    pub fn new(limits: ResourceLimits) -> Self {
        let limits = limits.validated();
        let interval_ms = limits.memory_check_interval_secs * 1000;
        Self {
            limits: RwLock::new(limits),
            tiles: RwLock::new(HashMap::new()),
            components: RwLock::new(Vec::new()),
            history: Mutex::new(VecDeque::with_capacity(HISTORY_CAP)),
            last_memory_check: Mutex::new(None),
            last_cleanup: Mutex::new(None),
            check_interval_ms: AtomicU64::new(interval_ms),
            cached_usage: AtomicUsize::new(0),
            cached_pressure: AtomicU8::new(0),
            registrations_refused: AtomicU64::new(0),
            cleanup_runs: AtomicU64::new(0),
            emergency_runs: AtomicU64::new(0),
        }
    }

    pub fn limits(&self) -> ResourceLimits {
        self.limits.read().clone()
    }

    /// Re-validate and atomically replace the limits (hot swap). In-flight
    /// cleanup cycles finish against the snapshot they started with.
    pub fn update_limits(&self, limits: ResourceLimits) {
        let limits = limits.validated();
        info!(max_tiles = limits.max_tiles, max_memory_mb = limits.max_memory_mb, "limits updated");
        *self.limits.write() = limits;
        self.sample_memory();
    }

    /// Register a component for cleanup participation and memory reporting.
    pub fn register_component(&self, component: Arc<dyn MaintenanceCleanup>) {
        self.components.write().push(component);
    }

    /// Track a tile. Refuses (returns false) when the tile budget is full
    /// and the registration is not urgent; urgent registrations always
    /// land so an in-progress interaction is never broken by the cap.
    pub fn register_tile(
        &self,
        id: TileId,
        payload: &Arc<dyn Any + Send + Sync>,
        estimated_bytes: usize,
        urgent: bool,
    ) -> bool {
        let (max_tiles, per_tile_cap) = {
            let limits = self.limits.read();
            (
                limits.max_tiles,
                limits.max_memory_per_tile_mb * 1024 * 1024,
            )
        };

        let mut tiles = self.tiles.write();
        if !urgent && tiles.len() >= max_tiles && !tiles.contains_key(&id) {
            self.registrations_refused.fetch_add(1, Ordering::Relaxed);
            debug!(tile = id.0, count = tiles.len(), "tile registration refused at cap");
            return false;
        }

        tiles.insert(
            id,
            TrackedTile {
                payload: Arc::downgrade(payload),
                estimated_bytes: estimated_bytes.min(per_tile_cap),
            },
        );
        drop(tiles);
        self.sample_memory();
        true
    }

    /// Stop tracking a tile. Unknown ids are ignored.
    pub fn unregister_tile(&self, id: TileId) {
        self.tiles.write().remove(&id);
        self.sample_memory();
    }

    pub fn tile_count(&self) -> usize {
        self.tiles.read().len()
    }

    /// Estimated memory usage in megabytes (tiles + registered components).
    pub fn memory_usage_mb(&self) -> f64 {
        self.sample_memory() as f64 / (1024.0 * 1024.0)
    }

    /// Current pressure tier from the cached sample — the lock-free fast
    /// path; call [`Self::maybe_check_memory`] or `memory_usage_mb` to
    /// refresh.
    pub fn pressure(&self) -> MemoryPressure {
        match self.cached_pressure.load(Ordering::Acquire) {
            2 => MemoryPressure::Critical,
            1 => MemoryPressure::Warning,
            _ => MemoryPressure::Normal,
        }
    }

    /// Periodic memory check with an adaptive interval: sampling speeds up
    /// (down to a 500 ms floor) while under pressure and slows back down to
    /// the configured interval once pressure subsides.
    ///
    /// Returns the fresh pressure tier when a sample was taken.
    pub fn maybe_check_memory(&self) -> Option<MemoryPressure> {
        {
            let mut last = self.last_memory_check.lock();
            let interval = Duration::from_millis(self.check_interval_ms.load(Ordering::Relaxed));
            if let Some(at) = *last {
                if at.elapsed() < interval {
                    return None;
                }
            }
            *last = Some(Instant::now());
        }

        self.sample_memory();
        let pressure = self.pressure();
        self.adapt_check_interval(pressure);
        Some(pressure)
    }

    fn adapt_check_interval(&self, pressure: MemoryPressure) {
        let ceiling_ms = self.limits.read().memory_check_interval_secs * 1000;
        let current = self.check_interval_ms.load(Ordering::Relaxed);
        let next = if pressure >= MemoryPressure::Warning {
            (current / 2).max(MIN_CHECK_INTERVAL.as_millis() as u64)
        } else {
            (current * 2).min(ceiling_ms)
        };
        self.check_interval_ms.store(next, Ordering::Relaxed);
    }

    /// Sum tile estimates and component usage; refresh the cached sample
    /// and pressure tier. Returns total bytes.
    fn sample_memory(&self) -> usize {
        let tile_bytes: usize = self
            .tiles
            .read()
            .values()
            .map(|t| t.estimated_bytes)
            .sum();
        let component_bytes: usize = self
            .components
            .read()
            .iter()
            .map(|c| c.memory_usage_bytes())
            .sum();
        let total = tile_bytes + component_bytes;

        let limit_bytes = self.limits.read().max_memory_mb * 1024 * 1024;
        let ratio = total as f64 / limit_bytes.max(1) as f64;
        let pressure = MemoryPressure::from_ratio(ratio);

        self.cached_usage.store(total, Ordering::Release);
        self.cached_pressure
            .store(pressure_discriminant(pressure), Ordering::Release);

        let mut history = self.history.lock();
        history.push_back(UsageSample {
            at: Instant::now(),
            bytes: total,
        });
        if history.len() > HISTORY_CAP {
            compact_history(&mut history);
        }

        total
    }

    /// Regular cleanup cycle: prune dead weak references, compact the
    /// statistics history, run component maintenance hooks.
    ///
    /// Rate-limited by `cleanup_interval_secs`; pass `force` to bypass the
    /// gate (tests, explicit user action).
    pub fn perform_cleanup(&self, force: bool) -> usize {
        if !force {
            let mut last = self.last_cleanup.lock();
            let interval = Duration::from_secs(self.limits.read().cleanup_interval_secs);
            if let Some(at) = *last {
                if at.elapsed() < interval {
                    return 0;
                }
            }
            *last = Some(Instant::now());
        }

        self.cleanup_runs.fetch_add(1, Ordering::Relaxed);
        let pruned = self.prune_dead_tiles();

        {
            let mut history = self.history.lock();
            if history.len() > HISTORY_CAP / 2 {
                compact_history(&mut history);
            }
        }

        let mut freed = 0usize;
        for component in self.components.read().iter() {
            match component.maintenance_cleanup() {
                Ok(bytes) => freed += bytes,
                Err(err) => {
                    warn!(component = component.component_name(), %err, "maintenance cleanup failed");
                }
            }
        }

        self.sample_memory();
        debug!(pruned, freed, "regular cleanup");
        pruned + freed
    }

    /// Tiered emergency cleanup.
    ///
    /// Tier 1 reclaims dead handles and runs maintenance hooks; Tier 2
    /// sheds caches and truncates history; Tier 3 forces eviction on
    /// components that opted in via `safely_evictable`. Memory is
    /// re-measured after each tier and escalation stops as soon as usage
    /// drops below the critical threshold. Component failures are caught
    /// per-component and collected in the report.
    pub fn perform_emergency_cleanup(&self) -> CleanupReport {
        self.emergency_runs.fetch_add(1, Ordering::Relaxed);
        let mut report = CleanupReport::default();
        let critical_bytes = {
            let limits = self.limits.read();
            (limits.max_memory_mb as f64 * 1024.0 * 1024.0 * CRITICAL_RATIO) as usize
        };

        // Tier 1: reclaim dead handles, routine maintenance.
        report.tiers_run = 1;
        report.dead_tiles_pruned = self.prune_dead_tiles();
        for component in self.components.read().iter() {
            match component.maintenance_cleanup() {
                Ok(bytes) => report.freed_bytes += bytes,
                Err(err) => report.errors.push(err),
            }
        }
        if self.sample_memory() < critical_bytes {
            report.final_pressure = self.pressure();
            return report;
        }

        // Tier 2: shed caches, truncate history.
        report.tiers_run = 2;
        info!("emergency cleanup escalating to tier 2");
        for component in self.components.read().iter() {
            match component.shed_caches() {
                Ok(bytes) => report.freed_bytes += bytes,
                Err(err) => report.errors.push(err),
            }
        }
        self.history.lock().truncate(HISTORY_CAP / 4);
        if self.sample_memory() < critical_bytes {
            report.final_pressure = self.pressure();
            return report;
        }

        // Tier 3: forced eviction, opt-in components only.
        report.tiers_run = 3;
        warn!("emergency cleanup escalating to tier 3");
        for component in self.components.read().iter() {
            if !component.safely_evictable() {
                continue;
            }
            match component.forced_evict() {
                Ok(bytes) => report.freed_bytes += bytes,
                Err(err) => report.errors.push(err),
            }
        }
        self.sample_memory();
        report.final_pressure = self.pressure();
        report
    }

    fn prune_dead_tiles(&self) -> usize {
        let mut tiles = self.tiles.write();
        let before = tiles.len();
        tiles.retain(|_, t| t.payload.strong_count() > 0);
        before - tiles.len()
    }

    /// Statistics snapshot for telemetry.
    pub fn statistics(&self) -> Snapshot {
        let peak_bytes = self
            .history
            .lock()
            .iter()
            .map(|s| s.bytes)
            .max()
            .unwrap_or(0);
        Snapshot {
            tile_count: self.tiles.read().len(),
            memory_usage_mb: self.cached_usage.load(Ordering::Acquire) as f64 / (1024.0 * 1024.0),
            peak_memory_mb: peak_bytes as f64 / (1024.0 * 1024.0),
            pressure: self.pressure(),
            registrations_refused: self.registrations_refused.load(Ordering::Relaxed),
            cleanup_runs: self.cleanup_runs.load(Ordering::Relaxed),
            emergency_runs: self.emergency_runs.load(Ordering::Relaxed),
        }
    }

    #[cfg(test)]
    fn check_interval_ms_for_test(&self) -> u64 {
        self.check_interval_ms.load(Ordering::Relaxed)
    }
}

fn pressure_discriminant(pressure: MemoryPressure) -> u8 {
    match pressure {
        MemoryPressure::Normal => 0,
        MemoryPressure::Warning => 1,
        MemoryPressure::Critical => 2,
    }
}

/// Keep every other sample, halving the history while preserving its shape.
fn compact_history(history: &mut VecDeque<UsageSample>) {
    let mut keep = true;
    history.retain(|_| {
        keep = !keep;
        keep
    });
}
