//! Resource limit configuration with self-validating construction.

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Memory pressure tiers derived from usage relative to the configured
/// ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize)]
pub enum MemoryPressure {
    #[default]
    Normal,
    Warning,
    Critical,
}

/// Usage ratio at which pressure becomes Warning.
pub const WARNING_RATIO: f64 = 0.75;
/// Usage ratio at which pressure becomes Critical.
pub const CRITICAL_RATIO: f64 = 0.90;

impl MemoryPressure {
    /// Classify a usage/limit ratio into a pressure tier.
    pub fn from_ratio(ratio: f64) -> Self {
        if ratio >= CRITICAL_RATIO {
            MemoryPressure::Critical
        } else if ratio >= WARNING_RATIO {
            MemoryPressure::Warning
        } else {
            MemoryPressure::Normal
        }
    }
}

/// Hard limits for tile and memory accounting.
///
/// Deserialized from application configuration. Out-of-range values are
/// clamped to safe defaults by [`ResourceLimits::validated`]; corrections
/// are logged, never silently ignored and never fatal.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Maximum number of live tile handles.
    pub max_tiles: usize,
    /// Total memory budget in megabytes.
    pub max_memory_mb: usize,
    /// Per-tile memory estimate ceiling in megabytes.
    pub max_memory_per_tile_mb: usize,
    /// Bounded worker pool size for background work.
    pub max_concurrent_workers: usize,
    /// Regular cleanup cadence in seconds.
    pub cleanup_interval_secs: u64,
    /// Baseline memory sampling cadence in seconds.
    pub memory_check_interval_secs: u64,
    /// Fraction of the cache budget at which proactive cleanup starts.
    pub cache_cleanup_threshold: f64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_tiles: 2000,
            max_memory_mb: 1024,
            max_memory_per_tile_mb: 4,
            max_concurrent_workers: 4,
            cleanup_interval_secs: 30,
            memory_check_interval_secs: 5,
            cache_cleanup_threshold: 0.85,
        }
    }
}

impl ResourceLimits {
    /// Clamp every field into its safe range, logging each correction.
    ///
    /// The derived consistency check caps `max_tiles` so that
    /// `max_tiles * max_memory_per_tile_mb` cannot exceed twice the total
    /// memory budget (a worst-case where every tile hits its per-tile cap
    /// would otherwise dwarf `max_memory_mb`).
    pub fn validated(mut self) -> Self {
        let defaults = Self::default();

        self.max_tiles = clamp_field("max_tiles", self.max_tiles, 1, 100_000);
        self.max_memory_mb = clamp_field(
            "max_memory_mb",
            self.max_memory_mb,
            16,
            65_536,
        );
        self.max_memory_per_tile_mb = clamp_field(
            "max_memory_per_tile_mb",
            self.max_memory_per_tile_mb,
            1,
            256,
        );
        self.max_concurrent_workers = clamp_field(
            "max_concurrent_workers",
            self.max_concurrent_workers,
            1,
            64,
        );
        self.cleanup_interval_secs = clamp_field(
            "cleanup_interval_secs",
            self.cleanup_interval_secs,
            1,
            3600,
        );
        self.memory_check_interval_secs = clamp_field(
            "memory_check_interval_secs",
            self.memory_check_interval_secs,
            1,
            600,
        );

        if !(0.5..=0.99).contains(&self.cache_cleanup_threshold)
            || !self.cache_cleanup_threshold.is_finite()
        {
            warn!(
                value = self.cache_cleanup_threshold,
                corrected = defaults.cache_cleanup_threshold,
                "cache_cleanup_threshold out of range, corrected"
            );
            self.cache_cleanup_threshold = defaults.cache_cleanup_threshold;
        }

        // Consistency: worst-case tile memory must not wildly exceed the budget.
        let worst_case_mb = self.max_tiles.saturating_mul(self.max_memory_per_tile_mb);
        if worst_case_mb > self.max_memory_mb.saturating_mul(2) {
            let corrected = (self.max_memory_mb * 2 / self.max_memory_per_tile_mb).max(1);
            warn!(
                max_tiles = self.max_tiles,
                corrected,
                "max_tiles x max_memory_per_tile_mb exceeds memory budget, capping max_tiles"
            );
            self.max_tiles = corrected;
        }

        self
    }
}

fn clamp_field<T>(field: &'static str, value: T, min: T, max: T) -> T
where
    T: PartialOrd + Copy + std::fmt::Debug,
{
    if value < min {
        warn!(field, value = ?value, corrected = ?min, "limit below minimum, corrected");
        min
    } else if value > max {
        warn!(field, value = ?value, corrected = ?max, "limit above maximum, corrected");
        max
    } else {
        value
    }
}
