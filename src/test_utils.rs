//! Shared test fixtures.

use crate::config::ResourceLimits;
use crate::coordinator::ItemRecord;
use crate::thumbnail::ThumbnailData;

/// An ordered item list with stable, distinct keys.
pub(crate) fn items(count: usize) -> Vec<ItemRecord> {
    (0..count)
        .map(|i| {
            ItemRecord::new(
                format!("photos/img-{:05}.jpg", i),
                200,
                format!("thumb://img-{:05}", i),
            )
        })
        .collect()
}

/// A square RGBA thumbnail of the given edge length.
pub(crate) fn thumbnail(edge: u32) -> ThumbnailData {
    ThumbnailData::new(vec![0xAB; (edge * edge * 4) as usize], edge, edge)
}

/// Limits large enough that no test trips them by accident.
pub(crate) fn permissive_limits() -> ResourceLimits {
    ResourceLimits {
        max_tiles: 1000,
        max_memory_mb: 4096,
        max_memory_per_tile_mb: 4,
        max_concurrent_workers: 4,
        cleanup_interval_secs: 1,
        memory_check_interval_secs: 1,
        cache_cleanup_threshold: 0.85,
    }
}
