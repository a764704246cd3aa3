//! Tile lifecycle orchestration for the gallery view.
//!
//! The coordinator is the only component that knows "tiles" as a domain
//! concept. It composes the geometry cache, the thumbnail cache, the task
//! scheduler, and the resource accountant: given the item list and viewport
//! state it decides which tiles exist, where they sit, and which cache or
//! async operations to issue. It is owned by the UI thread; background
//! workers never touch it directly, they report back through the scheduler
//! queue.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cache::{CacheConfig, CacheStore};
use crate::config::MemoryPressure;
use crate::error::{GalleryError, GalleryResult};
use crate::geometry::{GeometryCache, GeometryConfig, LayoutParams, VisibleRange};
use crate::resources::{MaintenanceCleanup, ResourceAccountant, TileId};
use crate::scheduler::{BatchUpdater, SchedulerConfig, TaskScheduler};
use crate::thumbnail::ThumbnailData;

/// Per-tile lifecycle. `Disposed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TileState {
    NotCreated,
    Created,
    Visible,
    Hidden,
    Disposed,
}

impl TileState {
    /// Legal transitions of the lifecycle machine. Visible and Hidden flip
    /// freely from scroll; nothing leaves Disposed.
    fn can_become(self, next: TileState) -> bool {
        use TileState::*;
        matches!(
            (self, next),
            (NotCreated, Created)
                | (Created, Visible)
                | (Visible, Hidden)
                | (Hidden, Visible)
                | (Created, Disposed)
                | (Visible, Disposed)
                | (Hidden, Disposed)
        )
    }
}

/// One entry of the data layer's ordered item sequence.
#[derive(Debug, Clone)]
pub struct ItemRecord {
    /// Unique stable key (path or equivalent); tile ids derive from it.
    pub key: String,
    pub display_size: u32,
    pub thumbnail_source: String,
}

impl ItemRecord {
    pub fn new(
        key: impl Into<String>,
        display_size: u32,
        thumbnail_source: impl Into<String>,
    ) -> Self {
        Self {
            key: key.into(),
            display_size,
            thumbnail_source: thumbnail_source.into(),
        }
    }

    /// Stable 64-bit tile id from the item key (FNV-1a).
    pub fn tile_id(&self) -> TileId {
        let mut hash: u64 = 0xcbf29ce484222325;
        for byte in self.key.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x100000001b3);
        }
        TileId(hash)
    }
}

/// Marker payload the accountant tracks through a weak reference; dropped
/// with the handle, so accounting can never extend a tile's lifetime.
struct TilePayload {
    #[allow(dead_code)]
    item_key: String,
}

/// One live tile owned by the coordinator.
pub struct TileHandle {
    id: TileId,
    item_key: String,
    size_class: u32,
    state: TileState,
    origin: (u32, u32),
    /// Scheduler task ids still in flight for this tile; cancelled on
    /// disposal.
    pending_tasks: Vec<u64>,
    /// Kept alive so the accountant's weak reference stays valid for the
    /// tile's lifetime; dropped with the handle.
    #[allow(dead_code)]
    payload: Arc<dyn Any + Send + Sync>,
}

impl TileHandle {
    pub fn id(&self) -> TileId {
        self.id
    }

    pub fn item_key(&self) -> &str {
        &self.item_key
    }

    pub fn state(&self) -> TileState {
        self.state
    }

    pub fn size_class(&self) -> u32 {
        self.size_class
    }

    pub fn origin(&self) -> (u32, u32) {
        self.origin
    }

    fn set_state(&mut self, next: TileState) -> bool {
        if self.state == next {
            return true;
        }
        if !self.state.can_become(next) {
            warn!(
                tile = self.id.0,
                from = ?self.state,
                to = ?next,
                "illegal tile state transition ignored"
            );
            return false;
        }
        self.state = next;
        true
    }
}

/// Render-layer view of one item: geometry plus lifecycle state.
#[derive(Debug, Clone, Copy)]
pub struct TileView {
    pub index: usize,
    pub id: TileId,
    pub origin: (u32, u32),
    pub state: TileState,
}

/// Output of a viewport update, consumed by the external paint step.
#[derive(Debug, Clone)]
pub struct ViewUpdate {
    pub layout: LayoutParams,
    pub range: VisibleRange,
    /// One entry per item inside the buffered range, in item order.
    pub tiles: Vec<TileView>,
}

/// Partial-result outcome of a batch tile creation pass.
#[derive(Debug, Default)]
pub struct BatchResult {
    pub created: usize,
    pub skipped: usize,
    pub errors: Vec<GalleryError>,
}

/// Periodic telemetry snapshot for a debug overlay or log sink.
#[derive(Debug, Clone, Serialize)]
pub struct Telemetry {
    pub memory_usage_mb: f64,
    pub tile_count: usize,
    pub cache_hit_ratio: f64,
    pub active_workers: usize,
    pub pressure: MemoryPressure,
}

/// Viewport state from the view layer.
#[derive(Debug, Clone, Copy)]
pub struct ViewportState {
    pub width: u32,
    pub height: u32,
    pub scroll_offset: f64,
    pub thumbnail_size: u32,
}

/// Cleanup hook registered with the accountant on behalf of the thumbnail
/// cache. Opted in as safely evictable: thumbnails can always be re-decoded
/// from source, so Tier 3 may drop them, but only for tiles that are
/// currently hidden.
struct ThumbnailCacheComponent {
    cache: Arc<CacheStore<TileId, ThumbnailData>>,
    hidden: Arc<RwLock<HashSet<TileId>>>,
}

impl MaintenanceCleanup for ThumbnailCacheComponent {
    fn component_name(&self) -> &str {
        "thumbnail-cache"
    }

    fn memory_usage_bytes(&self) -> usize {
        self.cache.stats().size_bytes
    }

    fn maintenance_cleanup(&self) -> Result<usize, GalleryError> {
        let before = self.cache.stats().size_bytes;
        self.cache.check_memory_pressure()?;
        Ok(before.saturating_sub(self.cache.stats().size_bytes))
    }

    fn shed_caches(&self) -> Result<usize, GalleryError> {
        let before = self.cache.stats().size_bytes;
        self.cache.shed(0.5);
        Ok(before.saturating_sub(self.cache.stats().size_bytes))
    }

    fn safely_evictable(&self) -> bool {
        true
    }

    fn forced_evict(&self) -> Result<usize, GalleryError> {
        let before = self.cache.stats().size_bytes;
        let hidden = self.hidden.read();
        for id in hidden.iter() {
            self.cache.remove(id);
        }
        Ok(before.saturating_sub(self.cache.stats().size_bytes))
    }
}

/// Coordinator configuration beyond the shared [`ResourceLimits`].
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub geometry: GeometryConfig,
    pub scheduler: SchedulerConfig,
    /// Thumbnail cache budget in megabytes.
    pub thumbnail_cache_mb: usize,
    pub batch_max: usize,
    pub batch_debounce: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            geometry: GeometryConfig::default(),
            scheduler: SchedulerConfig::default(),
            thumbnail_cache_mb: 256,
            batch_max: 32,
            batch_debounce: Duration::from_millis(50),
        }
    }
}

/// Owns all tile state and composes the generic subsystems. Single-writer:
/// lives on the UI thread, mutated only there.
pub struct GalleryCoordinator {
    config: CoordinatorConfig,
    accountant: Arc<ResourceAccountant>,
    geometry: GeometryCache,
    thumbnails: Arc<CacheStore<TileId, ThumbnailData>>,
    scheduler: TaskScheduler,
    batcher: BatchUpdater,
    items: Vec<ItemRecord>,
    /// Tile id of each item, parallel to `items`.
    item_ids: Vec<TileId>,
    tiles: HashMap<TileId, TileHandle>,
    /// Shared with the accountant's cleanup hook; tiles outside the
    /// buffered range.
    hidden: Arc<RwLock<HashSet<TileId>>>,
}

impl GalleryCoordinator {
    pub fn new(accountant: Arc<ResourceAccountant>, mut config: CoordinatorConfig) -> Self {
        // The bounded worker pool follows the accountant's limits.
        config.scheduler.worker_threads = accountant.limits().max_concurrent_workers;
        let thumbnails = Arc::new(CacheStore::new(CacheConfig::new(
            "thumbnails",
            0,
            config.thumbnail_cache_mb,
        )));
        let hidden = Arc::new(RwLock::new(HashSet::new()));

        accountant.register_component(Arc::new(ThumbnailCacheComponent {
            cache: Arc::clone(&thumbnails),
            hidden: Arc::clone(&hidden),
        }));

        Self {
            geometry: GeometryCache::new(config.geometry.clone()),
            scheduler: TaskScheduler::new(config.scheduler.clone()),
            batcher: BatchUpdater::new(config.batch_max, config.batch_debounce),
            thumbnails,
            hidden,
            accountant,
            config,
            items: Vec::new(),
            item_ids: Vec::new(),
            tiles: HashMap::new(),
        }
    }

    /// Replace the item list. Tiles whose items left the data set are
    /// disposed; surviving tiles keep their state.
    pub fn set_items(&mut self, items: Vec<ItemRecord>) {
        let new_ids: Vec<TileId> = items.iter().map(ItemRecord::tile_id).collect();
        let keep: HashSet<TileId> = new_ids.iter().copied().collect();

        let departed: Vec<TileId> = self
            .tiles
            .keys()
            .filter(|id| !keep.contains(id))
            .copied()
            .collect();
        for id in departed {
            self.dispose(id);
        }

        info!(items = items.len(), tiles = self.tiles.len(), "item list replaced");
        self.items = items;
        self.item_ids = new_ids;
    }

    pub fn item_count(&self) -> usize {
        self.items.len()
    }

    /// Recompute layout and visibility for the current viewport.
    ///
    /// Flips Visible tiles that left the buffered range to Hidden and
    /// Hidden tiles that re-entered back to Visible; never disposes from
    /// scrolling alone. Returns the range, the layout, and one
    /// geometry/state entry per item in range for the paint step.
    pub fn update_viewport(&mut self, viewport: ViewportState) -> ViewUpdate {
        let layout = self.geometry.layout_params(
            viewport.width,
            viewport.height,
            viewport.thumbnail_size,
        );
        let range = self.geometry.visible_range(
            &layout,
            viewport.scroll_offset,
            viewport.height,
            self.items.len(),
            self.geometry.config().buffer_multiplier,
        );

        {
            let mut hidden = self.hidden.write();
            for (idx, id) in self.item_ids.iter().enumerate() {
                let Some(tile) = self.tiles.get_mut(id) else {
                    continue;
                };
                if range.contains(idx) {
                    if tile.state == TileState::Hidden && tile.set_state(TileState::Visible) {
                        hidden.remove(id);
                    }
                } else if tile.state == TileState::Visible && tile.set_state(TileState::Hidden) {
                    hidden.insert(*id);
                }
                tile.origin = layout.origin_of(idx);
            }
        }

        let tiles = (range.start_index..range.end_index)
            .map(|idx| {
                let id = self.item_ids[idx];
                let state = self
                    .tiles
                    .get(&id)
                    .map_or(TileState::NotCreated, TileHandle::state);
                TileView {
                    index: idx,
                    id,
                    origin: layout.origin_of(idx),
                    state,
                }
            })
            .collect();

        ViewUpdate {
            layout,
            range,
            tiles,
        }
    }

    /// Create handles for every not-yet-created item in `range`, positions
    /// computed in one pass against `layout`.
    ///
    /// Stops early when memory pressure turns Critical mid-batch and
    /// reports the partial result; a refused registration is recorded as an
    /// error for that item and the batch continues.
    pub fn create_tiles_batch(&mut self, range: &VisibleRange, layout: &LayoutParams) -> BatchResult {
        let mut result = BatchResult::default();
        let end = range.end_index.min(self.items.len());

        for idx in range.start_index..end {
            if self.accountant.pressure() == MemoryPressure::Critical {
                // Only count work actually abandoned, not tiles that
                // already exist.
                result.skipped = (idx..end)
                    .filter(|i| !self.tiles.contains_key(&self.item_ids[*i]))
                    .count();
                warn!(
                    created = result.created,
                    skipped = result.skipped,
                    "batch creation stopped at critical pressure"
                );
                break;
            }

            let item = &self.items[idx];
            let id = self.item_ids[idx];
            if self.tiles.contains_key(&id) {
                continue;
            }

            let payload: Arc<dyn Any + Send + Sync> = Arc::new(TilePayload {
                item_key: item.key.clone(),
            });
            let estimated =
                (layout.thumbnail_size as usize).pow(2) * 4;
            if !self
                .accountant
                .register_tile(id, &payload, estimated, false)
            {
                result.errors.push(GalleryError::ResourceExhausted {
                    resource: "tiles",
                    current: self.accountant.tile_count(),
                    limit: self.accountant.limits().max_tiles,
                });
                continue;
            }

            self.tiles.insert(
                id,
                TileHandle {
                    id,
                    item_key: item.key.clone(),
                    size_class: layout.thumbnail_size,
                    state: TileState::Created,
                    origin: layout.origin_of(idx),
                    pending_tasks: Vec::new(),
                    payload,
                },
            );
            result.created += 1;
        }

        debug!(
            created = result.created,
            skipped = result.skipped,
            errors = result.errors.len(),
            "tile batch"
        );
        result
    }

    /// Store a decoded thumbnail and advance the tile to Visible.
    pub fn apply_thumbnail(&mut self, id: TileId, thumbnail: ThumbnailData) -> GalleryResult<()> {
        let Some(tile) = self.tiles.get_mut(&id) else {
            return Err(GalleryError::TaskFailed {
                task_id: 0,
                detail: format!("thumbnail for unknown tile {}", id.0),
            });
        };

        self.thumbnails.put(id, thumbnail, None);
        if tile.state == TileState::Created {
            tile.set_state(TileState::Visible);
        }
        Ok(())
    }

    /// Cached thumbnail for a tile, if still resident.
    pub fn thumbnail(&self, id: TileId) -> Option<ThumbnailData> {
        self.thumbnails.get(&id)
    }

    /// Record a scheduler task as belonging to a tile so disposal can
    /// cancel it.
    pub fn track_task(&mut self, id: TileId, task_id: u64) {
        if let Some(tile) = self.tiles.get_mut(&id) {
            tile.pending_tasks.push(task_id);
        }
    }

    pub fn tile_state(&self, id: TileId) -> TileState {
        self.tiles
            .get(&id)
            .map_or(TileState::NotCreated, TileHandle::state)
    }

    pub fn tile(&self, id: TileId) -> Option<&TileHandle> {
        self.tiles.get(&id)
    }

    pub fn tile_count(&self) -> usize {
        self.tiles.len()
    }

    /// Dispose one tile: unregister from the accountant, cancel its pending
    /// tasks, release its cache entry, then drop the handle.
    pub fn dispose(&mut self, id: TileId) {
        let Some(mut tile) = self.tiles.remove(&id) else {
            return;
        };
        tile.set_state(TileState::Disposed);

        self.scheduler.cancel_all(tile.pending_tasks.drain(..));
        self.thumbnails.remove(&id);
        self.hidden.write().remove(&id);
        self.accountant.unregister_tile(id);
        // Payload arc drops with the handle; the accountant's weak goes
        // dead and is pruned on its next cleanup pass.
        drop(tile);
    }

    /// Bulk clear: dispose every tile and drop all cached layouts and
    /// thumbnails.
    pub fn clear(&mut self) {
        let ids: Vec<TileId> = self.tiles.keys().copied().collect();
        for id in ids {
            self.dispose(id);
        }
        self.thumbnails.clear();
        self.geometry.invalidate();
        self.items.clear();
        self.item_ids.clear();
        info!("gallery cleared");
    }

    /// Cooperative slice: refresh memory pressure, propagate it to the
    /// scheduler and batcher, run the accountant's regular cleanup cycle,
    /// flush due batches, and drain ready tasks. Driven by an external
    /// periodic trigger.
    pub fn tick(&self) {
        if let Some(pressure) = self.accountant.maybe_check_memory() {
            self.scheduler.set_pressure(pressure);
            self.batcher.set_pressure(pressure);
            if pressure == MemoryPressure::Critical {
                self.accountant.perform_emergency_cleanup();
            }
        }
        // Rate-limited internally by cleanup_interval_secs; prunes dead
        // weaks and runs component maintenance hooks, including the
        // thumbnail cache's proactive pressure check.
        self.accountant.perform_cleanup(false);
        self.batcher.maybe_flush();
        self.scheduler.tick();
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &TaskScheduler {
        &self.scheduler
    }

    pub fn batcher(&self) -> &BatchUpdater {
        &self.batcher
    }

    pub fn accountant(&self) -> &Arc<ResourceAccountant> {
        &self.accountant
    }

    /// Telemetry snapshot for the debug overlay.
    pub fn telemetry(&self) -> Telemetry {
        let cache_stats = self.thumbnails.stats();
        Telemetry {
            memory_usage_mb: self.accountant.memory_usage_mb(),
            tile_count: self.tiles.len(),
            cache_hit_ratio: cache_stats.hit_ratio(),
            active_workers: self.scheduler.metrics().active,
            pressure: self.accountant.pressure(),
        }
    }
}
