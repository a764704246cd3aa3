//! Grid layout computation and visible-range derivation for virtual
//! scrolling.
//!
//! Layout parameters are memoized by `(viewport_w, viewport_h,
//! thumbnail_size)` with a short TTL, so scroll events hit the cached
//! layout instead of redoing the division every frame. The memo map is its
//! own tiny LRU, deliberately independent of [`crate::cache::CacheStore`]
//! (the cache depends on geometry decisions upstream, not the other way
//! around).

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Tunables for grid layout math.
#[derive(Debug, Clone)]
pub struct GeometryConfig {
    /// Gap between adjacent cells in pixels.
    pub spacing: u32,
    /// Horizontal room reserved for the label column beside each thumbnail.
    pub text_margin: u32,
    /// Vertical room reserved for the caption under each thumbnail.
    pub caption_height: u32,
    /// Extra rows of buffering above and below the viewport, as a multiple
    /// of viewport height.
    pub buffer_multiplier: f64,
    /// How long a memoized layout stays valid.
    pub layout_ttl: Duration,
    /// Cap on memoized layouts (LRU beyond this).
    pub max_cached_layouts: usize,
}

impl Default for GeometryConfig {
    fn default() -> Self {
        Self {
            spacing: 10,
            text_margin: 40,
            caption_height: 40,
            buffer_multiplier: 1.0,
            layout_ttl: Duration::from_secs(5),
            max_cached_layouts: 8,
        }
    }
}

/// Computed grid layout for one viewport/thumbnail-size combination.
///
/// Immutable once produced; recomputed when any key component changes or
/// the TTL expires.
#[derive(Debug, Clone, Copy)]
pub struct LayoutParams {
    /// Viewport width the layout was computed for.
    pub container_width: u32,
    /// Number of columns that fit, always at least 1.
    pub column_count: u32,
    /// Horizontal distance between cell origins.
    pub cell_width_stride: u32,
    /// Vertical distance between row origins.
    pub cell_height_stride: u32,
    /// Thumbnail edge length in pixels.
    pub thumbnail_size: u32,
    /// When the layout was computed (drives TTL expiry).
    pub computed_at: Instant,
}

impl LayoutParams {
    /// Row index of an item under this layout.
    pub fn row_of(&self, index: usize) -> u32 {
        index as u32 / self.column_count
    }

    /// Pixel origin of an item's cell, `(x, y)` from the grid's top-left.
    pub fn origin_of(&self, index: usize) -> (u32, u32) {
        let col = index as u32 % self.column_count;
        let row = index as u32 / self.column_count;
        (col * self.cell_width_stride, row * self.cell_height_stride)
    }

    /// Total rows needed for `total_items` items.
    pub fn total_rows(&self, total_items: usize) -> u32 {
        (total_items as u32).div_ceil(self.column_count)
    }
}

/// Span of item indices within or near the viewport.
///
/// Invariant: `start_index <= end_index <= total_items`, with `end_index`
/// exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VisibleRange {
    pub start_index: usize,
    pub end_index: usize,
    pub start_row: u32,
    /// Exclusive end row.
    pub end_row: u32,
    /// Pixels of buffering applied above and below the viewport.
    pub buffer_px: u32,
}

impl VisibleRange {
    /// Whether an item index falls inside the buffered range.
    pub fn contains(&self, index: usize) -> bool {
        index >= self.start_index && index < self.end_index
    }

    /// Number of items in the range.
    pub fn len(&self) -> usize {
        self.end_index - self.start_index
    }

    pub fn is_empty(&self) -> bool {
        self.start_index == self.end_index
    }
}

type LayoutKey = (u32, u32, u32);

/// Memoizing layout calculator.
///
/// All reads and writes go through one mutex; hold times are a map lookup.
pub struct GeometryCache {
    config: GeometryConfig,
    layouts: Mutex<LayoutMap>,
}

#[derive(Default)]
struct LayoutMap {
    entries: HashMap<LayoutKey, LayoutParams>,
    // Front = least recently used.
    order: VecDeque<LayoutKey>,
}

impl GeometryCache {
    pub fn new(config: GeometryConfig) -> Self {
        Self {
            config,
            layouts: Mutex::new(LayoutMap::default()),
        }
    }

    pub fn config(&self) -> &GeometryConfig {
        &self.config
    }

    /// Get layout parameters for a viewport, computing on miss or expiry.
    pub fn layout_params(
        &self,
        viewport_width: u32,
        viewport_height: u32,
        thumbnail_size: u32,
    ) -> LayoutParams {
        let key = (viewport_width, viewport_height, thumbnail_size);
        let mut map = self.layouts.lock();

        if let Some(layout) = map.entries.get(&key).copied() {
            if layout.computed_at.elapsed() < self.config.layout_ttl {
                touch(&mut map.order, key);
                return layout;
            }
            map.entries.remove(&key);
            if let Some(pos) = map.order.iter().position(|k| *k == key) {
                map.order.remove(pos);
            }
        }

        let layout = self.compute_layout(viewport_width, thumbnail_size);
        map.entries.insert(key, layout);
        map.order.push_back(key);

        while map.entries.len() > self.config.max_cached_layouts {
            if let Some(oldest) = map.order.pop_front() {
                map.entries.remove(&oldest);
            } else {
                break;
            }
        }

        layout
    }

    fn compute_layout(&self, container_width: u32, thumbnail_size: u32) -> LayoutParams {
        let width_stride = thumbnail_size + self.config.spacing + self.config.text_margin;
        let height_stride = thumbnail_size + self.config.spacing + self.config.caption_height;
        let column_count = (container_width / width_stride.max(1)).max(1);

        LayoutParams {
            container_width,
            column_count,
            cell_width_stride: width_stride,
            cell_height_stride: height_stride,
            thumbnail_size,
            computed_at: Instant::now(),
        }
    }

    /// Derive the buffered visible item range for a scroll position.
    ///
    /// Buffers the viewport by `viewport_height * buffer_multiplier` pixels
    /// on both sides, converts pixels to rows with floor/ceil against the
    /// row stride, then rows to item indices via `row * column_count`,
    /// clamped to `total_items`.
    pub fn visible_range(
        &self,
        layout: &LayoutParams,
        scroll_offset: f64,
        viewport_height: u32,
        total_items: usize,
        buffer_multiplier: f64,
    ) -> VisibleRange {
        let buffer_px = (viewport_height as f64 * buffer_multiplier).round() as u32;
        let stride = layout.cell_height_stride.max(1) as f64;

        let top = (scroll_offset - buffer_px as f64).max(0.0);
        let bottom = scroll_offset + viewport_height as f64 + buffer_px as f64;

        let total_rows = layout.total_rows(total_items);
        let start_row = ((top / stride).floor() as u32).min(total_rows);
        let end_row = ((bottom / stride).ceil() as u32).min(total_rows);

        let start_index = ((start_row * layout.column_count) as usize).min(total_items);
        let end_index = ((end_row * layout.column_count) as usize).min(total_items);

        VisibleRange {
            start_index,
            end_index: end_index.max(start_index),
            start_row,
            end_row,
            buffer_px,
        }
    }

    /// Drop all memoized layouts.
    pub fn invalidate(&self) {
        let mut map = self.layouts.lock();
        map.entries.clear();
        map.order.clear();
    }

    #[cfg(test)]
    fn cached_layouts(&self) -> usize {
        self.layouts.lock().entries.len()
    }
}

impl Default for GeometryCache {
    fn default() -> Self {
        Self::new(GeometryConfig::default())
    }
}

fn touch(order: &mut VecDeque<LayoutKey>, key: LayoutKey) {
    if let Some(pos) = order.iter().position(|k| *k == key) {
        order.remove(pos);
        order.push_back(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_column_count_worked_example() {
        // 1000px viewport, 200px thumbnails, spacing 10 + text margin 40.
        let cache = GeometryCache::default();
        let layout = cache.layout_params(1000, 800, 200);
        assert_eq!(layout.cell_width_stride, 250);
        assert_eq!(layout.column_count, 4);
    }

    #[test]
    fn test_column_count_never_zero() {
        let cache = GeometryCache::default();
        for width in [0, 1, 50, 249] {
            let layout = cache.layout_params(width, 800, 200);
            assert!(layout.column_count >= 1, "width {width}");
        }
        // Huge thumbnails in a tiny viewport still give one column.
        let layout = cache.layout_params(100, 100, 4096);
        assert_eq!(layout.column_count, 1);
    }

    #[test]
    fn test_layout_memoized_within_ttl() {
        let cache = GeometryCache::default();
        let a = cache.layout_params(1000, 800, 200);
        let b = cache.layout_params(1000, 800, 200);
        assert_eq!(a.computed_at, b.computed_at);
    }

    #[test]
    fn test_layout_recomputed_after_ttl() {
        let cache = GeometryCache::new(GeometryConfig {
            layout_ttl: Duration::ZERO,
            ..Default::default()
        });
        let a = cache.layout_params(1000, 800, 200);
        let b = cache.layout_params(1000, 800, 200);
        assert!(b.computed_at >= a.computed_at);
        assert_eq!(cache.cached_layouts(), 1);
    }

    #[test]
    fn test_layout_cache_bounded() {
        let cache = GeometryCache::new(GeometryConfig {
            max_cached_layouts: 3,
            ..Default::default()
        });
        for width in [100, 200, 300, 400, 500] {
            cache.layout_params(width, 800, 50);
        }
        assert_eq!(cache.cached_layouts(), 3);
    }

    #[test]
    fn test_invalidate_clears_layouts() {
        let cache = GeometryCache::default();
        cache.layout_params(1000, 800, 200);
        cache.invalidate();
        assert_eq!(cache.cached_layouts(), 0);
    }

    #[test]
    fn test_visible_range_worked_example() {
        // 1000x800 viewport, 200px thumbs => 4 columns, 250px row stride.
        // 1000 items => 250 rows. Scroll 5000, buffer 800px each side.
        let cache = GeometryCache::default();
        let layout = cache.layout_params(1000, 800, 200);
        let range = cache.visible_range(&layout, 5000.0, 800, 1000, 1.0);

        assert_eq!(range.buffer_px, 800);
        // Buffered span is 4200..6600 px.
        assert_eq!(range.start_row, 16); // floor(4200 / 250)
        assert_eq!(range.end_row, 27); // ceil(6600 / 250)
        assert_eq!(range.start_index, 64);
        assert_eq!(range.end_index, 108);

        // Every row intersecting the buffered span must be covered.
        for index in 0..1000usize {
            let row = layout.row_of(index);
            let row_top = (row * layout.cell_height_stride) as f64;
            let row_bottom = row_top + layout.cell_height_stride as f64;
            if row_bottom > 4200.0 && row_top < 6600.0 {
                assert!(range.contains(index), "item {index} row {row} missing");
            }
        }
    }

    #[test]
    fn test_visible_range_invariants() {
        let cache = GeometryCache::default();
        let layout = cache.layout_params(1000, 800, 200);
        for total in [0usize, 1, 3, 100, 1000] {
            for scroll in [0.0, 17.5, 4999.0, 1_000_000.0] {
                let range = cache.visible_range(&layout, scroll, 800, total, 1.0);
                assert!(range.start_index <= range.end_index);
                assert!(range.end_index <= total);
                assert!(range.start_row <= range.end_row);
            }
        }
    }

    #[test]
    fn test_visible_range_at_top() {
        let cache = GeometryCache::default();
        let layout = cache.layout_params(1000, 800, 200);
        let range = cache.visible_range(&layout, 0.0, 800, 1000, 1.0);
        assert_eq!(range.start_index, 0);
        // 0..1600 px => rows 0..7 (exclusive) => 28 items.
        assert_eq!(range.end_row, 7);
        assert_eq!(range.end_index, 28);
    }

    #[test]
    fn test_visible_range_empty_gallery() {
        let cache = GeometryCache::default();
        let layout = cache.layout_params(1000, 800, 200);
        let range = cache.visible_range(&layout, 0.0, 800, 0, 1.0);
        assert!(range.is_empty());
        assert_eq!(range.end_index, 0);
    }

    #[test]
    fn test_origin_of_follows_grid() {
        let cache = GeometryCache::default();
        let layout = cache.layout_params(1000, 800, 200);
        assert_eq!(layout.origin_of(0), (0, 0));
        assert_eq!(layout.origin_of(3), (750, 0));
        assert_eq!(layout.origin_of(4), (0, 250));
        assert_eq!(layout.origin_of(9), (250, 500));
    }

    #[test]
    fn test_identical_inputs_identical_layout() {
        let cache = GeometryCache::default();
        let a = cache.layout_params(1280, 720, 160);
        let b = cache.layout_params(1280, 720, 160);
        assert_eq!(a.column_count, b.column_count);
        assert_eq!(a.cell_width_stride, b.cell_width_stride);
        assert_eq!(a.cell_height_stride, b.cell_height_stride);
    }
}
