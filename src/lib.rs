//! Gallery Core - Resource and cache management for a virtual-scrolling
//! tile gallery.
//!
//! This crate provides:
//! - Memoized grid layout and visible-range calculation
//! - Generic bounded cache with pluggable eviction (LRU / LFU / TTL / Adaptive)
//! - Process-wide resource accounting with tiered emergency cleanup
//! - Priority-ordered cooperative task scheduling with pressure throttling
//! - A coordinator that composes the above into tile lifecycle decisions
//!
//! The coordinator is the only component that knows tiles as a domain
//! concept; everything beneath it is generic and reusable. Rendering flows
//! one way (items + viewport in, geometry + lifecycle state out) and
//! telemetry flows one way back (usage statistics in, pressure signals
//! out).

pub mod cache;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod geometry;
pub mod resources;
pub mod scheduler;
pub mod thumbnail;
#[cfg(test)]
pub(crate) mod test_utils;

pub use cache::{CacheConfig, CacheStats, CacheStore, CacheValue, EvictionPolicy};
pub use config::{MemoryPressure, ResourceLimits};
pub use coordinator::{
    BatchResult, CoordinatorConfig, GalleryCoordinator, ItemRecord, Telemetry, TileHandle,
    TileState, TileView, ViewUpdate, ViewportState,
};
pub use error::{GalleryError, GalleryResult};
pub use geometry::{GeometryCache, GeometryConfig, LayoutParams, VisibleRange};
pub use resources::{CleanupReport, MaintenanceCleanup, ResourceAccountant, Snapshot, TileId};
pub use scheduler::{
    BatchUpdater, CancelToken, SchedulerConfig, SchedulerMetrics, TaskPriority, TaskScheduler,
    TickReport, UiTask,
};
pub use thumbnail::ThumbnailData;
