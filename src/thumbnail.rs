//! Decoded thumbnail pixel data.
//!
//! Pixel buffers are held as `bytes::Bytes` so clones out of the cache are
//! O(1) reference bumps, never pixel copies. The cache is the only long-term
//! owner; everything else holds short-lived clones.

use bytes::Bytes;

use crate::cache::CacheValue;

/// Decoded RGB thumbnail data.
#[derive(Debug, Clone)]
pub struct ThumbnailData {
    /// Raw RGB pixel data.
    pub data: Bytes,
    /// Thumbnail width in pixels.
    pub width: u32,
    /// Thumbnail height in pixels.
    pub height: u32,
}

impl ThumbnailData {
    /// Create new thumbnail data from an owned pixel buffer.
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Self {
        Self {
            data: Bytes::from(data),
            width,
            height,
        }
    }

    /// Size in bytes (used for cache weighting).
    pub fn size_bytes(&self) -> usize {
        self.data.len()
    }
}

impl CacheValue for ThumbnailData {
    fn size_bytes(&self) -> usize {
        self.data.len()
    }
}
