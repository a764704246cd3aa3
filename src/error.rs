//! Error types for gallery_core.

use thiserror::Error;

/// Error types for tile, cache, and scheduler operations.
///
/// Refusals that callers handle as routine conditions (a full tile budget,
/// a full task queue) are reported as `bool`/`Option` returns at the call
/// site, not as errors. These variants cover the cases that flow through
/// task callbacks and cleanup reports.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GalleryError {
    #[error("Resource exhausted: {resource} at {current}/{limit}")]
    ResourceExhausted {
        resource: &'static str,
        current: usize,
        limit: usize,
    },

    #[error("Task {task_id} timed out after {timeout_ms}ms")]
    TaskTimeout { task_id: u64, timeout_ms: u64 },

    #[error("Task {task_id} cancelled")]
    TaskCancelled { task_id: u64 },

    #[error("Cache '{cache}' corrupted: {detail}")]
    CacheCorruption { cache: String, detail: String },

    #[error("Invalid configuration for {field}: {value} (corrected to {corrected})")]
    ConfigurationInvalid {
        field: &'static str,
        value: String,
        corrected: String,
    },

    #[error("Task {task_id} failed: {detail}")]
    TaskFailed { task_id: u64, detail: String },
}

impl GalleryError {
    /// Whether the condition clears on its own once load drops.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, GalleryError::CacheCorruption { .. })
    }
}

/// Result type alias for gallery operations.
pub type GalleryResult<T> = Result<T, GalleryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exhaustion_is_recoverable() {
        let err = GalleryError::ResourceExhausted {
            resource: "tiles",
            current: 1001,
            limit: 1000,
        };
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_corruption_is_not_recoverable() {
        let err = GalleryError::CacheCorruption {
            cache: "thumbnails".into(),
            detail: "size underflow".into(),
        };
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_display_includes_context() {
        let err = GalleryError::TaskTimeout {
            task_id: 7,
            timeout_ms: 250,
        };
        let msg = err.to_string();
        assert!(msg.contains('7'));
        assert!(msg.contains("250"));
    }
}
