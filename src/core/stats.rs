//! Streaming metrics.
//!
//! Lock-free counters updated at notification time. The global tracker is
//! observability-only; no engine decision reads it.

use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::core::tile::TILE_PAGE_BYTES;

/// Snapshot of streaming activity
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamingMetrics {
    /// Tile copies completed since startup
    pub total_uploads: u64,
    /// Tile unmaps completed since startup
    pub total_evictions: u64,
    /// Currently resident standard tiles
    pub resident_tiles: u64,
    /// Heap bytes held by resident standard tiles
    pub resident_bytes: u64,
}

/// Central registry of streaming counters
#[derive(Debug, Default)]
pub struct StreamingTracker {
    total_uploads: AtomicU64,
    total_evictions: AtomicU64,
    resident_tiles: AtomicU64,
}

impl StreamingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_uploads(&self, count: u64) {
        self.total_uploads.fetch_add(count, Ordering::Relaxed);
        self.resident_tiles.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_evictions(&self, count: u64) {
        self.total_evictions.fetch_add(count, Ordering::Relaxed);
        self.resident_tiles.fetch_sub(count, Ordering::Relaxed);
    }

    pub fn clear_resident_tiles(&self) {
        self.resident_tiles.store(0, Ordering::Relaxed);
    }

    pub fn metrics(&self) -> StreamingMetrics {
        let resident = self.resident_tiles.load(Ordering::Relaxed);
        StreamingMetrics {
            total_uploads: self.total_uploads.load(Ordering::Relaxed),
            total_evictions: self.total_evictions.load(Ordering::Relaxed),
            resident_tiles: resident,
            resident_bytes: resident * TILE_PAGE_BYTES as u64,
        }
    }
}

static GLOBAL_TRACKER: Lazy<StreamingTracker> = Lazy::new(StreamingTracker::new);

/// Process-wide tracker shared by all managers
pub fn global_tracker() -> &'static StreamingTracker {
    &GLOBAL_TRACKER
}
