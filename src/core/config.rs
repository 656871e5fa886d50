//! Engine configuration.

use serde::{Deserialize, Serialize};

use crate::error::{StreamError, StreamResult};

/// Tunables for the residency engine. Defaults match a double-buffered
/// renderer with a 256 MiB tile heap.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Render swap-buffer count; also sizes the per-resource feedback ring
    pub swap_buffers: usize,
    /// UpdateList pool capacity
    pub max_copy_batches: usize,
    /// Maximum tile copies placed on one UpdateList
    pub max_tile_copies_per_batch: usize,
    /// Upper bound on concurrently streaming tiles
    pub max_tiles_in_flight: usize,
    /// Mapping-update batch limit per backend call
    pub max_tile_mapping_updates_per_api_call: usize,
    /// Heap capacity in 64 KiB pages
    pub heap_pages: usize,
    /// Start the min-mip walk from the coarsest fully-resident mip instead
    /// of M. Off by default: the shortcut can publish stale coarse levels on
    /// corner cases.
    pub min_resident_mip_heuristic: bool,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            swap_buffers: 2,
            max_copy_batches: 128,
            max_tile_copies_per_batch: 32,
            max_tiles_in_flight: 512,
            max_tile_mapping_updates_per_api_call: 4096,
            heap_pages: 4096,
            min_resident_mip_heuristic: false,
        }
    }
}

impl StreamConfig {
    /// Frames a zero-refcount tile is withheld from unmapping
    pub fn eviction_delay_depth(&self) -> usize {
        self.swap_buffers + 1
    }

    pub fn validate(&self) -> StreamResult<()> {
        if self.swap_buffers == 0 {
            return Err(StreamError::config("swap_buffers must be nonzero"));
        }
        if self.heap_pages == 0 {
            return Err(StreamError::config("heap_pages must be nonzero"));
        }
        if self.max_copy_batches == 0 || self.max_tile_copies_per_batch == 0 {
            return Err(StreamError::config("UpdateList pool and batch size must be nonzero"));
        }
        if self.max_tiles_in_flight < self.max_tile_copies_per_batch {
            // a full UpdateList could otherwise never complete
            return Err(StreamError::config(
                "max_tiles_in_flight must cover at least one full batch",
            ));
        }
        Ok(())
    }
}
