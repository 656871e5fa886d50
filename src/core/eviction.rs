//! Deferred-eviction ring.
//!
//! A tile whose refcount reaches zero may still be referenced by a GPU frame
//! already queued for execution, so unmapping is withheld for F = swap
//! buffers + 1 frames. New candidates enter bucket 0; the last bucket is
//! eligible for unmapping; `next_frame` rotates once per rendered frame.

use crate::core::mapping_state::TileMappingState;
use crate::core::tile::TileCoord;

#[derive(Debug)]
pub struct EvictionDelay {
    buckets: Vec<Vec<TileCoord>>,
}

impl EvictionDelay {
    /// `depth` = swap buffer count + 1
    pub fn new(depth: usize) -> Self {
        assert!(depth >= 1);
        Self {
            buckets: vec![Vec::new(); depth],
        }
    }

    /// Queue a coord for eviction, eligible no earlier than depth - 1 frames
    /// from now
    pub fn append(&mut self, c: TileCoord) {
        self.buckets[0].push(c);
    }

    /// The bucket eligible for unmapping this frame. Callers consume and
    /// retain in place.
    pub fn ready_to_evict(&mut self) -> &mut Vec<TileCoord> {
        self.buckets.last_mut().unwrap()
    }

    /// Rotate one frame: the eligible bucket keeps whatever was delayed and
    /// absorbs the next-oldest; bucket 0 starts empty.
    pub fn next_frame(&mut self) {
        let last = self.buckets.len() - 1;
        for i in (1..=last).rev() {
            self.buckets.swap(i, i - 1);
        }
        let mut newest = std::mem::take(&mut self.buckets[0]);
        self.buckets[last].append(&mut newest);
    }

    /// Drop, from every bucket, coords whose refcount went positive again.
    /// Even the newest bucket can hold rescued tiles: a tile can be evicted
    /// and re-requested within one feedback pass.
    pub fn rescue(&mut self, state: &TileMappingState) {
        for bucket in self.buckets.iter_mut() {
            bucket.retain(|&c| state.refcount(c) == 0);
        }
    }

    pub fn clear(&mut self) {
        for bucket in self.buckets.iter_mut() {
            bucket.clear();
        }
    }

    /// Total coords across all buckets
    pub fn len(&self) -> usize {
        self.buckets.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether any bucket holds `c`
    pub fn contains(&self, c: TileCoord) -> bool {
        self.buckets.iter().any(|b| b.contains(&c))
    }
}
