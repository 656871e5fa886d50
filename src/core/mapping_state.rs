//! Per-resource tile bookkeeping: refcount, heap index and residency grids.
//!
//! Four steady states are encoded by residency and refcount together:
//!
//! ```text
//! residency    | refcount | tile state
//! -------------+----------+---------------------------------
//! NotResident  |    0     | quiescent, not mapped
//! NotResident  |    n     | load pending
//! Resident     |    0     | eviction pending
//! Resident     |    n     | in use
//! ```
//!
//! `Loading` and `Evicting` are transient: set by the feedback pass when a
//! tile is placed on an UpdateList, cleared to a terminal state by the
//! completion worker. The heap index is valid iff residency is Resident or
//! Loading.
//!
//! Residency cells are relaxed atomics shared with the completion worker;
//! there is a single writer per cell at any instant because the transient
//! state gates the terminal write. Refcounts and heap indices belong to the
//! feedback pass alone.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use crate::core::heap::{HeapAllocator, INVALID_HEAP_INDEX};
use crate::core::tile::{MipChain, TileCoord};

/// Residency tag of one tile
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Residency {
    NotResident = 0,
    Resident = 1,
    Evicting = 2,
    Loading = 3,
}

impl Residency {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Residency::NotResident,
            1 => Residency::Resident,
            2 => Residency::Evicting,
            _ => Residency::Loading,
        }
    }
}

/// Residency cells for every standard-mip tile, shared between the feedback
/// pass (transient writes) and the completion worker (terminal writes).
#[derive(Debug)]
pub struct ResidencyGrid {
    chain: MipChain,
    cells: Vec<AtomicU8>,
}

impl ResidencyGrid {
    fn new(chain: MipChain) -> Self {
        let cells = (0..chain.len())
            .map(|_| AtomicU8::new(Residency::NotResident as u8))
            .collect();
        Self { chain, cells }
    }

    pub fn chain(&self) -> &MipChain {
        &self.chain
    }

    pub fn get(&self, c: TileCoord) -> Residency {
        Residency::from_u8(self.cells[self.chain.index(c)].load(Ordering::Relaxed))
    }

    pub fn is_resident(&self, c: TileCoord) -> bool {
        self.get(c) == Residency::Resident
    }

    pub fn set(&self, c: TileCoord, r: Residency) {
        self.cells[self.chain.index(c)].store(r as u8, Ordering::Relaxed);
    }
}

/// Refcount / heap-index / residency triple for every standard-mip tile,
/// stored as flat per-mip grids
#[derive(Debug)]
pub struct TileMappingState {
    residency: Arc<ResidencyGrid>,
    refcounts: Vec<u32>,
    heap_indices: Vec<u32>,
}

impl TileMappingState {
    pub fn new(chain: MipChain) -> Self {
        let len = chain.len();
        Self {
            residency: Arc::new(ResidencyGrid::new(chain)),
            refcounts: vec![0; len],
            heap_indices: vec![INVALID_HEAP_INDEX; len],
        }
    }

    pub fn chain(&self) -> &MipChain {
        self.residency.chain()
    }

    /// Shared handle for the completion worker
    pub fn residency_grid(&self) -> Arc<ResidencyGrid> {
        Arc::clone(&self.residency)
    }

    pub fn residency(&self, c: TileCoord) -> Residency {
        self.residency.get(c)
    }

    /// Transient-state writes, feedback pass only
    pub fn set_loading(&self, c: TileCoord) {
        self.residency.set(c, Residency::Loading);
    }

    pub fn set_evicting(&self, c: TileCoord) {
        self.residency.set(c, Residency::Evicting);
    }

    pub fn refcount(&self, c: TileCoord) -> u32 {
        self.refcounts[self.residency.chain().index(c)]
    }

    pub fn refcount_mut(&mut self, c: TileCoord) -> &mut u32 {
        let i = self.residency.chain().index(c);
        &mut self.refcounts[i]
    }

    pub fn heap_index(&self, c: TileCoord) -> u32 {
        self.heap_indices[self.residency.chain().index(c)]
    }

    pub fn heap_index_mut(&mut self, c: TileCoord) -> &mut u32 {
        let i = self.residency.chain().index(c);
        &mut self.heap_indices[i]
    }

    /// Anything referenced at all? Scans only the coarsest standard mip:
    /// every finer reference holds a reference on its coarsest ancestor, so
    /// an all-zero coarsest layer means nothing is referenced anywhere.
    pub fn any_refcount(&self) -> bool {
        let chain = self.residency.chain();
        let coarsest = chain.standard_mips() - 1;
        let w = chain.width(coarsest);
        let h = chain.height(coarsest);
        for y in 0..h {
            for x in 0..w {
                if self.refcount(TileCoord::new(x, y, coarsest)) > 0 {
                    return true;
                }
            }
        }
        false
    }

    /// Coarsest mip whose tiles are all resident, else M. Only examines the
    /// coarsest standard mip, so the result is a starting point for the
    /// min-mip walk, not a guarantee about finer mips.
    pub fn min_resident_mip(&self) -> u32 {
        let chain = self.residency.chain();
        let coarsest = chain.standard_mips() - 1;
        let w = chain.width(coarsest);
        let h = chain.height(coarsest);
        for y in 0..h {
            for x in 0..w {
                if !self.residency.is_resident(TileCoord::new(x, y, coarsest)) {
                    return chain.standard_mips();
                }
            }
        }
        coarsest
    }

    /// Return every valid heap index to the allocator, e.g. on destruction
    pub fn free_heap_allocations(&mut self, heap: &HeapAllocator) {
        let mut returned = Vec::new();
        for index in self.heap_indices.iter_mut() {
            if *index != INVALID_HEAP_INDEX {
                returned.push(*index);
                *index = INVALID_HEAP_INDEX;
            }
        }
        if !returned.is_empty() {
            heap.free_many(&returned);
        }
    }
}
