//! Batched unit of mapping + copy work.
//!
//! An UpdateList moves through a fixed state graph:
//!
//! ```text
//! Free -> Allocated -> Submitted -> {Uploading | PackedMapping}
//!      -> CopyPending -> Free
//! ```
//!
//! The state is a single atomic; each outgoing edge has exactly one producer
//! thread (feedback pass allocates and submits, submit worker maps, monitor
//! worker completes), so no two threads ever race on the same transition.
//! The payload mutex is uncontended under that protocol; it exists so the
//! contents can cross threads safely.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::core::backend::{FenceValue, StreamTicket};
use crate::core::residency::StreamingResource;
use crate::core::tile::TileCoord;

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateListState {
    Free = 0,
    Allocated = 1,
    Submitted = 2,
    Uploading = 3,
    PackedMapping = 4,
    CopyPending = 5,
}

impl UpdateListState {
    fn from_u32(v: u32) -> Self {
        match v {
            0 => UpdateListState::Free,
            1 => UpdateListState::Allocated,
            2 => UpdateListState::Submitted,
            3 => UpdateListState::Uploading,
            4 => UpdateListState::PackedMapping,
            _ => UpdateListState::CopyPending,
        }
    }
}

/// Work carried by one UpdateList
#[derive(Default)]
pub struct UpdatePayload {
    /// Resource all coords belong to
    pub resource: Option<Arc<StreamingResource>>,
    /// Tiles to map and copy, paired with `load_heap_indices`
    pub loads: Vec<TileCoord>,
    pub load_heap_indices: Vec<u32>,
    /// Tiles to unmap
    pub evicts: Vec<TileCoord>,
    /// Nonempty marks a packed-mip bootstrap request
    pub packed_heap_indices: Vec<u32>,
    /// Mapping-backend fence recorded at submit time
    pub mapping_fence: FenceValue,
    /// Streamer ticket for the copy batch, once issued
    pub copy_ticket: Option<StreamTicket>,
}

impl UpdatePayload {
    pub fn has_loads(&self) -> bool {
        !self.loads.is_empty()
    }

    pub fn has_evictions(&self) -> bool {
        !self.evicts.is_empty()
    }

    pub fn is_packed(&self) -> bool {
        !self.packed_heap_indices.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        !self.has_loads() && !self.has_evictions() && !self.is_packed()
    }

    fn reset(&mut self, resource: Arc<StreamingResource>) {
        self.resource = Some(resource);
        self.loads.clear();
        self.load_heap_indices.clear();
        self.evicts.clear();
        self.packed_heap_indices.clear();
        self.mapping_fence = 0;
        self.copy_ticket = None;
    }
}

/// One pool slot
#[derive(Default)]
pub struct UpdateList {
    state: AtomicU32,
    payload: Mutex<UpdatePayload>,
}

impl UpdateList {
    pub fn state(&self) -> UpdateListState {
        UpdateListState::from_u32(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: UpdateListState) {
        self.state.store(state as u32, Ordering::Release);
    }

    /// CAS Free -> Allocated; contents are reset only by the winning thread
    pub fn try_acquire(&self, resource: Arc<StreamingResource>) -> bool {
        let won = self
            .state
            .compare_exchange(
                UpdateListState::Free as u32,
                UpdateListState::Allocated as u32,
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_ok();
        if won {
            self.payload.lock().unwrap().reset(resource);
        }
        won
    }

    pub fn payload(&self) -> MutexGuard<'_, UpdatePayload> {
        self.payload.lock().unwrap()
    }
}
