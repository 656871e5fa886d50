//! Per-resource residency engine.
//!
//! Translates min-mip feedback into refcount adjustments, pending loads and
//! delayed evictions, fills UpdateLists, and regenerates the published
//! min-mip map when residency changes.
//!
//! Rules that keep the state machine race-free:
//!
//! 1. A tile is never evicted while a pending load holds refcount > 0;
//!    pending loads whose refcount drops to 0 are abandoned.
//! 2. A tile is never loaded while an eviction is in flight; pending
//!    evictions whose refcount returns are rescued.
//!
//! Reference adjustments run coarse-to-fine when adding (dependencies are
//! established first) and fine-to-coarse when releasing (a tile is released
//! only after its finer dependents).

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};

use log::{debug, info};

use crate::core::backend::{FenceValue, FileHandle, ResourceHandle};
use crate::core::config::StreamConfig;
use crate::core::eviction::EvictionDelay;
use crate::core::feedback::FeedbackQueue;
use crate::core::heap::{HeapAllocator, INVALID_HEAP_INDEX};
use crate::core::manager::ManagerShared;
use crate::core::mapping_state::{Residency, ResidencyGrid, TileMappingState};
use crate::core::tile::{MipChain, TileCoord};
use crate::core::uploader::DataUploader;

/// Packed-mip bootstrap progress
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PackedMipStatus {
    /// Heap pages not yet reserved
    Uninitialized = 0,
    /// All packed pages reserved, mapping + copy not yet requested
    HeapReserved = 1,
    /// An UpdateList is carrying the packed mapping + copy
    Requested = 2,
    /// Copy complete; renderer must consume the one-shot transition
    NeedsTransition = 3,
    /// Drawable
    Resident = 4,
}

impl PackedMipStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => PackedMipStatus::Uninitialized,
            1 => PackedMipStatus::HeapReserved,
            2 => PackedMipStatus::Requested,
            3 => PackedMipStatus::NeedsTransition,
            _ => PackedMipStatus::Resident,
        }
    }
}

/// Feedback-side state, owned by the feedback pass under one lock
struct ResourceState {
    mapping: TileMappingState,
    /// Coarsest mip wanted per finest-grid region, default M
    tile_references: Vec<u8>,
    /// Last published min-mip map
    min_mip_map: Vec<u8>,
    pending_loads: Vec<TileCoord>,
    pending_evictions: EvictionDelay,
    packed_heap_indices: Vec<u32>,
    /// Evict-all already applied and nothing referenced since
    refcounts_zero: bool,
}

/// One partially-resident texture tracked by the engine
pub struct StreamingResource {
    /// Self-handle for placing this resource on UpdateLists
    weak_self: Weak<StreamingResource>,
    name: String,
    handle: ResourceHandle,
    file: FileHandle,
    width_tiles: u32,
    height_tiles: u32,
    max_mip: u8,
    packed_tile_count: u32,
    residency_offset: usize,
    min_mip_heuristic: bool,
    heap: Arc<HeapAllocator>,
    manager: Arc<ManagerShared>,
    residency_grid: Arc<ResidencyGrid>,
    residency_changed: AtomicBool,
    packed_status: AtomicU8,
    evict_all_requested: AtomicBool,
    state: Mutex<ResourceState>,
    feedback: Mutex<FeedbackQueue>,
}

impl StreamingResource {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        weak_self: Weak<StreamingResource>,
        name: String,
        handle: ResourceHandle,
        file: FileHandle,
        width_tiles: u32,
        height_tiles: u32,
        standard_mips: u32,
        packed_tile_count: u32,
        residency_offset: usize,
        heap: Arc<HeapAllocator>,
        manager: Arc<ManagerShared>,
        config: &StreamConfig,
    ) -> Self {
        assert!(standard_mips > 0, "nothing to stream without standard mips");
        assert!(standard_mips < 32, "mip count exceeds addressable levels");

        let chain = MipChain::from_finest(width_tiles, height_tiles, standard_mips);
        let mapping = TileMappingState::new(chain);
        let residency_grid = mapping.residency_grid();
        let max_mip = standard_mips as u8;
        let region_count = (width_tiles * height_tiles) as usize;

        // no packed footprint: nothing to bootstrap
        let packed_status = if packed_tile_count == 0 {
            PackedMipStatus::Resident
        } else {
            PackedMipStatus::Uninitialized
        };

        Self {
            weak_self,
            name,
            handle,
            file,
            width_tiles,
            height_tiles,
            max_mip,
            packed_tile_count,
            residency_offset,
            min_mip_heuristic: config.min_resident_mip_heuristic,
            heap,
            manager,
            residency_grid,
            residency_changed: AtomicBool::new(false),
            packed_status: AtomicU8::new(packed_status as u8),
            evict_all_requested: AtomicBool::new(false),
            state: Mutex::new(ResourceState {
                mapping,
                tile_references: vec![max_mip; region_count],
                min_mip_map: vec![max_mip; region_count],
                pending_loads: Vec::new(),
                pending_evictions: EvictionDelay::new(config.eviction_delay_depth()),
                packed_heap_indices: Vec::new(),
                refcounts_zero: false,
            }),
            feedback: Mutex::new(FeedbackQueue::new(
                config.swap_buffers,
                width_tiles,
                height_tiles,
                max_mip,
            )),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handle(&self) -> ResourceHandle {
        self.handle
    }

    pub fn file(&self) -> FileHandle {
        self.file
    }

    /// Min-mip map (= feedback region) dimensions
    pub fn width_tiles(&self) -> u32 {
        self.width_tiles
    }

    pub fn height_tiles(&self) -> u32 {
        self.height_tiles
    }

    /// Standard-mip count M; regions referencing only packed mips report M
    pub fn max_mip(&self) -> u8 {
        self.max_mip
    }

    /// Byte offset of this resource's region in the shared residency buffer
    pub fn residency_offset(&self) -> usize {
        self.residency_offset
    }

    // ------------------------------------------------------------------
    // renderer-facing intake
    // ------------------------------------------------------------------

    /// Record a resolved feedback buffer, usable once `render_fence`
    /// completes
    pub fn queue_feedback(&self, resolved: &[u8], render_fence: FenceValue) {
        self.feedback.lock().unwrap().queue(resolved, render_fence);
        self.manager.work_flag.set();
    }

    /// Request eviction of everything except packed mips, e.g. when the
    /// object leaves the scene. Applied by the next feedback pass.
    pub fn evict_all(&self) {
        self.evict_all_requested.store(true, Ordering::Release);
        self.manager.work_flag.set();
    }

    // ------------------------------------------------------------------
    // feedback pass (manager worker)
    // ------------------------------------------------------------------

    /// Translate the newest completed feedback into refcount adjustments,
    /// pending loads and pending evictions
    pub fn process_feedback(&self, frame_fence_completed: FenceValue) {
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        let mut changed = false;

        if self.evict_all_requested.swap(false, Ordering::AcqRel) {
            // already zeroed and nothing referenced since: nothing to do
            if state.refcounts_zero {
                return;
            }
            state.refcounts_zero = true;

            // all prior feedback is irrelevant
            self.feedback.lock().unwrap().clear();

            state.tile_references.fill(self.max_mip);

            // schedule eviction of everything still referenced; no need to
            // walk feedback, just the refcount grids
            let ResourceState {
                mapping,
                pending_loads,
                pending_evictions,
                ..
            } = state;
            let chain = mapping.chain().clone();
            chain.for_each(|c| {
                let refcount = mapping.refcount_mut(c);
                if *refcount > 0 {
                    changed = true;
                    *refcount = 0;
                    pending_evictions.append(c);
                }
            });

            // all refcounts are 0 now
            pending_loads.clear();
            debug!("{}: evict-all queued", self.name);
        } else {
            let mut feedback = self.feedback.lock().unwrap();
            let map = match feedback.take_latest(frame_fence_completed) {
                Some(map) => map,
                None => return,
            };

            let ResourceState {
                mapping,
                tile_references,
                pending_loads,
                pending_evictions,
                ..
            } = state;

            let width = self.width_tiles;
            let height = self.height_tiles;
            for y in 0..height {
                for x in 0..width {
                    // clamp to the tracked mips; packed mips are not tracked
                    let desired = map.get(x, y).min(self.max_mip);
                    let current = tile_references[(y * width + x) as usize];
                    if desired != current {
                        changed = true;
                        set_min_mip(mapping, pending_loads, pending_evictions, current, x, y,
                            desired);
                        tile_references[(y * width + x) as usize] = desired;
                    }
                }
            }
            drop(feedback);

            if changed {
                state.refcounts_zero = false;
            }

            // drop pending loads that lost their references
            abandon_pending(&mut state.pending_loads, &state.mapping);

            // drop pending evictions that are wanted again
            let ResourceState {
                mapping,
                pending_evictions,
                ..
            } = state;
            pending_evictions.rescue(mapping);
        }

        if changed {
            self.set_residency_changed();
        }
    }

    /// Move eligible evictions and as many pending loads as the heap allows
    /// onto UpdateLists. Greedy: keeps allocating lists until pending work or
    /// the pool runs out; an empty list is returned so other resources can
    /// progress.
    pub fn queue_tiles(&self, uploader: &DataUploader) {
        let this = self.weak_self.upgrade().expect("resource used after teardown");
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;

        loop {
            let num_evictions = state.pending_evictions.ready_to_evict().len();
            let num_loads = state.pending_loads.len();
            if !(num_evictions > 0 || (num_loads > 0 && self.heap.num_free() > 0)) {
                break;
            }

            let slot = match uploader.allocate(&this) {
                Some(slot) => slot,
                None => break,
            };
            let list = uploader.list(slot);
            let submit = {
                let mut payload = list.payload();
                // evictions first: a tile entering Evicting must never be
                // observed by the load table as NotResident
                if num_evictions > 0 {
                    queue_pending_evictions(state, &self.heap, &mut payload.evicts);
                }
                if !state.pending_loads.is_empty() && self.heap.num_free() > 0 {
                    let payload = &mut *payload;
                    queue_pending_loads(
                        state,
                        &self.heap,
                        uploader.max_batch(),
                        &mut payload.loads,
                        &mut payload.load_heap_indices,
                    );
                }
                !payload.is_empty()
            };

            if submit {
                uploader.submit(slot);
            } else {
                uploader.discard(slot);
                break;
            }
        }
    }

    // ------------------------------------------------------------------
    // packed-mip bootstrap
    // ------------------------------------------------------------------

    /// Reserve heap pages for the packed footprint and request mapping +
    /// copy. May take several attempts under heap or pool pressure; returns
    /// true once the request has been submitted.
    pub fn init_packed_mips(&self, uploader: &DataUploader) -> bool {
        if self.packed_status() >= PackedMipStatus::Requested {
            return true;
        }

        let this = self.weak_self.upgrade().expect("resource used after teardown");
        let mut state = self.state.lock().unwrap();

        if self.packed_status() < PackedMipStatus::HeapReserved {
            // commit whatever heap space is available, even partially
            while state.packed_heap_indices.len() < self.packed_tile_count as usize {
                let index = self.heap.allocate();
                if index == INVALID_HEAP_INDEX {
                    return false;
                }
                state.packed_heap_indices.push(index);
            }
            self.packed_status
                .store(PackedMipStatus::HeapReserved as u8, Ordering::Release);
        }

        let slot = match uploader.allocate(&this) {
            Some(slot) => slot,
            None => return false,
        };
        {
            let mut payload = uploader.list(slot).payload();
            payload.packed_heap_indices = state.packed_heap_indices.clone();
        }
        uploader.submit(slot);

        self.packed_status
            .store(PackedMipStatus::Requested as u8, Ordering::Release);
        info!("{}: packed mips requested ({} pages)", self.name, self.packed_tile_count);
        true
    }

    pub fn packed_status(&self) -> PackedMipStatus {
        PackedMipStatus::from_u8(self.packed_status.load(Ordering::Acquire))
    }

    /// Safe to draw once the packed footprint is mapped and copied
    pub fn packed_mips_resident(&self) -> bool {
        self.packed_status() >= PackedMipStatus::NeedsTransition
    }

    /// One-shot query for the renderer's resource-state transition; promotes
    /// NeedsTransition to Resident
    pub fn packed_mips_need_transition(&self) -> bool {
        self.packed_status
            .compare_exchange(
                PackedMipStatus::NeedsTransition as u8,
                PackedMipStatus::Resident as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    // ------------------------------------------------------------------
    // completion notifications (fence monitor worker)
    // ------------------------------------------------------------------

    pub(crate) fn notify_loaded(&self, coords: &[TileCoord]) {
        for &c in coords {
            debug_assert_eq!(self.residency_grid.get(c), Residency::Loading);
            self.residency_grid.set(c, Residency::Resident);
        }
        self.set_residency_changed();
    }

    pub(crate) fn notify_evicted(&self, coords: &[TileCoord]) {
        for &c in coords {
            debug_assert_eq!(self.residency_grid.get(c), Residency::Evicting);
            self.residency_grid.set(c, Residency::NotResident);
        }
        self.set_residency_changed();
    }

    pub(crate) fn notify_packed_mips(&self) {
        self.packed_status
            .store(PackedMipStatus::NeedsTransition as u8, Ordering::Release);
        self.set_residency_changed();
    }

    fn set_residency_changed(&self) {
        self.residency_changed.store(true, Ordering::Release);
        self.manager.residency_changed.store(true, Ordering::Release);
        self.manager.work_flag.set();
    }

    // ------------------------------------------------------------------
    // end of frame
    // ------------------------------------------------------------------

    /// Rotate the eviction-delay ring, once per rendered frame
    pub fn next_frame(&self) {
        self.state.lock().unwrap().pending_evictions.next_frame();
    }

    /// Regenerate and publish the min-mip map if residency changed since the
    /// last call. The map may temporarily report finer levels than feedback
    /// requires; evictions correct it on a later pass. It never reports a
    /// level with a non-resident tile in its chain.
    pub fn update_min_mip_map(&self) {
        // the swap forms the happens-before edge with the notify routines;
        // notifications can arrive out of order, which is why the map is
        // rebuilt from residency rather than patched incrementally
        if !self.residency_changed.swap(false, Ordering::AcqRel) {
            return;
        }

        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;

        if state.mapping.any_refcount() {
            let floor = if self.min_mip_heuristic {
                state.mapping.min_resident_mip() as u8
            } else {
                self.max_mip
            };

            let width = self.width_tiles;
            let mut index = 0usize;
            for y in 0..self.height_tiles {
                for x in 0..width {
                    // resume from the previous published level; tiles with
                    // refcounts may still have copies in flight, so walk
                    // residency rather than tile_references
                    let mut s = floor.max(state.min_mip_map[index]);
                    let mut min_mip = s;
                    while s > 0 {
                        s -= 1;
                        let c = TileCoord::new(x >> s, y >> s, s as u32);
                        if state.mapping.residency(c) == Residency::Resident {
                            min_mip = s;
                        } else {
                            break;
                        }
                    }
                    state.min_mip_map[index] = min_mip;
                    index += 1;
                }
            }
        } else {
            // nothing referenced: only packed mips are sampleable
            state.min_mip_map.fill(self.max_mip);
        }

        let mut shared_map = self.manager.residency_map.lock().unwrap();
        let end = self.residency_offset + state.min_mip_map.len();
        shared_map[self.residency_offset..end].copy_from_slice(&state.min_mip_map);
    }

    // ------------------------------------------------------------------
    // teardown
    // ------------------------------------------------------------------

    /// Return every heap page and drop all queued work. Only called after
    /// the pipeline has drained.
    pub(crate) fn release_allocations(&self) {
        let mut state = self.state.lock().unwrap();
        state.mapping.free_heap_allocations(&self.heap);
        if !state.packed_heap_indices.is_empty() {
            self.heap.free_many(&state.packed_heap_indices);
            state.packed_heap_indices.clear();
        }
        state.pending_evictions.clear();
        state.pending_loads.clear();
        self.feedback.lock().unwrap().clear();
        info!("{}: released all heap allocations", self.name);
    }

    // ------------------------------------------------------------------
    // introspection (visualization and tests)
    // ------------------------------------------------------------------

    pub fn residency(&self, c: TileCoord) -> Residency {
        self.residency_grid.get(c)
    }

    pub fn refcount(&self, c: TileCoord) -> u32 {
        self.state.lock().unwrap().mapping.refcount(c)
    }

    pub fn heap_index(&self, c: TileCoord) -> u32 {
        self.state.lock().unwrap().mapping.heap_index(c)
    }

    /// Coarsest mip currently wanted at a finest-grid region
    pub fn tile_reference(&self, x: u32, y: u32) -> u8 {
        self.state.lock().unwrap().tile_references[(y * self.width_tiles + x) as usize]
    }

    pub fn pending_loads(&self) -> Vec<TileCoord> {
        self.state.lock().unwrap().pending_loads.clone()
    }

    pub fn pending_load_count(&self) -> usize {
        self.state.lock().unwrap().pending_loads.len()
    }

    /// Coords across every eviction-delay bucket
    pub fn pending_eviction_count(&self) -> usize {
        self.state.lock().unwrap().pending_evictions.len()
    }

    pub fn pending_eviction_contains(&self, c: TileCoord) -> bool {
        self.state.lock().unwrap().pending_evictions.contains(c)
    }

    /// Coords eligible for unmapping this frame
    pub fn ready_eviction_count(&self) -> usize {
        self.state.lock().unwrap().pending_evictions.ready_to_evict().len()
    }

    /// Local (unpublished) min-mip map
    pub fn min_mip_map(&self) -> Vec<u8> {
        self.state.lock().unwrap().min_mip_map.clone()
    }

    pub fn residency_changed_pending(&self) -> bool {
        self.residency_changed.load(Ordering::Acquire)
    }
}

// ----------------------------------------------------------------------
// feedback-pass helpers
// ----------------------------------------------------------------------

/// Adjust refcounts at one region from mip `current` to mip `desired`
fn set_min_mip(
    mapping: &mut TileMappingState,
    pending_loads: &mut Vec<TileCoord>,
    pending_evictions: &mut EvictionDelay,
    current: u8,
    x: u32,
    y: u32,
    desired: u8,
) {
    let mut s = current;

    // want finer: take references coarse to fine so every dependency is
    // referenced before its dependents
    while s > desired {
        s -= 1;
        add_tile_ref(mapping, pending_loads, TileCoord::new(x >> s, y >> s, s as u32));
    }

    // want coarser: release fine to coarse so a tile outlives its dependents
    while s < desired {
        dec_tile_ref(mapping, pending_evictions, TileCoord::new(x >> s, y >> s, s as u32));
        s += 1;
    }
}

fn add_tile_ref(
    mapping: &mut TileMappingState,
    pending_loads: &mut Vec<TileCoord>,
    c: TileCoord,
) {
    let refcount = mapping.refcount_mut(c);
    debug_assert!(*refcount != u32::MAX, "refcount overflow at {:?}", c);
    if *refcount == 0 {
        pending_loads.push(c);
    }
    *refcount += 1;
}

fn dec_tile_ref(
    mapping: &mut TileMappingState,
    pending_evictions: &mut EvictionDelay,
    c: TileCoord,
) {
    let refcount = mapping.refcount_mut(c);
    debug_assert!(*refcount != 0, "releasing unreferenced tile {:?}", c);
    if *refcount == 0 {
        return;
    }
    if *refcount == 1 {
        pending_evictions.append(c);
    }
    *refcount -= 1;
}

/// Swap-remove pending loads whose refcount dropped to 0. Reorders the
/// queue; strict FIFO is not required.
fn abandon_pending(pending_loads: &mut Vec<TileCoord>, mapping: &TileMappingState) {
    let mut i = 0;
    while i < pending_loads.len() {
        if mapping.refcount(pending_loads[i]) > 0 {
            i += 1;
        } else {
            pending_loads.swap_remove(i);
        }
    }
}

/// Eviction logic table, applied to the eligible bucket:
///
/// ```text
/// residency    | action
/// -------------+------------------------------------------
/// Resident     | evict: transient Evicting, free the page
/// Loading      | delay: copy in flight, retry next frame
/// NotResident  | drop: already gone
/// Evicting     | drop: unmap already in flight
/// ```
fn queue_pending_evictions(
    state: &mut ResourceState,
    heap: &HeapAllocator,
    out_evicts: &mut Vec<TileCoord>,
) {
    let ResourceState {
        mapping,
        pending_evictions,
        ..
    } = state;
    let ready = pending_evictions.ready_to_evict();

    let mut num_delayed = 0;
    for i in 0..ready.len() {
        let c = ready[i];

        // rescue in process_feedback removes every refcounted coord before
        // this runs
        debug_assert_eq!(mapping.refcount(c), 0, "eviction of referenced tile {:?}", c);
        if mapping.refcount(c) != 0 {
            continue;
        }

        match mapping.residency(c) {
            Residency::Resident => {
                mapping.set_evicting(c);
                let heap_index = mapping.heap_index_mut(c);
                heap.free(*heap_index);
                *heap_index = INVALID_HEAP_INDEX;
                out_evicts.push(c);
            }
            // a pending load is streaming into this tile; try next frame
            Residency::Loading => {
                ready[num_delayed] = c;
                num_delayed += 1;
            }
            Residency::NotResident | Residency::Evicting => {}
        }
    }

    // keep only the delayed coords
    ready.truncate(num_delayed);
}

/// Load logic table, applied to pending loads:
///
/// ```text
/// residency    | action
/// -------------+------------------------------------------
/// NotResident  | load: transient Loading, allocate a page
/// Evicting     | delay: unmap in flight, retry later
/// Resident     | drop: already satisfied
/// Loading      | drop: already in flight
/// ```
fn queue_pending_loads(
    state: &mut ResourceState,
    heap: &HeapAllocator,
    max_batch: usize,
    out_loads: &mut Vec<TileCoord>,
    out_heap_indices: &mut Vec<u32>,
) {
    let ResourceState {
        mapping,
        pending_loads,
        ..
    } = state;

    let mut budget = pending_loads.len().min(max_batch).min(heap.num_free());
    let mut num_skipped = 0;
    let mut num_consumed = 0;

    for i in 0..pending_loads.len() {
        if budget == 0 {
            break;
        }
        let c = pending_loads[i];
        num_consumed += 1;

        // AbandonPending removes every zero-refcount coord before this runs
        debug_assert!(mapping.refcount(c) > 0, "loading unreferenced tile {:?}", c);
        if mapping.refcount(c) == 0 {
            continue;
        }

        match mapping.residency(c) {
            Residency::NotResident => {
                let index = heap.allocate();
                if index == INVALID_HEAP_INDEX {
                    // heap raced to empty; leave the tail pending
                    num_consumed -= 1;
                    break;
                }
                mapping.set_loading(c);
                *mapping.heap_index_mut(c) = index;
                out_loads.push(c);
                out_heap_indices.push(index);
                budget -= 1;
            }
            // pending eviction on this tile; keep it, compacted to the front
            Residency::Evicting => {
                pending_loads[num_skipped] = c;
                num_skipped += 1;
            }
            Residency::Resident | Residency::Loading => {}
        }
    }

    // consumed coords sit between the skipped prefix and the untouched tail
    pending_loads.drain(num_skipped..num_consumed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::mapping_state::TileMappingState;
    use crate::core::tile::MipChain;

    fn state_for(width: u32, height: u32, mips: u32, depth: usize) -> ResourceState {
        ResourceState {
            mapping: TileMappingState::new(MipChain::from_finest(width, height, mips)),
            tile_references: vec![mips as u8; (width * height) as usize],
            min_mip_map: vec![mips as u8; (width * height) as usize],
            pending_loads: Vec::new(),
            pending_evictions: EvictionDelay::new(depth),
            packed_heap_indices: Vec::new(),
            refcounts_zero: false,
        }
    }

    #[test]
    fn test_set_min_mip_orders_coarse_to_fine() {
        let mut state = state_for(4, 4, 4, 3);
        let ResourceState {
            mapping,
            pending_loads,
            pending_evictions,
            ..
        } = &mut state;

        set_min_mip(mapping, pending_loads, pending_evictions, 4, 0, 0, 0);
        assert_eq!(
            pending_loads.as_slice(),
            &[
                TileCoord::new(0, 0, 3),
                TileCoord::new(0, 0, 2),
                TileCoord::new(0, 0, 1),
                TileCoord::new(0, 0, 0),
            ]
        );
        for mip in 0..4 {
            assert_eq!(mapping.refcount(TileCoord::new(0, 0, mip)), 1);
        }
    }

    #[test]
    fn test_set_min_mip_releases_fine_to_coarse() {
        let mut state = state_for(4, 4, 4, 3);
        {
            let ResourceState {
                mapping,
                pending_loads,
                pending_evictions,
                ..
            } = &mut state;
            set_min_mip(mapping, pending_loads, pending_evictions, 4, 0, 0, 0);
            pending_loads.clear();
            set_min_mip(mapping, pending_loads, pending_evictions, 0, 0, 0, 4);
        }
        for mip in 0..4 {
            assert_eq!(state.mapping.refcount(TileCoord::new(0, 0, mip)), 0);
        }
        assert_eq!(state.pending_evictions.len(), 4);
    }

    #[test]
    fn test_shared_coarse_tiles_accumulate_refs() {
        let mut state = state_for(4, 4, 4, 3);
        let ResourceState {
            mapping,
            pending_loads,
            pending_evictions,
            ..
        } = &mut state;

        // two neighboring regions both depend on the same coarse tiles
        set_min_mip(mapping, pending_loads, pending_evictions, 4, 0, 0, 0);
        set_min_mip(mapping, pending_loads, pending_evictions, 4, 1, 0, 0);

        assert_eq!(mapping.refcount(TileCoord::new(0, 0, 0)), 1);
        assert_eq!(mapping.refcount(TileCoord::new(1, 0, 0)), 1);
        // mip 1 tile (0,0,1) covers both regions
        assert_eq!(mapping.refcount(TileCoord::new(0, 0, 1)), 2);
        // the coarse tile is queued for load only once
        let coarse_loads = pending_loads
            .iter()
            .filter(|&&c| c == TileCoord::new(0, 0, 1))
            .count();
        assert_eq!(coarse_loads, 1);
    }

    #[test]
    fn test_abandon_pending() {
        let mut state = state_for(4, 4, 2, 3);
        let keep = TileCoord::new(0, 0, 0);
        let drop_a = TileCoord::new(1, 0, 0);
        let drop_b = TileCoord::new(2, 0, 0);
        *state.mapping.refcount_mut(keep) = 1;
        state.pending_loads = vec![drop_a, keep, drop_b];

        abandon_pending(&mut state.pending_loads, &state.mapping);
        assert_eq!(state.pending_loads.as_slice(), &[keep]);
    }

    #[test]
    fn test_queue_pending_loads_logic_table() {
        let heap = HeapAllocator::new(8);
        let mut state = state_for(4, 4, 2, 3);

        let loadable = TileCoord::new(0, 0, 0);
        let evicting = TileCoord::new(1, 0, 0);
        let resident = TileCoord::new(2, 0, 0);
        for c in [loadable, evicting, resident] {
            *state.mapping.refcount_mut(c) = 1;
        }
        state.mapping.set_evicting(evicting);
        state.mapping.residency_grid().set(resident, Residency::Resident);
        state.pending_loads = vec![loadable, evicting, resident];

        let mut loads = Vec::new();
        let mut indices = Vec::new();
        queue_pending_loads(&mut state, &heap, 32, &mut loads, &mut indices);

        assert_eq!(loads.as_slice(), &[loadable]);
        assert_eq!(indices.len(), 1);
        assert_eq!(state.mapping.residency(loadable), Residency::Loading);
        assert_ne!(state.mapping.heap_index(loadable), INVALID_HEAP_INDEX);
        // evicting coord delayed, resident coord dropped
        assert_eq!(state.pending_loads.as_slice(), &[evicting]);
    }

    #[test]
    fn test_queue_pending_evictions_logic_table() {
        let heap = HeapAllocator::new(8);
        let mut state = state_for(4, 4, 2, 1);

        let resident = TileCoord::new(0, 0, 0);
        let loading = TileCoord::new(1, 0, 0);
        let gone = TileCoord::new(2, 0, 0);

        state.mapping.residency_grid().set(resident, Residency::Resident);
        *state.mapping.heap_index_mut(resident) = heap.allocate();
        state.mapping.set_loading(loading);
        *state.mapping.heap_index_mut(loading) = heap.allocate();

        for c in [resident, loading, gone] {
            state.pending_evictions.append(c);
        }

        let free_before = heap.num_free();
        let mut evicts = Vec::new();
        queue_pending_evictions(&mut state, &heap, &mut evicts);

        assert_eq!(evicts.as_slice(), &[resident]);
        assert_eq!(state.mapping.residency(resident), Residency::Evicting);
        assert_eq!(state.mapping.heap_index(resident), INVALID_HEAP_INDEX);
        assert_eq!(heap.num_free(), free_before + 1);
        // loading coord delayed in the bucket, gone coord dropped
        assert_eq!(state.pending_evictions.ready_to_evict().as_slice(), &[loading]);
    }

    #[test]
    fn test_load_batch_clamped_by_heap() {
        let heap = HeapAllocator::new(2);
        let mut state = state_for(4, 4, 2, 3);
        let coords: Vec<TileCoord> = (0..4).map(|x| TileCoord::new(x, 0, 0)).collect();
        for &c in &coords {
            *state.mapping.refcount_mut(c) = 1;
        }
        state.pending_loads = coords.clone();

        let mut loads = Vec::new();
        let mut indices = Vec::new();
        queue_pending_loads(&mut state, &heap, 32, &mut loads, &mut indices);

        assert_eq!(loads.len(), 2);
        assert_eq!(heap.num_free(), 0);
        assert_eq!(state.pending_loads.len(), 2);
    }
}
