//! Upload pipeline: UpdateList pool plus the submit and fence-monitor
//! workers.
//!
//! The submit worker turns Submitted lists into mapping-backend calls and
//! streamer copies; the fence-monitor worker polls fences and tickets, drives
//! the remaining state transitions, delivers residency notifications and
//! returns lists to the pool. Both park on single-slot event flags; the
//! monitor sleeps whenever nothing is in flight.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use log::debug;

use crate::core::backend::{MappingBackend, TileStreamer};
use crate::core::config::StreamConfig;
use crate::core::residency::StreamingResource;
use crate::core::signal::EventFlag;
use crate::core::stats::global_tracker;
use crate::core::update_list::{UpdateList, UpdateListState};

/// Polling cadence of the fence monitor while work is in flight
const MONITOR_POLL: Duration = Duration::from_micros(50);
/// Bounded wait while the pool is idle
const MONITOR_IDLE_WAIT: Duration = Duration::from_millis(100);

struct UploaderShared {
    lists: Vec<UpdateList>,
    free_count: AtomicUsize,
    alloc_index: AtomicUsize,
    running: AtomicBool,
    submit_flag: EventFlag,
    monitor_flag: EventFlag,
    mapping: Arc<dyn MappingBackend>,
    streamer: Arc<dyn TileStreamer>,
    /// Some drivers degrade past a few thousand updates per call
    max_mapping_batch: usize,
}

/// Owns the UpdateList pool, the backends and the two worker threads
pub struct DataUploader {
    shared: Arc<UploaderShared>,
    max_batch: usize,
    manual: bool,
    submit_join: Option<JoinHandle<()>>,
    monitor_join: Option<JoinHandle<()>>,
}

impl DataUploader {
    /// Production mode: workers run on their own threads
    pub fn new(
        config: &StreamConfig,
        mapping: Arc<dyn MappingBackend>,
        streamer: Arc<dyn TileStreamer>,
    ) -> Self {
        let mut uploader = Self::build(config, mapping, streamer, false);
        uploader.start_threads();
        uploader
    }

    /// Thread-less mode: callers step the pipeline with [`DataUploader::pump`]
    pub fn new_manual(
        config: &StreamConfig,
        mapping: Arc<dyn MappingBackend>,
        streamer: Arc<dyn TileStreamer>,
    ) -> Self {
        Self::build(config, mapping, streamer, true)
    }

    fn build(
        config: &StreamConfig,
        mapping: Arc<dyn MappingBackend>,
        streamer: Arc<dyn TileStreamer>,
        manual: bool,
    ) -> Self {
        let lists = (0..config.max_copy_batches)
            .map(|_| UpdateList::default())
            .collect::<Vec<_>>();
        Self {
            shared: Arc::new(UploaderShared {
                free_count: AtomicUsize::new(lists.len()),
                lists,
                alloc_index: AtomicUsize::new(0),
                running: AtomicBool::new(false),
                submit_flag: EventFlag::new(),
                monitor_flag: EventFlag::new(),
                mapping,
                streamer,
                max_mapping_batch: config.max_tile_mapping_updates_per_api_call.max(1),
            }),
            max_batch: config.max_tile_copies_per_batch,
            manual,
            submit_join: None,
            monitor_join: None,
        }
    }

    fn start_threads(&mut self) {
        self.shared.running.store(true, Ordering::Release);

        let shared = Arc::clone(&self.shared);
        self.submit_join = Some(std::thread::spawn(move || {
            debug!("submit thread started");
            while shared.running.load(Ordering::Acquire) {
                shared.submit_flag.wait();
                submit_pass(&shared);
            }
            debug!("submit thread stopped");
        }));

        let shared = Arc::clone(&self.shared);
        self.monitor_join = Some(std::thread::spawn(move || {
            debug!("fence monitor thread started");
            while shared.running.load(Ordering::Acquire) {
                monitor_pass(&shared);
                if shared.free_count.load(Ordering::Acquire) == shared.lists.len() {
                    shared.monitor_flag.wait_timeout(MONITOR_IDLE_WAIT);
                } else {
                    std::thread::sleep(MONITOR_POLL);
                }
            }
            debug!("fence monitor thread stopped");
        }));
    }

    pub fn streamer(&self) -> &Arc<dyn TileStreamer> {
        &self.shared.streamer
    }

    pub fn mapping(&self) -> &Arc<dyn MappingBackend> {
        &self.shared.mapping
    }

    /// Largest tile-copy batch a single UpdateList may carry
    pub fn max_batch(&self) -> usize {
        self.max_batch
    }

    pub fn capacity(&self) -> usize {
        self.shared.lists.len()
    }

    /// UpdateLists currently out of the pool
    pub fn in_flight(&self) -> usize {
        self.capacity() - self.shared.free_count.load(Ordering::Acquire)
    }

    /// Try to take a Free UpdateList for `resource`. The free count is a
    /// fast-path guard, not a reservation; concurrent allocators may still
    /// lose the probe and get None.
    pub fn allocate(&self, resource: &Arc<StreamingResource>) -> Option<usize> {
        let shared = &self.shared;

        let mut count = shared.free_count.load(Ordering::Acquire);
        loop {
            if count == 0 {
                return None;
            }
            match shared.free_count.compare_exchange_weak(
                count,
                count - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => count = observed,
            }
        }

        // rotating probe: the slot after the last allocation has had the
        // longest time to drain
        let num_lists = shared.lists.len();
        for _ in 0..num_lists {
            let i = shared.alloc_index.fetch_add(1, Ordering::Relaxed) % num_lists;
            if shared.lists[i].try_acquire(Arc::clone(resource)) {
                shared.monitor_flag.set();
                return Some(i);
            }
        }

        shared.free_count.fetch_add(1, Ordering::AcqRel);
        None
    }

    pub fn list(&self, slot: usize) -> &UpdateList {
        &self.shared.lists[slot]
    }

    /// Hand a filled list to the submit worker
    pub fn submit(&self, slot: usize) {
        let list = &self.shared.lists[slot];
        debug_assert_eq!(list.state(), UpdateListState::Allocated);
        list.set_state(UpdateListState::Submitted);
        self.shared.submit_flag.set();
        self.shared.monitor_flag.set();
    }

    /// Return an unused allocation to the pool
    pub fn discard(&self, slot: usize) {
        let list = &self.shared.lists[slot];
        debug_assert_eq!(list.state(), UpdateListState::Allocated);
        debug_assert!(list.payload().is_empty());
        list.set_state(UpdateListState::Free);
        self.shared.free_count.fetch_add(1, Ordering::AcqRel);
    }

    /// One submit pass plus one monitor pass, manual mode only
    pub fn pump(&self) {
        debug_assert!(self.manual, "pump races the worker threads");
        submit_pass(&self.shared);
        monitor_pass(&self.shared);
    }

    /// Block until every UpdateList has returned to the pool
    pub fn flush(&self) {
        while self.shared.free_count.load(Ordering::Acquire) < self.shared.lists.len() {
            if self.manual {
                self.pump();
            } else {
                self.shared.monitor_flag.set();
            }
            std::thread::yield_now();
        }
    }

    fn stop_threads(&mut self) {
        if self.shared.running.swap(false, Ordering::AcqRel) {
            self.shared.submit_flag.set();
            self.shared.monitor_flag.set();
            if let Some(handle) = self.submit_join.take() {
                let _ = handle.join();
            }
            if let Some(handle) = self.monitor_join.take() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for DataUploader {
    fn drop(&mut self) {
        self.stop_threads();
    }
}

/// Issue mapping commands and copies for every Submitted list
fn submit_pass(shared: &UploaderShared) {
    for list in &shared.lists {
        if list.state() != UpdateListState::Submitted {
            continue;
        }

        let mut payload = list.payload();
        let resource = payload
            .resource
            .clone()
            .expect("submitted UpdateList carries a resource");
        let handle = resource.handle();

        if payload.is_packed() {
            debug_assert!(!payload.has_loads() && !payload.has_evictions());
            let fence = shared.mapping.map_packed(handle, &payload.packed_heap_indices);
            payload.mapping_fence = fence;
            drop(payload);
            // packed copy must wait for the mapping fence
            list.set_state(UpdateListState::PackedMapping);
            continue;
        }

        let mut fence = 0;
        if payload.has_evictions() {
            for chunk in payload.evicts.chunks(shared.max_mapping_batch) {
                fence = shared.mapping.unmap(handle, chunk);
            }
        }
        if payload.has_loads() {
            for (coords, pages) in payload
                .loads
                .chunks(shared.max_mapping_batch)
                .zip(payload.load_heap_indices.chunks(shared.max_mapping_batch))
            {
                fence = shared.mapping.map(handle, coords, pages);
            }
            let ticket = shared.streamer.stream_tiles(
                resource.file(),
                &payload.loads,
                &payload.load_heap_indices,
            );
            payload.copy_ticket = Some(ticket);
            payload.mapping_fence = fence;
            drop(payload);
            list.set_state(UpdateListState::Uploading);
        } else {
            payload.mapping_fence = fence;
            drop(payload);
            list.set_state(UpdateListState::CopyPending);
        }
    }
}

/// Poll fences and tickets; deliver notifications and recycle finished lists
fn monitor_pass(shared: &UploaderShared) {
    for list in &shared.lists {
        match list.state() {
            UpdateListState::PackedMapping => {
                let mut payload = list.payload();
                if payload.mapping_fence <= shared.mapping.completed() {
                    let resource = payload.resource.clone().unwrap();
                    let ticket = shared
                        .streamer
                        .stream_packed(resource.file(), &payload.packed_heap_indices);
                    payload.copy_ticket = Some(ticket);
                    drop(payload);
                    list.set_state(UpdateListState::Uploading);
                }
            }

            UpdateListState::Uploading => {
                let payload = list.payload();
                let done = payload
                    .copy_ticket
                    .map(|t| shared.streamer.poll_complete(t))
                    .unwrap_or(false);
                drop(payload);
                if done {
                    list.set_state(UpdateListState::CopyPending);
                }
            }

            UpdateListState::CopyPending => {
                let payload = list.payload();
                if payload.mapping_fence > shared.mapping.completed() {
                    continue;
                }

                let resource = payload.resource.clone().unwrap();
                if payload.has_evictions() {
                    global_tracker().record_evictions(payload.evicts.len() as u64);
                    resource.notify_evicted(&payload.evicts);
                }
                if payload.has_loads() {
                    global_tracker().record_uploads(payload.loads.len() as u64);
                    resource.notify_loaded(&payload.loads);
                }
                if payload.is_packed() {
                    resource.notify_packed_mips();
                }
                drop(payload);

                // contents are deliberately kept until the next acquisition
                list.set_state(UpdateListState::Free);
                shared.free_count.fetch_add(1, Ordering::AcqRel);
            }

            _ => {}
        }
    }
}
