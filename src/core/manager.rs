//! Aggregator across streaming resources.
//!
//! Owns the heap, the uploader, the shared residency buffer and the worker
//! that runs every resource's feedback pass. The renderer talks to this type:
//! frame ticks, feedback intake through the resources it creates, and the
//! published residency map.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, info};

use crate::core::backend::{FenceValue, MappingBackend, ResourceHandle, TileStreamer};
use crate::core::config::StreamConfig;
use crate::core::heap::HeapAllocator;
use crate::core::manifest::TilesetManifest;
use crate::core::residency::{PackedMipStatus, StreamingResource};
use crate::core::signal::EventFlag;
use crate::core::uploader::DataUploader;
use crate::error::{StreamError, StreamResult};

/// Bounded wait of the worker loop between passes
const WORKER_IDLE_WAIT: Duration = Duration::from_millis(2);

/// State shared between the manager, its worker and the resources it owns.
/// Resources hold an `Arc` to this instead of a pointer back to the manager.
pub(crate) struct ManagerShared {
    pub(crate) resources: Mutex<Vec<Arc<StreamingResource>>>,
    /// Byte-per-region min-mip maps of every resource, concatenated at
    /// assigned offsets; what shaders sample
    pub(crate) residency_map: Mutex<Vec<u8>>,
    pub(crate) residency_changed: AtomicBool,
    pub(crate) work_flag: EventFlag,
    pub(crate) frame_fence_completed: AtomicU64,
    pub(crate) within_frame: AtomicBool,
    pub(crate) running: AtomicBool,
}

impl ManagerShared {
    pub(crate) fn new() -> Self {
        Self {
            resources: Mutex::new(Vec::new()),
            residency_map: Mutex::new(Vec::new()),
            residency_changed: AtomicBool::new(false),
            work_flag: EventFlag::new(),
            frame_fence_completed: AtomicU64::new(0),
            within_frame: AtomicBool::new(false),
            running: AtomicBool::new(false),
        }
    }
}

/// Top-level engine object
pub struct TileUpdateManager {
    config: StreamConfig,
    shared: Arc<ManagerShared>,
    heap: Arc<HeapAllocator>,
    uploader: Arc<DataUploader>,
    next_handle: AtomicU32,
    frame_fence: AtomicU64,
    manual: bool,
    worker: Option<JoinHandle<()>>,
}

impl TileUpdateManager {
    /// Production mode: the feedback worker and the upload workers run on
    /// their own threads
    pub fn new(
        config: StreamConfig,
        mapping: Arc<dyn MappingBackend>,
        streamer: Arc<dyn TileStreamer>,
    ) -> StreamResult<Self> {
        config.validate()?;
        let uploader = Arc::new(DataUploader::new(&config, mapping, streamer));
        let mut manager = Self::build(config, uploader, false);
        manager.start_worker();
        Ok(manager)
    }

    /// Thread-less mode for deterministic stepping: callers drive the engine
    /// with [`TileUpdateManager::tick`]
    pub fn new_manual(
        config: StreamConfig,
        mapping: Arc<dyn MappingBackend>,
        streamer: Arc<dyn TileStreamer>,
    ) -> StreamResult<Self> {
        config.validate()?;
        let uploader = Arc::new(DataUploader::new_manual(&config, mapping, streamer));
        Ok(Self::build(config, uploader, true))
    }

    fn build(config: StreamConfig, uploader: Arc<DataUploader>, manual: bool) -> Self {
        let heap = Arc::new(HeapAllocator::new(config.heap_pages));
        Self {
            config,
            shared: Arc::new(ManagerShared::new()),
            heap,
            uploader,
            next_handle: AtomicU32::new(0),
            frame_fence: AtomicU64::new(0),
            manual,
            worker: None,
        }
    }

    fn start_worker(&mut self) {
        self.shared.running.store(true, Ordering::Release);
        let shared = Arc::clone(&self.shared);
        let uploader = Arc::clone(&self.uploader);
        self.worker = Some(std::thread::spawn(move || {
            debug!("feedback worker started");
            while shared.running.load(Ordering::Acquire) {
                run_pass(&shared, &uploader);
                shared.work_flag.wait_timeout(WORKER_IDLE_WAIT);
            }
            debug!("feedback worker stopped");
        }));
    }

    /// Register a streaming resource described by `manifest`, backed by the
    /// tile store at `store`. Its region of the residency buffer is seeded
    /// with M (only packed mips sampleable).
    pub fn create_streaming_resource(
        &self,
        name: &str,
        manifest: &TilesetManifest,
        store: &Path,
    ) -> StreamResult<Arc<StreamingResource>> {
        manifest.validate()?;
        let file = self.uploader.streamer().open(store)?;
        let handle = ResourceHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));

        let width_tiles = manifest.tiles_width();
        let height_tiles = manifest.tiles_height();
        let region_len = (width_tiles * height_tiles) as usize;
        let residency_offset = {
            let mut map = self.shared.residency_map.lock().unwrap();
            let offset = map.len();
            map.resize(offset + region_len, manifest.standard_mips as u8);
            offset
        };

        let resource = Arc::new_cyclic(|weak| {
            StreamingResource::new(
                weak.clone(),
                name.to_string(),
                handle,
                file,
                width_tiles,
                height_tiles,
                manifest.standard_mips,
                manifest.packed_tile_count,
                residency_offset,
                Arc::clone(&self.heap),
                Arc::clone(&self.shared),
                &self.config,
            )
        });

        self.shared.resources.lock().unwrap().push(Arc::clone(&resource));
        self.shared.work_flag.set();
        info!(
            "registered {} ({}x{} tiles, {} mips) at residency offset {}",
            name, width_tiles, height_tiles, manifest.standard_mips, residency_offset
        );
        Ok(resource)
    }

    /// Drain the pipeline and unregister `resource`, returning its heap
    /// pages. Must be called outside a frame.
    pub fn destroy_resource(&self, resource: &Arc<StreamingResource>) -> StreamResult<()> {
        if self.shared.within_frame.load(Ordering::Acquire) {
            return Err(StreamError::lifecycle(
                "resources can only be destroyed outside a frame",
            ));
        }

        {
            let mut resources = self.shared.resources.lock().unwrap();
            resources.retain(|r| !Arc::ptr_eq(r, resource));
        }

        // in-flight UpdateLists may still notify this resource; let them
        self.finish();
        resource.release_allocations();

        // its region keeps reporting packed-only until the offset is reused
        let mut map = self.shared.residency_map.lock().unwrap();
        let offset = resource.residency_offset();
        let len = (resource.width_tiles() * resource.height_tiles()) as usize;
        map[offset..offset + len].fill(resource.max_mip());
        Ok(())
    }

    /// Start a frame; the returned fence value tags feedback resolved during
    /// this frame
    pub fn begin_frame(&self) -> FenceValue {
        self.shared.within_frame.store(true, Ordering::Release);
        self.frame_fence.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// End a frame: record the completed render fence, rotate every
    /// eviction-delay ring and refresh min-mip maps where residency changed
    pub fn end_frame(&self, completed: FenceValue) {
        self.shared
            .frame_fence_completed
            .fetch_max(completed, Ordering::AcqRel);

        let refresh = self.shared.residency_changed.swap(false, Ordering::AcqRel);
        for resource in self.resources_snapshot() {
            resource.next_frame();
            if refresh {
                resource.update_min_mip_map();
            }
        }

        self.shared.within_frame.store(false, Ordering::Release);
        self.shared.work_flag.set();
    }

    /// One worker iteration: packed bootstrap, feedback translation and tile
    /// queueing for every resource. In manual mode this also steps the
    /// upload pipeline once.
    pub fn tick(&self) {
        run_pass(&self.shared, &self.uploader);
        if self.manual {
            self.uploader.pump();
        }
    }

    /// Block until every UpdateList has drained back to the pool
    pub fn finish(&self) {
        self.uploader.flush();
    }

    /// Force a residency-map refresh at the next end of frame
    pub fn set_residency_changed(&self) {
        self.shared.residency_changed.store(true, Ordering::Release);
    }

    pub fn within_frame(&self) -> bool {
        self.shared.within_frame.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn heap(&self) -> &Arc<HeapAllocator> {
        &self.heap
    }

    pub fn uploader(&self) -> &DataUploader {
        &self.uploader
    }

    /// Snapshot of the shared residency buffer
    pub fn residency_map(&self) -> Vec<u8> {
        self.shared.residency_map.lock().unwrap().clone()
    }

    /// Published min-mip region of one resource
    pub fn resource_min_mip(&self, resource: &StreamingResource) -> Vec<u8> {
        let map = self.shared.residency_map.lock().unwrap();
        let offset = resource.residency_offset();
        let len = (resource.width_tiles() * resource.height_tiles()) as usize;
        map[offset..offset + len].to_vec()
    }

    fn resources_snapshot(&self) -> Vec<Arc<StreamingResource>> {
        self.shared.resources.lock().unwrap().clone()
    }
}

impl Drop for TileUpdateManager {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        self.shared.work_flag.set();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// Body of one feedback-worker iteration
fn run_pass(shared: &ManagerShared, uploader: &DataUploader) {
    let resources: Vec<Arc<StreamingResource>> = shared.resources.lock().unwrap().clone();
    let completed = shared.frame_fence_completed.load(Ordering::Acquire);
    for resource in &resources {
        if resource.packed_status() < PackedMipStatus::Requested {
            resource.init_packed_mips(uploader);
        }
        resource.process_feedback(completed);
        resource.queue_tiles(uploader);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::loopback::{LoopbackMapping, MemoryStreamer};
    use crate::core::manifest::MANIFEST_VERSION;

    fn manifest_4x4() -> TilesetManifest {
        TilesetManifest {
            version: MANIFEST_VERSION,
            name: "test".to_string(),
            width: 1024,
            height: 1024,
            tile_width: 256,
            tile_height: 256,
            standard_mips: 4,
            packed_tile_count: 1,
            source: None,
        }
    }

    fn manual_manager(heap_pages: usize) -> TileUpdateManager {
        let config = StreamConfig {
            heap_pages,
            ..Default::default()
        };
        TileUpdateManager::new_manual(
            config,
            Arc::new(LoopbackMapping::new()),
            Arc::new(MemoryStreamer::new(heap_pages)),
        )
        .unwrap()
    }

    #[test]
    fn test_residency_offsets_concatenate() {
        let manager = manual_manager(64);
        let a = manager
            .create_streaming_resource("a", &manifest_4x4(), Path::new("a.tiles"))
            .unwrap();
        let b = manager
            .create_streaming_resource("b", &manifest_4x4(), Path::new("b.tiles"))
            .unwrap();

        assert_eq!(a.residency_offset(), 0);
        assert_eq!(b.residency_offset(), 16);
        // seeded with M on registration
        assert!(manager.residency_map().iter().all(|&m| m == 4));
    }

    #[test]
    fn test_packed_bootstrap_reaches_drawable() {
        let manager = manual_manager(64);
        let resource = manager
            .create_streaming_resource("r", &manifest_4x4(), Path::new("r.tiles"))
            .unwrap();
        assert!(!resource.packed_mips_resident());

        // bootstrap: request, then one pump per pipeline stage
        manager.tick();
        assert_eq!(resource.packed_status(), PackedMipStatus::Requested);
        manager.tick();
        manager.tick();
        assert!(resource.packed_mips_resident());

        // one-shot transition query
        assert!(resource.packed_mips_need_transition());
        assert!(!resource.packed_mips_need_transition());
        assert_eq!(resource.packed_status(), PackedMipStatus::Resident);
    }

    #[test]
    fn test_destroy_returns_heap_pages() {
        let manager = manual_manager(64);
        let resource = manager
            .create_streaming_resource("r", &manifest_4x4(), Path::new("r.tiles"))
            .unwrap();
        manager.tick();
        manager.tick();
        manager.tick();
        assert_eq!(manager.heap().num_free(), 63); // packed page held

        manager.destroy_resource(&resource).unwrap();
        assert_eq!(manager.heap().num_free(), 64);
        assert!(manager.residency_map().iter().all(|&m| m == 4));
    }

    #[test]
    fn test_destroy_within_frame_rejected() {
        let manager = manual_manager(8);
        let resource = manager
            .create_streaming_resource("r", &manifest_4x4(), Path::new("r.tiles"))
            .unwrap();
        manager.begin_frame();
        assert!(manager.destroy_resource(&resource).is_err());
        manager.end_frame(1);
        assert!(manager.destroy_resource(&resource).is_ok());
    }

    #[test]
    fn test_zero_packed_tiles_immediately_drawable() {
        let manager = manual_manager(8);
        let manifest = TilesetManifest {
            packed_tile_count: 0,
            ..manifest_4x4()
        };
        let resource = manager
            .create_streaming_resource("r", &manifest, Path::new("r.tiles"))
            .unwrap();
        assert!(resource.packed_mips_resident());
    }
}
