//! In-process mapping and streaming backends.
//!
//! `LoopbackMapping` and `MemoryStreamer` run the full pipeline without a GPU
//! or a tile store on disk: payloads are generated procedurally so the
//! streaming path stays exercised without IO wiring. Both support on-demand
//! completion, which the scenario tests use to step fences and copies
//! deterministically.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::core::backend::{
    FenceValue, FileHandle, MappingBackend, ResourceHandle, StreamTicket, TileStreamer,
};
use crate::core::tile::{TileCoord, TILE_PAGE_BYTES};
use crate::error::StreamResult;

/// Mapping backend over a bookkeeping table instead of GPU page tables.
///
/// In auto mode every issued fence completes immediately. In manual mode
/// fences complete only through `complete_to`/`complete_all`.
#[derive(Debug)]
pub struct LoopbackMapping {
    issued: AtomicU64,
    completed: AtomicU64,
    auto_complete: bool,
    mapped: Mutex<HashMap<(u32, TileCoord), u32>>,
    packed_mapped: Mutex<HashMap<u32, Vec<u32>>>,
}

impl LoopbackMapping {
    pub fn new() -> Self {
        Self::with_mode(true)
    }

    pub fn manual() -> Self {
        Self::with_mode(false)
    }

    fn with_mode(auto_complete: bool) -> Self {
        Self {
            issued: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            auto_complete,
            mapped: Mutex::new(HashMap::new()),
            packed_mapped: Mutex::new(HashMap::new()),
        }
    }

    fn next_fence(&self) -> FenceValue {
        let fence = self.issued.fetch_add(1, Ordering::AcqRel) + 1;
        if self.auto_complete {
            self.completed.fetch_max(fence, Ordering::AcqRel);
        }
        fence
    }

    /// Complete all fences up to and including `fence`
    pub fn complete_to(&self, fence: FenceValue) {
        self.completed.fetch_max(fence, Ordering::AcqRel);
    }

    pub fn complete_all(&self) {
        self.complete_to(self.issued.load(Ordering::Acquire));
    }

    pub fn issued(&self) -> FenceValue {
        self.issued.load(Ordering::Acquire)
    }

    /// Page a tile is currently mapped to, if any
    pub fn mapped_page(&self, resource: ResourceHandle, c: TileCoord) -> Option<u32> {
        self.mapped.lock().unwrap().get(&(resource.0, c)).copied()
    }

    pub fn mapped_count(&self, resource: ResourceHandle) -> usize {
        let mapped = self.mapped.lock().unwrap();
        mapped.keys().filter(|(r, _)| *r == resource.0).count()
    }

    pub fn packed_pages(&self, resource: ResourceHandle) -> Option<Vec<u32>> {
        self.packed_mapped.lock().unwrap().get(&resource.0).cloned()
    }
}

impl Default for LoopbackMapping {
    fn default() -> Self {
        Self::new()
    }
}

impl MappingBackend for LoopbackMapping {
    fn map(&self, resource: ResourceHandle, coords: &[TileCoord], heap_indices: &[u32])
        -> FenceValue {
        debug_assert_eq!(coords.len(), heap_indices.len());
        let mut mapped = self.mapped.lock().unwrap();
        for (&c, &page) in coords.iter().zip(heap_indices) {
            mapped.insert((resource.0, c), page);
        }
        drop(mapped);
        self.next_fence()
    }

    fn unmap(&self, resource: ResourceHandle, coords: &[TileCoord]) -> FenceValue {
        let mut mapped = self.mapped.lock().unwrap();
        for &c in coords {
            mapped.remove(&(resource.0, c));
        }
        drop(mapped);
        self.next_fence()
    }

    fn map_packed(&self, resource: ResourceHandle, heap_indices: &[u32]) -> FenceValue {
        self.packed_mapped
            .lock()
            .unwrap()
            .insert(resource.0, heap_indices.to_vec());
        self.next_fence()
    }

    fn completed(&self) -> FenceValue {
        self.completed.load(Ordering::Acquire)
    }
}

/// Deterministic fill word for a tile payload
pub fn tile_payload_word(file: FileHandle, c: TileCoord) -> u32 {
    (file.0 as u32)
        .wrapping_mul(0x9e37_79b9)
        .wrapping_add((c.mip << 24) | (c.y << 12) | c.x)
}

/// Deterministic fill word for packed page `i` of a file
pub fn packed_payload_word(file: FileHandle, i: u32) -> u32 {
    (file.0 as u32).wrapping_mul(0x85eb_ca6b) ^ !i
}

#[derive(Debug)]
struct PendingBatch {
    ticket: u64,
    ops: Vec<(u32, u32)>, // (heap page, fill word)
}

/// Words per 64 KiB page
const PAGE_WORDS: usize = TILE_PAGE_BYTES / 4;

/// Streamer over an in-memory page pool with procedurally generated
/// payloads. Manual mode holds copies until `deliver_next`/`deliver_all`.
#[derive(Debug)]
pub struct MemoryStreamer {
    pages: Mutex<Vec<u32>>,
    files: Mutex<Vec<PathBuf>>,
    next_ticket: AtomicU64,
    auto_deliver: bool,
    pending: Mutex<VecDeque<PendingBatch>>,
    completed: Mutex<HashSet<u64>>,
}

impl MemoryStreamer {
    pub fn new(heap_pages: usize) -> Self {
        Self::with_mode(heap_pages, true)
    }

    pub fn manual(heap_pages: usize) -> Self {
        Self::with_mode(heap_pages, false)
    }

    fn with_mode(heap_pages: usize, auto_deliver: bool) -> Self {
        Self {
            pages: Mutex::new(vec![0u32; heap_pages * PAGE_WORDS]),
            files: Mutex::new(Vec::new()),
            next_ticket: AtomicU64::new(0),
            auto_deliver,
            pending: Mutex::new(VecDeque::new()),
            completed: Mutex::new(HashSet::new()),
        }
    }

    fn issue(&self, ops: Vec<(u32, u32)>) -> StreamTicket {
        let ticket = self.next_ticket.fetch_add(1, Ordering::AcqRel) + 1;
        if self.auto_deliver {
            self.apply(&ops);
            self.completed.lock().unwrap().insert(ticket);
        } else {
            self.pending
                .lock()
                .unwrap()
                .push_back(PendingBatch { ticket, ops });
        }
        StreamTicket(ticket)
    }

    fn apply(&self, ops: &[(u32, u32)]) {
        let mut pages = self.pages.lock().unwrap();
        for &(page, word) in ops {
            let start = page as usize * PAGE_WORDS;
            pages[start..start + PAGE_WORDS].fill(word);
        }
    }

    /// Perform the oldest withheld copy batch and complete its ticket
    pub fn deliver_next(&self) -> Option<StreamTicket> {
        let batch = self.pending.lock().unwrap().pop_front()?;
        self.apply(&batch.ops);
        self.completed.lock().unwrap().insert(batch.ticket);
        Some(StreamTicket(batch.ticket))
    }

    pub fn deliver_all(&self) {
        while self.deliver_next().is_some() {}
    }

    pub fn pending_batches(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// First payload word of a heap page, for verification
    pub fn page_word(&self, page: u32) -> u32 {
        self.pages.lock().unwrap()[page as usize * PAGE_WORDS]
    }

    /// Byte view of a heap page, as a copy
    pub fn read_page(&self, page: u32) -> Vec<u8> {
        let pages = self.pages.lock().unwrap();
        let start = page as usize * PAGE_WORDS;
        bytemuck::cast_slice(&pages[start..start + PAGE_WORDS]).to_vec()
    }
}

impl TileStreamer for MemoryStreamer {
    fn open(&self, path: &Path) -> StreamResult<FileHandle> {
        let mut files = self.files.lock().unwrap();
        files.push(path.to_path_buf());
        Ok(FileHandle(files.len() as u64 - 1))
    }

    fn stream_tiles(&self, file: FileHandle, coords: &[TileCoord], heap_pages: &[u32])
        -> StreamTicket {
        debug_assert_eq!(coords.len(), heap_pages.len());
        let ops = coords
            .iter()
            .zip(heap_pages)
            .map(|(&c, &page)| (page, tile_payload_word(file, c)))
            .collect();
        self.issue(ops)
    }

    fn stream_packed(&self, file: FileHandle, heap_pages: &[u32]) -> StreamTicket {
        let ops = heap_pages
            .iter()
            .enumerate()
            .map(|(i, &page)| (page, packed_payload_word(file, i as u32)))
            .collect();
        self.issue(ops)
    }

    fn poll_complete(&self, ticket: StreamTicket) -> bool {
        self.completed.lock().unwrap().contains(&ticket.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mapping_auto_completes() {
        let mapping = LoopbackMapping::new();
        let r = ResourceHandle(0);
        let c = TileCoord::new(1, 2, 0);
        let fence = mapping.map(r, &[c], &[7]);
        assert_eq!(mapping.completed(), fence);
        assert_eq!(mapping.mapped_page(r, c), Some(7));

        mapping.unmap(r, &[c]);
        assert_eq!(mapping.mapped_page(r, c), None);
    }

    #[test]
    fn test_mapping_manual_fences() {
        let mapping = LoopbackMapping::manual();
        let fence = mapping.map(ResourceHandle(0), &[TileCoord::new(0, 0, 0)], &[0]);
        assert!(mapping.completed() < fence);
        mapping.complete_to(fence);
        assert_eq!(mapping.completed(), fence);
    }

    #[test]
    fn test_streamer_auto_delivery() {
        let streamer = MemoryStreamer::new(4);
        let file = streamer.open(Path::new("rock.tiles")).unwrap();
        let c = TileCoord::new(3, 1, 2);
        let ticket = streamer.stream_tiles(file, &[c], &[2]);
        assert!(streamer.poll_complete(ticket));
        assert_eq!(streamer.page_word(2), tile_payload_word(file, c));
    }

    #[test]
    fn test_streamer_manual_delivery_order() {
        let streamer = MemoryStreamer::manual(4);
        let file = streamer.open(Path::new("rock.tiles")).unwrap();
        let a = streamer.stream_tiles(file, &[TileCoord::new(0, 0, 1)], &[0]);
        let b = streamer.stream_tiles(file, &[TileCoord::new(0, 0, 0)], &[1]);
        assert!(!streamer.poll_complete(a));

        assert_eq!(streamer.deliver_next(), Some(a));
        assert!(streamer.poll_complete(a));
        assert!(!streamer.poll_complete(b));

        streamer.deliver_all();
        assert!(streamer.poll_complete(b));
        assert_eq!(streamer.pending_batches(), 0);
    }

    #[test]
    fn test_distinct_files_distinct_payloads() {
        let streamer = MemoryStreamer::new(2);
        let a = streamer.open(Path::new("a.tiles")).unwrap();
        let b = streamer.open(Path::new("b.tiles")).unwrap();
        let c = TileCoord::new(0, 0, 0);
        assert_ne!(tile_payload_word(a, c), tile_payload_word(b, c));
    }
}
