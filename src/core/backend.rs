//! Injected interfaces: virtual-memory mapping and tile-payload streaming.
//!
//! The engine never touches a GPU API directly. Mapping commands and tile
//! copies go through these traits; `core::loopback` provides in-process
//! implementations that complete immediately or on demand.

use std::path::Path;

use crate::core::tile::TileCoord;
use crate::error::StreamResult;

/// Monotonically-increasing completion fence, one sequence per backend
pub type FenceValue = u64;

/// Stable identifier the manager assigns to each streaming resource.
/// Backends key their per-resource state off this; the engine never hands
/// them owning pointers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceHandle(pub u32);

/// Handle to an open tile store, issued by the streamer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileHandle(pub u64);

/// Completion ticket for a batch of tile copies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamTicket(pub u64);

/// Virtual-to-physical tile mapping. One fence sequence per backend; a call
/// returns the fence value at which the issued work completes.
pub trait MappingBackend: Send + Sync {
    /// Map `coords[i]` of `resource` to heap page `heap_indices[i]`
    fn map(&self, resource: ResourceHandle, coords: &[TileCoord], heap_indices: &[u32])
        -> FenceValue;

    /// Unmap tiles of `resource`
    fn unmap(&self, resource: ResourceHandle, coords: &[TileCoord]) -> FenceValue;

    /// Map the packed-mip footprint of `resource` to the reserved pages
    fn map_packed(&self, resource: ResourceHandle, heap_indices: &[u32]) -> FenceValue;

    /// Highest completed fence value
    fn completed(&self) -> FenceValue;
}

/// Copies tile payloads from a tile store into heap pages and signals
/// completion through tickets
pub trait TileStreamer: Send + Sync {
    /// Open a tile store; the returned handle is what resources carry
    fn open(&self, path: &Path) -> StreamResult<FileHandle>;

    /// Copy one tile payload per coord into the paired heap page
    fn stream_tiles(&self, file: FileHandle, coords: &[TileCoord], heap_pages: &[u32])
        -> StreamTicket;

    /// Copy the packed-mip payload into the reserved pages
    fn stream_packed(&self, file: FileHandle, heap_pages: &[u32]) -> StreamTicket;

    /// True once every copy behind `ticket` has landed
    fn poll_complete(&self, ticket: StreamTicket) -> bool;
}
