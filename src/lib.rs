//! Tile residency management for partially-resident (virtual) textures.
//!
//! A partially-resident texture is far larger than the physical memory backing
//! it; only the tiles sampled in recent frames are kept resident in a bounded
//! heap of 64 KiB pages. Each frame the renderer produces a min-mip feedback
//! map (per region, the coarsest mip the sampler wanted). This crate turns
//! that feedback into tile loads and evictions and publishes a per-region
//! residency map that shaders sample to clamp requests to resident data.
//!
//! Entry point is [`core::manager::TileUpdateManager`]; per-resource state
//! lives in [`core::residency::StreamingResource`]. GPU specifics stay behind
//! the [`core::backend::MappingBackend`] and [`core::backend::TileStreamer`]
//! traits; [`core::loopback`] provides in-process implementations.

pub mod core;
pub mod error;

pub use crate::core::backend::{FenceValue, FileHandle, MappingBackend, ResourceHandle,
    StreamTicket, TileStreamer};
pub use crate::core::config::StreamConfig;
pub use crate::core::manager::TileUpdateManager;
pub use crate::core::manifest::TilesetManifest;
pub use crate::core::residency::StreamingResource;
pub use crate::core::tile::{TileCoord, TILE_PAGE_BYTES};
pub use crate::error::{StreamError, StreamResult};
