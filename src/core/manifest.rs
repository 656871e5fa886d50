//! Tileset manifest schema and I/O.
//!
//! A tile store on disk is described by a small JSON manifest: virtual
//! extents, tile extents, the standard-mip count and the packed footprint.
//! The streamer opens the store named by `source`; the engine sizes its grids
//! from the dimensions here.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{StreamError, StreamResult};

/// Current manifest schema version
pub const MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TilesetManifest {
    /// Schema version (currently 1)
    pub version: u32,

    /// Human-readable tileset name
    pub name: String,

    /// Virtual texture extent in texels
    pub width: u32,
    pub height: u32,

    /// Texel extent covered by one 64 KiB tile (format dependent)
    pub tile_width: u32,
    pub tile_height: u32,

    /// Number of standard (streamable) mips
    pub standard_mips: u32,

    /// Heap pages occupied by the packed (always-resident) mips
    pub packed_tile_count: u32,

    /// Path to the raw tile store, relative to the manifest
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl TilesetManifest {
    /// Tile-grid width of the finest mip
    pub fn tiles_width(&self) -> u32 {
        (self.width + self.tile_width - 1) / self.tile_width
    }

    /// Tile-grid height of the finest mip
    pub fn tiles_height(&self) -> u32 {
        (self.height + self.tile_height - 1) / self.tile_height
    }

    pub fn validate(&self) -> StreamResult<()> {
        if self.version != MANIFEST_VERSION {
            return Err(StreamError::ManifestVersion {
                expected: MANIFEST_VERSION,
                got: self.version,
            });
        }
        if self.width == 0 || self.height == 0 {
            return Err(StreamError::manifest("texture extent must be nonzero"));
        }
        if self.tile_width == 0 || self.tile_height == 0 {
            return Err(StreamError::manifest("tile extent must be nonzero"));
        }
        if self.standard_mips == 0 {
            return Err(StreamError::manifest(
                "a streaming tileset needs at least one standard mip",
            ));
        }
        Ok(())
    }

    pub fn from_json(json: &str) -> StreamResult<Self> {
        let manifest: TilesetManifest = serde_json::from_str(json)?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn from_json_file(path: &Path) -> StreamResult<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    pub fn to_json_file(&self, path: &Path) -> StreamResult<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}
