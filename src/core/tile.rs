//! Tile coordinates and the per-mip tile grid layout.
//!
//! A streaming resource has M standard (streamable) mips numbered 0 (finest)
//! to M-1; mips >= M are packed and permanently resident once bootstrapped.

use bytemuck::{Pod, Zeroable};

/// Size of one heap page. One tile occupies exactly one page; the texel
/// extent covered by a tile depends on the texture format (e.g. 256x256
/// for BC7).
pub const TILE_PAGE_BYTES: usize = 64 * 1024;

/// Coordinate of a tile within a streaming resource
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Pod, Zeroable)]
pub struct TileCoord {
    /// Tile X index within mip `mip`
    pub x: u32,
    /// Tile Y index within mip `mip`
    pub y: u32,
    /// Subresource (mip) index
    pub mip: u32,
}

impl TileCoord {
    pub fn new(x: u32, y: u32, mip: u32) -> Self {
        Self { x, y, mip }
    }

    /// The coarser tile this tile depends on
    pub fn parent(&self) -> TileCoord {
        TileCoord::new(self.x / 2, self.y / 2, self.mip + 1)
    }

    /// The four finer tiles covered by this tile
    pub fn children(&self) -> Option<[TileCoord; 4]> {
        if self.mip == 0 {
            return None;
        }
        let x = self.x * 2;
        let y = self.y * 2;
        let mip = self.mip - 1;
        Some([
            TileCoord::new(x, y, mip),
            TileCoord::new(x + 1, y, mip),
            TileCoord::new(x, y + 1, mip),
            TileCoord::new(x + 1, y + 1, mip),
        ])
    }
}

/// Tile grid dimensions for every standard mip, flattened into one index
/// space. Per-mip grids live at precomputed offsets in a single flat buffer
/// so the hot feedback walk stays cache-friendly.
#[derive(Debug, Clone)]
pub struct MipChain {
    dims: Vec<(u32, u32)>,
    offsets: Vec<usize>,
    total: usize,
}

impl MipChain {
    /// Build from the finest-mip tile grid; each coarser mip ceil-halves
    /// both extents until `standard_mips` levels exist. Ceiling matters for
    /// grids with a partial edge tile: halving the texel extent of a 3-tile
    /// edge still needs 2 tiles to cover it.
    pub fn from_finest(width_tiles: u32, height_tiles: u32, standard_mips: u32) -> Self {
        assert!(standard_mips > 0, "a streaming resource needs standard mips");
        assert!(width_tiles > 0 && height_tiles > 0);

        let mut dims = Vec::with_capacity(standard_mips as usize);
        let mut offsets = Vec::with_capacity(standard_mips as usize);
        let mut total = 0usize;
        let (mut w, mut h) = (width_tiles, height_tiles);
        for _ in 0..standard_mips {
            dims.push((w, h));
            offsets.push(total);
            total += (w * h) as usize;
            w = (w + 1) / 2;
            h = (h + 1) / 2;
        }
        Self { dims, offsets, total }
    }

    /// Number of standard (streamable) mips, M
    pub fn standard_mips(&self) -> u32 {
        self.dims.len() as u32
    }

    pub fn width(&self, mip: u32) -> u32 {
        self.dims[mip as usize].0
    }

    pub fn height(&self, mip: u32) -> u32 {
        self.dims[mip as usize].1
    }

    /// Total number of tracked tiles across all standard mips
    pub fn len(&self) -> usize {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Flat index of a coordinate
    pub fn index(&self, c: TileCoord) -> usize {
        let (w, h) = self.dims[c.mip as usize];
        debug_assert!(c.x < w && c.y < h, "tile coord out of grid: {:?}", c);
        self.offsets[c.mip as usize] + (c.y * w + c.x) as usize
    }

    /// Visit every coordinate of every standard mip in mip-major, row-major
    /// order
    pub fn for_each(&self, mut f: impl FnMut(TileCoord)) {
        for (mip, &(w, h)) in self.dims.iter().enumerate() {
            for y in 0..h {
                for x in 0..w {
                    f(TileCoord::new(x, y, mip as u32));
                }
            }
        }
    }
}
