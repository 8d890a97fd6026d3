use bytemuck::{Pod, Zeroable};
use static_assertions::const_assert_eq;

/// Fixed tile payload size, on disk and in the tile heap.
pub const TILE_SIZE_BYTES: u32 = 65_536;

/// Upper bound on standard (individually streamed) mip levels. A 4Gi x 4Gi
/// texel resource in 64 KiB tiles stays well under this.
pub const MAX_STANDARD_MIPS: u8 = 16;

/// Address of one standard tile: position within its mip's tile grid plus the
/// mip level (subresource). Layout-compatible with GPU tiled-resource
/// coordinates, hence the plain `u32` mip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Pod, Zeroable)]
#[repr(C)]
pub struct TileCoord {
    pub x: u32,
    pub y: u32,
    pub mip: u32,
}

const_assert_eq!(std::mem::size_of::<TileCoord>(), 12);

impl TileCoord {
    pub const fn new(x: u32, y: u32, mip: u32) -> Self {
        Self { x, y, mip }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MipLevelDim {
    pub width_tiles: u32,
    pub height_tiles: u32,
    pub first_tile_index: u32,
}

impl MipLevelDim {
    pub const fn tile_count(self) -> u32 {
        self.width_tiles * self.height_tiles
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MipChainError {
    ZeroExtent,
    ZeroStandardMips,
    TooManyStandardMips,
}

impl std::fmt::Display for MipChainError {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MipChainError::ZeroExtent => {
                write!(formatter, "mip 0 tile extent must be at least 1x1")
            }
            MipChainError::ZeroStandardMips => {
                write!(formatter, "mip chain needs at least one standard mip")
            }
            MipChainError::TooManyStandardMips => {
                write!(
                    formatter,
                    "mip chain exceeds {MAX_STANDARD_MIPS} standard mips"
                )
            }
        }
    }
}

impl std::error::Error for MipChainError {}

/// Tile layout of the standard mips of one tiled resource.
///
/// Mip `s` has `max(1, w >> s) x max(1, h >> s)` tiles. Tiles are numbered
/// linearly, finest mip first, row-major within a mip. Mips below the last
/// standard mip are packed and are not addressed per tile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileMipChain {
    mips: Vec<MipLevelDim>,
    num_standard_tiles: u32,
}

impl TileMipChain {
    pub fn new(
        mip0_width_tiles: u32,
        mip0_height_tiles: u32,
        num_standard_mips: u8,
    ) -> Result<Self, MipChainError> {
        if mip0_width_tiles == 0 || mip0_height_tiles == 0 {
            return Err(MipChainError::ZeroExtent);
        }
        if num_standard_mips == 0 {
            return Err(MipChainError::ZeroStandardMips);
        }
        if num_standard_mips > MAX_STANDARD_MIPS {
            return Err(MipChainError::TooManyStandardMips);
        }

        let mut mips = Vec::with_capacity(num_standard_mips as usize);
        let mut next_tile_index = 0_u32;
        for mip in 0..num_standard_mips as u32 {
            let dim = MipLevelDim {
                width_tiles: (mip0_width_tiles >> mip).max(1),
                height_tiles: (mip0_height_tiles >> mip).max(1),
                first_tile_index: next_tile_index,
            };
            next_tile_index += dim.tile_count();
            mips.push(dim);
        }

        Ok(Self {
            mips,
            num_standard_tiles: next_tile_index,
        })
    }

    pub fn num_standard_mips(&self) -> u8 {
        self.mips.len() as u8
    }

    pub fn num_standard_tiles(&self) -> u32 {
        self.num_standard_tiles
    }

    pub fn mip_dim(&self, mip: u32) -> MipLevelDim {
        self.mips[mip as usize]
    }

    pub fn contains(&self, coord: TileCoord) -> bool {
        let Some(dim) = self.mips.get(coord.mip as usize) else {
            return false;
        };
        coord.x < dim.width_tiles && coord.y < dim.height_tiles
    }

    pub fn linear_index(&self, coord: TileCoord) -> u32 {
        let dim = self.mips[coord.mip as usize];
        assert!(
            coord.x < dim.width_tiles && coord.y < dim.height_tiles,
            "tile coordinate ({}, {}, mip {}) outside {}x{} mip grid",
            coord.x,
            coord.y,
            coord.mip,
            dim.width_tiles,
            dim.height_tiles,
        );
        dim.first_tile_index + coord.y * dim.width_tiles + coord.x
    }

    pub fn coord_of_linear(&self, index: u32) -> TileCoord {
        assert!(
            index < self.num_standard_tiles,
            "linear tile index {index} out of {} standard tiles",
            self.num_standard_tiles
        );
        let mip = self
            .mips
            .iter()
            .rposition(|dim| dim.first_tile_index <= index)
            .expect("mip chain has at least one mip");
        let dim = self.mips[mip];
        let offset = index - dim.first_tile_index;
        TileCoord {
            x: offset % dim.width_tiles,
            y: offset / dim.width_tiles,
            mip: mip as u32,
        }
    }

    /// Tile at `mip` covering the given mip-0 tile position.
    pub fn ancestor(&self, pos_x: u32, pos_y: u32, mip: u32) -> TileCoord {
        debug_assert!((mip as usize) < self.mips.len());
        let dim = self.mips[mip as usize];
        TileCoord {
            x: (pos_x >> mip).min(dim.width_tiles - 1),
            y: (pos_y >> mip).min(dim.height_tiles - 1),
            mip,
        }
    }

    /// One byte per mip-0 tile position; shared by the feedback map written by
    /// the renderer and the published min-mip map.
    pub fn map_len(&self) -> usize {
        self.mips[0].tile_count() as usize
    }

    pub fn map_width_tiles(&self) -> u32 {
        self.mips[0].width_tiles
    }

    pub fn map_height_tiles(&self) -> u32 {
        self.mips[0].height_tiles
    }

    /// Desired-mip bytes at or beyond the standard range select the coarsest
    /// standard mip.
    pub fn clamp_desired_mip(&self, desired: u8) -> u8 {
        desired.min(self.num_standard_mips() - 1)
    }
}
