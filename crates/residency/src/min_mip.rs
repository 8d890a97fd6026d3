use model::{TileCoord, TileMipChain};

/// CPU copy of the published min-mip map: one byte per mip-0 tile position,
/// holding the finest mip whose whole ancestor chain above that position is
/// resident. `num_standard_mips` means "packed mips only".
#[derive(Debug)]
pub struct ResidencyMap {
    bytes: Vec<u8>,
}

impl ResidencyMap {
    pub fn new(chain: &TileMipChain) -> Self {
        Self {
            bytes: vec![chain.num_standard_mips(); chain.map_len()],
        }
    }

    /// Recomputes every byte bottom-up and reports whether anything changed.
    ///
    /// Working upward from the packed region (always resident) means a value
    /// never promises detail finer than what is contiguously resident, even
    /// when rescue reordered eviction queues or a fine-mip load completed
    /// before a coarser one.
    pub fn rebuild(
        &mut self,
        chain: &TileMipChain,
        is_resident: impl Fn(TileCoord) -> bool,
    ) -> bool {
        let width = chain.map_width_tiles();
        let height = chain.map_height_tiles();
        let num_mips = chain.num_standard_mips() as u32;
        let mut changed = false;
        for pos_y in 0..height {
            for pos_x in 0..width {
                let mut value = num_mips as u8;
                for mip in (0..num_mips).rev() {
                    if is_resident(chain.ancestor(pos_x, pos_y, mip)) {
                        value = mip as u8;
                    } else {
                        break;
                    }
                }
                let index = (pos_y * width + pos_x) as usize;
                if self.bytes[index] != value {
                    self.bytes[index] = value;
                    changed = true;
                }
            }
        }
        changed
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn value_at(&self, chain: &TileMipChain, pos_x: u32, pos_y: u32) -> u8 {
        self.bytes[(pos_y * chain.map_width_tiles() + pos_x) as usize]
    }
}
