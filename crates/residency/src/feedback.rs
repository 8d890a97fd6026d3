use bitvec::prelude::{BitVec, Lsb0};
use model::{TileCoord, TileMipChain};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedbackError {
    LengthMismatch { expected: usize, actual: usize },
}

impl std::fmt::Display for FeedbackError {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FeedbackError::LengthMismatch { expected, actual } => write!(
                formatter,
                "feedback map holds {actual} bytes, resource expects {expected}"
            ),
        }
    }
}

impl std::error::Error for FeedbackError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TranslationSummary {
    pub newly_wanted: u64,
    pub no_longer_wanted: u64,
}

/// Turns per-frame desired-mip feedback into reference deltas.
///
/// The feedback map carries one byte per mip-0 tile position: the finest mip
/// the sampler wanted for that region. Each position marks the covering tile
/// at every standard mip from the (clamped) desired level up to the coarsest,
/// and the marked set is diffed against the previous frame's.
#[derive(Debug)]
pub struct FeedbackTranslator {
    previous: BitVec<usize, Lsb0>,
    current: BitVec<usize, Lsb0>,
}

impl FeedbackTranslator {
    pub fn new(chain: &TileMipChain) -> Self {
        let tiles = chain.num_standard_tiles() as usize;
        Self {
            previous: BitVec::repeat(false, tiles),
            current: BitVec::repeat(false, tiles),
        }
    }

    /// Applies one feedback frame. Tiles entering the wanted set are appended
    /// to `newly_wanted`, tiles leaving it to `no_longer_wanted`.
    pub fn apply(
        &mut self,
        chain: &TileMipChain,
        feedback: &[u8],
        newly_wanted: &mut Vec<TileCoord>,
        no_longer_wanted: &mut Vec<TileCoord>,
    ) -> Result<TranslationSummary, FeedbackError> {
        let expected = chain.map_len();
        if feedback.len() != expected {
            return Err(FeedbackError::LengthMismatch {
                expected,
                actual: feedback.len(),
            });
        }

        self.current.fill(false);
        let width = chain.map_width_tiles();
        let height = chain.map_height_tiles();
        let num_mips = chain.num_standard_mips() as u32;
        for pos_y in 0..height {
            for pos_x in 0..width {
                let byte = feedback[(pos_y * width + pos_x) as usize];
                let desired = chain.clamp_desired_mip(byte) as u32;
                for mip in desired..num_mips {
                    let index = chain.linear_index(chain.ancestor(pos_x, pos_y, mip)) as usize;
                    if self.current[index] {
                        // An earlier position already marked this tile, and
                        // with it every coarser ancestor.
                        break;
                    }
                    self.current.set(index, true);
                }
            }
        }

        let mut summary = TranslationSummary::default();
        for index in 0..self.current.len() {
            let wanted = self.current[index];
            let was_wanted = self.previous[index];
            if wanted == was_wanted {
                continue;
            }
            let coord = chain.coord_of_linear(index as u32);
            if wanted {
                summary.newly_wanted += 1;
                newly_wanted.push(coord);
            } else {
                summary.no_longer_wanted += 1;
                no_longer_wanted.push(coord);
            }
        }

        std::mem::swap(&mut self.previous, &mut self.current);
        Ok(summary)
    }

    /// Forgets the previous wanted set, as if no feedback had been seen.
    pub fn reset(&mut self) {
        self.previous.fill(false);
    }
}
