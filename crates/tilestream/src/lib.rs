mod config;
mod engine;
mod manager;
mod stats;

pub use config::StreamingConfig;
pub use manager::{MinMipSnapshot, StreamingError, StreamingManager};
pub use stats::StatisticsSnapshot;

pub use model::{TILE_SIZE_BYTES, TileCoord, TileMipChain};
pub use stream_protocol::{
    GpuBackend, PackedMipInfo, ReadRequest, ResourceKey, TileCompression, TileFileRange,
    TileReadError, TileReader, TileSource,
};
