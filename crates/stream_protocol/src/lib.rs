use std::sync::atomic::{AtomicU64, Ordering};

use model::{TileCoord, TileMipChain};
use slotmap::new_key_type;
use tile_heap::HeapSlot;

new_key_type! {
    /// Stable generational handle for one registered tiled resource. The
    /// render thread holds these; worker threads never own resources.
    pub struct ResourceKey;
}

/// Monotonic tick on the shared copy fence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FenceValue(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileCompression {
    Uncompressed,
    GDeflate,
}

/// Where one tile's bytes live in the backing file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileFileRange {
    pub offset: u64,
    pub bytes: u32,
    pub compression: TileCompression,
}

/// Packed region of the file: every mip too small to fill a tile, stored and
/// mapped as one unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackedMipInfo {
    pub file_range: TileFileRange,
    pub uncompressed_bytes: u32,
    pub num_packed_mips: u8,
    pub num_tiles: u32,
}

/// One tile read: file range plus the heap slot whose staging window receives
/// the decompressed bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRequest {
    pub coord: TileCoord,
    pub file_range: TileFileRange,
    pub dst_slot: HeapSlot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileReadError {
    Io,
    Decompress,
}

impl std::fmt::Display for TileReadError {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TileReadError::Io => write!(formatter, "tile read failed"),
            TileReadError::Decompress => write!(formatter, "tile decompression failed"),
        }
    }
}

impl std::error::Error for TileReadError {}

/// Per-resource view of the tiled texture file. Implemented by the file
/// format parser, which is outside this workspace.
pub trait TileSource: Send + Sync {
    fn mip_chain(&self) -> TileMipChain;
    fn packed_mip_info(&self) -> PackedMipInfo;
    fn tile_file_range(&self, coord: TileCoord) -> TileFileRange;
}

/// Bulk file reader / decompressor. Writes each tile into the staging window
/// addressed by the request's heap slot. Internally thread-safe.
pub trait TileReader: Send + Sync {
    fn read_tile(&self, request: &ReadRequest) -> Result<(), TileReadError>;

    /// Reads the packed region into consecutive staging windows.
    fn read_packed(
        &self,
        range: &TileFileRange,
        dst_slots: &[HeapSlot],
    ) -> Result<(), TileReadError>;
}

/// GPU command recording for the copy queue. Mapping updates recorded here
/// are observed by any GPU work submitted to the queue afterwards.
/// Internally thread-safe.
pub trait GpuBackend: Send + Sync {
    fn update_tile_mappings(
        &self,
        resource: ResourceKey,
        map: &[(TileCoord, HeapSlot)],
        unmap: &[TileCoord],
    );

    /// One-shot mapping of the packed region at resource init.
    fn map_packed_mips(&self, resource: ResourceKey, slots: &[HeapSlot]);

    /// Copies a staged tile into its mapped location.
    fn copy_tile(&self, resource: ResourceKey, coord: TileCoord, src_slot: HeapSlot);

    fn copy_packed_mips(&self, resource: ResourceKey, slots: &[HeapSlot]);

    /// Signals the copy fence after everything submitted so far; returns the
    /// tick that will be observed once those copies retire.
    fn signal_copy_fence(&self) -> FenceValue;

    /// Most recent retired copy-fence tick.
    fn completed_copy_fence(&self) -> FenceValue;

    /// Refreshes the GPU-visible min-mip buffer the shaders sample.
    fn upload_min_mip(&self, resource: ResourceKey, bytes: &[u8]);
}

/// Shared counters, bumped from whichever thread observes the event.
/// Relaxed ordering throughout; readers only want totals.
#[derive(Debug, Default)]
pub struct StreamingStats {
    pub loads_submitted: AtomicU64,
    pub loads_completed: AtomicU64,
    pub loads_failed: AtomicU64,
    pub loads_deferred: AtomicU64,
    pub loads_cancelled: AtomicU64,
    pub evictions_queued: AtomicU64,
    pub evictions_committed: AtomicU64,
    pub rescues: AtomicU64,
    pub feedback_frames_processed: AtomicU64,
    pub feedback_frames_superseded: AtomicU64,
    pub feedback_frames_dropped: AtomicU64,
    pub reads_retried: AtomicU64,
    pub min_mip_publishes: AtomicU64,
    pub heap_slots_in_use: AtomicU64,
}

impl StreamingStats {
    pub fn bump(counter: &AtomicU64, amount: u64) {
        counter.fetch_add(amount, Ordering::Relaxed);
    }

    pub fn read(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::{FenceValue, StreamingStats};

    #[test]
    fn fence_values_order_by_tick() {
        assert!(FenceValue(3) < FenceValue(7));
        assert_eq!(FenceValue(7).max(FenceValue(3)), FenceValue(7));
    }

    #[test]
    fn stats_bump_accumulates() {
        let stats = StreamingStats::default();
        StreamingStats::bump(&stats.loads_submitted, 3);
        StreamingStats::bump(&stats.loads_submitted, 4);
        assert_eq!(StreamingStats::read(&stats.loads_submitted), 7);
    }
}
