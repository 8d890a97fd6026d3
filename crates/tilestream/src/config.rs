use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamingConfig {
    /// Tile heap capacity shared by every registered resource.
    pub heap_capacity_tiles: u32,
    /// Swap-chain depth; evictions age this many frames before un-mapping.
    pub frames_in_flight: usize,
    /// Cap on new tile loads packaged per frame across all resources.
    pub max_tile_loads_per_frame: usize,
    /// Cap on loads plus evictions carried by a single update list.
    pub max_tiles_per_update_list: usize,
    /// Update lists cycling between the engine and the upload worker. An
    /// exhausted pool throttles packaging until uploads catch up.
    pub update_list_pool_size: usize,
    /// Feedback frames buffered between the render thread and the engine;
    /// overflow drops the newest frame and counts it.
    pub feedback_ring_capacity: usize,
    /// Engine event queue depth.
    pub event_queue_capacity: usize,
    /// Whether committed evictions also null the GPU tile mapping. Heap
    /// slots are recycled either way.
    pub unmap_evicted_tiles: bool,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            heap_capacity_tiles: 1024,
            frames_in_flight: 3,
            max_tile_loads_per_frame: 128,
            max_tiles_per_update_list: 64,
            update_list_pool_size: 8,
            feedback_ring_capacity: 16,
            event_queue_capacity: 64,
            unmap_evicted_tiles: true,
        }
    }
}

impl StreamingConfig {
    pub(crate) fn assert_valid(&self) {
        assert!(
            self.heap_capacity_tiles > 0,
            "heap capacity must be greater than zero"
        );
        assert!(
            self.frames_in_flight > 0,
            "frames in flight must be greater than zero"
        );
        assert!(
            self.max_tile_loads_per_frame > 0,
            "per-frame load cap must be greater than zero"
        );
        assert!(
            self.max_tiles_per_update_list > 0,
            "update list size cap must be greater than zero"
        );
        assert!(
            self.update_list_pool_size > 0,
            "update list pool must hold at least one list"
        );
        assert!(
            self.feedback_ring_capacity > 0,
            "feedback ring capacity must be greater than zero"
        );
        assert!(
            self.event_queue_capacity > 0,
            "event queue capacity must be greater than zero"
        );
    }
}
