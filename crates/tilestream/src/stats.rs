use serde::{Deserialize, Serialize};
use stream_protocol::StreamingStats;

/// Point-in-time copy of the streaming counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StatisticsSnapshot {
    pub loads_submitted: u64,
    pub loads_completed: u64,
    pub loads_failed: u64,
    pub loads_deferred: u64,
    pub loads_cancelled: u64,
    pub evictions_queued: u64,
    pub evictions_committed: u64,
    pub rescues: u64,
    pub feedback_frames_processed: u64,
    pub feedback_frames_superseded: u64,
    pub feedback_frames_dropped: u64,
    pub reads_retried: u64,
    pub min_mip_publishes: u64,
    pub heap_capacity: u64,
    pub heap_slots_in_use: u64,
    pub update_lists_in_flight: u64,
}

impl StatisticsSnapshot {
    pub(crate) fn gather(
        stats: &StreamingStats,
        heap_capacity: u32,
        update_lists_in_flight: u64,
    ) -> Self {
        Self {
            loads_submitted: StreamingStats::read(&stats.loads_submitted),
            loads_completed: StreamingStats::read(&stats.loads_completed),
            loads_failed: StreamingStats::read(&stats.loads_failed),
            loads_deferred: StreamingStats::read(&stats.loads_deferred),
            loads_cancelled: StreamingStats::read(&stats.loads_cancelled),
            evictions_queued: StreamingStats::read(&stats.evictions_queued),
            evictions_committed: StreamingStats::read(&stats.evictions_committed),
            rescues: StreamingStats::read(&stats.rescues),
            feedback_frames_processed: StreamingStats::read(&stats.feedback_frames_processed),
            feedback_frames_superseded: StreamingStats::read(&stats.feedback_frames_superseded),
            feedback_frames_dropped: StreamingStats::read(&stats.feedback_frames_dropped),
            reads_retried: StreamingStats::read(&stats.reads_retried),
            min_mip_publishes: StreamingStats::read(&stats.min_mip_publishes),
            heap_capacity: heap_capacity as u64,
            heap_slots_in_use: StreamingStats::read(&stats.heap_slots_in_use),
            update_lists_in_flight,
        }
    }
}
