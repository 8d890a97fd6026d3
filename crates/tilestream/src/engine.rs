use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use crossbeam_queue::SegQueue;
use residency::ResidencyState;
use rtrb::Consumer;
use slotmap::SecondaryMap;
use stream_protocol::{ReadRequest, ResourceKey, StreamingStats, TileSource};
use tile_heap::{HeapSlot, TileHeapAllocator};
use uploader::{PackedMipLoad, UpdateListPool, WorkerCommand, WorkerNotice};

use crate::manager::{MinMipSnapshot, ResourceShared};

const SHUTDOWN_DRAIN_POLL: Duration = Duration::from_millis(1);

fn send_to_worker(worker: &Sender<WorkerCommand>, command: WorkerCommand) {
    if worker.send(command).is_err() {
        panic!("upload worker command channel disconnected");
    }
}

/// One feedback frame posted by the render thread.
#[derive(Debug)]
pub(crate) struct FeedbackFrame {
    pub resource: ResourceKey,
    pub bytes: Box<[u8]>,
}

pub(crate) enum EngineEvent {
    FrameTick {
        frame: u64,
    },
    Register {
        resource: ResourceKey,
        source: Arc<dyn TileSource>,
        shared: Arc<ResourceShared>,
    },
    /// Wake-up hint; feedback itself travels through the ring.
    FeedbackPosted,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PackedState {
    Pending,
    InFlight,
    Resident,
}

struct EngineResource {
    shared: Arc<ResourceShared>,
    source: Arc<dyn TileSource>,
    state: ResidencyState,
    packed: PackedState,
    packed_slots: Vec<HeapSlot>,
    min_mip_version: u64,
}

/// The feedback-processing loop. Sole writer of all residency state, the
/// eviction queues and the heap allocator; everything it learns from the
/// upload worker arrives as notices drained at tick start.
pub(crate) struct ResidencyEngine {
    resources: SecondaryMap<ResourceKey, EngineResource>,
    order: Vec<ResourceKey>,
    cursor: usize,
    allocator: TileHeapAllocator,
    pool: Arc<UpdateListPool>,
    worker: Sender<WorkerCommand>,
    notices: Arc<SegQueue<WorkerNotice>>,
    feedback: Consumer<FeedbackFrame>,
    events: Receiver<EngineEvent>,
    stats: Arc<StreamingStats>,
    latest_feedback: HashMap<ResourceKey, Box<[u8]>>,
    frames_in_flight: usize,
    max_tile_loads_per_frame: usize,
    max_tiles_per_update_list: usize,
}

impl ResidencyEngine {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        heap_capacity_tiles: u32,
        frames_in_flight: usize,
        max_tile_loads_per_frame: usize,
        max_tiles_per_update_list: usize,
        pool: Arc<UpdateListPool>,
        worker: Sender<WorkerCommand>,
        notices: Arc<SegQueue<WorkerNotice>>,
        feedback: Consumer<FeedbackFrame>,
        events: Receiver<EngineEvent>,
        stats: Arc<StreamingStats>,
    ) -> Self {
        Self {
            resources: SecondaryMap::new(),
            order: Vec::new(),
            cursor: 0,
            allocator: TileHeapAllocator::new(heap_capacity_tiles),
            pool,
            worker,
            notices,
            feedback,
            events,
            stats,
            latest_feedback: HashMap::new(),
            frames_in_flight,
            max_tile_loads_per_frame,
            max_tiles_per_update_list,
        }
    }

    /// Thread entry point: one tick per frame signal, until shutdown.
    pub(crate) fn run(mut self) {
        loop {
            match self.events.recv() {
                Ok(EngineEvent::FrameTick { frame }) => self.tick(frame),
                Ok(EngineEvent::Register {
                    resource,
                    source,
                    shared,
                }) => self.register(resource, source, shared),
                Ok(EngineEvent::FeedbackPosted) => {}
                Ok(EngineEvent::Shutdown) | Err(_) => break,
            }
        }
        self.shutdown();
    }

    pub(crate) fn register(
        &mut self,
        resource: ResourceKey,
        source: Arc<dyn TileSource>,
        shared: Arc<ResourceShared>,
    ) {
        let chain = source.mip_chain();
        log::debug!(
            "[engine] resource registered: {}x{} tiles, {} standard mips",
            chain.map_width_tiles(),
            chain.map_height_tiles(),
            chain.num_standard_mips()
        );
        self.resources.insert(
            resource,
            EngineResource {
                shared,
                source,
                state: ResidencyState::new(chain, self.frames_in_flight),
                packed: PackedState::Pending,
                packed_slots: Vec::new(),
                min_mip_version: 0,
            },
        );
        self.order.push(resource);
        self.try_start_packed(resource);
    }

    /// Allocates heap slots for the packed region and hands the bootstrap
    /// list to the worker. Retried every tick while the heap or the pool
    /// cannot serve it.
    fn try_start_packed(&mut self, resource: ResourceKey) {
        let Some(res) = self.resources.get_mut(resource) else {
            return;
        };
        if res.packed != PackedState::Pending {
            return;
        }
        let info = res.source.packed_mip_info();
        let slots = self.allocator.allocate_batch(info.num_tiles as usize);
        if slots.len() < info.num_tiles as usize {
            self.allocator.free_batch(slots);
            log::debug!("[engine] packed mip bootstrap deferred: heap exhausted");
            return;
        }
        let Some(mut list) = self.pool.acquire() else {
            self.allocator.free_batch(slots);
            return;
        };
        list.begin(resource);
        list.packed = Some(PackedMipLoad {
            slots: slots.clone(),
            file_range: info.file_range,
        });
        res.packed = PackedState::InFlight;
        res.packed_slots = slots;
        send_to_worker(&self.worker, WorkerCommand::Execute(list));
    }

    pub(crate) fn tick(&mut self, frame: u64) {
        self.drain_notices();
        self.drain_feedback();

        let pending_packed: Vec<ResourceKey> = self
            .order
            .iter()
            .copied()
            .filter(|&key| {
                self.resources
                    .get(key)
                    .is_some_and(|res| res.packed == PackedState::Pending)
            })
            .collect();
        for key in pending_packed {
            self.try_start_packed(key);
        }

        let resource_count = self.order.len();
        let mut load_budget = self.max_tile_loads_per_frame;
        for step in 0..resource_count {
            let key = self.order[(self.cursor + step) % resource_count];
            self.process_resource(key, &mut load_budget);
        }
        if resource_count > 0 {
            self.cursor = (self.cursor + 1) % resource_count;
        }

        self.stats
            .heap_slots_in_use
            .store(self.allocator.allocated() as u64, Ordering::Relaxed);
        log::trace!(
            "[engine] frame {frame}: {} heap slots in use, {} lists free",
            self.allocator.allocated(),
            self.pool.available()
        );
    }

    fn process_resource(&mut self, key: ResourceKey, load_budget: &mut usize) {
        let Some(res) = self.resources.get_mut(key) else {
            return;
        };

        res.state.advance_frame();
        let rescued = res.state.rescue();
        StreamingStats::bump(&self.stats.rescues, rescued);

        if let Some(bytes) = self.latest_feedback.remove(&key) {
            match res.state.apply_feedback(&bytes) {
                Ok(outcome) => {
                    StreamingStats::bump(&self.stats.feedback_frames_processed, 1);
                    StreamingStats::bump(&self.stats.evictions_queued, outcome.evictions_queued);
                }
                Err(error) => log::warn!("[engine] feedback rejected: {error}"),
            }
        }

        // Package aged-out evictions and budgeted loads into update lists.
        loop {
            let has_evictions = res.state.eviction_delay().ready_len() > 0;
            let has_loads = res.state.pending_load_count() > 0 && *load_budget > 0;
            if !has_evictions && !has_loads {
                break;
            }
            let Some(mut list) = self.pool.acquire() else {
                // Every list is in flight; the worker is the bottleneck.
                log::trace!("[engine] update list pool exhausted, deferring work");
                break;
            };
            list.begin(key);

            let evict_collect = res
                .state
                .collect_evictions(self.max_tiles_per_update_list, &mut list.evict_coords);
            StreamingStats::bump(&self.stats.rescues, evict_collect.rescued);

            let list_capacity_left = self.max_tiles_per_update_list - list.evict_coords.len();
            let mut slot_budget = list_capacity_left.min(*load_budget);
            let before = slot_budget;
            let mut loads: Vec<(model::TileCoord, HeapSlot)> = Vec::new();
            let allocator = &mut self.allocator;
            let load_collect =
                res.state
                    .collect_loads(&mut slot_budget, || allocator.allocate().ok(), &mut loads);
            *load_budget -= before - slot_budget;
            StreamingStats::bump(&self.stats.loads_cancelled, load_collect.cancelled);
            StreamingStats::bump(&self.stats.loads_deferred, load_collect.newly_deferred);

            for (coord, slot) in &loads {
                list.loads.push(ReadRequest {
                    coord: *coord,
                    file_range: res.source.tile_file_range(*coord),
                    dst_slot: *slot,
                });
            }

            if list.is_empty() {
                self.pool.release(list);
                break;
            }
            StreamingStats::bump(&self.stats.loads_submitted, list.loads.len() as u64);
            send_to_worker(&self.worker, WorkerCommand::Execute(list));

            if load_collect.heap_exhausted {
                break;
            }
        }

        if res.state.residency_map_dirty() && res.state.rebuild_residency_map() {
            res.min_mip_version += 1;
            let bytes = res.state.residency_map_bytes().to_vec();
            let chain = res.state.chain();
            let snapshot = MinMipSnapshot {
                width_tiles: chain.map_width_tiles(),
                height_tiles: chain.map_height_tiles(),
                num_standard_mips: chain.num_standard_mips(),
                version: res.min_mip_version,
                bytes: bytes.clone().into_boxed_slice(),
            };
            res.shared.min_mip.store(Arc::new(snapshot));
            let gpu_bytes: Arc<[u8]> = Arc::from(bytes.into_boxed_slice());
            StreamingStats::bump(&self.stats.min_mip_publishes, 1);
            send_to_worker(&self.worker, WorkerCommand::PublishMinMip {
                resource: key,
                bytes: gpu_bytes,
            });
        }
    }

    pub(crate) fn drain_notices(&mut self) {
        while let Some(notice) = self.notices.pop() {
            match notice {
                WorkerNotice::MappingsApplied {
                    resource,
                    evictions,
                } => {
                    let Some(res) = self.resources.get_mut(resource) else {
                        continue;
                    };
                    let mut freed = Vec::new();
                    res.state.notify_evictions_complete(&evictions, &mut freed);
                    StreamingStats::bump(&self.stats.evictions_committed, freed.len() as u64);
                    self.allocator.free_batch(freed);
                }
                WorkerNotice::CopiesComplete {
                    resource,
                    loaded,
                    failed,
                } => {
                    let Some(res) = self.resources.get_mut(resource) else {
                        continue;
                    };
                    let requeued_evictions = res.state.notify_copies_complete(&loaded);
                    StreamingStats::bump(&self.stats.loads_completed, loaded.len() as u64);
                    StreamingStats::bump(&self.stats.evictions_queued, requeued_evictions);
                    if !failed.is_empty() {
                        let mut freed = Vec::new();
                        res.state.notify_load_failures(&failed, &mut freed);
                        StreamingStats::bump(&self.stats.loads_failed, failed.len() as u64);
                        self.allocator.free_batch(freed);
                    }
                }
                WorkerNotice::PackedMipsResident { resource } => {
                    let Some(res) = self.resources.get_mut(resource) else {
                        continue;
                    };
                    res.packed = PackedState::Resident;
                    res.shared.drawable.store(true, Ordering::Release);
                    log::debug!("[engine] packed mips resident, resource drawable");
                }
                WorkerNotice::PackedMipsFailed { resource } => {
                    let Some(res) = self.resources.get_mut(resource) else {
                        continue;
                    };
                    log::warn!("[engine] packed mip bootstrap failed, will retry");
                    let slots = std::mem::take(&mut res.packed_slots);
                    self.allocator.free_batch(slots);
                    res.packed = PackedState::Pending;
                    StreamingStats::bump(&self.stats.loads_failed, 1);
                }
            }
        }
    }

    fn drain_feedback(&mut self) {
        while let Ok(frame) = self.feedback.pop() {
            if !self.resources.contains_key(frame.resource) {
                // Raced a registration still in the event queue; the renderer
                // re-posts feedback every frame.
                continue;
            }
            if self
                .latest_feedback
                .insert(frame.resource, frame.bytes)
                .is_some()
            {
                StreamingStats::bump(&self.stats.feedback_frames_superseded, 1);
            }
        }
    }

    /// Drains outstanding update lists so GPU mappings are coherent at
    /// teardown, then clears the eviction queues.
    fn shutdown(&mut self) {
        log::debug!("[engine] shutdown: draining outstanding update lists");
        let _ = self.worker.send(WorkerCommand::Shutdown);
        while !self.pool.all_returned() {
            self.drain_notices();
            std::thread::sleep(SHUTDOWN_DRAIN_POLL);
        }
        self.drain_notices();
        for key in &self.order {
            if let Some(res) = self.resources.get_mut(*key) {
                res.state.clear_eviction_delay();
            }
        }
    }

    /// Cross-resource invariant sweep: per-resource consistency, heap
    /// accounting, and heap-slot exclusivity. Test and debug aid.
    #[cfg(test)]
    pub(crate) fn audit_invariants(&self) {
        let mut seen = std::collections::HashSet::new();
        let mut assigned = 0_u64;
        for (_, res) in &self.resources {
            res.state.audit_invariants();
            for (coord, slot) in res.state.mapping().assigned_slots() {
                assert!(
                    seen.insert(slot.raw()),
                    "heap slot {} owned by more than one tile (last: {coord:?})",
                    slot.raw()
                );
                assigned += 1;
            }
            for slot in &res.packed_slots {
                assert!(
                    seen.insert(slot.raw()),
                    "packed heap slot {} owned twice",
                    slot.raw()
                );
                assigned += 1;
            }
        }
        assert_eq!(
            assigned,
            self.allocator.allocated() as u64,
            "assigned tile slots disagree with allocator occupancy"
        );
    }
}
