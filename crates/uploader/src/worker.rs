use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError};
use crossbeam_queue::SegQueue;
use model::TileCoord;
use stream_protocol::{GpuBackend, ResourceKey, StreamingStats, TileReader};
use tile_heap::HeapSlot;

use crate::update_list::{UpdateList, UpdateListPool, UpdateListState};

const IN_FLIGHT_POLL: Duration = Duration::from_millis(1);

#[derive(Debug)]
pub enum WorkerCommand {
    Execute(Box<UpdateList>),
    PublishMinMip {
        resource: ResourceKey,
        bytes: Arc<[u8]>,
    },
    Shutdown,
}

/// Completion traffic back to the residency engine, drained at tick start.
/// All residency mutation stays on the engine thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerNotice {
    /// Mapping updates are recorded on the copy queue. Evictions are done at
    /// this point; they never wait on file I/O.
    MappingsApplied {
        resource: ResourceKey,
        evictions: Vec<TileCoord>,
    },
    CopiesComplete {
        resource: ResourceKey,
        loaded: Vec<TileCoord>,
        failed: Vec<TileCoord>,
    },
    PackedMipsResident {
        resource: ResourceKey,
    },
    PackedMipsFailed {
        resource: ResourceKey,
    },
}

/// Drives update lists through mapping, streaming and copy completion.
///
/// Per list: record the tile-mapping update first (loads mapped, evictions
/// un-mapped when the policy says so), acknowledge evictions, stream each
/// tile with one retry, submit copies, signal the copy fence, then watch the
/// fence from the in-flight queue. Lists retire in fence order.
pub struct UploadWorker {
    commands: Receiver<WorkerCommand>,
    notices: Arc<SegQueue<WorkerNotice>>,
    pool: Arc<UpdateListPool>,
    gpu: Arc<dyn GpuBackend>,
    reader: Arc<dyn TileReader>,
    stats: Arc<StreamingStats>,
    unmap_evicted_tiles: bool,
    in_flight: VecDeque<Box<UpdateList>>,
    shutdown_requested: bool,
}

impl UploadWorker {
    pub fn new(
        commands: Receiver<WorkerCommand>,
        notices: Arc<SegQueue<WorkerNotice>>,
        pool: Arc<UpdateListPool>,
        gpu: Arc<dyn GpuBackend>,
        reader: Arc<dyn TileReader>,
        stats: Arc<StreamingStats>,
        unmap_evicted_tiles: bool,
    ) -> Self {
        Self {
            commands,
            notices,
            pool,
            gpu,
            reader,
            stats,
            unmap_evicted_tiles,
            in_flight: VecDeque::new(),
            shutdown_requested: false,
        }
    }

    /// Thread entry point. Returns once shutdown is requested and every
    /// in-flight list has retired back to the pool.
    pub fn run(mut self) {
        loop {
            if self.in_flight.is_empty() {
                if self.shutdown_requested {
                    break;
                }
                match self.commands.recv() {
                    Ok(command) => self.handle(command),
                    Err(_) => self.shutdown_requested = true,
                }
            } else {
                match self.commands.recv_timeout(IN_FLIGHT_POLL) {
                    Ok(command) => self.handle(command),
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => self.shutdown_requested = true,
                }
            }
            self.poll_completed();
        }
        log::debug!("[uploader] worker drained, exiting");
    }

    /// Processes everything immediately available, without blocking. Lets
    /// deterministic harnesses run the worker inline instead of on a thread.
    pub fn drain_pending(&mut self) {
        loop {
            match self.commands.try_recv() {
                Ok(command) => self.handle(command),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.shutdown_requested = true;
                    break;
                }
            }
        }
        self.poll_completed();
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_requested
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    fn handle(&mut self, command: WorkerCommand) {
        match command {
            WorkerCommand::Execute(list) => self.execute(list),
            WorkerCommand::PublishMinMip { resource, bytes } => {
                self.gpu.upload_min_mip(resource, &bytes);
            }
            WorkerCommand::Shutdown => self.shutdown_requested = true,
        }
    }

    fn execute(&mut self, mut list: Box<UpdateList>) {
        let resource = list.resource();
        list.advance(UpdateListState::UploadInProgress);

        // Mapping updates go first: any copy submitted afterwards observes
        // the new tile mappings.
        if let Some(packed) = &list.packed {
            self.gpu.map_packed_mips(resource, &packed.slots);
        }
        let map_regions: Vec<(TileCoord, HeapSlot)> = list
            .loads
            .iter()
            .map(|read| (read.coord, read.dst_slot))
            .collect();
        let unmap_regions: &[TileCoord] = if self.unmap_evicted_tiles {
            &list.evict_coords
        } else {
            &[]
        };
        if !map_regions.is_empty() || !unmap_regions.is_empty() {
            self.gpu
                .update_tile_mappings(resource, &map_regions, unmap_regions);
        }
        list.advance(UpdateListState::MappingDone);

        // Evictions only wait on the mapping update, never on I/O.
        if !list.evict_coords.is_empty() {
            let evictions = std::mem::take(&mut list.evict_coords);
            self.notices
                .push(WorkerNotice::MappingsApplied { resource, evictions });
        }

        let mut failed = smallvec::SmallVec::new();
        for read in &list.loads {
            match self.read_with_retry(|| self.reader.read_tile(read)) {
                Ok(()) => self.gpu.copy_tile(resource, read.coord, read.dst_slot),
                Err(()) => {
                    log::warn!(
                        "[uploader] tile ({}, {}, mip {}) read failed twice",
                        read.coord.x,
                        read.coord.y,
                        read.coord.mip
                    );
                    failed.push(read.coord);
                }
            }
        }
        list.failed = failed;

        if let Some(packed) = list.packed.clone() {
            match self.read_with_retry(|| {
                self.reader.read_packed(&packed.file_range, &packed.slots)
            }) {
                Ok(()) => self.gpu.copy_packed_mips(resource, &packed.slots),
                Err(()) => {
                    log::warn!("[uploader] packed mip read failed twice");
                    list.mark_packed_failed();
                }
            }
        }

        let fence = self.gpu.signal_copy_fence();
        list.set_copy_fence(fence);
        list.advance(UpdateListState::CopyInProgress);
        self.in_flight.push_back(list);
    }

    fn read_with_retry(
        &self,
        mut read: impl FnMut() -> Result<(), stream_protocol::TileReadError>,
    ) -> Result<(), ()> {
        if read().is_ok() {
            return Ok(());
        }
        StreamingStats::bump(&self.stats.reads_retried, 1);
        read().map_err(|_| ())
    }

    fn poll_completed(&mut self) {
        let completed = self.gpu.completed_copy_fence();
        while let Some(front) = self.in_flight.front() {
            let fence = front
                .copy_fence()
                .expect("in-flight update list carries a copy fence");
            if fence > completed {
                break;
            }
            let mut list = self
                .in_flight
                .pop_front()
                .expect("front checked just above");
            list.advance(UpdateListState::Notify);
            let resource = list.resource();

            if list.packed.is_some() {
                let notice = if list.packed_failed() {
                    WorkerNotice::PackedMipsFailed { resource }
                } else {
                    WorkerNotice::PackedMipsResident { resource }
                };
                self.notices.push(notice);
            }
            if !list.loads.is_empty() {
                let failed: Vec<TileCoord> = list.failed.to_vec();
                let loaded: Vec<TileCoord> = list
                    .loads
                    .iter()
                    .map(|read| read.coord)
                    .filter(|coord| !failed.contains(coord))
                    .collect();
                self.notices.push(WorkerNotice::CopiesComplete {
                    resource,
                    loaded,
                    failed,
                });
            }
            self.pool.release(list);
        }
    }
}
