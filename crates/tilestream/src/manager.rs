use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use arc_swap::ArcSwap;
use crossbeam_channel::{Sender, bounded};
use crossbeam_queue::SegQueue;
use rtrb::{Producer, RingBuffer};
use slotmap::SlotMap;
use stream_protocol::{GpuBackend, ResourceKey, StreamingStats, TileReader, TileSource};
use uploader::{UpdateListPool, UploadWorker};

use crate::config::StreamingConfig;
use crate::engine::{EngineEvent, FeedbackFrame, ResidencyEngine};
use crate::stats::StatisticsSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamingError {
    UnknownResource,
    ShutdownInProgress,
    FeedbackSizeMismatch { expected: usize, actual: usize },
}

impl std::fmt::Display for StreamingError {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamingError::UnknownResource => {
                write!(formatter, "resource handle is not registered")
            }
            StreamingError::ShutdownInProgress => {
                write!(formatter, "streaming manager is shutting down")
            }
            StreamingError::FeedbackSizeMismatch { expected, actual } => write!(
                formatter,
                "feedback map holds {actual} bytes, resource expects {expected}"
            ),
        }
    }
}

impl std::error::Error for StreamingError {}

/// Published min-mip map state for one resource. Shaders clamp their mip
/// selection with the GPU copy; CPU callers read this snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MinMipSnapshot {
    pub width_tiles: u32,
    pub height_tiles: u32,
    pub num_standard_mips: u8,
    /// Bumped on every publication; lets callers detect staleness cheaply.
    pub version: u64,
    pub bytes: Box<[u8]>,
}

/// Render-thread-visible state of one resource, shared with the engine.
pub(crate) struct ResourceShared {
    pub min_mip: ArcSwap<MinMipSnapshot>,
    pub drawable: AtomicBool,
    pub feedback_len: usize,
}

/// Front door for the renderer: registers resources, forwards feedback,
/// drives frame ticks, publishes residency and statistics.
///
/// Owns the residency-engine and upload-worker threads; dropping the manager
/// drains outstanding uploads before the threads exit.
pub struct StreamingManager {
    config: StreamingConfig,
    resources: SlotMap<ResourceKey, Arc<ResourceShared>>,
    events: Sender<EngineEvent>,
    feedback: Producer<FeedbackFrame>,
    stats: Arc<StreamingStats>,
    pool: Arc<UpdateListPool>,
    engine_thread: Option<JoinHandle<()>>,
    worker_thread: Option<JoinHandle<()>>,
    frame: u64,
    shutdown_started: bool,
}

impl StreamingManager {
    pub fn new(
        config: StreamingConfig,
        gpu: Arc<dyn GpuBackend>,
        reader: Arc<dyn TileReader>,
    ) -> Self {
        config.assert_valid();

        let (event_sender, event_receiver) = bounded(config.event_queue_capacity);
        let (command_sender, command_receiver) = bounded(config.update_list_pool_size + 8);
        let (feedback_producer, feedback_consumer) = RingBuffer::new(config.feedback_ring_capacity);
        let notices = Arc::new(SegQueue::new());
        let pool = Arc::new(UpdateListPool::new(config.update_list_pool_size));
        let stats = Arc::new(StreamingStats::default());

        let worker = UploadWorker::new(
            command_receiver,
            notices.clone(),
            pool.clone(),
            gpu,
            reader,
            stats.clone(),
            config.unmap_evicted_tiles,
        );
        let worker_thread = thread::Builder::new()
            .name("tile-upload".into())
            .spawn(move || worker.run())
            .expect("spawning upload worker thread");

        let engine = ResidencyEngine::new(
            config.heap_capacity_tiles,
            config.frames_in_flight,
            config.max_tile_loads_per_frame,
            config.max_tiles_per_update_list,
            pool.clone(),
            command_sender,
            notices,
            feedback_consumer,
            event_receiver,
            stats.clone(),
        );
        let engine_thread = thread::Builder::new()
            .name("tile-residency".into())
            .spawn(move || engine.run())
            .expect("spawning residency engine thread");

        Self {
            config,
            resources: SlotMap::with_key(),
            events: event_sender,
            feedback: feedback_producer,
            stats,
            pool,
            engine_thread: Some(engine_thread),
            worker_thread: Some(worker_thread),
            frame: 0,
            shutdown_started: false,
        }
    }

    pub fn register_resource(
        &mut self,
        source: Arc<dyn TileSource>,
    ) -> Result<ResourceKey, StreamingError> {
        if self.shutdown_started {
            return Err(StreamingError::ShutdownInProgress);
        }
        let chain = source.mip_chain();
        let shared = Arc::new(ResourceShared {
            min_mip: ArcSwap::from_pointee(MinMipSnapshot {
                width_tiles: chain.map_width_tiles(),
                height_tiles: chain.map_height_tiles(),
                num_standard_mips: chain.num_standard_mips(),
                version: 0,
                bytes: vec![chain.num_standard_mips(); chain.map_len()].into_boxed_slice(),
            }),
            drawable: AtomicBool::new(false),
            feedback_len: chain.map_len(),
        });
        let resource = self.resources.insert(shared.clone());
        self.send_event(EngineEvent::Register {
            resource,
            source,
            shared,
        });
        Ok(resource)
    }

    /// Posts the latest desired-mip feedback for a resource. Lossy: when the
    /// ring is full the frame is dropped and counted, never blocked on.
    pub fn set_feedback(
        &mut self,
        resource: ResourceKey,
        feedback: &[u8],
    ) -> Result<(), StreamingError> {
        if self.shutdown_started {
            return Err(StreamingError::ShutdownInProgress);
        }
        let shared = self
            .resources
            .get(resource)
            .ok_or(StreamingError::UnknownResource)?;
        if feedback.len() != shared.feedback_len {
            return Err(StreamingError::FeedbackSizeMismatch {
                expected: shared.feedback_len,
                actual: feedback.len(),
            });
        }
        let frame = FeedbackFrame {
            resource,
            bytes: feedback.into(),
        };
        if self.feedback.push(frame).is_err() {
            StreamingStats::bump(&self.stats.feedback_frames_dropped, 1);
            return Ok(());
        }
        // Best-effort wake-up; the engine drains the ring on the next tick
        // anyway.
        let _ = self.events.try_send(EngineEvent::FeedbackPosted);
        Ok(())
    }

    pub fn begin_frame(&mut self) {
        self.frame += 1;
    }

    /// Emits the frame tick that ages the eviction delay and runs one
    /// feedback-processing pass.
    pub fn end_frame(&mut self) {
        if self.shutdown_started {
            return;
        }
        self.send_event(EngineEvent::FrameTick { frame: self.frame });
    }

    /// True once the resource's packed mips are resident: the coarsest
    /// detail can be sampled, so the resource may be drawn.
    pub fn drawable(&self, resource: ResourceKey) -> Result<bool, StreamingError> {
        self.resources
            .get(resource)
            .map(|shared| shared.drawable.load(Ordering::Acquire))
            .ok_or(StreamingError::UnknownResource)
    }

    pub fn min_mip_map(
        &self,
        resource: ResourceKey,
    ) -> Result<Arc<MinMipSnapshot>, StreamingError> {
        self.resources
            .get(resource)
            .map(|shared| shared.min_mip.load_full())
            .ok_or(StreamingError::UnknownResource)
    }

    pub fn statistics(&self) -> StatisticsSnapshot {
        let in_flight = (self.pool.capacity() - self.pool.available()) as u64;
        StatisticsSnapshot::gather(&self.stats, self.config.heap_capacity_tiles, in_flight)
    }

    /// Stops both threads, draining outstanding update lists first so GPU
    /// mappings are coherent at teardown. Idempotent.
    pub fn shutdown(&mut self) {
        if self.shutdown_started {
            return;
        }
        self.shutdown_started = true;
        let _ = self.events.send(EngineEvent::Shutdown);
        if let Some(handle) = self.engine_thread.take() {
            if handle.join().is_err() {
                log::error!("[manager] residency engine thread panicked");
            }
        }
        if let Some(handle) = self.worker_thread.take() {
            if handle.join().is_err() {
                log::error!("[manager] upload worker thread panicked");
            }
        }
    }

    fn send_event(&self, event: EngineEvent) {
        if self.events.send(event).is_err() {
            panic!("residency engine event channel disconnected");
        }
    }
}

impl Drop for StreamingManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
