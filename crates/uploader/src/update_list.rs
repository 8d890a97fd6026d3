use crossbeam_queue::ArrayQueue;
use model::TileCoord;
use smallvec::SmallVec;
use stream_protocol::{FenceValue, ReadRequest, ResourceKey, TileFileRange};
use tile_heap::HeapSlot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateListState {
    Free,
    Allocated,
    UploadInProgress,
    MappingDone,
    CopyInProgress,
    Notify,
}

/// Packed-region bootstrap carried by a registration-time update list.
#[derive(Debug, Clone)]
pub struct PackedMipLoad {
    pub slots: Vec<HeapSlot>,
    pub file_range: TileFileRange,
}

/// One unit of upload work for one resource: tiles to map and stream in,
/// tiles to un-map, and the copy fence the batch waits on.
///
/// Built by the residency engine, executed by the upload worker; the two
/// never touch a list at the same time because ownership moves through the
/// command channel and back through the pool.
#[derive(Debug)]
pub struct UpdateList {
    resource: ResourceKey,
    state: UpdateListState,
    pub loads: Vec<ReadRequest>,
    pub evict_coords: Vec<TileCoord>,
    pub packed: Option<PackedMipLoad>,
    pub failed: SmallVec<[TileCoord; 4]>,
    copy_fence: Option<FenceValue>,
    packed_failed: bool,
}

impl UpdateList {
    pub fn new() -> Self {
        Self {
            resource: ResourceKey::default(),
            state: UpdateListState::Free,
            loads: Vec::new(),
            evict_coords: Vec::new(),
            packed: None,
            failed: SmallVec::new(),
            copy_fence: None,
            packed_failed: false,
        }
    }

    /// `Free` -> `Allocated`: the engine starts populating the list.
    pub fn begin(&mut self, resource: ResourceKey) {
        self.advance(UpdateListState::Allocated);
        self.resource = resource;
        self.loads.clear();
        self.evict_coords.clear();
        self.packed = None;
        self.failed.clear();
        self.copy_fence = None;
        self.packed_failed = false;
    }

    pub fn resource(&self) -> ResourceKey {
        self.resource
    }

    pub fn state(&self) -> UpdateListState {
        self.state
    }

    pub fn is_empty(&self) -> bool {
        self.loads.is_empty() && self.evict_coords.is_empty() && self.packed.is_none()
    }

    pub fn advance(&mut self, to: UpdateListState) {
        use UpdateListState::*;
        let legal = matches!(
            (self.state, to),
            (Free, Allocated)
                | (Allocated, UploadInProgress)
                | (UploadInProgress, MappingDone)
                | (MappingDone, CopyInProgress)
                | (CopyInProgress, Notify)
                | (Notify, Free)
                | (Allocated, Free)
        );
        if !legal {
            panic!(
                "illegal update list transition {:?} -> {:?}",
                self.state, to
            );
        }
        self.state = to;
    }

    pub fn set_copy_fence(&mut self, fence: FenceValue) {
        self.copy_fence = Some(fence);
    }

    pub fn copy_fence(&self) -> Option<FenceValue> {
        self.copy_fence
    }

    pub fn mark_packed_failed(&mut self) {
        self.packed_failed = true;
    }

    pub fn packed_failed(&self) -> bool {
        self.packed_failed
    }

    fn recycle(&mut self) {
        if self.state != UpdateListState::Free {
            self.advance(UpdateListState::Free);
        }
        self.resource = ResourceKey::default();
        self.loads.clear();
        self.evict_coords.clear();
        self.packed = None;
        self.failed.clear();
        self.copy_fence = None;
        self.packed_failed = false;
    }
}

impl Default for UpdateList {
    fn default() -> Self {
        Self::new()
    }
}

/// Fixed pool of recyclable update lists shared by the engine (acquire) and
/// the upload worker (release). An empty pool is the engine's backpressure
/// signal: packaging waits for the worker to catch up.
#[derive(Debug)]
pub struct UpdateListPool {
    queue: ArrayQueue<Box<UpdateList>>,
    capacity: usize,
}

impl UpdateListPool {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "update list pool capacity must be at least 1");
        let queue = ArrayQueue::new(capacity);
        for _ in 0..capacity {
            queue
                .push(Box::new(UpdateList::new()))
                .expect("prefilling update list pool");
        }
        Self { queue, capacity }
    }

    /// Pops a `Free` list, or `None` when every list is in flight.
    pub fn acquire(&self) -> Option<Box<UpdateList>> {
        self.queue.pop()
    }

    pub fn release(&self, mut list: Box<UpdateList>) {
        list.recycle();
        if self.queue.push(list).is_err() {
            panic!("update list pool overflow: more releases than capacity");
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.queue.len()
    }

    /// True once every list has come back; used by shutdown to know the
    /// worker has drained.
    pub fn all_returned(&self) -> bool {
        self.queue.len() == self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::{UpdateList, UpdateListPool, UpdateListState};
    use stream_protocol::{FenceValue, ResourceKey};

    #[test]
    fn lifecycle_walks_every_state_in_order() {
        let mut list = UpdateList::new();
        list.begin(ResourceKey::default());
        assert_eq!(list.state(), UpdateListState::Allocated);
        list.advance(UpdateListState::UploadInProgress);
        list.advance(UpdateListState::MappingDone);
        list.set_copy_fence(FenceValue(1));
        list.advance(UpdateListState::CopyInProgress);
        list.advance(UpdateListState::Notify);
        list.advance(UpdateListState::Free);
    }

    #[test]
    #[should_panic(expected = "illegal update list transition")]
    fn copy_cannot_start_before_mapping_is_done() {
        let mut list = UpdateList::new();
        list.begin(ResourceKey::default());
        list.advance(UpdateListState::CopyInProgress);
    }

    #[test]
    #[should_panic(expected = "illegal update list transition")]
    fn free_list_cannot_be_submitted() {
        let mut list = UpdateList::new();
        list.advance(UpdateListState::UploadInProgress);
    }

    #[test]
    fn abandoned_allocation_returns_to_free() {
        let mut list = UpdateList::new();
        list.begin(ResourceKey::default());
        list.advance(UpdateListState::Free);
    }

    #[test]
    fn pool_recycles_and_backpressures() {
        let pool = UpdateListPool::new(2);
        let first = pool.acquire().unwrap();
        let second = pool.acquire().unwrap();
        assert!(pool.acquire().is_none());
        assert!(!pool.all_returned());

        pool.release(first);
        pool.release(second);
        assert!(pool.all_returned());

        let reused = pool.acquire().unwrap();
        assert_eq!(reused.state(), UpdateListState::Free);
    }

    #[test]
    fn begin_clears_previous_contents() {
        let pool = UpdateListPool::new(1);
        let mut list = pool.acquire().unwrap();
        list.begin(ResourceKey::default());
        list.set_copy_fence(FenceValue(9));
        list.advance(UpdateListState::UploadInProgress);
        list.advance(UpdateListState::MappingDone);
        list.advance(UpdateListState::CopyInProgress);
        list.advance(UpdateListState::Notify);
        pool.release(list);

        let mut list = pool.acquire().unwrap();
        list.begin(ResourceKey::default());
        assert!(list.is_empty());
        assert_eq!(list.copy_fence(), None);
    }
}
