use model::TILE_SIZE_BYTES;

/// Index of one 64 KiB slot in the shared tile heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeapSlot(u32);

impl HeapSlot {
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Byte offset of this slot in the heap / upload staging buffer.
    pub const fn byte_offset(self) -> u64 {
        self.0 as u64 * TILE_SIZE_BYTES as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapAllocError {
    OutOfSlots,
}

impl std::fmt::Display for HeapAllocError {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HeapAllocError::OutOfSlots => write!(formatter, "tile heap has no free slots"),
        }
    }
}

impl std::error::Error for HeapAllocError {}

/// Free list over a fixed number of tile slots.
///
/// Slots handed out by a single `allocate_batch` call are distinct; beyond
/// that, no ordering is promised. Driven exclusively from the residency
/// engine thread, so no interior synchronization.
#[derive(Debug)]
pub struct TileHeapAllocator {
    capacity: u32,
    next_slot: u32,
    freelist: Vec<HeapSlot>,
}

impl TileHeapAllocator {
    pub fn new(capacity: u32) -> Self {
        Self {
            capacity,
            next_slot: 0,
            freelist: Vec::new(),
        }
    }

    pub fn allocate(&mut self) -> Result<HeapSlot, HeapAllocError> {
        if let Some(slot) = self.freelist.pop() {
            return Ok(slot);
        }
        if self.next_slot >= self.capacity {
            return Err(HeapAllocError::OutOfSlots);
        }
        let slot = HeapSlot::new(self.next_slot);
        self.next_slot += 1;
        Ok(slot)
    }

    /// Allocates up to `count` slots; short when the heap runs out.
    pub fn allocate_batch(&mut self, count: usize) -> Vec<HeapSlot> {
        let mut slots = Vec::with_capacity(count);
        for _ in 0..count {
            match self.allocate() {
                Ok(slot) => slots.push(slot),
                Err(HeapAllocError::OutOfSlots) => break,
            }
        }
        slots
    }

    pub fn free(&mut self, slot: HeapSlot) {
        debug_assert!(slot.raw() < self.next_slot, "freeing never-allocated slot");
        debug_assert!(
            !self.freelist.contains(&slot),
            "double free of heap slot {}",
            slot.raw()
        );
        self.freelist.push(slot);
    }

    pub fn free_batch(&mut self, slots: impl IntoIterator<Item = HeapSlot>) {
        for slot in slots {
            self.free(slot);
        }
    }

    pub const fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn allocated(&self) -> u32 {
        self.next_slot - self.freelist.len() as u32
    }

    pub fn free_slots(&self) -> u32 {
        self.capacity - self.allocated()
    }
}
