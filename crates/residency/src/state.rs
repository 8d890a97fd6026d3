use std::collections::VecDeque;

use bitvec::prelude::{BitVec, Lsb0};
use model::{TileCoord, TileMipChain};
use tile_heap::HeapSlot;

use crate::eviction::EvictionDelay;
use crate::feedback::{FeedbackError, FeedbackTranslator};
use crate::mapping_state::{AddRefOutcome, DecRefOutcome, TileMappingState, TileResidency};
use crate::min_mip::ResidencyMap;
use crate::residency_invariant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FeedbackOutcome {
    pub loads_requested: u64,
    pub rescue_candidates: u64,
    pub evictions_queued: u64,
    pub refs_released: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LoadCollect {
    pub packaged: u64,
    pub cancelled: u64,
    /// Pending loads that hit heap exhaustion for the first time in this
    /// deferral episode. A tile kept waiting across many frames counts once.
    pub newly_deferred: u64,
    pub heap_exhausted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EvictionCollect {
    pub packaged: u64,
    pub rescued: u64,
}

/// Everything the residency engine tracks for one registered resource:
/// per-tile mapping state, the eviction delay ring, the feedback wanted-set
/// and the CPU copy of the min-mip map. Owned and mutated by the engine
/// thread only.
#[derive(Debug)]
pub struct ResidencyState {
    mapping: TileMappingState,
    delay: EvictionDelay,
    translator: FeedbackTranslator,
    residency_map: ResidencyMap,
    pending_loads: VecDeque<TileCoord>,
    pending_load_set: BitVec<usize, Lsb0>,
    deferred_loads: BitVec<usize, Lsb0>,
    map_dirty: bool,
    scratch_added: Vec<TileCoord>,
    scratch_removed: Vec<TileCoord>,
}

impl ResidencyState {
    pub fn new(chain: TileMipChain, frames_in_flight: usize) -> Self {
        let translator = FeedbackTranslator::new(&chain);
        let residency_map = ResidencyMap::new(&chain);
        let tiles = chain.num_standard_tiles() as usize;
        Self {
            mapping: TileMappingState::new(chain),
            delay: EvictionDelay::new(frames_in_flight),
            translator,
            residency_map,
            pending_loads: VecDeque::new(),
            pending_load_set: BitVec::repeat(false, tiles),
            deferred_loads: BitVec::repeat(false, tiles),
            map_dirty: false,
            scratch_added: Vec::new(),
            scratch_removed: Vec::new(),
        }
    }

    pub fn chain(&self) -> &TileMipChain {
        self.mapping.chain()
    }

    pub fn mapping(&self) -> &TileMappingState {
        &self.mapping
    }

    pub fn advance_frame(&mut self) {
        self.delay.next_frame();
    }

    /// Drops queued evictions for tiles that regained references.
    pub fn rescue(&mut self) -> u64 {
        let mapping = &self.mapping;
        self.delay.rescue(|coord| mapping.ref_count(coord) > 0)
    }

    pub fn apply_feedback(&mut self, feedback: &[u8]) -> Result<FeedbackOutcome, FeedbackError> {
        self.scratch_added.clear();
        self.scratch_removed.clear();
        self.translator.apply(
            self.mapping.chain(),
            feedback,
            &mut self.scratch_added,
            &mut self.scratch_removed,
        )?;

        let mut outcome = FeedbackOutcome::default();
        for index in 0..self.scratch_added.len() {
            let coord = self.scratch_added[index];
            match self.mapping.add_ref(coord) {
                AddRefOutcome::QueueLoad => {
                    self.push_pending_load(coord);
                    outcome.loads_requested += 1;
                }
                AddRefOutcome::PendingEvictionRescue => outcome.rescue_candidates += 1,
                AddRefOutcome::LoadInFlight | AddRefOutcome::AlreadyCounted => {}
            }
        }
        for index in 0..self.scratch_removed.len() {
            let coord = self.scratch_removed[index];
            outcome.refs_released += 1;
            match self.mapping.dec_ref(coord) {
                DecRefOutcome::QueueEviction => {
                    self.delay.add(coord);
                    outcome.evictions_queued += 1;
                }
                DecRefOutcome::LoadInFlight
                | DecRefOutcome::DeferredLoadDropped
                | DecRefOutcome::StillWanted => {}
            }
        }
        Ok(outcome)
    }

    fn push_pending_load(&mut self, coord: TileCoord) {
        let index = self.mapping.chain().linear_index(coord) as usize;
        if !self.pending_load_set[index] {
            self.pending_load_set.set(index, true);
            self.pending_loads.push_back(coord);
        }
    }

    pub fn pending_load_count(&self) -> usize {
        self.pending_loads.len()
    }

    /// Moves pending loads into `out`, allocating a heap slot per tile and
    /// marking each `Loading`. Stops at the frame budget or when the heap
    /// runs dry; unserved tiles stay queued with their refcounts intact.
    pub fn collect_loads(
        &mut self,
        budget: &mut usize,
        mut allocate: impl FnMut() -> Option<HeapSlot>,
        out: &mut Vec<(TileCoord, HeapSlot)>,
    ) -> LoadCollect {
        let mut result = LoadCollect::default();
        for _ in 0..self.pending_loads.len() {
            if *budget == 0 {
                break;
            }
            let Some(coord) = self.pending_loads.pop_front() else {
                break;
            };
            let index = self.mapping.chain().linear_index(coord) as usize;
            if self.mapping.ref_count(coord) == 0 {
                // No longer wanted; the load is cancelled before any I/O.
                self.pending_load_set.set(index, false);
                self.deferred_loads.set(index, false);
                result.cancelled += 1;
                continue;
            }
            if self.mapping.residency(coord) != TileResidency::NotResident {
                // Blocked behind an in-flight unmap of the same tile.
                self.pending_loads.push_back(coord);
                continue;
            }
            let Some(slot) = allocate() else {
                self.pending_loads.push_front(coord);
                result.heap_exhausted = true;
                for &waiting in &self.pending_loads {
                    let waiting_index = self.mapping.chain().linear_index(waiting) as usize;
                    if !self.deferred_loads[waiting_index] {
                        self.deferred_loads.set(waiting_index, true);
                        result.newly_deferred += 1;
                    }
                }
                break;
            };
            self.mapping.begin_load(coord, slot);
            self.pending_load_set.set(index, false);
            self.deferred_loads.set(index, false);
            out.push((coord, slot));
            *budget -= 1;
            result.packaged += 1;
        }
        result
    }

    /// Moves up to `max` aged-out evictions into `out`, marking each
    /// `Evicting`. Tiles referenced again since aging out are dropped from
    /// the queue instead (late rescue).
    pub fn collect_evictions(&mut self, max: usize, out: &mut Vec<TileCoord>) -> EvictionCollect {
        let mut result = EvictionCollect::default();
        while (result.packaged as usize) < max {
            let Some(coord) = self.delay.pop_ready() else {
                break;
            };
            if self.mapping.ref_count(coord) > 0 {
                result.rescued += 1;
                continue;
            }
            residency_invariant!(
                self.mapping.residency(coord) == TileResidency::Resident,
                "aged-out eviction for tile ({}, {}, mip {}) in state {:?}",
                coord.x,
                coord.y,
                coord.mip,
                self.mapping.residency(coord)
            );
            if self.mapping.residency(coord) != TileResidency::Resident {
                continue;
            }
            self.mapping.begin_evict(coord);
            self.map_dirty = true;
            out.push(coord);
            result.packaged += 1;
        }
        result
    }

    /// Copy fence retired for these tiles. A tile whose references all went
    /// away while its copy was in flight goes straight into the eviction
    /// delay. Returns how many did.
    pub fn notify_copies_complete(&mut self, coords: &[TileCoord]) -> u64 {
        let mut evictions_queued = 0;
        for &coord in coords {
            self.mapping.copy_complete(coord);
            if self.mapping.ref_count(coord) == 0 {
                self.delay.add(coord);
                evictions_queued += 1;
            }
        }
        if !coords.is_empty() {
            self.map_dirty = true;
        }
        evictions_queued
    }

    /// Un-mapping recorded on the copy queue; slots are safe to recycle.
    pub fn notify_evictions_complete(
        &mut self,
        coords: &[TileCoord],
        freed: &mut Vec<HeapSlot>,
    ) {
        for &coord in coords {
            freed.push(self.mapping.evict_complete(coord));
        }
    }

    /// A read failed twice. Slots are recycled; tiles still wanted re-enter
    /// the pending-load queue. Returns how many were re-queued.
    pub fn notify_load_failures(
        &mut self,
        coords: &[TileCoord],
        freed: &mut Vec<HeapSlot>,
    ) -> u64 {
        let mut requeued = 0;
        for &coord in coords {
            freed.push(self.mapping.load_failed(coord));
            if self.mapping.ref_count(coord) > 0 {
                self.push_pending_load(coord);
                requeued += 1;
            }
        }
        if !coords.is_empty() {
            self.map_dirty = true;
        }
        requeued
    }

    pub fn residency_map_dirty(&self) -> bool {
        self.map_dirty
    }

    /// Rebuilds the min-mip bytes if marked dirty; returns whether the
    /// published bytes changed.
    pub fn rebuild_residency_map(&mut self) -> bool {
        if !self.map_dirty {
            return false;
        }
        self.map_dirty = false;
        let mapping = &self.mapping;
        self.residency_map
            .rebuild(mapping.chain(), |coord| mapping.is_resident(coord))
    }

    pub fn residency_map_bytes(&self) -> &[u8] {
        self.residency_map.as_bytes()
    }

    pub fn eviction_delay(&self) -> &EvictionDelay {
        &self.delay
    }

    pub fn clear_eviction_delay(&mut self) {
        self.delay.clear();
    }

    /// Walks every tile and panics on an inconsistent stable state. Test and
    /// debug aid; not called on hot paths.
    pub fn audit_invariants(&self) {
        let chain = self.mapping.chain();
        for index in 0..chain.num_standard_tiles() {
            let coord = chain.coord_of_linear(index);
            let residency = self.mapping.residency(coord);
            let refs = self.mapping.ref_count(coord);
            let slot = self.mapping.heap_slot(coord);
            let pending = self.pending_load_set[index as usize];

            assert_eq!(
                residency == TileResidency::NotResident,
                slot.is_none(),
                "tile {coord:?}: heap slot {slot:?} inconsistent with {residency:?}"
            );
            if refs > 0 {
                assert!(
                    matches!(residency, TileResidency::Loading | TileResidency::Resident)
                        || pending,
                    "tile {coord:?}: {refs} refs but {residency:?} and no pending load"
                );
            }
            if residency == TileResidency::Resident && refs == 0 {
                assert!(
                    self.delay.contains(coord),
                    "tile {coord:?}: unreferenced resident tile missing from eviction delay"
                );
            }
            if residency == TileResidency::Evicting {
                assert!(
                    refs == 0 || pending,
                    "tile {coord:?}: evicting with {refs} refs and no queued reload"
                );
            }
        }
    }
}
