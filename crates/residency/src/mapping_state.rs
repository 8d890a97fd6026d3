use model::{TileCoord, TileMipChain};
use tile_heap::HeapSlot;

use crate::residency_invariant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileResidency {
    NotResident,
    Loading,
    Resident,
    Evicting,
}

/// What `add_ref` asks the caller to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddRefOutcome {
    /// First reference to an unmapped tile: queue a load. Also returned for a
    /// tile whose un-mapping is still in flight; the load stays queued until
    /// the tile returns to `NotResident`.
    QueueLoad,
    /// First reference to a resident tile awaiting eviction: the eviction
    /// queue must rescue it. No I/O.
    PendingEvictionRescue,
    /// A load is already in flight.
    LoadInFlight,
    /// The tile already had references.
    AlreadyCounted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecRefOutcome {
    /// Last reference dropped on a resident tile: enqueue delayed eviction.
    QueueEviction,
    /// Last reference dropped while the copy is in flight. The tile becomes
    /// `Resident` when the copy retires; eviction is decided then.
    LoadInFlight,
    /// Last reference dropped on a tile whose load was still deferred; the
    /// pending load is now cancellable.
    DeferredLoadDropped,
    StillWanted,
}

#[derive(Debug, Clone, Copy)]
struct TileState {
    ref_count: u32,
    residency: TileResidency,
    heap_slot: Option<HeapSlot>,
}

impl TileState {
    const fn empty() -> Self {
        Self {
            ref_count: 0,
            residency: TileResidency::NotResident,
            heap_slot: None,
        }
    }
}

/// Per-tile refcount, residency and heap assignment for one resource's
/// standard mips. Single-writer: only the residency engine thread mutates it.
///
/// Order-of-operations rules (violations are defects):
/// 1. a tile is only evicted from `Resident`, never from `Loading`, because
///    the pending copy still targets the heap slot;
/// 2. a tile only begins `Loading` from `NotResident`; a zero-ref `Resident`
///    tile that regains a reference is rescued from the eviction queue
///    instead and skips I/O.
#[derive(Debug)]
pub struct TileMappingState {
    chain: TileMipChain,
    tiles: Vec<TileState>,
}

impl TileMappingState {
    pub fn new(chain: TileMipChain) -> Self {
        let tiles = vec![TileState::empty(); chain.num_standard_tiles() as usize];
        Self { chain, tiles }
    }

    pub fn chain(&self) -> &TileMipChain {
        &self.chain
    }

    fn tile(&self, coord: TileCoord) -> &TileState {
        &self.tiles[self.chain.linear_index(coord) as usize]
    }

    fn tile_mut(&mut self, coord: TileCoord) -> &mut TileState {
        let index = self.chain.linear_index(coord) as usize;
        &mut self.tiles[index]
    }

    pub fn residency(&self, coord: TileCoord) -> TileResidency {
        self.tile(coord).residency
    }

    pub fn ref_count(&self, coord: TileCoord) -> u32 {
        self.tile(coord).ref_count
    }

    pub fn heap_slot(&self, coord: TileCoord) -> Option<HeapSlot> {
        self.tile(coord).heap_slot
    }

    pub fn is_resident(&self, coord: TileCoord) -> bool {
        self.tile(coord).residency == TileResidency::Resident
    }

    pub fn add_ref(&mut self, coord: TileCoord) -> AddRefOutcome {
        let tile = self.tile_mut(coord);
        tile.ref_count += 1;
        if tile.ref_count > 1 {
            return AddRefOutcome::AlreadyCounted;
        }
        match tile.residency {
            TileResidency::NotResident | TileResidency::Evicting => AddRefOutcome::QueueLoad,
            TileResidency::Resident => AddRefOutcome::PendingEvictionRescue,
            TileResidency::Loading => AddRefOutcome::LoadInFlight,
        }
    }

    pub fn dec_ref(&mut self, coord: TileCoord) -> DecRefOutcome {
        let tile = self.tile_mut(coord);
        residency_invariant!(
            tile.ref_count > 0,
            "ref underflow on tile ({}, {}, mip {})",
            coord.x,
            coord.y,
            coord.mip
        );
        tile.ref_count = tile.ref_count.saturating_sub(1);
        if tile.ref_count > 0 {
            return DecRefOutcome::StillWanted;
        }
        match tile.residency {
            TileResidency::Resident => DecRefOutcome::QueueEviction,
            TileResidency::Loading => DecRefOutcome::LoadInFlight,
            TileResidency::NotResident | TileResidency::Evicting => {
                DecRefOutcome::DeferredLoadDropped
            }
        }
    }

    /// `NotResident` -> `Loading` with a freshly allocated heap slot.
    pub fn begin_load(&mut self, coord: TileCoord, slot: HeapSlot) {
        let tile = self.tile_mut(coord);
        residency_invariant!(
            tile.residency == TileResidency::NotResident && tile.heap_slot.is_none(),
            "load begun on tile ({}, {}, mip {}) in state {:?}",
            coord.x,
            coord.y,
            coord.mip,
            tile.residency
        );
        tile.residency = TileResidency::Loading;
        tile.heap_slot = Some(slot);
    }

    /// `Loading` -> `Resident`; the copy fence for this tile has retired.
    pub fn copy_complete(&mut self, coord: TileCoord) {
        let tile = self.tile_mut(coord);
        residency_invariant!(
            tile.residency == TileResidency::Loading,
            "copy completion for tile ({}, {}, mip {}) in state {:?}",
            coord.x,
            coord.y,
            coord.mip,
            tile.residency
        );
        tile.residency = TileResidency::Resident;
    }

    /// `Resident` (zero refs) -> `Evicting`; the un-mapping is being handed
    /// to the upload worker.
    pub fn begin_evict(&mut self, coord: TileCoord) {
        let tile = self.tile_mut(coord);
        residency_invariant!(
            tile.residency == TileResidency::Resident && tile.ref_count == 0,
            "eviction begun on tile ({}, {}, mip {}) in state {:?} with {} refs",
            coord.x,
            coord.y,
            coord.mip,
            tile.residency,
            tile.ref_count
        );
        tile.residency = TileResidency::Evicting;
    }

    /// `Evicting` -> `NotResident`; returns the heap slot to recycle.
    pub fn evict_complete(&mut self, coord: TileCoord) -> HeapSlot {
        let tile = self.tile_mut(coord);
        residency_invariant!(
            tile.residency == TileResidency::Evicting,
            "eviction completion for tile ({}, {}, mip {}) in state {:?}",
            coord.x,
            coord.y,
            coord.mip,
            tile.residency
        );
        tile.residency = TileResidency::NotResident;
        tile.heap_slot
            .take()
            .expect("evicting tile holds a heap slot")
    }

    /// `Loading` -> `NotResident` after a failed read; returns the slot.
    pub fn load_failed(&mut self, coord: TileCoord) -> HeapSlot {
        let tile = self.tile_mut(coord);
        residency_invariant!(
            tile.residency == TileResidency::Loading,
            "load failure for tile ({}, {}, mip {}) in state {:?}",
            coord.x,
            coord.y,
            coord.mip,
            tile.residency
        );
        tile.residency = TileResidency::NotResident;
        tile.heap_slot
            .take()
            .expect("loading tile holds a heap slot")
    }

    pub fn assigned_slots(&self) -> impl Iterator<Item = (TileCoord, HeapSlot)> + '_ {
        self.tiles.iter().enumerate().filter_map(|(index, tile)| {
            tile.heap_slot
                .map(|slot| (self.chain.coord_of_linear(index as u32), slot))
        })
    }

    pub fn resident_tile_count(&self) -> u32 {
        self.tiles
            .iter()
            .filter(|tile| tile.residency == TileResidency::Resident)
            .count() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::{AddRefOutcome, DecRefOutcome, TileMappingState, TileResidency};
    use model::{TileCoord, TileMipChain};
    use tile_heap::HeapSlot;

    fn state() -> TileMappingState {
        TileMappingState::new(TileMipChain::new(4, 4, 3).unwrap())
    }

    #[test]
    fn first_ref_on_unmapped_tile_queues_load() {
        let mut mapping = state();
        let coord = TileCoord::new(1, 2, 0);
        assert_eq!(mapping.add_ref(coord), AddRefOutcome::QueueLoad);
        assert_eq!(mapping.add_ref(coord), AddRefOutcome::AlreadyCounted);
        assert_eq!(mapping.ref_count(coord), 2);
        assert_eq!(mapping.residency(coord), TileResidency::NotResident);
    }

    #[test]
    fn load_then_copy_completion_reaches_resident() {
        let mut mapping = state();
        let coord = TileCoord::new(0, 0, 1);
        mapping.add_ref(coord);
        mapping.begin_load(coord, HeapSlot::new(7));
        assert_eq!(mapping.residency(coord), TileResidency::Loading);
        mapping.copy_complete(coord);
        assert_eq!(mapping.residency(coord), TileResidency::Resident);
        assert_eq!(mapping.heap_slot(coord), Some(HeapSlot::new(7)));
    }

    #[test]
    fn last_ref_on_resident_tile_requests_eviction() {
        let mut mapping = state();
        let coord = TileCoord::new(0, 0, 0);
        mapping.add_ref(coord);
        mapping.begin_load(coord, HeapSlot::new(0));
        mapping.copy_complete(coord);
        assert_eq!(mapping.dec_ref(coord), DecRefOutcome::QueueEviction);
    }

    #[test]
    fn last_ref_while_loading_defers_eviction_decision() {
        let mut mapping = state();
        let coord = TileCoord::new(0, 0, 0);
        mapping.add_ref(coord);
        mapping.begin_load(coord, HeapSlot::new(0));
        assert_eq!(mapping.dec_ref(coord), DecRefOutcome::LoadInFlight);
        // Tile must not be evicted from Loading; the copy still owns the slot.
        assert_eq!(mapping.residency(coord), TileResidency::Loading);
    }

    #[test]
    fn reref_of_zero_ref_resident_tile_is_a_rescue_not_a_load() {
        let mut mapping = state();
        let coord = TileCoord::new(2, 2, 0);
        mapping.add_ref(coord);
        mapping.begin_load(coord, HeapSlot::new(3));
        mapping.copy_complete(coord);
        mapping.dec_ref(coord);
        assert_eq!(mapping.add_ref(coord), AddRefOutcome::PendingEvictionRescue);
        assert_eq!(mapping.heap_slot(coord), Some(HeapSlot::new(3)));
    }

    #[test]
    fn eviction_round_trip_returns_the_slot() {
        let mut mapping = state();
        let coord = TileCoord::new(3, 1, 0);
        mapping.add_ref(coord);
        mapping.begin_load(coord, HeapSlot::new(11));
        mapping.copy_complete(coord);
        mapping.dec_ref(coord);
        mapping.begin_evict(coord);
        assert_eq!(mapping.evict_complete(coord), HeapSlot::new(11));
        assert_eq!(mapping.residency(coord), TileResidency::NotResident);
        assert_eq!(mapping.heap_slot(coord), None);
    }

    #[test]
    fn reref_during_unmap_queues_a_fresh_load() {
        let mut mapping = state();
        let coord = TileCoord::new(1, 1, 1);
        mapping.add_ref(coord);
        mapping.begin_load(coord, HeapSlot::new(4));
        mapping.copy_complete(coord);
        mapping.dec_ref(coord);
        mapping.begin_evict(coord);
        assert_eq!(mapping.add_ref(coord), AddRefOutcome::QueueLoad);
        // The queued load stays blocked until the unmap completes.
        mapping.evict_complete(coord);
        assert_eq!(mapping.residency(coord), TileResidency::NotResident);
        assert_eq!(mapping.ref_count(coord), 1);
    }

    #[test]
    fn failed_load_releases_the_slot() {
        let mut mapping = state();
        let coord = TileCoord::new(0, 3, 0);
        mapping.add_ref(coord);
        mapping.begin_load(coord, HeapSlot::new(9));
        assert_eq!(mapping.load_failed(coord), HeapSlot::new(9));
        assert_eq!(mapping.residency(coord), TileResidency::NotResident);
        assert_eq!(mapping.ref_count(coord), 1);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "eviction begun")]
    fn eviction_from_loading_is_rejected() {
        let mut mapping = state();
        let coord = TileCoord::new(0, 0, 0);
        mapping.add_ref(coord);
        mapping.begin_load(coord, HeapSlot::new(0));
        mapping.begin_evict(coord);
    }

    #[test]
    fn assigned_slots_lists_every_mapped_tile() {
        let mut mapping = state();
        let first = TileCoord::new(0, 0, 0);
        let second = TileCoord::new(0, 0, 2);
        mapping.add_ref(first);
        mapping.begin_load(first, HeapSlot::new(0));
        mapping.add_ref(second);
        mapping.begin_load(second, HeapSlot::new(1));
        let mut assigned: Vec<_> = mapping.assigned_slots().collect();
        assigned.sort_by_key(|(_, slot)| slot.raw());
        assert_eq!(assigned, [(first, HeapSlot::new(0)), (second, HeapSlot::new(1))]);
    }
}
