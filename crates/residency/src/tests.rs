use model::{TileCoord, TileMipChain};
use tile_heap::{HeapSlot, TileHeapAllocator};

use crate::{ResidencyState, TileResidency};

const FRAMES_IN_FLIGHT: usize = 3;

// 4x4 tiles at mip 0, three standard mips: 16 + 4 + 1 = 21 tiles.
// Feedback of all-0 wants all 21, all-1 wants 5, all-2 wants only the
// coarsest tile (and clamping means it can never be released by feedback).
fn state() -> ResidencyState {
    ResidencyState::new(TileMipChain::new(4, 4, 3).unwrap(), FRAMES_IN_FLIGHT)
}

/// One engine-tick worth of load packaging against a real allocator.
fn package_loads(
    state: &mut ResidencyState,
    allocator: &mut TileHeapAllocator,
    budget: usize,
) -> Vec<(TileCoord, HeapSlot)> {
    let mut out = Vec::new();
    let mut budget = budget;
    state.collect_loads(&mut budget, || allocator.allocate().ok(), &mut out);
    out
}

fn complete_loads(state: &mut ResidencyState, loads: &[(TileCoord, HeapSlot)]) {
    let coords: Vec<TileCoord> = loads.iter().map(|(coord, _)| *coord).collect();
    state.notify_copies_complete(&coords);
}

fn age_out_evictions(state: &mut ResidencyState) {
    for _ in 0..FRAMES_IN_FLIGHT {
        state.advance_frame();
        state.rescue();
    }
}

#[test]
fn feedback_load_copy_cycle_refines_the_map() {
    let mut state = state();
    let mut allocator = TileHeapAllocator::new(32);

    let outcome = state.apply_feedback(&[2; 16]).unwrap();
    assert_eq!(outcome.loads_requested, 1);

    let loads = package_loads(&mut state, &mut allocator, 64);
    assert_eq!(loads.len(), 1);
    assert_eq!(loads[0].0, TileCoord::new(0, 0, 2));

    complete_loads(&mut state, &loads);
    assert!(state.rebuild_residency_map());
    assert!(state.residency_map_bytes().iter().all(|&byte| byte == 2));
    state.audit_invariants();
}

#[test]
fn unpackaged_loads_are_cancelled_without_io() {
    let mut state = state();
    let mut allocator = TileHeapAllocator::new(32);

    state.apply_feedback(&[0; 16]).unwrap();
    // Demand collapses before the engine packages anything.
    state.apply_feedback(&[2; 16]).unwrap();

    let loads = package_loads(&mut state, &mut allocator, 64);
    // Only the still-wanted coarsest tile reaches the heap.
    assert_eq!(loads.len(), 1);
    assert_eq!(loads[0].0, TileCoord::new(0, 0, 2));
    assert_eq!(allocator.allocated(), 1);
    assert_eq!(state.pending_load_count(), 0);
    assert_eq!(
        state.mapping().residency(TileCoord::new(0, 0, 0)),
        TileResidency::NotResident
    );
    state.audit_invariants();
}

#[test]
fn tiles_unwanted_while_loading_become_resident_then_evict() {
    let mut state = state();
    let mut allocator = TileHeapAllocator::new(32);

    let outcome = state.apply_feedback(&[1; 16]).unwrap();
    assert_eq!(outcome.loads_requested, 5);
    let loads = package_loads(&mut state, &mut allocator, 64);
    assert_eq!(loads.len(), 5);

    // The four mip-1 references disappear while the copies are in flight.
    state.apply_feedback(&[2; 16]).unwrap();
    for (coord, _) in &loads {
        assert_eq!(state.mapping().residency(*coord), TileResidency::Loading);
    }

    // Copies retire; the zero-ref tiles go straight to the eviction delay.
    let coords: Vec<TileCoord> = loads.iter().map(|(coord, _)| *coord).collect();
    assert_eq!(state.notify_copies_complete(&coords), 4);
    state.audit_invariants();

    age_out_evictions(&mut state);
    let mut evictions = Vec::new();
    let collect = state.collect_evictions(16, &mut evictions);
    assert_eq!(collect.packaged, 4);

    let mut freed = Vec::new();
    state.notify_evictions_complete(&evictions, &mut freed);
    allocator.free_batch(freed);
    // Only the coarsest tile keeps its slot.
    assert_eq!(allocator.allocated(), 1);
    for coord in &evictions {
        assert_eq!(state.mapping().residency(*coord), TileResidency::NotResident);
    }
    state.audit_invariants();
}

#[test]
fn rescued_tiles_skip_io_and_keep_their_slots() {
    let mut state = state();
    let mut allocator = TileHeapAllocator::new(32);

    state.apply_feedback(&[1; 16]).unwrap();
    let loads = package_loads(&mut state, &mut allocator, 64);
    complete_loads(&mut state, &loads);

    // Drop the mip-1 references; four tiles queue for delayed eviction.
    state.apply_feedback(&[2; 16]).unwrap();
    assert_eq!(state.eviction_delay().pending_len(), 4);

    // One frame later the renderer wants them again.
    state.advance_frame();
    state.rescue();
    let outcome = state.apply_feedback(&[1; 16]).unwrap();
    assert_eq!(outcome.rescue_candidates, 4);
    assert_eq!(outcome.loads_requested, 0);

    state.advance_frame();
    assert_eq!(state.rescue(), 4);
    assert!(state.eviction_delay().is_empty());
    for (coord, slot) in &loads {
        assert_eq!(state.mapping().residency(*coord), TileResidency::Resident);
        assert_eq!(state.mapping().heap_slot(*coord), Some(*slot));
    }
    assert_eq!(state.pending_load_count(), 0);
    state.audit_invariants();
}

#[test]
fn reref_after_aging_out_is_caught_at_packaging() {
    let mut state = state();
    let mut allocator = TileHeapAllocator::new(32);

    state.apply_feedback(&[1; 16]).unwrap();
    let loads = package_loads(&mut state, &mut allocator, 64);
    complete_loads(&mut state, &loads);

    state.apply_feedback(&[2; 16]).unwrap();
    age_out_evictions(&mut state);
    // The evictions aged out, then the tiles are wanted again in the same
    // tick, after this frame's rescue pass already ran.
    state.apply_feedback(&[1; 16]).unwrap();

    let mut evictions = Vec::new();
    let collect = state.collect_evictions(16, &mut evictions);
    assert!(evictions.is_empty());
    assert_eq!(collect.rescued, 4);
    for (coord, _) in &loads {
        assert_eq!(state.mapping().residency(*coord), TileResidency::Resident);
    }
    state.audit_invariants();
}

#[test]
fn heap_exhaustion_defers_loads_and_recovers() {
    let mut state = state();
    let mut allocator = TileHeapAllocator::new(4);

    // Finest feedback wants all 21 tiles; only 4 slots exist.
    let outcome = state.apply_feedback(&[0; 16]).unwrap();
    assert_eq!(outcome.loads_requested, 21);

    let mut loads = Vec::new();
    let mut budget = 64;
    let collect = state.collect_loads(&mut budget, || allocator.allocate().ok(), &mut loads);
    assert_eq!(loads.len(), 4);
    assert_eq!(state.pending_load_count(), 17);
    // Every unserved tile counts as deferred exactly once.
    assert_eq!(collect.newly_deferred, 17);
    assert!(collect.heap_exhausted);
    state.audit_invariants();

    // Retrying against the still-full heap is not a new deferral event.
    let mut retry = Vec::new();
    let mut budget = 64;
    let collect = state.collect_loads(&mut budget, || allocator.allocate().ok(), &mut retry);
    assert!(retry.is_empty());
    assert_eq!(collect.newly_deferred, 0);
    assert!(collect.heap_exhausted);

    // Demand collapses to the coarsest mip. Deferred loads cancel; the four
    // mapped tiles head for eviction; the coarsest tile stays queued because
    // the heap is still full.
    complete_loads(&mut state, &loads);
    state.apply_feedback(&[2; 16]).unwrap();
    let packaged = package_loads(&mut state, &mut allocator, 64);
    assert!(packaged.is_empty());
    assert_eq!(state.pending_load_count(), 1);

    age_out_evictions(&mut state);
    let mut evictions = Vec::new();
    state.collect_evictions(16, &mut evictions);
    assert_eq!(evictions.len(), 4);
    let mut freed = Vec::new();
    state.notify_evictions_complete(&evictions, &mut freed);
    allocator.free_batch(freed);

    // Freed slots unblock the deferred coarsest-tile load.
    let reloads = package_loads(&mut state, &mut allocator, 64);
    assert_eq!(reloads.len(), 1);
    assert_eq!(reloads[0].0, TileCoord::new(0, 0, 2));
    assert_eq!(allocator.allocated(), 1);
    state.audit_invariants();
}

#[test]
fn failed_load_requeues_wanted_tiles() {
    let mut state = state();
    let mut allocator = TileHeapAllocator::new(8);

    state.apply_feedback(&[2; 16]).unwrap();
    let loads = package_loads(&mut state, &mut allocator, 64);
    let coord = loads[0].0;

    let mut freed = Vec::new();
    let requeued = state.notify_load_failures(&[coord], &mut freed);
    assert_eq!(requeued, 1);
    allocator.free_batch(freed);
    assert_eq!(state.mapping().residency(coord), TileResidency::NotResident);
    assert_eq!(state.pending_load_count(), 1);
    state.audit_invariants();

    // The retry packages like any other pending load.
    let retried = package_loads(&mut state, &mut allocator, 64);
    assert_eq!(retried.len(), 1);
    assert_eq!(retried[0].0, coord);
}

#[test]
fn blocked_reload_waits_for_the_unmap() {
    let mut state = state();
    let mut allocator = TileHeapAllocator::new(8);

    state.apply_feedback(&[1; 16]).unwrap();
    let loads = package_loads(&mut state, &mut allocator, 64);
    complete_loads(&mut state, &loads);

    state.apply_feedback(&[2; 16]).unwrap();
    age_out_evictions(&mut state);
    let mut evictions = Vec::new();
    state.collect_evictions(16, &mut evictions);
    assert_eq!(evictions.len(), 4);

    // Wanted again while the unmaps are still with the upload worker.
    state.apply_feedback(&[1; 16]).unwrap();
    let blocked = package_loads(&mut state, &mut allocator, 64);
    assert!(blocked.is_empty());
    assert_eq!(state.pending_load_count(), 4);
    state.audit_invariants();

    let mut freed = Vec::new();
    state.notify_evictions_complete(&evictions, &mut freed);
    allocator.free_batch(freed);

    let reloads = package_loads(&mut state, &mut allocator, 64);
    assert_eq!(reloads.len(), 4);
    state.audit_invariants();
}

#[test]
fn load_budget_caps_packaging_per_tick() {
    let mut state = state();
    let mut allocator = TileHeapAllocator::new(32);

    state.apply_feedback(&[0; 16]).unwrap();
    let first = package_loads(&mut state, &mut allocator, 8);
    assert_eq!(first.len(), 8);
    let second = package_loads(&mut state, &mut allocator, 8);
    assert_eq!(second.len(), 8);
    assert_eq!(state.pending_load_count(), 5);
    state.audit_invariants();
}
