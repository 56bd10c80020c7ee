//! Port-pair allocator invariants, including the property that every pair
//! ever handed out has an even blue port, an adjacent green port, and is
//! disjoint from every other live allocation.

use buildvigil_agent::{PortAllocator, PortPair};
use proptest::prelude::*;
use std::collections::HashSet;

#[test]
fn pairs_are_disjoint_across_many_services() {
    let allocator = PortAllocator::new(44000, 44060);
    let mut seen = HashSet::new();
    for i in 0..10 {
        let pair = allocator.allocate(&format!("svc-{}", i)).unwrap();
        assert_eq!(pair.blue_port % 2, 0, "blue port must be even");
        assert_eq!(pair.green_port, pair.blue_port + 1);
        assert!(seen.insert(pair.blue_port), "blue port reused");
        assert!(seen.insert(pair.green_port), "green port reused");
    }
}

#[test]
fn reserve_then_get_survives_like_a_restart() {
    // First process allocates, persists, dies.
    let pair = {
        let allocator = PortAllocator::new(44100, 44110);
        allocator.allocate("svc-1").unwrap()
    };

    // Second process reserves the persisted pair.
    let allocator = PortAllocator::new(44100, 44110);
    allocator.reserve("svc-1", pair).unwrap();
    assert_eq!(allocator.get("svc-1"), Some(pair));

    // Another service cannot take any member of the reserved pair.
    let other = allocator.allocate("svc-2").unwrap();
    assert!(!other.contains(pair.blue_port));
    assert!(!other.contains(pair.green_port));
}

#[test]
fn reservation_conflict_names_the_other_service() {
    let allocator = PortAllocator::new(44120, 44130);
    allocator.reserve("svc-a", PortPair::new(44120)).unwrap();
    let err = allocator
        .reserve(
            "svc-b",
            PortPair {
                blue_port: 44121,
                green_port: 44122,
            },
        )
        .unwrap_err();
    let message = err.to_string();
    assert!(message.contains("svc-b"));
    assert!(message.contains("svc-a"));
}

#[test]
fn exhaustion_surfaces_after_the_range_is_full() {
    let allocator = PortAllocator::new(44140, 44143);
    allocator.allocate("svc-1").unwrap();
    allocator.allocate("svc-2").unwrap();
    let err = allocator.allocate("svc-3").unwrap_err();
    assert!(err.to_string().contains("no available port pairs"));
}

proptest! {
    #[test]
    fn allocation_invariants_hold_for_arbitrary_service_sets(
        service_count in 1usize..8,
        release_mask in 0u8..255,
    ) {
        let allocator = PortAllocator::new(45000, 45100);
        let mut live: Vec<(String, PortPair)> = Vec::new();

        for i in 0..service_count {
            let id = format!("svc-{}", i);
            let pair = allocator.allocate(&id).unwrap();
            prop_assert_eq!(pair.blue_port % 2, 0);
            prop_assert_eq!(pair.green_port, pair.blue_port + 1);
            live.push((id, pair));
        }

        // Release an arbitrary subset, then allocate more; invariants hold.
        for (i, (id, _)) in live.clone().iter().enumerate() {
            if release_mask & (1 << (i % 8)) != 0 {
                allocator.release(id);
                live.retain(|(l, _)| l != id);
            }
        }
        for i in 0..3 {
            let id = format!("extra-{}", i);
            let pair = allocator.allocate(&id).unwrap();
            live.push((id, pair));
        }

        let mut used = HashSet::new();
        for (_, pair) in &live {
            prop_assert!(used.insert(pair.blue_port));
            prop_assert!(used.insert(pair.green_port));
        }
    }
}
