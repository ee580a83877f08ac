//! Property-based tests for arena bookkeeping

mod common;

use arenaforge::memory::{size_class, Arena, ArenaInfo, CoalescingArena, PoolArena, ALIGN_SIZE};
use common::disjoint;
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Alloc(usize),
    /// Free the live allocation at this index (modulo the live count)
    Free(usize),
}

fn ops() -> impl Strategy<Value = Vec<Op>> {
    prop::collection::vec(
        prop_oneof![
            3 => (0usize..20_000).prop_map(Op::Alloc),
            2 => any::<usize>().prop_map(Op::Free),
        ],
        1..120,
    )
}

/// Apply `ops`, checking invariants after every step; returns live blocks
fn run(arena: &dyn Arena, ops: &[Op], reserved: impl Fn(usize) -> usize) -> Vec<(usize, usize)> {
    let mut live: Vec<(usize, usize)> = Vec::new();
    for op in ops {
        match *op {
            Op::Alloc(n) => {
                let p = arena.alloc(n);
                assert!(!p.is_null());
                assert_eq!(p as usize % ALIGN_SIZE, 0);
                let block = (p as usize, reserved(n));
                for other in &live {
                    assert!(disjoint(block, *other), "{:?} overlaps {:?}", block, other);
                }
                live.push(block);
            }
            Op::Free(i) if !live.is_empty() => {
                let (addr, _) = live.swap_remove(i % live.len());
                arena.free(addr as *mut u8);
            }
            Op::Free(_) => {}
        }

        let usage = arena.usage().unwrap();
        assert_eq!(usage.used_bytes + usage.cached_bytes, usage.heap_bytes);
        assert_eq!(usage.live_allocations, live.len());
        assert!(usage.peak_heap_bytes >= usage.heap_bytes);
        assert!(usage.peak_used_bytes >= usage.used_bytes);
    }
    live
}

proptest! {
    #[test]
    fn test_coalescing_blocks_are_aligned_and_disjoint(ops in ops(), hunk_kb in 4usize..256) {
        let arena = CoalescingArena::default().with_hunk_size(hunk_kb * 1024);
        let live = run(&arena, &ops, |n| arena.align(n.max(1)));

        for (addr, _) in live {
            arena.free(addr as *mut u8);
        }
        let heap = arena.usage().unwrap().heap_bytes;
        // Every chunk coalesces back into one free block
        prop_assert_eq!(arena.free_block_count(), arena.chunk_count());
        prop_assert_eq!(arena.free_unused(), heap);
        let usage = arena.usage().unwrap();
        prop_assert_eq!(usage.heap_bytes, 0);
        prop_assert_eq!(usage.system_allocs, usage.system_frees);
    }

    #[test]
    fn test_coalescing_release_threshold_bounds_cache(ops in ops(), threshold_kb in 0usize..512) {
        let threshold = threshold_kb * 1024;
        let info = ArenaInfo::default().set_cpu_memory().set_release_threshold(threshold);
        let arena = CoalescingArena::new(info).with_hunk_size(64 * 1024);
        let mut live = run(&arena, &ops, |n| arena.align(n.max(1)));

        while let Some((addr, _)) = live.pop() {
            arena.free(addr as *mut u8);
            let usage = arena.usage().unwrap();
            // Only chunks with a live block may keep cached bytes above the threshold
            if usage.cached_bytes > threshold {
                prop_assert!(arena.chunk_count() > 0);
                prop_assert!(usage.live_allocations > 0);
            }
        }
        prop_assert!(arena.usage().unwrap().cached_bytes <= threshold);
    }

    #[test]
    fn test_pool_blocks_are_disjoint_and_recycled(ops in ops()) {
        let arena = PoolArena::default();
        let live = run(&arena, &ops, |n| size_class(n).unwrap());

        for (addr, _) in live {
            arena.free(addr as *mut u8);
        }
        let usage = arena.usage().unwrap();
        prop_assert_eq!(usage.used_bytes, 0);
        prop_assert_eq!(arena.free_unused(), usage.heap_bytes);
        prop_assert_eq!(arena.usage().unwrap().system_allocs, arena.usage().unwrap().system_frees);
    }
}
