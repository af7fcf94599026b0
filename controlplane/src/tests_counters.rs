use slipstream_mem::{BlockAllocator, MemoryContext};

use crate::counters::{
    COUNTER_INVALID, COUNTER_PAGE_WORDS, CounterRegistry, CounterStorage,
};

struct Harness {
    _backing: Vec<u8>,
    _alloc: Box<BlockAllocator>,
    mctx: Box<MemoryContext>,
}

fn harness() -> Harness {
    let mut backing = vec![0u8; 8 << 20];
    let mut alloc: Box<BlockAllocator> = Box::new(unsafe { core::mem::zeroed() });
    alloc.init();
    unsafe { alloc.put_arena(backing.as_mut_ptr(), backing.len()) };
    let mut mctx: Box<MemoryContext> = Box::new(unsafe { core::mem::zeroed() });
    mctx.init("counters-test", &mut *alloc);
    Harness {
        _backing: backing,
        _alloc: alloc,
        mctx,
    }
}

#[test]
fn register_assigns_pools_by_size() {
    let mut h = harness();
    let mut registry: CounterRegistry = unsafe { core::mem::zeroed() };
    registry.init(&mut *h.mctx, 0).unwrap();

    let a = registry.register("packets", 1);
    let b = registry.register("bytes", 1);
    let c = registry.register("histogram", 8);
    assert_eq!(a, 0);
    assert_eq!(b, 1);
    assert_eq!(c, 2);

    let link_a = registry.link(a).unwrap();
    let link_b = registry.link(b).unwrap();
    let link_c = registry.link(c).unwrap();
    assert_eq!(link_a.pool_idx, 0);
    assert_eq!(link_a.offset, 0);
    assert_eq!(link_b.pool_idx, 0);
    assert_eq!(link_b.offset, 1);
    assert_eq!(link_c.pool_idx, 3);
    assert_eq!(link_c.offset, 0);

    // Same (name, size) resolves to the existing id.
    assert_eq!(registry.register("packets", 1), a);
    // Bad sizes are rejected.
    assert_eq!(registry.register("bad", 3), COUNTER_INVALID);
    assert_eq!(registry.register("bad", 32), COUNTER_INVALID);
}

#[test]
fn registry_growth_keeps_ids() {
    let mut h = harness();
    let mut registry: CounterRegistry = unsafe { core::mem::zeroed() };
    registry.init(&mut *h.mctx, 0).unwrap();

    for i in 0..100u64 {
        let id = registry.register(&format!("counter-{i}"), 1);
        assert_eq!(id, i);
    }
    for i in 0..100u64 {
        assert_eq!(registry.link(i).unwrap().offset, i);
    }
}

#[test]
fn storage_per_worker_isolation_and_accumulation() {
    let mut h = harness();
    let mut registry: CounterRegistry = unsafe { core::mem::zeroed() };
    registry.init(&mut *h.mctx, 0).unwrap();
    let id = registry.register("drops", 1);
    let link = registry.link(id).unwrap();

    unsafe {
        let storage =
            CounterStorage::spawn(&mut *h.mctx, 4, core::ptr::null_mut(), &mut registry).unwrap();

        for worker in 0..4u64 {
            *(*storage).address(link, worker) = worker * 10;
        }
        let totals = (*storage).accumulate(link, 1);
        assert_eq!(totals, vec![0 + 10 + 20 + 30]);

        // Workers write disjoint words.
        assert_ne!((*storage).address(link, 0), (*storage).address(link, 1));
        CounterStorage::release(storage);
    }
}

#[test]
fn spawn_shares_pages_with_predecessor() {
    let mut h = harness();
    let mut registry: CounterRegistry = unsafe { core::mem::zeroed() };
    registry.init(&mut *h.mctx, 0).unwrap();
    let early = registry.register("early", 1);

    unsafe {
        let first =
            CounterStorage::spawn(&mut *h.mctx, 2, core::ptr::null_mut(), &mut registry).unwrap();
        let link_early = registry.link(early).unwrap();
        *(*first).address(link_early, 0) = 41;

        // A new generation registers one more counter and respawns the
        // storage from the predecessor: the early counter's page is
        // shared, so its value survives the swap.
        let mut next_registry: CounterRegistry = core::mem::zeroed();
        next_registry.copy_from(&registry, &mut *h.mctx).unwrap();
        assert_eq!(next_registry.generation, 1);
        let late = next_registry.register("late", 1);
        assert_eq!(late, 1);

        let second = CounterStorage::spawn(&mut *h.mctx, 2, first, &mut next_registry).unwrap();
        assert_eq!(*(*second).address(link_early, 0), 41);
        *(*second).address(link_early, 0) += 1;
        assert_eq!(*(*first).address(link_early, 0), 42);

        CounterStorage::release(first);
        // The shared block survives the first storage's release.
        assert_eq!(*(*second).address(link_early, 0), 42);
        CounterStorage::release(second);
    }
}

#[test]
fn counters_spanning_multiple_pages() {
    let mut h = harness();
    let mut registry: CounterRegistry = unsafe { core::mem::zeroed() };
    registry.init(&mut *h.mctx, 0).unwrap();

    // Enough single-word counters to need a second block in pool 0.
    let total = COUNTER_PAGE_WORDS as u64 + 10;
    for i in 0..total {
        registry.register(&format!("c{i}"), 1);
    }

    unsafe {
        let storage =
            CounterStorage::spawn(&mut *h.mctx, 1, core::ptr::null_mut(), &mut registry).unwrap();
        let first = registry.link(0).unwrap();
        let last = registry.link(total - 1).unwrap();
        *(*storage).address(first, 0) = 1;
        *(*storage).address(last, 0) = 2;
        assert_eq!((*storage).accumulate(first, 1), vec![1]);
        assert_eq!((*storage).accumulate(last, 1), vec![2]);
        CounterStorage::release(storage);
    }
}
