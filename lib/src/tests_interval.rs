use slipstream_mem::{BlockAllocator, MemoryContext};

use crate::IntervalCounter;

struct Harness {
    _backing: Vec<u8>,
    _alloc: Box<BlockAllocator>,
    mctx: Box<MemoryContext>,
}

fn harness() -> Harness {
    let mut backing = vec![0u8; 1 << 20];
    let mut alloc: Box<BlockAllocator> = Box::new(unsafe { core::mem::zeroed() });
    alloc.init();
    unsafe { alloc.put_arena(backing.as_mut_ptr(), backing.len()) };
    let mut mctx: Box<MemoryContext> = Box::new(unsafe { core::mem::zeroed() });
    mctx.init("interval-test", &mut *alloc);
    Harness {
        _backing: backing,
        _alloc: alloc,
        mctx,
    }
}

#[test]
fn counts_active_intervals() {
    let mut h = harness();
    let mut counter: IntervalCounter = unsafe { core::mem::zeroed() };
    counter.init(0, 30, &mut *h.mctx).unwrap();

    counter.put(0, 10, 1);
    counter.put(0, 20, 2);
    assert_eq!(counter.current_count(), 3);

    counter.advance_time(9);
    assert_eq!(counter.current_count(), 3);

    // First interval expires at t=10.
    counter.advance_time(10);
    assert_eq!(counter.current_count(), 2);

    counter.advance_time(20);
    assert_eq!(counter.current_count(), 0);

    counter.free();
}

#[test]
fn overlapping_intervals_accumulate() {
    let mut h = harness();
    let mut counter: IntervalCounter = unsafe { core::mem::zeroed() };
    counter.init(100, 16, &mut *h.mctx).unwrap();

    for start in 100..110u32 {
        counter.advance_time(start);
        counter.put(start, 10, 1);
    }
    // At t=109 intervals from 100..=109 are live except 100's has
    // just expired at 110; here all ten still cover 109.
    assert_eq!(counter.current_count(), 10);

    counter.advance_time(115);
    // Intervals started at 100..=105 have expired (start + 10 <= 115).
    assert_eq!(counter.current_count(), 4);

    counter.advance_time(200);
    assert_eq!(counter.current_count(), 0);
    counter.free();
}

#[test]
fn slot_reuse_across_generations() {
    let mut h = harness();
    let mut counter: IntervalCounter = unsafe { core::mem::zeroed() };
    counter.init(0, 4, &mut *h.mctx).unwrap();

    counter.put(0, 4, 5);
    counter.advance_time(4);
    assert_eq!(counter.current_count(), 0);

    // Several laps of the ring later, stale generations must not bleed in.
    counter.advance_time(64);
    counter.put(64, 3, 2);
    assert_eq!(counter.current_count(), 2);
    counter.advance_time(67);
    assert_eq!(counter.current_count(), 0);
    counter.free();
}

#[test]
fn teardown_returns_all_memory() {
    let mut h = harness();
    let mut counter: IntervalCounter = unsafe { core::mem::zeroed() };
    counter.init(0, 64, &mut *h.mctx).unwrap();
    counter.put(1, 2, 1);
    counter.free();
    assert_eq!(h.mctx.outstanding(), 0);
}
