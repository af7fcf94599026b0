use slipstream_mem::{BlockAllocator, MemoryContext};

use crate::lpm::{LPM_VALUE_INVALID, Lpm};

struct Harness {
    _backing: Vec<u8>,
    _alloc: Box<BlockAllocator>,
    mctx: Box<MemoryContext>,
}

fn harness(bytes: usize) -> Harness {
    let mut backing = vec![0u8; bytes];
    let mut alloc: Box<BlockAllocator> = Box::new(unsafe { core::mem::zeroed() });
    alloc.init();
    unsafe { alloc.put_arena(backing.as_mut_ptr(), backing.len()) };
    let mut mctx: Box<MemoryContext> = Box::new(unsafe { core::mem::zeroed() });
    mctx.init("lpm-test", &mut *alloc);
    Harness {
        _backing: backing,
        _alloc: alloc,
        mctx,
    }
}

#[test]
fn empty_lookup_misses() {
    let mut h = harness(1 << 20);
    let mut lpm: Lpm = unsafe { core::mem::zeroed() };
    lpm.init(&mut *h.mctx).unwrap();
    assert_eq!(lpm.lookup(&[10, 0, 0, 1]), LPM_VALUE_INVALID);
    lpm.free();
}

#[test]
fn exact_host_route() {
    let mut h = harness(1 << 20);
    let mut lpm: Lpm = unsafe { core::mem::zeroed() };
    lpm.init(&mut *h.mctx).unwrap();

    let addr = [192, 0, 2, 17];
    lpm.insert(&addr, &addr, 7).unwrap();
    assert_eq!(lpm.lookup(&addr), 7);
    assert_eq!(lpm.lookup(&[192, 0, 2, 18]), LPM_VALUE_INVALID);
    lpm.free();
}

#[test]
fn subnet_range_covers_every_member() {
    let mut h = harness(1 << 20);
    let mut lpm: Lpm = unsafe { core::mem::zeroed() };
    lpm.init(&mut *h.mctx).unwrap();

    // 10.1.0.0/16
    lpm.insert(&[10, 1, 0, 0], &[10, 1, 255, 255], 3).unwrap();
    assert_eq!(lpm.lookup(&[10, 1, 0, 0]), 3);
    assert_eq!(lpm.lookup(&[10, 1, 128, 200]), 3);
    assert_eq!(lpm.lookup(&[10, 1, 255, 255]), 3);
    assert_eq!(lpm.lookup(&[10, 2, 0, 0]), LPM_VALUE_INVALID);
    assert_eq!(lpm.lookup(&[10, 0, 255, 255]), LPM_VALUE_INVALID);
    lpm.free();
}

#[test]
fn later_insert_shadows_overlap() {
    let mut h = harness(1 << 20);
    let mut lpm: Lpm = unsafe { core::mem::zeroed() };
    lpm.init(&mut *h.mctx).unwrap();

    lpm.insert(&[10, 0, 0, 0], &[10, 255, 255, 255], 1).unwrap();
    lpm.insert(&[10, 7, 0, 0], &[10, 7, 255, 255], 2).unwrap();

    assert_eq!(lpm.lookup(&[10, 6, 1, 1]), 1);
    assert_eq!(lpm.lookup(&[10, 7, 1, 1]), 2);
    assert_eq!(lpm.lookup(&[10, 8, 1, 1]), 1);
    lpm.free();
}

#[test]
fn unaligned_range_edges() {
    let mut h = harness(1 << 20);
    let mut lpm: Lpm = unsafe { core::mem::zeroed() };
    lpm.init(&mut *h.mctx).unwrap();

    // An arbitrary range that starts and ends mid-subtree.
    lpm.insert(&[10, 0, 0, 200], &[10, 0, 3, 50], 9).unwrap();
    assert_eq!(lpm.lookup(&[10, 0, 0, 199]), LPM_VALUE_INVALID);
    assert_eq!(lpm.lookup(&[10, 0, 0, 200]), 9);
    assert_eq!(lpm.lookup(&[10, 0, 1, 0]), 9);
    assert_eq!(lpm.lookup(&[10, 0, 2, 255]), 9);
    assert_eq!(lpm.lookup(&[10, 0, 3, 50]), 9);
    assert_eq!(lpm.lookup(&[10, 0, 3, 51]), LPM_VALUE_INVALID);
    lpm.free();
}

#[test]
fn full_v4_range() {
    let mut h = harness(1 << 20);
    let mut lpm: Lpm = unsafe { core::mem::zeroed() };
    lpm.init(&mut *h.mctx).unwrap();

    lpm.insert(&[0, 0, 0, 0], &[255, 255, 255, 255], 0).unwrap();
    assert_eq!(lpm.lookup(&[0, 0, 0, 0]), 0);
    assert_eq!(lpm.lookup(&[127, 3, 9, 1]), 0);
    assert_eq!(lpm.lookup(&[255, 255, 255, 255]), 0);
    lpm.free();
}

#[test]
fn ipv6_keys() {
    let mut h = harness(1 << 21);
    let mut lpm: Lpm = unsafe { core::mem::zeroed() };
    lpm.init(&mut *h.mctx).unwrap();

    // 2001:db8::/96 painted over 16-byte keys.
    let mut start = [0u8; 16];
    start[0] = 0x20;
    start[1] = 0x01;
    start[2] = 0x0d;
    start[3] = 0xb8;
    let mut end = start;
    end[12..].fill(0xff);

    lpm.insert(&start, &end, 42).unwrap();

    let mut probe = start;
    probe[12..].copy_from_slice(&[192, 0, 2, 34]);
    assert_eq!(lpm.lookup(&probe), 42);

    let mut outside = start;
    outside[11] = 1;
    outside[12..].copy_from_slice(&[192, 0, 2, 34]);
    assert_eq!(lpm.lookup(&outside), LPM_VALUE_INVALID);
    lpm.free();
}

#[test]
fn node_table_growth() {
    let mut h = harness(1 << 22);
    let mut lpm: Lpm = unsafe { core::mem::zeroed() };
    lpm.init(&mut *h.mctx).unwrap();

    // Enough distinct host routes to force several table doublings.
    for i in 0..64u8 {
        let addr = [172, 16, i, 1];
        lpm.insert(&addr, &addr, i as u32).unwrap();
    }
    for i in 0..64u8 {
        assert_eq!(lpm.lookup(&[172, 16, i, 1]), i as u32);
        assert_eq!(lpm.lookup(&[172, 16, i, 2]), LPM_VALUE_INVALID);
    }
    lpm.free();
}
