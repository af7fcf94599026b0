use slipstream_mem::{BlockAllocator, MemoryContext};

use crate::session::{SessionId, SessionState};
use crate::session_table::{SessionLookup, SessionTable};

struct Harness {
    _backing: Vec<u8>,
    _alloc: Box<BlockAllocator>,
    mctx: Box<MemoryContext>,
}

fn harness() -> Harness {
    let mut backing = vec![0u8; 16 << 20];
    let mut alloc: Box<BlockAllocator> = Box::new(unsafe { core::mem::zeroed() });
    alloc.init();
    unsafe { alloc.put_arena(backing.as_mut_ptr(), backing.len()) };
    let mut mctx: Box<MemoryContext> = Box::new(unsafe { core::mem::zeroed() });
    mctx.init("sessions-test", &mut *alloc);
    Harness {
        _backing: backing,
        _alloc: alloc,
        mctx,
    }
}

fn session_id(client_port: u16) -> SessionId {
    let mut src = [0u8; 16];
    src[..4].copy_from_slice(&[10, 0, 0, 1]);
    let mut dst = [0u8; 16];
    dst[..4].copy_from_slice(&[1, 1, 1, 1]);
    SessionId {
        transport_proto: 6,
        network_proto: 0,
        ip_source: src,
        ip_destination: dst,
        port_source: client_port,
        port_destination: 80,
    }
}

#[test]
fn create_then_stick() {
    let mut h = harness();
    let table = unsafe { SessionTable::create(&mut *h.mctx, 1024, 2).unwrap() };
    let table = unsafe { &mut *table };

    let id = session_id(1000);
    let generation = table.begin_cs(0);
    table.update_worker_time(0, 100);
    match table.get_or_create(generation, 0, 100, 5, &id) {
        SessionLookup::Created(mut slot) => {
            *slot.value() = SessionState {
                real_id: 3,
                create_timestamp: 100,
                last_packet_timestamp: 100,
                timeout: 5,
            };
        }
        _ => panic!("expected created"),
    }
    table.end_cs(0);

    let generation = table.begin_cs(0);
    match table.get_or_create(generation, 0, 102, 120, &id) {
        SessionLookup::Found(slot) => {
            assert_eq!(slot.value_copy().real_id, 3);
        }
        _ => panic!("expected found"),
    }
    table.end_cs(0);

    assert_eq!(table.get_session_real(generation, 0, &id, 103), Some(3));
    assert_eq!(table.get_session_real(generation, 0, &session_id(9), 103), None);

    unsafe { SessionTable::destroy(table) };
    assert_eq!(h.mctx.outstanding(), 0);
}

#[test]
fn expired_sessions_are_replaced() {
    let mut h = harness();
    let table = unsafe { SessionTable::create(&mut *h.mctx, 64, 1).unwrap() };
    let table = unsafe { &mut *table };

    let id = session_id(2000);
    let generation = table.begin_cs(0);
    match table.get_or_create(generation, 0, 100, 5, &id) {
        SessionLookup::Created(mut slot) => {
            *slot.value() = SessionState {
                real_id: 1,
                create_timestamp: 100,
                last_packet_timestamp: 100,
                timeout: 5,
            };
        }
        _ => panic!("expected created"),
    }
    // Past the deadline the slot reads as created again.
    match table.get_or_create(generation, 0, 106, 5, &id) {
        SessionLookup::Created(_) => {}
        _ => panic!("expected replacement after expiry"),
    }
    table.end_cs(0);
    unsafe { SessionTable::destroy(table) };
}

#[test]
fn extend_migrates_live_sessions() {
    let mut h = harness();
    let table = unsafe { SessionTable::create(&mut *h.mctx, 256, 1).unwrap() };
    let table = unsafe { &mut *table };
    let capacity_before = table.capacity();

    // Establish a session, then force a resize.
    let id = session_id(3000);
    let generation = table.begin_cs(0);
    table.update_worker_time(0, 100);
    match table.get_or_create(generation, 0, 100, 60, &id) {
        SessionLookup::Created(mut slot) => {
            *slot.value() = SessionState {
                real_id: 7,
                create_timestamp: 100,
                last_packet_timestamp: 100,
                timeout: 60,
            };
        }
        _ => panic!("expected created"),
    }
    table.end_cs(0);

    assert!(table.extend(true).unwrap());
    assert_eq!(table.capacity(), capacity_before * 2);

    // The worker is now inside the resize window: a hit in the new map
    // misses, falls back to the previous map and migrates the state.
    let generation = table.begin_cs(0);
    table.update_worker_time(0, 101);
    match table.get_or_create(generation, 0, 101, 60, &id) {
        SessionLookup::Found(slot) => {
            assert_eq!(slot.value_copy().real_id, 7);
        }
        _ => panic!("expected migrated session"),
    }
    table.end_cs(0);

    // Until the worker's clock passes the old map's max deadline the
    // previous generation must not be reclaimed.
    assert!(!table.free_unused());

    // Advance beyond every deadline recorded under the old generation.
    table.update_worker_time(0, 100 + 60 + 1);
    assert!(table.free_unused());

    unsafe { SessionTable::destroy(table) };
}

#[test]
fn extend_without_pressure_is_a_noop() {
    let mut h = harness();
    let table = unsafe { SessionTable::create(&mut *h.mctx, 1024, 1).unwrap() };
    let table = unsafe { &mut *table };
    assert!(!table.extend(false).unwrap());
    unsafe { SessionTable::destroy(table) };
}

#[test]
fn density_pressure_triggers_extend() {
    let mut h = harness();
    // Tiny table: a handful of sessions saturates its buckets.
    let table = unsafe { SessionTable::create(&mut *h.mctx, 1, 1).unwrap() };
    let table = unsafe { &mut *table };
    let capacity = table.capacity();

    let generation = table.begin_cs(0);
    table.update_worker_time(0, 100);
    let mut port = 1000u16;
    let mut stored = 0usize;
    while stored < capacity {
        match table.get_or_create(generation, 0, 100, 60, &session_id(port)) {
            SessionLookup::Created(mut slot) => {
                *slot.value() = SessionState {
                    real_id: 0,
                    create_timestamp: 100,
                    last_packet_timestamp: 100,
                    timeout: 60,
                };
                stored += 1;
            }
            SessionLookup::Found(_) => {}
            SessionLookup::Overflow => break,
        }
        port += 1;
    }
    table.end_cs(0);

    // A full bucket pushed the density to 8/8.
    assert!(table.extend(false).unwrap());
    unsafe { SessionTable::destroy(table) };
}
