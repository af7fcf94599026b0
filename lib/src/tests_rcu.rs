use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;

use crate::rcu::{RCU_WORKERS, Rcu};

fn fresh_rcu() -> Box<Rcu> {
    let mut rcu: Box<Rcu> = Box::new(unsafe { core::mem::zeroed() });
    rcu.init();
    rcu
}

#[test]
fn init_state_is_clean() {
    let rcu = fresh_rcu();
    assert_eq!(rcu.epoch(), 0);
    for worker in 0..RCU_WORKERS {
        assert_eq!(rcu.worker_state(worker), (false, 0));
    }
}

#[test]
fn single_reader_toggles_active() {
    let rcu = fresh_rcu();
    let value = AtomicU64::new(42);

    let read = rcu.read_begin(0, &value);
    assert_eq!(read, 42);
    assert!(rcu.worker_state(0).0);

    rcu.read_end(0);
    assert!(!rcu.worker_state(0).0);
}

#[test]
fn update_flips_epoch_twice() {
    let rcu = fresh_rcu();
    let value = AtomicU64::new(10);

    rcu.update(&value, 20);
    assert_eq!(value.load(Ordering::Acquire), 20);
    // Two flips land the epoch back where it started.
    assert_eq!(rcu.epoch(), 0);

    for i in 1..=10u64 {
        rcu.update(&value, i);
        assert_eq!(value.load(Ordering::Acquire), i);
    }
}

#[test]
fn reader_after_update_sees_new_value() {
    let rcu = fresh_rcu();
    let value = AtomicU64::new(100);

    let v1 = rcu.read_begin(0, &value);
    assert_eq!(v1, 100);
    rcu.read_end(0);

    rcu.update(&value, 200);

    let v2 = rcu.read_begin(0, &value);
    assert_eq!(v2, 200);
    rcu.read_end(0);
}

#[test]
fn all_workers_may_read_concurrently() {
    let rcu = fresh_rcu();
    let value = AtomicU64::new(777);

    for worker in 0..RCU_WORKERS {
        assert_eq!(rcu.read_begin(worker, &value), 777);
        assert!(rcu.worker_state(worker).0);
    }
    for worker in 0..RCU_WORKERS {
        rcu.read_end(worker);
        assert!(!rcu.worker_state(worker).0);
    }
}

/// No read-side critical section that began after an update's final flip
/// may observe the pre-update value.
#[test]
fn updates_never_expose_stale_values() {
    let rcu = Arc::new({
        let mut rcu: Box<Rcu> = Box::new(unsafe { core::mem::zeroed() });
        rcu.init();
        rcu
    });
    let value = Arc::new(AtomicU64::new(0));
    let stop = Arc::new(AtomicBool::new(false));

    let mut readers = Vec::new();
    for worker in 0..4usize {
        let rcu = Arc::clone(&rcu);
        let value = Arc::clone(&value);
        let stop = Arc::clone(&stop);
        readers.push(thread::spawn(move || {
            let mut last_seen = 0u64;
            while !stop.load(Ordering::Relaxed) {
                let v = rcu.read_begin(worker, &value);
                // The published value is monotonic; a reader must never
                // travel backwards.
                assert!(v >= last_seen, "stale value {v} after {last_seen}");
                last_seen = v;
                rcu.read_end(worker);
            }
        }));
    }

    for next in 1..=1000u64 {
        rcu.update(&value, next);
    }
    stop.store(true, Ordering::Relaxed);
    for handle in readers {
        handle.join().unwrap();
    }
    assert_eq!(value.load(Ordering::Acquire), 1000);
}
