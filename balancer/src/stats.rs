//! Counter word layouts.
//!
//! Each virtual service, each real and the module itself own one
//! multi-word counter in the balancer's registry; the constants below
//! name the words. Increments are relaxed atomic adds (single writer per
//! worker); reporters accumulate across worker pages at read time.

use core::sync::atomic::{AtomicU64, Ordering};

use slipstream_controlplane::counters::{CounterLink, CounterStorage};

/// Virtual-service counter: one size-8 allocation.
pub const VS_WORDS: u64 = 8;
pub const VS_INCOMING_PACKETS: usize = 0;
pub const VS_OUTGOING_PACKETS: usize = 1;
pub const VS_PACKET_SRC_NOT_ALLOWED: usize = 2;
pub const VS_NO_REALS: usize = 3;
pub const VS_SESSION_TABLE_OVERFLOW: usize = 4;
pub const VS_PACKET_NOT_RESCHEDULED: usize = 5;
pub const VS_CREATED_SESSIONS: usize = 6;
pub const VS_OPS_PACKETS: usize = 7;

/// Real counter: one size-4 allocation.
pub const REAL_WORDS: u64 = 4;
pub const REAL_PACKETS: usize = 0;
pub const REAL_CREATED_SESSIONS: usize = 1;
pub const REAL_OPS_PACKETS: usize = 2;
pub const REAL_DISABLED: usize = 3;

/// Module counter: one size-8 allocation.
pub const MODULE_WORDS: u64 = 8;
pub const MODULE_INCOMING_PACKETS: usize = 0;
pub const MODULE_OUTGOING_PACKETS: usize = 1;
pub const MODULE_SELECT_VS_FAILED: usize = 2;
pub const MODULE_SELECT_REAL_FAILED: usize = 3;
pub const MODULE_INVALID_PACKETS: usize = 4;

/// Relaxed add on one word of a worker-local counter page.
///
/// # Safety
///
/// `link` must belong to the storage's registry and `word` lie inside
/// the counter's size.
#[inline]
pub unsafe fn bump(storage: *mut CounterStorage, link: CounterLink, worker: u64, word: usize) {
    unsafe {
        let ptr = (*storage).address(link, worker).add(word);
        (*(ptr as *const AtomicU64)).fetch_add(1, Ordering::Relaxed);
    }
}

/// Accumulated value of one counter word across workers.
///
/// # Safety
///
/// As for [`bump`].
pub unsafe fn read(storage: *mut CounterStorage, link: CounterLink, words: u64, word: usize) -> u64 {
    unsafe { (*storage).accumulate(link, words)[word] }
}
