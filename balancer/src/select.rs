use core::sync::atomic::Ordering;

use slipstream_dataplane::headers::{proto, tcp};

use crate::config::{BalancerConfig, RealFlags, VirtualService, VsFlags};
use crate::meta::PacketMetadata;
use crate::ring::RING_VALUE_INVALID;
use crate::session::{fill_session_id, session_timeout};
use crate::session_table::SessionLookup;
use crate::stats;

/// Whether this packet is allowed to open (or move) a session: UDP
/// always, TCP only on a clean SYN (SYN set, RST clear).
#[inline]
pub fn reschedule_real(meta: &PacketMetadata) -> bool {
    meta.transport_proto == proto::UDP
        || (meta.transport_proto == proto::TCP
            && meta.tcp_flags & (tcp::FLAG_SYN | tcp::FLAG_RST) == tcp::FLAG_SYN)
}

/// Scheduling randomness: the flow hash, or a per-worker monotonic
/// counter under pure round robin.
#[inline]
fn next_rnd(vs: &VirtualService, meta: &PacketMetadata, worker: usize) -> u64 {
    if vs.flags.contains(VsFlags::PRR) {
        // SAFETY: worker_state is in bounds for the configured workers.
        let state = unsafe { &*vs.worker_state(worker) };
        state.round_robin.fetch_add(1, Ordering::Relaxed) as u64
    } else {
        meta.hash
    }
}

/// Book a packet (and possibly a new session interval) on a service
/// state shard.
unsafe fn account_session(
    state: *mut crate::config::ServiceState,
    now: u32,
    timeout: u32,
) {
    unsafe {
        (*state).active_sessions.put(now, timeout, 1);
        (*state).active_sessions.advance_time(now);
        (*state).last_packet_timestamp.store(now, Ordering::Relaxed);
    }
}

/// Select the real for `meta` on `vs`: the OPS fast path schedules
/// statelessly; the regular path resolves or creates a 5-tuple session
/// with the timeout class of the packet. Returns the absolute real
/// index, or `None` when the packet must drop.
///
/// # Safety
///
/// `config` must be a live published configuration; `worker` must be
/// a valid worker index driven by a single thread.
pub unsafe fn select_real(
    config: *mut BalancerConfig,
    worker: usize,
    now: u32,
    vs: *mut VirtualService,
    meta: &PacketMetadata,
) -> Option<u32> {
    unsafe {
        let storage = (*config).counter_storage.load();
        let vs_ref = &*vs;

        // One-packet scheduling: no session table involvement at all.
        if vs_ref.flags.contains(VsFlags::OPS) {
            let real_id = vs_ref.ring.get(next_rnd(vs_ref, meta, worker));
            if real_id == RING_VALUE_INVALID {
                stats::bump(storage, vs_ref.counter, worker as u64, stats::VS_NO_REALS);
                return None;
            }
            let real = &*(*config).real(real_id as u64);
            stats::bump(storage, vs_ref.counter, worker as u64, stats::VS_OPS_PACKETS);
            stats::bump(storage, vs_ref.counter, worker as u64, stats::VS_OUTGOING_PACKETS);
            stats::bump(storage, real.counter, worker as u64, stats::REAL_OPS_PACKETS);
            stats::bump(storage, real.counter, worker as u64, stats::REAL_PACKETS);
            return Some(real_id);
        }

        let timeout = session_timeout(&(*config).timeouts, meta);
        let id = fill_session_id(meta, vs_ref.flags.contains(VsFlags::PURE_L3));

        let table = &*(*config).session_table.load();
        let table_gen = table.begin_cs(worker);
        table.update_worker_time(worker, now);

        let mut slot = match table.get_or_create(table_gen, worker, now, timeout, &id) {
            SessionLookup::Overflow => {
                stats::bump(
                    storage,
                    vs_ref.counter,
                    worker as u64,
                    stats::VS_SESSION_TABLE_OVERFLOW,
                );
                table.end_cs(worker);
                return None;
            }
            SessionLookup::Found(mut slot) => {
                let real_id = slot.value().real_id;
                let real = &*(*config).real(real_id as u64);
                if !real.flags.contains(RealFlags::PRESENT_IN_CONFIG) {
                    // The session points at a real that left the
                    // configuration; fall through and reschedule.
                    slot
                } else if real.flags.contains(RealFlags::DISABLED) {
                    stats::bump(storage, real.counter, worker as u64, stats::REAL_DISABLED);
                    slot
                } else {
                    // Healthy sticky session: refresh and go.
                    let state = slot.value();
                    state.timeout = timeout;
                    state.last_packet_timestamp = now;
                    drop(slot);

                    stats::bump(storage, vs_ref.counter, worker as u64, stats::VS_OUTGOING_PACKETS);
                    stats::bump(storage, real.counter, worker as u64, stats::REAL_PACKETS);
                    account_session(vs_ref.worker_state(worker), now, timeout);
                    account_session(real.worker_state(worker), now, timeout);

                    table.end_cs(worker);
                    return Some(real_id);
                }
            }
            SessionLookup::Created(slot) => slot,
        };

        // No usable session: only session-opening packets may proceed.
        if !reschedule_real(meta) {
            stats::bump(
                storage,
                vs_ref.counter,
                worker as u64,
                stats::VS_PACKET_NOT_RESCHEDULED,
            );
            slot.remove();
            drop(slot);
            table.end_cs(worker);
            return None;
        }

        let real_id = vs_ref.ring.get(next_rnd(vs_ref, meta, worker));
        if real_id == RING_VALUE_INVALID {
            stats::bump(storage, vs_ref.counter, worker as u64, stats::VS_NO_REALS);
            slot.remove();
            drop(slot);
            table.end_cs(worker);
            return None;
        }

        *slot.value() = crate::session::SessionState {
            real_id,
            create_timestamp: now,
            last_packet_timestamp: now,
            timeout,
        };
        drop(slot);

        let real = &*(*config).real(real_id as u64);
        let generation = table.generation_ref(table_gen);
        generation.worker_info[worker]
            .active_sessions
            .fetch_add(1, Ordering::Relaxed);

        stats::bump(storage, vs_ref.counter, worker as u64, stats::VS_CREATED_SESSIONS);
        stats::bump(storage, vs_ref.counter, worker as u64, stats::VS_OUTGOING_PACKETS);
        stats::bump(storage, real.counter, worker as u64, stats::REAL_CREATED_SESSIONS);
        stats::bump(storage, real.counter, worker as u64, stats::REAL_PACKETS);
        account_session(vs_ref.worker_state(worker), now, timeout);
        account_session(real.worker_state(worker), now, timeout);

        table.end_cs(worker);
        Some(real_id)
    }
}
