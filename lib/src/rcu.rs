use core::hint::spin_loop;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Fixed worker capacity of one quiescence domain.
pub const RCU_WORKERS: usize = 64;

const ACTIVE_BIT: u32 = 1;
const EPOCH_BIT: u32 = 1 << 1;

/// Per-worker state word packing `{active: bit0, local_epoch: bit1}`.
///
/// Padded to a cache line so busy workers publishing their state do not
/// bounce each other's lines.
#[repr(C, align(64))]
struct WorkerState {
    state: AtomicU32,
}

/// Epoch-based read-copy-update quiescence primitive.
///
/// A single writer swaps a shared 64-bit slot (in practice a relative
/// pointer offset or a generation number) while any number of workers read
/// it lock-free. The writer learns when every pre-swap critical section
/// has drained by flipping a 1-bit global epoch twice and waiting, after
/// each flip, until every worker is either inactive or has re-entered
/// under the new epoch. After the second flip no reader can still hold the
/// pre-swap value and its memory may be reclaimed.
#[repr(C)]
pub struct Rcu {
    global_epoch: AtomicU32,
    workers: [WorkerState; RCU_WORKERS],
}

impl Rcu {
    /// Initialize in place: epoch 0, every worker inactive.
    pub fn init(&mut self) {
        self.global_epoch = AtomicU32::new(0);
        for worker in &mut self.workers {
            worker.state = AtomicU32::new(0);
        }
    }

    /// Enter a read-side critical section and load `field`.
    ///
    /// The worker publishes `{active, epoch}` with release *before* the
    /// acquire load of the guarded field, so an updater that later
    /// observes the worker inactive (or re-epoched) knows the worker's
    /// load happened on one side of the swap, never astride it.
    #[inline]
    pub fn read_begin(&self, worker: usize, field: &AtomicU64) -> u64 {
        let epoch = self.global_epoch.load(Ordering::Relaxed) & 1;
        // SeqCst on the state store and the field load keeps the pair
        // ordered against the updater's store-field / load-state pair
        // (plain release/acquire would allow both sides to read stale).
        self.workers[worker]
            .state
            .store(ACTIVE_BIT | (epoch << 1), Ordering::SeqCst);
        field.load(Ordering::SeqCst)
    }

    /// Leave the read-side critical section.
    #[inline]
    pub fn read_end(&self, worker: usize) {
        let state = self.workers[worker].state.load(Ordering::Relaxed);
        self.workers[worker]
            .state
            .store(state & !ACTIVE_BIT, Ordering::Release);
    }

    /// Publish `new_value` into `field` and wait until no reader can still
    /// observe the previous value.
    pub fn update(&self, field: &AtomicU64, new_value: u64) {
        field.store(new_value, Ordering::SeqCst);
        self.flip_and_wait();
        self.flip_and_wait();
    }

    /// One epoch flip followed by a spin until every worker is quiescent
    /// under the new epoch. Two flips are required: a worker caught inside
    /// a critical section during the first flip either finishes (goes
    /// inactive) or re-enters and picks up the new epoch; the second flip
    /// then proves it also left that section.
    fn flip_and_wait(&self) {
        let epoch = (self.global_epoch.fetch_xor(1, Ordering::SeqCst) ^ 1) & 1;
        for worker in &self.workers {
            loop {
                let state = worker.state.load(Ordering::SeqCst);
                if state & ACTIVE_BIT == 0 || (state & EPOCH_BIT) >> 1 == epoch {
                    break;
                }
                spin_loop();
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn worker_state(&self, worker: usize) -> (bool, u32) {
        let state = self.workers[worker].state.load(Ordering::Relaxed);
        (state & ACTIVE_BIT != 0, (state & EPOCH_BIT) >> 1)
    }

    #[cfg(test)]
    pub(crate) fn epoch(&self) -> u32 {
        self.global_epoch.load(Ordering::Relaxed) & 1
    }
}
