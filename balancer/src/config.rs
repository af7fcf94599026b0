use core::sync::atomic::AtomicU32;

use bitflags::bitflags;

use slipstream_controlplane::counters::{CounterLink, CounterRegistry, CounterStorage};
use slipstream_controlplane::{Agent, ConfigError, ConfigResult, ModuleData};
use slipstream_lib::IntervalCounter;
use slipstream_lookup::{Filter, FilterRule, Lpm, compile_filter};
use slipstream_mem::{MemoryContext, RelPtr};

use crate::ring::Ring;
use crate::session::SessionTimeouts;
use crate::session_table::SessionTable;
use crate::stats;

bitflags! {
    /// Virtual-service behavior flags.
    #[repr(transparent)]
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct VsFlags: u64 {
        /// Serve every destination port; session ids zero the ports.
        const PURE_L3 = 1 << 0;
        /// The service address is IPv6.
        const IPV6 = 1 << 1;
        /// Clamp the TCP MSS option on IPv6 SYNs.
        const FIX_MSS = 1 << 2;
        /// Tunnel to reals over GRE.
        const GRE = 1 << 3;
        /// One-packet scheduling: no session table involvement.
        const OPS = 1 << 4;
        /// Pure round robin: schedule on a counter, not the flow hash.
        const PRR = 1 << 5;
    }
}

bitflags! {
    /// Real-server flags.
    #[repr(transparent)]
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct RealFlags: u64 {
        /// The real's address is IPv6.
        const IPV6 = 1 << 0;
        /// Weight is ignored; the real receives no new sessions.
        const DISABLED = 1 << 1;
        /// Set on every real reachable from the live configuration;
        /// sessions pointing at reals without it reschedule.
        const PRESENT_IN_CONFIG = 1 << 7;
    }
}

/// Per-worker mutable state of a virtual service or real, cache-line
/// sized: the active-session interval counter, the last-packet clock
/// and the PRR cursor.
#[repr(C)]
pub struct ServiceState {
    pub active_sessions: IntervalCounter,
    pub last_packet_timestamp: AtomicU32,
    pub round_robin: AtomicU32,
    _pad: [u8; 24],
}

#[repr(C)]
pub struct VirtualService {
    pub flags: VsFlags,
    pub addr: [u8; 16],
    pub port: u16,
    pub proto: u8,
    pub real_start: u32,
    pub real_count: u32,
    pub src_filter: Lpm,
    pub ring: Ring,
    pub counter: CounterLink,
    pub state: RelPtr<ServiceState>,
}

impl VirtualService {
    /// Per-worker state slot.
    pub fn worker_state(&self, worker: usize) -> *mut ServiceState {
        // SAFETY: the state array spans the configured worker count.
        unsafe { self.state.load().add(worker) }
    }
}

#[repr(C)]
pub struct Real {
    pub flags: RealFlags,
    pub weight: u16,
    pub dst: [u8; 16],
    pub src: [u8; 16],
    pub src_mask: [u8; 16],
    pub counter: CounterLink,
    pub state: RelPtr<ServiceState>,
}

impl Real {
    pub fn worker_state(&self, worker: usize) -> *mut ServiceState {
        // SAFETY: as in `VirtualService::worker_state`.
        unsafe { self.state.load().add(worker) }
    }
}

/// Balancer module configuration blob; the [`ModuleData`] header makes
/// it publishable through the generation machinery.
#[repr(C)]
pub struct BalancerConfig {
    pub module_data: ModuleData,
    pub timeouts: SessionTimeouts,
    pub vs_v4_table: Filter,
    pub vs_v6_table: Filter,
    pub vs_count: u64,
    pub vs: RelPtr<VirtualService>,
    pub real_count: u64,
    pub reals: RelPtr<Real>,
    pub session_table: RelPtr<SessionTable>,
    /// Set when this configuration created the table; shared tables
    /// (session continuity across publications) outlive the config.
    owns_table: u8,
    pub workers: u64,
    pub counter_registry: CounterRegistry,
    pub counter_storage: RelPtr<CounterStorage>,
    pub module_counter: CounterLink,
}

impl BalancerConfig {
    /// # Safety
    /// `data` must head a blob built by [`balancer_config_create`].
    pub unsafe fn from_module_data(data: *mut ModuleData) -> *mut BalancerConfig {
        data as *mut BalancerConfig
    }

    pub fn vs(&self, idx: u64) -> *mut VirtualService {
        debug_assert!(idx < self.vs_count);
        // SAFETY: bounded by `vs_count`.
        unsafe { self.vs.load().add(idx as usize) }
    }

    pub fn real(&self, idx: u64) -> *mut Real {
        debug_assert!(idx < self.real_count);
        // SAFETY: bounded by `real_count`.
        unsafe { self.reals.load().add(idx as usize) }
    }
}

/// Build-time description of one real behind a virtual service.
#[derive(Clone)]
pub struct RealSpec {
    pub flags: RealFlags,
    pub weight: u16,
    pub dst: [u8; 16],
    pub src: [u8; 16],
    pub src_mask: [u8; 16],
}

/// Build-time description of one virtual service.
#[derive(Clone)]
pub struct VsSpec {
    pub flags: VsFlags,
    pub addr: [u8; 16],
    pub port: u16,
    pub proto: u8,
    /// Inclusive source ranges allowed to reach the service; addresses
    /// in the service's family width.
    pub allowed_src: Vec<([u8; 16], [u8; 16])>,
    pub reals: Vec<RealSpec>,
}

unsafe fn alloc_states(
    mctx: *mut MemoryContext,
    workers: usize,
    max_timeout: u32,
) -> ConfigResult<*mut ServiceState> {
    unsafe {
        let bytes = workers * size_of::<ServiceState>();
        let states = (*mctx).balloc_zeroed(bytes) as *mut ServiceState;
        if states.is_null() {
            return Err(ConfigError::OutOfMemory);
        }
        for worker in 0..workers {
            let state = &mut *states.add(worker);
            state.active_sessions.init(0, max_timeout, mctx)?;
        }
        Ok(states)
    }
}

unsafe fn free_states(mctx: *mut MemoryContext, states: *mut ServiceState, workers: usize) {
    unsafe {
        for worker in 0..workers {
            (*states.add(worker)).active_sessions.free();
        }
        (*mctx).bfree(states as *mut u8, workers * size_of::<ServiceState>());
    }
}

/// Allocate and assemble a complete balancer configuration in the
/// agent's memory context: lookup tables, per-service rings, filters and
/// states, the counter registry/storage and the session table.
///
/// # Safety
///
/// `agent` must be a live attached agent.
pub unsafe fn balancer_config_create(
    agent: *mut Agent,
    module_index: u64,
    name: &str,
    workers: usize,
    session_capacity: usize,
    timeouts: SessionTimeouts,
    vs_specs: &[VsSpec],
) -> ConfigResult<*mut ModuleData> {
    unsafe {
        balancer_config_create_shared(
            agent,
            module_index,
            name,
            workers,
            session_capacity,
            timeouts,
            vs_specs,
            core::ptr::null_mut(),
        )
    }
}

/// As [`balancer_config_create`], but reusing `shared_table` (sessions
/// established under a previous configuration stay sticky as long as
/// real indices are append-only across publications). Pass null to
/// create a fresh table owned by the new configuration.
///
/// # Safety
///
/// As [`balancer_config_create`]; a non-null `shared_table` must
/// outlive every configuration referencing it.
#[allow(clippy::too_many_arguments)]
pub unsafe fn balancer_config_create_shared(
    agent: *mut Agent,
    module_index: u64,
    name: &str,
    workers: usize,
    session_capacity: usize,
    timeouts: SessionTimeouts,
    vs_specs: &[VsSpec],
    shared_table: *mut SessionTable,
) -> ConfigResult<*mut ModuleData> {
    unsafe {
        let data =
            (*agent).alloc_module_data(module_index, name, size_of::<BalancerConfig>())?;
        let config = BalancerConfig::from_module_data(data);
        let mctx: *mut MemoryContext = &mut (*agent).memory_context;

        (*config).timeouts = timeouts;
        (*config).workers = workers as u64;
        let max_timeout = timeouts.max();

        // Counters first: everything else records links into them.
        (*config).counter_registry.init(mctx, 0)?;
        let module_counter = (*config)
            .counter_registry
            .register("balancer", stats::MODULE_WORDS);
        (*config).module_counter = (*config)
            .counter_registry
            .link(module_counter)
            .ok_or(ConfigError::OutOfMemory)?;

        // Flatten the real list and build both VS filter tables.
        let total_reals: usize = vs_specs.iter().map(|vs| vs.reals.len()).sum();
        let vs_array =
            (*mctx).balloc_zeroed(vs_specs.len() * size_of::<VirtualService>())
                as *mut VirtualService;
        let real_array =
            (*mctx).balloc_zeroed(total_reals.max(1) * size_of::<Real>()) as *mut Real;
        if vs_array.is_null() || real_array.is_null() {
            return Err(ConfigError::OutOfMemory);
        }
        (*config).vs = RelPtr::null();
        (*config).vs.store(vs_array);
        (*config).reals = RelPtr::null();
        (*config).reals.store(real_array);
        (*config).vs_count = vs_specs.len() as u64;
        (*config).real_count = total_reals as u64;

        let mut v4_rules = Vec::new();
        let mut v6_rules = Vec::new();
        let mut real_cursor = 0u32;

        for (vs_idx, spec) in vs_specs.iter().enumerate() {
            let rule = FilterRule {
                net_start: spec.addr,
                net_end: spec.addr,
                port: if spec.flags.contains(VsFlags::PURE_L3) {
                    None
                } else {
                    Some(spec.port)
                },
                proto: spec.proto,
                action: vs_idx as u32,
            };
            if spec.flags.contains(VsFlags::IPV6) {
                v6_rules.push(rule);
            } else {
                v4_rules.push(rule);
            }

            let vs = &mut *vs_array.add(vs_idx);
            vs.flags = spec.flags;
            vs.addr = spec.addr;
            vs.port = spec.port;
            vs.proto = spec.proto;
            vs.real_start = real_cursor;
            vs.real_count = spec.reals.len() as u32;

            let vs_counter = (*config)
                .counter_registry
                .register(&format!("vs{vs_idx}"), stats::VS_WORDS);
            vs.counter = (*config)
                .counter_registry
                .link(vs_counter)
                .ok_or(ConfigError::OutOfMemory)?;

            // Source allowlist over the family's key width.
            let key_len = if spec.flags.contains(VsFlags::IPV6) { 16 } else { 4 };
            vs.src_filter.init(mctx)?;
            for (from, to) in &spec.allowed_src {
                vs.src_filter.insert(&from[..key_len], &to[..key_len], 0)?;
            }

            // Reals and the weighted ring over absolute indices.
            let mut weighted = Vec::with_capacity(spec.reals.len());
            for (offset, real_spec) in spec.reals.iter().enumerate() {
                let abs_idx = real_cursor + offset as u32;
                let real = &mut *real_array.add(abs_idx as usize);
                real.flags = real_spec.flags | RealFlags::PRESENT_IN_CONFIG;
                real.weight = real_spec.weight;
                real.dst = real_spec.dst;
                real.src = real_spec.src;
                real.src_mask = real_spec.src_mask;

                let real_counter = (*config)
                    .counter_registry
                    .register(&format!("real{abs_idx}"), stats::REAL_WORDS);
                real.counter = (*config)
                    .counter_registry
                    .link(real_counter)
                    .ok_or(ConfigError::OutOfMemory)?;

                real.state = RelPtr::null();
                real.state
                    .store(alloc_states(mctx, workers, max_timeout)?);

                let effective = if real_spec.flags.contains(RealFlags::DISABLED) {
                    0
                } else {
                    real_spec.weight
                };
                weighted.push((abs_idx, effective));
            }
            vs.ring.init(mctx, &weighted)?;

            vs.state = RelPtr::null();
            vs.state.store(alloc_states(mctx, workers, max_timeout)?);

            real_cursor += spec.reals.len() as u32;
        }

        compile_filter(&mut (*config).vs_v4_table, mctx, 4, &v4_rules)?;
        compile_filter(&mut (*config).vs_v6_table, mctx, 16, &v6_rules)?;

        let storage = CounterStorage::spawn(
            mctx,
            workers as u64,
            core::ptr::null_mut(),
            &mut (*config).counter_registry,
        )?;
        (*config).counter_storage = RelPtr::null();
        (*config).counter_storage.store(storage);

        let table = if shared_table.is_null() {
            (*config).owns_table = 1;
            SessionTable::create(mctx, session_capacity, workers)?
        } else {
            (*config).owns_table = 0;
            shared_table
        };
        (*config).session_table = RelPtr::null();
        (*config).session_table.store(table);

        Ok(data)
    }
}

/// Tear a configuration blob down, returning every internal allocation
/// to the agent context. The blob itself stays on the agent's unused
/// list (or with the caller) for reuse.
///
/// # Safety
///
/// `data` must head a blob from [`balancer_config_create`] that is no
/// longer reachable from any published generation.
pub unsafe fn balancer_config_free(data: *mut ModuleData) {
    unsafe {
        let config = BalancerConfig::from_module_data(data);
        let agent = (*data).agent.load();
        let mctx: *mut MemoryContext = &mut (*agent).memory_context;
        let workers = (*config).workers as usize;

        for idx in 0..(*config).vs_count {
            let vs = &mut *(*config).vs.load().add(idx as usize);
            vs.src_filter.free();
            vs.ring.free();
            free_states(mctx, vs.state.load(), workers);
        }
        for idx in 0..(*config).real_count {
            let real = &mut *(*config).reals.load().add(idx as usize);
            free_states(mctx, real.state.load(), workers);
        }
        (*mctx).bfree(
            (*config).vs.load() as *mut u8,
            (*config).vs_count as usize * size_of::<VirtualService>(),
        );
        (*mctx).bfree(
            (*config).reals.load() as *mut u8,
            ((*config).real_count as usize).max(1) * size_of::<Real>(),
        );
        (*config).vs_v4_table.free();
        (*config).vs_v6_table.free();
        if (*config).owns_table != 0 {
            SessionTable::destroy((*config).session_table.load());
        }
        CounterStorage::release((*config).counter_storage.load());
        (*config).counter_registry.free();
    }
}
