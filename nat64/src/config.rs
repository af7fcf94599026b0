use core::fmt;

use slipstream_controlplane::counters::{CounterLink, CounterRegistry, CounterStorage};
use slipstream_controlplane::{Agent, ConfigError, ModuleData};
use slipstream_lookup::{LPM_VALUE_INVALID, Lpm};
use slipstream_mem::{MemError, MemoryContext, RelPtr};

/// Errors raised while assembling a NAT64 configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Nat64Error {
    OutOfMemory,
    /// A mapping referenced a prefix index that was never added.
    UnknownPrefix(u64),
}

impl fmt::Display for Nat64Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "nat64 configuration memory exhausted"),
            Self::UnknownPrefix(idx) => write!(f, "prefix index {idx} not registered"),
        }
    }
}

impl core::error::Error for Nat64Error {}

impl From<MemError> for Nat64Error {
    fn from(_: MemError) -> Self {
        Self::OutOfMemory
    }
}

impl From<ConfigError> for Nat64Error {
    fn from(_: ConfigError) -> Self {
        Self::OutOfMemory
    }
}

pub type Nat64Result<T = ()> = Result<T, Nat64Error>;

/// Drop/translate counter words (one size-8 counter).
pub mod stats {
    pub const WORDS: u64 = 8;
    pub const INCOMING: usize = 0;
    pub const TRANSLATED_V4_TO_V6: usize = 1;
    pub const TRANSLATED_V6_TO_V4: usize = 2;
    pub const PASSED: usize = 3;
    pub const DROP_UNKNOWN_MAPPING: usize = 4;
    pub const DROP_UNKNOWN_PREFIX: usize = 5;
    pub const DROP_MALFORMED: usize = 6;
    pub const DROP_UNSUPPORTED: usize = 7;
}

/// One static address association.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct Mapping {
    pub ip4: [u8; 4],
    pub ip6: [u8; 16],
    pub prefix_index: u64,
}

/// A /96 translation prefix; the embedded IPv4 address occupies the
/// last four bytes of addresses under it.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct Prefix {
    pub prefix: [u8; 12],
}

/// NAT64 module configuration blob.
#[repr(C)]
pub struct Nat64Config {
    pub module_data: ModuleData,
    /// v4 address -> mapping index.
    pub mappings_v4: Lpm,
    /// v6 address -> mapping index.
    pub mappings_v6: Lpm,
    pub mapping_count: u64,
    mapping_cap: u64,
    pub mappings: RelPtr<Mapping>,
    pub prefix_count: u64,
    prefix_cap: u64,
    pub prefixes: RelPtr<Prefix>,
    /// v6 address -> prefix index (painted /96 ranges).
    pub prefixes_lpm: Lpm,
    pub mtu_v4: u16,
    pub mtu_v6: u16,
    pub drop_unknown_prefix: u8,
    pub drop_unknown_mapping: u8,
    pub workers: u64,
    pub counter_registry: CounterRegistry,
    pub counter_storage: RelPtr<CounterStorage>,
    pub counter: CounterLink,
}

const INITIAL_CAP: u64 = 8;

impl Nat64Config {
    /// # Safety
    /// `data` must head a blob built by [`nat64_config_create`].
    pub unsafe fn from_module_data(data: *mut ModuleData) -> *mut Nat64Config {
        data as *mut Nat64Config
    }

    pub fn mapping(&self, idx: u64) -> Option<&Mapping> {
        if idx >= self.mapping_count {
            return None;
        }
        // SAFETY: bounded by `mapping_count`.
        Some(unsafe { &*self.mappings.load().add(idx as usize) })
    }

    pub fn prefix(&self, idx: u64) -> Option<&Prefix> {
        if idx >= self.prefix_count {
            return None;
        }
        // SAFETY: bounded by `prefix_count`.
        Some(unsafe { &*self.prefixes.load().add(idx as usize) })
    }

    /// Mapping for an IPv6 source/destination, if configured.
    pub fn find_v6(&self, ip6: &[u8; 16]) -> Option<&Mapping> {
        let idx = self.mappings_v6.lookup(ip6);
        if idx == LPM_VALUE_INVALID {
            return None;
        }
        self.mapping(idx as u64)
    }

    /// Mapping for an IPv4 address, if configured.
    pub fn find_v4(&self, ip4: &[u8; 4]) -> Option<&Mapping> {
        let idx = self.mappings_v4.lookup(ip4);
        if idx == LPM_VALUE_INVALID {
            return None;
        }
        self.mapping(idx as u64)
    }

    /// Prefix index covering an IPv6 address, if any.
    pub fn find_prefix(&self, ip6: &[u8; 16]) -> Option<u64> {
        let idx = self.prefixes_lpm.lookup(ip6);
        if idx == LPM_VALUE_INVALID {
            return None;
        }
        Some(idx as u64)
    }
}

/// Allocate an empty NAT64 configuration in the agent's context.
///
/// # Safety
///
/// `agent` must be a live attached agent.
pub unsafe fn nat64_config_create(
    agent: *mut Agent,
    module_index: u64,
    name: &str,
    workers: usize,
    mtu_v4: u16,
    mtu_v6: u16,
) -> Nat64Result<*mut ModuleData> {
    unsafe {
        let data = (*agent).alloc_module_data(module_index, name, size_of::<Nat64Config>())?;
        let config = Nat64Config::from_module_data(data);
        let mctx: *mut MemoryContext = &mut (*agent).memory_context;

        (*config).mappings_v4.init(mctx)?;
        (*config).mappings_v6.init(mctx)?;
        (*config).prefixes_lpm.init(mctx)?;

        (*config).mapping_cap = INITIAL_CAP;
        (*config).mapping_count = 0;
        let mappings =
            (*mctx).balloc_zeroed(INITIAL_CAP as usize * size_of::<Mapping>()) as *mut Mapping;
        if mappings.is_null() {
            return Err(Nat64Error::OutOfMemory);
        }
        (*config).mappings = RelPtr::null();
        (*config).mappings.store(mappings);

        (*config).prefix_cap = INITIAL_CAP;
        (*config).prefix_count = 0;
        let prefixes =
            (*mctx).balloc_zeroed(INITIAL_CAP as usize * size_of::<Prefix>()) as *mut Prefix;
        if prefixes.is_null() {
            return Err(Nat64Error::OutOfMemory);
        }
        (*config).prefixes = RelPtr::null();
        (*config).prefixes.store(prefixes);

        (*config).mtu_v4 = mtu_v4;
        (*config).mtu_v6 = mtu_v6;
        (*config).drop_unknown_prefix = 0;
        (*config).drop_unknown_mapping = 0;
        (*config).workers = workers as u64;

        (*config).counter_registry.init(mctx, 0)?;
        let counter = (*config).counter_registry.register("nat64", stats::WORDS);
        (*config).counter = (*config)
            .counter_registry
            .link(counter)
            .ok_or(Nat64Error::OutOfMemory)?;
        let storage = CounterStorage::spawn(
            mctx,
            workers as u64,
            core::ptr::null_mut(),
            &mut (*config).counter_registry,
        )?;
        (*config).counter_storage = RelPtr::null();
        (*config).counter_storage.store(storage);

        Ok(data)
    }
}

/// Register a /96 translation prefix; returns its index.
///
/// # Safety
///
/// `data` must head a NAT64 configuration blob.
pub unsafe fn nat64_config_add_prefix(
    data: *mut ModuleData,
    prefix: [u8; 12],
) -> Nat64Result<u64> {
    unsafe {
        let config = Nat64Config::from_module_data(data);
        let agent = (*data).agent.load();
        let mctx: *mut MemoryContext = &mut (*agent).memory_context;

        if (*config).prefix_count == (*config).prefix_cap {
            grow_prefixes(config, mctx)?;
        }
        let idx = (*config).prefix_count;
        *(*config).prefixes.load().add(idx as usize) = Prefix { prefix };
        (*config).prefix_count += 1;

        // Paint the whole /96 so destination addresses resolve to it.
        let mut start = [0u8; 16];
        start[..12].copy_from_slice(&prefix);
        let mut end = start;
        end[12..].fill(0xff);
        (*config).prefixes_lpm.insert(&start, &end, idx as u32)?;
        Ok(idx)
    }
}

/// Associate `ip4` with `ip6` under prefix `prefix_index`.
///
/// # Safety
///
/// As for [`nat64_config_add_prefix`].
pub unsafe fn nat64_config_add_mapping(
    data: *mut ModuleData,
    ip4: [u8; 4],
    ip6: [u8; 16],
    prefix_index: u64,
) -> Nat64Result<u64> {
    unsafe {
        let config = Nat64Config::from_module_data(data);
        if prefix_index >= (*config).prefix_count {
            return Err(Nat64Error::UnknownPrefix(prefix_index));
        }
        let agent = (*data).agent.load();
        let mctx: *mut MemoryContext = &mut (*agent).memory_context;

        if (*config).mapping_count == (*config).mapping_cap {
            grow_mappings(config, mctx)?;
        }
        let idx = (*config).mapping_count;
        *(*config).mappings.load().add(idx as usize) = Mapping {
            ip4,
            ip6,
            prefix_index,
        };
        (*config).mapping_count += 1;

        (*config).mappings_v4.insert(&ip4, &ip4, idx as u32)?;
        (*config).mappings_v6.insert(&ip6, &ip6, idx as u32)?;
        Ok(idx)
    }
}

/// Configure the unknown-prefix / unknown-mapping drop policy.
///
/// # Safety
///
/// As for [`nat64_config_add_prefix`].
pub unsafe fn nat64_config_set_drop_unknown(
    data: *mut ModuleData,
    drop_unknown_prefix: bool,
    drop_unknown_mapping: bool,
) {
    unsafe {
        let config = Nat64Config::from_module_data(data);
        (*config).drop_unknown_prefix = drop_unknown_prefix as u8;
        (*config).drop_unknown_mapping = drop_unknown_mapping as u8;
    }
}

unsafe fn grow_mappings(config: *mut Nat64Config, mctx: *mut MemoryContext) -> Nat64Result {
    unsafe {
        let new_cap = (*config).mapping_cap * 2;
        let fresh =
            (*mctx).balloc_zeroed(new_cap as usize * size_of::<Mapping>()) as *mut Mapping;
        if fresh.is_null() {
            return Err(Nat64Error::OutOfMemory);
        }
        core::ptr::copy_nonoverlapping(
            (*config).mappings.load(),
            fresh,
            (*config).mapping_count as usize,
        );
        (*mctx).bfree(
            (*config).mappings.load() as *mut u8,
            (*config).mapping_cap as usize * size_of::<Mapping>(),
        );
        (*config).mappings.store(fresh);
        (*config).mapping_cap = new_cap;
        Ok(())
    }
}

unsafe fn grow_prefixes(config: *mut Nat64Config, mctx: *mut MemoryContext) -> Nat64Result {
    unsafe {
        let new_cap = (*config).prefix_cap * 2;
        let fresh = (*mctx).balloc_zeroed(new_cap as usize * size_of::<Prefix>()) as *mut Prefix;
        if fresh.is_null() {
            return Err(Nat64Error::OutOfMemory);
        }
        core::ptr::copy_nonoverlapping(
            (*config).prefixes.load(),
            fresh,
            (*config).prefix_count as usize,
        );
        (*mctx).bfree(
            (*config).prefixes.load() as *mut u8,
            (*config).prefix_cap as usize * size_of::<Prefix>(),
        );
        (*config).prefixes.store(fresh);
        (*config).prefix_cap = new_cap;
        Ok(())
    }
}

/// Return every internal allocation to the agent context.
///
/// # Safety
///
/// `data` must head an unreachable NAT64 configuration blob.
pub unsafe fn nat64_config_free(data: *mut ModuleData) {
    unsafe {
        let config = Nat64Config::from_module_data(data);
        let agent = (*data).agent.load();
        let mctx: *mut MemoryContext = &mut (*agent).memory_context;

        (*config).mappings_v4.free();
        (*config).mappings_v6.free();
        (*config).prefixes_lpm.free();
        (*mctx).bfree(
            (*config).mappings.load() as *mut u8,
            (*config).mapping_cap as usize * size_of::<Mapping>(),
        );
        (*mctx).bfree(
            (*config).prefixes.load() as *mut u8,
            (*config).prefix_cap as usize * size_of::<Prefix>(),
        );
        CounterStorage::release((*config).counter_storage.load());
        (*config).counter_registry.free();
    }
}
