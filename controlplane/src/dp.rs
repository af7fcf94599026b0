use core::hint::spin_loop;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use slipstream_mem::{BlockAllocator, MemoryContext, RelPtr, align_up};

use crate::cp::CpConfig;
use crate::error::{ConfigError, ConfigResult};

pub const DP_MODULE_NAME_LEN: usize = 80;

/// One dataplane module *type* slot. The packet handler itself is
/// process-local (looked up by index in the worker's module catalog);
/// only the name lives in the shared region.
#[repr(C)]
pub struct DpModule {
    name: [u8; DP_MODULE_NAME_LEN],
}

impl DpModule {
    pub fn name(&self) -> &str {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(0);
        core::str::from_utf8(&self.name[..end]).unwrap_or("")
    }
}

/// Per-worker slot in the shared region. `generation` is the configuration
/// generation the worker last observed; the publication barrier polls it.
#[repr(C, align(64))]
pub struct DpWorker {
    pub idx: u64,
    pub generation: AtomicU64,
    pub iterations: AtomicU64,
    pub rx_count: AtomicU64,
    pub tx_count: AtomicU64,
}

/// Instance header at offset 0 of each dataplane instance's slice of the
/// shared region. Multiple instances stride by `storage_size`.
#[repr(C)]
pub struct DpConfig {
    pub instance_count: u32,
    pub instance_idx: u32,
    pub numa_idx: u32,
    config_lock: AtomicU32,
    pub storage_size: u64,
    pub block_allocator: BlockAllocator,
    pub memory_context: MemoryContext,
    pub module_count: u64,
    pub dp_modules: RelPtr<DpModule>,
    pub cp_config: RelPtr<CpConfig>,
    pub worker_count: u64,
    pub workers: RelPtr<RelPtr<DpWorker>>,
}

/// Share of the instance region handed to the control-plane allocator.
const CP_ARENA_SHARE: usize = 4;

impl DpConfig {
    /// Initialize a dataplane instance over `region` (its exclusive
    /// `storage_size`-byte slice of the mapping), registering the module
    /// type table and `worker_count` worker slots, and bootstrapping the
    /// control-plane zone behind it.
    ///
    /// # Safety
    ///
    /// `region` must be valid for `storage_size` bytes, exclusively owned
    /// by the caller and unaliased until the returned pointer is used.
    pub unsafe fn init(
        region: *mut u8,
        storage_size: usize,
        instance_idx: u32,
        instance_count: u32,
        worker_count: usize,
        module_names: &[&str],
    ) -> ConfigResult<*mut DpConfig> {
        let header = align_up(size_of::<DpConfig>(), 64) + align_up(size_of::<CpConfig>(), 64);
        if storage_size <= header {
            return Err(ConfigError::OutOfMemory);
        }

        let dp = region as *mut DpConfig;
        unsafe {
            (*dp).instance_count = instance_count;
            (*dp).instance_idx = instance_idx;
            (*dp).numa_idx = instance_idx;
            (*dp).config_lock = AtomicU32::new(0);
            (*dp).storage_size = storage_size as u64;
            (*dp).block_allocator.init();
            (*dp)
                .block_allocator
                .put_arena(region.add(header), storage_size - header);
            (*dp)
                .memory_context
                .init("dataplane", &mut (*dp).block_allocator);

            // Module type table.
            let modules_bytes = module_names.len() * size_of::<DpModule>();
            let modules = (*dp).memory_context.balloc_zeroed(modules_bytes) as *mut DpModule;
            if modules.is_null() && !module_names.is_empty() {
                return Err(ConfigError::OutOfMemory);
            }
            for (idx, name) in module_names.iter().enumerate() {
                let slot = &mut (*modules.add(idx)).name;
                let bytes = name.as_bytes();
                let len = bytes.len().min(DP_MODULE_NAME_LEN - 1);
                slot[..len].copy_from_slice(&bytes[..len]);
            }
            (*dp).module_count = module_names.len() as u64;
            (*dp).dp_modules = RelPtr::null();
            (*dp).dp_modules.store(modules);

            // Worker slots.
            let table_bytes = worker_count * size_of::<RelPtr<DpWorker>>();
            let table =
                (*dp).memory_context.balloc_zeroed(table_bytes.max(8)) as *mut RelPtr<DpWorker>;
            if table.is_null() {
                return Err(ConfigError::OutOfMemory);
            }
            for idx in 0..worker_count {
                let worker =
                    (*dp).memory_context.balloc_zeroed(size_of::<DpWorker>() + 64) as *mut u8;
                if worker.is_null() {
                    return Err(ConfigError::OutOfMemory);
                }
                let worker = align_up(worker as usize, 64) as *mut DpWorker;
                (*worker).idx = idx as u64;
                (*table.add(idx)) = RelPtr::null();
                (*table.add(idx)).store(worker);
            }
            (*dp).worker_count = worker_count as u64;
            (*dp).workers = RelPtr::null();
            (*dp).workers.store(table);

            // Control-plane zone directly behind the instance header,
            // fed by its own arena so control-plane allocations never
            // contend with agent attachment.
            let cp = region.add(align_up(size_of::<DpConfig>(), 64)) as *mut CpConfig;
            let cp_arena_len = (storage_size - header) / CP_ARENA_SHARE;
            let cp_arena = (*dp).memory_context.balloc(cp_arena_len);
            if cp_arena.is_null() {
                return Err(ConfigError::OutOfMemory);
            }
            CpConfig::init(cp, dp, cp_arena, cp_arena_len)?;
            (*dp).cp_config = RelPtr::null();
            (*dp).cp_config.store(cp);
        }
        Ok(dp)
    }

    /// The k-th instance after this one in the mapping.
    pub fn nextk(current: *mut DpConfig, k: u32) -> *mut DpConfig {
        let mut current = current;
        for _ in 0..k {
            // SAFETY: instances are laid out back to back, each
            // `storage_size` bytes long.
            current = unsafe {
                (current as *mut u8).add((*current).storage_size as usize) as *mut DpConfig
            };
        }
        current
    }

    pub fn try_lock(&self) -> bool {
        let pid = std::process::id();
        self.config_lock
            .compare_exchange(0, pid, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    pub fn lock(&self) {
        while !self.try_lock() {
            spin_loop();
        }
    }

    pub fn unlock(&self) -> bool {
        let pid = std::process::id();
        self.config_lock
            .compare_exchange(pid, 0, Ordering::Release, Ordering::Relaxed)
            .is_ok()
    }

    pub fn lookup_module(&self, name: &str) -> Option<u64> {
        let modules = self.dp_modules.load();
        for idx in 0..self.module_count {
            // SAFETY: the table spans `module_count` entries.
            let module = unsafe { &*modules.add(idx as usize) };
            if module.name() == name {
                return Some(idx);
            }
        }
        None
    }

    pub fn worker(&self, idx: usize) -> *mut DpWorker {
        debug_assert!((idx as u64) < self.worker_count);
        // SAFETY: the table spans `worker_count` entries.
        unsafe { (*self.workers.load().add(idx)).load() }
    }

    /// Publication barrier: block until every worker has observed at
    /// least `generation`. Relies on workers making forward progress; busy
    /// workers publish their generation at the head of each iteration.
    pub fn wait_for_gen(&self, generation: u64) {
        for idx in 0..self.worker_count as usize {
            let worker = self.worker(idx);
            // SAFETY: worker slots live for the region's lifetime.
            while unsafe { (*worker).generation.load(Ordering::Acquire) } < generation {
                spin_loop();
            }
        }
    }
}
