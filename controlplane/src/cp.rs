use core::hint::spin_loop;
use core::sync::atomic::{AtomicU32, Ordering};

use log::debug;

use slipstream_mem::{AtomicRelPtr, BlockAllocator, MemoryContext, RelPtr};

use crate::agent::Agent;
use crate::dp::DpConfig;
use crate::error::{ConfigError, ConfigResult};
use crate::module::ModuleData;

/// Registry of module instances: a count followed inline by
/// [`CpModule`] slots.
#[repr(C)]
pub struct CpModuleRegistry {
    pub count: u64,
}

#[repr(C)]
pub struct CpModule {
    pub data: RelPtr<ModuleData>,
}

impl CpModuleRegistry {
    pub fn size_for(count: u64) -> usize {
        size_of::<Self>() + count as usize * size_of::<CpModule>()
    }

    /// # Safety
    /// `this` must point at a registry allocated via `size_for`.
    pub unsafe fn modules(this: *mut Self) -> *mut CpModule {
        unsafe { this.add(1) as *mut CpModule }
    }
}

/// One pipeline: an ordered sequence of indices into the module registry.
#[repr(C)]
pub struct CpPipeline {
    pub length: u64,
    pub module_indexes: RelPtr<u64>,
}

#[repr(C)]
pub struct CpPipelineRegistry {
    pub count: u64,
}

impl CpPipelineRegistry {
    pub fn size_for(count: u64) -> usize {
        size_of::<Self>() + count as usize * size_of::<CpPipeline>()
    }

    /// # Safety
    /// `this` must point at a registry allocated via `size_for`.
    pub unsafe fn pipelines(this: *mut Self) -> *mut CpPipeline {
        unsafe { this.add(1) as *mut CpPipeline }
    }
}

/// Device registry: physical-port index to pipeline index.
#[repr(C)]
pub struct CpDeviceRegistry {
    pub count: u64,
}

impl CpDeviceRegistry {
    pub fn size_for(count: u64) -> usize {
        size_of::<Self>() + count as usize * size_of::<u64>()
    }

    /// # Safety
    /// `this` must point at a registry allocated via `size_for`.
    pub unsafe fn pipelines(this: *mut Self) -> *mut u64 {
        unsafe { this.add(1) as *mut u64 }
    }
}

/// An immutable configuration snapshot. Once published through
/// [`CpConfig::root`], a generation and everything it reaches is only
/// read until reclamation.
#[repr(C)]
pub struct CpConfigGen {
    pub generation: u64,
    pub prev: RelPtr<CpConfigGen>,
    pub module_registry: RelPtr<CpModuleRegistry>,
    pub pipeline_registry: RelPtr<CpPipelineRegistry>,
    pub device_registry: RelPtr<CpDeviceRegistry>,
}

impl CpConfigGen {
    pub fn module_count(&self) -> u64 {
        // SAFETY: published generations always carry a registry.
        unsafe { (*self.module_registry.load()).count }
    }

    pub fn module_data(&self, idx: u64) -> *mut ModuleData {
        let registry = self.module_registry.load();
        // SAFETY: `idx` is bounded by the registry count by callers.
        unsafe {
            (*CpModuleRegistry::modules(registry).add(idx as usize))
                .data
                .load()
        }
    }

    /// Find a module instance by type index and name.
    pub fn lookup_module(&self, index: u64, name: &str) -> Option<u64> {
        for idx in 0..self.module_count() {
            let data = self.module_data(idx);
            // SAFETY: registry entries point at live module data.
            let data = unsafe { &*data };
            if data.index == index && data.name_matches(name) {
                return Some(idx);
            }
        }
        None
    }

    pub fn pipeline_count(&self) -> u64 {
        // SAFETY: as in `module_count`.
        unsafe { (*self.pipeline_registry.load()).count }
    }

    /// The module-registry indices of pipeline `idx`.
    pub fn pipeline(&self, idx: u64) -> &[u64] {
        let registry = self.pipeline_registry.load();
        // SAFETY: bounded by `pipeline_count`; index arrays are sized by
        // `length`.
        unsafe {
            let pipeline = &*CpPipelineRegistry::pipelines(registry).add(idx as usize);
            if pipeline.length == 0 {
                return &[];
            }
            core::slice::from_raw_parts(pipeline.module_indexes.load(), pipeline.length as usize)
        }
    }

    pub fn device_count(&self) -> u64 {
        // SAFETY: as in `module_count`.
        unsafe { (*self.device_registry.load()).count }
    }

    pub fn device_pipeline(&self, device: u64) -> Option<u64> {
        if device >= self.device_count() {
            return None;
        }
        // SAFETY: bounded above.
        Some(unsafe { *CpDeviceRegistry::pipelines(self.device_registry.load()).add(device as usize) })
    }
}

/// Pipeline description submitted by an agent: ordered
/// `(module type name, module instance name)` pairs.
#[derive(Clone, Default)]
pub struct PipelineConfig {
    pub modules: Vec<(String, String)>,
}

/// Control-plane zone: its own allocator and context, the pid-tagged
/// writer lock, and the published generation root.
#[repr(C)]
pub struct CpConfig {
    pub block_allocator: BlockAllocator,
    pub memory_context: MemoryContext,
    config_lock: AtomicU32,
    pub dp_config: RelPtr<DpConfig>,
    pub cp_config_gen: AtomicRelPtr<CpConfigGen>,
}

impl CpConfig {
    /// Initialize the zone in place and publish the empty generation 0.
    ///
    /// # Safety
    ///
    /// `cp` must point at uninitialized zone storage; `arena` must be an
    /// exclusively owned range of `arena_len` bytes inside the mapping.
    pub unsafe fn init(
        cp: *mut CpConfig,
        dp: *mut DpConfig,
        arena: *mut u8,
        arena_len: usize,
    ) -> ConfigResult {
        unsafe {
            (*cp).block_allocator.init();
            (*cp).block_allocator.put_arena(arena, arena_len);
            (*cp)
                .memory_context
                .init("controlplane", &mut (*cp).block_allocator);
            (*cp).config_lock = AtomicU32::new(0);
            (*cp).dp_config = RelPtr::null();
            (*cp).dp_config.store(dp);

            let mctx = &mut (*cp).memory_context;
            let modules = mctx.balloc_zeroed(CpModuleRegistry::size_for(0)) as *mut CpModuleRegistry;
            let pipelines =
                mctx.balloc_zeroed(CpPipelineRegistry::size_for(0)) as *mut CpPipelineRegistry;
            let devices =
                mctx.balloc_zeroed(CpDeviceRegistry::size_for(0)) as *mut CpDeviceRegistry;
            let generation = mctx.balloc_zeroed(size_of::<CpConfigGen>()) as *mut CpConfigGen;
            if modules.is_null() || pipelines.is_null() || devices.is_null() || generation.is_null() {
                return Err(ConfigError::OutOfMemory);
            }
            (*generation).generation = 0;
            (*generation).module_registry.store(modules);
            (*generation).pipeline_registry.store(pipelines);
            (*generation).device_registry.store(devices);
            (*cp).cp_config_gen = AtomicRelPtr::null();
            (*cp).cp_config_gen.store(generation);
        }
        Ok(())
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

    /// The currently published generation (acquire).
    pub fn root(&self) -> *mut CpConfigGen {
        self.cp_config_gen.load()
    }
}

/// Walk the freshly published registry and return every superseded
/// module configuration to its owning agent's unused list.
unsafe fn collect_modules(cp: *mut CpConfig) {
    unsafe {
        let generation = &*(*cp).cp_config_gen.load();
        for idx in 0..generation.module_count() {
            let data = generation.module_data(idx);
            let prev = (*data).prev.load();
            if prev.is_null() {
                continue;
            }
            let prev_agent = (*prev).agent.load();
            (*data).prev.store((*prev).prev.load());
            // Chain the retired blob into the owning agent's free list.
            (*prev).prev.store((*prev_agent).unused_module.load());
            (*prev_agent).unused_module.store(prev);
        }
    }
}

/// Publish a configuration generation where modules matching
/// `(type index, name)` are replaced and new ones appended; pipeline and
/// device registries are shared with the previous generation.
///
/// # Safety
///
/// `agent` must be a live attached agent and every `ModuleData` pointer
/// a configuration blob owned by an agent of the same instance.
pub unsafe fn update_modules(agent: *mut Agent, module_datas: &[*mut ModuleData]) -> ConfigResult {
    unsafe {
        let dp = (*agent).dp_config.load();
        let cp = (*agent).cp_config.load();
        (*cp).lock();

        let result = update_modules_locked(dp, cp, module_datas);
        (*cp).unlock();
        result
    }
}

unsafe fn update_modules_locked(
    dp: *mut DpConfig,
    cp: *mut CpConfig,
    module_datas: &[*mut ModuleData],
) -> ConfigResult {
    unsafe {
        let old_gen = (*cp).cp_config_gen.load();
        let old_registry = (*old_gen).module_registry.load();
        let old_count = (*old_registry).count;

        // First pass: how many of the submitted modules are genuinely
        // new, and chain the replaced ones for reclamation.
        let mut new_count = old_count;
        for &data in module_datas {
            let existing = (*old_gen).lookup_module((*data).index, (*data).name());
            match existing {
                Some(idx) => (*data).prev.store((*old_gen).module_data(idx)),
                None => {
                    (*data).prev.store(core::ptr::null_mut());
                    new_count += 1;
                }
            }
        }

        let mctx = &mut (*cp).memory_context;
        let new_gen = mctx.balloc_zeroed(size_of::<CpConfigGen>()) as *mut CpConfigGen;
        if new_gen.is_null() {
            return Err(ConfigError::OutOfMemory);
        }
        let new_registry =
            mctx.balloc_zeroed(CpModuleRegistry::size_for(new_count)) as *mut CpModuleRegistry;
        if new_registry.is_null() {
            mctx.bfree(new_gen as *mut u8, size_of::<CpConfigGen>());
            return Err(ConfigError::OutOfMemory);
        }

        (*new_gen).generation = (*old_gen).generation + 1;
        // Module order is preserved, so the pipeline and device
        // registries carry over by reference.
        (*new_gen)
            .pipeline_registry
            .equate(&(*old_gen).pipeline_registry);
        (*new_gen)
            .device_registry
            .equate(&(*old_gen).device_registry);

        // Copy the old entries, then update or append the new ones.
        let old_modules = CpModuleRegistry::modules(old_registry);
        let new_modules = CpModuleRegistry::modules(new_registry);
        for idx in 0..old_count as usize {
            (*new_modules.add(idx))
                .data
                .equate(&(*old_modules.add(idx)).data);
        }
        (*new_registry).count = old_count;

        for &data in module_datas {
            let mut replaced = false;
            for idx in 0..old_count as usize {
                let slot = new_modules.add(idx);
                let old_data = (*slot).data.load();
                if (*data).index == (*old_data).index
                    && (*data).name() == (*old_data).name()
                {
                    let old_agent = (*old_data).agent.load();
                    (*old_agent).loaded_module_count -= 1;
                    (*slot).data.store(data);
                    replaced = true;
                    break;
                }
            }
            if !replaced {
                let slot = new_modules.add((*new_registry).count as usize);
                (*slot).data = RelPtr::null();
                (*slot).data.store(data);
                (*new_registry).count += 1;
            }
            (*data).generation = (*new_gen).generation;
            let new_agent = (*data).agent.load();
            (*new_agent).loaded_module_count += 1;
        }
        debug_assert_eq!((*new_registry).count, new_count);

        (*new_gen).module_registry.store(new_registry);
        (*new_gen).prev.store(old_gen);

        (*cp).cp_config_gen.store(new_gen);
        (*dp).wait_for_gen((*new_gen).generation);

        collect_modules(cp);
        (*new_gen).prev.store((*old_gen).prev.load());

        debug!(
            "published module generation {} ({} modules)",
            (*new_gen).generation,
            (*new_registry).count
        );

        let mctx = &mut (*cp).memory_context;
        mctx.bfree(
            old_registry as *mut u8,
            CpModuleRegistry::size_for(old_count),
        );
        mctx.bfree(old_gen as *mut u8, size_of::<CpConfigGen>());
        Ok(())
    }
}

/// Publish a new pipeline registry; module and device registries are
/// shared with the previous generation. Any resolution failure frees
/// everything allocated so far and leaves the old generation current.
///
/// # Safety
///
/// `cp` must be the initialized control-plane zone of `dp`.
pub unsafe fn update_pipelines(
    dp: *mut DpConfig,
    cp: *mut CpConfig,
    pipelines: &[PipelineConfig],
) -> ConfigResult {
    unsafe {
        (*cp).lock();
        let result = update_pipelines_locked(dp, cp, pipelines);
        (*cp).unlock();
        result
    }
}

/// Free the index arrays of the first `built` pipelines plus the
/// registry itself; used on every pipeline-resolution error path so a
/// failed publication leaks nothing.
unsafe fn free_partial_pipelines(
    mctx: &mut MemoryContext,
    registry: *mut CpPipelineRegistry,
    total: u64,
    built: usize,
) {
    unsafe {
        for idx in 0..built {
            let pipeline = &*CpPipelineRegistry::pipelines(registry).add(idx);
            if pipeline.length > 0 {
                mctx.bfree(
                    pipeline.module_indexes.load() as *mut u8,
                    pipeline.length as usize * size_of::<u64>(),
                );
            }
        }
        mctx.bfree(registry as *mut u8, CpPipelineRegistry::size_for(total));
    }
}

unsafe fn update_pipelines_locked(
    dp: *mut DpConfig,
    cp: *mut CpConfig,
    pipelines: &[PipelineConfig],
) -> ConfigResult {
    unsafe {
        let old_gen = (*cp).cp_config_gen.load();
        let count = pipelines.len() as u64;

        let mctx = &mut (*cp).memory_context;
        let new_gen = mctx.balloc_zeroed(size_of::<CpConfigGen>()) as *mut CpConfigGen;
        if new_gen.is_null() {
            return Err(ConfigError::OutOfMemory);
        }
        let new_registry =
            mctx.balloc_zeroed(CpPipelineRegistry::size_for(count)) as *mut CpPipelineRegistry;
        if new_registry.is_null() {
            mctx.bfree(new_gen as *mut u8, size_of::<CpConfigGen>());
            return Err(ConfigError::OutOfMemory);
        }

        (*new_gen).generation = (*old_gen).generation + 1;
        (*new_gen)
            .module_registry
            .equate(&(*old_gen).module_registry);
        (*new_gen)
            .device_registry
            .equate(&(*old_gen).device_registry);

        // Resolve every pipeline before publication; any failure frees
        // the registry, the arrays built so far and the new generation.
        for (pipeline_idx, config) in pipelines.iter().enumerate() {
            let length = config.modules.len();
            let indexes_bytes = length.max(1) * size_of::<u64>();
            let indexes = mctx.balloc_zeroed(indexes_bytes) as *mut u64;
            if indexes.is_null() {
                free_partial_pipelines(mctx, new_registry, count, pipeline_idx);
                mctx.bfree(new_gen as *mut u8, size_of::<CpConfigGen>());
                return Err(ConfigError::OutOfMemory);
            }

            let mut resolve_error = None;
            for (module_idx, (type_name, name)) in config.modules.iter().enumerate() {
                let Some(dp_index) = (*dp).lookup_module(type_name) else {
                    resolve_error = Some(ConfigError::UnknownModuleType(type_name.clone()));
                    break;
                };
                let Some(registry_idx) = (*new_gen).lookup_module(dp_index, name) else {
                    resolve_error = Some(ConfigError::UnknownModule(name.clone()));
                    break;
                };
                *indexes.add(module_idx) = registry_idx;
            }
            if let Some(err) = resolve_error {
                mctx.bfree(indexes as *mut u8, indexes_bytes);
                free_partial_pipelines(mctx, new_registry, count, pipeline_idx);
                mctx.bfree(new_gen as *mut u8, size_of::<CpConfigGen>());
                return Err(err);
            }

            let pipeline = &mut *CpPipelineRegistry::pipelines(new_registry).add(pipeline_idx);
            pipeline.length = length as u64;
            pipeline.module_indexes = RelPtr::null();
            if length > 0 {
                pipeline.module_indexes.store(indexes);
            } else {
                mctx.bfree(indexes as *mut u8, indexes_bytes);
            }
        }

        (*new_registry).count = count;
        (*new_gen).pipeline_registry.store(new_registry);
        (*new_gen).prev.store(old_gen);

        (*cp).cp_config_gen.store(new_gen);
        (*dp).wait_for_gen((*new_gen).generation);

        (*new_gen).prev.store((*old_gen).prev.load());

        // Reclaim the superseded pipeline registry and its index arrays.
        let old_registry = (*old_gen).pipeline_registry.load();
        let old_count = (*old_registry).count;
        let mctx = &mut (*cp).memory_context;
        for idx in 0..old_count as usize {
            let pipeline = &*CpPipelineRegistry::pipelines(old_registry).add(idx);
            if pipeline.length > 0 {
                mctx.bfree(
                    pipeline.module_indexes.load() as *mut u8,
                    pipeline.length as usize * size_of::<u64>(),
                );
            }
        }
        mctx.bfree(
            old_registry as *mut u8,
            CpPipelineRegistry::size_for(old_count),
        );
        mctx.bfree(old_gen as *mut u8, size_of::<CpConfigGen>());

        debug!("published pipeline generation {}", (*new_gen).generation);
        Ok(())
    }
}

/// Publish a new device-to-pipeline mapping. Every referenced pipeline
/// index is validated against the live pipeline registry before any
/// publication.
///
/// # Safety
///
/// `cp` must be the initialized control-plane zone of `dp`.
pub unsafe fn update_devices(
    dp: *mut DpConfig,
    cp: *mut CpConfig,
    device_pipelines: &[u64],
) -> ConfigResult {
    unsafe {
        (*cp).lock();
        let result = update_devices_locked(dp, cp, device_pipelines);
        (*cp).unlock();
        result
    }
}

unsafe fn update_devices_locked(
    dp: *mut DpConfig,
    cp: *mut CpConfig,
    device_pipelines: &[u64],
) -> ConfigResult {
    unsafe {
        let old_gen = (*cp).cp_config_gen.load();

        let pipeline_count = (*old_gen).pipeline_count();
        for &pipeline in device_pipelines {
            if pipeline >= pipeline_count {
                return Err(ConfigError::UnknownPipeline(pipeline));
            }
        }

        let count = device_pipelines.len() as u64;
        let mctx = &mut (*cp).memory_context;
        let new_gen = mctx.balloc_zeroed(size_of::<CpConfigGen>()) as *mut CpConfigGen;
        if new_gen.is_null() {
            return Err(ConfigError::OutOfMemory);
        }
        let new_registry =
            mctx.balloc_zeroed(CpDeviceRegistry::size_for(count)) as *mut CpDeviceRegistry;
        if new_registry.is_null() {
            mctx.bfree(new_gen as *mut u8, size_of::<CpConfigGen>());
            return Err(ConfigError::OutOfMemory);
        }

        (*new_gen).generation = (*old_gen).generation + 1;
        (*new_gen)
            .module_registry
            .equate(&(*old_gen).module_registry);
        (*new_gen)
            .pipeline_registry
            .equate(&(*old_gen).pipeline_registry);

        (*new_registry).count = count;
        for (idx, &pipeline) in device_pipelines.iter().enumerate() {
            *CpDeviceRegistry::pipelines(new_registry).add(idx) = pipeline;
        }
        (*new_gen).device_registry.store(new_registry);
        (*new_gen).prev.store(old_gen);

        (*cp).cp_config_gen.store(new_gen);
        (*dp).wait_for_gen((*new_gen).generation);

        (*new_gen).prev.store((*old_gen).prev.load());

        let old_registry = (*old_gen).device_registry.load();
        let old_count = (*old_registry).count;
        let mctx = &mut (*cp).memory_context;
        mctx.bfree(
            old_registry as *mut u8,
            CpDeviceRegistry::size_for(old_count),
        );
        mctx.bfree(old_gen as *mut u8, size_of::<CpConfigGen>());

        debug!("published device generation {}", (*new_gen).generation);
        Ok(())
    }
}
