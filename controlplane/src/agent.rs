use slipstream_mem::{BlockAllocator, MemoryContext, RelPtr, align_up};

use crate::cp::CpConfig;
use crate::dp::DpConfig;
use crate::error::{ConfigError, ConfigResult};
use crate::module::ModuleData;

pub const AGENT_NAME_LEN: usize = 80;

/// A control-plane process attached to the shared region with a memory
/// budget. Agents own the configuration blobs they publish; superseded
/// blobs come back on `unused_module` once their generation drains.
#[repr(C)]
pub struct Agent {
    pub block_allocator: BlockAllocator,
    pub memory_context: MemoryContext,
    pub dp_config: RelPtr<DpConfig>,
    pub cp_config: RelPtr<CpConfig>,
    pub pid: u32,
    pub memory_limit: u64,
    pub generation: u64,
    pub loaded_module_count: u64,
    pub active_module_count: u64,
    name: [u8; AGENT_NAME_LEN],
    pub unused_module: RelPtr<ModuleData>,
}

impl Agent {
    /// Attach to an instance: carve `memory_limit` bytes out of the
    /// instance allocator for this agent's private allocator.
    ///
    /// # Safety
    ///
    /// `dp` must be an initialized instance; the returned agent lives in
    /// the shared region and is only valid while the region is mapped.
    pub unsafe fn attach(
        dp: *mut DpConfig,
        name: &str,
        memory_limit: usize,
    ) -> ConfigResult<*mut Agent> {
        unsafe {
            (*dp).lock();
            let total = align_up(size_of::<Agent>(), 64) + memory_limit;
            let block = (*dp).memory_context.balloc_zeroed(total);
            if block.is_null() {
                (*dp).unlock();
                return Err(ConfigError::OutOfMemory);
            }
            let agent = block as *mut Agent;
            let arena = block.add(align_up(size_of::<Agent>(), 64));

            (*agent).block_allocator.init();
            (*agent).block_allocator.put_arena(arena, memory_limit);
            (*agent)
                .memory_context
                .init(name, &mut (*agent).block_allocator);
            (*agent).dp_config = RelPtr::null();
            (*agent).dp_config.store(dp);
            (*agent).cp_config = RelPtr::null();
            (*agent).cp_config.store((*dp).cp_config.load());
            (*agent).pid = std::process::id();
            (*agent).memory_limit = memory_limit as u64;
            (*agent).name = [0; AGENT_NAME_LEN];
            let bytes = name.as_bytes();
            let len = bytes.len().min(AGENT_NAME_LEN - 1);
            (&mut (*agent).name)[..len].copy_from_slice(&bytes[..len]);
            (*agent).unused_module = RelPtr::null();
            (*dp).unlock();
            Ok(agent)
        }
    }

    pub fn name(&self) -> &str {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(0);
        core::str::from_utf8(&self.name[..end]).unwrap_or("")
    }

    /// Allocate a module configuration blob of `size` bytes headed by a
    /// [`ModuleData`] initialized for `(index, name)`.
    ///
    /// # Safety
    ///
    /// `self` must be a live attached agent inside the shared region.
    pub unsafe fn alloc_module_data(
        &mut self,
        index: u64,
        name: &str,
        size: usize,
    ) -> ConfigResult<*mut ModuleData> {
        debug_assert!(size >= size_of::<ModuleData>());
        let block = self.memory_context.balloc_zeroed(size);
        if block.is_null() {
            return Err(ConfigError::OutOfMemory);
        }
        let data = block as *mut ModuleData;
        // SAFETY: the blob starts with a ModuleData header by contract.
        unsafe {
            (*data).init(index, name, self);
        }
        Ok(data)
    }

    /// Pop a retired module blob of this agent, if any.
    pub fn take_unused_module(&mut self) -> Option<*mut ModuleData> {
        let head = self.unused_module.load();
        if head.is_null() {
            return None;
        }
        // SAFETY: list nodes are retired blobs owned by this agent.
        unsafe {
            self.unused_module.store((*head).prev.load());
            (*head).prev.store(core::ptr::null_mut());
        }
        Some(head)
    }
}
