use core::sync::atomic::Ordering;

use spin::RwLock;

use slipstream_dataplane::PacketFront;

use crate::dp::DpConfig;
use crate::module::ModuleData;

/// Context handed to every module handler invocation.
#[derive(Clone, Copy)]
pub struct WorkerCtx {
    pub worker_idx: usize,
    /// Coarse wall-clock seconds sampled once per iteration.
    pub now: u32,
}

/// A dataplane packet module. Implementations pop from `front.input`
/// and push every packet to `output`, `drop` or `pending`.
pub trait ModuleHandler: Send + Sync {
    fn handle(&self, ctx: &WorkerCtx, module: *mut ModuleData, front: &mut PacketFront);
}

/// Process-local catalog of module handlers, index-aligned with the
/// shared module type table of the instance. Registration happens at
/// startup; workers take the read side on every dispatch.
pub struct ModuleCatalog {
    handlers: RwLock<Vec<Option<Box<dyn ModuleHandler>>>>,
}

impl ModuleCatalog {
    pub fn new(module_count: usize) -> Self {
        let mut handlers = Vec::with_capacity(module_count);
        handlers.resize_with(module_count, || None);
        Self {
            handlers: RwLock::new(handlers),
        }
    }

    pub fn register(&self, index: usize, handler: Box<dyn ModuleHandler>) {
        self.handlers.write()[index] = Some(handler);
    }
}

/// One worker iteration over a batch from `device_id`.
///
/// The worker re-reads the configuration root, publishes the observed
/// generation (the publication barrier polls it), then runs the batch
/// through the pipeline the device registry prescribes. Packets of a
/// device with no pipeline are dropped. No packet straddles two
/// generations: the root is read exactly once per iteration.
///
/// # Safety
///
/// `dp` must be an initialized instance and `worker_idx` one of its
/// worker slots, driven by at most one thread.
pub unsafe fn worker_run(
    dp: *mut DpConfig,
    catalog: &ModuleCatalog,
    worker_idx: usize,
    device_id: u64,
    front: &mut PacketFront,
    now: u32,
) {
    unsafe {
        let cp = (*dp).cp_config.load();
        let generation = (*cp).root();

        let worker = (*dp).worker(worker_idx);
        (*worker).generation.store((*generation).generation, Ordering::Release);
        (*worker).iterations.fetch_add(1, Ordering::Relaxed);

        let Some(pipeline_idx) = (*generation).device_pipeline(device_id) else {
            while let Some(packet) = front.pop_input() {
                front.drop(packet);
            }
            return;
        };

        let ctx = WorkerCtx { worker_idx, now };
        let handlers = catalog.handlers.read();
        for &module_idx in (*generation).pipeline(pipeline_idx) {
            let data = (*generation).module_data(module_idx);
            let type_idx = (*data).index as usize;
            let Some(handler) = handlers.get(type_idx).and_then(|h| h.as_ref()) else {
                while let Some(packet) = front.pop_input() {
                    front.drop(packet);
                }
                return;
            };
            handler.handle(&ctx, data, front);
            front.rotate();
        }
    }
}
