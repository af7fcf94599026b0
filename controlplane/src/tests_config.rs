use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;

use crate::agent::Agent;
use crate::cp::{self, PipelineConfig};
use crate::dp::DpConfig;
use crate::error::ConfigError;
use crate::module::ModuleData;

struct Region {
    backing: Vec<u8>,
}

impl Region {
    fn new(bytes: usize) -> Self {
        Self {
            backing: vec![0u8; bytes],
        }
    }

    fn init(&mut self, worker_count: usize, modules: &[&str]) -> *mut DpConfig {
        unsafe {
            DpConfig::init(
                self.backing.as_mut_ptr(),
                self.backing.len(),
                0,
                1,
                worker_count,
                modules,
            )
            .unwrap()
        }
    }
}

fn attach(dp: *mut DpConfig, name: &str) -> *mut Agent {
    unsafe { Agent::attach(dp, name, 1 << 20).unwrap() }
}

fn module_blob(agent: *mut Agent, index: u64, name: &str) -> *mut ModuleData {
    unsafe {
        (*agent)
            .alloc_module_data(index, name, size_of::<ModuleData>())
            .unwrap()
    }
}

#[test]
fn bootstrap_publishes_empty_generation() {
    let mut region = Region::new(8 << 20);
    let dp = region.init(0, &["balancer", "nat64"]);
    unsafe {
        let cp = (*dp).cp_config.load();
        let generation = &*(*cp).root();
        assert_eq!(generation.generation, 0);
        assert_eq!(generation.module_count(), 0);
        assert_eq!(generation.pipeline_count(), 0);
        assert_eq!(generation.device_count(), 0);
        assert_eq!((*dp).lookup_module("balancer"), Some(0));
        assert_eq!((*dp).lookup_module("nat64"), Some(1));
        assert_eq!((*dp).lookup_module("route"), None);
    }
}

#[test]
fn update_modules_appends_then_replaces() {
    let mut region = Region::new(8 << 20);
    let dp = region.init(0, &["balancer", "nat64"]);
    let agent = attach(dp, "test-agent");

    let first = module_blob(agent, 0, "lb0");
    let second = module_blob(agent, 1, "nat0");
    unsafe {
        cp::update_modules(agent, &[first, second]).unwrap();

        let cpcfg = (*dp).cp_config.load();
        let generation = &*(*cpcfg).root();
        assert_eq!(generation.generation, 1);
        assert_eq!(generation.module_count(), 2);
        assert_eq!(generation.lookup_module(0, "lb0"), Some(0));
        assert_eq!(generation.lookup_module(1, "nat0"), Some(1));
        assert_eq!((*agent).loaded_module_count, 2);

        // Replace lb0: same (type, name) keeps its registry slot; the
        // retired blob returns to the agent's unused list.
        let replacement = module_blob(agent, 0, "lb0");
        cp::update_modules(agent, &[replacement]).unwrap();

        let generation = &*(*cpcfg).root();
        assert_eq!(generation.generation, 2);
        assert_eq!(generation.module_count(), 2);
        assert_eq!(generation.module_data(0), replacement);
        assert_eq!((*agent).loaded_module_count, 2);

        let retired = (*agent).take_unused_module().unwrap();
        assert_eq!(retired, first);
        assert!((*agent).take_unused_module().is_none());
    }
}

#[test]
fn pipelines_resolve_modules_or_fail_cleanly() {
    let mut region = Region::new(8 << 20);
    let dp = region.init(0, &["balancer", "nat64"]);
    let agent = attach(dp, "test-agent");

    let lb = module_blob(agent, 0, "lb0");
    let nat = module_blob(agent, 1, "nat0");
    unsafe {
        cp::update_modules(agent, &[lb, nat]).unwrap();
        let cpcfg = (*dp).cp_config.load();

        let good = PipelineConfig {
            modules: vec![
                ("nat64".to_string(), "nat0".to_string()),
                ("balancer".to_string(), "lb0".to_string()),
            ],
        };
        cp::update_pipelines(dp, cpcfg, &[good.clone()]).unwrap();
        let generation = &*(*cpcfg).root();
        assert_eq!(generation.pipeline_count(), 1);
        assert_eq!(generation.pipeline(0), [1, 0]);

        // Unknown module instance: publication must abort without
        // touching the live generation or leaking memory.
        let published_before = generation.generation;
        let outstanding_before = (*cpcfg).memory_context.outstanding();
        let bad = PipelineConfig {
            modules: vec![("balancer".to_string(), "missing".to_string())],
        };
        let err = cp::update_pipelines(dp, cpcfg, &[good, bad]).unwrap_err();
        assert_eq!(err, ConfigError::UnknownModule("missing".to_string()));

        let generation = &*(*cpcfg).root();
        assert_eq!(generation.generation, published_before);
        assert_eq!((*cpcfg).memory_context.outstanding(), outstanding_before);

        // Unknown module type fails the same way.
        let bad_type = PipelineConfig {
            modules: vec![("firewall".to_string(), "fw0".to_string())],
        };
        let err = cp::update_pipelines(dp, cpcfg, &[bad_type]).unwrap_err();
        assert_eq!(err, ConfigError::UnknownModuleType("firewall".to_string()));
    }
}

#[test]
fn devices_reject_unknown_pipelines() {
    let mut region = Region::new(8 << 20);
    let dp = region.init(0, &["balancer"]);
    let agent = attach(dp, "test-agent");

    unsafe {
        let cpcfg = (*dp).cp_config.load();
        // No pipelines yet: any mapping must fail before publication.
        let err = cp::update_devices(dp, cpcfg, &[0]).unwrap_err();
        assert_eq!(err, ConfigError::UnknownPipeline(0));

        let lb = module_blob(agent, 0, "lb0");
        cp::update_modules(agent, &[lb]).unwrap();
        let pipeline = PipelineConfig {
            modules: vec![("balancer".to_string(), "lb0".to_string())],
        };
        cp::update_pipelines(dp, cpcfg, &[pipeline]).unwrap();

        cp::update_devices(dp, cpcfg, &[0, 0]).unwrap();
        let generation = &*(*cpcfg).root();
        assert_eq!(generation.device_count(), 2);
        assert_eq!(generation.device_pipeline(0), Some(0));
        assert_eq!(generation.device_pipeline(1), Some(0));
        assert_eq!(generation.device_pipeline(2), None);
    }
}

/// A tight-loop reader worker never observes a dangling generation while
/// the control plane publishes a hundred replacements under it.
#[test]
fn publication_never_exposes_dangling_generations() {
    let mut region = Region::new(32 << 20);
    let dp = region.init(1, &["balancer"]);
    let agent = attach(dp, "test-agent");

    let stop = Arc::new(AtomicBool::new(false));
    let observed_max = Arc::new(AtomicU64::new(0));

    let dp_addr = dp as usize;
    let stop_reader = Arc::clone(&stop);
    let observed = Arc::clone(&observed_max);
    let reader = thread::spawn(move || {
        let dp = dp_addr as *mut DpConfig;
        unsafe {
            let cpcfg = (*dp).cp_config.load();
            let worker = (*dp).worker(0);
            while !stop_reader.load(Ordering::Relaxed) {
                // Worker iteration protocol: read the root, publish the
                // observed generation, then use the snapshot.
                let generation = (*cpcfg).root();
                let seen = (*generation).generation;
                (*worker).generation.store(seen, Ordering::Release);

                // Touch everything the generation reaches; a freed
                // registry here would be use-after-free under sanitizers
                // and garbage counts otherwise.
                let count = (*generation).module_count();
                assert!(count <= 1);
                for idx in 0..count {
                    let data = (*generation).module_data(idx);
                    assert_eq!((*data).index, 0);
                }
                observed.fetch_max(seen, Ordering::Relaxed);
            }
        }
    });

    unsafe {
        for _ in 0..100 {
            let blob = module_blob(agent, 0, "lb0");
            cp::update_modules(agent, &[blob]).unwrap();
            // Retired blobs come back; recycle the list so the agent
            // arena survives a hundred rounds.
            while (*agent).take_unused_module().is_some() {}
        }
    }
    stop.store(true, Ordering::Relaxed);
    reader.join().unwrap();

    unsafe {
        let cpcfg = (*dp).cp_config.load();
        let generation = &*(*cpcfg).root();
        assert_eq!(generation.generation, 100);
        assert_eq!(observed_max.load(Ordering::Relaxed), 100);
    }
}
