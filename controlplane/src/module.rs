use slipstream_mem::RelPtr;

use crate::agent::Agent;

pub const MODULE_NAME_LEN: usize = 64;

/// Header embedded at offset 0 of every module configuration blob.
///
/// `index` identifies the module *type* (the dataplane handler slot);
/// `name` the instance. Superseded configurations chain through `prev`
/// until reclamation returns them to the owning agent's unused list;
/// the `agent` backlink is non-owning and only walked for that purpose.
#[repr(C)]
pub struct ModuleData {
    pub index: u64,
    name: [u8; MODULE_NAME_LEN],
    pub agent: RelPtr<Agent>,
    pub generation: u64,
    pub prev: RelPtr<ModuleData>,
}

impl ModuleData {
    pub fn init(&mut self, index: u64, name: &str, agent: *mut Agent) {
        self.index = index;
        self.name = [0; MODULE_NAME_LEN];
        let bytes = name.as_bytes();
        let len = bytes.len().min(MODULE_NAME_LEN - 1);
        self.name[..len].copy_from_slice(&bytes[..len]);
        self.agent = RelPtr::null();
        self.agent.store(agent);
        self.generation = 0;
        self.prev = RelPtr::null();
    }

    pub fn name(&self) -> &str {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(0);
        core::str::from_utf8(&self.name[..end]).unwrap_or("")
    }

    pub fn name_matches(&self, other: &str) -> bool {
        self.name() == other
    }
}
