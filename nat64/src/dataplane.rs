use core::sync::atomic::{AtomicU64, Ordering};

use slipstream_controlplane::ModuleData;
use slipstream_controlplane::worker::{ModuleHandler, WorkerCtx};
use slipstream_dataplane::headers::ether;
use slipstream_dataplane::{Packet, PacketFront};

use crate::config::{Nat64Config, stats};
use crate::{v4, v6};

/// Outcome of translating one packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Rewritten in place; forward it.
    Translated,
    /// No mapping/prefix and the drop policy allows pass-through.
    Pass,
    DropUnknownMapping,
    DropUnknownPrefix,
    DropMalformed,
    /// Message type/code with no counterpart, IPsec, source routes.
    DropUnsupported,
}

impl Verdict {
    fn counter_word(self) -> Option<usize> {
        match self {
            Verdict::Translated => None,
            Verdict::Pass => Some(stats::PASSED),
            Verdict::DropUnknownMapping => Some(stats::DROP_UNKNOWN_MAPPING),
            Verdict::DropUnknownPrefix => Some(stats::DROP_UNKNOWN_PREFIX),
            Verdict::DropMalformed => Some(stats::DROP_MALFORMED),
            Verdict::DropUnsupported => Some(stats::DROP_UNSUPPORTED),
        }
    }

    pub fn is_drop(self) -> bool {
        !matches!(self, Verdict::Translated | Verdict::Pass)
    }
}

/// Translate a single parsed packet according to its address family.
pub fn translate_packet(config: &Nat64Config, packet: &mut Packet) -> Verdict {
    match packet.network_header.ether_type {
        ether::TYPE_IPV4 => v4::handle_v4(config, packet),
        ether::TYPE_IPV6 => v6::handle_v6(config, packet),
        _ => Verdict::DropMalformed,
    }
}

/// The per-batch datapath: translate or drop, counting by verdict.
///
/// # Safety
///
/// `config` must be a live published NAT64 configuration; `worker`
/// must be driven by a single thread.
pub unsafe fn handle_packets(
    config: *mut Nat64Config,
    front: &mut PacketFront,
    worker: usize,
) {
    unsafe {
        let storage = (*config).counter_storage.load();
        let link = (*config).counter;
        let bump = |word: usize| {
            // SAFETY: the link belongs to this storage's registry and
            // `word` stays inside the counter.
            unsafe {
                let ptr = (*storage).address(link, worker as u64).add(word);
                (*(ptr as *const AtomicU64)).fetch_add(1, Ordering::Relaxed);
            }
        };

        while let Some(mut packet) = front.pop_input() {
            bump(stats::INCOMING);
            let was_v4 = packet.network_header.ether_type == ether::TYPE_IPV4;
            let verdict = translate_packet(&*config, &mut packet);
            match verdict {
                Verdict::Translated => {
                    bump(if was_v4 {
                        stats::TRANSLATED_V4_TO_V6
                    } else {
                        stats::TRANSLATED_V6_TO_V4
                    });
                    front.output(packet);
                }
                Verdict::Pass => {
                    bump(stats::PASSED);
                    front.output(packet);
                }
                drop_verdict => {
                    if let Some(word) = drop_verdict.counter_word() {
                        bump(word);
                    }
                    front.drop(packet);
                }
            }
        }
    }
}

/// Catalog adapter: casts the module data back to the NAT64 blob.
pub struct Nat64Handler;

impl ModuleHandler for Nat64Handler {
    fn handle(&self, ctx: &WorkerCtx, module: *mut ModuleData, front: &mut PacketFront) {
        // SAFETY: the generation machinery only hands this handler
        // module data created by `nat64_config_create`.
        unsafe {
            let config = Nat64Config::from_module_data(module);
            handle_packets(config, front, ctx.worker_idx);
        }
    }
}
