use log::trace;

use slipstream_controlplane::ModuleData;
use slipstream_controlplane::worker::{ModuleHandler, WorkerCtx};
use slipstream_dataplane::headers::ether;
use slipstream_dataplane::{Packet, PacketFront};
use slipstream_lookup::LPM_VALUE_INVALID;

use crate::config::{BalancerConfig, VirtualService};
use crate::meta::{PacketMetadata, fill_packet_metadata};
use crate::select::select_real;
use crate::stats;
use crate::tunnel::tunnel_packet;

/// Resolve the virtual service a packet addresses: filter table on
/// `(dst, dst_port, proto)`, then the per-service source allowlist.
///
/// # Safety
///
/// `config` must be a live published balancer configuration.
unsafe fn vs_lookup(
    config: *mut BalancerConfig,
    worker: usize,
    packet: &Packet,
    meta: &PacketMetadata,
) -> Option<*mut VirtualService> {
    unsafe {
        let table = match packet.network_header.ether_type {
            ether::TYPE_IPV4 => &(*config).vs_v4_table,
            ether::TYPE_IPV6 => &(*config).vs_v6_table,
            _ => return None,
        };
        let key_len = if packet.network_header.ether_type == ether::TYPE_IPV6 {
            16
        } else {
            4
        };

        let service_id =
            table.query(&meta.dst_addr[..key_len], meta.dst_port, meta.transport_proto)?;
        if service_id as u64 >= (*config).vs_count {
            return None;
        }
        let vs = (*config).vs(service_id as u64);

        if (*vs).src_filter.lookup(&meta.src_addr[..key_len]) == LPM_VALUE_INVALID {
            let storage = (*config).counter_storage.load();
            stats::bump(
                storage,
                (*vs).counter,
                worker as u64,
                stats::VS_PACKET_SRC_NOT_ALLOWED,
            );
            return None;
        }
        Some(vs)
    }
}

/// The per-batch datapath: lookup, select, tunnel.
///
/// # Safety
///
/// As for [`vs_lookup`]; `worker` must be driven by one thread.
pub unsafe fn handle_packets(
    config: *mut BalancerConfig,
    front: &mut PacketFront,
    worker: usize,
    now: u32,
) {
    unsafe {
        let storage = (*config).counter_storage.load();
        let module = (*config).module_counter;

        while let Some(mut packet) = front.pop_input() {
            stats::bump(storage, module, worker as u64, stats::MODULE_INCOMING_PACKETS);

            let Some(meta) = fill_packet_metadata(&packet) else {
                stats::bump(storage, module, worker as u64, stats::MODULE_INVALID_PACKETS);
                front.drop(packet);
                continue;
            };

            let Some(vs) = vs_lookup(config, worker, &packet, &meta) else {
                stats::bump(storage, module, worker as u64, stats::MODULE_SELECT_VS_FAILED);
                front.drop(packet);
                continue;
            };
            stats::bump(storage, (*vs).counter, worker as u64, stats::VS_INCOMING_PACKETS);

            let Some(real_id) = select_real(config, worker, now, vs, &meta) else {
                stats::bump(
                    storage,
                    module,
                    worker as u64,
                    stats::MODULE_SELECT_REAL_FAILED,
                );
                front.drop(packet);
                continue;
            };

            let real = &*(*config).real(real_id as u64);
            if tunnel_packet((*vs).flags, real, &mut packet).is_none() {
                trace!("tunnel encapsulation failed; dropping");
                front.drop(packet);
                continue;
            }

            stats::bump(storage, module, worker as u64, stats::MODULE_OUTGOING_PACKETS);
            front.output(packet);
        }
    }
}

/// Catalog adapter: casts the module data back to the balancer blob.
pub struct BalancerHandler;

impl ModuleHandler for BalancerHandler {
    fn handle(&self, ctx: &WorkerCtx, module: *mut ModuleData, front: &mut PacketFront) {
        // SAFETY: the generation machinery only hands this handler
        // module data created by `balancer_config_create`.
        unsafe {
            let config = BalancerConfig::from_module_data(module);
            handle_packets(config, front, ctx.worker_idx, ctx.now);
        }
    }
}
