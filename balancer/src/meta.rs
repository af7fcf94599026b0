use slipstream_dataplane::Packet;
use slipstream_dataplane::headers::{ether, ipv4, ipv6, proto, tcp, udp};

/// Flattened view of the fields the balancer keys on. IPv4 addresses
/// occupy the first four bytes of the 16-byte fields, the rest zeroed.
#[derive(Clone, Copy, Default)]
pub struct PacketMetadata {
    pub network_proto: u8,
    pub transport_proto: u8,
    pub src_addr: [u8; 16],
    pub dst_addr: [u8; 16],
    pub src_port: u16,
    pub dst_port: u16,
    pub tcp_flags: u8,
    pub hash: u64,
}

/// Extract metadata from a parsed packet; `None` for address or
/// transport families the balancer does not serve.
pub fn fill_packet_metadata(packet: &Packet) -> Option<PacketMetadata> {
    let mut meta = PacketMetadata::default();
    let net = packet.network();

    match packet.network_header.ether_type {
        ether::TYPE_IPV4 => {
            meta.src_addr[..4].copy_from_slice(&ipv4::src(net));
            meta.dst_addr[..4].copy_from_slice(&ipv4::dst(net));
        }
        ether::TYPE_IPV6 => {
            meta.network_proto = proto::IPV6;
            meta.src_addr = ipv6::src(net);
            meta.dst_addr = ipv6::dst(net);
        }
        _ => return None,
    }

    let l4 = packet.transport();
    match packet.transport_header.proto {
        proto::TCP => {
            if l4.len() < tcp::MIN_LEN {
                return None;
            }
            meta.transport_proto = proto::TCP;
            meta.src_port = tcp::src_port(l4);
            meta.dst_port = tcp::dst_port(l4);
            meta.tcp_flags = tcp::flags(l4);
        }
        proto::UDP => {
            if l4.len() < udp::LEN {
                return None;
            }
            meta.transport_proto = proto::UDP;
            meta.src_port = udp::src_port(l4);
            meta.dst_port = udp::dst_port(l4);
        }
        _ => return None,
    }

    meta.hash = packet.hash;
    Some(meta)
}
