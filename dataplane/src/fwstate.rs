//! Firewall-state sync frames.
//!
//! State owners broadcast session 5-tuples to their peers as IPv6/UDP
//! multicast frames carrying a fixed [`SyncFrame`] payload. Egress
//! observations are stored with src/dst swapped so that both directions
//! of a flow key the same initial state.

use crate::checksum;
use crate::headers::{ether, ipv6, proto, tcp, udp, vlan};
use crate::mbuf::Mbuf;
use crate::packet::{NetworkHeader, Packet, TransportHeader};

pub const ADDR_TYPE_IP4: u8 = 0;
pub const ADDR_TYPE_IP6: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDirection {
    Ingress,
    Egress,
}

/// Wire payload of one state-sync datagram. Addresses are carried in
/// network byte order exactly as seen in the packet; ports and the flow
/// label are host order.
#[derive(Clone, Copy, Default)]
#[repr(C)]
pub struct SyncFrame {
    /// 0 = forward (ingress observation), 1 = backward (egress).
    pub fib: u8,
    pub proto: u8,
    pub addr_type: u8,
    /// TCP flags seen from the initiator side.
    pub flags_src: u8,
    /// TCP flags seen from the responder side.
    pub flags_dst: u8,
    pub _pad: [u8; 3],
    pub src_ip: [u8; 4],
    pub dst_ip: [u8; 4],
    pub src_ip6: [u8; 16],
    pub dst_ip6: [u8; 16],
    pub flow_id6: u32,
    pub src_port: u16,
    pub dst_port: u16,
}

impl SyncFrame {
    pub const LEN: usize = size_of::<SyncFrame>();

    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        // SAFETY: SyncFrame is repr(C) plain old data with no padding
        // holes beyond the explicit `_pad`.
        unsafe { core::mem::transmute_copy(self) }
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::LEN {
            return None;
        }
        let mut frame = SyncFrame::default();
        // SAFETY: plain-old-data copy of exactly LEN bytes.
        unsafe {
            core::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                &mut frame as *mut SyncFrame as *mut u8,
                Self::LEN,
            );
        }
        Some(frame)
    }
}

/// Multicast destination configuration for sync traffic.
pub struct SyncConfig {
    pub dst_ether: [u8; 6],
    pub dst_addr_multicast: [u8; 16],
    pub src_addr: [u8; 16],
    pub port_multicast: u16,
    pub vlan: u16,
}

/// Extract the 5-tuple of `packet` into a sync frame. Egress
/// observations swap src/dst so both directions key the initial state.
///
/// TCP flags are recorded one-directionally and never merged: the state
/// timeout machinery distinguishes SYN, SYN+ACK, FIN and established,
/// and a merged flag set would pin flows in the short SYN state.
pub fn fill_sync_frame(packet: &Packet, direction: SyncDirection) -> SyncFrame {
    let mut frame = SyncFrame::default();
    frame.fib = (direction == SyncDirection::Egress) as u8;

    let net = packet.network();
    match packet.network_header.ether_type {
        ether::TYPE_IPV4 => {
            frame.proto = crate::headers::ipv4::protocol(net);
            frame.addr_type = ADDR_TYPE_IP4;
            let (src, dst) = (
                crate::headers::ipv4::src(net),
                crate::headers::ipv4::dst(net),
            );
            if direction == SyncDirection::Egress {
                frame.src_ip = dst;
                frame.dst_ip = src;
            } else {
                frame.src_ip = src;
                frame.dst_ip = dst;
            }
        }
        ether::TYPE_IPV6 => {
            frame.proto = ipv6::next_header(net);
            frame.addr_type = ADDR_TYPE_IP6;
            let (src, dst) = (ipv6::src(net), ipv6::dst(net));
            if direction == SyncDirection::Egress {
                frame.src_ip6 = dst;
                frame.dst_ip6 = src;
            } else {
                frame.src_ip6 = src;
                frame.dst_ip6 = dst;
            }
            frame.flow_id6 = ipv6::flow_label(net);
        }
        _ => {}
    }

    let l4 = packet.transport();
    match frame.proto {
        proto::TCP if l4.len() >= tcp::MIN_LEN => {
            if direction == SyncDirection::Egress {
                frame.src_port = tcp::dst_port(l4);
                frame.dst_port = tcp::src_port(l4);
                frame.flags_dst = tcp::flags(l4);
            } else {
                frame.src_port = tcp::src_port(l4);
                frame.dst_port = tcp::dst_port(l4);
                frame.flags_src = tcp::flags(l4);
            }
        }
        proto::UDP if l4.len() >= udp::LEN => {
            if direction == SyncDirection::Egress {
                frame.src_port = udp::dst_port(l4);
                frame.dst_port = udp::src_port(l4);
            } else {
                frame.src_port = udp::src_port(l4);
                frame.dst_port = udp::dst_port(l4);
            }
        }
        _ => {}
    }
    frame
}

/// Build a complete Ethernet/VLAN/IPv6/UDP sync packet describing the
/// observed flow of `packet`.
pub fn craft_sync_packet(
    config: &SyncConfig,
    packet: &Packet,
    direction: SyncDirection,
) -> Option<Packet> {
    let frame = fill_sync_frame(packet, direction);

    let eth_off = 0usize;
    let vlan_off = ether::LEN;
    let ip_off = vlan_off + vlan::LEN;
    let udp_off = ip_off + ipv6::LEN;
    let payload_off = udp_off + udp::LEN;
    let total = payload_off + SyncFrame::LEN;

    let mut mbuf = Mbuf::new();
    mbuf.append(total)?;
    let data = mbuf.data_mut();

    ether::set_dst(&mut data[eth_off..], &config.dst_ether);
    ether::set_ethertype(&mut data[eth_off..], ether::TYPE_VLAN);

    vlan::set_tci(&mut data[vlan_off..], config.vlan);
    vlan::set_ethertype(&mut data[vlan_off..], ether::TYPE_IPV6);

    let udp_len = (udp::LEN + SyncFrame::LEN) as u16;
    {
        let ip = &mut data[ip_off..];
        ipv6::set_vtc_flow(ip, 6 << 28);
        ipv6::set_payload_len(ip, udp_len);
        ipv6::set_next_header(ip, proto::UDP);
        ipv6::set_hop_limit(ip, 64);
        ipv6::set_src(ip, &config.src_addr);
        ipv6::set_dst(ip, &config.dst_addr_multicast);
    }
    {
        let udp_hdr = &mut data[udp_off..];
        udp::set_src_port(udp_hdr, config.port_multicast);
        udp::set_dst_port(udp_hdr, config.port_multicast);
        udp::set_length(udp_hdr, udp_len);
    }
    data[payload_off..payload_off + SyncFrame::LEN].copy_from_slice(&frame.to_bytes());

    // UDP checksum over the IPv6 pseudo-header and the datagram.
    let sum = checksum::pseudo_header_v6(
        &config.src_addr,
        &config.dst_addr_multicast,
        proto::UDP,
        udp_len as usize,
    );
    let sum = checksum::ones_complement_sum(sum, &data[udp_off..udp_off + udp_len as usize]);
    let csum = checksum::fold(sum);
    udp::set_checksum(
        &mut data[udp_off..],
        if csum == 0 { 0xffff } else { csum },
    );

    let mut sync = Packet::new(mbuf);
    sync.rx_device_id = packet.rx_device_id;
    sync.tx_device_id = packet.tx_device_id;
    sync.vlan = config.vlan;
    sync.network_header = NetworkHeader {
        ether_type: ether::TYPE_IPV6,
        offset: ip_off as u16,
    };
    sync.transport_header = TransportHeader {
        proto: proto::UDP,
        offset: udp_off as u16,
    };
    Some(sync)
}
