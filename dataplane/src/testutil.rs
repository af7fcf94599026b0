//! Frame builders for tests: hand-assembled Ethernet/IP/L4 packets with
//! valid checksums. Not part of the dataplane proper; kept in-tree so
//! module tests across the workspace share one set of builders.

use crate::checksum;
use crate::headers::{ether, ipv4, ipv6, proto, tcp, udp};
use crate::packet::{Packet, parse_packet};

pub fn ether_frame(ether_type: u16, payload: &[u8]) -> Vec<u8> {
    let mut frame = vec![0u8; ether::LEN];
    ether::set_dst(&mut frame, &[2, 0, 0, 0, 0, 2]);
    ether::set_src(&mut frame, &[2, 0, 0, 0, 0, 1]);
    ether::set_ethertype(&mut frame, ether_type);
    frame.extend_from_slice(payload);
    frame
}

pub fn ipv4_header(src: &[u8; 4], dst: &[u8; 4], protocol: u8, payload_len: usize) -> Vec<u8> {
    let mut hdr = vec![0u8; ipv4::MIN_LEN];
    ipv4::set_version_ihl(&mut hdr, 5);
    ipv4::set_total_length(&mut hdr, (ipv4::MIN_LEN + payload_len) as u16);
    ipv4::set_ttl(&mut hdr, 64);
    ipv4::set_protocol(&mut hdr, protocol);
    ipv4::set_src(&mut hdr, src);
    ipv4::set_dst(&mut hdr, dst);
    ipv4::update_checksum(&mut hdr);
    hdr
}

pub fn ipv6_header(src: &[u8; 16], dst: &[u8; 16], next: u8, payload_len: usize) -> Vec<u8> {
    let mut hdr = vec![0u8; ipv6::LEN];
    ipv6::set_vtc_flow(&mut hdr, 6 << 28);
    ipv6::set_payload_len(&mut hdr, payload_len as u16);
    ipv6::set_next_header(&mut hdr, next);
    ipv6::set_hop_limit(&mut hdr, 64);
    ipv6::set_src(&mut hdr, src);
    ipv6::set_dst(&mut hdr, dst);
    hdr
}

pub fn udp_segment(sport: u16, dport: u16, payload: &[u8]) -> Vec<u8> {
    let mut seg = vec![0u8; udp::LEN];
    udp::set_src_port(&mut seg, sport);
    udp::set_dst_port(&mut seg, dport);
    udp::set_length(&mut seg, (udp::LEN + payload.len()) as u16);
    seg.extend_from_slice(payload);
    seg
}

pub fn tcp_segment(sport: u16, dport: u16, flags: u8, payload: &[u8]) -> Vec<u8> {
    let mut seg = vec![0u8; tcp::MIN_LEN];
    tcp::set_src_port(&mut seg, sport);
    tcp::set_dst_port(&mut seg, dport);
    tcp::set_data_offset(&mut seg, 5);
    tcp::set_flags(&mut seg, flags);
    seg.extend_from_slice(payload);
    seg
}

fn store_l4_checksum(segment: &mut [u8], protocol: u8, value: u16) {
    match protocol {
        proto::TCP => tcp::set_checksum(segment, value),
        proto::UDP => {
            udp::set_checksum(segment, if value == 0 { 0xffff } else { value });
        }
        _ => {}
    }
}

/// Ethernet + IPv4 + L4 frame with both checksums valid.
pub fn v4_frame(src: &[u8; 4], dst: &[u8; 4], protocol: u8, mut segment: Vec<u8>) -> Vec<u8> {
    let sum = checksum::pseudo_header_v4(src, dst, protocol, segment.len());
    let sum = checksum::ones_complement_sum(sum, &segment);
    store_l4_checksum(&mut segment, protocol, checksum::fold(sum));

    let mut payload = ipv4_header(src, dst, protocol, segment.len());
    payload.extend_from_slice(&segment);
    ether_frame(ether::TYPE_IPV4, &payload)
}

/// Ethernet + IPv6 + L4 frame with a valid pseudo-header checksum.
pub fn v6_frame(src: &[u8; 16], dst: &[u8; 16], next: u8, mut segment: Vec<u8>) -> Vec<u8> {
    let sum = checksum::pseudo_header_v6(src, dst, next, segment.len());
    let sum = checksum::ones_complement_sum(sum, &segment);
    store_l4_checksum(&mut segment, next, checksum::fold(sum));

    let mut payload = ipv6_header(src, dst, next, segment.len());
    payload.extend_from_slice(&segment);
    ether_frame(ether::TYPE_IPV6, &payload)
}

/// Build and parse a packet from a raw frame; panics on parse failure.
pub fn parsed(frame: &[u8]) -> Packet {
    let mut packet = Packet::from_frame(frame);
    parse_packet(&mut packet).expect("test frame must parse");
    packet
}

/// Verify the L4 checksum of a parsed v4/v6 packet; returns true when
/// the ones-complement sum over pseudo-header and segment is zero.
pub fn l4_checksum_ok(packet: &Packet) -> bool {
    let net = packet.network();
    let protocol = packet.transport_header.proto;
    let l4 = packet.transport();
    let sum = match packet.network_header.ether_type {
        ether::TYPE_IPV4 => {
            let len = ipv4::total_length(net) as usize - ipv4::ihl(net);
            let sum =
                checksum::pseudo_header_v4(&ipv4::src(net), &ipv4::dst(net), protocol, len);
            checksum::ones_complement_sum(sum, &l4[..len])
        }
        _ => {
            let len = l4.len();
            let sum =
                checksum::pseudo_header_v6(&ipv6::src(net), &ipv6::dst(net), protocol, len);
            checksum::ones_complement_sum(sum, &l4[..len])
        }
    };
    checksum::fold(sum) == 0
}
