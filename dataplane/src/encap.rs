use crate::headers::{ether, ipv4, ipv6, proto};
use crate::packet::Packet;

/// Insert `header` between the L2 headers and the current network
/// header, updating the preceding ethertype field and the transport
/// offset. The network offset is unchanged (the L2 stack keeps its
/// length).
fn network_prepend(packet: &mut Packet, ether_type: u16, header: &[u8]) -> Option<()> {
    let size = header.len();
    let net_off = packet.network_header.offset as usize;
    packet.mbuf_mut().prepend(size)?;

    let data = packet.mbuf_mut().data_mut();
    // L2 (Ethernet and any VLAN) slides to the new front; the gap left
    // behind receives the outer header.
    data.copy_within(size..size + net_off, 0);
    data[net_off..net_off + size].copy_from_slice(header);
    // The two bytes immediately before the network header carry the
    // ethertype in both the plain-Ethernet and the VLAN-tagged case.
    data[net_off - 2..net_off].copy_from_slice(&ether_type.to_be_bytes());

    packet.transport_header.offset += size as u16;
    packet.network_header.ether_type = ether_type;
    Some(())
}

/// Encapsulate the packet in an outer IPv4 header addressed `src -> dst`.
/// The inner protocol field becomes IPIP for v4-in-v4 or IPV6 for
/// v6-in-v4.
pub fn ip4_encap(packet: &mut Packet, dst: &[u8; 4], src: &[u8; 4]) -> Option<()> {
    let inner_v4 = match packet.network_header.ether_type {
        ether::TYPE_IPV4 => true,
        ether::TYPE_IPV6 => false,
        _ => return None,
    };

    let mut header = [0u8; ipv4::MIN_LEN];
    ipv4::set_version_ihl(&mut header, 5);
    ipv4::set_src(&mut header, src);
    ipv4::set_dst(&mut header, dst);

    let inner = packet.network();
    if inner_v4 {
        ipv4::set_tos(&mut header, ipv4::tos(inner));
        ipv4::set_total_length(
            &mut header,
            ipv4::MIN_LEN as u16 + ipv4::total_length(inner),
        );
        ipv4::set_packet_id(&mut header, ipv4::packet_id(inner));
        ipv4::set_frag_field(&mut header, ipv4::frag_field(inner));
        ipv4::set_ttl(&mut header, ipv4::ttl(inner));
        ipv4::set_protocol(&mut header, proto::IPIP);
    } else {
        ipv4::set_tos(&mut header, ipv6::traffic_class(inner));
        ipv4::set_total_length(
            &mut header,
            (ipv4::MIN_LEN + ipv6::LEN) as u16 + ipv6::payload_len(inner),
        );
        ipv4::set_packet_id(&mut header, 0x01);
        ipv4::set_ttl(&mut header, ipv6::hop_limit(inner));
        ipv4::set_protocol(&mut header, proto::IPV6);
    }
    ipv4::update_checksum(&mut header);

    network_prepend(packet, ether::TYPE_IPV4, &header)
}

/// Encapsulate the packet in an outer IPv6 header addressed `src -> dst`.
pub fn ip6_encap(packet: &mut Packet, dst: &[u8; 16], src: &[u8; 16]) -> Option<()> {
    let inner_v4 = match packet.network_header.ether_type {
        ether::TYPE_IPV4 => true,
        ether::TYPE_IPV6 => false,
        _ => return None,
    };

    let mut header = [0u8; ipv6::LEN];
    ipv6::set_src(&mut header, src);
    ipv6::set_dst(&mut header, dst);

    let inner = packet.network();
    if inner_v4 {
        ipv6::set_vtc_flow(&mut header, (6 << 28) | ((ipv4::tos(inner) as u32) << 20));
        ipv6::set_payload_len(&mut header, ipv4::total_length(inner));
        ipv6::set_next_header(&mut header, proto::IPIP);
        ipv6::set_hop_limit(&mut header, ipv4::ttl(inner));
    } else {
        ipv6::set_vtc_flow(&mut header, ipv6::vtc_flow(inner));
        ipv6::set_payload_len(&mut header, ipv6::LEN as u16 + ipv6::payload_len(inner));
        ipv6::set_next_header(&mut header, proto::IPV6);
        ipv6::set_hop_limit(&mut header, ipv6::hop_limit(inner));
    }

    network_prepend(packet, ether::TYPE_IPV6, &header)
}
