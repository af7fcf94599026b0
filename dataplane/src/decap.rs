use crate::headers::{ether, gre, proto};
use crate::packet::{Packet, TransportHeader, parse_ipv4_header, parse_ipv6_header};

/// Step over a GRE header at `offset`.
///
/// Only plain RFC 2784/2890 headers are accepted: any checksum, key or
/// sequence bit, reserved bits or a non-zero version reject the packet.
fn skip_gre(packet: &Packet, next: &mut u8, offset: &mut u16) -> Option<()> {
    let data = packet.mbuf().data();
    let start = *offset as usize;
    if data.len() < start + gre::LEN {
        return None;
    }
    let hdr = &data[start..];
    // C/K/S, the reserved bits and the version are all required to be
    // zero on ingress, so the header is always the 4-byte base form.
    if gre::flags_version(hdr) != 0 {
        return None;
    }
    *next = match gre::protocol(hdr) {
        ether::TYPE_IPV4 => proto::IPIP,
        ether::TYPE_IPV6 => proto::IPV6,
        _ => return None,
    };
    *offset += gre::LEN as u16;
    Some(())
}

/// Strip one layer of tunnel encapsulation (IPIP, IPv6-in-IP or GRE).
///
/// The L2 stack is preserved in front of the inner network header and
/// the preceding ethertype field is rewritten to the inner family. The
/// packet's header metadata ends up describing the inner packet.
pub fn packet_decap(packet: &mut Packet) -> Option<()> {
    let mut next = packet.transport_header.proto;
    let mut offset = packet.transport_header.offset;

    if next == proto::GRE {
        skip_gre(packet, &mut next, &mut offset)?;
    }
    // `offset` now points at the inner network header.
    let tunnel_len = offset - packet.network_header.offset;

    let (inner_ether_type, inner_proto) = match next {
        proto::IPIP => (
            ether::TYPE_IPV4,
            parse_ipv4_header(packet, &mut offset).ok()?,
        ),
        proto::IPV6 => (
            ether::TYPE_IPV6,
            parse_ipv6_header(packet, &mut offset).ok()?,
        ),
        _ => return None,
    };
    // `offset` now points at the inner transport header.

    let net_off = packet.network_header.offset as usize;
    {
        let data = packet.mbuf_mut().data_mut();
        // Slide the L2 stack forward over the tunnel headers rather than
        // moving the whole payload back.
        data.copy_within(0..net_off, tunnel_len as usize);
    }
    packet.mbuf_mut().adj(tunnel_len as usize)?;
    {
        let data = packet.mbuf_mut().data_mut();
        data[net_off - 2..net_off].copy_from_slice(&inner_ether_type.to_be_bytes());
    }

    packet.network_header.ether_type = inner_ether_type;
    packet.transport_header = TransportHeader {
        proto: inner_proto,
        offset: offset - tunnel_len,
    };
    Some(())
}
