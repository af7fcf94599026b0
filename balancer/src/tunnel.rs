use slipstream_dataplane::Packet;
use slipstream_dataplane::checksum::{self, csum_minus, csum_plus};
use slipstream_dataplane::encap::{ip4_encap, ip6_encap};
use slipstream_dataplane::headers::{ether, gre, ipv4, ipv6, proto, tcp};

use crate::config::{Real, RealFlags, VsFlags};

/// Clamp target for an existing MSS option on IPv6 SYNs.
const FIX_MSS_SIZE: u16 = 1220;
/// MSS inserted when the SYN carries no MSS option at all.
const DEFAULT_MSS_SIZE: u16 = 536;

/// Rewrite (or insert) the TCP MSS option of an IPv6 SYN.
///
/// Only clean SYNs are touched; an existing MSS above the clamp is
/// rewritten in place with an incremental checksum fix, a missing option
/// is inserted after the fixed header with the conservative default.
pub fn fix_mss_ipv6(packet: &mut Packet) {
    if packet.transport_header.proto != proto::TCP {
        return;
    }
    let transport_offset = packet.transport_header.offset as usize;
    {
        let l4 = packet.transport();
        if l4.len() < tcp::MIN_LEN {
            return;
        }
        if tcp::flags(l4) & (tcp::FLAG_SYN | tcp::FLAG_RST) != tcp::FLAG_SYN {
            return;
        }
    }

    let data_offset = tcp::data_offset(packet.transport());
    if data_offset < tcp::MIN_LEN
        || transport_offset + data_offset > packet.mbuf().len()
    {
        return;
    }

    // Walk the options for an MSS to clamp.
    let mut cursor = tcp::MIN_LEN;
    while cursor + tcp::OPT_MSS_LEN <= data_offset {
        let l4 = packet.transport();
        let kind = l4[cursor];
        match kind {
            tcp::OPT_MSS => {
                let old_mss = u16::from_be_bytes([l4[cursor + 2], l4[cursor + 3]]);
                if old_mss <= FIX_MSS_SIZE {
                    return;
                }
                let l4 = packet.transport_mut();
                let mut sum = !tcp::checksum(l4);
                sum = csum_minus(sum, old_mss);
                sum = csum_plus(sum, FIX_MSS_SIZE);
                l4[cursor + 2..cursor + 4].copy_from_slice(&FIX_MSS_SIZE.to_be_bytes());
                tcp::set_checksum(l4, if sum == 0xffff { sum } else { !sum });
                return;
            }
            tcp::OPT_EOL | tcp::OPT_NOP => cursor += 1,
            _ => {
                let len = l4[cursor + 1] as usize;
                if len == 0 {
                    return;
                }
                cursor += len;
            }
        }
    }

    // No MSS option: insert one right after the fixed header.
    if data_offset > 60 - tcp::OPT_MSS_LEN {
        return;
    }
    if packet.mbuf_mut().prepend(tcp::OPT_MSS_LEN).is_none() {
        return;
    }
    let insert_at = transport_offset + tcp::MIN_LEN;
    {
        let data = packet.mbuf_mut().data_mut();
        // Everything before the insertion point slides back.
        data.copy_within(
            tcp::OPT_MSS_LEN..tcp::OPT_MSS_LEN + insert_at,
            0,
        );
        data[insert_at] = tcp::OPT_MSS;
        data[insert_at + 1] = tcp::OPT_MSS_LEN as u8;
        data[insert_at + 2..insert_at + 4].copy_from_slice(&DEFAULT_MSS_SIZE.to_be_bytes());
    }

    {
        let l4 = packet.transport_mut();
        let words = (tcp::data_offset(l4) / 4) as u8 + 1;
        tcp::set_data_offset(l4, words);
    }
    {
        let net = packet.network_mut();
        let payload = ipv6::payload_len(net) + tcp::OPT_MSS_LEN as u16;
        ipv6::set_payload_len(net, payload);
    }

    // Recompute the TCP checksum over the grown segment.
    let (src, dst, seg_len) = {
        let net = packet.network();
        (ipv6::src(net), ipv6::dst(net), ipv6::payload_len(net) as usize)
    };
    let sum = checksum::pseudo_header_v6(&src, &dst, proto::TCP, seg_len);
    let l4 = packet.transport_mut();
    tcp::set_checksum(l4, 0);
    let sum = checksum::ones_complement_sum(sum, &l4[..seg_len]);
    let folded = checksum::fold(sum);
    tcp::set_checksum(l4, folded);
}

/// Compose the outer tunnel source: the real's source bytes where its
/// mask is set, the client's original source elsewhere, over the width
/// of the real's family.
fn compose_src(real: &Real, client_src: &[u8; 16], len: usize) -> [u8; 16] {
    let mut src = [0u8; 16];
    for i in 0..len {
        src[i] = (real.src[i] & real.src_mask[i]) | (client_src[i] & !real.src_mask[i]);
    }
    src
}

/// Prepend a plain 4-byte GRE header between the outer IP header and
/// the encapsulated packet, fixing the outer lengths and checksum.
fn gre_encap(packet: &mut Packet, inner_ether_type: u16) -> Option<()> {
    let outer_v6 = packet.network_header.ether_type == ether::TYPE_IPV6;
    let outer_len = if outer_v6 { ipv6::LEN } else { ipv4::MIN_LEN };
    let before_gre = packet.network_header.offset as usize + outer_len;

    packet.mbuf_mut().prepend(gre::LEN)?;
    {
        let data = packet.mbuf_mut().data_mut();
        // L2 plus the outer IP header slide back, opening a gap for GRE
        // right behind the outer header.
        data.copy_within(gre::LEN..gre::LEN + before_gre, 0);
        gre::set_plain(&mut data[before_gre..], inner_ether_type);
    }

    let net = packet.network_mut();
    if outer_v6 {
        ipv6::set_next_header(net, proto::GRE);
        ipv6::set_payload_len(net, ipv6::payload_len(net) + gre::LEN as u16);
    } else {
        ipv4::set_protocol(net, proto::GRE);
        ipv4::set_total_length(net, ipv4::total_length(net) + gre::LEN as u16);
        ipv4::update_checksum(net);
    }
    packet.transport_header.offset += gre::LEN as u16;
    Some(())
}

/// Encapsulate `packet` toward `real` according to the service flags:
/// optional MSS clamp, IPv4 or IPv6 outer header with the masked source
/// composition, optional GRE.
pub fn tunnel_packet(vs_flags: VsFlags, real: &Real, packet: &mut Packet) -> Option<()> {
    if vs_flags.contains(VsFlags::FIX_MSS) && vs_flags.contains(VsFlags::IPV6) {
        fix_mss_ipv6(packet);
    }

    let inner_ether_type = packet.network_header.ether_type;
    let client_src = {
        let net = packet.network();
        let mut src = [0u8; 16];
        match inner_ether_type {
            ether::TYPE_IPV4 => src[..4].copy_from_slice(&ipv4::src(net)),
            ether::TYPE_IPV6 => src = ipv6::src(net),
            _ => return None,
        }
        src
    };

    if real.flags.contains(RealFlags::IPV6) {
        let src = compose_src(real, &client_src, 16);
        ip6_encap(packet, &real.dst, &src)?;
    } else {
        let src = compose_src(real, &client_src, 4);
        let mut dst = [0u8; 4];
        dst.copy_from_slice(&real.dst[..4]);
        let mut src4 = [0u8; 4];
        src4.copy_from_slice(&src[..4]);
        ip4_encap(packet, &dst, &src4)?;
    }

    if vs_flags.contains(VsFlags::GRE) {
        gre_encap(packet, inner_ether_type)?;
    }
    Some(())
}
