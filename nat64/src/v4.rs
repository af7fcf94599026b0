use log::debug;

use slipstream_dataplane::Packet;
use slipstream_dataplane::checksum;
use slipstream_dataplane::headers::{ether, ipv4, ipv6, ipv6_frag, proto, tcp, udp};

use crate::config::Nat64Config;
use crate::dataplane::Verdict;
use crate::icmp;
use crate::v6::validate_fragment_params;

/// Walk the IPv4 options of a header with IHL > 5. Source-route options
/// reject the packet; anything else is skipped. Returns false on a
/// malformed option list.
fn check_options(header: &[u8]) -> Result<(), Verdict> {
    let ihl = ipv4::ihl(header);
    let mut cursor = ipv4::MIN_LEN;
    while cursor < ihl {
        match header[cursor] {
            ipv4::OPT_EOL => break,
            ipv4::OPT_NOP => cursor += 1,
            ipv4::OPT_LSRR | ipv4::OPT_SSRR => {
                debug!("nat64: source-route option; dropping");
                return Err(Verdict::DropUnsupported);
            }
            _ => {
                if cursor + 1 >= ihl {
                    return Err(Verdict::DropMalformed);
                }
                let len = header[cursor + 1] as usize;
                if len < 2 || cursor + len > ihl {
                    return Err(Verdict::DropMalformed);
                }
                cursor += len;
            }
        }
    }
    Ok(())
}

/// Translate one IPv4 packet to IPv6 in place.
pub(crate) fn handle_v4(config: &Nat64Config, packet: &mut Packet) -> Verdict {
    let net_off = packet.network_header.offset as usize;

    let (mapping_ip6, prefix, ihl, total_len, tos, ttl, mut protocol, src4, frag_field, packet_id) = {
        let net = packet.network();
        if net.len() < ipv4::MIN_LEN {
            return Verdict::DropMalformed;
        }
        let dst = ipv4::dst(net);
        let Some(mapping) = config.find_v4(&dst) else {
            return if config.drop_unknown_mapping != 0 {
                Verdict::DropUnknownMapping
            } else {
                Verdict::Pass
            };
        };
        let Some(prefix) = config.prefix(mapping.prefix_index) else {
            return Verdict::DropMalformed;
        };
        if let Err(verdict) = check_options(net) {
            return verdict;
        }
        (
            mapping.ip6,
            prefix.prefix,
            ipv4::ihl(net),
            ipv4::total_length(net),
            ipv4::tos(net),
            ipv4::ttl(net),
            ipv4::protocol(net),
            ipv4::src(net),
            ipv4::frag_field(net),
            ipv4::packet_id(net),
        )
    };

    let frag_offset = (frag_field & ipv4::OFFSET_MASK) << 3;
    let more_fragments = frag_field & ipv4::MF_FLAG != 0;
    let is_fragmented = frag_offset != 0 || more_fragments;

    if is_fragmented {
        let frag_size = total_len - ihl as u16;
        if !validate_fragment_params(
            frag_offset,
            frag_size,
            total_len,
            more_fragments,
            protocol == proto::ICMP,
        ) {
            return Verdict::DropMalformed;
        }
    }

    // Growth of the network header: a 20-byte IPv4 header becomes 40
    // bytes of IPv6 (+8 for a Fragment extension). Options large enough
    // to make this negative are not translated.
    let grow = ipv6::LEN as isize - ihl as isize
        + if is_fragmented { ipv6_frag::LEN as isize } else { 0 };
    if grow < 0 {
        debug!("nat64: IPv4 options exceed the IPv6 header budget");
        return Verdict::DropUnsupported;
    }
    let grow = grow as usize;

    if packet.mbuf_mut().prepend(grow).is_none() {
        return Verdict::DropMalformed;
    }
    let l4_len = (total_len - ihl as u16) as usize;
    let payload_len = l4_len + if is_fragmented { ipv6_frag::LEN } else { 0 };

    {
        let data = packet.mbuf_mut().data_mut();
        // L2 slides back to the new front; the v6 header overwrites the
        // old v4 one.
        data.copy_within(grow..grow + net_off, 0);

        let hdr = &mut data[net_off..];
        hdr[..ipv6::LEN].fill(0);
        ipv6::set_vtc_flow(hdr, (6 << 28) | ((tos as u32) << 20));
        ipv6::set_payload_len(hdr, payload_len as u16);
        ipv6::set_hop_limit(hdr, ttl);
        let mut src6 = [0u8; 16];
        src6[..12].copy_from_slice(&prefix);
        src6[12..].copy_from_slice(&src4);
        ipv6::set_src(hdr, &src6);
        ipv6::set_dst(hdr, &mapping_ip6);

        if is_fragmented {
            ipv6::set_next_header(hdr, proto::FRAGMENT);
            let frag = &mut hdr[ipv6::LEN..];
            ipv6_frag::set_next_header(
                frag,
                if protocol == proto::ICMP {
                    proto::ICMPV6
                } else {
                    protocol
                },
            );
            ipv6_frag::set_offset_flags(frag, frag_offset, more_fragments);
            // The 16-bit IPv4 id zero-extends into the 32-bit field.
            ipv6_frag::set_id(frag, packet_id as u32);
        } else {
            ipv6::set_next_header(
                hdr,
                if protocol == proto::ICMP {
                    proto::ICMPV6
                } else {
                    protocol
                },
            );
        }
    }

    packet.transport_header.offset =
        (net_off + ipv6::LEN + if is_fragmented { ipv6_frag::LEN } else { 0 }) as u16;
    let transport_off = packet.transport_header.offset as usize;

    let (src6, dst6) = {
        let net = packet.network();
        (ipv6::src(net), ipv6::dst(net))
    };

    // Upper-layer fixups. Fragments are left alone: the transport
    // checksum spans the whole original datagram, which a stateless
    // translator cannot see.
    if !is_fragmented {
        match protocol {
            proto::ICMP => {
                if icmp::icmp_v4_to_v6(config, packet, &prefix, &mapping_ip6).is_none() {
                    return Verdict::DropUnsupported;
                }
                protocol = proto::ICMPV6;
            }
            proto::UDP if l4_len >= udp::LEN => {
                let sum = checksum::pseudo_header_v6(&src6, &dst6, proto::UDP, l4_len);
                let data = packet.mbuf_mut().data_mut();
                udp::set_checksum(&mut data[transport_off..], 0);
                let sum = checksum::ones_complement_sum(
                    sum,
                    &data[transport_off..transport_off + l4_len],
                );
                let folded = checksum::fold(sum);
                udp::set_checksum(
                    &mut data[transport_off..],
                    if folded == 0 { 0xffff } else { folded },
                );
            }
            proto::TCP if l4_len >= tcp::MIN_LEN => {
                let sum = checksum::pseudo_header_v6(&src6, &dst6, proto::TCP, l4_len);
                let data = packet.mbuf_mut().data_mut();
                tcp::set_checksum(&mut data[transport_off..], 0);
                let sum = checksum::ones_complement_sum(
                    sum,
                    &data[transport_off..transport_off + l4_len],
                );
                tcp::set_checksum(&mut data[transport_off..], checksum::fold(sum));
            }
            _ => {}
        }
    } else if protocol == proto::ICMP {
        protocol = proto::ICMPV6;
    }

    {
        let data = packet.mbuf_mut().data_mut();
        data[net_off - 2..net_off].copy_from_slice(&ether::TYPE_IPV6.to_be_bytes());
    }
    packet.network_header.ether_type = ether::TYPE_IPV6;
    packet.transport_header.proto = protocol;
    Verdict::Translated
}
