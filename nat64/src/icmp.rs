//! ICMP <-> ICMPv6 translation (RFC 7915 §4.2/§4.3 and §5.2/§5.3),
//! including the recursive rewrite of the packet embedded in error
//! messages.

use log::debug;

use slipstream_dataplane::Packet;
use slipstream_dataplane::checksum;
use slipstream_dataplane::headers::{icmp, icmp6, ipv4, ipv6, ipv6_ext, ipv6_frag, proto};

use crate::config::Nat64Config;

/// RFC 7915 Figure 6: IPv6 Parameter Problem pointer to its IPv4
/// equivalent; `None` drops the message.
fn pointer_v6_to_v4(ptr: u32) -> Option<u8> {
    match ptr {
        0 => Some(0),       // Version/Traffic Class -> Version/IHL
        1 => Some(1),       // Traffic Class/Flow Label -> Type Of Service
        4 | 5 => Some(2),   // Payload Length -> Total Length
        6 => Some(9),       // Next Header -> Protocol
        7 => Some(8),       // Hop Limit -> Time to Live
        8..=23 => Some(12), // Source Address
        24..=39 => Some(16), // Destination Address
        _ => None,          // Flow label bytes / extension headers: n/a
    }
}

/// RFC 7915 Figure 3: IPv4 Parameter Problem pointer to its IPv6
/// equivalent.
fn pointer_v4_to_v6(ptr: u8) -> Option<u32> {
    match ptr {
        0 | 1 => Some(ptr as u32),
        2 | 3 => Some(4),
        8 => Some(7),
        9 => Some(6),
        12..=15 => Some(8),
        16..=19 => Some(24),
        _ => None,
    }
}

/// Translate the ICMPv6 message at the transport offset to ICMPv4.
///
/// `embedded_dst4` is the IPv4 address the embedded packet's
/// destination rewrites to: the outer translated source (the mapped
/// originator of the error).
pub(crate) fn icmp_v6_to_v4(
    config: &Nat64Config,
    packet: &mut Packet,
    embedded_dst4: &[u8; 4],
) -> Option<()> {
    let t_off = packet.transport_header.offset as usize;
    if packet.mbuf().len() < t_off + icmp6::LEN {
        return None;
    }

    let (old_type, old_code, msg_mtu, msg_pointer) = {
        let l4 = packet.transport();
        (
            icmp6::icmp_type(l4),
            icmp6::code(l4),
            icmp6::mtu(l4),
            icmp6::pointer(l4),
        )
    };

    let mut next_mtu: Option<u16> = None;
    let mut new_pointer: Option<u8> = None;

    let (new_type, new_code) = match old_type {
        icmp6::ECHO_REQUEST => (icmp::ECHO, 0),
        icmp6::ECHO_REPLY => (icmp::ECHO_REPLY, 0),
        icmp6::DST_UNREACH => match old_code {
            icmp6::UNREACH_NOROUTE | icmp6::UNREACH_BEYONDSCOPE | icmp6::UNREACH_ADDR => {
                (icmp::DEST_UNREACH, icmp::HOST_UNREACH)
            }
            icmp6::UNREACH_ADMIN => (icmp::DEST_UNREACH, icmp::HOST_ANO),
            icmp6::UNREACH_NOPORT => (icmp::DEST_UNREACH, icmp::PORT_UNREACH),
            _ => return None,
        },
        icmp6::PACKET_TOO_BIG => {
            // MTU shrinks by the v6/v4 header difference, bounded by the
            // configured next-hop MTUs.
            let mut mtu = msg_mtu;
            if mtu == 0 {
                mtu = config.mtu_v4 as u32;
            }
            let delta = (ipv6::LEN - ipv4::MIN_LEN) as u32;
            let mut adjusted = mtu.saturating_sub(delta);
            if config.mtu_v6 > 0 {
                adjusted = adjusted.min((config.mtu_v6 as u32).saturating_sub(delta));
            }
            if config.mtu_v4 > 0 {
                adjusted = adjusted.min(config.mtu_v4 as u32);
            }
            next_mtu = Some(adjusted as u16);
            (icmp::DEST_UNREACH, icmp::FRAG_NEEDED)
        }
        icmp6::TIME_EXCEEDED => (icmp::TIME_EXCEEDED, old_code),
        icmp6::PARAM_PROB => match old_code {
            icmp6::PARAMPROB_HEADER => {
                new_pointer = Some(pointer_v6_to_v4(msg_pointer)?);
                (icmp::PARAM_PROB, 0)
            }
            icmp6::PARAMPROB_NEXTHEADER => (icmp::DEST_UNREACH, icmp::PROT_UNREACH),
            _ => return None,
        },
        // Single-hop and obsoleted message classes are silently dropped.
        icmp6::MLD_QUERY
        | icmp6::MLD_REPORT
        | icmp6::MLD_REDUCTION
        | icmp6::ND_ROUTER_SOLICIT
        | icmp6::ND_ROUTER_ADVERT
        | icmp6::ND_NEIGHBOR_SOLICIT
        | icmp6::ND_NEIGHBOR_ADVERT
        | icmp6::ND_REDIRECT
        | icmp6::ROUTER_RENUMBERING => return None,
        _ => {
            debug!("nat64: untranslatable ICMPv6 type {old_type}");
            return None;
        }
    };

    {
        let l4 = packet.transport_mut();
        icmp::set_type(l4, new_type);
        icmp::set_code(l4, new_code);
        if let Some(mtu) = next_mtu {
            l4[4] = 0;
            l4[5] = 0;
            icmp::set_next_mtu(l4, mtu);
        }
        if let Some(pointer) = new_pointer {
            icmp::set_pointer(l4, pointer);
        }
    }

    let is_error =
        matches!(new_type, icmp::DEST_UNREACH | icmp::TIME_EXCEEDED | icmp::PARAM_PROB);
    if is_error {
        translate_embedded_v6_to_v4(packet, t_off, embedded_dst4)?;
    }

    // ICMPv4 checksums carry no pseudo-header.
    let len = packet.mbuf().len();
    let data = packet.mbuf_mut().data_mut();
    icmp::set_checksum(&mut data[t_off..], 0);
    let sum = checksum::ones_complement_sum(0, &data[t_off..len]);
    let folded = checksum::fold(sum);
    icmp::set_checksum(&mut data[t_off..], if folded == 0 { 0xffff } else { folded });
    Some(())
}

/// Rewrite the IPv6 packet embedded behind the ICMP header at `t_off`
/// into its IPv4 form, shrinking the frame by the header difference.
fn translate_embedded_v6_to_v4(
    packet: &mut Packet,
    t_off: usize,
    embedded_dst4: &[u8; 4],
) -> Option<()> {
    let embedded_off = t_off + icmp6::LEN;
    let len = packet.mbuf().len();
    if len < embedded_off + ipv6::LEN {
        debug!("nat64: ICMP error too short for an embedded packet");
        return None;
    }

    // Walk the embedded extension chain (bounded, Hop-by-Hop first).
    let (e_proto, e_frag, ext_len) = {
        let data = packet.mbuf().data();
        let emb = &data[embedded_off..];
        let mut next = ipv6::next_header(emb);

        // Nested ICMP errors are not translated.
        if next == proto::ICMPV6 {
            if emb.len() < ipv6::LEN + 1 {
                return None;
            }
            if icmp6::is_error(emb[ipv6::LEN]) {
                debug!("nat64: nested ICMP error");
                return None;
            }
        }

        let mut cursor = ipv6::LEN;
        let mut count = 0usize;
        while matches!(next, proto::HOPOPTS | proto::ROUTING | proto::DSTOPTS) {
            count += 1;
            if count > 4 || (count > 1 && next == proto::HOPOPTS) {
                return None;
            }
            if emb.len() < cursor + 8 {
                return None;
            }
            let ext = &emb[cursor..];
            next = ipv6_ext::next_header(ext);
            cursor += ipv6_ext::options_len(ext);
            if cursor >= emb.len() {
                return None;
            }
        }
        let mut frag = None;
        if next == proto::FRAGMENT {
            if emb.len() < cursor + ipv6_frag::LEN {
                return None;
            }
            let ext = &emb[cursor..];
            frag = Some((
                ipv6_frag::offset(ext),
                ipv6_frag::more_fragments(ext),
                ipv6_frag::id(ext),
            ));
            next = ipv6_frag::next_header(ext);
            cursor += ipv6_frag::LEN;
        }
        (next, frag, cursor)
    };

    let delta = ext_len - ipv4::MIN_LEN;

    // Collect embedded header fields before they are overwritten.
    let (tos, payload_len, ttl, src4) = {
        let data = packet.mbuf().data();
        let emb = &data[embedded_off..];
        let src = ipv6::src(emb);
        let mut src4 = [0u8; 4];
        src4.copy_from_slice(&src[12..16]);
        (
            ipv6::traffic_class(emb),
            ipv6::payload_len(emb),
            ipv6::hop_limit(emb),
            src4,
        )
    };
    let l4_len = (payload_len as usize).saturating_sub(ext_len - ipv6::LEN);
    let first_fragment = e_frag.map(|(offset, _, _)| offset == 0).unwrap_or(true);
    let mut protocol = e_proto;
    if protocol == proto::ICMPV6 {
        protocol = proto::ICMP;
    }

    // Build the IPv4 header over the tail of the embedded IPv6 area.
    {
        let data = packet.mbuf_mut().data_mut();
        let hdr = &mut data[embedded_off + delta..];
        hdr[..ipv4::MIN_LEN].fill(0);
        ipv4::set_version_ihl(hdr, 5);
        ipv4::set_tos(hdr, tos);
        ipv4::set_total_length(hdr, (ipv4::MIN_LEN + l4_len) as u16);
        if let Some((offset, more, id)) = e_frag {
            ipv4::set_packet_id(hdr, id as u16);
            ipv4::set_frag_field(hdr, (offset >> 3) | if more { ipv4::MF_FLAG } else { 0 });
        }
        ipv4::set_ttl(hdr, ttl);
        ipv4::set_protocol(hdr, protocol);
        ipv4::set_src(hdr, &src4);
        ipv4::set_dst(hdr, embedded_dst4);
    }

    // Translate the embedded transport header of a first fragment.
    if first_fragment {
        let l4_off = embedded_off + delta + ipv4::MIN_LEN;
        let avail = len.saturating_sub(l4_off).min(l4_len);
        match e_proto {
            proto::ICMPV6 if avail >= icmp6::LEN => {
                let data = packet.mbuf_mut().data_mut();
                let emb_icmp = &mut data[l4_off..];
                match icmp6::icmp_type(emb_icmp) {
                    icmp6::ECHO_REQUEST => icmp::set_type(emb_icmp, icmp::ECHO),
                    icmp6::ECHO_REPLY => icmp::set_type(emb_icmp, icmp::ECHO_REPLY),
                    _ => return None,
                }
                icmp::set_code(emb_icmp, 0);
                icmp::set_checksum(emb_icmp, 0);
                let sum = checksum::ones_complement_sum(0, &data[l4_off..l4_off + avail]);
                let folded = checksum::fold(sum);
                icmp::set_checksum(
                    &mut data[l4_off..],
                    if folded == 0 { 0xffff } else { folded },
                );
            }
            proto::UDP if avail >= 8 => {
                embedded_l4_checksum_v4(packet, embedded_off + delta, l4_off, avail, proto::UDP);
            }
            proto::TCP if avail >= 20 => {
                embedded_l4_checksum_v4(packet, embedded_off + delta, l4_off, avail, proto::TCP);
            }
            _ => {}
        }
    }

    {
        let data = packet.mbuf_mut().data_mut();
        ipv4::update_checksum(&mut data[embedded_off + delta..]);
        // Close the gap left by the vanished v6 header bytes.
        data.copy_within(embedded_off + delta..len, embedded_off);
    }
    packet.mbuf_mut().trim(delta)?;

    // The outer header claims the shorter payload now.
    let net = packet.network_mut();
    let outer_payload = ipv6::payload_len(net) - delta as u16;
    ipv6::set_payload_len(net, outer_payload);
    Some(())
}

/// Recompute a UDP/TCP checksum of an embedded packet against its new
/// IPv4 pseudo-header. `avail` caps the summed bytes for truncated
/// error payloads.
fn embedded_l4_checksum_v4(
    packet: &mut Packet,
    ip_off: usize,
    l4_off: usize,
    avail: usize,
    protocol: u8,
) {
    let (src, dst, l4_len) = {
        let data = packet.mbuf().data();
        let hdr = &data[ip_off..];
        (
            ipv4::src(hdr),
            ipv4::dst(hdr),
            ipv4::total_length(hdr) as usize - ipv4::MIN_LEN,
        )
    };
    let sum = checksum::pseudo_header_v4(&src, &dst, protocol, l4_len);
    let data = packet.mbuf_mut().data_mut();
    match protocol {
        proto::UDP => slipstream_dataplane::headers::udp::set_checksum(&mut data[l4_off..], 0),
        _ => slipstream_dataplane::headers::tcp::set_checksum(&mut data[l4_off..], 0),
    }
    let sum = checksum::ones_complement_sum(sum, &data[l4_off..l4_off + avail]);
    let folded = checksum::fold(sum);
    match protocol {
        proto::UDP => slipstream_dataplane::headers::udp::set_checksum(
            &mut data[l4_off..],
            if folded == 0 { 0xffff } else { folded },
        ),
        _ => slipstream_dataplane::headers::tcp::set_checksum(&mut data[l4_off..], folded),
    }
}

/// Translate the ICMPv4 message at the transport offset to ICMPv6.
/// The outer IPv6 header has already been written; its payload length
/// is adjusted when the embedded packet grows.
pub(crate) fn icmp_v4_to_v6(
    config: &Nat64Config,
    packet: &mut Packet,
    prefix: &[u8; 12],
    mapping_ip6: &[u8; 16],
) -> Option<()> {
    let t_off = packet.transport_header.offset as usize;
    if packet.mbuf().len() < t_off + icmp::LEN {
        return None;
    }

    let (old_type, old_code, msg_mtu, msg_pointer) = {
        let l4 = packet.transport();
        (
            icmp::icmp_type(l4),
            icmp::code(l4),
            icmp::next_mtu(l4),
            icmp::pointer(l4),
        )
    };

    let mut new_mtu: Option<u32> = None;
    let mut new_pointer: Option<u32> = None;

    let (new_type, new_code) = match old_type {
        icmp::ECHO => (icmp6::ECHO_REQUEST, 0),
        icmp::ECHO_REPLY => (icmp6::ECHO_REPLY, 0),
        icmp::DEST_UNREACH => match old_code {
            icmp::NET_UNREACH
            | icmp::HOST_UNREACH
            | icmp::SR_FAILED
            | icmp::NET_UNKNOWN
            | icmp::HOST_UNKNOWN
            | icmp::HOST_ISOLATED
            | icmp::NET_UNR_TOS
            | icmp::HOST_UNR_TOS => (icmp6::DST_UNREACH, icmp6::UNREACH_NOROUTE),
            icmp::NET_ANO | icmp::HOST_ANO | icmp::PKT_FILTERED | icmp::PREC_CUTOFF => {
                (icmp6::DST_UNREACH, icmp6::UNREACH_ADMIN)
            }
            icmp::PROT_UNREACH => {
                // Protocol Unreachable becomes a Parameter Problem
                // pointing at the Next Header field.
                new_pointer = Some(6);
                (icmp6::PARAM_PROB, icmp6::PARAMPROB_NEXTHEADER)
            }
            icmp::PORT_UNREACH => (icmp6::DST_UNREACH, icmp6::UNREACH_NOPORT),
            icmp::FRAG_NEEDED => {
                // maximum(1280, minimum(mtu+20, v6 next hop, v4 next hop + 20))
                let mut mtu = msg_mtu as u32;
                if mtu == 0 {
                    mtu = config.mtu_v4 as u32;
                }
                mtu += 20;
                if config.mtu_v6 > 0 {
                    mtu = mtu.min(config.mtu_v6 as u32);
                }
                if config.mtu_v4 > 0 {
                    mtu = mtu.min(config.mtu_v4 as u32 + 20);
                }
                new_mtu = Some(mtu.max(1280));
                (icmp6::PACKET_TOO_BIG, 0)
            }
            _ => return None,
        },
        icmp::TIME_EXCEEDED => (icmp6::TIME_EXCEEDED, old_code),
        icmp::PARAM_PROB => {
            if old_code != 0 && old_code != 2 {
                return None;
            }
            new_pointer = Some(pointer_v4_to_v6(msg_pointer)?);
            (icmp6::PARAM_PROB, icmp6::PARAMPROB_HEADER)
        }
        _ => {
            debug!("nat64: untranslatable ICMPv4 type {old_type}");
            return None;
        }
    };

    {
        let l4 = packet.transport_mut();
        icmp6::set_type(l4, new_type);
        icmp6::set_code(l4, new_code);
        if let Some(mtu) = new_mtu {
            icmp6::set_mtu(l4, mtu);
        }
        if let Some(pointer) = new_pointer {
            icmp6::set_pointer(l4, pointer);
        }
    }

    if icmp6::is_error(new_type) {
        translate_embedded_v4_to_v6(config, packet, t_off, prefix, mapping_ip6)?;
    }

    // ICMPv6 checksums include the outer pseudo-header.
    let (src, dst, payload_len) = {
        let net = packet.network();
        (ipv6::src(net), ipv6::dst(net), ipv6::payload_len(net) as usize)
    };
    let msg_len = payload_len - (t_off - packet.network_header.offset as usize - ipv6::LEN);
    let sum = checksum::pseudo_header_v6(&src, &dst, proto::ICMPV6, msg_len);
    let data = packet.mbuf_mut().data_mut();
    icmp6::set_checksum(&mut data[t_off..], 0);
    let avail = data.len().min(t_off + msg_len);
    let sum = checksum::ones_complement_sum(sum, &data[t_off..avail]);
    icmp6::set_checksum(&mut data[t_off..], checksum::fold(sum));
    Some(())
}

/// Rewrite the IPv4 packet embedded behind the ICMP header at `t_off`
/// into its IPv6 form, growing the frame by the header difference
/// (clamped so the result stays within the v6 next-hop MTU).
fn translate_embedded_v4_to_v6(
    config: &Nat64Config,
    packet: &mut Packet,
    t_off: usize,
    prefix: &[u8; 12],
    mapping_ip6: &[u8; 16],
) -> Option<()> {
    let embedded_off = t_off + icmp::LEN;
    let len = packet.mbuf().len();
    if len < embedded_off + ipv4::MIN_LEN {
        return None;
    }

    // Embedded header fields, read before anything moves.
    let (e_ihl, e_total, e_tos, e_id, e_frag_field, e_ttl, e_proto, e_dst4) = {
        let data = packet.mbuf().data();
        let emb = &data[embedded_off..];
        (
            ipv4::ihl(emb),
            ipv4::total_length(emb),
            ipv4::tos(emb),
            ipv4::packet_id(emb),
            ipv4::frag_field(emb),
            ipv4::ttl(emb),
            ipv4::protocol(emb),
            ipv4::dst(emb),
        )
    };

    let frag_offset = (e_frag_field & ipv4::OFFSET_MASK) << 3;
    let more = e_frag_field & ipv4::MF_FLAG != 0;
    let is_fragmented = frag_offset != 0 || more;
    let first_fragment = frag_offset == 0;

    let grow = ipv6::LEN as isize - e_ihl as isize
        + if is_fragmented { ipv6_frag::LEN as isize } else { 0 };
    if grow < 0 {
        debug!("nat64: embedded IPv4 options exceed the IPv6 header budget");
        return None;
    }
    let grow = grow as usize;

    // Clamp the grown frame to the v6 next-hop MTU: an ICMP error is
    // allowed to truncate its payload.
    let outer_payload = ipv6::payload_len(packet.network()) as usize;
    let mut new_outer_payload = outer_payload + grow;
    let mut overflow = 0usize;
    if config.mtu_v6 > 0 {
        let total = ipv6::LEN + new_outer_payload;
        if total > config.mtu_v6 as usize {
            overflow = total - config.mtu_v6 as usize;
            new_outer_payload -= overflow;
        }
    }
    let buff_delta = grow as isize - overflow as isize;
    if buff_delta > 0 {
        packet.mbuf_mut().append(buff_delta as usize)?;
    } else if buff_delta < 0 {
        packet.mbuf_mut().trim((-buff_delta) as usize)?;
    }
    let new_len = packet.mbuf().len();

    {
        let data = packet.mbuf_mut().data_mut();
        // The embedded packet slides forward to make room for the wider
        // v6 header; the tail beyond the MTU clamp is gone.
        let copy_len = new_len - (embedded_off + grow);
        data.copy_within(embedded_off..embedded_off + copy_len, embedded_off + grow);

        let hdr = &mut data[embedded_off..];
        hdr[..ipv6::LEN].fill(0);
        ipv6::set_vtc_flow(hdr, (6 << 28) | ((e_tos as u32) << 20));
        ipv6::set_payload_len(
            hdr,
            e_total - e_ihl as u16 + if is_fragmented { ipv6_frag::LEN as u16 } else { 0 },
        );
        ipv6::set_hop_limit(hdr, e_ttl);
        let next = if e_proto == proto::ICMP {
            proto::ICMPV6
        } else {
            e_proto
        };
        if is_fragmented {
            ipv6::set_next_header(hdr, proto::FRAGMENT);
            let frag = &mut hdr[ipv6::LEN..];
            ipv6_frag::set_next_header(frag, next);
            ipv6_frag::set_offset_flags(frag, frag_offset, more);
            ipv6_frag::set_id(frag, e_id as u32);
        } else {
            ipv6::set_next_header(hdr, next);
        }
        // The embedded original ran from the mapped host toward the v4
        // network: source is the mapping, destination embeds under the
        // prefix.
        ipv6::set_src(hdr, mapping_ip6);
        let mut dst6 = [0u8; 16];
        dst6[..12].copy_from_slice(prefix);
        dst6[12..].copy_from_slice(&e_dst4);
        ipv6::set_dst(hdr, &dst6);
    }

    // Embedded transport fixups for first fragments.
    if first_fragment {
        let l4_off =
            embedded_off + ipv6::LEN + if is_fragmented { ipv6_frag::LEN } else { 0 };
        let stated = (e_total - e_ihl as u16) as usize;
        let avail = new_len.saturating_sub(l4_off).min(stated);
        let (e_src6, e_dst6) = {
            let data = packet.mbuf().data();
            let emb = &data[embedded_off..];
            (ipv6::src(emb), ipv6::dst(emb))
        };
        match e_proto {
            proto::ICMP if avail >= icmp::LEN => {
                let data = packet.mbuf_mut().data_mut();
                match icmp::icmp_type(&data[l4_off..]) {
                    icmp::ECHO => icmp6::set_type(&mut data[l4_off..], icmp6::ECHO_REQUEST),
                    icmp::ECHO_REPLY => icmp6::set_type(&mut data[l4_off..], icmp6::ECHO_REPLY),
                    _ => return None,
                }
                icmp6::set_code(&mut data[l4_off..], 0);
                icmp6::set_checksum(&mut data[l4_off..], 0);
                let sum =
                    checksum::pseudo_header_v6(&e_src6, &e_dst6, proto::ICMPV6, stated);
                let sum = checksum::ones_complement_sum(sum, &data[l4_off..l4_off + avail]);
                icmp6::set_checksum(&mut data[l4_off..], checksum::fold(sum));
            }
            proto::UDP if avail >= 8 => {
                let sum = checksum::pseudo_header_v6(&e_src6, &e_dst6, proto::UDP, stated);
                let data = packet.mbuf_mut().data_mut();
                slipstream_dataplane::headers::udp::set_checksum(&mut data[l4_off..], 0);
                let sum = checksum::ones_complement_sum(sum, &data[l4_off..l4_off + avail]);
                let folded = checksum::fold(sum);
                slipstream_dataplane::headers::udp::set_checksum(
                    &mut data[l4_off..],
                    if folded == 0 { 0xffff } else { folded },
                );
            }
            proto::TCP if avail >= 20 => {
                let sum = checksum::pseudo_header_v6(&e_src6, &e_dst6, proto::TCP, stated);
                let data = packet.mbuf_mut().data_mut();
                slipstream_dataplane::headers::tcp::set_checksum(&mut data[l4_off..], 0);
                let sum = checksum::ones_complement_sum(sum, &data[l4_off..l4_off + avail]);
                slipstream_dataplane::headers::tcp::set_checksum(
                    &mut data[l4_off..],
                    checksum::fold(sum),
                );
            }
            _ => {}
        }
    }

    // The outer header claims the grown (possibly clamped) payload.
    let net = packet.network_mut();
    ipv6::set_payload_len(net, new_outer_payload as u16);
    Some(())
}
