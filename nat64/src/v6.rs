use log::debug;

use slipstream_dataplane::Packet;
use slipstream_dataplane::checksum;
use slipstream_dataplane::headers::{ether, ipv4, ipv6, ipv6_ext, ipv6_frag, proto, tcp, udp};

use crate::config::Nat64Config;
use crate::dataplane::Verdict;
use crate::icmp;

/// Extension-header budget (RFC 8200 discipline as enforced here).
const MAX_EXT_HEADERS: usize = 8;
const MAX_DSTOPTS: usize = 2;

const SEEN_HOPOPTS: u8 = 0x01;
const SEEN_ROUTING: u8 = 0x02;
const SEEN_FRAGMENT: u8 = 0x04;

pub(crate) struct ExtWalk {
    pub next_header: u8,
    pub is_fragmented: bool,
    /// Fragment offset in bytes.
    pub frag_offset: u16,
    pub frag_more: bool,
    pub frag_id: u32,
    /// Total bytes of extension headers walked.
    pub ext_len: usize,
}

/// Walk the extension chain of the IPv6 header at `net` (which spans
/// through the end of the frame).
///
/// Enforced discipline: at most eight headers, Hop-by-Hop only in first
/// position, at most two Destination Options, no duplicates, Type 0
/// routing headers, AH and ESP rejected outright, every header bounded
/// by the frame.
pub(crate) fn process_extension_headers(net: &[u8]) -> Option<ExtWalk> {
    let mut walk = ExtWalk {
        next_header: ipv6::next_header(net),
        is_fragmented: false,
        frag_offset: 0,
        frag_more: false,
        frag_id: 0,
        ext_len: 0,
    };

    let mut cursor = ipv6::LEN;
    let mut seen = 0u8;
    let mut dstopts = 0usize;
    let mut count = 0usize;

    loop {
        match walk.next_header {
            proto::HOPOPTS | proto::ROUTING | proto::DSTOPTS | proto::FRAGMENT => {}
            proto::AH | proto::ESP => {
                debug!("nat64: IPsec extension header; not translated");
                return None;
            }
            _ => break,
        }
        count += 1;
        if count > MAX_EXT_HEADERS {
            debug!("nat64: too many extension headers");
            return None;
        }
        if net.len() < cursor + 8 {
            return None;
        }
        let ext = &net[cursor..];

        match walk.next_header {
            proto::HOPOPTS => {
                if count > 1 || seen & SEEN_HOPOPTS != 0 {
                    debug!("nat64: misplaced or duplicate hop-by-hop header");
                    return None;
                }
                seen |= SEEN_HOPOPTS;
                let len = ipv6_ext::options_len(ext);
                if net.len() < cursor + len {
                    return None;
                }
                walk.next_header = ipv6_ext::next_header(ext);
                cursor += len;
                walk.ext_len += len;
            }
            proto::DSTOPTS => {
                if dstopts == MAX_DSTOPTS {
                    debug!("nat64: too many destination-options headers");
                    return None;
                }
                dstopts += 1;
                let len = ipv6_ext::options_len(ext);
                if net.len() < cursor + len {
                    return None;
                }
                walk.next_header = ipv6_ext::next_header(ext);
                cursor += len;
                walk.ext_len += len;
            }
            proto::ROUTING => {
                if seen & SEEN_ROUTING != 0 {
                    return None;
                }
                seen |= SEEN_ROUTING;
                if ipv6_ext::routing_type(ext) == 0 {
                    debug!("nat64: type 0 routing header");
                    return None;
                }
                let len = ipv6_ext::options_len(ext);
                if net.len() < cursor + len {
                    return None;
                }
                walk.next_header = ipv6_ext::next_header(ext);
                cursor += len;
                walk.ext_len += len;
            }
            proto::FRAGMENT => {
                if seen & SEEN_FRAGMENT != 0 {
                    return None;
                }
                seen |= SEEN_FRAGMENT;
                walk.is_fragmented = true;
                walk.next_header = ipv6_frag::next_header(ext);
                walk.frag_offset = ipv6_frag::offset(ext);
                walk.frag_more = ipv6_frag::more_fragments(ext);
                walk.frag_id = ipv6_frag::id(ext);
                if walk.next_header == proto::ICMPV6 {
                    debug!("nat64: fragmented ICMPv6");
                    return None;
                }
                cursor += ipv6_frag::LEN;
                walk.ext_len += ipv6_frag::LEN;
            }
            _ => unreachable!(),
        }
    }

    if cursor > net.len() {
        return None;
    }
    Some(walk)
}

/// Fragment sanity per RFC 7915 §1.2: no fragmented ICMP, 8-byte
/// aligned offsets, 8-byte-multiple non-last fragments, minimum size,
/// no overrun of the stated total.
pub(crate) fn validate_fragment_params(
    frag_offset: u16,
    frag_size: u16,
    total_len: u16,
    more_fragments: bool,
    is_icmp: bool,
) -> bool {
    if is_icmp {
        return false;
    }
    if frag_offset % 8 != 0 {
        return false;
    }
    if more_fragments && frag_size % 8 != 0 {
        return false;
    }
    if frag_size < 8 {
        return false;
    }
    frag_offset as u32 + frag_size as u32 <= total_len as u32
}

/// Translate one IPv6 packet to IPv4 in place.
pub(crate) fn handle_v6(config: &Nat64Config, packet: &mut Packet) -> Verdict {
    let net_off = packet.network_header.offset as usize;

    let (src4, dst4, payload_len, traffic_class, hop_limit) = {
        let net = packet.network();
        if net.len() < ipv6::LEN {
            return Verdict::DropMalformed;
        }
        let src = ipv6::src(net);
        let dst = ipv6::dst(net);

        if config.find_prefix(&dst).is_none() {
            return if config.drop_unknown_prefix != 0 {
                Verdict::DropUnknownPrefix
            } else {
                Verdict::Pass
            };
        }
        let Some(mapping) = config.find_v6(&src) else {
            return if config.drop_unknown_mapping != 0 {
                Verdict::DropUnknownMapping
            } else {
                Verdict::Pass
            };
        };
        let mut dst4 = [0u8; 4];
        dst4.copy_from_slice(&dst[12..16]);
        (
            mapping.ip4,
            dst4,
            ipv6::payload_len(net),
            ipv6::traffic_class(net),
            ipv6::hop_limit(net),
        )
    };

    let Some(walk) = process_extension_headers(packet.network()) else {
        return Verdict::DropMalformed;
    };
    if walk.is_fragmented {
        let frag_size = payload_len.saturating_sub(walk.ext_len as u16);
        if !validate_fragment_params(
            walk.frag_offset,
            frag_size,
            payload_len,
            walk.frag_more,
            walk.next_header == proto::ICMPV6,
        ) {
            return Verdict::DropMalformed;
        }
    }

    packet.transport_header.offset = (net_off + ipv6::LEN + walk.ext_len) as u16;
    packet.transport_header.proto = walk.next_header;
    let delta = ipv6::LEN + walk.ext_len - ipv4::MIN_LEN;

    // Upper-layer translation happens while the frame still has its v6
    // shape; an embedded-packet rewrite may shrink the tail.
    let mut protocol = walk.next_header;
    match walk.next_header {
        proto::ICMPV6 => {
            if icmp::icmp_v6_to_v4(config, packet, &src4).is_none() {
                return Verdict::DropUnsupported;
            }
            protocol = proto::ICMP;
        }
        proto::TCP | proto::UDP => {}
        _ => {}
    }

    // Assemble the IPv4 header over the tail of the IPv6 header area.
    let transport_off = packet.transport_header.offset as usize;
    let l4_len = packet.mbuf().len() - transport_off;
    {
        let data = packet.mbuf_mut().data_mut();
        let hdr = &mut data[net_off + delta..];
        hdr[..ipv4::MIN_LEN].fill(0);
        ipv4::set_version_ihl(hdr, 5);
        ipv4::set_tos(hdr, traffic_class);
        ipv4::set_total_length(hdr, (ipv4::MIN_LEN + l4_len) as u16);
        if walk.is_fragmented {
            ipv4::set_packet_id(hdr, walk.frag_id as u16);
            ipv4::set_frag_field(
                hdr,
                (walk.frag_offset >> 3) | if walk.frag_more { ipv4::MF_FLAG } else { 0 },
            );
        }
        ipv4::set_ttl(hdr, hop_limit);
        ipv4::set_protocol(hdr, protocol);
        ipv4::set_src(hdr, &src4);
        ipv4::set_dst(hdr, &dst4);
    }

    // Transport checksums against the new IPv4 pseudo-header. Fragments
    // are left alone: the transport checksum spans the whole original
    // datagram, which a stateless translator cannot see.
    if !walk.is_fragmented {
        match protocol {
            proto::UDP if l4_len >= udp::LEN => {
                let sum = checksum::pseudo_header_v4(&src4, &dst4, proto::UDP, l4_len);
                let data = packet.mbuf_mut().data_mut();
                udp::set_checksum(&mut data[transport_off..], 0);
                let sum =
                    checksum::ones_complement_sum(sum, &data[transport_off..transport_off + l4_len]);
                let folded = checksum::fold(sum);
                udp::set_checksum(
                    &mut data[transport_off..],
                    if folded == 0 { 0xffff } else { folded },
                );
            }
            proto::TCP if l4_len >= tcp::MIN_LEN => {
                let sum = checksum::pseudo_header_v4(&src4, &dst4, proto::TCP, l4_len);
                let data = packet.mbuf_mut().data_mut();
                tcp::set_checksum(&mut data[transport_off..], 0);
                let sum =
                    checksum::ones_complement_sum(sum, &data[transport_off..transport_off + l4_len]);
                tcp::set_checksum(&mut data[transport_off..], checksum::fold(sum));
            }
            _ => {}
        }
    }

    {
        let data = packet.mbuf_mut().data_mut();
        ipv4::update_checksum(&mut data[net_off + delta..]);
        // L2 slides forward over the vanished v6 bytes.
        data.copy_within(0..net_off, delta);
    }
    if packet.mbuf_mut().adj(delta).is_none() {
        return Verdict::DropMalformed;
    }
    {
        let data = packet.mbuf_mut().data_mut();
        data[net_off - 2..net_off].copy_from_slice(&ether::TYPE_IPV4.to_be_bytes());
    }

    packet.network_header.ether_type = ether::TYPE_IPV4;
    packet.transport_header.offset = (net_off + ipv4::MIN_LEN) as u16;
    packet.transport_header.proto = protocol;
    Verdict::Translated
}
