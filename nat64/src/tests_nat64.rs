use slipstream_controlplane::dp::DpConfig;
use slipstream_controlplane::{Agent, ModuleData};
use slipstream_dataplane::PacketFront;
use slipstream_dataplane::checksum;
use slipstream_dataplane::headers::{ether, icmp, icmp6, ipv4, ipv6, ipv6_frag, proto, udp};
use slipstream_dataplane::testutil::{
    ether_frame, ipv6_header, l4_checksum_ok, parsed, tcp_segment, udp_segment, v4_frame,
    v6_frame,
};

use crate::config::{
    nat64_config_add_mapping, nat64_config_add_prefix, nat64_config_create,
    nat64_config_free, nat64_config_set_drop_unknown, stats,
};
use crate::dataplane::{Verdict, handle_packets, translate_packet};
use crate::{Nat64Config, v6};

const HOST4: [u8; 4] = [192, 0, 2, 34];
const CLIENT4: [u8; 4] = [198, 51, 100, 1];
const PREFIX: [u8; 12] = [0x20, 0x01, 0x0d, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0];

fn client6() -> [u8; 16] {
    let mut addr = [0u8; 16];
    addr[..12].copy_from_slice(&PREFIX);
    addr[15] = 4;
    addr
}

fn embed(ip4: &[u8; 4]) -> [u8; 16] {
    let mut addr = [0u8; 16];
    addr[..12].copy_from_slice(&PREFIX);
    addr[12..].copy_from_slice(ip4);
    addr
}

struct Harness {
    _region: Vec<u8>,
    _dp: *mut DpConfig,
    agent: *mut Agent,
    data: *mut ModuleData,
    config: *mut Nat64Config,
}

fn harness() -> Harness {
    let mut region = vec![0u8; 32 << 20];
    let dp = unsafe {
        DpConfig::init(region.as_mut_ptr(), region.len(), 0, 1, 0, &["nat64"]).unwrap()
    };
    let agent = unsafe { Agent::attach(dp, "nat64-test", (8 << 20) - 4096).unwrap() };
    let data = unsafe { nat64_config_create(agent, 0, "nat0", 1, 1450, 1500).unwrap() };
    unsafe {
        let prefix_idx = nat64_config_add_prefix(data, PREFIX).unwrap();
        nat64_config_add_mapping(data, CLIENT4, client6(), prefix_idx).unwrap();
        nat64_config_set_drop_unknown(data, true, true);
    }
    Harness {
        _region: region,
        _dp: dp,
        agent,
        data,
        config: unsafe { Nat64Config::from_module_data(data) },
    }
}

fn config<'a>(h: &Harness) -> &'a Nat64Config {
    unsafe { &*h.config }
}

/// UDP v4 -> v6: addresses map, the payload is preserved and the UDP
/// checksum re-validates under the IPv6 pseudo-header.
#[test]
fn udp_v4_to_v6_translation() {
    let h = harness();
    let frame = v4_frame(&HOST4, &CLIENT4, proto::UDP, udp_segment(12345, 53, b"0123456789"));
    let mut packet = parsed(&frame);

    assert_eq!(translate_packet(config(&h), &mut packet), Verdict::Translated);

    assert_eq!(packet.network_header.ether_type, ether::TYPE_IPV6);
    let net = packet.network();
    assert_eq!(ipv6::src(net), embed(&HOST4));
    assert_eq!(ipv6::dst(net), client6());
    assert_eq!(ipv6::next_header(net), proto::UDP);
    assert_eq!(ipv6::payload_len(net), 8 + 10);
    assert_eq!(ipv6::hop_limit(net), 64);

    let l4 = packet.transport();
    assert_eq!(udp::src_port(l4), 12345);
    assert_eq!(udp::dst_port(l4), 53);
    assert_eq!(&l4[8..18], b"0123456789");
    assert!(l4_checksum_ok(&packet));
}

/// UDP v6 -> v4: the mapped source collapses to its IPv4 address and
/// the destination pops out of the prefix.
#[test]
fn udp_v6_to_v4_translation() {
    let h = harness();
    let frame = v6_frame(
        &client6(),
        &embed(&HOST4),
        proto::UDP,
        udp_segment(53, 12345, b"reply"),
    );
    let mut packet = parsed(&frame);

    assert_eq!(translate_packet(config(&h), &mut packet), Verdict::Translated);

    assert_eq!(packet.network_header.ether_type, ether::TYPE_IPV4);
    let net = packet.network();
    assert_eq!(ipv4::src(net), CLIENT4);
    assert_eq!(ipv4::dst(net), HOST4);
    assert_eq!(ipv4::protocol(net), proto::UDP);
    assert_eq!(checksum::ipv4_header(&net[..20]), ipv4::checksum(net));
    assert!(l4_checksum_ok(&packet));
}

/// Translating v4 -> v6 -> v4 with symmetric (prefix-embedded) mappings
/// reproduces the original frame bit for bit.
#[test]
fn round_trip_reproduces_original() {
    let h = harness();
    unsafe {
        // A second, symmetric mapping so the reverse direction resolves.
        nat64_config_add_mapping(h.data, HOST4, embed(&HOST4), 0).unwrap();
        // The client mapping must embed under the prefix for byte
        // equality of the destination.
        nat64_config_add_mapping(h.data, CLIENT4, embed(&CLIENT4), 0).unwrap();
    }

    let cases = [
        (proto::UDP, udp_segment(12345, 53, b"payload")),
        (proto::TCP, tcp_segment(12345, 53, 0x18, b"data")),
    ];
    for (protocol, segment) in cases {
        let frame = v4_frame(&HOST4, &CLIENT4, protocol, segment);
        let mut packet = parsed(&frame);
        let original = packet.mbuf().data().to_vec();

        assert_eq!(translate_packet(config(&h), &mut packet), Verdict::Translated);
        assert_eq!(translate_packet(config(&h), &mut packet), Verdict::Translated);

        assert_eq!(packet.mbuf().data(), &original[..]);
        assert!(l4_checksum_ok(&packet));
    }
}

/// Unknown destinations pass through or drop according to the policy.
#[test]
fn unknown_mapping_policy() {
    let h = harness();
    let frame = v4_frame(&HOST4, &[203, 0, 113, 9], proto::UDP, udp_segment(1, 2, b"x"));

    let mut packet = parsed(&frame);
    assert_eq!(
        translate_packet(config(&h), &mut packet),
        Verdict::DropUnknownMapping
    );

    unsafe { nat64_config_set_drop_unknown(h.data, false, false) };
    let mut packet = parsed(&frame);
    assert_eq!(translate_packet(config(&h), &mut packet), Verdict::Pass);
    // Pass-through leaves the frame untouched.
    assert_eq!(packet.network_header.ether_type, ether::TYPE_IPV4);
}

/// v6 destinations outside every configured prefix follow the prefix
/// policy.
#[test]
fn unknown_prefix_policy() {
    let h = harness();
    let mut outside = [0u8; 16];
    outside[0] = 0x20;
    outside[1] = 0x02;
    let frame = v6_frame(&client6(), &outside, proto::UDP, udp_segment(1, 2, b"x"));

    let mut packet = parsed(&frame);
    assert_eq!(
        translate_packet(config(&h), &mut packet),
        Verdict::DropUnknownPrefix
    );
}

/// An IPv4 fragment gains a Fragment extension header with the id
/// zero-extended and offset/MF carried over.
#[test]
fn v4_fragment_becomes_extension_header() {
    let h = harness();
    // First fragment: offset 0, MF set, id 0x7777.
    let mut payload = build_v4_udp_fragment(0, true, 0x7777);
    let mut packet = parsed(&payload);
    assert_eq!(translate_packet(config(&h), &mut packet), Verdict::Translated);

    let net = packet.network();
    assert_eq!(ipv6::next_header(net), proto::FRAGMENT);
    let frag = &net[ipv6::LEN..];
    assert_eq!(ipv6_frag::next_header(frag), proto::UDP);
    assert_eq!(ipv6_frag::offset(frag), 0);
    assert!(ipv6_frag::more_fragments(frag));
    assert_eq!(ipv6_frag::id(frag), 0x7777);

    // Non-first fragment: offset 64 bytes, no transport header fixups.
    payload = build_v4_udp_fragment(64, false, 0x7777);
    let mut packet = parsed(&payload);
    assert_eq!(translate_packet(config(&h), &mut packet), Verdict::Translated);
    let net = packet.network();
    let frag = &net[ipv6::LEN..];
    assert_eq!(ipv6_frag::offset(frag), 64);
    assert!(!ipv6_frag::more_fragments(frag));
}

fn build_v4_udp_fragment(offset: u16, more: bool, id: u16) -> Vec<u8> {
    let body: Vec<u8> = if offset == 0 {
        udp_segment(9, 10, &[0xaa; 8])
    } else {
        vec![0xbb; 16]
    };
    let mut hdr = slipstream_dataplane::testutil::ipv4_header(&HOST4, &CLIENT4, proto::UDP, body.len());
    ipv4::set_packet_id(&mut hdr, id);
    ipv4::set_frag_field(
        &mut hdr,
        (offset >> 3) | if more { ipv4::MF_FLAG } else { 0 },
    );
    ipv4::update_checksum(&mut hdr);
    hdr.extend_from_slice(&body);
    ether_frame(ether::TYPE_IPV4, &hdr)
}

/// Fragmented ICMP is never translated.
#[test]
fn fragmented_icmp_is_rejected() {
    let h = harness();
    let body = vec![0u8; 16];
    let mut hdr =
        slipstream_dataplane::testutil::ipv4_header(&HOST4, &CLIENT4, proto::ICMP, body.len());
    ipv4::set_frag_field(&mut hdr, ipv4::MF_FLAG);
    ipv4::update_checksum(&mut hdr);
    hdr.extend_from_slice(&body);
    let frame = ether_frame(ether::TYPE_IPV4, &hdr);

    let mut packet = parsed(&frame);
    assert_eq!(
        translate_packet(config(&h), &mut packet),
        Verdict::DropMalformed
    );
}

/// Source-route options cause a drop.
#[test]
fn source_route_options_drop() {
    let h = harness();
    let body = udp_segment(9, 10, b"x");
    // IHL 6: 4 bytes of options carrying LSRR.
    let mut hdr = vec![0u8; 24];
    hdr[0] = 0x46;
    ipv4::set_total_length(&mut hdr, (24 + body.len()) as u16);
    ipv4::set_ttl(&mut hdr, 64);
    ipv4::set_protocol(&mut hdr, proto::UDP);
    ipv4::set_src(&mut hdr, &HOST4);
    ipv4::set_dst(&mut hdr, &CLIENT4);
    hdr[20] = ipv4::OPT_LSRR;
    hdr[21] = 3;
    ipv4::update_checksum(&mut hdr);
    hdr.extend_from_slice(&body);
    let frame = ether_frame(ether::TYPE_IPV4, &hdr);

    let mut packet = parsed(&frame);
    assert_eq!(
        translate_packet(config(&h), &mut packet),
        Verdict::DropUnsupported
    );
}

/// Benign IPv4 options (NOPs) are discarded by translation.
#[test]
fn benign_options_are_dropped_from_header() {
    let h = harness();
    let body = udp_segment(9, 10, b"opts");
    let mut hdr = vec![0u8; 24];
    hdr[0] = 0x46;
    ipv4::set_total_length(&mut hdr, (24 + body.len()) as u16);
    ipv4::set_ttl(&mut hdr, 64);
    ipv4::set_protocol(&mut hdr, proto::UDP);
    ipv4::set_src(&mut hdr, &HOST4);
    ipv4::set_dst(&mut hdr, &CLIENT4);
    hdr[20] = ipv4::OPT_NOP;
    hdr[21] = ipv4::OPT_NOP;
    hdr[22] = ipv4::OPT_NOP;
    hdr[23] = ipv4::OPT_EOL;
    ipv4::update_checksum(&mut hdr);
    hdr.extend_from_slice(&body);
    let frame = ether_frame(ether::TYPE_IPV4, &hdr);

    let mut packet = parsed(&frame);
    assert_eq!(translate_packet(config(&h), &mut packet), Verdict::Translated);
    let net = packet.network();
    assert_eq!(ipv6::payload_len(net) as usize, body.len());
    let l4 = packet.transport();
    assert_eq!(&l4[8..12], b"opts");
}

/// Extension-header discipline: duplicate Hop-by-Hop, Type 0 routing
/// and AH all reject the packet.
#[test]
fn extension_header_discipline() {
    // Two Hop-by-Hop headers.
    let mut payload = vec![proto::HOPOPTS, 0, 0, 0, 0, 0, 0, 0];
    payload.extend_from_slice(&[proto::UDP, 0, 0, 0, 0, 0, 0, 0]);
    payload.extend_from_slice(&udp_segment(1, 2, b"x"));
    let mut hdr = ipv6_header(&client6(), &embed(&HOST4), proto::HOPOPTS, payload.len());
    hdr.extend_from_slice(&payload);
    assert!(v6::process_extension_headers(&hdr).is_none());

    // Type 0 routing header.
    let mut payload = vec![proto::UDP, 0, 0, 0, 0, 0, 0, 0];
    payload.extend_from_slice(&udp_segment(1, 2, b"x"));
    let mut hdr = ipv6_header(&client6(), &embed(&HOST4), proto::ROUTING, payload.len());
    hdr.extend_from_slice(&payload);
    assert!(v6::process_extension_headers(&hdr).is_none());

    // AH.
    let mut payload = vec![proto::UDP, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
    payload.extend_from_slice(&udp_segment(1, 2, b"x"));
    let mut hdr = ipv6_header(&client6(), &embed(&HOST4), proto::AH, payload.len());
    hdr.extend_from_slice(&payload);
    assert!(v6::process_extension_headers(&hdr).is_none());

    // A single well-formed destination-options header walks fine.
    let mut payload = vec![proto::UDP, 0, 0, 0, 0, 0, 0, 0];
    payload.extend_from_slice(&udp_segment(1, 2, b"x"));
    let mut hdr = ipv6_header(&client6(), &embed(&HOST4), proto::DSTOPTS, payload.len());
    hdr.extend_from_slice(&payload);
    let walk = v6::process_extension_headers(&hdr).unwrap();
    assert_eq!(walk.next_header, proto::UDP);
    assert_eq!(walk.ext_len, 8);
}

/// ICMPv4 echo <-> ICMPv6 echo translation with valid checksums.
#[test]
fn icmp_echo_translation() {
    let h = harness();
    // Echo request v4 -> v6.
    let mut msg = vec![0u8; 16];
    icmp::set_type(&mut msg, icmp::ECHO);
    msg[4..8].copy_from_slice(&[0, 1, 0, 7]); // id/seq
    let sum = checksum::ones_complement_sum(0, &msg);
    icmp::set_checksum(&mut msg, checksum::fold(sum));
    let frame = v4_frame(&HOST4, &CLIENT4, proto::ICMP, msg);

    let mut packet = parsed(&frame);
    assert_eq!(translate_packet(config(&h), &mut packet), Verdict::Translated);
    let l4 = packet.transport();
    assert_eq!(icmp6::icmp_type(l4), icmp6::ECHO_REQUEST);
    assert_eq!(packet.transport_header.proto, proto::ICMPV6);
    assert!(l4_checksum_ok(&packet));

    // Echo reply v6 -> v4.
    let mut msg = vec![0u8; 16];
    icmp6::set_type(&mut msg, icmp6::ECHO_REPLY);
    let frame = v6_frame(&client6(), &embed(&HOST4), proto::ICMPV6, msg);
    let mut packet = parsed(&frame);
    assert_eq!(translate_packet(config(&h), &mut packet), Verdict::Translated);
    let l4 = packet.transport();
    assert_eq!(icmp::icmp_type(l4), icmp::ECHO_REPLY);
    // Plain internet checksum over the ICMPv4 message.
    assert_eq!(checksum::fold(checksum::ones_complement_sum(0, l4)), 0);
}

/// ICMPv6 Packet Too Big becomes fragmentation-needed with the MTU
/// clamped by both configured next hops, and the embedded packet is
/// recursively translated.
#[test]
fn icmpv6_packet_too_big() {
    let h = harness();

    // Embedded original: the v4 host's packet as it looked after
    // v4->v6 translation (src = embedded host, dst = mapped client).
    let embedded_udp = udp_segment(53, 12345, b"big-data");
    let mut embedded = ipv6_header(&embed(&HOST4), &client6(), proto::UDP, embedded_udp.len());
    embedded.extend_from_slice(&embedded_udp);

    let mut msg = vec![0u8; icmp6::LEN];
    icmp6::set_type(&mut msg, icmp6::PACKET_TOO_BIG);
    icmp6::set_mtu(&mut msg, 1500);
    msg.extend_from_slice(&embedded);

    let frame = v6_frame(&client6(), &embed(&HOST4), proto::ICMPV6, msg);
    let mut packet = parsed(&frame);
    assert_eq!(translate_packet(config(&h), &mut packet), Verdict::Translated);

    // Outer: v4 from the mapped client toward the embedded host.
    let net = packet.network();
    assert_eq!(ipv4::src(net), CLIENT4);
    assert_eq!(ipv4::dst(net), HOST4);
    assert_eq!(ipv4::protocol(net), proto::ICMP);

    let l4 = packet.transport();
    assert_eq!(icmp::icmp_type(l4), icmp::DEST_UNREACH);
    assert_eq!(icmp::code(l4), icmp::FRAG_NEEDED);
    // min(1500 - 20, 1500 - 20, 1450) = 1450.
    assert_eq!(icmp::next_mtu(l4), 1450);
    // Whole-message checksum validates.
    assert_eq!(checksum::fold(checksum::ones_complement_sum(0, l4)), 0);

    // Embedded packet came out as v4 with its own valid header.
    let emb = &l4[icmp::LEN..];
    assert_eq!(ipv4::version(emb), 4);
    assert_eq!(ipv4::src(emb), HOST4);
    assert_eq!(ipv4::dst(emb), CLIENT4);
    assert_eq!(ipv4::protocol(emb), proto::UDP);
    assert_eq!(checksum::ipv4_header(&emb[..20]), ipv4::checksum(emb));
    // The embedded UDP header survived behind the new header.
    let emb_udp = &emb[20..];
    assert_eq!(udp::src_port(emb_udp), 53);
    assert_eq!(udp::dst_port(emb_udp), 12345);
}

/// ICMPv4 fragmentation-needed becomes Packet Too Big with the 1280
/// floor applied.
#[test]
fn icmpv4_frag_needed_floors_at_1280() {
    let h = harness();

    let embedded_udp = udp_segment(12345, 53, b"data");
    let mut embedded = slipstream_dataplane::testutil::ipv4_header(
        &CLIENT4,
        &HOST4,
        proto::UDP,
        embedded_udp.len(),
    );
    embedded.extend_from_slice(&embedded_udp);

    let mut msg = vec![0u8; icmp::LEN];
    icmp::set_type(&mut msg, icmp::DEST_UNREACH);
    icmp::set_code(&mut msg, icmp::FRAG_NEEDED);
    icmp::set_next_mtu(&mut msg, 600);
    msg.extend_from_slice(&embedded);

    let frame = v4_frame(&HOST4, &CLIENT4, proto::ICMP, msg);
    let mut packet = parsed(&frame);
    assert_eq!(translate_packet(config(&h), &mut packet), Verdict::Translated);

    let l4 = packet.transport();
    assert_eq!(icmp6::icmp_type(l4), icmp6::PACKET_TOO_BIG);
    // max(1280, min(600 + 20, 1500, 1450 + 20)) = 1280.
    assert_eq!(icmp6::mtu(l4), 1280);
    assert!(l4_checksum_ok(&packet));

    // Embedded became v6: src is the mapped client, dst embeds.
    let emb = &l4[icmp6::LEN..];
    assert_eq!(ipv6::version(emb), 6);
    assert_eq!(ipv6::src(emb), client6());
    assert_eq!(ipv6::dst(emb), embed(&HOST4));
    assert_eq!(ipv6::next_header(emb), proto::UDP);
}

/// The front-level handler counts translations and drops per verdict.
#[test]
fn handler_counts_verdicts() {
    let h = harness();
    let mut front = PacketFront::new();
    front.input.push(parsed(&v4_frame(
        &HOST4,
        &CLIENT4,
        proto::UDP,
        udp_segment(1, 2, b"ok"),
    )));
    front.input.push(parsed(&v4_frame(
        &HOST4,
        &[203, 0, 113, 9],
        proto::UDP,
        udp_segment(1, 2, b"nope"),
    )));

    unsafe { handle_packets(h.config, &mut front, 0) };
    assert_eq!(front.output.len(), 1);
    assert_eq!(front.drop.len(), 1);

    unsafe {
        let storage = (*h.config).counter_storage.load();
        let totals = (*storage).accumulate((*h.config).counter, stats::WORDS);
        assert_eq!(totals[stats::INCOMING], 2);
        assert_eq!(totals[stats::TRANSLATED_V4_TO_V6], 1);
        assert_eq!(totals[stats::DROP_UNKNOWN_MAPPING], 1);
    }
}

/// Teardown returns every internal allocation to the agent.
#[test]
fn config_free_returns_memory() {
    let h = harness();
    unsafe {
        let before = (*h.agent).memory_context.outstanding();
        assert!(before > 0);
        nat64_config_free(h.data);
        assert_eq!(
            (*h.agent).memory_context.outstanding() as usize,
            size_of::<Nat64Config>()
        );
    }
}
