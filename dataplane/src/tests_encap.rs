use crate::decap::packet_decap;
use crate::encap::{ip4_encap, ip6_encap};
use crate::fwstate::{SyncConfig, SyncDirection, SyncFrame, craft_sync_packet};
use crate::headers::{ether, gre, ipv4, ipv6, proto, udp};
use crate::packet::parse_packet;
use crate::testutil::{l4_checksum_ok, parsed, udp_segment, v4_frame, v6_frame};

const SRC4: [u8; 4] = [10, 2, 123, 13];
const DST4: [u8; 4] = [1, 1, 1, 1];
const REAL4: [u8; 4] = [11, 11, 11, 11];
const OUT_SRC4: [u8; 4] = [192, 168, 0, 1];

fn addr6(last: u8) -> [u8; 16] {
    let mut addr = [0u8; 16];
    addr[0] = 0x20;
    addr[1] = 0x01;
    addr[15] = last;
    addr
}

#[test]
fn ip4_in_ip4_encap() {
    let mut packet = parsed(&v4_frame(&SRC4, &DST4, proto::UDP, udp_segment(5, 6, b"pl")));
    let inner_before = packet.network().to_vec();

    ip4_encap(&mut packet, &REAL4, &OUT_SRC4).unwrap();

    let outer = packet.network();
    assert_eq!(ipv4::dst(outer), REAL4);
    assert_eq!(ipv4::src(outer), OUT_SRC4);
    assert_eq!(ipv4::protocol(outer), proto::IPIP);
    assert_eq!(
        ipv4::total_length(outer) as usize,
        ipv4::MIN_LEN + inner_before.len()
    );
    assert_eq!(ipv4::ttl(outer), 64);
    // Outer header checksum validates.
    assert_eq!(crate::checksum::ipv4_header(&outer[..20]), ipv4::checksum(outer));
    // Inner packet is byte-identical behind the outer header.
    assert_eq!(&outer[ipv4::MIN_LEN..], &inner_before[..]);
}

#[test]
fn ip6_in_ip4_encap_carries_ipv6_proto() {
    let mut packet = parsed(&v6_frame(
        &addr6(1),
        &addr6(2),
        proto::UDP,
        udp_segment(5, 6, b"pl"),
    ));
    ip4_encap(&mut packet, &REAL4, &OUT_SRC4).unwrap();

    let outer = packet.network();
    assert_eq!(ipv4::protocol(outer), proto::IPV6);
    assert_eq!(packet.network_header.ether_type, ether::TYPE_IPV4);
}

#[test]
fn ip4_in_ip6_encap() {
    let mut packet = parsed(&v4_frame(&SRC4, &DST4, proto::UDP, udp_segment(5, 6, b"pl")));
    let real6 = addr6(0x11);
    let out_src6 = addr6(0x22);
    ip6_encap(&mut packet, &real6, &out_src6).unwrap();

    let outer = packet.network();
    assert_eq!(ipv6::dst(outer), real6);
    assert_eq!(ipv6::src(outer), out_src6);
    assert_eq!(ipv6::next_header(outer), proto::IPIP);
    assert_eq!(packet.network_header.ether_type, ether::TYPE_IPV6);
}

#[test]
fn encap_then_decap_restores_packet() {
    let frame = v4_frame(&SRC4, &DST4, proto::UDP, udp_segment(5, 6, b"payload"));
    let mut packet = parsed(&frame);
    let original = packet.mbuf().data().to_vec();
    let transport_before = packet.transport_header.offset;

    ip4_encap(&mut packet, &REAL4, &OUT_SRC4).unwrap();
    packet.transport_header.proto = proto::IPIP;
    packet.transport_header.offset = packet.network_header.offset + ipv4::MIN_LEN as u16;
    packet_decap(&mut packet).unwrap();

    assert_eq!(packet.mbuf().data(), &original[..]);
    assert_eq!(packet.network_header.ether_type, ether::TYPE_IPV4);
    assert_eq!(packet.transport_header.proto, proto::UDP);
    assert_eq!(packet.transport_header.offset, transport_before);
}

#[test]
fn gre_decap_strips_plain_header() {
    // Hand-build: Ether + outer IPv4(GRE) + GRE + inner IPv4/UDP.
    let inner = v4_frame(&SRC4, &DST4, proto::UDP, udp_segment(5, 6, b"x"));
    let inner_ip = &inner[14..];

    let mut gre_hdr = vec![0u8; gre::LEN];
    gre::set_plain(&mut gre_hdr, ether::TYPE_IPV4);
    let mut payload = gre_hdr;
    payload.extend_from_slice(inner_ip);

    let mut outer = crate::testutil::ipv4_header(&OUT_SRC4, &REAL4, proto::GRE, payload.len());
    outer.extend_from_slice(&payload);
    let frame = crate::testutil::ether_frame(ether::TYPE_IPV4, &outer);

    let mut packet = parsed(&frame);
    assert_eq!(packet.transport_header.proto, proto::GRE);
    packet_decap(&mut packet).unwrap();

    assert_eq!(packet.network_header.ether_type, ether::TYPE_IPV4);
    assert_eq!(ipv4::dst(packet.network()), DST4);
    assert_eq!(packet.transport_header.proto, proto::UDP);
}

#[test]
fn gre_decap_rejects_flagged_headers() {
    let inner = v4_frame(&SRC4, &DST4, proto::UDP, udp_segment(5, 6, b"x"));
    let inner_ip = &inner[14..];

    // Checksum-present bit set: must be refused.
    let mut payload = vec![0x80, 0, 0x08, 0x00];
    payload.extend_from_slice(inner_ip);
    let mut outer = crate::testutil::ipv4_header(&OUT_SRC4, &REAL4, proto::GRE, payload.len());
    outer.extend_from_slice(&payload);
    let frame = crate::testutil::ether_frame(ether::TYPE_IPV4, &outer);

    let mut packet = parsed(&frame);
    assert!(packet_decap(&mut packet).is_none());
}

#[test]
fn sync_frame_round_trip() {
    let packet = parsed(&v4_frame(&SRC4, &DST4, proto::UDP, udp_segment(1000, 53, b"q")));
    let config = SyncConfig {
        dst_ether: [1, 0, 0x5e, 0, 0, 1],
        dst_addr_multicast: addr6(0xff),
        src_addr: addr6(0x01),
        port_multicast: 4784,
        vlan: 7,
    };

    let mut sync = craft_sync_packet(&config, &packet, SyncDirection::Ingress).unwrap();
    // The crafted packet reparses as IPv6/UDP with a valid checksum.
    parse_packet(&mut sync).unwrap();
    assert_eq!(sync.network_header.ether_type, ether::TYPE_IPV6);
    assert_eq!(sync.transport_header.proto, proto::UDP);
    assert!(l4_checksum_ok(&sync));

    let l4 = sync.transport();
    let frame = SyncFrame::from_bytes(&l4[udp::LEN..]).unwrap();
    assert_eq!(frame.fib, 0);
    assert_eq!(frame.proto, proto::UDP);
    assert_eq!(frame.src_ip, SRC4);
    assert_eq!(frame.dst_ip, DST4);
    assert_eq!(frame.src_port, 1000);
    assert_eq!(frame.dst_port, 53);
}

#[test]
fn egress_sync_frame_swaps_tuple() {
    let packet = parsed(&v4_frame(&DST4, &SRC4, proto::UDP, udp_segment(53, 1000, b"r")));
    let frame = crate::fwstate::fill_sync_frame(&packet, SyncDirection::Egress);
    assert_eq!(frame.fib, 1);
    assert_eq!(frame.src_ip, SRC4);
    assert_eq!(frame.dst_ip, DST4);
    assert_eq!(frame.src_port, 1000);
    assert_eq!(frame.dst_port, 53);
}
