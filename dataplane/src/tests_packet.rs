use crate::headers::{ether, proto, tcp, vlan};
use crate::mbuf::Mbuf;
use crate::packet::{Packet, PacketList, ParseError, parse_packet};
use crate::testutil::{ether_frame, parsed, tcp_segment, udp_segment, v4_frame};

const SRC4: [u8; 4] = [10, 2, 123, 13];
const DST4: [u8; 4] = [1, 1, 1, 1];

fn addr6(last: u8) -> [u8; 16] {
    let mut addr = [0u8; 16];
    addr[0] = 0x20;
    addr[1] = 0x01;
    addr[15] = last;
    addr
}

#[test]
fn mbuf_prepend_adj_round_trip() {
    let mut mbuf = Mbuf::from_frame(&[1, 2, 3, 4]);
    assert_eq!(mbuf.len(), 4);

    let hdr = mbuf.prepend(2).unwrap();
    hdr.copy_from_slice(&[9, 9]);
    assert_eq!(mbuf.data(), &[9, 9, 1, 2, 3, 4]);

    mbuf.adj(2).unwrap();
    assert_eq!(mbuf.data(), &[1, 2, 3, 4]);

    mbuf.append(2).unwrap();
    assert_eq!(mbuf.len(), 6);
    mbuf.trim(4).unwrap();
    assert_eq!(mbuf.data(), &[1, 2]);
}

#[test]
fn mbuf_bounds_are_enforced() {
    let mut mbuf = Mbuf::from_frame(&[0u8; 8]);
    assert!(mbuf.adj(9).is_none());
    assert!(mbuf.trim(9).is_none());
    assert!(mbuf.prepend(4096).is_none());
}

#[test]
fn parse_udp_v4() {
    let frame = v4_frame(&SRC4, &DST4, proto::UDP, udp_segment(1000, 53, b"hello"));
    let packet = parsed(&frame);

    assert_eq!(packet.network_header.ether_type, ether::TYPE_IPV4);
    assert_eq!(packet.network_header.offset, 14);
    assert_eq!(packet.transport_header.proto, proto::UDP);
    assert_eq!(packet.transport_header.offset, 34);
    assert_ne!(packet.hash, 0);
}

#[test]
fn parse_tcp_flags_visible() {
    let frame = v4_frame(
        &SRC4,
        &DST4,
        proto::TCP,
        tcp_segment(1000, 80, tcp::FLAG_SYN, &[]),
    );
    let packet = parsed(&frame);
    assert_eq!(tcp::flags(packet.transport()), tcp::FLAG_SYN);
}

#[test]
fn parse_vlan_tagged() {
    let inner = v4_frame(&SRC4, &DST4, proto::UDP, udp_segment(1, 2, &[]));
    // Rebuild with a VLAN tag spliced in after the Ethernet header.
    let mut frame = inner[..12].to_vec();
    frame.extend_from_slice(&ether::TYPE_VLAN.to_be_bytes());
    frame.extend_from_slice(&100u16.to_be_bytes()); // tci: vlan 100
    frame.extend_from_slice(&ether::TYPE_IPV4.to_be_bytes());
    frame.extend_from_slice(&inner[14..]);

    let packet = parsed(&frame);
    assert_eq!(packet.vlan, 100);
    assert_eq!(packet.network_header.offset, (ether::LEN + vlan::LEN) as u16);
    assert_eq!(packet.transport_header.proto, proto::UDP);
}

#[test]
fn parse_ipv6_with_extension_chain() {
    let src = addr6(1);
    let dst = addr6(2);
    // Hop-by-hop (8 bytes) then UDP.
    let mut payload = vec![proto::UDP, 0, 0, 0, 0, 0, 0, 0];
    let segment = udp_segment(4000, 4001, b"x");
    payload.extend_from_slice(&segment);

    let mut hdr = crate::testutil::ipv6_header(&src, &dst, proto::HOPOPTS, payload.len());
    hdr.extend_from_slice(&payload);
    let frame = ether_frame(ether::TYPE_IPV6, &hdr);

    let packet = parsed(&frame);
    assert_eq!(packet.transport_header.proto, proto::UDP);
    assert_eq!(
        packet.transport_header.offset as usize,
        ether::LEN + 40 + 8
    );
}

#[test]
fn parse_rejects_truncated_frames() {
    let frame = v4_frame(&SRC4, &DST4, proto::UDP, udp_segment(1, 2, b"data"));
    // Cut the frame short of what total_length promises.
    let mut packet = Packet::from_frame(&frame[..frame.len() - 3]);
    assert_eq!(parse_packet(&mut packet), Err(ParseError::Truncated));
}

#[test]
fn parse_rejects_unknown_ethertype() {
    let frame = ether_frame(0x88cc, &[0u8; 64]);
    let mut packet = Packet::from_frame(&frame);
    assert_eq!(parse_packet(&mut packet), Err(ParseError::UnknownEtherType));
}

#[test]
fn hash_varies_with_ports_and_sticks_per_flow() {
    let a1 = parsed(&v4_frame(&SRC4, &DST4, proto::UDP, udp_segment(1000, 53, b"")));
    let a2 = parsed(&v4_frame(&SRC4, &DST4, proto::UDP, udp_segment(1000, 53, b"zz")));
    let b = parsed(&v4_frame(&SRC4, &DST4, proto::UDP, udp_segment(1001, 53, b"")));

    assert_eq!(a1.hash, a2.hash, "hash must depend on the 5-tuple only");
    assert_ne!(a1.hash, b.hash);
}

#[test]
fn packet_lists_keep_order_and_move() {
    let frame = v4_frame(&SRC4, &DST4, proto::UDP, udp_segment(7, 8, &[]));
    let mut list = PacketList::new();
    for port in 0..4u16 {
        let mut packet = parsed(&frame);
        packet.rx_device_id = port;
        list.push(packet);
    }
    let mut other = PacketList::new();
    other.concat(&mut list);
    assert!(list.is_empty());
    assert_eq!(other.len(), 4);
    for expected in 0..4u16 {
        assert_eq!(other.pop().unwrap().rx_device_id, expected);
    }
}

#[test]
fn front_rotation_moves_output_to_input() {
    use crate::front::PacketFront;

    let frame = v4_frame(&SRC4, &DST4, proto::UDP, udp_segment(7, 8, &[]));
    let mut front = PacketFront::new();
    front.input.push(parsed(&frame));
    front.input.push(parsed(&frame));

    while let Some(packet) = front.pop_input() {
        front.output(packet);
    }
    front.rotate();
    assert_eq!(front.input.len(), 2);
    assert!(front.output.is_empty());
}
