use core::fmt;
use std::collections::VecDeque;

use slipstream_lib::fnv::{fnv1a, fnv1a_extend};

use crate::headers::{ether, ipv4, ipv6, ipv6_ext, ipv6_frag, proto, tcp, udp, vlan};
use crate::mbuf::Mbuf;

/// Hard cap on IPv6 extension headers walked by the parser.
const MAX_IPV6_EXT_HEADERS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    Truncated,
    BadHeader,
    UnknownEtherType,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated => write!(f, "frame shorter than its headers claim"),
            Self::BadHeader => write!(f, "malformed protocol header"),
            Self::UnknownEtherType => write!(f, "unhandled ethertype"),
        }
    }
}

impl core::error::Error for ParseError {}

/// Parsed position of the network header: host-order ethertype plus the
/// byte offset of the header inside the frame.
#[derive(Debug, Clone, Copy, Default)]
pub struct NetworkHeader {
    pub ether_type: u16,
    pub offset: u16,
}

/// Parsed position of the transport header: IP protocol number plus the
/// byte offset of the header inside the frame.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransportHeader {
    pub proto: u8,
    pub offset: u16,
}

/// One packet in flight through the pipeline.
pub struct Packet {
    mbuf: Mbuf,
    pub network_header: NetworkHeader,
    pub transport_header: TransportHeader,
    pub vlan: u16,
    pub flow_label: u32,
    pub hash: u64,
    pub rx_device_id: u16,
    pub tx_device_id: u16,
}

impl Packet {
    pub fn new(mbuf: Mbuf) -> Self {
        Self {
            mbuf,
            network_header: NetworkHeader::default(),
            transport_header: TransportHeader::default(),
            vlan: 0,
            flow_label: 0,
            hash: 0,
            rx_device_id: 0,
            tx_device_id: 0,
        }
    }

    pub fn from_frame(frame: &[u8]) -> Self {
        Self::new(Mbuf::from_frame(frame))
    }

    #[inline]
    pub fn mbuf(&self) -> &Mbuf {
        &self.mbuf
    }

    #[inline]
    pub fn mbuf_mut(&mut self) -> &mut Mbuf {
        &mut self.mbuf
    }

    /// Network header and everything after it.
    pub fn network(&self) -> &[u8] {
        &self.mbuf.data()[self.network_header.offset as usize..]
    }

    pub fn network_mut(&mut self) -> &mut [u8] {
        let off = self.network_header.offset as usize;
        &mut self.mbuf.data_mut()[off..]
    }

    /// Transport header and everything after it.
    pub fn transport(&self) -> &[u8] {
        &self.mbuf.data()[self.transport_header.offset as usize..]
    }

    pub fn transport_mut(&mut self) -> &mut [u8] {
        let off = self.transport_header.offset as usize;
        &mut self.mbuf.data_mut()[off..]
    }
}

fn parse_ether(packet: &Packet, offset: &mut u16) -> Result<u16, ParseError> {
    let data = packet.mbuf.data();
    if data.len() < *offset as usize + ether::LEN {
        return Err(ParseError::Truncated);
    }
    let ether_type = ether::ethertype(&data[*offset as usize..]);
    *offset += ether::LEN as u16;
    Ok(ether_type)
}

fn parse_vlan(packet: &mut Packet, offset: &mut u16) -> Result<u16, ParseError> {
    let data = packet.mbuf.data();
    if data.len() < *offset as usize + vlan::LEN {
        return Err(ParseError::Truncated);
    }
    let hdr = &data[*offset as usize..];
    packet.vlan = vlan::tci(hdr) & 0x0fff;
    let ether_type = vlan::ethertype(hdr);
    *offset += vlan::LEN as u16;
    Ok(ether_type)
}

/// Validate an IPv4 header at `offset` and step past it.
pub fn parse_ipv4_header(packet: &Packet, offset: &mut u16) -> Result<u8, ParseError> {
    let data = packet.mbuf.data();
    let start = *offset as usize;
    if data.len() < start + ipv4::MIN_LEN {
        return Err(ParseError::Truncated);
    }
    let hdr = &data[start..];
    let ihl = ipv4::ihl(hdr);
    if ipv4::version(hdr) != 4 || ihl < ipv4::MIN_LEN {
        return Err(ParseError::BadHeader);
    }
    let total = ipv4::total_length(hdr) as usize;
    if total < ihl || data.len() < start + total {
        return Err(ParseError::Truncated);
    }
    *offset += ihl as u16;
    Ok(ipv4::protocol(hdr))
}

/// Validate an IPv6 header at `offset`, walk its extension chain and
/// step to the upper-layer header.
pub fn parse_ipv6_header(packet: &Packet, offset: &mut u16) -> Result<u8, ParseError> {
    let data = packet.mbuf.data();
    let start = *offset as usize;
    if data.len() < start + ipv6::LEN {
        return Err(ParseError::Truncated);
    }
    let hdr = &data[start..];
    if ipv6::version(hdr) != 6 {
        return Err(ParseError::BadHeader);
    }
    let payload_len = ipv6::payload_len(hdr) as usize;
    if data.len() < start + ipv6::LEN + payload_len {
        return Err(ParseError::Truncated);
    }

    let mut next = ipv6::next_header(hdr);
    let mut cursor = start + ipv6::LEN;
    let max_cursor = start + ipv6::LEN + payload_len;
    let mut walked = 0usize;

    loop {
        let step = match next {
            proto::HOPOPTS | proto::ROUTING | proto::DSTOPTS => {
                if max_cursor < cursor + 8 {
                    return Err(ParseError::Truncated);
                }
                ipv6_ext::options_len(&data[cursor..])
            }
            proto::AH => {
                if max_cursor < cursor + 8 {
                    return Err(ParseError::Truncated);
                }
                ipv6_ext::ah_len(&data[cursor..])
            }
            proto::FRAGMENT => {
                if max_cursor < cursor + ipv6_frag::LEN {
                    return Err(ParseError::Truncated);
                }
                ipv6_frag::LEN
            }
            _ => break,
        };
        walked += 1;
        if walked > MAX_IPV6_EXT_HEADERS {
            return Err(ParseError::BadHeader);
        }
        next = ipv6_ext::next_header(&data[cursor..]);
        cursor += step;
        if cursor > max_cursor {
            return Err(ParseError::Truncated);
        }
    }

    *offset = cursor as u16;
    Ok(next)
}

fn flow_hash(packet: &Packet) -> u64 {
    let data = packet.mbuf.data();
    let net = &data[packet.network_header.offset as usize..];
    let mut hash = match packet.network_header.ether_type {
        ether::TYPE_IPV4 => {
            let mut hash = fnv1a(&ipv4::src(net));
            hash = fnv1a_extend(hash, &ipv4::dst(net));
            hash
        }
        _ => {
            let mut hash = fnv1a(&ipv6::src(net));
            hash = fnv1a_extend(hash, &ipv6::dst(net));
            hash
        }
    };
    hash = fnv1a_extend(hash, &[packet.transport_header.proto]);
    let l4 = &data[packet.transport_header.offset as usize..];
    match packet.transport_header.proto {
        proto::TCP if l4.len() >= tcp::MIN_LEN => {
            hash = fnv1a_extend(hash, &l4[0..4]);
        }
        proto::UDP if l4.len() >= udp::LEN => {
            hash = fnv1a_extend(hash, &l4[0..4]);
        }
        _ => {}
    }
    hash
}

/// Parse Ethernet, optional VLAN and the IP layer, recording header
/// positions and a software flow hash on the packet.
pub fn parse_packet(packet: &mut Packet) -> Result<(), ParseError> {
    let mut offset = 0u16;
    let mut ether_type = parse_ether(packet, &mut offset)?;
    if ether_type == ether::TYPE_VLAN {
        ether_type = parse_vlan(packet, &mut offset)?;
    }

    packet.network_header = NetworkHeader {
        ether_type,
        offset,
    };

    let next = match ether_type {
        ether::TYPE_IPV4 => parse_ipv4_header(packet, &mut offset)?,
        ether::TYPE_IPV6 => {
            let net = &packet.mbuf.data()[packet.network_header.offset as usize..];
            packet.flow_label = ipv6::flow_label(net);
            parse_ipv6_header(packet, &mut offset)?
        }
        other => {
            log::debug!("parse: unhandled ethertype {other:#06x}");
            return Err(ParseError::UnknownEtherType);
        }
    };

    packet.transport_header = TransportHeader {
        proto: next,
        offset,
    };
    packet.hash = flow_hash(packet);
    Ok(())
}

/// Ordered, owned list of packets. The front/pipeline machinery moves
/// packets between lists; nothing is ever cloned.
#[derive(Default)]
pub struct PacketList {
    packets: VecDeque<Packet>,
}

impl PacketList {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn push(&mut self, packet: Packet) {
        self.packets.push_back(packet);
    }

    #[inline]
    pub fn pop(&mut self) -> Option<Packet> {
        self.packets.pop_front()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.packets.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    /// Append every packet of `other`, leaving it empty.
    pub fn concat(&mut self, other: &mut PacketList) {
        self.packets.append(&mut other.packets);
    }
}
