//! Packet-level machinery: the mbuf buffer, header accessors, the parser,
//! the four-list packet front, checksum helpers, tunnel encap/decap and
//! the firewall-state sync frame codec.

pub mod checksum;
pub mod decap;
pub mod encap;
pub mod front;
pub mod fwstate;
pub mod headers;
pub mod mbuf;
pub mod packet;
pub mod testutil;

pub use front::PacketFront;
pub use mbuf::Mbuf;
pub use packet::{Packet, PacketList, ParseError, parse_packet};

#[cfg(test)]
mod tests_encap;
#[cfg(test)]
mod tests_packet;
