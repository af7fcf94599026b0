//! Stateless NAT64 translator (RFC 7915): bidirectional IPv4/IPv6
//! header translation including ICMP, fragmentation and embedded-packet
//! rewrite in error messages.

pub mod config;
pub mod dataplane;
mod icmp;
mod v4;
mod v6;

pub use config::{Mapping, Nat64Config, Prefix};
pub use dataplane::{Nat64Handler, Verdict};

#[cfg(test)]
mod tests_nat64;
