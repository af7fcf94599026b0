use slipstream_dataplane::headers::{proto, tcp};
use slipstream_lib::fnv1a;
use slipstream_lookup::TtlKey;

use crate::meta::PacketMetadata;

/// Session fingerprint: the source 5-tuple. Pure-L3 services zero the
/// ports so every flow from one client shares a session.
#[derive(Clone, Copy, PartialEq)]
#[repr(C)]
pub struct SessionId {
    pub transport_proto: u8,
    pub network_proto: u8,
    pub ip_source: [u8; 16],
    pub ip_destination: [u8; 16],
    pub port_source: u16,
    pub port_destination: u16,
}

impl TtlKey for SessionId {
    fn hash_key(&self) -> u64 {
        // repr(C) with 1+1+16+16 bytes before the u16 pair leaves no
        // padding, so hashing the raw bytes is stable.
        let bytes = unsafe {
            core::slice::from_raw_parts(self as *const Self as *const u8, size_of::<Self>())
        };
        fnv1a(bytes)
    }
}

/// Per-session value stored in the TTL map.
#[derive(Clone, Copy, Default)]
#[repr(C)]
pub struct SessionState {
    pub real_id: u32,
    pub create_timestamp: u32,
    pub last_packet_timestamp: u32,
    pub timeout: u32,
}

/// Session lifetimes per flow class, in seconds.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct SessionTimeouts {
    pub tcp_syn_ack: u32,
    pub tcp_syn: u32,
    pub tcp_fin: u32,
    pub tcp: u32,
    pub udp: u32,
    pub default: u32,
}

impl SessionTimeouts {
    pub fn max(&self) -> u32 {
        self.tcp_syn_ack
            .max(self.tcp_syn)
            .max(self.tcp_fin)
            .max(self.tcp)
            .max(self.udp)
            .max(self.default)
    }
}

impl Default for SessionTimeouts {
    fn default() -> Self {
        Self {
            tcp_syn_ack: 5,
            tcp_syn: 5,
            tcp_fin: 30,
            tcp: 120,
            udp: 30,
            default: 30,
        }
    }
}

/// Timeout class of a packet: SYN-only, SYN+ACK and FIN get their own
/// budgets; everything else on TCP is treated as established.
pub fn session_timeout(timeouts: &SessionTimeouts, meta: &PacketMetadata) -> u32 {
    if meta.transport_proto == proto::UDP {
        return timeouts.udp;
    }
    if meta.transport_proto != proto::TCP {
        return timeouts.default;
    }
    if meta.tcp_flags & tcp::FLAG_SYN != 0 {
        if meta.tcp_flags & tcp::FLAG_ACK != 0 {
            return timeouts.tcp_syn_ack;
        }
        return timeouts.tcp_syn;
    }
    if meta.tcp_flags & tcp::FLAG_FIN != 0 {
        return timeouts.tcp_fin;
    }
    timeouts.tcp
}

/// Build the session id from packet metadata.
pub fn fill_session_id(meta: &PacketMetadata, pure_l3: bool) -> SessionId {
    SessionId {
        transport_proto: meta.transport_proto,
        network_proto: meta.network_proto,
        ip_source: meta.src_addr,
        ip_destination: meta.dst_addr,
        port_source: if pure_l3 { 0 } else { meta.src_port },
        port_destination: if pure_l3 { 0 } else { meta.dst_port },
    }
}
