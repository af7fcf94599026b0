use slipstream_controlplane::dp::DpConfig;
use slipstream_controlplane::{Agent, ModuleData};
use slipstream_dataplane::PacketFront;
use slipstream_dataplane::decap::packet_decap;
use slipstream_dataplane::headers::{ether, gre, ipv4, ipv6, proto, tcp};
use slipstream_dataplane::testutil::{parsed, tcp_segment, udp_segment, v4_frame, v6_frame};

use crate::config::{
    BalancerConfig, RealFlags, RealSpec, VsFlags, VsSpec, balancer_config_create,
    balancer_config_create_shared, balancer_config_free,
};
use crate::dataplane::handle_packets;
use crate::session::{SessionId, SessionTimeouts};
use crate::stats;
use crate::tunnel::fix_mss_ipv6;

const CLIENT: [u8; 4] = [10, 2, 123, 13];
const VIP: [u8; 4] = [1, 1, 1, 1];
const REAL0: [u8; 4] = [11, 11, 11, 11];
const REAL1: [u8; 4] = [12, 12, 12, 12];

struct Harness {
    _region: Vec<u8>,
    dp: *mut DpConfig,
    agent: *mut Agent,
}

fn harness() -> Harness {
    let mut region = vec![0u8; 64 << 20];
    let dp = unsafe {
        DpConfig::init(region.as_mut_ptr(), region.len(), 0, 1, 0, &["balancer"]).unwrap()
    };
    // Just under a power of two so the class-rounded block (16 MiB)
    // fits the instance arena.
    let agent = unsafe { Agent::attach(dp, "balancer-test", (16 << 20) - 4096).unwrap() };
    Harness {
        _region: region,
        dp,
        agent,
    }
}

fn pad16(addr: &[u8; 4]) -> [u8; 16] {
    let mut out = [0u8; 16];
    out[..4].copy_from_slice(addr);
    out
}

fn real_spec(dst: &[u8; 4], weight: u16, flags: RealFlags) -> RealSpec {
    RealSpec {
        flags,
        weight,
        dst: pad16(dst),
        src: [0u8; 16],
        src_mask: [0u8; 16],
    }
}

fn allow_all_v4() -> Vec<([u8; 16], [u8; 16])> {
    let mut hi = [0u8; 16];
    hi[..4].copy_from_slice(&[255, 255, 255, 255]);
    vec![([0u8; 16], hi)]
}

fn tcp_vs(reals: Vec<RealSpec>) -> VsSpec {
    VsSpec {
        flags: VsFlags::empty(),
        addr: pad16(&VIP),
        port: 80,
        proto: proto::TCP,
        allowed_src: allow_all_v4(),
        reals,
    }
}

fn build(h: &Harness, vss: &[VsSpec]) -> *mut ModuleData {
    unsafe {
        balancer_config_create(
            h.agent,
            0,
            "lb0",
            1,
            4096,
            SessionTimeouts::default(),
            vss,
        )
        .unwrap()
    }
}

fn run_one(config: *mut BalancerConfig, frame: &[u8], now: u32) -> PacketFront {
    let mut front = PacketFront::new();
    front.input.push(parsed(frame));
    unsafe { handle_packets(config, &mut front, 0, now) };
    front
}

fn session_id_for(sport: u16) -> SessionId {
    SessionId {
        transport_proto: proto::TCP,
        network_proto: 0,
        ip_source: pad16(&CLIENT),
        ip_destination: pad16(&VIP),
        port_source: sport,
        port_destination: 80,
    }
}

/// Basic VS selection: TCP SYN lands on the single real inside an
/// IPv4-in-IPv4 tunnel and a SYN-class session is recorded.
#[test]
fn vs_selection_tunnels_to_real() {
    let h = harness();
    let data = build(&h, &[tcp_vs(vec![real_spec(&REAL0, 1, RealFlags::empty())])]);
    let config = unsafe { BalancerConfig::from_module_data(data) };

    let frame = v4_frame(&CLIENT, &VIP, proto::TCP, tcp_segment(1000, 80, tcp::FLAG_SYN, &[]));
    let inner_before = parsed(&frame).network().to_vec();

    let mut front = run_one(config, &frame, 100);
    assert_eq!(front.output.len(), 1);
    assert!(front.drop.is_empty());

    let out = front.output.pop().unwrap();
    let outer = out.network();
    assert_eq!(ipv4::dst(outer), REAL0);
    // Unmasked real source: the outer source keeps the client address.
    assert_eq!(ipv4::src(outer), CLIENT);
    assert_eq!(ipv4::protocol(outer), proto::IPIP);
    assert_eq!(&outer[ipv4::MIN_LEN..], &inner_before[..]);

    unsafe {
        let table = &*(*config).session_table.load();
        let generation = table.begin_cs(0);
        assert_eq!(table.get_session_real(generation, 0, &session_id_for(1000), 100), Some(0));
        let state = table
            .generation_ref(generation)
            .map
            .lookup(&session_id_for(1000), 100)
            .unwrap();
        assert_eq!(state.timeout, SessionTimeouts::default().tcp_syn);
        table.end_cs(0);

        balancer_config_free(data);
        assert_eq!((*h.agent).memory_context.outstanding() as usize, {
            // Only the module blob itself remains with the caller.
            size_of::<BalancerConfig>()
        });
    }
}

/// Session stickiness: the follow-up ACK selects the same real and the
/// timeout class moves from SYN to established.
#[test]
fn established_sessions_stick() {
    let h = harness();
    let data = build(
        &h,
        &[tcp_vs(vec![
            real_spec(&REAL0, 1, RealFlags::empty()),
            real_spec(&REAL1, 1, RealFlags::empty()),
        ])],
    );
    let config = unsafe { BalancerConfig::from_module_data(data) };

    let syn = v4_frame(&CLIENT, &VIP, proto::TCP, tcp_segment(1000, 80, tcp::FLAG_SYN, &[]));
    let mut front = run_one(config, &syn, 100);
    let first_real = ipv4::dst(front.output.pop().unwrap().network());

    let ack = v4_frame(&CLIENT, &VIP, proto::TCP, tcp_segment(1000, 80, tcp::FLAG_ACK, &[]));
    let mut front = run_one(config, &ack, 101);
    assert_eq!(front.output.len(), 1);
    let second_real = ipv4::dst(front.output.pop().unwrap().network());
    assert_eq!(first_real, second_real);

    unsafe {
        let table = &*(*config).session_table.load();
        let generation = table.begin_cs(0);
        let state = table
            .generation_ref(generation)
            .map
            .lookup(&session_id_for(1000), 101)
            .unwrap();
        assert_eq!(state.timeout, SessionTimeouts::default().tcp);
        assert_eq!(state.last_packet_timestamp, 101);
        table.end_cs(0);
    }
}

/// A TCP packet without SYN cannot open a session.
#[test]
fn ack_without_session_drops() {
    let h = harness();
    let data = build(&h, &[tcp_vs(vec![real_spec(&REAL0, 1, RealFlags::empty())])]);
    let config = unsafe { BalancerConfig::from_module_data(data) };

    let ack = v4_frame(&CLIENT, &VIP, proto::TCP, tcp_segment(1000, 80, tcp::FLAG_ACK, &[]));
    let front = run_one(config, &ack, 100);
    assert_eq!(front.drop.len(), 1);

    unsafe {
        let storage = (*config).counter_storage.load();
        let vs = &*(*config).vs(0);
        assert_eq!(
            stats::read(storage, vs.counter, stats::VS_WORDS, stats::VS_PACKET_NOT_RESCHEDULED),
            1
        );
    }
}

/// A SYN+RST combination is not a session opener either.
#[test]
fn syn_rst_drops() {
    let h = harness();
    let data = build(&h, &[tcp_vs(vec![real_spec(&REAL0, 1, RealFlags::empty())])]);
    let config = unsafe { BalancerConfig::from_module_data(data) };

    let frame = v4_frame(
        &CLIENT,
        &VIP,
        proto::TCP,
        tcp_segment(1000, 80, tcp::FLAG_SYN | tcp::FLAG_RST, &[]),
    );
    let front = run_one(config, &frame, 100);
    assert_eq!(front.drop.len(), 1);
}

/// Sources outside the allowlist are refused and counted.
#[test]
fn source_filter_drops_and_counts() {
    let h = harness();
    let mut vs = tcp_vs(vec![real_spec(&REAL0, 1, RealFlags::empty())]);
    // Only 10.2.0.0/16 may talk to the service.
    let mut lo = [0u8; 16];
    lo[..4].copy_from_slice(&[10, 2, 0, 0]);
    let mut hi = [0u8; 16];
    hi[..4].copy_from_slice(&[10, 2, 255, 255]);
    vs.allowed_src = vec![(lo, hi)];
    let data = build(&h, &[vs]);
    let config = unsafe { BalancerConfig::from_module_data(data) };

    let allowed = v4_frame(&CLIENT, &VIP, proto::TCP, tcp_segment(1, 80, tcp::FLAG_SYN, &[]));
    let front = run_one(config, &allowed, 100);
    assert_eq!(front.output.len(), 1);

    let outsider = v4_frame(
        &[10, 3, 0, 1],
        &VIP,
        proto::TCP,
        tcp_segment(1, 80, tcp::FLAG_SYN, &[]),
    );
    let front = run_one(config, &outsider, 100);
    assert_eq!(front.drop.len(), 1);

    unsafe {
        let storage = (*config).counter_storage.load();
        let vs = &*(*config).vs(0);
        assert_eq!(
            stats::read(storage, vs.counter, stats::VS_WORDS, stats::VS_PACKET_SRC_NOT_ALLOWED),
            1
        );
    }
}

/// One-packet scheduling: 2000 UDP flows split 1:2 over the weighted
/// reals and the session table stays untouched.
#[test]
fn ops_distributes_by_weight_without_sessions() {
    let h = harness();
    let vs = VsSpec {
        flags: VsFlags::OPS,
        addr: pad16(&[3, 3, 3, 3]),
        port: 80,
        proto: proto::UDP,
        allowed_src: allow_all_v4(),
        reals: vec![
            real_spec(&REAL0, 1, RealFlags::empty()),
            real_spec(&REAL1, 2, RealFlags::empty()),
        ],
    };
    let data = build(&h, &[vs]);
    let config = unsafe { BalancerConfig::from_module_data(data) };

    let mut counts = [0u64; 2];
    for sport in 0..2000u16 {
        let frame = v4_frame(
            &CLIENT,
            &[3, 3, 3, 3],
            proto::UDP,
            udp_segment(10_000 + sport, 80, b"x"),
        );
        let mut front = run_one(config, &frame, 100);
        assert_eq!(front.output.len(), 1);
        let out = front.output.pop().unwrap();
        match ipv4::dst(out.network()) {
            REAL0 => counts[0] += 1,
            REAL1 => counts[1] += 1,
            other => panic!("unexpected real {other:?}"),
        }
    }

    let ratio = counts[1] as f64 / counts[0] as f64;
    assert!((1.5..=2.5).contains(&ratio), "weight ratio off: {ratio}");

    unsafe {
        let storage = (*config).counter_storage.load();
        let vs = &*(*config).vs(0);
        assert_eq!(
            stats::read(storage, vs.counter, stats::VS_WORDS, stats::VS_CREATED_SESSIONS),
            0
        );
        assert_eq!(
            stats::read(storage, vs.counter, stats::VS_WORDS, stats::VS_OPS_PACKETS),
            2000
        );
    }
}

/// Disabled reals take no new sessions.
#[test]
fn disabled_reals_receive_nothing() {
    let h = harness();
    let data = build(
        &h,
        &[tcp_vs(vec![
            real_spec(&REAL0, 1, RealFlags::DISABLED),
            real_spec(&REAL1, 1, RealFlags::empty()),
        ])],
    );
    let config = unsafe { BalancerConfig::from_module_data(data) };

    for sport in 0..50u16 {
        let frame = v4_frame(
            &CLIENT,
            &VIP,
            proto::TCP,
            tcp_segment(2000 + sport, 80, tcp::FLAG_SYN, &[]),
        );
        let mut front = run_one(config, &frame, 100);
        assert_eq!(front.output.len(), 1);
        assert_eq!(ipv4::dst(front.output.pop().unwrap().network()), REAL1);
    }
}

/// Session-table overflow drops the packet and counts it.
#[test]
fn overflow_is_counted() {
    let h = harness();
    let mut vs = tcp_vs(vec![real_spec(&REAL0, 1, RealFlags::empty())]);
    vs.flags = VsFlags::empty();
    let data = unsafe {
        balancer_config_create(
            h.agent,
            0,
            "lb0",
            1,
            // Capacity 1: a single bucket with a single entry.
            1,
            SessionTimeouts::default(),
            &[vs],
        )
        .unwrap()
    };
    let config = unsafe { BalancerConfig::from_module_data(data) };

    let mut drops = 0;
    for sport in 0..8u16 {
        let frame = v4_frame(
            &CLIENT,
            &VIP,
            proto::TCP,
            tcp_segment(3000 + sport, 80, tcp::FLAG_SYN, &[]),
        );
        let front = run_one(config, &frame, 100);
        drops += front.drop.len();
    }
    assert!(drops > 0);

    unsafe {
        let storage = (*config).counter_storage.load();
        let vs = &*(*config).vs(0);
        assert_eq!(
            stats::read(storage, vs.counter, stats::VS_WORDS, stats::VS_SESSION_TABLE_OVERFLOW),
            drops as u64
        );
    }
}

/// GRE services wrap the tunnel in a plain GRE header that decap
/// understands.
#[test]
fn gre_encapsulation_round_trips() {
    let h = harness();
    let mut vs = tcp_vs(vec![real_spec(&REAL0, 1, RealFlags::empty())]);
    vs.flags = VsFlags::GRE;
    let data = build(&h, &[vs]);
    let config = unsafe { BalancerConfig::from_module_data(data) };

    let frame = v4_frame(&CLIENT, &VIP, proto::TCP, tcp_segment(1000, 80, tcp::FLAG_SYN, &[]));
    let original = parsed(&frame);
    let original_bytes = original.mbuf().data().to_vec();

    let mut front = run_one(config, &frame, 100);
    let mut out = front.output.pop().unwrap();

    let outer = out.network();
    assert_eq!(ipv4::protocol(outer), proto::GRE);
    let gre_hdr = &outer[ipv4::MIN_LEN..];
    assert_eq!(gre::flags_version(gre_hdr), 0);
    assert_eq!(gre::protocol(gre_hdr), ether::TYPE_IPV4);

    // Receiving side: transport metadata points at the GRE header.
    out.transport_header.proto = proto::GRE;
    out.transport_header.offset = out.network_header.offset + ipv4::MIN_LEN as u16;
    packet_decap(&mut out).unwrap();
    assert_eq!(out.mbuf().data(), &original_bytes[..]);
}

/// MSS clamping on IPv6 SYNs: an oversized option is clamped in place.
#[test]
fn mss_clamp_rewrites_option() {
    let mut addr6 = [0u8; 16];
    addr6[0] = 0x20;
    addr6[15] = 1;
    let mut dst6 = addr6;
    dst6[15] = 2;

    // SYN with a 1460 MSS option.
    let mut segment = vec![0u8; 24];
    segment[..20].copy_from_slice(&tcp_segment(1000, 80, tcp::FLAG_SYN, &[])[..20]);
    tcp::set_data_offset(&mut segment, 6);
    segment[20] = tcp::OPT_MSS;
    segment[21] = 4;
    segment[22..24].copy_from_slice(&1460u16.to_be_bytes());

    let frame = v6_frame(&addr6, &dst6, proto::TCP, segment);
    let mut packet = parsed(&frame);
    assert!(slipstream_dataplane::testutil::l4_checksum_ok(&packet));

    fix_mss_ipv6(&mut packet);

    let l4 = packet.transport();
    assert_eq!(u16::from_be_bytes([l4[22], l4[23]]), 1220);
    assert!(slipstream_dataplane::testutil::l4_checksum_ok(&packet));
}

/// MSS insertion when the SYN has no options at all.
#[test]
fn mss_clamp_inserts_option() {
    let mut addr6 = [0u8; 16];
    addr6[0] = 0x20;
    addr6[15] = 1;
    let mut dst6 = addr6;
    dst6[15] = 2;

    let frame = v6_frame(
        &addr6,
        &dst6,
        proto::TCP,
        tcp_segment(1000, 80, tcp::FLAG_SYN, &[]),
    );
    let mut packet = parsed(&frame);
    fix_mss_ipv6(&mut packet);

    let l4 = packet.transport();
    assert_eq!(tcp::data_offset(l4), 24);
    assert_eq!(l4[20], tcp::OPT_MSS);
    assert_eq!(u16::from_be_bytes([l4[22], l4[23]]), 536);
    let net = packet.network();
    assert_eq!(ipv6::payload_len(net), 24);
    assert!(slipstream_dataplane::testutil::l4_checksum_ok(&packet));
}

/// Sticky sessions survive a configuration publication that appends a
/// real, because the session table is shared and real indices are
/// append-only.
#[test]
fn sessions_survive_republication() {
    let h = harness();
    let data = build(&h, &[tcp_vs(vec![real_spec(&REAL0, 1, RealFlags::empty())])]);
    let config = unsafe { BalancerConfig::from_module_data(data) };

    let syn = v4_frame(&CLIENT, &VIP, proto::TCP, tcp_segment(1000, 80, tcp::FLAG_SYN, &[]));
    let mut front = run_one(config, &syn, 100);
    assert_eq!(ipv4::dst(front.output.pop().unwrap().network()), REAL0);

    // New configuration: one more real, same table.
    let table = unsafe { (*config).session_table.load() };
    let next_data = unsafe {
        balancer_config_create_shared(
            h.agent,
            0,
            "lb0",
            1,
            4096,
            SessionTimeouts::default(),
            &[tcp_vs(vec![
                real_spec(&REAL0, 1, RealFlags::empty()),
                real_spec(&REAL1, 8, RealFlags::empty()),
            ])],
            table,
        )
        .unwrap()
    };
    let next_config = unsafe { BalancerConfig::from_module_data(next_data) };

    // Mid-flow packet under the new configuration: still real 0.
    let ack = v4_frame(&CLIENT, &VIP, proto::TCP, tcp_segment(1000, 80, tcp::FLAG_ACK, &[]));
    let mut front = run_one(next_config, &ack, 101);
    assert_eq!(front.output.len(), 1);
    assert_eq!(ipv4::dst(front.output.pop().unwrap().network()), REAL0);
}
