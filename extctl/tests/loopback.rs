//! End-to-end tests of the harness against a fake simulator on loopback.
//!
//! The fake simulator is a plain blocking `std::net::UdpSocket`; the harness
//! runs its real transport handler and control loop on a separate thread.
//!
//! # Running with tracing
//!
//! ```bash
//! RUST_LOG=extctl=debug cargo test --test loopback -- --nocapture
//! ```

use std::net::UdpSocket;
use std::sync::{Arc, Once};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use extctl::config::{LoopConfig, TransportConfig};
use extctl::engine::{ControlLoop, LoopStats};
use extctl::frame::{COMMAND_LEN, CommandFrame, MeasurementFrame};
use extctl::law::ProportionalChoke;
use extctl::net::{Endpoint, PeerLink, UdpHandler};
use extctl::profile::WellProfile;

static INIT_TRACING: Once = Once::new();

fn init_test_tracing() {
    INIT_TRACING.call_once(|| {
        extctl::init_tracing();
    });
}

/// Fake simulator bound to an ephemeral localhost port.
struct Simulator {
    socket: UdpSocket,
    addr: Endpoint,
}

impl Simulator {
    fn bind() -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").expect("bind ephemeral");
        socket
            .set_read_timeout(Some(Duration::from_secs(2)))
            .expect("set read timeout");
        let addr = Endpoint::from(socket.local_addr().expect("local addr"));
        Self { socket, addr }
    }

    /// Blocks for the next command and the address it came from.
    fn recv_command(&self) -> (CommandFrame, Endpoint) {
        let mut buf = [0u8; 256];
        let (n, from) = self.socket.recv_from(&mut buf).expect("command within timeout");
        assert_eq!(n, COMMAND_LEN, "commands are always {COMMAND_LEN} bytes");
        (
            CommandFrame::decode(&buf[..n]).expect("decode command"),
            Endpoint::from(from),
        )
    }

    fn expect_silence(&self, within: Duration) {
        self.socket.set_read_timeout(Some(within)).expect("set read timeout");
        let mut buf = [0u8; 256];
        assert!(
            self.socket.recv_from(&mut buf).is_err(),
            "no datagram expected"
        );
        self.socket
            .set_read_timeout(Some(Duration::from_secs(2)))
            .expect("set read timeout");
    }

    fn reply(&self, to: Endpoint, m: &MeasurementFrame) {
        self.send_raw(to, &m.encode());
    }

    fn send_raw(&self, to: Endpoint, bytes: &[u8]) {
        self.socket
            .send_to(bytes, to.as_socket_addr())
            .expect("send reply");
    }
}

fn measurement(sim_idx: f64, p_c_r: f64, p_c: f64) -> MeasurementFrame {
    MeasurementFrame {
        t_sim: sim_idx * 0.01,
        sim_idx,
        p_c_r,
        p_c,
        ..MeasurementFrame::default()
    }
}

/// Starts a harness on an ephemeral port that sends to `peer`.
fn spawn_harness(
    peer: Endpoint,
    profile: WellProfile,
    control: LoopConfig,
) -> (Arc<UdpHandler>, JoinHandle<LoopStats>) {
    init_test_tracing();
    let transport = TransportConfig::default()
        .with_bind_addr(Endpoint::localhost(0))
        .with_shutdown_timeout(Duration::from_millis(500));
    let handler = Arc::new(UdpHandler::new(transport));
    let inbound = handler.start().expect("start transport");

    let link = PeerLink::new(Arc::clone(&handler), peer);
    let mut control = ControlLoop::new(
        control,
        profile,
        ProportionalChoke::default(),
        link,
        inbound,
    );
    let engine = thread::Builder::new()
        .name("test-engine".into())
        .spawn(move || control.run())
        .expect("spawn engine");
    (handler, engine)
}

#[test]
fn first_command_carries_the_well_initial_chokes() {
    let sim = Simulator::bind();
    let (handler, engine) = spawn_harness(sim.addr, WellProfile::BM01_LAND, LoopConfig::default());

    let (cmd, from) = sim.recv_command();
    assert_eq!(cmd.to_fields(), [0.0, 0.4356, 0.0, 0.0, 0.0, 0.0]);
    assert_eq!(Some(from), handler.local_addr());

    handler.stop();
    let stats = engine.join().expect("engine thread");
    assert_eq!(stats.commands_sent, 1);
    assert_eq!(stats.replies, 0);
}

#[test]
fn replies_drive_the_proportional_law() {
    let sim = Simulator::bind();
    let (handler, engine) = spawn_harness(sim.addr, WellProfile::BM01_LAND, LoopConfig::default());

    let (first, harness) = sim.recv_command();
    assert_eq!(first.sequence_index, 0.0);

    sim.reply(harness, &measurement(17.0, 2000.0, 1800.0));
    let (cmd, _) = sim.recv_command();
    assert_eq!(cmd.sequence_index, 17.0);
    assert!((cmd.w_ua - (-0.2)).abs() < 1e-12);
    assert_eq!(cmd.e_ctrl, 0.0);

    sim.reply(harness, &measurement(18.0, 2000.0, 2100.0));
    let (cmd, _) = sim.recv_command();
    assert_eq!(cmd.sequence_index, 18.0);
    assert!((cmd.w_ua - 0.1).abs() < 1e-12);

    handler.stop();
    let stats = engine.join().expect("engine thread");
    assert_eq!(stats.replies, 2);
    assert_eq!(stats.commands_sent, 3);
    assert_eq!(stats.resets, 0);
}

#[test]
fn one_cycle_per_reply_over_many_steps() {
    let sim = Simulator::bind();
    let (handler, engine) = spawn_harness(sim.addr, WellProfile::BM01_LAND, LoopConfig::default());

    let (_, harness) = sim.recv_command();
    for k in 1..=50u32 {
        let idx = f64::from(k);
        sim.reply(harness, &measurement(idx, 2000.0, 2000.0));
        let (cmd, _) = sim.recv_command();
        assert_eq!(cmd.sequence_index, idx);
    }

    handler.stop();
    let stats = engine.join().expect("engine thread");
    assert_eq!(stats.replies, 50);
    assert_eq!(stats.commands_sent, 51);
}

#[test]
fn silent_simulator_triggers_reset_and_resend() {
    let sim = Simulator::bind();
    let control = LoopConfig::default().with_reply_deadline(Duration::from_millis(150));
    let (handler, engine) = spawn_harness(sim.addr, WellProfile::BM02_DEEPWATER_MPD, control);

    // Progress the session once so the reset has something to discard.
    let (_, harness) = sim.recv_command();
    sim.reply(harness, &measurement(5.0, 2000.0, 1800.0));
    let (cmd, _) = sim.recv_command();
    assert_eq!(cmd.sequence_index, 5.0);

    // Ignore it: the watchdog resends the initial command.
    let (resent, _) = sim.recv_command();
    assert_eq!(resent.to_fields(), [0.0, 0.5871, 0.0, 0.0, 0.0, 0.0]);

    sim.reply(harness, &measurement(1.0, 2000.0, 2000.0));
    let (cmd, _) = sim.recv_command();
    assert_eq!(cmd.sequence_index, 1.0);

    handler.stop();
    let stats = engine.join().expect("engine thread");
    assert!(stats.resets >= 1);
    assert_eq!(stats.replies, 2);
}

#[test]
fn truncated_reply_still_completes_a_cycle() {
    let sim = Simulator::bind();
    let (handler, engine) = spawn_harness(sim.addr, WellProfile::BM01_LAND, LoopConfig::default());

    let (_, harness) = sim.recv_command();
    // t_sim and sim_idx only: the pressures keep their zero defaults.
    let full = measurement(9.0, 2000.0, 1800.0).encode();
    sim.send_raw(harness, &full[..20]);

    let (cmd, _) = sim.recv_command();
    assert_eq!(cmd.sequence_index, 9.0);
    assert_eq!(cmd.w_ua.abs(), 0.0);

    handler.stop();
    let stats = engine.join().expect("engine thread");
    assert_eq!(stats.short_replies, 1);
    assert_eq!(stats.replies, 1);
}

#[test]
fn empty_datagram_is_ignored() {
    let sim = Simulator::bind();
    let (handler, engine) = spawn_harness(sim.addr, WellProfile::BM01_LAND, LoopConfig::default());

    let (_, harness) = sim.recv_command();
    sim.send_raw(harness, &[0u8; 3]);
    sim.expect_silence(Duration::from_millis(200));

    sim.reply(harness, &measurement(2.0, 0.0, 0.0));
    let (cmd, _) = sim.recv_command();
    assert_eq!(cmd.sequence_index, 2.0);

    handler.stop();
    let stats = engine.join().expect("engine thread");
    assert_eq!(stats.discarded, 1);
    assert_eq!(stats.replies, 1);
}

#[test]
fn stopping_the_transport_ends_the_loop() {
    let sim = Simulator::bind();
    let (handler, engine) = spawn_harness(sim.addr, WellProfile::BM03_DEEPWATER_CML, LoopConfig::default());

    let _ = sim.recv_command();
    handler.stop();
    assert!(!handler.is_running());

    let stats = engine.join().expect("engine thread");
    assert_eq!(stats.commands_sent, 1);
    assert_eq!(stats.resets, 0);
}
