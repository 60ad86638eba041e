//! Control loop engine.
//!
//! Drives the strictly synchronous command/measurement exchange with the
//! simulator. Exactly one command is outstanding at any time.
//!
//! # State machine
//!
//! ```text
//!                ┌──────────── reply ─────────────┐
//!                ▼                                 │
//!   start ──► Sending ──── send + arm ────► AwaitingReply
//!                                              │     ▲
//!                                   deadline   │     │ resend + re-arm
//!                                              ▼     │
//!                                              Reset ┘
//! ```
//!
//! - **Sending**: drop stale datagrams, encode [`LoopState`] as a
//!   [`CommandFrame`], send it, arm the watchdog.
//! - **AwaitingReply**: timed wait on the inbound channel, bounded by the
//!   watchdog's remaining time. A reply is decoded, handed to the
//!   [`ControlLaw`], and its output becomes the next [`LoopState`].
//! - **Reset**: the deadline passed without a reply. The state returns to
//!   the well profile's initial condition with sequence index 0, the reset
//!   command goes out immediately and the deadline restarts from that
//!   send. One reset per expiry.

use std::time::Duration;

use crossbeam::channel::{Receiver, RecvTimeoutError};
use minstant::Instant;
use thiserror::Error;

use crate::config::LoopConfig;
use crate::frame::{CommandFrame, MeasurementFrame};
use crate::law::{ActuatorTargets, ControlLaw, ProcessState};
use crate::net::Datagram;
use crate::profile::WellProfile;
use crate::trace::{debug, info, trace, warn};
use crate::watchdog::Watchdog;

/// Outbound half of the loop: delivers one encoded command to the
/// simulator. Returns `false` on failure; the loop carries on and the
/// watchdog recovers the session if the command never arrived.
pub trait CommandLink {
    fn send_command(&self, bytes: &[u8]) -> bool;
}

/// Receives loop events. Implementations decide formatting and
/// destination; the engine only decides when to emit.
pub trait Telemetry {
    fn on_snapshot(&mut self, _snapshot: &Snapshot) {}
    fn on_reset(&mut self, _notice: &ResetNotice) {}
}

/// Telemetry sink that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullTelemetry;

impl Telemetry for NullTelemetry {}

/// Periodic process snapshot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Snapshot {
    pub sim_idx: u64,
    pub t_sim: f64,
    pub p_c: f64,
    pub p_c_r: f64,
}

/// Emitted when the watchdog resets the session.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResetNotice {
    /// Resets so far, this one included.
    pub resets: u64,
    /// Time since the unanswered send.
    pub waited: Duration,
    pub profile: WellProfile,
}

/// Engine phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Sending,
    AwaitingReply,
    Reset,
}

/// Outcome of one [`ControlLoop::step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cycle {
    /// A command went out (or was attempted) and the watchdog is armed.
    Sent { sequence_index: u64 },
    /// A reply was processed; the next step sends.
    Completed { sim_idx: u64 },
    /// The deadline expired; the reset command was resent.
    Reset { resets: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LoopError {
    /// The transport stopped; no reply can ever arrive.
    #[error("inbound channel disconnected")]
    Disconnected,
}

/// Per-cycle mutable state of the loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoopState {
    pub targets: ActuatorTargets,
    /// Last observed simulator index, echoed in the next command.
    pub sequence_index: u64,
    pub profile: WellProfile,
}

impl LoopState {
    /// State at the profile's initial condition.
    #[must_use]
    pub const fn seeded(profile: WellProfile) -> Self {
        Self {
            targets: ActuatorTargets::initial(&profile),
            sequence_index: 0,
            profile,
        }
    }

    /// Returns to the profile's initial condition.
    pub fn reset(&mut self) {
        *self = Self::seeded(self.profile);
    }

    /// Command frame carrying this state.
    #[must_use]
    pub fn command(&self) -> CommandFrame {
        CommandFrame {
            sequence_index: self.sequence_index as f64,
            z_ua: self.targets.valve_a,
            z_ub: self.targets.valve_b,
            w_ua: self.targets.choke_a,
            w_ub: self.targets.choke_b,
            e_ctrl: self.targets.energy,
        }
    }
}

/// Loop counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub commands_sent: u64,
    pub send_failures: u64,
    pub replies: u64,
    /// Replies with fewer than the full set of fields.
    pub short_replies: u64,
    /// Datagrams too short to hold a single field.
    pub discarded: u64,
    /// Datagrams already queued when a new command went out.
    pub stale: u64,
    pub resets: u64,
}

/// Simulator index from its wire representation.
fn sim_index(raw: f64) -> u64 {
    // Saturating cast: NaN and negatives map to 0.
    raw.round() as u64
}

/// The control loop engine.
pub struct ControlLoop<L, O, T = NullTelemetry> {
    law: L,
    link: O,
    inbound: Receiver<Datagram>,
    telemetry: T,
    state: LoopState,
    /// Last decoded measurement; short replies only overwrite what they carry.
    measurement: MeasurementFrame,
    phase: Phase,
    watchdog: Watchdog,
    snapshot_every: u64,
    stats: LoopStats,
}

impl<L: ControlLaw, O: CommandLink> ControlLoop<L, O> {
    #[must_use]
    pub fn new(
        config: LoopConfig,
        profile: WellProfile,
        law: L,
        link: O,
        inbound: Receiver<Datagram>,
    ) -> Self {
        Self {
            law,
            link,
            inbound,
            telemetry: NullTelemetry,
            state: LoopState::seeded(profile),
            measurement: MeasurementFrame::default(),
            phase: Phase::Sending,
            watchdog: Watchdog::new(config.reply_deadline),
            snapshot_every: config.snapshot_every,
            stats: LoopStats::default(),
        }
    }
}

impl<L: ControlLaw, O: CommandLink, T: Telemetry> ControlLoop<L, O, T> {
    /// Replaces the telemetry sink.
    #[must_use]
    pub fn with_telemetry<U: Telemetry>(self, telemetry: U) -> ControlLoop<L, O, U> {
        ControlLoop {
            law: self.law,
            link: self.link,
            inbound: self.inbound,
            telemetry,
            state: self.state,
            measurement: self.measurement,
            phase: self.phase,
            watchdog: self.watchdog,
            snapshot_every: self.snapshot_every,
            stats: self.stats,
        }
    }

    #[must_use]
    pub const fn phase(&self) -> Phase {
        self.phase
    }

    #[must_use]
    pub const fn state(&self) -> &LoopState {
        &self.state
    }

    #[must_use]
    pub const fn stats(&self) -> &LoopStats {
        &self.stats
    }

    #[must_use]
    pub const fn measurement(&self) -> &MeasurementFrame {
        &self.measurement
    }

    #[must_use]
    pub const fn link(&self) -> &O {
        &self.link
    }

    #[must_use]
    pub const fn telemetry(&self) -> &T {
        &self.telemetry
    }

    /// Performs one state transition.
    ///
    /// # Errors
    ///
    /// Returns [`LoopError::Disconnected`] once the transport has stopped.
    pub fn step(&mut self) -> Result<Cycle, LoopError> {
        match self.phase {
            Phase::Sending => {
                self.drain_stale();
                self.send_command(Instant::now());
                self.phase = Phase::AwaitingReply;
                Ok(Cycle::Sent {
                    sequence_index: self.state.sequence_index,
                })
            }
            Phase::AwaitingReply => self.await_reply(),
            Phase::Reset => Ok(self.reset_and_resend()),
        }
    }

    /// Steps until the transport stops, then returns the final counters.
    pub fn run(&mut self) -> LoopStats {
        info!(
            profile = %self.state.profile,
            deadline_ms = self.watchdog.deadline().as_millis() as u64,
            "control loop running"
        );
        loop {
            if let Err(_e) = self.step() {
                info!(reason = %_e, stats = ?self.stats, "control loop finished");
                return self.stats;
            }
        }
    }

    /// Clears any reply that arrived for an earlier command.
    fn drain_stale(&mut self) {
        while let Ok(_dg) = self.inbound.try_recv() {
            self.stats.stale += 1;
            debug!(from = %_dg.from, len = _dg.payload.len(), "dropping stale datagram");
        }
    }

    fn send_command(&mut self, now: Instant) {
        let bytes = self.state.command().encode();
        if self.link.send_command(&bytes) {
            self.stats.commands_sent += 1;
            trace!(sequence_index = self.state.sequence_index, "command sent");
        } else {
            self.stats.send_failures += 1;
        }
        // Armed even after a failed send: the watchdog is what recovers.
        self.watchdog.arm(now);
    }

    fn await_reply(&mut self) -> Result<Cycle, LoopError> {
        loop {
            let Some(remaining) = self.watchdog.remaining(Instant::now()) else {
                // Awaiting without an armed deadline cannot happen through
                // `step`; treat it as a fresh send.
                self.phase = Phase::Sending;
                return self.step();
            };
            if remaining.is_zero() {
                self.phase = Phase::Reset;
                return Ok(self.reset_and_resend());
            }

            match self.inbound.recv_timeout(remaining) {
                Ok(datagram) => {
                    if let Some(cycle) = self.absorb(&datagram) {
                        return Ok(cycle);
                    }
                }
                // Loop back and re-sample the clock.
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return Err(LoopError::Disconnected),
            }
        }
    }

    /// Decodes a reply and runs the control law. `None` if the datagram
    /// carried no complete field and so is not a reply.
    fn absorb(&mut self, datagram: &Datagram) -> Option<Cycle> {
        let fields = self.measurement.merge_from(&datagram.payload);
        if fields == 0 {
            self.stats.discarded += 1;
            debug!(from = %datagram.from, len = datagram.payload.len(), "ignoring empty datagram");
            return None;
        }
        if fields < MeasurementFrame::FIELDS {
            self.stats.short_replies += 1;
            warn!(
                from = %datagram.from,
                len = datagram.payload.len(),
                fields,
                "short measurement, keeping previous values for missing fields"
            );
        }

        self.watchdog.disarm();
        self.stats.replies += 1;

        let sim_idx = sim_index(self.measurement.sim_idx);
        if self.snapshot_every > 0 && sim_idx % self.snapshot_every == 0 {
            self.telemetry.on_snapshot(&Snapshot {
                sim_idx,
                t_sim: self.measurement.t_sim,
                p_c: self.measurement.p_c,
                p_c_r: self.measurement.p_c_r,
            });
        }

        let process = ProcessState::from(&self.measurement);
        self.state.targets = self.law.compute(&process);
        self.state.sequence_index = sim_idx;
        self.phase = Phase::Sending;
        Some(Cycle::Completed { sim_idx })
    }

    fn reset_and_resend(&mut self) -> Cycle {
        let now = Instant::now();
        let waited = self.watchdog.elapsed(now).unwrap_or_default();
        self.stats.resets += 1;

        warn!(
            waited_ms = waited.as_millis() as u64,
            resets = self.stats.resets,
            "no reply within deadline, initiating new control test (index 0)"
        );
        self.telemetry.on_reset(&ResetNotice {
            resets: self.stats.resets,
            waited,
            profile: self.state.profile,
        });

        self.state.reset();
        self.send_command(now);
        self.phase = Phase::AwaitingReply;
        Cycle::Reset {
            resets: self.stats.resets,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use crossbeam::channel::{self, Sender};

    use super::*;
    use crate::law::ProportionalChoke;
    use crate::net::Endpoint;

    #[derive(Default)]
    struct RecordingLink {
        sent: RefCell<Vec<CommandFrame>>,
        fail: bool,
    }

    impl RecordingLink {
        fn frames(&self) -> Vec<CommandFrame> {
            self.sent.borrow().clone()
        }
    }

    impl CommandLink for RecordingLink {
        fn send_command(&self, bytes: &[u8]) -> bool {
            self.sent
                .borrow_mut()
                .push(CommandFrame::decode(bytes).unwrap());
            !self.fail
        }
    }

    #[derive(Default)]
    struct Recorder {
        snapshots: Vec<Snapshot>,
        resets: Vec<ResetNotice>,
    }

    impl Telemetry for Recorder {
        fn on_snapshot(&mut self, snapshot: &Snapshot) {
            self.snapshots.push(*snapshot);
        }
        fn on_reset(&mut self, notice: &ResetNotice) {
            self.resets.push(*notice);
        }
    }

    const DEADLINE: Duration = Duration::from_millis(40);

    type TestLoop = ControlLoop<ProportionalChoke, RecordingLink, Recorder>;

    fn engine(profile: WellProfile) -> (TestLoop, Sender<Datagram>) {
        let (tx, rx) = channel::bounded(64);
        let cfg = LoopConfig::default().with_reply_deadline(DEADLINE);
        let engine = ControlLoop::new(
            cfg,
            profile,
            ProportionalChoke::default(),
            RecordingLink::default(),
            rx,
        )
        .with_telemetry(Recorder::default());
        (engine, tx)
    }

    fn reply(m: &MeasurementFrame) -> Datagram {
        Datagram {
            payload: m.encode().to_vec(),
            from: Endpoint::localhost(65000),
        }
    }

    fn measurement(sim_idx: f64, p_c_r: f64, p_c: f64) -> MeasurementFrame {
        MeasurementFrame {
            t_sim: sim_idx * 0.01,
            sim_idx,
            p_c_r,
            p_c,
            z_ca_m: 0.43,
            z_cb_m: 0.01,
            w_ca_m: 0.3,
            w_cb_m: 0.25,
            ..MeasurementFrame::default()
        }
    }

    #[test]
    fn first_command_carries_profile_initial_condition() {
        let (mut engine, _tx) = engine(WellProfile::BM01_LAND);
        assert_eq!(engine.phase(), Phase::Sending);

        assert_eq!(engine.step(), Ok(Cycle::Sent { sequence_index: 0 }));
        assert_eq!(engine.phase(), Phase::AwaitingReply);
        assert_eq!(
            engine.link().frames()[0].to_fields(),
            [0.0, 0.4356, 0.0, 0.0, 0.0, 0.0]
        );
    }

    #[test]
    fn reply_before_deadline_applies_control_law() {
        let (mut engine, tx) = engine(WellProfile::BM01_LAND);
        engine.step().unwrap();

        tx.send(reply(&measurement(17.0, 2000.0, 1800.0))).unwrap();
        assert_eq!(engine.step(), Ok(Cycle::Completed { sim_idx: 17 }));
        assert_eq!(engine.phase(), Phase::Sending);

        engine.step().unwrap();
        let next = engine.link().frames()[1];
        assert_eq!(next.sequence_index, 17.0);
        assert!((next.w_ua - -0.2).abs() < 1e-12);
        assert_eq!(next.z_ua, 0.43);
        assert_eq!(next.z_ub, 0.01);
        assert_eq!(next.w_ub, 0.25);
        assert_eq!(next.e_ctrl, 0.0);
        assert_eq!(engine.stats().resets, 0);
    }

    #[test]
    fn each_expiry_resets_and_resends_once() {
        let (mut engine, _tx) = engine(WellProfile::BM02_DEEPWATER_MPD);
        engine.step().unwrap();

        let t0 = std::time::Instant::now();
        assert_eq!(engine.step(), Ok(Cycle::Reset { resets: 1 }));
        assert!(t0.elapsed() >= DEADLINE - Duration::from_millis(5));
        assert_eq!(engine.phase(), Phase::AwaitingReply);
        assert_eq!(engine.link().frames().len(), 2);

        assert_eq!(engine.step(), Ok(Cycle::Reset { resets: 2 }));
        let frames = engine.link().frames();
        assert_eq!(frames.len(), 3);
        for f in &frames[1..] {
            assert_eq!(f.to_fields(), [0.0, 0.5871, 0.0, 0.0, 0.0, 0.0]);
        }
        assert_eq!(engine.telemetry().resets.len(), 2);
        assert_eq!(engine.telemetry().resets[1].resets, 2);
    }

    #[test]
    fn reset_discards_progress() {
        let (mut engine, tx) = engine(WellProfile::BM01_LAND);
        engine.step().unwrap();
        tx.send(reply(&measurement(4242.0, 2000.0, 1500.0))).unwrap();
        engine.step().unwrap();
        engine.step().unwrap();
        assert_eq!(engine.state().sequence_index, 4242);

        assert_eq!(engine.step(), Ok(Cycle::Reset { resets: 1 }));
        assert_eq!(*engine.state(), LoopState::seeded(WellProfile::BM01_LAND));
        let last = *engine.link().frames().last().unwrap();
        assert_eq!(last, LoopState::seeded(WellProfile::BM01_LAND).command());
    }

    #[test]
    fn reply_after_reset_resumes_loop() {
        let (mut engine, tx) = engine(WellProfile::BM01_LAND);
        engine.step().unwrap();
        assert!(matches!(engine.step(), Ok(Cycle::Reset { .. })));

        tx.send(reply(&measurement(1.0, 10.0, 10.0))).unwrap();
        assert_eq!(engine.step(), Ok(Cycle::Completed { sim_idx: 1 }));
        assert_eq!(engine.step(), Ok(Cycle::Sent { sequence_index: 1 }));
    }

    #[test]
    fn stale_datagrams_are_cleared_before_send() {
        let (mut engine, tx) = engine(WellProfile::BM01_LAND);
        tx.send(reply(&measurement(99.0, 0.0, 0.0))).unwrap();

        engine.step().unwrap();
        assert_eq!(engine.stats().stale, 1);
        assert!(matches!(engine.step(), Ok(Cycle::Reset { .. })));
    }

    #[test]
    fn empty_datagram_is_not_a_reply() {
        let (mut engine, tx) = engine(WellProfile::BM01_LAND);
        engine.step().unwrap();
        tx.send(Datagram {
            payload: vec![0xab; 5],
            from: Endpoint::localhost(65000),
        })
        .unwrap();

        assert!(matches!(engine.step(), Ok(Cycle::Reset { .. })));
        assert_eq!(engine.stats().discarded, 1);
        assert_eq!(engine.stats().replies, 0);
    }

    #[test]
    fn short_reply_keeps_previous_fields() {
        let (mut engine, tx) = engine(WellProfile::BM01_LAND);
        engine.step().unwrap();
        tx.send(reply(&measurement(5.0, 2000.0, 1800.0))).unwrap();
        engine.step().unwrap();
        engine.step().unwrap();

        // Only t_sim and sim_idx.
        let partial = measurement(6.0, 0.0, 0.0).encode()[..16].to_vec();
        tx.send(Datagram {
            payload: partial,
            from: Endpoint::localhost(65000),
        })
        .unwrap();
        assert_eq!(engine.step(), Ok(Cycle::Completed { sim_idx: 6 }));
        assert_eq!(engine.measurement().p_c_r, 2000.0);
        assert_eq!(engine.measurement().p_c, 1800.0);
        assert_eq!(engine.stats().short_replies, 1);
        assert!((engine.state().targets.choke_a - -0.2).abs() < 1e-12);
    }

    #[test]
    fn snapshot_every_thousandth_index() {
        let (mut engine, tx) = engine(WellProfile::BM01_LAND);
        for idx in [999.0, 1000.0, 1001.0, 2000.0] {
            engine.step().unwrap();
            tx.send(reply(&measurement(idx, 2000.0, 1800.0))).unwrap();
            engine.step().unwrap();
        }
        let snaps = &engine.telemetry().snapshots;
        assert_eq!(
            snaps.iter().map(|s| s.sim_idx).collect::<Vec<_>>(),
            vec![1000, 2000]
        );
        assert_eq!(snaps[0].p_c_r, 2000.0);
        assert_eq!(snaps[0].p_c, 1800.0);
        assert!((snaps[0].t_sim - 10.0).abs() < 1e-9);
    }

    #[test]
    fn send_failure_is_recovered_by_watchdog() {
        let (tx, rx) = channel::bounded(4);
        let link = RecordingLink {
            fail: true,
            ..RecordingLink::default()
        };
        let cfg = LoopConfig::default().with_reply_deadline(DEADLINE);
        let mut engine =
            ControlLoop::new(cfg, WellProfile::BM01_LAND, ProportionalChoke::default(), link, rx);

        engine.step().unwrap();
        assert_eq!(engine.stats().send_failures, 1);
        assert!(matches!(engine.step(), Ok(Cycle::Reset { .. })));
        assert_eq!(engine.stats().send_failures, 2);
        drop(tx);
    }

    #[test]
    fn run_ends_when_transport_disconnects() {
        let (mut engine, tx) = engine(WellProfile::BM01_LAND);
        engine.step().unwrap();
        tx.send(reply(&measurement(1.0, 1.0, 1.0))).unwrap();
        drop(tx);

        let stats = engine.run();
        assert_eq!(stats.replies, 1);
        assert_eq!(stats.commands_sent, 2);
        assert_eq!(engine.step(), Err(LoopError::Disconnected));
    }

    #[test]
    fn nan_and_negative_indices_map_to_zero() {
        assert_eq!(sim_index(f64::NAN), 0);
        assert_eq!(sim_index(-3.0), 0);
        assert_eq!(sim_index(41.6), 42);
    }
}
