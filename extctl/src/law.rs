//! Pluggable control law.
//!
//! The engine calls [`ControlLaw::compute`] once per reply. Implementations
//! take `&self` only and must be pure: no I/O, no interior mutability, same
//! inputs give the same outputs. Any `Fn(&ProcessState) -> ActuatorTargets`
//! closure is a control law, so swapping the algorithm never touches the
//! engine or the transport.

use crate::frame::MeasurementFrame;
use crate::profile::WellProfile;

/// Measured process state handed to the control law.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ProcessState {
    /// Simulation time in seconds.
    pub time: f64,
    /// Choke pressure setpoint (`p_c_r`).
    pub pressure_setpoint: f64,
    /// Measured choke pressure (`p_c`).
    pub pressure_measured: f64,
    /// `p_stp` channel.
    pub stroke_setpoint: f64,
    pub pump_flow: f64,
    pub bleed_flow: f64,
    pub choke_flow: f64,
    pub valve_a: f64,
    pub valve_b: f64,
    pub choke_a: f64,
    pub choke_b: f64,
}

impl From<&MeasurementFrame> for ProcessState {
    fn from(m: &MeasurementFrame) -> Self {
        Self {
            time: m.t_sim,
            pressure_setpoint: m.p_c_r,
            pressure_measured: m.p_c,
            stroke_setpoint: m.p_stp,
            pump_flow: m.q_p,
            bleed_flow: m.q_bl,
            choke_flow: m.q_c,
            valve_a: m.z_ca_m,
            valve_b: m.z_cb_m,
            choke_a: m.w_ca_m,
            choke_b: m.w_cb_m,
        }
    }
}

/// Actuator targets produced by the control law.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ActuatorTargets {
    pub valve_a: f64,
    pub valve_b: f64,
    pub choke_a: f64,
    pub choke_b: f64,
    /// Energy metric reported back to the simulator.
    pub energy: f64,
}

impl ActuatorTargets {
    /// Targets at a profile's initial condition: valves at the profile's
    /// openings, chokes and energy zeroed.
    #[must_use]
    pub const fn initial(profile: &WellProfile) -> Self {
        Self {
            valve_a: profile.z_ca0,
            valve_b: profile.z_cb0,
            choke_a: 0.0,
            choke_b: 0.0,
            energy: 0.0,
        }
    }
}

/// Maps measured process state to actuator targets.
pub trait ControlLaw {
    fn compute(&self, state: &ProcessState) -> ActuatorTargets;
}

impl<F> ControlLaw for F
where
    F: Fn(&ProcessState) -> ActuatorTargets,
{
    #[inline]
    fn compute(&self, state: &ProcessState) -> ActuatorTargets {
        self(state)
    }
}

/// Reference law: proportional choke A on pressure error, everything else
/// passed through from the measurements.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProportionalChoke {
    /// Proportional gain applied to `p_c_r - p_c`.
    pub gain: f64,
}

impl ProportionalChoke {
    pub const DEFAULT_GAIN: f64 = -0.001;
}

impl Default for ProportionalChoke {
    fn default() -> Self {
        Self {
            gain: Self::DEFAULT_GAIN,
        }
    }
}

impl ControlLaw for ProportionalChoke {
    fn compute(&self, s: &ProcessState) -> ActuatorTargets {
        ActuatorTargets {
            valve_a: s.valve_a,
            valve_b: s.valve_b,
            choke_a: self.gain * (s.pressure_setpoint - s.pressure_measured),
            choke_b: s.choke_b,
            energy: 0.0,
        }
    }
}
