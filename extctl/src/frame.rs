//! Wire format exchanged with the process simulator.
//!
//! One datagram per message, no header, no framing. Every field is an
//! IEEE-754 double in little-endian byte order.
//!
//! ```text
//! Command (controller → simulator), 48 bytes:
//! ┌──────────┬──────┬──────┬──────┬──────┬────────┐
//! │ seq_idx  │ z_uA │ z_uB │ w_uA │ w_uB │ E_ctrl │
//! └──────────┴──────┴──────┴──────┴──────┴────────┘
//!
//! Measurement (simulator → controller), 96 bytes:
//! ┌───────┬─────────┬───────┬─────┬───────┬─────┬──────┬─────┬────────┬────────┬────────┬────────┐
//! │ t_sim │ sim_idx │ p_c_r │ p_c │ p_stp │ q_p │ q_bl │ q_c │ z_cA_m │ z_cB_m │ w_cA_m │ w_cB_m │
//! └───────┴─────────┴───────┴─────┴───────┴─────┴──────┴─────┴────────┴────────┴────────┴────────┘
//! ```

use thiserror::Error;

/// Size of one encoded field.
pub const FIELD_SIZE: usize = 8;

/// Encoded size of a [`CommandFrame`].
pub const COMMAND_LEN: usize = CommandFrame::FIELDS * FIELD_SIZE;

/// Encoded size of a [`MeasurementFrame`].
pub const MEASUREMENT_LEN: usize = MeasurementFrame::FIELDS * FIELD_SIZE;

/// Errors from strict (exact-length) decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Datagram length differs from the fixed frame size.
    #[error("invalid frame length: expected {expected} bytes, got {actual}")]
    Length { expected: usize, actual: usize },
}

/// Writes `fields` back to back into `out`.
fn put_fields(fields: &[f64], out: &mut [u8]) {
    for (field, chunk) in fields.iter().zip(out.chunks_exact_mut(FIELD_SIZE)) {
        chunk.copy_from_slice(&field.to_le_bytes());
    }
}

/// Overwrites as many leading `fields` as `bytes` holds complete values for.
///
/// Returns the number of fields written. A trailing partial field and any
/// bytes past the last field are ignored.
fn take_fields(bytes: &[u8], fields: &mut [f64]) -> usize {
    let mut taken = 0;
    for (field, chunk) in fields.iter_mut().zip(bytes.chunks_exact(FIELD_SIZE)) {
        let mut arr = [0u8; FIELD_SIZE];
        arr.copy_from_slice(chunk);
        *field = f64::from_le_bytes(arr);
        taken += 1;
    }
    taken
}

const fn check_len(expected: usize, actual: usize) -> Result<(), FrameError> {
    if actual == expected {
        Ok(())
    } else {
        Err(FrameError::Length { expected, actual })
    }
}

/// Actuator targets sent to the simulator once per cycle.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CommandFrame {
    /// Echo of the last observed simulator index (0 after a reset).
    pub sequence_index: f64,
    /// Valve A opening target.
    pub z_ua: f64,
    /// Valve B opening target.
    pub z_ub: f64,
    /// Choke A opening target.
    pub w_ua: f64,
    /// Choke B opening target.
    pub w_ub: f64,
    /// Controller energy metric.
    pub e_ctrl: f64,
}

impl CommandFrame {
    /// Number of fields on the wire.
    pub const FIELDS: usize = 6;

    /// Fields in wire order.
    #[must_use]
    pub const fn to_fields(&self) -> [f64; Self::FIELDS] {
        [
            self.sequence_index,
            self.z_ua,
            self.z_ub,
            self.w_ua,
            self.w_ub,
            self.e_ctrl,
        ]
    }

    /// Builds a frame from fields in wire order.
    #[must_use]
    pub const fn from_fields(f: [f64; Self::FIELDS]) -> Self {
        Self {
            sequence_index: f[0],
            z_ua: f[1],
            z_ub: f[2],
            w_ua: f[3],
            w_ub: f[4],
            e_ctrl: f[5],
        }
    }

    /// Encodes into the fixed 48-byte wire form.
    #[must_use]
    pub fn encode(&self) -> [u8; COMMAND_LEN] {
        let mut out = [0u8; COMMAND_LEN];
        put_fields(&self.to_fields(), &mut out);
        out
    }

    /// Decodes an exact 48-byte datagram.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::Length`] if `bytes` is not exactly
    /// [`COMMAND_LEN`] long.
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        check_len(COMMAND_LEN, bytes.len())?;
        let mut fields = [0.0; Self::FIELDS];
        take_fields(bytes, &mut fields);
        Ok(Self::from_fields(fields))
    }
}

/// Process measurements received from the simulator once per cycle.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MeasurementFrame {
    /// Simulation time in seconds.
    pub t_sim: f64,
    /// Simulator step index.
    pub sim_idx: f64,
    /// Choke pressure reference.
    pub p_c_r: f64,
    /// Measured choke pressure.
    pub p_c: f64,
    pub p_stp: f64,
    /// Pump flow.
    pub q_p: f64,
    /// Bleed flow.
    pub q_bl: f64,
    /// Choke flow.
    pub q_c: f64,
    pub z_ca_m: f64,
    pub z_cb_m: f64,
    pub w_ca_m: f64,
    pub w_cb_m: f64,
}

impl MeasurementFrame {
    /// Number of fields on the wire.
    pub const FIELDS: usize = 12;

    /// Fields in wire order.
    #[must_use]
    pub const fn to_fields(&self) -> [f64; Self::FIELDS] {
        [
            self.t_sim,
            self.sim_idx,
            self.p_c_r,
            self.p_c,
            self.p_stp,
            self.q_p,
            self.q_bl,
            self.q_c,
            self.z_ca_m,
            self.z_cb_m,
            self.w_ca_m,
            self.w_cb_m,
        ]
    }

    /// Builds a frame from fields in wire order.
    #[must_use]
    pub const fn from_fields(f: [f64; Self::FIELDS]) -> Self {
        Self {
            t_sim: f[0],
            sim_idx: f[1],
            p_c_r: f[2],
            p_c: f[3],
            p_stp: f[4],
            q_p: f[5],
            q_bl: f[6],
            q_c: f[7],
            z_ca_m: f[8],
            z_cb_m: f[9],
            w_ca_m: f[10],
            w_cb_m: f[11],
        }
    }

    /// Encodes into the fixed 96-byte wire form.
    #[must_use]
    pub fn encode(&self) -> [u8; MEASUREMENT_LEN] {
        let mut out = [0u8; MEASUREMENT_LEN];
        put_fields(&self.to_fields(), &mut out);
        out
    }

    /// Decodes an exact 96-byte datagram.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::Length`] if `bytes` is not exactly
    /// [`MEASUREMENT_LEN`] long.
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        check_len(MEASUREMENT_LEN, bytes.len())?;
        let mut fields = [0.0; Self::FIELDS];
        take_fields(bytes, &mut fields);
        Ok(Self::from_fields(fields))
    }

    /// Updates this frame from a datagram of any length.
    ///
    /// Only complete leading fields present in `bytes` are overwritten;
    /// every other field keeps its current value. Returns the number of
    /// fields updated (0 for a datagram shorter than one field).
    pub fn merge_from(&mut self, bytes: &[u8]) -> usize {
        let mut fields = self.to_fields();
        let taken = take_fields(bytes, &mut fields);
        *self = Self::from_fields(fields);
        taken
    }
}
