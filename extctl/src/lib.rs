//! External controller harness for hardware-in-the-loop testing.
//!
//! Runs a process-control algorithm against a physical-process simulator
//! over UDP: send actuator targets, wait for the next measurement, compute
//! new targets, repeat. A watchdog resets the session whenever the
//! simulator stops answering.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use extctl::config::HarnessConfig;
//! use extctl::engine::ControlLoop;
//! use extctl::law::ProportionalChoke;
//! use extctl::net::{PeerLink, UdpHandler};
//! use extctl::profile::WellProfile;
//!
//! # fn main() -> Result<(), extctl::net::TransportError> {
//! let config = HarnessConfig::default();
//! let handler = Arc::new(UdpHandler::new(config.transport.clone()));
//! let inbound = handler.start()?;
//!
//! let link = PeerLink::new(Arc::clone(&handler), config.peer);
//! let mut control = ControlLoop::new(
//!     config.control,
//!     WellProfile::BM01_LAND,
//!     ProportionalChoke::default(),
//!     link,
//!     inbound,
//! );
//! let stats = control.run();
//! # let _ = stats;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod engine;
pub mod frame;
pub mod law;
pub mod net;
pub mod profile;
pub mod topology;
pub mod watchdog;

mod trace;

pub use trace::init_tracing;
