//! Harness configuration.
//!
//! Everything is static: one simulator peer, one local receive port, one
//! reply deadline. Nothing is negotiated on the wire.

use std::time::Duration;

use crate::net::Endpoint;
use crate::topology::CpuConfig;
use crate::watchdog::DEFAULT_REPLY_DEADLINE;

/// Simulator "in" port: where commands are sent.
pub const DEFAULT_PEER_PORT: u16 = 65000;

/// Simulator "out" port: where the harness listens for measurements.
pub const DEFAULT_BIND_PORT: u16 = 65007;

/// Receive path settings.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Local address the receive socket binds to.
    pub bind_addr: Endpoint,
    /// Kernel receive buffer size requested at startup.
    ///
    /// **Default**: 1 MiB
    pub recv_buffer_size: usize,
    /// Upper bound on how long `stop()` waits for the receive worker.
    ///
    /// **Default**: 2000ms
    pub shutdown_timeout: Duration,
    /// Datagrams buffered between the receive worker and the engine.
    ///
    /// **Default**: 1024
    pub inbound_capacity: usize,
    /// Core to pin the receive worker to.
    pub rx_core: Option<usize>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            bind_addr: Endpoint::any(DEFAULT_BIND_PORT),
            recv_buffer_size: 1024 * 1024,
            shutdown_timeout: Duration::from_millis(2000),
            inbound_capacity: 1024,
            rx_core: None,
        }
    }
}

impl TransportConfig {
    #[must_use]
    pub const fn with_bind_addr(mut self, addr: Endpoint) -> Self {
        self.bind_addr = addr;
        self
    }

    #[must_use]
    pub const fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// # Panics
    ///
    /// Panics if `capacity == 0`.
    #[must_use]
    pub const fn with_inbound_capacity(mut self, capacity: usize) -> Self {
        assert!(capacity > 0, "inbound_capacity must be > 0");
        self.inbound_capacity = capacity;
        self
    }

    #[must_use]
    pub const fn with_rx_core(mut self, core: Option<usize>) -> Self {
        self.rx_core = core;
        self
    }
}

/// Control loop settings.
#[derive(Debug, Clone, Copy)]
pub struct LoopConfig {
    /// Time without a reply before the session is reset.
    ///
    /// **Default**: 5000ms
    pub reply_deadline: Duration,
    /// Emit a telemetry snapshot when `sim_idx` is a multiple of this.
    /// Zero disables snapshots.
    ///
    /// **Default**: 1000
    pub snapshot_every: u64,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            reply_deadline: DEFAULT_REPLY_DEADLINE,
            snapshot_every: 1000,
        }
    }
}

impl LoopConfig {
    /// # Panics
    ///
    /// Panics if `deadline` is zero.
    #[must_use]
    pub const fn with_reply_deadline(mut self, deadline: Duration) -> Self {
        assert!(!deadline.is_zero(), "reply_deadline must be > 0");
        self.reply_deadline = deadline;
        self
    }

    #[must_use]
    pub const fn with_snapshot_every(mut self, every: u64) -> Self {
        self.snapshot_every = every;
        self
    }
}

/// Complete harness configuration.
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    /// Simulator endpoint commands are sent to.
    pub peer: Endpoint,
    pub transport: TransportConfig,
    pub control: LoopConfig,
    pub cpu: CpuConfig,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            peer: Endpoint::localhost(DEFAULT_PEER_PORT),
            transport: TransportConfig::default(),
            control: LoopConfig::default(),
            cpu: CpuConfig::Disabled,
        }
    }
}

impl HarnessConfig {
    #[must_use]
    pub const fn with_peer(mut self, peer: Endpoint) -> Self {
        self.peer = peer;
        self
    }

    #[must_use]
    pub const fn with_transport(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }

    #[must_use]
    pub const fn with_control(mut self, control: LoopConfig) -> Self {
        self.control = control;
        self
    }

    #[must_use]
    pub const fn with_cpu(mut self, cpu: CpuConfig) -> Self {
        self.cpu = cpu;
        self
    }
}
