//! Addresses of the harness and the simulator.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;

use thiserror::Error;

/// Error parsing an [`Endpoint`] from text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid endpoint {0:?}: expected IP:PORT or PORT")]
pub struct EndpointParseError(pub String);

/// A UDP peer address.
///
/// Parsing accepts a full socket address (`10.0.0.5:65000`, `[::1]:65000`)
/// or a bare port, which means localhost since the simulator usually runs on
/// the same machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint(SocketAddr);

impl Endpoint {
    /// All interfaces on `port`.
    #[must_use]
    pub const fn any(port: u16) -> Self {
        Self(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port))
    }

    /// `127.0.0.1:port`.
    #[must_use]
    pub const fn localhost(port: u16) -> Self {
        Self(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port))
    }

    #[must_use]
    pub const fn ip(&self) -> IpAddr {
        self.0.ip()
    }

    #[must_use]
    pub const fn port(&self) -> u16 {
        self.0.port()
    }

    /// Same address, different port.
    #[must_use]
    pub const fn with_port(mut self, port: u16) -> Self {
        self.0.set_port(port);
        self
    }

    /// True for a wildcard bind address (`0.0.0.0` or `::`).
    #[must_use]
    pub fn is_wildcard(&self) -> bool {
        self.0.ip().is_unspecified()
    }

    #[must_use]
    pub const fn as_socket_addr(&self) -> SocketAddr {
        self.0
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self(addr)
    }
}

impl From<Endpoint> for SocketAddr {
    fn from(ep: Endpoint) -> Self {
        ep.0
    }
}

impl FromStr for Endpoint {
    type Err = EndpointParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(Self(addr));
        }
        s.parse::<u16>()
            .map(Self::localhost)
            .map_err(|_| EndpointParseError(s.to_owned()))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
