//! Network transport.
//!
//! - `endpoint`: address type shared by the config and the handler.
//! - `socket`: mio-based UDP socket.
//! - `handler`: the transport handler (receive worker + send path).

pub mod endpoint;
pub mod handler;
pub mod socket;

pub use endpoint::{Endpoint, EndpointParseError};
pub use handler::{Datagram, PeerLink, TransportError, UdpHandler};
pub use socket::UdpSocket;
