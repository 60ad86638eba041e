//! Non-blocking UDP socket shared by the receive worker and the send path.

use std::io::{self, ErrorKind};
use std::os::fd::AsFd;

use mio::event::Source;
use mio::{Interest, Registry, Token};
use rustix::net::sockopt;

use super::Endpoint;

pub struct UdpSocket {
    inner: mio::net::UdpSocket,
}

impl UdpSocket {
    /// Binds a non-blocking socket.
    ///
    /// # Errors
    ///
    /// Fails if the address is in use or not local.
    pub fn bind(endpoint: Endpoint) -> io::Result<Self> {
        mio::net::UdpSocket::bind(endpoint.into()).map(|inner| Self { inner })
    }

    /// The bound address, with the kernel-assigned port when bound to port 0.
    ///
    /// # Errors
    ///
    /// Propagates `getsockname` failure.
    pub fn local_addr(&self) -> io::Result<Endpoint> {
        self.inner.local_addr().map(Endpoint::from)
    }

    /// Sends one datagram. A full kernel send buffer surfaces as `WouldBlock`.
    ///
    /// # Errors
    ///
    /// Any I/O failure from `sendto`.
    pub fn send_to(&self, buf: &[u8], dest: Endpoint) -> io::Result<usize> {
        self.inner.send_to(buf, dest.into())
    }

    /// Takes the next queued datagram, or `None` if the queue is empty.
    ///
    /// A datagram longer than `buf` is truncated to `buf.len()`.
    ///
    /// # Errors
    ///
    /// Receive errors other than `WouldBlock`.
    pub fn recv_next(&self, buf: &mut [u8]) -> io::Result<Option<(usize, Endpoint)>> {
        match self.inner.recv_from(buf) {
            Ok((n, from)) => Ok(Some((n, from.into()))),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Kernel receive buffer size as reported by `SO_RCVBUF`.
    ///
    /// # Errors
    ///
    /// Propagates `getsockopt` failure.
    pub fn recv_buffer_size(&self) -> io::Result<usize> {
        Ok(sockopt::socket_recv_buffer_size(self.inner.as_fd())?)
    }

    /// Raises the kernel receive buffer to at least `min` bytes and returns
    /// the size the kernel settled on. Never shrinks the buffer.
    ///
    /// The kernel may clamp the request (`net.core.rmem_max` on Linux), so
    /// the result can still be below `min`.
    ///
    /// # Errors
    ///
    /// Propagates `setsockopt`/`getsockopt` failure.
    pub fn grow_recv_buffer(&self, min: usize) -> io::Result<usize> {
        let current = self.recv_buffer_size()?;
        if current >= min {
            return Ok(current);
        }
        sockopt::set_socket_recv_buffer_size(self.inner.as_fd(), min)?;
        self.recv_buffer_size()
    }
}

impl Source for UdpSocket {
    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        self.inner.register(registry, token, interests)
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        self.inner.reregister(registry, token, interests)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        self.inner.deregister(registry)
    }
}
