//! Transport handler: one bound UDP socket, one receive worker.
//!
//! # Threads
//!
//! ```text
//!   engine thread                         receive worker (extctl-rx-<port>)
//!   ─────────────                         ─────────────────────────────────
//!   send_to() ──► socket ──► simulator
//!                                         poll(socket | waker)
//!   inbound.recv_timeout() ◄── channel ◄── copy datagram out of buffer
//!   stop() ──► waker.wake() ────────────► exit, drop socket
//! ```
//!
//! Each datagram is copied out of the worker's reusable 64 KiB buffer into
//! an owned [`Datagram`] before it crosses the thread boundary, so the
//! consumer can never observe a buffer that is still being written.
//!
//! # Shutdown
//!
//! [`UdpHandler::stop`] raises the stopping flag, wakes the poller and
//! waits up to `shutdown_timeout` for the worker. Receive errors seen while
//! stopping, or errors that mean the socket is gone, end the worker
//! silently. Any other receive error is logged and the worker keeps going.

use std::io::{self, ErrorKind};
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TrySendError};
use mio::{Events, Interest, Poll, Token, Waker};

use crate::config::TransportConfig;
use crate::engine::CommandLink;
use crate::topology::pin_current_thread;
use crate::trace::{debug, error, info, trace, warn};

use super::{Endpoint, UdpSocket};

/// Receive buffer size; larger than any UDP payload, so nothing truncates.
pub const RECV_BUFFER_SIZE: usize = 64 * 1024;

const SOCKET: Token = Token(0);
const WAKER: Token = Token(1);
const EVENTS_CAPACITY: usize = 16;

/// One inbound datagram, copied out of the receive buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub payload: Vec<u8>,
    pub from: Endpoint,
}

/// Failure to start the transport. Always fatal for startup.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("UDP handler is already running")]
    AlreadyRunning,
    #[error("failed to bind UDP socket on {addr}: {source}")]
    Bind {
        addr: Endpoint,
        #[source]
        source: io::Error,
    },
    #[error("failed to set up socket polling: {0}")]
    Poll(#[source] io::Error),
    #[error("failed to spawn receive worker: {0}")]
    Spawn(#[source] io::Error),
}

/// State that exists only while the handler is started.
struct Running {
    socket: Arc<UdpSocket>,
    local_addr: Endpoint,
    waker: Waker,
    stopping: Arc<AtomicBool>,
    /// Disconnects when the worker thread exits.
    done: Receiver<()>,
    handle: JoinHandle<()>,
}

/// Owns the UDP socket and its receive worker.
///
/// All methods take `&self`, so the handler can be shared through an `Arc`
/// between the control loop (sending) and a shutdown path (stopping).
pub struct UdpHandler {
    config: TransportConfig,
    running: Mutex<Option<Running>>,
    last_sender: Arc<Mutex<Option<Endpoint>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl UdpHandler {
    #[must_use]
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            running: Mutex::new(None),
            last_sender: Arc::new(Mutex::new(None)),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &TransportConfig {
        &self.config
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        lock(&self.running).is_some()
    }

    /// Address the socket is actually bound to (resolves port 0).
    #[must_use]
    pub fn local_addr(&self) -> Option<Endpoint> {
        lock(&self.running).as_ref().map(|r| r.local_addr)
    }

    /// Source of the most recent inbound datagram.
    #[must_use]
    pub fn last_sender(&self) -> Option<Endpoint> {
        *lock(&self.last_sender)
    }

    /// Binds the socket and spawns the receive worker.
    ///
    /// Returns the receiving end of the inbound datagram channel. It
    /// disconnects once the worker exits.
    ///
    /// # Errors
    ///
    /// Fails if already running, or if binding, poller setup or thread
    /// spawning fails. On failure nothing is retained and `start` may be
    /// called again.
    pub fn start(&self) -> Result<Receiver<Datagram>, TransportError> {
        let mut running = lock(&self.running);
        if running.is_some() {
            return Err(TransportError::AlreadyRunning);
        }

        let addr = self.config.bind_addr;
        let mut socket = UdpSocket::bind(addr).map_err(|source| {
            error!(bind_addr = %addr, error = %source, "failed to bind UDP socket");
            TransportError::Bind { addr, source }
        })?;
        match socket.grow_recv_buffer(self.config.recv_buffer_size) {
            Ok(_size) => debug!(
                requested = self.config.recv_buffer_size,
                effective = _size,
                "socket receive buffer sized"
            ),
            Err(_e) => warn!(
                size = self.config.recv_buffer_size,
                error = %_e,
                "could not enlarge socket receive buffer"
            ),
        }
        let local_addr = socket.local_addr().unwrap_or(addr);

        let poll = Poll::new().map_err(TransportError::Poll)?;
        poll.registry()
            .register(&mut socket, SOCKET, Interest::READABLE)
            .map_err(TransportError::Poll)?;
        let waker = Waker::new(poll.registry(), WAKER).map_err(TransportError::Poll)?;

        let socket = Arc::new(socket);
        let stopping = Arc::new(AtomicBool::new(false));
        let (inbound_tx, inbound_rx) = channel::bounded(self.config.inbound_capacity);
        let (done_tx, done_rx) = channel::bounded::<()>(1);

        *lock(&self.last_sender) = None;

        let mut worker = ReceiveWorker {
            socket: Arc::clone(&socket),
            poll,
            stopping: Arc::clone(&stopping),
            inbound: inbound_tx,
            last_sender: Arc::clone(&self.last_sender),
            buf: vec![0u8; RECV_BUFFER_SIZE],
        };
        let rx_core = self.config.rx_core;

        debug!(bind_addr = %local_addr, "spawning receive worker");
        let handle = thread::Builder::new()
            .name(format!("extctl-rx-{}", local_addr.port()))
            .spawn(move || {
                let _done = done_tx;
                if let Some(core) = rx_core {
                    pin_current_thread(core);
                }
                info!("receive worker started");
                worker.run();
                info!("receive worker exiting");
            })
            .map_err(|e| {
                error!(error = %e, "failed to spawn receive worker");
                TransportError::Spawn(e)
            })?;

        *running = Some(Running {
            socket,
            local_addr,
            waker,
            stopping,
            done: done_rx,
            handle,
        });
        info!(bind_addr = %local_addr, "UDP handler started");
        Ok(inbound_rx)
    }

    /// Stops the receive worker and closes the socket.
    ///
    /// Returns within `shutdown_timeout` even if the worker is mid-receive.
    /// No-op when not running.
    pub fn stop(&self) {
        let Some(running) = lock(&self.running).take() else {
            return;
        };
        info!(bind_addr = %running.local_addr, "UDP handler stopping");

        running.stopping.store(true, Ordering::Release);
        if let Err(_e) = running.waker.wake() {
            warn!(error = %_e, "failed to wake receive worker");
        }
        // The socket closes once the worker drops its reference.
        drop(running.socket);

        let timeout = self.config.shutdown_timeout;
        match running.done.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if running.handle.join().is_err() {
                    error!("receive worker panicked");
                }
                info!("UDP handler stopped");
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    "receive worker did not exit in time, detaching"
                );
            }
        }
    }

    /// Sends one datagram to `dest`.
    ///
    /// Returns `false` (and logs why) if the handler is not running or the
    /// socket reports an error.
    pub fn send_to(&self, bytes: &[u8], dest: Endpoint) -> bool {
        let socket = match lock(&self.running).as_ref() {
            Some(r) => Arc::clone(&r.socket),
            None => {
                warn!(dest = %dest, "cannot send: UDP handler is not running");
                return false;
            }
        };

        match socket.send_to(bytes, dest) {
            Ok(n) if n == bytes.len() => {
                trace!(dest = %dest, len = n, "sent datagram");
                true
            }
            Ok(_n) => {
                warn!(dest = %dest, sent = _n, len = bytes.len(), "short UDP send");
                false
            }
            Err(_e) => {
                warn!(dest = %dest, error = %_e, "UDP send error");
                false
            }
        }
    }

    /// Replies to whoever sent the most recent datagram.
    pub fn send_to_last_sender(&self, bytes: &[u8]) -> bool {
        match self.last_sender() {
            Some(dest) => self.send_to(bytes, dest),
            None => {
                warn!("cannot send: no datagram received yet");
                false
            }
        }
    }
}

impl Drop for UdpHandler {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Errors meaning the socket itself is gone.
fn is_socket_closed(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::NotConnected | ErrorKind::BrokenPipe | ErrorKind::ConnectionAborted
    ) || e.raw_os_error() == Some(rustix::io::Errno::BADF.raw_os_error())
}

/// ICMP port-unreachable from a simulator that is not listening yet.
fn is_peer_unreachable(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset
    )
}

struct ReceiveWorker {
    socket: Arc<UdpSocket>,
    poll: Poll,
    stopping: Arc<AtomicBool>,
    inbound: Sender<Datagram>,
    last_sender: Arc<Mutex<Option<Endpoint>>>,
    buf: Vec<u8>,
}

impl ReceiveWorker {
    fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    fn run(&mut self) {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        loop {
            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() == ErrorKind::Interrupted {
                    continue;
                }
                if !self.is_stopping() {
                    error!(error = %e, "socket poll failed");
                }
                return;
            }

            for event in &events {
                match event.token() {
                    WAKER if self.is_stopping() => return,
                    SOCKET => {
                        if self.drain().is_break() {
                            return;
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    /// Reads until the socket would block (mio readiness is edge-triggered).
    fn drain(&mut self) -> ControlFlow<()> {
        loop {
            match self.socket.recv_next(&mut self.buf) {
                Ok(Some((len, from))) => self.deliver(len, from),
                Ok(None) => return ControlFlow::Continue(()),
                Err(_e) if self.is_stopping() || is_socket_closed(&_e) => {
                    debug!(error = %_e, "socket closed, receive worker terminating");
                    return ControlFlow::Break(());
                }
                Err(_e) if is_peer_unreachable(&_e) => {
                    debug!(error = %_e, "peer unreachable");
                }
                Err(_e) => {
                    warn!(error = %_e, "UDP receive error");
                }
            }
        }
    }

    fn deliver(&self, len: usize, from: Endpoint) {
        *lock(&self.last_sender) = Some(from);

        let datagram = Datagram {
            payload: self.buf[..len].to_vec(),
            from,
        };
        match self.inbound.try_send(datagram) {
            Ok(()) => trace!(from = %from, len, "received datagram"),
            Err(TrySendError::Full(_)) => {
                warn!(from = %from, len, "inbound queue full, dropping datagram");
            }
            Err(TrySendError::Disconnected(_)) => {
                trace!(from = %from, "no inbound consumer, dropping datagram");
            }
        }
    }
}

/// [`CommandLink`] that sends every command to one fixed peer.
#[derive(Clone)]
pub struct PeerLink {
    handler: Arc<UdpHandler>,
    peer: Endpoint,
}

impl PeerLink {
    #[must_use]
    pub const fn new(handler: Arc<UdpHandler>, peer: Endpoint) -> Self {
        Self { handler, peer }
    }

    #[must_use]
    pub const fn peer(&self) -> Endpoint {
        self.peer
    }
}

impl CommandLink for PeerLink {
    fn send_command(&self, bytes: &[u8]) -> bool {
        self.handler.send_to(bytes, self.peer)
    }
}
