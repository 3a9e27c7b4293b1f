//! Endpoint: one transport side of a relay.
//!
//! An endpoint wraps a non-blocking socket, optionally TLS-wrapped, and
//! implements the per-pass read/write state machine: bounded reads,
//! head-of-queue writes with in-place partial-write trimming, and the
//! classification of "no data yet", "orderly close" and "transport error".
//!
//! TLS makes readiness lie in both directions: the transport can hold
//! decrypted data while the OS reports nothing to read, and can need to
//! flush records while the application has nothing to send. Two hints
//! compensate: `sticky_ready` (a read may have left data buffered) and a
//! remembered writability bit (the socket was writable and the queue is not
//! drained). While either hint is live the endpoint asks the reactor to
//! dispatch it again without waiting for a fresh OS notification.

use bytes::{Buf, Bytes};
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use rustls::{ClientConnection, ServerConnection, StreamOwned};
use std::collections::VecDeque;
use std::io::{self, ErrorKind, Read, Write};
use std::net::SocketAddr;
use thiserror::Error;
use tracing::{debug, trace};

/// Bytes read from a transport per reactor pass.
pub const RECV_CHUNK: usize = 4096;

/// Which side of the relay an endpoint is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// The accepted client connection.
    Inbound,
    /// The connection to the backend.
    Outbound,
}

impl Direction {
    /// Tag used in traffic log records.
    pub fn tag(self) -> &'static str {
        match self {
            Direction::Inbound => "i",
            Direction::Outbound => "o",
        }
    }

    /// Name used in error messages.
    pub fn name(self) -> &'static str {
        match self {
            Direction::Inbound => "client",
            Direction::Outbound => "peer",
        }
    }
}

/// Terminal failure of a single endpoint.
#[derive(Debug, Error)]
pub enum EndpointError {
    /// Orderly close by the remote side.
    #[error("eof on {0}")]
    Eof(&'static str),

    #[error("recv error on {name}: {source}")]
    Recv {
        name: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("send error on {name}: {source}")]
    Send {
        name: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("connect error on {name}: {source}")]
    Connect {
        name: &'static str,
        #[source]
        source: io::Error,
    },
}

impl EndpointError {
    /// True for an orderly close rather than a transport failure.
    pub fn is_orderly(&self) -> bool {
        matches!(self, EndpointError::Eof(_))
    }
}

/// A plain or TLS-wrapped non-blocking TCP stream.
pub enum Transport {
    Plain(TcpStream),
    ServerTls(StreamOwned<ServerConnection, TcpStream>),
    ClientTls(StreamOwned<ClientConnection, TcpStream>),
}

impl Transport {
    fn socket(&self) -> &TcpStream {
        match self {
            Transport::Plain(s) => s,
            Transport::ServerTls(s) => &s.sock,
            Transport::ClientTls(s) => &s.sock,
        }
    }

    fn socket_mut(&mut self) -> &mut TcpStream {
        match self {
            Transport::Plain(s) => s,
            Transport::ServerTls(s) => &mut s.sock,
            Transport::ClientTls(s) => &mut s.sock,
        }
    }

    /// True when the TLS layer has records queued for the socket.
    fn wants_write(&self) -> bool {
        match self {
            Transport::Plain(_) => false,
            Transport::ServerTls(s) => s.conn.wants_write(),
            Transport::ClientTls(s) => s.conn.wants_write(),
        }
    }

    /// Flushes pending TLS records to the socket.
    ///
    /// Returns `Ok(true)` when nothing is left pending and `Ok(false)` when
    /// the socket would block before the records were drained.
    fn flush_records(&mut self) -> io::Result<bool> {
        match self {
            Transport::Plain(_) => Ok(true),
            Transport::ServerTls(s) => flush_conn(&mut s.conn, &mut s.sock),
            Transport::ClientTls(s) => flush_conn(&mut s.conn, &mut s.sock),
        }
    }
}

fn flush_conn<T>(conn: &mut rustls::ConnectionCommon<T>, sock: &mut TcpStream) -> io::Result<bool> {
    while conn.wants_write() {
        match conn.write_tls(sock) {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(false),
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

impl Read for Transport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Transport::Plain(s) => s.read(buf),
            Transport::ServerTls(s) => s.read(buf),
            Transport::ClientTls(s) => s.read(buf),
        }
    }
}

impl Write for Transport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Transport::Plain(s) => s.write(buf),
            Transport::ServerTls(s) => s.write(buf),
            Transport::ClientTls(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Transport::Plain(s) => s.flush(),
            Transport::ServerTls(s) => s.flush(),
            Transport::ClientTls(s) => s.flush(),
        }
    }
}

/// Connection progress of the underlying socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    /// Non-blocking connect still in flight.
    Connecting,
    Established,
}

/// One transport side of a relay.
pub struct Endpoint {
    transport: Transport,
    /// Address identifying the relay in logs (the client's address for
    /// both directions).
    addr: SocketAddr,
    dir: Direction,
    token: Token,
    state: ConnState,
    /// Chunks waiting to be written, oldest first.
    queue: VecDeque<Bytes>,
    queued_bytes: u64,
    /// A prior read may have left data buffered in the transport.
    sticky_ready: bool,
    /// The socket was writable the last time the OS said so.
    writable: bool,
    /// Interest currently registered with the poller.
    registered: Option<Interest>,
}

impl Endpoint {
    /// Wraps an accepted client connection.
    pub fn accepted(transport: Transport, addr: SocketAddr, token: Token) -> Self {
        Self::new(transport, addr, Direction::Inbound, token, ConnState::Established)
    }

    /// Wraps an in-flight non-blocking connect to the backend.
    pub fn connecting(transport: Transport, addr: SocketAddr, token: Token) -> Self {
        Self::new(transport, addr, Direction::Outbound, token, ConnState::Connecting)
    }

    fn new(
        transport: Transport,
        addr: SocketAddr,
        dir: Direction,
        token: Token,
        state: ConnState,
    ) -> Self {
        Self {
            transport,
            addr,
            dir,
            token,
            state,
            queue: VecDeque::new(),
            queued_bytes: 0,
            sticky_ready: false,
            writable: false,
            registered: None,
        }
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn direction(&self) -> Direction {
        self.dir
    }

    /// Name used in error messages ("client" or "peer").
    pub fn name(&self) -> &'static str {
        self.dir.name()
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Bytes currently queued for writing.
    pub fn queued_bytes(&self) -> u64 {
        self.queued_bytes
    }

    pub fn is_connecting(&self) -> bool {
        self.state == ConnState::Connecting
    }

    /// Appends a chunk read from the paired endpoint.
    pub fn push_chunk(&mut self, chunk: Bytes) {
        self.queued_bytes += chunk.len() as u64;
        self.queue.push_back(chunk);
    }

    /// Notes an OS writability report for this pass.
    pub fn note_writable(&mut self) {
        self.writable = true;
    }

    /// True when a write attempt can make progress right now.
    pub fn write_pending(&self) -> bool {
        self.writable && (!self.queue.is_empty() || self.transport.wants_write())
    }

    /// True when a read attempt should happen even without OS readiness.
    pub fn sticky_ready(&self) -> bool {
        self.sticky_ready
    }

    /// Re-poll-immediately hint for the reactor: buffered transport data,
    /// or a known-writable socket with an undrained queue.
    pub fn wants_immediate(&self, suspend_reads: bool) -> bool {
        if self.state == ConnState::Connecting {
            return false;
        }
        (self.sticky_ready && !suspend_reads) || self.write_pending()
    }

    /// Interest this endpoint wants from the poller. `suspend_reads` is set
    /// by the relay while the destination queue is over the backpressure
    /// bound.
    fn desired_interest(&self, suspend_reads: bool) -> Option<Interest> {
        if self.state == ConnState::Connecting {
            return Some(Interest::WRITABLE);
        }
        let mut interest = if suspend_reads {
            None
        } else {
            Some(Interest::READABLE)
        };
        if !self.queue.is_empty() || self.transport.wants_write() {
            interest = Some(match interest {
                Some(i) => i | Interest::WRITABLE,
                None => Interest::WRITABLE,
            });
        }
        interest
    }

    /// Brings the poller registration in line with the current interest.
    pub fn sync_registration(
        &mut self,
        registry: &Registry,
        suspend_reads: bool,
    ) -> io::Result<()> {
        let desired = self.desired_interest(suspend_reads);
        if desired == self.registered {
            return Ok(());
        }
        let token = self.token;
        match (self.registered, desired) {
            (None, Some(interest)) => {
                registry.register(self.transport.socket_mut(), token, interest)?
            }
            (Some(_), Some(interest)) => {
                registry.reregister(self.transport.socket_mut(), token, interest)?
            }
            (Some(_), None) => registry.deregister(self.transport.socket_mut())?,
            (None, None) => {}
        }
        self.registered = desired;
        Ok(())
    }

    /// Removes the endpoint from the poller ahead of teardown.
    pub fn deregister(&mut self, registry: &Registry) {
        if self.registered.take().is_some() {
            let _ = registry.deregister(self.transport.socket_mut());
        }
    }

    /// Completes a pending non-blocking connect once the socket reported
    /// writable.
    pub fn complete_connect(&mut self) -> Result<(), EndpointError> {
        match self.transport.socket().take_error() {
            Ok(None) => {
                debug!(addr = %self.addr, "backend connection established");
                self.state = ConnState::Established;
                self.writable = true;
                Ok(())
            }
            Ok(Some(source)) | Err(source) => Err(EndpointError::Connect {
                name: self.name(),
                source,
            }),
        }
    }

    /// Attempts one write of the head chunk.
    ///
    /// Pending TLS records (handshake data, previously buffered output) go
    /// first; would-block on either stage clears the writability memory and
    /// leaves the queue intact for the next notification.
    pub fn write_some(&mut self) -> Result<(), EndpointError> {
        match self.transport.flush_records() {
            Ok(true) => {}
            Ok(false) => {
                self.writable = false;
                return Ok(());
            }
            Err(source) => {
                return Err(EndpointError::Send {
                    name: self.name(),
                    source,
                })
            }
        }

        let name = self.name();
        let Some(head) = self.queue.front_mut() else {
            return Ok(());
        };
        match self.transport.write(head) {
            Ok(0) => {
                self.writable = false;
                Ok(())
            }
            Ok(n) if n == head.len() => {
                trace!(len = n, endpoint = name, "wrote chunk");
                self.queued_bytes -= n as u64;
                self.queue.pop_front();
                Ok(())
            }
            Ok(n) => {
                // Partial write: trim the sent prefix, keep queue order.
                trace!(len = n, remaining = head.len() - n, endpoint = name, "partial write");
                self.queued_bytes -= n as u64;
                head.advance(n);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                self.writable = false;
                Ok(())
            }
            Err(source) => Err(EndpointError::Send {
                name: self.name(),
                source,
            }),
        }
    }

    /// Attempts one bounded read and classifies the outcome.
    ///
    /// `Ok(None)` means no data is available right now; `Ok(Some(_))` is a
    /// chunk for the paired endpoint's queue.
    pub fn read_some(&mut self) -> Result<Option<Bytes>, EndpointError> {
        let mut buf = [0u8; RECV_CHUNK];
        match self.transport.read(&mut buf) {
            Ok(0) => Err(EndpointError::Eof(self.name())),
            Ok(n) => {
                trace!(len = n, endpoint = self.name(), "read chunk");
                // The transport may hold more than we took.
                self.sticky_ready = true;
                Ok(Some(Bytes::copy_from_slice(&buf[..n])))
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                self.sticky_ready = false;
                Ok(None)
            }
            // rustls reports a missing close_notify this way; the original
            // treated both as "eof".
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => Err(EndpointError::Eof(self.name())),
            Err(source) => Err(EndpointError::Recv {
                name: self.name(),
                source,
            }),
        }
    }
}
