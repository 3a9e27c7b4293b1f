//! Listener: accepts clients and spawns relays to the backend.

use crate::endpoint::{Endpoint, Transport};
use crate::reactor::{DispatchCtx, Pollable, Readiness, Status};
use crate::relay::Relay;
use crate::server::ProxySettings;
use crate::traffic::TrafficLog;
use mio::net::{TcpListener, TcpStream};
use mio::{Interest, Registry, Token};
use rustls::{ClientConnection, ServerConnection, StreamOwned};
use socket2::{Domain, Protocol, Socket, Type};
use std::cell::RefCell;
use std::io::{self, ErrorKind};
use std::net::SocketAddr;
use std::rc::Rc;
use tracing::{debug, error, info, warn};

pub struct Listener {
    socket: TcpListener,
    token: Token,
    settings: Rc<ProxySettings>,
    log: Option<Rc<RefCell<TrafficLog>>>,
    registered: bool,
}

impl Listener {
    /// Binds the listening socket.
    pub fn bind(
        settings: Rc<ProxySettings>,
        log: Option<Rc<RefCell<TrafficLog>>>,
        token: Token,
    ) -> io::Result<Self> {
        let socket = bind_listener(settings.listen_addr)?;
        Ok(Self {
            socket,
            token,
            settings,
            log,
            registered: false,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Wraps an accepted client and its backend connection into a relay.
    ///
    /// The backend connect is non-blocking: the relay's outbound endpoint
    /// completes it when the socket turns writable, so a slow backend never
    /// stalls the other relays.
    fn spawn_relay(
        &self,
        stream: TcpStream,
        addr: SocketAddr,
        ctx: &mut DispatchCtx<'_>,
    ) -> crate::Result<()> {
        stream.set_nodelay(true)?;
        let client_transport = match &self.settings.server_tls {
            Some(config) => {
                let conn = ServerConnection::new(config.clone())?;
                Transport::ServerTls(StreamOwned::new(conn, stream))
            }
            None => Transport::Plain(stream),
        };
        let client = Endpoint::accepted(client_transport, addr, ctx.next_token());

        let backend = TcpStream::connect(self.settings.backend_addr)?;
        backend.set_nodelay(true)?;
        let peer_transport = match &self.settings.client_tls {
            Some(config) => {
                let conn =
                    ClientConnection::new(config.clone(), self.settings.backend_name.clone())?;
                Transport::ClientTls(StreamOwned::new(conn, backend))
            }
            None => Transport::Plain(backend),
        };
        let peer = Endpoint::connecting(peer_transport, addr, ctx.next_token());

        ctx.spawn(Box::new(Relay::new(
            client,
            peer,
            self.settings.max_queue_bytes,
            self.log.clone(),
        )));
        Ok(())
    }
}

/// Builds the non-blocking listening socket. IPv6 binds switch v6-only
/// off so v4-mapped clients connect too.
fn bind_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    if addr.is_ipv6() {
        socket.set_only_v6(false)?;
    }
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    Ok(TcpListener::from_std(socket.into()))
}

impl Pollable for Listener {
    fn prepare(&mut self, registry: &Registry) -> io::Result<bool> {
        if !self.registered {
            registry.register(&mut self.socket, self.token, Interest::READABLE)?;
            self.registered = true;
        }
        Ok(false)
    }

    fn dispatch(&mut self, ready: &Readiness, ctx: &mut DispatchCtx<'_>) -> Status {
        let (readable, _) = ready.flags(self.token);
        if !readable {
            return Status::Active;
        }

        loop {
            match self.socket.accept() {
                Ok((stream, addr)) => {
                    info!(%addr, "new client");
                    // A failed relay setup (refused connect, bad TLS state)
                    // only costs this client; the listener keeps going.
                    if let Err(err) = self.spawn_relay(stream, addr, ctx) {
                        warn!(%addr, %err, "failed to set up relay");
                    }
                    if self.settings.oneshot {
                        debug!("one-shot: closing listener");
                        if self.registered {
                            let _ = ctx.registry.deregister(&mut self.socket);
                        }
                        return Status::Terminated;
                    }
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err)
                    if matches!(
                        err.kind(),
                        ErrorKind::ConnectionAborted | ErrorKind::ConnectionReset
                    ) =>
                {
                    warn!(?err, "transient accept error");
                    continue;
                }
                Err(err) => {
                    error!(?err, "accept failed, closing listener");
                    if self.registered {
                        let _ = ctx.registry.deregister(&mut self.socket);
                    }
                    return Status::Terminated;
                }
            }
        }
        Status::Active
    }
}
