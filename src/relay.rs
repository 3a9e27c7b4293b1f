//! Relay: one proxied connection.
//!
//! A relay owns exactly two endpoints, the accepted client and the backend
//! peer, each feeding the other's write queue. The first terminal error on
//! either side short-circuits the pass and tears both down together: no
//! endpoint outlives its relay.

use crate::endpoint::{Endpoint, EndpointError};
use crate::reactor::{DispatchCtx, Pollable, Readiness, Status};
use crate::traffic::TrafficLog;
use std::cell::RefCell;
use std::io;
use std::rc::Rc;
use tracing::{debug, trace, warn};

pub struct Relay {
    client: Endpoint,
    peer: Endpoint,
    /// Backpressure bound: reads on one side are suspended while the other
    /// side's queue holds at least this many bytes.
    max_queue_bytes: u64,
    log: Option<Rc<RefCell<TrafficLog>>>,
    /// Poller registration failed; tear down on the next dispatch.
    defunct: bool,
}

impl Relay {
    pub fn new(
        client: Endpoint,
        peer: Endpoint,
        max_queue_bytes: u64,
        log: Option<Rc<RefCell<TrafficLog>>>,
    ) -> Self {
        Self {
            client,
            peer,
            max_queue_bytes,
            log,
            defunct: false,
        }
    }
}

impl Pollable for Relay {
    fn prepare(&mut self, registry: &mio::Registry) -> io::Result<bool> {
        let suspend_client = self.peer.queued_bytes() >= self.max_queue_bytes;
        let suspend_peer = self.client.queued_bytes() >= self.max_queue_bytes;
        // A registration failure only costs this relay, never the reactor.
        let synced = self
            .client
            .sync_registration(registry, suspend_client)
            .and_then(|()| self.peer.sync_registration(registry, suspend_peer));
        if let Err(err) = synced {
            warn!(client = %self.client.addr(), ?err, "poller registration failed");
            self.defunct = true;
            return Ok(true);
        }
        Ok(self.client.wants_immediate(suspend_client) || self.peer.wants_immediate(suspend_peer))
    }

    fn dispatch(&mut self, ready: &Readiness, ctx: &mut DispatchCtx<'_>) -> Status {
        if self.defunct {
            self.client.deregister(ctx.registry);
            self.peer.deregister(ctx.registry);
            return Status::Terminated;
        }
        // Client side first; its failure skips the peer's processing.
        let result = pump(
            &mut self.client,
            &mut self.peer,
            ready,
            self.max_queue_bytes,
            self.log.as_ref(),
        )
        .and_then(|()| {
            pump(
                &mut self.peer,
                &mut self.client,
                ready,
                self.max_queue_bytes,
                self.log.as_ref(),
            )
        });

        match result {
            Ok(()) => Status::Active,
            Err(err) => {
                if err.is_orderly() {
                    debug!(client = %self.client.addr(), %err, "relay closed");
                } else {
                    warn!(client = %self.client.addr(), %err, "relay closed");
                }
                // Both sides go down together.
                self.client.deregister(ctx.registry);
                self.peer.deregister(ctx.registry);
                Status::Terminated
            }
        }
    }
}

/// One side's share of a reactor pass: finish a pending connect, write the
/// head chunk if the socket can take it, then read one chunk into the
/// destination queue.
fn pump(
    src: &mut Endpoint,
    dst: &mut Endpoint,
    ready: &Readiness,
    max_queue_bytes: u64,
    log: Option<&Rc<RefCell<TrafficLog>>>,
) -> Result<(), EndpointError> {
    let (readable, os_writable) = ready.flags(src.token());
    if os_writable {
        src.note_writable();
    }

    if src.is_connecting() {
        if os_writable {
            src.complete_connect()?;
        }
        return Ok(());
    }

    if src.write_pending() {
        src.write_some()?;
    }

    let suspend = dst.queued_bytes() >= max_queue_bytes;
    if (readable || src.sticky_ready()) && !suspend {
        if let Some(chunk) = src.read_some()? {
            trace!(
                len = chunk.len(),
                from = src.name(),
                to = dst.name(),
                "copied chunk"
            );
            if let Some(log) = log {
                if let Err(err) = log.borrow_mut().record(src.addr(), src.direction(), &chunk) {
                    warn!(?err, "failed to append traffic log record");
                }
            }
            dst.push_chunk(chunk);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::Transport;
    use bytes::Bytes;
    use mio::net::TcpStream;
    use mio::Token;
    use std::io::{Read as _, Write as _};
    use std::net::{TcpListener as StdListener, TcpStream as StdStream};

    fn socket_pair() -> (TcpStream, StdStream) {
        let listener = StdListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let far = StdStream::connect(addr).unwrap();
        let (near, _) = listener.accept().unwrap();
        near.set_nonblocking(true).unwrap();
        (TcpStream::from_std(near), far)
    }

    /// Relay between two local socket pairs, no poller involved.
    fn test_relay() -> (Relay, StdStream, StdStream) {
        let (client_near, client_far) = socket_pair();
        let (peer_near, peer_far) = socket_pair();
        let addr = client_near.peer_addr().unwrap();
        let client = Endpoint::accepted(Transport::Plain(client_near), addr, Token(0));
        let peer = Endpoint::accepted(Transport::Plain(peer_near), addr, Token(1));
        // The backend side is Outbound in production; Inbound vs Outbound
        // only affects names and log tags, not pumping.
        (
            Relay::new(client, peer, u64::MAX, None),
            client_far,
            peer_far,
        )
    }

    fn all_ready(relay: &Relay) -> Readiness {
        let mut ready = Readiness::default();
        ready.insert(relay.client.token(), true, true);
        ready.insert(relay.peer.token(), true, true);
        ready
    }

    fn dispatch(relay: &mut Relay, ready: &Readiness) -> Status {
        let registry = mio::Poll::new().unwrap();
        let registry = registry.registry().try_clone().unwrap();
        let mut next_token = 100;
        let mut spawned = Vec::new();
        let mut ctx = DispatchCtx::new(&registry, &mut next_token, &mut spawned);
        relay.dispatch(ready, &mut ctx)
    }

    #[test]
    fn bytes_cross_from_client_to_peer() {
        let (mut relay, mut client_far, mut peer_far) = test_relay();

        client_far.write_all(b"ping").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(50));

        // Pass 1 reads "ping" into the peer queue; pass 2 writes it out.
        let ready = all_ready(&relay);
        assert_eq!(dispatch(&mut relay, &ready), Status::Active);
        assert_eq!(dispatch(&mut relay, &ready), Status::Active);

        let mut buf = [0u8; 4];
        peer_far.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[test]
    fn bytes_cross_from_peer_to_client() {
        let (mut relay, mut client_far, mut peer_far) = test_relay();

        peer_far.write_all(b"pong").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(50));

        let ready = all_ready(&relay);
        assert_eq!(dispatch(&mut relay, &ready), Status::Active);
        assert_eq!(dispatch(&mut relay, &ready), Status::Active);

        let mut buf = [0u8; 4];
        client_far.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[test]
    fn eof_on_one_side_terminates_the_relay() {
        let (mut relay, client_far, mut peer_far) = test_relay();

        drop(client_far);
        std::thread::sleep(std::time::Duration::from_millis(50));

        let ready = all_ready(&relay);
        assert_eq!(dispatch(&mut relay, &ready), Status::Terminated);

        // Dropping the relay closes the peer's socket too.
        drop(relay);
        let mut buf = [0u8; 1];
        assert_eq!(peer_far.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn client_error_skips_peer_processing_that_pass() {
        let (mut relay, client_far, mut peer_far) = test_relay();

        // Data from the peer side that would normally be copied.
        peer_far.write_all(b"late").unwrap();
        drop(client_far);
        std::thread::sleep(std::time::Duration::from_millis(50));

        let ready = all_ready(&relay);
        assert_eq!(dispatch(&mut relay, &ready), Status::Terminated);
        assert_eq!(
            relay.client.queued_bytes(),
            0,
            "peer pump must not run after the client side failed"
        );
    }

    #[test]
    fn registration_failure_terminates_only_the_relay() {
        let (mut relay, _client_far, _peer_far) = test_relay();

        let poll_a = mio::Poll::new().unwrap();
        relay.prepare(poll_a.registry()).unwrap();

        // Grow the peer's interest, then hand the relay a poller that has
        // never seen its sockets: the reregister fails.
        relay.peer.push_chunk(Bytes::from_static(b"x"));
        let poll_b = mio::Poll::new().unwrap();
        assert!(
            relay.prepare(poll_b.registry()).is_ok(),
            "a broken relay must not take the reactor down"
        );
        assert_eq!(
            dispatch(&mut relay, &Readiness::default()),
            Status::Terminated
        );
    }

    #[test]
    fn backpressure_suspends_reading() {
        let (mut relay, mut client_far, _peer_far) = test_relay();
        relay.max_queue_bytes = 4;

        client_far.write_all(b"0123456789").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(50));

        let mut ready = Readiness::default();
        // Only readable: the peer socket never drains its queue.
        ready.insert(relay.client.token(), true, false);
        ready.insert(relay.peer.token(), true, false);

        assert_eq!(dispatch(&mut relay, &ready), Status::Active);
        assert_eq!(relay.peer.queued_bytes(), 10);

        // Queue is over the bound now; further passes read nothing more.
        client_far.write_all(b"more").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert_eq!(dispatch(&mut relay, &ready), Status::Active);
        assert_eq!(relay.peer.queued_bytes(), 10);
    }
}
