use std::io;

use mio::{Registry, Token, event::Event, net::TcpStream};
use tracing::debug;

use crate::tcp::{forwarder::Forwarder, socket::SocketSlot};

/// One proxied pairing: the accepted client socket, the outbound upstream
/// socket, and a forwarder for each direction.
///
/// A socket stays open while either the forwarder reading from it or the
/// forwarder writing to it still has work; once both half-flows are done it
/// is closed, and the connection retires when both sockets are gone.
pub(crate) struct Connection {
    client: SocketSlot,
    upstream: SocketSlot,
    client_to_upstream: Forwarder,
    upstream_to_client: Forwarder,
}

impl Connection {
    pub fn new(
        client: TcpStream,
        client_token: Token,
        upstream: TcpStream,
        upstream_token: Token,
    ) -> Self {
        Self {
            client: SocketSlot::new(client, client_token, "client"),
            upstream: SocketSlot::new(upstream, upstream_token, "upstream"),
            client_to_upstream: Forwarder::new(),
            upstream_to_client: Forwarder::new(),
        }
    }

    pub fn register(&mut self, registry: &Registry) -> io::Result<()> {
        self.client.register(registry)?;
        self.upstream.register(registry)
    }

    #[inline]
    pub fn owns(&self, token: Token) -> bool {
        self.client.token() == token || self.upstream.token() == token
    }

    /// Fold a delivered readiness event into the owning socket slot.
    pub fn note_event(&mut self, event: &Event) {
        if event.token() == self.client.token() {
            self.client.note_event(event);
        } else if event.token() == self.upstream.token() {
            self.upstream.note_event(event);
        } else {
            debug_assert!(false, "event delivered to a connection that does not own it");
        }
    }

    /// Run both directions against the remembered readiness, close whichever
    /// sockets are finished, and report whether the pairing is still alive.
    ///
    /// Client-to-upstream goes first, and within a direction recv precedes
    /// send.
    pub fn service(&mut self, registry: &Registry) -> bool {
        self.client_to_upstream.pump(&mut self.client, &mut self.upstream);
        self.upstream_to_client.pump(&mut self.upstream, &mut self.client);

        if self.client_to_upstream.recv_closed() && self.upstream_to_client.send_closed() {
            self.client.close(registry);
        }
        if self.upstream_to_client.recv_closed() && self.client_to_upstream.send_closed() {
            self.upstream.close(registry);
        }

        let alive = self.client.is_open() || self.upstream.is_open();
        if !alive {
            debug!("connection retired");
        }
        alive
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::{Read, Write},
        net::Shutdown,
        time::Duration,
    };

    use mio::Poll;

    use super::*;

    fn pair(token: usize, role: &'static str) -> (SocketSlot, std::net::TcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let peer = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (local, _) = listener.accept().unwrap();
        local.set_nonblocking(true).unwrap();
        (SocketSlot::new(mio::net::TcpStream::from_std(local), Token(token), role), peer)
    }

    fn connection() -> (Connection, std::net::TcpStream, std::net::TcpStream) {
        let (mut client, client_peer) = pair(10, "client");
        let (mut upstream, upstream_peer) = pair(11, "upstream");
        client.mark_readable();
        client.mark_writable();
        upstream.mark_readable();
        upstream.mark_writable();
        let conn = Connection {
            client,
            upstream,
            client_to_upstream: Forwarder::new(),
            upstream_to_client: Forwarder::new(),
        };
        (conn, client_peer, upstream_peer)
    }

    #[test]
    fn relays_both_directions() {
        let poll = Poll::new().unwrap();
        let (mut conn, mut client_peer, mut upstream_peer) = connection();

        client_peer.write_all(b"ping").unwrap();
        upstream_peer.write_all(b"pong").unwrap();
        std::thread::sleep(Duration::from_millis(20));

        assert!(conn.service(poll.registry()));

        let mut buf = [0u8; 4];
        upstream_peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        upstream_peer.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
        client_peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        client_peer.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[test]
    fn retires_when_both_sides_close() {
        let poll = Poll::new().unwrap();
        let (mut conn, client_peer, upstream_peer) = connection();

        drop(client_peer);
        drop(upstream_peer);
        std::thread::sleep(Duration::from_millis(20));

        // Both directions see EOF with empty rings: every half-flow finishes
        // and both sockets close in the same pass.
        assert!(!conn.service(poll.registry()));
        assert!(!conn.client.is_open());
        assert!(!conn.upstream.is_open());
    }

    #[test]
    fn half_close_keeps_reverse_direction_open() {
        let poll = Poll::new().unwrap();
        let (mut conn, mut client_peer, mut upstream_peer) = connection();

        client_peer.write_all(b"last").unwrap();
        client_peer.shutdown(Shutdown::Write).unwrap();
        std::thread::sleep(Duration::from_millis(20));

        assert!(conn.service(poll.registry()), "reverse direction must stay alive");

        // Upstream got the payload and the propagated EOF.
        upstream_peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut forward = Vec::new();
        upstream_peer.read_to_end(&mut forward).unwrap();
        assert_eq!(forward, b"last");

        // Upstream can still answer on the open reverse direction.
        upstream_peer.write_all(b"reply").unwrap();
        conn.upstream.mark_readable();
        std::thread::sleep(Duration::from_millis(20));
        assert!(conn.service(poll.registry()));

        client_peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut reverse = [0u8; 5];
        client_peer.read_exact(&mut reverse).unwrap();
        assert_eq!(&reverse, b"reply");
    }
}
