use std::{
    io::{self, Read},
    net::Shutdown,
};

use tracing::{debug, trace, warn};

use crate::tcp::{
    ring::RingBuffer,
    socket::{SocketSlot, send_nosignal},
};

/// Per-direction user-space buffering.
pub(crate) const FORWARD_BUF_SIZE: usize = 4096;

/// Moves bytes one way across the proxy: `recv` from the source socket into
/// the ring, `send` from the ring to the destination socket.
///
/// `recv_down` means the source reached EOF or failed; no further reads.
/// `send_down` means the destination takes no more bytes, either because we
/// shut it down for writes after draining, or because a send failed. A failed
/// send also sets `recv_down`: with no way to deliver, buffering more from
/// the source only builds head-of-line blocking. `send_down` therefore
/// implies `recv_down`.
pub(crate) struct Forwarder {
    ring: RingBuffer,
    recv_down: bool,
    send_down: bool,
}

impl Forwarder {
    pub fn new() -> Self {
        Self { ring: RingBuffer::new(FORWARD_BUF_SIZE), recv_down: false, send_down: false }
    }

    #[inline]
    pub fn wants_recv(&self) -> bool {
        !self.recv_down && !self.ring.is_full()
    }

    #[inline]
    pub fn wants_send(&self) -> bool {
        !self.send_down && !self.ring.is_empty()
    }

    #[inline]
    pub fn recv_closed(&self) -> bool {
        self.recv_down
    }

    #[inline]
    pub fn send_closed(&self) -> bool {
        self.send_down
    }

    /// Move as many bytes as current readiness allows, then propagate
    /// half-close once the source is done and the ring has drained.
    ///
    /// Loops until neither side can progress. With edge-triggered readiness
    /// an edge must be consumed fully: stopping early with the socket still
    /// ready would stall the direction, since no further event is coming.
    /// Termination: every round either moves bytes forward or clears a
    /// readiness flag / sets a down flag, all of which are one-way here.
    pub fn pump(&mut self, source: &mut SocketSlot, destination: &mut SocketSlot) {
        loop {
            let mut progress = false;
            progress |= self.try_recv(source);
            progress |= self.try_send(destination);
            if !progress {
                break;
            }
        }
        self.propagate_half_close(destination);
    }

    /// One gated `recv` into the write window. Returns whether bytes moved.
    fn try_recv(&mut self, source: &mut SocketSlot) -> bool {
        if !self.wants_recv() || !source.is_readable() {
            return false;
        }
        let Some(stream) = source.stream_mut() else { return false };

        match stream.read(self.ring.write_slice()) {
            Ok(0) => {
                debug!(role = source.role(), "peer closed, recv side down");
                self.recv_down = true;
                false
            }
            Ok(n) => {
                trace!(role = source.role(), n, "received");
                self.ring.advance_write(n);
                true
            }
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                source.clear_readable();
                false
            }
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => true,
            Err(err) => {
                warn!(role = source.role(), %err, "recv failed");
                self.recv_down = true;
                false
            }
        }
    }

    /// One gated `send` from the read window. Returns whether bytes moved.
    ///
    /// Any failure takes the whole direction down, not just the send half.
    fn try_send(&mut self, destination: &mut SocketSlot) -> bool {
        if !self.wants_send() || !destination.is_writable() {
            return false;
        }
        let Some(stream) = destination.stream_mut() else { return false };

        match send_nosignal(stream, self.ring.read_slice()) {
            Ok(0) => {
                warn!(role = destination.role(), "zero-length send, direction down");
                self.send_down = true;
                self.recv_down = true;
                false
            }
            Ok(n) => {
                trace!(role = destination.role(), n, "sent");
                self.ring.advance_read(n);
                true
            }
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                destination.clear_writable();
                false
            }
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => true,
            Err(err) => {
                // An orderly peer close shows up here as EPIPE/ECONNRESET;
                // that is normal teardown, not worth a warning.
                if matches!(err.raw_os_error(), Some(libc::EPIPE | libc::ECONNRESET)) {
                    debug!(role = destination.role(), %err, "send failed, direction down");
                } else {
                    warn!(role = destination.role(), %err, "send failed, direction down");
                }
                self.send_down = true;
                self.recv_down = true;
                false
            }
        }
    }

    /// Once the source is finished and every buffered byte is out, pass the
    /// EOF along by shutting the destination down for writes. Runs at most
    /// once per direction; `send_down` latches.
    fn propagate_half_close(&mut self, destination: &mut SocketSlot) {
        if self.send_down || !self.recv_down || !self.ring.is_empty() {
            return;
        }
        self.send_down = true;

        if let Some(stream) = destination.stream() {
            debug!(role = destination.role(), "shutting down writes");
            if let Err(err) = stream.shutdown(Shutdown::Write) {
                warn!(role = destination.role(), %err, "shutdown failed");
            }
        }
    }
}
