use std::{io, net::SocketAddr, os::fd::AsRawFd};

use mio::{Interest, Registry, Token, event::Event, net::TcpStream};
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, warn};

/// Accept queue depth for the listening socket.
const LISTEN_BACKLOG: i32 = 1000;

/// Create the listening socket: bind, listen, non-blocking.
///
/// Built via socket2 rather than `TcpListener::bind` so the backlog is
/// explicit instead of whatever the std default happens to be.
pub fn bind_listener(addr: SocketAddr) -> io::Result<mio::net::TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    socket.set_nonblocking(true)?;
    Ok(mio::net::TcpListener::from_std(socket.into()))
}

/// Enable SO_KEEPALIVE so a silently vanished peer eventually errors out.
pub(crate) fn set_keepalive(stream: &TcpStream) -> io::Result<()> {
    let on: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            stream.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_KEEPALIVE,
            &on as *const _ as *const libc::c_void,
            core::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 { Err(io::Error::last_os_error()) } else { Ok(()) }
}

/// `send` with `MSG_NOSIGNAL`: a dead peer must surface as `EPIPE`, not as a
/// process-wide `SIGPIPE`.
pub(crate) fn send_nosignal(stream: &TcpStream, buf: &[u8]) -> io::Result<usize> {
    let n = unsafe {
        libc::send(stream.as_raw_fd(), buf.as_ptr().cast(), buf.len(), libc::MSG_NOSIGNAL)
    };
    if n < 0 { Err(io::Error::last_os_error()) } else { Ok(n as usize) }
}

/// One end of a proxied pairing: the stream, its poll token, and the
/// readiness remembered since the last edge.
///
/// mio readiness is edge-triggered, so `readable`/`writable` stay set across
/// iterations until a syscall comes back `WouldBlock`. The slot is the sole
/// owner of its descriptor; `close` deregisters and drops it, and is
/// idempotent.
pub(crate) struct SocketSlot {
    stream: Option<TcpStream>,
    token: Token,
    role: &'static str,
    readable: bool,
    writable: bool,
}

impl SocketSlot {
    pub fn new(stream: TcpStream, token: Token, role: &'static str) -> Self {
        Self { stream: Some(stream), token, role, readable: false, writable: false }
    }

    #[inline]
    pub fn token(&self) -> Token {
        self.token
    }

    #[inline]
    pub fn role(&self) -> &'static str {
        self.role
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    #[inline]
    pub fn is_readable(&self) -> bool {
        self.readable
    }

    #[inline]
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    #[inline]
    pub fn mark_readable(&mut self) {
        self.readable = true;
    }

    #[inline]
    pub fn mark_writable(&mut self) {
        self.writable = true;
    }

    #[inline]
    pub fn clear_readable(&mut self) {
        self.readable = false;
    }

    #[inline]
    pub fn clear_writable(&mut self) {
        self.writable = false;
    }

    #[inline]
    pub fn stream_mut(&mut self) -> Option<&mut TcpStream> {
        self.stream.as_mut()
    }

    #[inline]
    pub fn stream(&self) -> Option<&TcpStream> {
        self.stream.as_ref()
    }

    pub fn register(&mut self, registry: &Registry) -> io::Result<()> {
        let Some(stream) = self.stream.as_mut() else { return Ok(()) };
        // Both interests, once. The forwarders decide per iteration which
        // syscalls to attempt; registration never changes after this.
        registry.register(stream, self.token, Interest::READABLE | Interest::WRITABLE)
    }

    /// Record readiness delivered for this socket.
    ///
    /// A read/write-closed edge is folded into the plain readiness flag: the
    /// follow-up `recv`/`send` return value is what moves the forwarder state.
    /// Error readiness is logged for detail only, for the same reason.
    pub fn note_event(&mut self, event: &Event) {
        debug_assert_eq!(event.token(), self.token, "event routed to the wrong socket");

        if event.is_readable() || event.is_read_closed() {
            self.mark_readable();
        }
        if event.is_writable() || event.is_write_closed() {
            self.mark_writable();
        }
        if event.is_error() {
            if let Some(stream) = &self.stream {
                match stream.take_error() {
                    Ok(Some(err)) => warn!(role = self.role, %err, "socket error"),
                    Ok(None) => {}
                    Err(err) => warn!(role = self.role, %err, "getsockopt SO_ERROR failed"),
                }
            }
        }
    }

    pub fn close(&mut self, registry: &Registry) {
        if let Some(mut stream) = self.stream.take() {
            debug!(role = self.role, "closing socket");
            if let Err(err) = registry.deregister(&mut stream) {
                debug!(role = self.role, %err, "deregister failed");
            }
        }
    }
}
