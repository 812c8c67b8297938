use std::{io, net::SocketAddr};

use mio::{
    Events, Interest, Poll, Token,
    net::{TcpListener, TcpStream},
};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook_mio::v1_0::Signals;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::tcp::{connection::Connection, socket::set_keepalive};

const SIGNAL: Token = Token(0);
const LISTENER: Token = Token(1);
/// Connection sockets take tokens from here up, two per pairing.
const FIRST_CONN_TOKEN: usize = 2;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("can't create readiness poll")]
    CreatePoll(#[source] io::Error),
    #[error("can't set up signal source")]
    SignalSource(#[source] io::Error),
    #[error("can't register {what} with the poll")]
    Register {
        what: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("readiness wait failed")]
    Wait(#[source] io::Error),
}

/// The proxy event loop: one listener, one signal source, any number of
/// proxied pairings, all multiplexed over a single blocking readiness wait.
///
/// Per iteration: wait, fold delivered events into per-socket readiness,
/// service every live pairing (dropping retired ones), exit if a signal
/// arrived, then accept whatever is pending. Existing traffic is always
/// serviced before new clients are admitted, so an accept flood can't starve
/// established connections.
pub struct Server {
    poll: Poll,
    events: Events,
    listener: TcpListener,
    signals: Signals,
    upstream_addr: SocketAddr,
    connections: Vec<Connection>,
    next_token: usize,
}

impl Server {
    /// Wire the listener and the signal source onto a fresh poll.
    ///
    /// `INT` and `TERM` are observed only through the pollable signal source;
    /// their default dispositions never fire while it is installed.
    pub fn new(mut listener: TcpListener, upstream_addr: SocketAddr) -> Result<Self, ServerError> {
        let poll = Poll::new().map_err(ServerError::CreatePoll)?;
        let mut signals = Signals::new([SIGINT, SIGTERM]).map_err(ServerError::SignalSource)?;

        poll.registry()
            .register(&mut signals, SIGNAL, Interest::READABLE)
            .map_err(|source| ServerError::Register { what: "signal source", source })?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)
            .map_err(|source| ServerError::Register { what: "listener", source })?;

        Ok(Self {
            poll,
            events: Events::with_capacity(1024),
            listener,
            signals,
            upstream_addr,
            connections: Vec::new(),
            next_token: FIRST_CONN_TOKEN,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Block until a shutdown signal arrives. `Ok` is the clean, signal-driven
    /// exit; all sockets release on drop.
    pub fn run(&mut self) -> Result<(), ServerError> {
        loop {
            if let Err(err) = self.poll.poll(&mut self.events, None) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(ServerError::Wait(err));
            }

            let mut stop = false;
            let mut accept_ready = false;
            for event in &self.events {
                match event.token() {
                    SIGNAL => stop = true,
                    LISTENER => accept_ready = true,
                    token => {
                        if let Some(conn) =
                            self.connections.iter_mut().find(|conn| conn.owns(token))
                        {
                            conn.note_event(event);
                        } else {
                            // Can only happen for a pairing retired earlier in
                            // this same batch; readiness for it is moot.
                            debug!(?token, "event for a retired connection");
                        }
                    }
                }
            }

            let registry = self.poll.registry();
            self.connections.retain_mut(|conn| conn.service(registry));

            if stop {
                for signal in self.signals.pending() {
                    info!(signal, "signal received, shutting down");
                }
                return Ok(());
            }

            if accept_ready {
                self.accept_clients();
            }
        }
    }

    /// Drain the accept queue. Any failure while preparing a pairing abandons
    /// that client and leaves the listener untouched.
    fn accept_clients(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((client, peer_addr)) => {
                    info!(%peer_addr, "client connected");
                    match self.pair_with_upstream(client) {
                        Ok(conn) => self.connections.push(conn),
                        Err(err) => {
                            warn!(%peer_addr, %err, "abandoning client, pairing setup failed");
                        }
                    }
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    warn!(%err, "accept failed");
                    return;
                }
            }
        }
    }

    /// Dial the fixed destination for a freshly accepted client and register
    /// the pair. The connect is non-blocking; in-progress is success here and
    /// the first writable edge completes it.
    fn pair_with_upstream(&mut self, client: TcpStream) -> io::Result<Connection> {
        let upstream = TcpStream::connect(self.upstream_addr)?;
        set_keepalive(&client)?;
        set_keepalive(&upstream)?;

        let client_token = Token(self.next_token);
        let upstream_token = Token(self.next_token + 1);
        let mut conn = Connection::new(client, client_token, upstream, upstream_token);
        conn.register(self.poll.registry())?;
        self.next_token += 2;
        Ok(conn)
    }
}
