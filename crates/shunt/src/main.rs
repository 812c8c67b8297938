use std::{
    io,
    net::{SocketAddr, ToSocketAddrs},
    process::ExitCode,
};

use clap::Parser;
use shunt_net::tcp::{Server, bind_listener};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Event-driven TCP forwarding proxy: accepts clients on the listen address
/// and shuttles bytes to and from a fixed upstream destination.
#[derive(Debug, Parser)]
#[command(name = "shunt")]
struct Args {
    /// Address to listen on.
    listen_address: String,
    /// Port to listen on.
    listen_port: u16,
    /// Host to forward to.
    dest_host: String,
    /// Port to forward to.
    dest_port: u16,
}

/// Resolve a host/port pair to the first IPv4 address it yields.
fn resolve(host: &str, port: u16, role: &str) -> Option<SocketAddr> {
    match (host, port).to_socket_addrs() {
        Ok(mut addrs) => {
            let found = addrs.find(SocketAddr::is_ipv4);
            if found.is_none() {
                error!(host, port, role, "no IPv4 address for host");
            }
            found
        }
        Err(err) => {
            error!(host, port, role, %err, "can't resolve host");
            None
        }
    }
}

fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();

    let Some(listen_addr) = resolve(&args.listen_address, args.listen_port, "listen") else {
        return ExitCode::FAILURE;
    };
    let Some(upstream_addr) = resolve(&args.dest_host, args.dest_port, "destination") else {
        return ExitCode::FAILURE;
    };

    let listener = match bind_listener(listen_addr) {
        Ok(listener) => listener,
        Err(err) => {
            error!(%listen_addr, %err, "can't bind listener");
            return ExitCode::FAILURE;
        }
    };

    let mut server = match Server::new(listener, upstream_addr) {
        Ok(server) => server,
        Err(err) => {
            error!(%err, "startup failed");
            return ExitCode::FAILURE;
        }
    };

    info!(%listen_addr, %upstream_addr, "forwarding");
    match server.run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "event loop failed");
            ExitCode::FAILURE
        }
    }
}
