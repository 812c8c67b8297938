mod connection;
mod forwarder;
mod ring;
mod server;
mod socket;

pub use ring::RingBuffer;
pub use server::{Server, ServerError};
pub use socket::bind_listener;
