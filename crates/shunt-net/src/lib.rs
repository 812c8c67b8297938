pub mod tcp;

pub use tracing;
