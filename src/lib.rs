pub use crate::config::{ApplicationConfig, HostPort};
pub use crate::entrypoint::entrypoint;

mod allowlist;
mod browser;
mod config;
mod destination;
mod directory;
mod droppable_handle;
mod entrypoint;
mod error;
mod session;
mod session_config;
mod shutdown;
mod transport;
mod upstream;
