//! Abstractions over TCP sockets, so the TLS layer always speaks
//! `futures::io` traits regardless of the runtime backend.

#[cfg(feature = "socket_tokio_tcp")]
mod tokio_tcp;

#[cfg(feature = "socket_tokio_tcp")]
pub use tokio_tcp::{connect, Socket};
