//! Abstractions over the async runtime executing the client's tasks.

#[cfg(feature = "async_runtime_tokio")]
mod tokio;

#[cfg(feature = "async_runtime_tokio")]
pub use self::tokio::{init, spawn, JoinHandle, Runtime};
