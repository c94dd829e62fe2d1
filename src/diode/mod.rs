//! This module contains the implementation details of `zener`.
//!
//! By default, it is hidden to the user, unless explicitly enabled
//! with the feature flag `expose_impl`.

pub mod async_runtime;
pub mod blockquick;
pub mod bns;
pub mod chain;
pub mod channel;
pub mod codec;
pub mod crypto;
pub mod dialer;
pub mod error;
pub mod port;
pub mod rpc;
pub mod store;
pub mod ticket;
pub mod transport;

use error::*;

/// Configure the init process of the library.
pub struct InitConfig {
    /// Number of threads used by the async runtime.
    pub async_threads: usize,
}

/// Initializes the async runtime driving the client actors.
///
/// The returned runtime must outlive every client spawned on it;
/// embedders already running their own runtime can skip this and
/// start clients from within it.
pub fn init(c: InitConfig) -> Result<async_runtime::Runtime> {
    async_runtime::init(c.async_threads).simple_msg(ErrorKind::Transport, "async runtime setup")
}
