//! A client for the Diode peer-to-peer overlay network.
//!
//! Remote devices, addressed by a 20 byte identity or a name in the
//! on-chain registry, are reached by tunneling TCP through
//! authenticated TLS sessions to a pool of edge servers. The servers
//! charge for relayed traffic with signed usage tickets and prove
//! their honesty by serving block headers that a sliding-window
//! light client verifies locally.

#[cfg(not(feature = "expose_impl"))]
mod diode;

#[cfg(feature = "expose_impl")]
pub mod diode;

pub use diode::blockquick::{validate_network, BlockHeader, HeaderSource, Window};
pub use diode::bns::{resolve_bns, resolve_owner, resolve_reverse};
pub use diode::chain::{get_account_value_raw, ChainReader};
pub use diode::codec::Term;
pub use diode::crypto::hash::Digest;
pub use diode::crypto::signature::{Address, KeyPair, PublicKey, Signature};
pub use diode::dialer::ServerPool;
pub use diode::error::{Error, ErrorKind, Result};
pub use diode::port::{Conn, ConnectedPort, Pool};
pub use diode::rpc::proto::{PortMode, Request, Response};
pub use diode::rpc::{Client, ClientState, Config, InboundPortOpen};
pub use diode::store::Store;
pub use diode::ticket::DeviceTicket;
pub use diode::transport::TlsSetup;
pub use diode::{init, InitConfig};
