//! Picking an edge server and dialing devices by identity or
//! registered name.

use std::str::FromStr;
use std::time::Duration;

use either::Either::{self, Left, Right};
use futures::{pin_mut, select, FutureExt};
use futures_timer::Delay;
use log::debug;
use parking_lot::RwLock;

use crate::diode::bns;
use crate::diode::crypto::signature::Address;
use crate::diode::error::*;
use crate::diode::port::{self, Conn};
use crate::diode::rpc::proto::PortMode;
use crate::diode::rpc::Client;
use crate::diode::transport::TlsSetup;

/// Port assumed when the dialed address names none.
pub const DEFAULT_PORT: u64 = 80;

/// The set of configured edge servers, picked by handshake latency.
pub struct ServerPool {
    clients: RwLock<Vec<Client>>,
    tls: TlsSetup,
}

impl ServerPool {
    pub fn new(tls: TlsSetup) -> Self {
        Self {
            clients: RwLock::new(Vec::new()),
            tls,
        }
    }

    pub fn add(&self, client: Client) {
        self.clients.write().push(client);
    }

    pub fn clients(&self) -> Vec<Client> {
        self.clients.read().iter().cloned().collect()
    }

    /// The lowest-latency client currently ready for traffic.
    pub fn best(&self) -> Result<Client> {
        self.clients
            .read()
            .iter()
            .filter(|client| client.is_ready())
            .min_by_key(|client| client.latency().unwrap_or(Duration::MAX))
            .cloned()
            .ok_or_else(|| Error::wrapped(ErrorKind::Transport, "No edge server is ready"))
    }

    /// Dials `addr` — `<name>.<tld>[:port]` or `<hex identity>[:port]`
    /// — through the best edge. With `network == "tls"` the returned
    /// stream carries the end-to-end encryption layer.
    pub async fn dial(&self, network: &str, addr: &str) -> Result<Conn> {
        let target = parse_target(addr)?;
        let client = self.best()?;

        let candidates = match target.host {
            Right(device) => vec![device],
            Left(name) => bns::resolve_bns(&client, &name).await?,
        };

        let mut last_err = None;
        for device in candidates {
            match client
                .connect_device(device, target.port, PortMode::ReadWrite)
                .await
            {
                Ok(opened) => {
                    return if network == "tls" {
                        port::secure(opened, &self.tls).await
                    } else {
                        Ok(Conn::Plain(opened))
                    };
                }
                Err(e) => {
                    debug!("dialing {} via {} failed: {}", device, client.host(), e);
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| Error::simple(ErrorKind::EmptyBnsResult)))
    }

    /// Like `dial`, bounded by a caller deadline.
    pub async fn dial_with_timeout(
        &self,
        network: &str,
        addr: &str,
        timeout: Duration,
    ) -> Result<Conn> {
        let dialing = self.dial(network, addr).fuse();
        let deadline = Delay::new(timeout).fuse();
        pin_mut!(dialing, deadline);
        select! {
            conn = dialing => conn,
            _ = deadline => Err(Error::wrapped(
                ErrorKind::Cancelled(addr.to_string()),
                "dial deadline elapsed",
            )),
        }
    }

    /// Closes every client in the pool.
    pub async fn close(&self) {
        for client in self.clients() {
            let _ = client.close().await;
        }
    }
}

struct Target {
    host: Either<String, Address>,
    port: u64,
}

fn parse_target(addr: &str) -> Result<Target> {
    let (host, port) = match addr.rsplit_once(':') {
        Some((host, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => {
            let port = port
                .parse()
                .wrapped_msg(ErrorKind::EmptyBnsResult, "dialed port")?;
            (host, port)
        }
        _ => (addr, DEFAULT_PORT),
    };
    if host.is_empty() {
        return Err("Empty dial address").wrapped(ErrorKind::EmptyBnsResult);
    }

    let bare = host.strip_prefix("0x").unwrap_or(host);
    if bare.len() == 2 * Address::LENGTH && bare.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Ok(Target {
            host: Right(Address::from_str(host)?),
            port,
        });
    }

    // names are addressed as <name>.<tld>; the registry stores the
    // bare label
    let name = host.split('.').next().unwrap_or(host);
    Ok(Target {
        host: Left(name.to_ascii_lowercase()),
        port,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hex_identity() {
        let hex = "0x00112233445566778899aabbccddeeff00112233";
        let target = parse_target(hex).expect("parse");
        match target.host {
            Right(device) => assert_eq!(device.to_string(), hex),
            Left(name) => panic!("parsed as name {:?}", name),
        }
        assert_eq!(target.port, DEFAULT_PORT);
    }

    #[test]
    fn test_parse_bare_hex_with_port() {
        let target =
            parse_target("00112233445566778899aabbccddeeff00112233:8443").expect("parse");
        assert!(matches!(target.host, Right(_)));
        assert_eq!(target.port, 8443);
    }

    #[test]
    fn test_parse_name_with_tld() {
        let target = parse_target("pi.diode:22").expect("parse");
        match target.host {
            Left(name) => assert_eq!(name, "pi"),
            Right(_) => panic!("parsed as identity"),
        }
        assert_eq!(target.port, 22);
    }

    #[test]
    fn test_parse_name_defaults_port() {
        let target = parse_target("camera.diode").expect("parse");
        assert!(matches!(target.host, Left(ref name) if name == "camera"));
        assert_eq!(target.port, DEFAULT_PORT);
    }

    #[test]
    fn test_parse_rejects_empty() {
        assert!(parse_target("").is_err());
        assert!(parse_target(":80").is_err());
    }
}
