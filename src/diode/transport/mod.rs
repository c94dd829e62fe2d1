//! The authenticated TLS channel carrying framed terms to an edge
//! server.
//!
//! Certificate chains are not what authenticates an edge: host
//! verification is disabled, the presented certificate is captured
//! during the handshake, and the secp256k1 point inside it pins the
//! server identity against the chain's registry. Byte counters on
//! the channel are what gates usage ticket emission.

pub mod socket;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_tls::TlsConnector;
use futures::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use parking_lot::Mutex;
use rustls::ClientConfig;

use self::socket::Socket;
use crate::diode::codec;
use crate::diode::crypto::signature::{Address, PublicKey};
use crate::diode::error::*;

type TlsStream = async_tls::client::TlsStream<Socket>;

/// Monotonic traffic counters for one edge server, shared across
/// reconnects of its channel.
#[derive(Default)]
pub struct Counters {
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    connections: AtomicU64,
    ticketed: AtomicU64,
}

impl Counters {
    /// Total bytes moved over the channel, both directions.
    pub fn total_bytes(&self) -> u64 {
        self.bytes_in.load(Ordering::Relaxed) + self.bytes_out.load(Ordering::Relaxed)
    }

    /// Number of tunnels opened through this server.
    pub fn total_connections(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }

    pub fn add_connection(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    /// The byte total covered by the last submitted ticket.
    pub fn counter(&self) -> u64 {
        self.ticketed.load(Ordering::Relaxed)
    }

    pub fn update_counter(&self, n: u64) {
        self.ticketed.store(n, Ordering::Relaxed);
    }

    /// Forces the connection total forward, after a server resync.
    pub fn resync_connections(&self, n: u64) {
        let current = self.connections.load(Ordering::Relaxed);
        if n > current {
            self.connections.store(n, Ordering::Relaxed);
        }
    }

    /// Forces the byte total forward, after a server resync.
    pub fn resync_bytes(&self, n: u64) {
        let current = self.total_bytes();
        if n > current {
            self.bytes_out.fetch_add(n - current, Ordering::Relaxed);
        }
    }
}

/// TLS material for dialing edges.
#[derive(Clone, Default)]
pub struct TlsSetup {
    /// DER certificate and key presented for mutual auth, when the
    /// fleet requires it.
    pub client_cert: Option<(Vec<u8>, Vec<u8>)>,
    /// TCP keepalive probe interval.
    pub keepalive: Option<Duration>,
}

/// What the handshake learned about the channel.
pub struct ChannelInfo {
    pub host: String,
    pub server_id: Option<Address>,
    pub local_addr: SocketAddr,
    pub latency: Duration,
}

/// One established channel, split for concurrent reading and
/// writing.
pub struct Connection {
    pub reader: FrameReader,
    pub writer: FrameWriter,
    pub info: ChannelInfo,
}

pub struct FrameReader {
    inner: ReadHalf<TlsStream>,
    counters: Arc<Counters>,
}

pub struct FrameWriter {
    inner: WriteHalf<TlsStream>,
    counters: Arc<Counters>,
}

/// Dials `host` and completes the TLS handshake, sampling its
/// duration as the channel latency.
pub async fn dial(host: &str, setup: &TlsSetup, counters: Arc<Counters>) -> Result<Connection> {
    let sock = socket::connect(host, setup.keepalive)
        .await
        .wrapped_msg(ErrorKind::Transport, "connecting to edge")?;
    let local_addr = sock.local_addr()?;

    let captured: Arc<Mutex<Option<Vec<u8>>>> = Arc::new(Mutex::new(None));
    let mut config = ClientConfig::new();
    config
        .dangerous()
        .set_certificate_verifier(capture_verifier(captured.clone()));
    if let Some((cert, key)) = &setup.client_cert {
        config
            .set_single_client_cert(
                vec![rustls::Certificate(cert.clone())],
                rustls::PrivateKey(key.clone()),
            )
            .wrapped(ErrorKind::Transport)?;
    }
    let connector: TlsConnector = config.into();

    // rustls still wants a name for SNI; identity comes from the
    // pinned key, not the certificate chain
    let sni = host.split(':').next().unwrap_or(host);

    let started = Instant::now();
    let stream = connector
        .connect(sni, sock)
        .await
        .wrapped_msg(ErrorKind::Transport, "TLS handshake")?;
    let latency = started.elapsed();

    let server_id = captured
        .lock()
        .take()
        .as_deref()
        .and_then(extract_secp256k1_point)
        .map(|key| key.address());

    let (reader, writer) = stream.split();
    Ok(Connection {
        reader: FrameReader {
            inner: reader,
            counters: counters.clone(),
        },
        writer: FrameWriter {
            inner: writer,
            counters,
        },
        info: ChannelInfo {
            host: host.to_string(),
            server_id,
            local_addr,
            latency,
        },
    })
}

impl FrameWriter {
    /// Writes one length-prefixed frame.
    pub async fn write_frame(&mut self, payload: &[u8]) -> Result<()> {
        if payload.len() > codec::MAX_PAYLOAD {
            return Err(codec::malformed("Frame payload is oversized"));
        }
        self.inner
            .write_all(&(payload.len() as u16).to_be_bytes())
            .await?;
        self.inner.write_all(payload).await?;
        self.inner.flush().await?;
        self.counters
            .bytes_out
            .fetch_add(2 + payload.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    pub async fn close(&mut self) {
        let _ = self.inner.close().await;
    }
}

impl FrameReader {
    /// Reads one length-prefixed frame.
    pub async fn read_frame(&mut self) -> Result<Vec<u8>> {
        let mut prefix = [0; 2];
        self.inner.read_exact(&mut prefix).await?;
        let len = u16::from_be_bytes(prefix) as usize;
        let mut payload = vec![0; len];
        self.inner.read_exact(&mut payload).await?;
        self.counters
            .bytes_in
            .fetch_add(2 + len as u64, Ordering::Relaxed);
        Ok(payload)
    }
}

/// A verifier approving any chain while capturing the leaf, so the
/// caller can pin the key inside it. Shared with the end-to-end
/// layer, which pins devices the same way.
pub(crate) fn capture_verifier(
    slot: Arc<Mutex<Option<Vec<u8>>>>,
) -> Arc<dyn rustls::ServerCertVerifier> {
    Arc::new(CaptureServerCert { slot })
}

struct CaptureServerCert {
    slot: Arc<Mutex<Option<Vec<u8>>>>,
}

impl rustls::ServerCertVerifier for CaptureServerCert {
    fn verify_server_cert(
        &self,
        _roots: &rustls::RootCertStore,
        presented_certs: &[rustls::Certificate],
        _dns_name: webpki::DNSNameRef<'_>,
        _ocsp_response: &[u8],
    ) -> std::result::Result<rustls::ServerCertVerified, rustls::TLSError> {
        if let Some(cert) = presented_certs.first() {
            *self.slot.lock() = Some(cert.0.clone());
        }
        Ok(rustls::ServerCertVerified::assertion())
    }
}

/// Picks the uncompressed secp256k1 point out of a certificate's
/// SPKI, which encodes it as a 66 byte BIT STRING:
/// `0x03 0x42 0x00 0x04 x ‖ y`.
pub(crate) fn extract_secp256k1_point(der: &[u8]) -> Option<PublicKey> {
    const MARKER: [u8; 4] = [0x03, 0x42, 0x00, 0x04];
    let at = der.windows(MARKER.len()).position(|w| w == MARKER)?;
    let point = der.get(at + 3..at + 3 + PublicKey::LENGTH)?;
    PublicKey::from_uncompressed(point).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diode::crypto::signature::KeyPair;

    #[test]
    fn test_counters_gate_tickets() {
        let counters = Counters::default();
        counters.bytes_in.store(3 * 1024 * 1024, Ordering::Relaxed);
        counters.bytes_out.store(2 * 1024 * 1024, Ordering::Relaxed);
        assert_eq!(counters.total_bytes(), 5 * 1024 * 1024);
        counters.update_counter(counters.total_bytes());
        assert_eq!(counters.counter(), 5 * 1024 * 1024);
        counters.resync_connections(7);
        counters.resync_connections(2);
        assert_eq!(counters.total_connections(), 7);
    }

    #[test]
    fn test_extract_point_from_spki() {
        let mut scalar = [0x2f; 32];
        scalar[0] = 0x01;
        let keys = KeyPair::from_secret(&scalar).expect("valid scalar");
        let point = keys.public_key();

        // a plausible DER neighborhood around the SPKI BIT STRING
        let mut der = vec![0x30, 0x82, 0x01, 0x00, 0xa0, 0x03];
        der.extend_from_slice(&[0x03, 0x42, 0x00]);
        der.extend_from_slice(point.as_bytes());
        der.extend_from_slice(&[0x30, 0x03]);

        let found = extract_secp256k1_point(&der).expect("point in SPKI");
        assert_eq!(found.address(), point.address());
    }

    #[test]
    fn test_extract_point_absent() {
        assert!(extract_secp256k1_point(&[0x30, 0x11, 0x22]).is_none());
    }
}
