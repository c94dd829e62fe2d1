//! The pool of open tunnels, and the virtual byte streams front-ends
//! read and write.
//!
//! Ports live in the pool's storage keyed by `(client, reference)`;
//! a `ConnectedPort` holds only its client handle and its end of the
//! inbound queue, so tearing down a client is a plain walk over the
//! pool with no ownership cycles to break.

use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use async_tls::TlsConnector;
use futures::channel::mpsc;
use futures::future::BoxFuture;
use futures::io::{AsyncRead, AsyncWrite};
use futures::stream::Stream;
use log::debug;
use parking_lot::Mutex;
use rustls::ClientConfig;

use crate::diode::crypto::signature::Address;
use crate::diode::error::*;
use crate::diode::rpc::{Client, ClientId};
use crate::diode::transport::{self, TlsSetup};

/// Chunks queued per port before the demultiplexer waits.
pub const PORT_BUFFER: usize = 64;

/// Largest payload of one `portsend` frame.
pub const MAX_CHUNK: usize = 65000;

struct Entry {
    data: mpsc::Sender<Vec<u8>>,
    receiver: Option<mpsc::Receiver<Vec<u8>>>,
    closed: Arc<AtomicBool>,
}

/// All open ports of every client in the process.
#[derive(Default)]
pub struct Pool {
    ports: Mutex<HashMap<(ClientId, Vec<u8>), Entry>>,
}

impl Pool {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers a fresh reference. Returns false when the reference
    /// is already present, which a server must never produce.
    pub fn insert(&self, client: ClientId, reference: &[u8]) -> bool {
        let mut ports = self.ports.lock();
        let key = (client, reference.to_vec());
        if ports.contains_key(&key) {
            return false;
        }
        let (tx, rx) = mpsc::channel(PORT_BUFFER);
        ports.insert(
            key,
            Entry {
                data: tx,
                receiver: Some(rx),
                closed: Arc::new(AtomicBool::new(false)),
            },
        );
        true
    }

    /// Hands out the consumer half of a port, exactly once.
    pub fn take_receiver(
        &self,
        client: ClientId,
        reference: &[u8],
    ) -> Option<(mpsc::Receiver<Vec<u8>>, Arc<AtomicBool>)> {
        let mut ports = self.ports.lock();
        let entry = ports.get_mut(&(client, reference.to_vec()))?;
        Some((entry.receiver.take()?, entry.closed.clone()))
    }

    /// The inbound sender for a port, for the demultiplexer.
    pub fn sender(&self, client: ClientId, reference: &[u8]) -> Option<mpsc::Sender<Vec<u8>>> {
        let ports = self.ports.lock();
        let entry = ports.get(&(client, reference.to_vec()))?;
        if entry.closed.load(Ordering::Relaxed) {
            return None;
        }
        Some(entry.data.clone())
    }

    /// Drops a port, closing its local endpoint. Idempotent.
    pub fn remove(&self, client: ClientId, reference: &[u8]) -> bool {
        let mut ports = self.ports.lock();
        match ports.remove(&(client, reference.to_vec())) {
            Some(entry) => {
                entry.closed.store(true, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Closes every port owned by `client` in one sweep.
    pub fn close_ports(&self, client: ClientId) {
        let mut ports = self.ports.lock();
        let refs: Vec<_> = ports
            .keys()
            .filter(|(owner, _)| *owner == client)
            .cloned()
            .collect();
        for key in refs {
            if let Some(entry) = ports.remove(&key) {
                entry.closed.store(true, Ordering::Relaxed);
            }
        }
    }

    pub fn open_ports(&self, client: ClientId) -> usize {
        self.ports
            .lock()
            .keys()
            .filter(|(owner, _)| *owner == client)
            .count()
    }
}

/// A bidirectional virtual connection through an edge tunnel.
///
/// Reads drain the port's bounded inbound queue; writes fragment
/// into `portsend` frames submitted through the owning client.
pub struct ConnectedPort {
    reference: Vec<u8>,
    device: Address,
    client: Client,
    data: mpsc::Receiver<Vec<u8>>,
    leftover: Vec<u8>,
    offset: usize,
    closed: Arc<AtomicBool>,
    sent_chunks: u64,
    pending_write: Option<(usize, BoxFuture<'static, Result<()>>)>,
    pending_close: Option<BoxFuture<'static, Result<()>>>,
}

impl ConnectedPort {
    pub(crate) fn new(
        client: Client,
        device: Address,
        reference: Vec<u8>,
        data: mpsc::Receiver<Vec<u8>>,
        closed: Arc<AtomicBool>,
    ) -> Self {
        Self {
            reference,
            device,
            client,
            data,
            leftover: Vec::new(),
            offset: 0,
            closed,
            sent_chunks: 0,
            pending_write: None,
            pending_close: None,
        }
    }

    pub fn reference(&self) -> &[u8] {
        &self.reference
    }

    pub fn device(&self) -> &Address {
        &self.device
    }

    /// Chunks pushed into the tunnel so far.
    pub fn sent_chunks(&self) -> u64 {
        self.sent_chunks
    }

    /// Sends a payload, fragmenting it into tunnel-sized chunks.
    pub async fn send(&mut self, bytes: &[u8]) -> Result<()> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(Error::simple(ErrorKind::ClientClosed));
        }
        for chunk in bytes.chunks(MAX_CHUNK) {
            self.client
                .port_send(self.reference.clone(), chunk.to_vec())
                .await?;
            self.sent_chunks += 1;
        }
        Ok(())
    }

    /// Receives the next inbound chunk; `None` once the tunnel is
    /// closed and drained.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        use futures::stream::StreamExt;
        if self.offset < self.leftover.len() {
            let rest = self.leftover.split_off(self.offset);
            self.leftover = Vec::new();
            self.offset = 0;
            return Some(rest);
        }
        self.data.next().await
    }

    /// Closes the tunnel: best-effort `portclose` to the edge, then
    /// the local endpoint detaches. A double close is a no-op.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed.swap(true, Ordering::Relaxed) {
            return Ok(());
        }
        if let Err(e) = self.client.port_close(self.reference.clone()).await {
            debug!("portclose for {} failed: {}", hex::encode(&self.reference), e);
        }
        Ok(())
    }

    fn start_write(&mut self, buf: &[u8]) {
        let chunk = &buf[..buf.len().min(MAX_CHUNK)];
        let client = self.client.clone();
        let reference = self.reference.clone();
        let data = chunk.to_vec();
        self.sent_chunks += 1;
        self.pending_write = Some((
            chunk.len(),
            Box::pin(async move { client.port_send(reference, data).await }),
        ));
    }
}

fn broken_pipe(e: Error) -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, e)
}

impl AsyncRead for ConnectedPort {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        loop {
            if self.offset < self.leftover.len() {
                let n = buf.len().min(self.leftover.len() - self.offset);
                buf[..n].copy_from_slice(&self.leftover[self.offset..self.offset + n]);
                self.offset += n;
                return Poll::Ready(Ok(n));
            }
            match Pin::new(&mut self.data).poll_next(cx) {
                Poll::Ready(Some(chunk)) => {
                    self.leftover = chunk;
                    self.offset = 0;
                }
                Poll::Ready(None) => return Poll::Ready(Ok(0)),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for ConnectedPort {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        loop {
            if let Some((len, fut)) = self.pending_write.as_mut() {
                let len = *len;
                return match fut.as_mut().poll(cx) {
                    Poll::Ready(Ok(())) => {
                        self.pending_write = None;
                        Poll::Ready(Ok(len))
                    }
                    Poll::Ready(Err(e)) => {
                        self.pending_write = None;
                        Poll::Ready(Err(broken_pipe(e)))
                    }
                    Poll::Pending => Poll::Pending,
                };
            }
            if self.closed.load(Ordering::Relaxed) {
                return Poll::Ready(Err(io::Error::from(io::ErrorKind::BrokenPipe)));
            }
            if buf.is_empty() {
                return Poll::Ready(Ok(0));
            }
            self.start_write(buf);
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if let Some((_, fut)) = self.pending_write.as_mut() {
            match fut.as_mut().poll(cx) {
                Poll::Ready(Ok(())) => self.pending_write = None,
                Poll::Ready(Err(e)) => {
                    self.pending_write = None;
                    return Poll::Ready(Err(broken_pipe(e)));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
        Poll::Ready(Ok(()))
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.as_mut().poll_flush(cx) {
            Poll::Ready(Ok(())) => {}
            other => return other,
        }
        if self.pending_close.is_none() {
            if self.closed.swap(true, Ordering::Relaxed) {
                return Poll::Ready(Ok(()));
            }
            let client = self.client.clone();
            let reference = self.reference.clone();
            self.pending_close = Some(Box::pin(async move { client.port_close(reference).await }));
        }
        let fut = self.pending_close.as_mut().expect("close future was set");
        match fut.as_mut().poll(cx) {
            Poll::Ready(result) => {
                self.pending_close = None;
                if let Err(e) = result {
                    debug!("portclose failed: {}", e);
                }
                Poll::Ready(Ok(()))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// The byte stream handed to front-ends: the raw tunnel, or the
/// tunnel with the end-to-end TLS layer on top.
pub enum Conn {
    Plain(ConnectedPort),
    Secure {
        device: Address,
        stream: Box<async_tls::client::TlsStream<ConnectedPort>>,
    },
}

impl Conn {
    pub fn device(&self) -> &Address {
        match self {
            Conn::Plain(port) => port.device(),
            Conn::Secure { device, .. } => device,
        }
    }
}

/// Runs the nested TLS handshake over an open tunnel, hiding the
/// byte stream from the relaying edge.
///
/// The device's certificate is pinned against its overlay identity,
/// exactly like an edge server's is.
pub async fn secure(port: ConnectedPort, setup: &TlsSetup) -> Result<Conn> {
    let device = *port.device();
    let captured: Arc<Mutex<Option<Vec<u8>>>> = Arc::new(Mutex::new(None));

    let mut config = ClientConfig::new();
    config
        .dangerous()
        .set_certificate_verifier(transport::capture_verifier(captured.clone()));
    if let Some((cert, key)) = &setup.client_cert {
        config
            .set_single_client_cert(
                vec![rustls::Certificate(cert.clone())],
                rustls::PrivateKey(key.clone()),
            )
            .wrapped(ErrorKind::Transport)?;
    }
    let connector: TlsConnector = config.into();

    let sni = hex::encode(device.as_ref());
    let stream = connector
        .connect(&sni, port)
        .await
        .wrapped_msg(ErrorKind::Transport, "end-to-end handshake")?;

    let presented = captured
        .lock()
        .take()
        .as_deref()
        .and_then(transport::extract_secp256k1_point)
        .map(|key| key.address());
    match presented {
        Some(identity) if identity == device => Ok(Conn::Secure {
            device,
            stream: Box::new(stream),
        }),
        Some(_) => Err("Device presented a foreign identity").wrapped(ErrorKind::SignatureInvalid),
        None => Err("Device certificate carries no usable key")
            .wrapped(ErrorKind::SignatureInvalid),
    }
}

impl AsyncRead for Conn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Conn::Plain(port) => Pin::new(port).poll_read(cx, buf),
            Conn::Secure { stream, .. } => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Conn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Conn::Plain(port) => Pin::new(port).poll_write(cx, buf),
            Conn::Secure { stream, .. } => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Conn::Plain(port) => Pin::new(port).poll_flush(cx),
            Conn::Secure { stream, .. } => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Conn::Plain(port) => Pin::new(port).poll_close(cx),
            Conn::Secure { stream, .. } => Pin::new(stream.as_mut()).poll_close(cx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_references_are_unique_per_client() {
        let pool = Pool::new();
        assert!(pool.insert(1, b"ref-a"));
        assert!(!pool.insert(1, b"ref-a"));
        // the same reference under another client is a distinct port
        assert!(pool.insert(2, b"ref-a"));
    }

    #[test]
    fn test_receiver_taken_once() {
        let pool = Pool::new();
        pool.insert(1, b"ref-a");
        assert!(pool.take_receiver(1, b"ref-a").is_some());
        assert!(pool.take_receiver(1, b"ref-a").is_none());
    }

    #[test]
    fn test_remove_is_idempotent_and_closes() {
        let pool = Pool::new();
        pool.insert(1, b"ref-a");
        let (_rx, closed) = pool.take_receiver(1, b"ref-a").expect("receiver");
        assert!(pool.remove(1, b"ref-a"));
        assert!(!pool.remove(1, b"ref-a"));
        assert!(closed.load(Ordering::Relaxed));
        assert!(pool.sender(1, b"ref-a").is_none());
    }

    #[test]
    fn test_close_ports_sweeps_one_client() {
        let pool = Pool::new();
        pool.insert(1, b"ref-a");
        pool.insert(1, b"ref-b");
        pool.insert(2, b"ref-c");
        pool.close_ports(1);
        assert_eq!(pool.open_ports(1), 0);
        assert_eq!(pool.open_ports(2), 1);
    }

    #[test]
    fn test_inbound_queue_eof_after_remove() {
        use futures::stream::StreamExt;
        let pool = Pool::new();
        pool.insert(1, b"ref-a");
        let mut sender = pool.sender(1, b"ref-a").expect("sender");
        let (mut rx, _closed) = pool.take_receiver(1, b"ref-a").expect("receiver");
        sender.try_send(vec![1, 2, 3]).expect("queue");
        pool.remove(1, b"ref-a");
        drop(sender);

        futures::executor::block_on(async {
            assert_eq!(rx.next().await, Some(vec![1, 2, 3]));
            assert_eq!(rx.next().await, None);
        });
    }
}
