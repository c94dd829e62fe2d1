//! The per-edge-server RPC client.
//!
//! A `Client` is a cheap-clone handle; all mutable state (the secure
//! channel, the call manager, the block window, the ticket ledger)
//! belongs to a single actor task owning a bounded mailbox. Public
//! operations post an event and either await a reply slot or return
//! as soon as the event is accepted, so no locks guard the hot
//! state.

pub mod calls;
pub mod proto;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::{pin_mut, select, FutureExt};
use futures_timer::Delay;
use log::{debug, info, warn};
use parking_lot::Mutex;
use rand_core::{OsRng, RngCore};

use self::calls::{Call, CallKind, CallManager, Delivered, MAX_INFLIGHT};
use self::proto::{Inbound, PortMode, Request, Response, TicketReply};
use crate::diode::async_runtime as rt;
use crate::diode::blockquick::{
    self, BlockHeader, HeaderSource, Window, CONFIRMATIONS, GENESIS_HASH, GENESIS_NUMBER,
    WINDOW_SIZE,
};
use crate::diode::chain::ChainReader;
use crate::diode::channel::{
    new_message_channel, new_reply_channel, MessageChannelRx, MessageChannelTx, ReplyTx,
};
use crate::diode::codec::{self, Term};
use crate::diode::crypto::hash::Digest;
use crate::diode::crypto::signature::{Address, KeyPair};
use crate::diode::error::*;
use crate::diode::port::{ConnectedPort, Pool};
use crate::diode::store::Store;
use crate::diode::ticket::{DeviceTicket, RESYNC_BYTES, RESYNC_CONNECTIONS, TICKET_BOUND};
use crate::diode::transport::{self, Counters, FrameWriter, TlsSetup};

/// Identity of one client within the process, keying its ports in
/// the pool.
pub type ClientId = u64;

/// Version announced in the greeting.
pub const EDGE_PROTOCOL_VERSION: u64 = 1000;

// max no. of events allowed in the mailbox
const CHAN_BOUND: usize = 128;

// how long posting an event may wait for mailbox capacity
const LOCAL_TIMEOUT: Duration = Duration::from_millis(100);

// ping / window advance cadence
const TICK_INTERVAL: Duration = Duration::from_secs(15);

// reconnect backoff bounds
const RETRY_WAIT_MIN: Duration = Duration::from_secs(5);
const RETRY_WAIT_MAX: Duration = Duration::from_secs(10);

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

/// Connection lifecycle of a client.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ClientState {
    Unconnected,
    Dialing,
    Validating,
    Ready,
    Closing,
    Closed,
}

/// Configuration used to start a `Client`.
pub struct Config {
    /// The edge server, as `host:port`.
    pub host: String,
    /// The long-lived identity signing tickets.
    pub keys: Arc<KeyPair>,
    /// The fleet contract this identity operates under.
    pub fleet: Address,
    /// Dial attempts per connection loss.
    pub retry_times: usize,
    /// Deadline for ordinary calls.
    pub rpc_timeout: Duration,
    /// Deadline for `portopen`, matching the server side.
    pub portopen_timeout: Duration,
    /// TLS material and keepalive for the channel.
    pub tls: TlsSetup,
    /// Queue depth for inbound `portopen` requests.
    pub inbound_bound: usize,
}

impl Config {
    pub fn new(host: String, keys: Arc<KeyPair>, fleet: Address) -> Self {
        Self {
            host,
            keys,
            fleet,
            retry_times: 3,
            rpc_timeout: Duration::from_secs(30),
            portopen_timeout: Duration::from_secs(15),
            tls: TlsSetup::default(),
            inbound_bound: 8,
        }
    }
}

/// A device knocking on our door through the edge.
#[derive(Debug)]
pub struct InboundPortOpen {
    pub request_id: u64,
    pub port: u64,
    pub reference: Vec<u8>,
    pub device: Address,
}

enum Event {
    Call(Call),
    Cancel(u64),
    Frame(u64, Vec<u8>),
    Disconnected(u64, Error),
    Validated(u64, Result<Window>),
    Advance(Result<(u64, Vec<BlockHeader>)>),
    Tick,
    Respond(Vec<u8>),
    Close(Option<ReplyTx<()>>),
}

struct Shared {
    closed: AtomicBool,
    state: Mutex<ClientState>,
    latency_us: AtomicU64,
    server_id: Mutex<Option<Address>>,
    local_addr: Mutex<Option<String>>,
    last_valid: Mutex<(u64, Digest)>,
    counters: Arc<Counters>,
    keys: Arc<KeyPair>,
    fleet: Address,
    rpc_timeout: Duration,
    portopen_timeout: Duration,
    inbound: Mutex<Option<MessageChannelRx<InboundPortOpen>>>,
    pool: Arc<Pool>,
}

/// Handle to one edge server connection.
pub struct Client {
    id: ClientId,
    host: Arc<str>,
    tx: MessageChannelTx<Event>,
    shared: Arc<Shared>,
}

impl Clone for Client {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            host: self.host.clone(),
            tx: self.tx.clone(),
            shared: self.shared.clone(),
        }
    }
}

impl Client {
    /// Spawns the client actor and returns its handle. The actor
    /// dials, validates the chain and greets in the background;
    /// calls submitted early are parked until the client is ready.
    pub fn start(config: Config, store: Arc<Store>, pool: Arc<Pool>) -> Client {
        let id = NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed);
        let host: Arc<str> = config.host.clone().into();
        let (tx, rx) = new_message_channel(CHAN_BOUND);
        let (inbound_tx, inbound_rx) = new_message_channel(config.inbound_bound);

        let default_anchor = (GENESIS_NUMBER, Digest::from(GENESIS_HASH));
        let shared = Arc::new(Shared {
            closed: AtomicBool::new(false),
            state: Mutex::new(ClientState::Unconnected),
            latency_us: AtomicU64::new(u64::MAX),
            server_id: Mutex::new(None),
            local_addr: Mutex::new(None),
            last_valid: Mutex::new(blockquick::restore_last_valid(&store, default_anchor)),
            counters: Arc::new(Counters::default()),
            keys: config.keys.clone(),
            fleet: config.fleet,
            rpc_timeout: config.rpc_timeout,
            portopen_timeout: config.portopen_timeout,
            inbound: Mutex::new(Some(inbound_rx)),
            pool,
        });

        let client = Client {
            id,
            host,
            tx: tx.clone(),
            shared,
        };

        let task = ClientTask {
            id,
            host: client.host.clone(),
            retry_times: config.retry_times,
            tls: config.tls,
            store,
            shared: client.shared.clone(),
            handle: client.clone(),
            rx,
            tx,
            inbound_tx,
            calls: CallManager::new(MAX_INFLIGHT),
            writer: None,
            window: None,
            parked: Vec::new(),
            epoch: 0,
            ticketing: false,
            ticket_retried: false,
            advancing: false,
            pending_ticket: None,
        };
        rt::spawn(task.run());
        client
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn state(&self) -> ClientState {
        *self.shared.state.lock()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ClientState::Ready
    }

    /// The TLS handshake duration of the current connection, used
    /// for server selection.
    pub fn latency(&self) -> Option<Duration> {
        match self.shared.latency_us.load(Ordering::Relaxed) {
            u64::MAX => None,
            us => Some(Duration::from_micros(us)),
        }
    }

    /// The pinned identity of the edge server, once connected.
    pub fn server_id(&self) -> Option<Address> {
        *self.shared.server_id.lock()
    }

    pub fn total_bytes(&self) -> u64 {
        self.shared.counters.total_bytes()
    }

    /// The newest validated block, as `(number, hash)`.
    pub fn last_valid(&self) -> (u64, Digest) {
        *self.shared.last_valid.lock()
    }

    /// Takes the subscription for inbound `portopen` requests; the
    /// actor refuses them while nobody holds it.
    pub fn take_inbound(&self) -> Option<MessageChannelRx<InboundPortOpen>> {
        self.shared.inbound.lock().take()
    }

    async fn post(&self, event: Event) -> Result<()> {
        if self.shared.closed.load(Ordering::Relaxed) {
            return Err(Error::simple(ErrorKind::ClientClosed));
        }
        let mut tx = self.tx.clone();
        let send = tx.send(event).fuse();
        let deadline = Delay::new(LOCAL_TIMEOUT).fuse();
        pin_mut!(send, deadline);
        select! {
            sent = send => sent,
            _ = deadline => Err(Error::simple(ErrorKind::BackpressureFull)),
        }
    }

    pub(crate) async fn call_kind(
        &self,
        request: Request,
        kind: CallKind,
        timeout: Duration,
    ) -> Result<Response> {
        let (reply_tx, reply_rx) = new_reply_channel();
        let id = next_request_id();
        let call = Call {
            id,
            method: request.method(),
            frame: request.encode(id)?,
            parse: request.parser(),
            reply: Some(reply_tx),
            kind,
        };
        self.post(Event::Call(call)).await?;

        let reply = reply_rx.recv(&self.host).fuse();
        let deadline = Delay::new(timeout).fuse();
        pin_mut!(reply, deadline);
        select! {
            result = reply => result?,
            _ = deadline => {
                // drop the in-flight entry; a late response is
                // discarded by the manager
                let mut tx = self.tx.clone();
                let _ = tx.try_send(Event::Cancel(id));
                Err(Error::wrapped(
                    ErrorKind::Cancelled(self.host.to_string()),
                    "call deadline elapsed",
                ))
            }
        }
    }

    /// Submits a call and waits for its response.
    pub async fn call(&self, request: Request) -> Result<Response> {
        let timeout = self.shared.rpc_timeout;
        self.call_kind(request, CallKind::User, timeout).await
    }

    /// Fire-and-forget submission; returns the request id once the
    /// actor accepted the call.
    pub async fn cast(&self, request: Request) -> Result<u64> {
        let id = next_request_id();
        let call = Call {
            id,
            method: request.method(),
            frame: request.encode(id)?,
            parse: request.parser(),
            reply: None,
            kind: CallKind::Internal,
        };
        self.post(Event::Call(call)).await?;
        Ok(id)
    }

    /// Replies to a server-initiated request.
    pub async fn respond_ok(&self, request_id: u64, args: Vec<Term>) -> Result<()> {
        self.post(Event::Respond(proto::encode_response(request_id, args)))
            .await
    }

    /// Replies to a server-initiated request with an error.
    pub async fn respond_error(&self, request_id: u64, method: &str, message: &str) -> Result<()> {
        self.post(Event::Respond(proto::encode_error(
            request_id, method, message,
        )))
        .await
    }

    /// Opens a tunnel to `device:port` and returns the virtual
    /// connection. The server-side open deadline surfaces as
    /// `PortOpenTimeout`.
    pub async fn connect_device(
        &self,
        device: Address,
        port: u64,
        mode: PortMode,
    ) -> Result<ConnectedPort> {
        let timeout = self.shared.portopen_timeout;
        let request = Request::PortOpen { device, port, mode };
        match self.call_kind(request, CallKind::PortOpen, timeout).await? {
            Response::PortOpened(reference) => {
                let (data, closed) = self
                    .shared
                    .pool
                    .take_receiver(self.id, &reference)
                    .ok_or_else(|| Error::simple(ErrorKind::ClientClosed))?;
                self.shared.counters.add_connection();
                Ok(ConnectedPort::new(
                    self.clone(),
                    device,
                    reference,
                    data,
                    closed,
                ))
            }
            _ => Err(codec::malformed("Expected a port reference")),
        }
    }

    /// Accepts an inbound `portopen`, registering the server-chosen
    /// reference and confirming to the edge.
    pub async fn accept_inbound(&self, inbound: &InboundPortOpen) -> Result<ConnectedPort> {
        if !self.shared.pool.insert(self.id, &inbound.reference) {
            return Err("Reference is already in use").wrapped(ErrorKind::Rpc(
                "portopen".into(),
                "duplicate reference".into(),
            ));
        }
        let (data, closed) = self
            .shared
            .pool
            .take_receiver(self.id, &inbound.reference)
            .ok_or_else(|| Error::simple(ErrorKind::ClientClosed))?;
        self.respond_ok(
            inbound.request_id,
            vec![Term::atom("ok"), Term::binary(inbound.reference.clone())],
        )
        .await?;
        self.shared.counters.add_connection();
        Ok(ConnectedPort::new(
            self.clone(),
            inbound.device,
            inbound.reference.clone(),
            data,
            closed,
        ))
    }

    pub(crate) async fn port_send(&self, reference: Vec<u8>, data: Vec<u8>) -> Result<()> {
        self.cast(Request::PortSend { reference, data }).await?;
        Ok(())
    }

    pub(crate) async fn port_close(&self, reference: Vec<u8>) -> Result<()> {
        // drop the local endpoint first, making double closes no-ops
        self.shared.pool.remove(self.id, &reference);
        self.cast(Request::PortClose { reference }).await?;
        Ok(())
    }

    /// Closes the client: outstanding calls resolve with
    /// `Cancelled(host)`, every owned port closes, the channel goes
    /// away. Idempotent; later calls fail with `ClientClosed`
    /// without touching the network.
    pub async fn close(&self) -> Result<()> {
        if self.shared.closed.swap(true, Ordering::Relaxed) {
            return Ok(());
        }
        let (reply_tx, reply_rx) = new_reply_channel();
        let mut tx = self.tx.clone();
        if tx.send(Event::Close(Some(reply_tx))).await.is_ok() {
            let _ = reply_rx.recv(&self.host).await;
        }
        Ok(())
    }

    pub async fn get_block_peak(&self) -> Result<u64> {
        match self.call(Request::GetBlockPeak).await? {
            Response::BlockPeak(peak) => Ok(peak),
            _ => Err(codec::malformed("Expected a block peak")),
        }
    }

    pub async fn get_block_header(&self, number: u64) -> Result<BlockHeader> {
        match self.call(Request::GetBlockHeader { number }).await? {
            Response::BlockHeader(header) => Ok(header),
            _ => Err(codec::malformed("Expected a block header")),
        }
    }

    pub async fn get_block_quick(&self, last_valid: u64, window: u64) -> Result<Vec<BlockHeader>> {
        match self.call(Request::GetBlockQuick { last_valid, window }).await? {
            Response::BlockHeaders(headers) => Ok(headers),
            _ => Err(codec::malformed("Expected block headers")),
        }
    }

    pub async fn get_block(&self, number: u64) -> Result<Term> {
        match self.call(Request::GetBlock { number }).await? {
            Response::Opaque(block) => Ok(block),
            _ => Err(codec::malformed("Expected a block")),
        }
    }

    pub async fn get_account(&self, block: u64, address: Address) -> Result<proto::Account> {
        match self.call(Request::GetAccount { block, address }).await? {
            Response::Account(account) => Ok(account),
            _ => Err(codec::malformed("Expected an account")),
        }
    }

    pub async fn get_account_roots(&self, block: u64, address: Address) -> Result<Vec<Digest>> {
        match self.call(Request::GetAccountRoots { block, address }).await? {
            Response::DigestList(roots) => Ok(roots),
            _ => Err(codec::malformed("Expected account roots")),
        }
    }

    pub async fn get_account_value(
        &self,
        block: u64,
        address: Address,
        key: [u8; 32],
    ) -> Result<Term> {
        match self
            .call(Request::GetAccountValue {
                block,
                address,
                key,
            })
            .await?
        {
            Response::Opaque(proof) => Ok(proof),
            _ => Err(codec::malformed("Expected an account value proof")),
        }
    }

    pub async fn get_state_roots(&self, block: u64) -> Result<Vec<Digest>> {
        match self.call(Request::GetStateRoots { block }).await? {
            Response::DigestList(roots) => Ok(roots),
            _ => Err(codec::malformed("Expected state roots")),
        }
    }

    pub async fn get_object(&self, key: Vec<u8>) -> Result<Term> {
        match self.call(Request::GetObject { key }).await? {
            Response::Opaque(object) => Ok(object),
            _ => Err(codec::malformed("Expected an object")),
        }
    }

    pub async fn get_node(&self, id: Address) -> Result<Term> {
        match self.call(Request::GetNode { id }).await? {
            Response::Opaque(node) => Ok(node),
            _ => Err(codec::malformed("Expected a node record")),
        }
    }

    pub async fn send_transaction(&self, payload: Vec<u8>) -> Result<()> {
        match self.call(Request::SendTransaction { payload }).await? {
            Response::TransactionAccepted => Ok(()),
            _ => Err(Error::simple(ErrorKind::SendTransactionFailed)),
        }
    }
}

impl ChainReader for Client {
    fn anchor(&self) -> Result<(u64, Digest)> {
        Ok(self.last_valid())
    }

    fn account_value(
        &self,
        block: u64,
        contract: Address,
        key: [u8; 32],
    ) -> BoxFuture<'_, Result<Term>> {
        Box::pin(async move { self.get_account_value(block, contract, key).await })
    }

    fn account_roots(&self, block: u64, contract: Address) -> BoxFuture<'_, Result<Vec<Digest>>> {
        Box::pin(async move { self.get_account_roots(block, contract).await })
    }
}

/// The client as seen by the header validator: same wire, but calls
/// flagged internal so they dispatch while user traffic is parked.
struct ValidatorHandle {
    client: Client,
}

impl ValidatorHandle {
    async fn internal(&self, request: Request) -> Result<Response> {
        let timeout = self.client.shared.rpc_timeout;
        self.client
            .call_kind(request, CallKind::Internal, timeout)
            .await
    }
}

impl HeaderSource for ValidatorHandle {
    fn block_peak(&self) -> BoxFuture<'_, Result<u64>> {
        Box::pin(async move {
            match self.internal(Request::GetBlockPeak).await? {
                Response::BlockPeak(peak) => Ok(peak),
                _ => Err(codec::malformed("Expected a block peak")),
            }
        })
    }

    fn block_header(&self, number: u64) -> BoxFuture<'_, Result<BlockHeader>> {
        Box::pin(async move {
            match self.internal(Request::GetBlockHeader { number }).await? {
                Response::BlockHeader(header) => Ok(header),
                _ => Err(codec::malformed("Expected a block header")),
            }
        })
    }

    fn block_quick(&self, last_valid: u64, count: u64) -> BoxFuture<'_, Result<Vec<BlockHeader>>> {
        Box::pin(async move {
            match self
                .internal(Request::GetBlockQuick {
                    last_valid,
                    window: count,
                })
                .await?
            {
                Response::BlockHeaders(headers) => Ok(headers),
                _ => Err(codec::malformed("Expected block headers")),
            }
        })
    }
}

enum Serve {
    Reconnect,
    Shutdown(Option<ReplyTx<()>>),
}

struct ClientTask {
    id: ClientId,
    host: Arc<str>,
    retry_times: usize,
    tls: TlsSetup,
    store: Arc<Store>,
    shared: Arc<Shared>,
    handle: Client,
    rx: MessageChannelRx<Event>,
    tx: MessageChannelTx<Event>,
    inbound_tx: MessageChannelTx<InboundPortOpen>,
    calls: CallManager,
    writer: Option<FrameWriter>,
    window: Option<Window>,
    parked: Vec<Call>,
    epoch: u64,
    ticketing: bool,
    ticket_retried: bool,
    advancing: bool,
    pending_ticket: Option<DeviceTicket>,
}

impl ClientTask {
    async fn run(mut self) {
        self.spawn_ticker();
        loop {
            self.set_state(ClientState::Dialing);
            let conn = match self.dial_with_backoff().await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("{}: giving up dialing: {}", self.host, e);
                    self.finish(None).await;
                    return;
                }
            };

            self.epoch += 1;
            self.shared
                .latency_us
                .store(conn.info.latency.as_micros() as u64, Ordering::Relaxed);
            *self.shared.server_id.lock() = conn.info.server_id;
            *self.shared.local_addr.lock() = Some(conn.info.local_addr.to_string());
            self.writer = Some(conn.writer);
            self.spawn_reader(conn.reader);

            self.set_state(ClientState::Validating);
            self.spawn_validator();

            match self.serve().await {
                Serve::Reconnect => {
                    self.teardown_connection();
                    continue;
                }
                Serve::Shutdown(reply) => {
                    self.finish(reply).await;
                    return;
                }
            }
        }
    }

    fn set_state(&self, state: ClientState) {
        *self.shared.state.lock() = state;
    }

    fn state(&self) -> ClientState {
        *self.shared.state.lock()
    }

    fn spawn_ticker(&self) {
        let mut tx = self.tx.clone();
        rt::spawn(async move {
            loop {
                Delay::new(TICK_INTERVAL).await;
                if tx.send(Event::Tick).await.is_err() {
                    return;
                }
            }
        });
    }

    fn spawn_reader(&self, mut reader: transport::FrameReader) {
        let mut tx = self.tx.clone();
        let epoch = self.epoch;
        rt::spawn(async move {
            loop {
                match reader.read_frame().await {
                    Ok(frame) => {
                        if tx.send(Event::Frame(epoch, frame)).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(Event::Disconnected(epoch, e)).await;
                        return;
                    }
                }
            }
        });
    }

    fn spawn_validator(&self) {
        let handle = ValidatorHandle {
            client: self.handle.clone(),
        };
        let store = self.store.clone();
        let mut tx = self.tx.clone();
        let epoch = self.epoch;
        rt::spawn(async move {
            let default = (GENESIS_NUMBER, Digest::from(GENESIS_HASH));
            let result = match blockquick::validate_network(&handle, &store, default).await {
                // one retry from the built-in anchor
                Err(e) if e.is(&ErrorKind::AnchorLost) => {
                    blockquick::validate_network(&handle, &store, default).await
                }
                other => other,
            };
            let _ = tx.send(Event::Validated(epoch, result)).await;
        });
    }

    async fn dial_with_backoff(&mut self) -> Result<transport::Connection> {
        let mut wait = RETRY_WAIT_MIN;
        let mut attempt = 0;
        loop {
            match transport::dial(&self.host, &self.tls, self.shared.counters.clone()).await {
                Ok(conn) => return Ok(conn),
                Err(e) => {
                    if attempt >= self.retry_times {
                        return Err(e);
                    }
                    attempt += 1;
                    let jitter = Duration::from_millis(OsRng.next_u64() % 1000);
                    let sleep = (wait + jitter).min(RETRY_WAIT_MAX);
                    debug!(
                        "{}: dial attempt {} failed ({}), retrying in {:?}",
                        self.host, attempt, e, sleep
                    );
                    Delay::new(sleep).await;
                    wait = (wait * 2).min(RETRY_WAIT_MAX);
                }
            }
        }
    }

    async fn serve(&mut self) -> Serve {
        loop {
            let event = match self.rx.recv().await {
                Some(event) => event,
                None => return Serve::Shutdown(None),
            };
            match event {
                Event::Call(call) => {
                    if let Some(flow) = self.handle_call(call).await {
                        return flow;
                    }
                }
                Event::Cancel(id) => self.calls.remove_by_id(id),
                Event::Frame(epoch, frame) => {
                    if epoch != self.epoch {
                        continue;
                    }
                    if let Some(flow) = self.handle_frame(frame).await {
                        return flow;
                    }
                }
                Event::Disconnected(epoch, e) => {
                    if epoch != self.epoch {
                        continue;
                    }
                    warn!("{}: connection lost: {}", self.host, e);
                    return Serve::Reconnect;
                }
                Event::Validated(epoch, _) if epoch != self.epoch => continue,
                Event::Validated(_, result) => match result {
                    Ok(window) => {
                        if let Some(flow) = self.install_window(window).await {
                            return flow;
                        }
                    }
                    Err(e) => {
                        warn!("{}: network validation failed: {}", self.host, e);
                        return Serve::Reconnect;
                    }
                },
                Event::Advance(result) => {
                    self.advancing = false;
                    if let Ok((peak, headers)) = result {
                        self.advance_window(peak, headers);
                    }
                }
                Event::Tick => {
                    if let Some(flow) = self.handle_tick().await {
                        return flow;
                    }
                }
                Event::Respond(frame) => {
                    if self.write_frame(&frame).await.is_err() {
                        return Serve::Reconnect;
                    }
                }
                Event::Close(reply) => return Serve::Shutdown(reply),
            }
        }
    }

    async fn handle_call(&mut self, call: Call) -> Option<Serve> {
        match self.state() {
            ClientState::Ready => self.dispatch(call).await,
            ClientState::Validating | ClientState::Dialing => {
                if call.kind == CallKind::Internal {
                    self.dispatch(call).await
                } else {
                    self.parked.push(call);
                    None
                }
            }
            _ => {
                if let Some(reply) = call.reply {
                    reply.send(Err(Error::simple(ErrorKind::ClientClosed)));
                }
                None
            }
        }
    }

    async fn dispatch(&mut self, mut call: Call) -> Option<Serve> {
        if let Err(e) = self.calls.insert(&mut call) {
            if let Some(reply) = call.reply.take() {
                reply.send(Err(e));
            }
            return None;
        }
        if self.write_frame(&call.frame).await.is_err() {
            return Some(Serve::Reconnect);
        }
        self.maybe_submit_ticket().await
    }

    async fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        match self.writer.as_mut() {
            Some(writer) => writer.write_frame(frame).await,
            None => Err("Not connected").wrapped(ErrorKind::Transport),
        }
    }

    async fn install_window(&mut self, window: Window) -> Option<Serve> {
        let last = window.last();
        *self.shared.last_valid.lock() = last;
        self.window = Some(window);
        self.set_state(ClientState::Ready);
        info!("{}: validated, greeting at block {}", self.host, last.0);

        // greet: announce the protocol version, then pay up front
        let hello = self.internal_call(Request::Hello {
            version: EDGE_PROTOCOL_VERSION,
        });
        if let Some(flow) = self.dispatch(hello).await {
            return Some(flow);
        }
        if let Some(flow) = self.submit_ticket().await {
            return Some(flow);
        }

        let parked = std::mem::take(&mut self.parked);
        for call in parked {
            if let Some(flow) = self.dispatch(call).await {
                return Some(flow);
            }
        }
        None
    }

    fn internal_call(&self, request: Request) -> Call {
        let id = next_request_id();
        Call {
            id,
            method: request.method(),
            frame: request.encode(id).expect("internal requests encode"),
            parse: request.parser(),
            reply: None,
            kind: CallKind::Internal,
        }
    }

    async fn handle_tick(&mut self) -> Option<Serve> {
        if self.state() != ClientState::Ready {
            return None;
        }
        let ping = self.internal_call(Request::Ping);
        if let Some(flow) = self.dispatch(ping).await {
            return Some(flow);
        }

        // opportunistic window advance
        if self.window.is_some() && !self.advancing {
            self.advancing = true;
            let client = self.handle.clone();
            let mut tx = self.tx.clone();
            let (last, _) = *self.shared.last_valid.lock();
            rt::spawn(async move {
                let result = async {
                    let peak = client.get_block_peak().await?;
                    if peak <= last + CONFIRMATIONS as u64 {
                        return Ok((peak, Vec::new()));
                    }
                    let headers = client
                        .get_block_quick(last, (WINDOW_SIZE + CONFIRMATIONS + 1) as u64)
                        .await?;
                    Ok((peak, headers))
                }
                .await;
                let _ = tx.send(Event::Advance(result)).await;
            });
        }
        None
    }

    fn advance_window(&mut self, peak: u64, headers: Vec<BlockHeader>) {
        let window = match self.window.as_mut() {
            Some(window) => window,
            None => return,
        };
        let horizon = (peak + 1).saturating_sub(CONFIRMATIONS as u64);
        for header in headers {
            if header.number() <= window.last().0 {
                continue;
            }
            if header.number() > horizon {
                break;
            }
            if let Err(e) = window.add_block(header, true) {
                warn!("{}: rejected block during advance: {}", self.host, e);
                return;
            }
        }
        let (last, hash) = window.last();
        *self.shared.last_valid.lock() = (last, hash);
        if let Err(e) = blockquick::store_last_valid(&self.store, last, &hash) {
            warn!("{}: persisting anchor failed: {}", self.host, e);
        }
    }

    async fn handle_frame(&mut self, frame: Vec<u8>) -> Option<Serve> {
        let term = match codec::decode(&frame) {
            Ok(term) => term,
            Err(e) => {
                warn!("{}: dropping malformed frame: {}", self.host, e);
                return None;
            }
        };
        let inbound = match proto::classify(term) {
            Ok(inbound) => inbound,
            Err(e) => {
                warn!("{}: dropping unclassifiable frame: {}", self.host, e);
                return None;
            }
        };
        match inbound {
            Inbound::Response {
                request_id,
                payload,
            } => {
                let delivered = self.calls.deliver(request_id, &payload);
                self.handle_delivered(delivered).await
            }
            Inbound::Error {
                request_id,
                method,
                message,
            } => {
                let delivered = self.calls.deliver_error(request_id, &method, &message);
                self.handle_delivered(delivered).await
            }
            Inbound::PortOpen {
                request_id,
                port,
                reference,
                device,
            } => {
                let request = InboundPortOpen {
                    request_id,
                    port,
                    reference,
                    device,
                };
                let mut tx = self.inbound_tx.clone();
                if tx.try_send(request).is_err() {
                    let frame = proto::encode_error(request_id, "portopen", "unavailable");
                    if self.write_frame(&frame).await.is_err() {
                        return Some(Serve::Reconnect);
                    }
                }
                None
            }
            Inbound::PortSend {
                request_id,
                reference,
                data,
            } => {
                match self.shared.pool.sender(self.id, &reference) {
                    Some(mut sender) => {
                        use futures::sink::SinkExt;
                        // a full port queue parks the demultiplexer;
                        // a closed port just sheds the bytes
                        if sender.send(data).await.is_err() {
                            debug!("{}: dropping bytes for closed port", self.host);
                        }
                    }
                    None => {
                        debug!(
                            "{}: dropping bytes for unknown reference {}",
                            self.host,
                            hex::encode(&reference)
                        );
                    }
                }
                let frame = proto::encode_response(request_id, vec![Term::atom("ok")]);
                if self.write_frame(&frame).await.is_err() {
                    return Some(Serve::Reconnect);
                }
                None
            }
            Inbound::PortClose {
                request_id,
                reference,
            } => {
                self.shared.pool.remove(self.id, &reference);
                let frame = proto::encode_response(request_id, vec![Term::atom("ok")]);
                if self.write_frame(&frame).await.is_err() {
                    return Some(Serve::Reconnect);
                }
                None
            }
            Inbound::Goodbye => {
                info!("{}: server said goodbye", self.host);
                Some(Serve::Shutdown(None))
            }
            Inbound::Unknown { method, .. } => {
                warn!("{}: dropping unknown method {:?}", self.host, method);
                None
            }
        }
    }

    async fn handle_delivered(&mut self, delivered: Delivered) -> Option<Serve> {
        match delivered {
            Delivered::Done => self.maybe_submit_ticket().await,
            Delivered::Unknown => None,
            Delivered::Action {
                kind: CallKind::PortOpen,
                result,
                reply,
            } => {
                let result = result.map(|response| {
                    if let Response::PortOpened(reference) = &response {
                        if !self.shared.pool.insert(self.id, reference) {
                            warn!(
                                "{}: server reused reference {}",
                                self.host,
                                hex::encode(reference)
                            );
                        }
                    }
                    response
                });
                if let Some(reply) = reply {
                    reply.send(result);
                }
                self.maybe_submit_ticket().await
            }
            Delivered::Action { result, .. } => {
                self.handle_ticket_result(result).await;
                None
            }
        }
    }

    fn ticket_due(&self) -> bool {
        let counters = &self.shared.counters;
        counters.total_bytes() > counters.counter() + TICKET_BOUND
    }

    async fn maybe_submit_ticket(&mut self) -> Option<Serve> {
        if self.ticketing || self.state() != ClientState::Ready || !self.ticket_due() {
            return None;
        }
        self.submit_ticket().await
    }

    async fn submit_ticket(&mut self) -> Option<Serve> {
        let mut ticket = match self.build_ticket() {
            Ok(ticket) => ticket,
            Err(e) => {
                warn!("{}: building ticket failed: {}", self.host, e);
                return None;
            }
        };
        if let Err(e) = ticket.sign(&self.shared.keys) {
            warn!("{}: signing ticket failed: {}", self.host, e);
            return None;
        }

        let id = next_request_id();
        let request = Request::Ticket(ticket.clone());
        let frame = match request.encode(id) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("{}: encoding ticket failed: {}", self.host, e);
                return None;
            }
        };
        let mut call = Call {
            id,
            method: request.method(),
            frame,
            parse: request.parser(),
            reply: None,
            kind: CallKind::Ticket,
        };
        if let Err(e) = self.calls.insert(&mut call) {
            debug!("{}: ticket deferred: {}", self.host, e);
            return None;
        }
        if self.write_frame(&call.frame).await.is_err() {
            return Some(Serve::Reconnect);
        }
        self.ticketing = true;
        self.pending_ticket = Some(ticket);
        None
    }

    fn build_ticket(&self) -> Result<DeviceTicket> {
        let (block_number, block_hash) = *self.shared.last_valid.lock();
        let server_id = self.shared.server_id.lock().unwrap_or_default();
        let local_addr = self
            .shared
            .local_addr
            .lock()
            .clone()
            .unwrap_or_default()
            .into_bytes();
        let counters = &self.shared.counters;
        Ok(DeviceTicket {
            server_id,
            block_number,
            block_hash,
            fleet: self.shared.fleet,
            total_connections: counters.total_connections(),
            total_bytes: counters.total_bytes(),
            local_addr,
            signature: None,
        })
    }

    async fn handle_ticket_result(&mut self, result: Result<Response>) {
        self.ticketing = false;
        let submitted = self.pending_ticket.take();
        match result {
            Ok(Response::Ticket(TicketReply::Thanks { paid })) => {
                if let Some(submitted) = submitted {
                    self.shared.counters.update_counter(submitted.total_bytes);
                }
                self.ticket_retried = false;
                debug!("{}: ticket accepted, {} paid", self.host, paid);
            }
            Ok(Response::Ticket(TicketReply::TooLow(quoted))) => {
                let previous = DeviceTicket {
                    server_id: self.shared.server_id.lock().unwrap_or_default(),
                    block_number: quoted.block_number,
                    block_hash: quoted.block_hash,
                    fleet: self.shared.fleet,
                    total_connections: quoted.total_connections,
                    total_bytes: quoted.total_bytes,
                    local_addr: quoted.local_addr,
                    signature: Some(quoted.signature),
                };
                match previous.verify_quoted(&self.shared.keys.address()) {
                    Ok(()) => {
                        let counters = &self.shared.counters;
                        counters.resync_bytes(quoted.total_bytes + RESYNC_BYTES);
                        counters
                            .resync_connections(quoted.total_connections + RESYNC_CONNECTIONS);
                        if !self.ticket_retried {
                            self.ticket_retried = true;
                            info!("{}: ticket too low, resyncing and retrying", self.host);
                            let _ = self.submit_ticket().await;
                        } else {
                            warn!("{}: ticket still too low after resync", self.host);
                        }
                    }
                    Err(e) => {
                        // a quote we never signed; somebody is lying
                        warn!("{}: ignoring forged ticket quote: {}", self.host, e);
                    }
                }
            }
            Ok(Response::Ticket(TicketReply::TooOld)) => {
                info!("{}: ticket anchored too far back", self.host);
            }
            Ok(other) => {
                warn!("{}: unexpected ticket reply: {:?}", self.host, other);
            }
            Err(e) => {
                warn!("{}: ticket submission failed: {}", self.host, e);
            }
        }
    }

    fn teardown_connection(&mut self) {
        self.calls.cancel_all(&self.host);
        self.shared.pool.close_ports(self.id);
        self.writer = None;
        self.window = None;
        self.ticketing = false;
        self.pending_ticket = None;
        self.advancing = false;
    }

    async fn finish(&mut self, reply: Option<ReplyTx<()>>) {
        self.set_state(ClientState::Closing);
        self.shared.closed.store(true, Ordering::Relaxed);
        self.calls.cancel_all(&self.host);
        for call in std::mem::take(&mut self.parked) {
            if let Some(reply) = call.reply {
                reply.send(Err(Error::simple(ErrorKind::Cancelled(
                    self.host.to_string(),
                ))));
            }
        }
        self.shared.pool.close_ports(self.id);
        if let Some(mut writer) = self.writer.take() {
            writer.close().await;
        }
        self.set_state(ClientState::Closed);
        if let Some(reply) = reply {
            reply.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diode::crypto::hash::keccak256;
    use std::path::PathBuf;
    use std::sync::atomic::AtomicUsize;

    fn scratch_dir() -> PathBuf {
        static SEQ: AtomicUsize = AtomicUsize::new(0);
        let n = SEQ.fetch_add(1, Ordering::Relaxed);
        std::env::temp_dir().join(format!("zener-rpc-{}-{}", std::process::id(), n))
    }

    fn test_config(host: &str) -> Config {
        let mut scalar = [0x44; 32];
        scalar[0] = 0x01;
        let keys = Arc::new(KeyPair::from_secret(&scalar).expect("valid scalar"));
        let mut config = Config::new(host.to_string(), keys, Address::from([0x09; 20]));
        config.retry_times = 0;
        config
    }

    #[test]
    fn test_request_ids_are_unique() {
        let first = next_request_id();
        let second = next_request_id();
        assert!(second > first);
    }

    #[tokio::test]
    async fn test_calls_after_close_fail_fast() {
        let dir = scratch_dir();
        let store = Arc::new(Store::open(&dir).expect("store"));
        let pool = Pool::new();
        // nothing listens on this port; the dial fails and the
        // actor gives up after zero retries
        let client = Client::start(test_config("127.0.0.1:9"), store, pool);

        client.close().await.expect("close");
        let err = client.get_block_peak().await.unwrap_err();
        assert!(err.is(&ErrorKind::ClientClosed));
        // closing again is a no-op
        client.close().await.expect("second close");
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_anchor_survives_restart() {
        let dir = scratch_dir();
        let store = Arc::new(Store::open(&dir).expect("store"));
        let hash = keccak256(b"anchored block");
        blockquick::store_last_valid(&store, 9000, &hash).expect("persist");

        let pool = Pool::new();
        let client = Client::start(test_config("127.0.0.1:9"), store, pool);
        assert_eq!(client.last_valid(), (9000, hash));
        client.close().await.expect("close");
        std::fs::remove_dir_all(&dir).ok();
    }
}
