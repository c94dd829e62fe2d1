//! The typed layer over the wire codec: request shapes, response
//! sum types, and the parse callbacks binding one to the other.
//!
//! Every request travels as `(request_id, method, args…)`; the
//! matching response as `(request_id, "response", payload…)` or
//! `(request_id, "error", method, message)`. Messages originated by
//! the server reuse the same frame shape with a server-chosen id.

use crate::diode::blockquick::BlockHeader;
use crate::diode::codec::{self, Term};
use crate::diode::crypto::hash::Digest;
use crate::diode::crypto::signature::{Address, Signature};
use crate::diode::error::*;
use crate::diode::ticket::DeviceTicket;

/// Parse callback bound to a request's method.
pub type Parser = fn(&[Term]) -> Result<Response>;

/// Access mode requested for a tunnel.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum PortMode {
    Read,
    Write,
    ReadWrite,
}

impl PortMode {
    fn as_atom(self) -> &'static str {
        match self {
            PortMode::Read => "r",
            PortMode::Write => "w",
            PortMode::ReadWrite => "rw",
        }
    }
}

/// A client → server call.
#[derive(Clone, Debug)]
pub enum Request {
    Hello { version: u64 },
    Ping,
    Ticket(DeviceTicket),
    PortOpen { device: Address, port: u64, mode: PortMode },
    PortSend { reference: Vec<u8>, data: Vec<u8> },
    PortClose { reference: Vec<u8> },
    GetBlockPeak,
    GetBlockHeader { number: u64 },
    GetBlockQuick { last_valid: u64, window: u64 },
    GetBlock { number: u64 },
    GetAccount { block: u64, address: Address },
    GetAccountRoots { block: u64, address: Address },
    GetAccountValue { block: u64, address: Address, key: [u8; 32] },
    GetStateRoots { block: u64 },
    GetObject { key: Vec<u8> },
    GetNode { id: Address },
    SendTransaction { payload: Vec<u8> },
}

impl Request {
    pub fn method(&self) -> &'static str {
        match self {
            Request::Hello { .. } => "hello",
            Request::Ping => "ping",
            Request::Ticket(_) => "ticket",
            Request::PortOpen { .. } => "portopen",
            Request::PortSend { .. } => "portsend",
            Request::PortClose { .. } => "portclose",
            Request::GetBlockPeak => "getblockpeak",
            Request::GetBlockHeader { .. } => "getblockheader2",
            Request::GetBlockQuick { .. } => "getblockquick2",
            Request::GetBlock { .. } => "getblock",
            Request::GetAccount { .. } => "getaccount",
            Request::GetAccountRoots { .. } => "getaccountroots",
            Request::GetAccountValue { .. } => "getaccountvalue",
            Request::GetStateRoots { .. } => "getstateroots",
            Request::GetObject { .. } => "getobject",
            Request::GetNode { .. } => "getnode",
            Request::SendTransaction { .. } => "sendtransaction",
        }
    }

    pub fn parser(&self) -> Parser {
        match self {
            Request::Hello { .. } | Request::PortSend { .. } | Request::PortClose { .. } => {
                parse_ok
            }
            Request::Ping => parse_pong,
            Request::Ticket(_) => parse_ticket,
            Request::PortOpen { .. } => parse_portopen,
            Request::GetBlockPeak => parse_block_peak,
            Request::GetBlockHeader { .. } => parse_block_header,
            Request::GetBlockQuick { .. } => parse_block_quick,
            Request::GetBlock { .. } => parse_opaque,
            Request::GetAccount { .. } => parse_account,
            Request::GetAccountRoots { .. } => parse_digest_list,
            Request::GetAccountValue { .. } => parse_opaque,
            Request::GetStateRoots { .. } => parse_digest_list,
            Request::GetObject { .. } => parse_opaque,
            Request::GetNode { .. } => parse_opaque,
            Request::SendTransaction { .. } => parse_send_transaction,
        }
    }

    fn to_args(&self) -> Result<Vec<Term>> {
        Ok(match self {
            Request::Hello { version } => vec![Term::int(*version)],
            Request::Ping => vec![],
            Request::Ticket(ticket) => ticket.to_rpc_args()?,
            Request::PortOpen { device, port, mode } => vec![
                Term::binary(device.as_ref()),
                Term::int(*port),
                Term::atom(mode.as_atom()),
            ],
            Request::PortSend { reference, data } => vec![
                Term::binary(reference.clone()),
                Term::binary(data.clone()),
            ],
            Request::PortClose { reference } => vec![Term::binary(reference.clone())],
            Request::GetBlockPeak => vec![],
            Request::GetBlockHeader { number } => vec![Term::int(*number)],
            Request::GetBlockQuick { last_valid, window } => {
                vec![Term::int(*last_valid), Term::int(*window)]
            }
            Request::GetBlock { number } => vec![Term::int(*number)],
            Request::GetAccount { block, address } => {
                vec![Term::int(*block), Term::binary(address.as_ref())]
            }
            Request::GetAccountRoots { block, address } => {
                vec![Term::int(*block), Term::binary(address.as_ref())]
            }
            Request::GetAccountValue { block, address, key } => vec![
                Term::int(*block),
                Term::binary(address.as_ref()),
                Term::binary(&key[..]),
            ],
            Request::GetStateRoots { block } => vec![Term::int(*block)],
            Request::GetObject { key } => vec![Term::binary(key.clone())],
            Request::GetNode { id } => vec![Term::binary(id.as_ref())],
            Request::SendTransaction { payload } => vec![Term::binary(payload.clone())],
        })
    }

    /// Encodes the full frame payload for this request.
    pub fn encode(&self, request_id: u64) -> Result<Vec<u8>> {
        let mut items = vec![Term::int(request_id), Term::atom(self.method())];
        items.extend(self.to_args()?);
        Ok(codec::encode(&Term::tuple(items)))
    }
}

/// A parsed server response, one variant per method family.
#[derive(Clone, Debug)]
pub enum Response {
    Ok,
    Pong,
    Ticket(TicketReply),
    PortOpened(Vec<u8>),
    BlockPeak(u64),
    BlockHeader(BlockHeader),
    BlockHeaders(Vec<BlockHeader>),
    DigestList(Vec<Digest>),
    Account(Account),
    Opaque(Term),
    TransactionAccepted,
}

/// Outcome of a `ticket` submission.
#[derive(Clone, Debug)]
pub enum TicketReply {
    Thanks { paid: u64 },
    TooLow(QuotedTicket),
    TooOld,
}

/// The previous ticket a server quotes in a `too_low` reply.
#[derive(Clone, Debug)]
pub struct QuotedTicket {
    pub block_number: u64,
    pub block_hash: Digest,
    pub total_connections: u64,
    pub total_bytes: u64,
    pub local_addr: Vec<u8>,
    pub signature: Signature,
}

/// Account state as served by `getaccount`.
#[derive(Clone, Debug)]
pub struct Account {
    pub nonce: u64,
    pub balance: u64,
    pub storage_root: Digest,
    pub code_hash: Digest,
}

fn need(payload: &[Term], at: usize) -> Result<&Term> {
    payload
        .get(at)
        .ok_or_else(|| codec::malformed("Response payload is short"))
}

fn parse_ok(payload: &[Term]) -> Result<Response> {
    match payload.first() {
        None => Ok(Response::Ok),
        Some(status) if status.as_bytes()? == b"ok" => Ok(Response::Ok),
        Some(_) => Err(codec::malformed("Expected an ok response")),
    }
}

fn parse_pong(payload: &[Term]) -> Result<Response> {
    if need(payload, 0)?.as_bytes()? == b"pong" {
        Ok(Response::Pong)
    } else {
        Err(codec::malformed("Expected a pong response"))
    }
}

fn parse_portopen(payload: &[Term]) -> Result<Response> {
    match need(payload, 0)?.as_bytes()? {
        b"ok" => Ok(Response::PortOpened(need(payload, 1)?.as_binary()?.to_vec())),
        // the server-side open deadline expired
        b"time" => Err(Error::simple(ErrorKind::PortOpenTimeout)),
        _ => Err(codec::malformed("Expected a port reference")),
    }
}

fn parse_ticket(payload: &[Term]) -> Result<Response> {
    match need(payload, 0)?.as_bytes()? {
        b"thanks!" => {
            let paid = match payload.get(1) {
                Some(term) => term.as_int().unwrap_or(0),
                None => 0,
            };
            Ok(Response::Ticket(TicketReply::Thanks { paid }))
        }
        b"too_low" => {
            let quoted = QuotedTicket {
                block_number: need(payload, 1)?.as_int()?,
                block_hash: Digest::from_bytes(need(payload, 2)?.as_binary()?)?,
                total_connections: need(payload, 3)?.as_int()?,
                total_bytes: need(payload, 4)?.as_int()?,
                local_addr: need(payload, 5)?.as_binary()?.to_vec(),
                signature: Signature::from_bytes(need(payload, 6)?.as_binary()?)?,
            };
            Ok(Response::Ticket(TicketReply::TooLow(quoted)))
        }
        b"too_old" => Ok(Response::Ticket(TicketReply::TooOld)),
        _ => Err(codec::malformed("Unknown ticket reply")),
    }
}

fn parse_block_peak(payload: &[Term]) -> Result<Response> {
    Ok(Response::BlockPeak(need(payload, 0)?.as_int()?))
}

fn parse_block_header(payload: &[Term]) -> Result<Response> {
    Ok(Response::BlockHeader(BlockHeader::from_term(need(
        payload, 0,
    )?)?))
}

fn parse_block_quick(payload: &[Term]) -> Result<Response> {
    let headers = need(payload, 0)?
        .as_list()?
        .iter()
        .map(BlockHeader::from_term)
        .collect::<Result<Vec<_>>>()?;
    Ok(Response::BlockHeaders(headers))
}

fn parse_digest_list(payload: &[Term]) -> Result<Response> {
    let digests = need(payload, 0)?
        .as_list()?
        .iter()
        .map(|term| Digest::from_bytes(term.as_binary()?))
        .collect::<Result<Vec<_>>>()?;
    Ok(Response::DigestList(digests))
}

fn parse_account(payload: &[Term]) -> Result<Response> {
    let fields = need(payload, 0)?.as_tuple()?;
    if fields.len() != 4 {
        return Err(codec::malformed("Account tuple has the wrong arity"));
    }
    Ok(Response::Account(Account {
        nonce: fields[0].as_int()?,
        balance: fields[1].as_int()?,
        storage_root: Digest::from_bytes(fields[2].as_binary()?)?,
        code_hash: Digest::from_bytes(fields[3].as_binary()?)?,
    }))
}

fn parse_opaque(payload: &[Term]) -> Result<Response> {
    Ok(Response::Opaque(need(payload, 0)?.clone()))
}

fn parse_send_transaction(payload: &[Term]) -> Result<Response> {
    match payload.first() {
        Some(status) if status.as_bytes().map(|b| b == b"ok").unwrap_or(false) => {
            Ok(Response::TransactionAccepted)
        }
        _ => Err(Error::simple(ErrorKind::SendTransactionFailed)),
    }
}

/// A decoded frame from the server, classified by direction.
#[derive(Debug)]
pub enum Inbound {
    /// A response correlated with one of our requests.
    Response { request_id: u64, payload: Vec<Term> },
    /// An error correlated with one of our requests.
    Error {
        request_id: u64,
        method: String,
        message: String,
    },
    /// The server relays a device opening a tunnel towards us.
    PortOpen {
        request_id: u64,
        port: u64,
        reference: Vec<u8>,
        device: Address,
    },
    /// Bytes for one of our tunnels.
    PortSend {
        request_id: u64,
        reference: Vec<u8>,
        data: Vec<u8>,
    },
    /// The far side closed one of our tunnels.
    PortClose { request_id: u64, reference: Vec<u8> },
    /// The server is going away.
    Goodbye,
    /// A method this client does not speak.
    Unknown { request_id: u64, method: String },
}

/// Splits a decoded frame into its direction and payload.
pub fn classify(term: Term) -> Result<Inbound> {
    let mut items = match term {
        Term::Tuple(items) => items,
        _ => return Err(codec::malformed("Frame is not a tuple")),
    };
    if items.len() < 2 {
        return Err(codec::malformed("Frame tuple has the wrong arity"));
    }
    let request_id = items[0].as_int()?;
    let method = items[1].as_atom()?.to_string();
    let payload: Vec<Term> = items.drain(2..).collect();

    Ok(match method.as_str() {
        "response" => Inbound::Response {
            request_id,
            payload,
        },
        "error" => {
            // either (id, "error", message) or
            // (id, "error", method, message)
            let (method, message) = match payload.len() {
                0 => (String::new(), String::new()),
                1 => (
                    String::new(),
                    String::from_utf8_lossy(payload[0].as_bytes()?).into_owned(),
                ),
                _ => (
                    String::from_utf8_lossy(payload[0].as_bytes()?).into_owned(),
                    String::from_utf8_lossy(payload[1].as_bytes()?).into_owned(),
                ),
            };
            Inbound::Error {
                request_id,
                method,
                message,
            }
        }
        "portopen" => {
            if payload.len() < 3 {
                return Err(codec::malformed("Inbound portopen is short"));
            }
            Inbound::PortOpen {
                request_id,
                port: payload[0].as_int()?,
                reference: payload[1].as_binary()?.to_vec(),
                device: Address::from_bytes(payload[2].as_binary()?)?,
            }
        }
        "portsend" => {
            if payload.len() < 2 {
                return Err(codec::malformed("Inbound portsend is short"));
            }
            Inbound::PortSend {
                request_id,
                reference: payload[0].as_binary()?.to_vec(),
                data: payload[1].as_binary()?.to_vec(),
            }
        }
        "portclose" => {
            if payload.is_empty() {
                return Err(codec::malformed("Inbound portclose is short"));
            }
            Inbound::PortClose {
                request_id,
                reference: payload[0].as_binary()?.to_vec(),
            }
        }
        "goodbye" => Inbound::Goodbye,
        _ => Inbound::Unknown { request_id, method },
    })
}

/// Encodes an out-of-correlation response to a server request.
pub fn encode_response(request_id: u64, args: Vec<Term>) -> Vec<u8> {
    let mut items = vec![Term::int(request_id), Term::atom("response")];
    items.extend(args);
    codec::encode(&Term::tuple(items))
}

/// Encodes an error reply to a server request.
pub fn encode_error(request_id: u64, method: &str, message: &str) -> Vec<u8> {
    codec::encode(&Term::tuple(vec![
        Term::int(request_id),
        Term::atom("error"),
        Term::atom(method),
        Term::binary(message.as_bytes()),
    ]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diode::crypto::hash::keccak256;

    #[test]
    fn test_request_frame_shape() {
        let request = Request::PortOpen {
            device: Address::from([0x11; 20]),
            port: 8080,
            mode: PortMode::ReadWrite,
        };
        let frame = request.encode(77).expect("encode");
        let term = codec::decode(&frame).expect("decode");
        let items = term.as_tuple().expect("tuple");
        assert_eq!(items[0], Term::int(77));
        assert_eq!(items[1], Term::atom("portopen"));
        assert_eq!(items[3], Term::int(8080));
        assert_eq!(items[4], Term::atom("rw"));
    }

    #[test]
    fn test_portopen_ok_and_timeout() {
        let ok = [Term::atom("ok"), Term::binary(vec![1, 2, 3])];
        match parse_portopen(&ok).expect("parse") {
            Response::PortOpened(reference) => assert_eq!(reference, vec![1, 2, 3]),
            other => panic!("unexpected response: {:?}", other),
        }

        let timeout = [Term::binary(&b"time"[..])];
        let err = parse_portopen(&timeout).unwrap_err();
        assert!(err.is(&ErrorKind::PortOpenTimeout));
    }

    #[test]
    fn test_ticket_too_low_parse() {
        let payload = [
            Term::atom("too_low"),
            Term::int(900),
            Term::binary(keccak256(b"block").as_ref()),
            Term::int(4),
            Term::int(5_000_000),
            Term::binary(&b"10.0.0.1:4000"[..]),
            Term::binary(vec![0; 65]),
        ];
        match parse_ticket(&payload).expect("parse") {
            Response::Ticket(TicketReply::TooLow(quoted)) => {
                assert_eq!(quoted.block_number, 900);
                assert_eq!(quoted.total_connections, 4);
                assert_eq!(quoted.total_bytes, 5_000_000);
            }
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[test]
    fn test_classify_inbound_portsend() {
        let frame = Term::tuple(vec![
            Term::int(9),
            Term::atom("portsend"),
            Term::binary(vec![0xf0]),
            Term::binary(vec![1, 2, 3]),
        ]);
        match classify(frame).expect("classify") {
            Inbound::PortSend {
                request_id,
                reference,
                data,
            } => {
                assert_eq!(request_id, 9);
                assert_eq!(reference, vec![0xf0]);
                assert_eq!(data, vec![1, 2, 3]);
            }
            other => panic!("unexpected inbound: {:?}", other),
        }
    }

    #[test]
    fn test_classify_unknown_method() {
        let frame = Term::tuple(vec![Term::int(1), Term::atom("dance")]);
        match classify(frame).expect("classify") {
            Inbound::Unknown { method, .. } => assert_eq!(method, "dance"),
            other => panic!("unexpected inbound: {:?}", other),
        }
    }
}
