//! Signed usage tickets, the payment trail between a client and the
//! edge servers relaying its traffic.

#[cfg(feature = "serialize_serde")]
use serde::{Deserialize, Serialize};

use crate::diode::codec::{self, Term};
use crate::diode::crypto::hash::{keccak256, Digest};
use crate::diode::crypto::signature::{Address, KeyPair, Signature};
use crate::diode::error::*;

/// A ticket is due once this many bytes were served past the last
/// ticketed counter.
pub const TICKET_BOUND: u64 = 4 * 1024 * 1024;

/// Slack added on top of a server's quoted totals when resyncing
/// after a `too_low` rejection.
pub const RESYNC_BYTES: u64 = 1024;
pub const RESYNC_CONNECTIONS: u64 = 1;

/// A usage record the device signs over to the edge server.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub struct DeviceTicket {
    pub server_id: Address,
    pub block_number: u64,
    pub block_hash: Digest,
    pub fleet: Address,
    pub total_connections: u64,
    pub total_bytes: u64,
    #[cfg_attr(feature = "serialize_serde", serde(with = "serde_bytes"))]
    pub local_addr: Vec<u8>,
    pub signature: Option<Signature>,
}

impl DeviceTicket {
    /// The digest the device signs: every field but the signature.
    pub fn signing_digest(&self) -> Digest {
        let term = Term::tuple(vec![
            Term::binary(self.server_id.as_ref()),
            Term::int(self.block_number),
            Term::binary(self.block_hash.as_ref()),
            Term::binary(self.fleet.as_ref()),
            Term::int(self.total_connections),
            Term::int(self.total_bytes),
            Term::binary(self.local_addr.clone()),
        ]);
        keccak256(&codec::encode(&term))
    }

    pub fn sign(&mut self, keys: &KeyPair) -> Result<()> {
        self.signature = Some(keys.sign_digest(&self.signing_digest())?);
        Ok(())
    }

    /// Checks the ticket was signed by `device`.
    pub fn verify(&self, device: &Address) -> Result<()> {
        let signature = self
            .signature
            .as_ref()
            .ok_or_else(|| Error::simple(ErrorKind::SignatureInvalid))?;
        signature.verify(&self.signing_digest(), device)
    }

    /// Checks a ticket quoted back by a server in a `too_low` reply.
    ///
    /// Some servers echo `local_addr` still wrapped in its term
    /// encoding; when plain verification fails, the field is decoded
    /// once more and verification retried with the inner bytes.
    pub fn verify_quoted(&self, device: &Address) -> Result<()> {
        if self.verify(device).is_ok() {
            return Ok(());
        }
        if let Ok(Term::Binary(inner)) = codec::decode(&self.local_addr) {
            let mut unwrapped = self.clone();
            unwrapped.local_addr = inner;
            return unwrapped.verify(device);
        }
        Err("Quoted ticket signature does not verify").wrapped(ErrorKind::SignatureInvalid)
    }

    /// The argument terms of the `ticket` RPC.
    pub fn to_rpc_args(&self) -> Result<Vec<Term>> {
        let signature = self
            .signature
            .as_ref()
            .ok_or_else(|| Error::simple(ErrorKind::SignatureInvalid))?;
        Ok(vec![
            Term::int(self.block_number),
            Term::binary(self.block_hash.as_ref()),
            Term::binary(self.fleet.as_ref()),
            Term::int(self.total_connections),
            Term::int(self.total_bytes),
            Term::binary(self.local_addr.clone()),
            Term::binary(signature.as_ref()),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device_keys() -> KeyPair {
        let mut scalar = [0x5c; 32];
        scalar[0] = 0x01;
        KeyPair::from_secret(&scalar).expect("valid scalar")
    }

    fn sample_ticket() -> DeviceTicket {
        DeviceTicket {
            server_id: Address::from([0x01; 20]),
            block_number: 4242,
            block_hash: keccak256(b"block"),
            fleet: Address::from([0x02; 20]),
            total_connections: 3,
            total_bytes: 9 * 1024 * 1024,
            local_addr: b"192.0.2.1:55010".to_vec(),
            signature: None,
        }
    }

    #[test]
    fn test_sign_and_verify() {
        let keys = device_keys();
        let mut ticket = sample_ticket();
        ticket.sign(&keys).expect("sign");
        ticket.verify(&keys.address()).expect("verify");
    }

    #[test]
    fn test_tampered_totals_fail() {
        let keys = device_keys();
        let mut ticket = sample_ticket();
        ticket.sign(&keys).expect("sign");
        ticket.total_bytes += 1;
        assert!(ticket.verify(&keys.address()).is_err());
    }

    #[test]
    fn test_quoted_double_encoded_local_addr() {
        let keys = device_keys();
        let mut ticket = sample_ticket();
        ticket.sign(&keys).expect("sign");

        // a server quoting the ticket back with local_addr still
        // carrying its term encoding
        let mut quoted = ticket.clone();
        quoted.local_addr = codec::encode(&Term::binary(ticket.local_addr.clone()));

        assert!(quoted.verify(&keys.address()).is_err());
        quoted.verify_quoted(&keys.address()).expect("fallback verify");
    }
}
