//! Recoverable secp256k1 signatures and the identities derived
//! from public keys.
//!
//! Identities on the overlay network are the trailing 20 bytes of
//! the keccak-256 digest of an uncompressed public key body, for
//! clients, devices, fleets and edge servers alike.

#[cfg(feature = "crypto_signature_k256_secp256k1")]
mod k256_secp256k1;

#[cfg(feature = "crypto_signature_k256_secp256k1")]
pub use k256_secp256k1::{KeyPair, PublicKey};

use std::fmt;
use std::str::FromStr;

#[cfg(feature = "serialize_serde")]
use serde::{Deserialize, Serialize};

use crate::diode::crypto::hash::Digest;
use crate::diode::error::*;

/// A 20 byte identity on the overlay network.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[repr(transparent)]
pub struct Address([u8; Address::LENGTH]);

impl Address {
    pub const LENGTH: usize = 20;

    pub const fn new(inner: [u8; Self::LENGTH]) -> Self {
        Self(inner)
    }

    pub fn from_bytes(raw_bytes: &[u8]) -> Result<Self> {
        if raw_bytes.len() != Self::LENGTH {
            return Err("Address has an invalid length").wrapped(ErrorKind::SignatureInvalid);
        }
        let mut inner = [0; Self::LENGTH];
        inner.copy_from_slice(raw_bytes);
        Ok(Self(inner))
    }

    /// The trailing 20 bytes of a 32 byte word, the form storage
    /// slots and digests carry addresses in.
    pub fn from_word(word: &[u8]) -> Result<Self> {
        if word.len() < Self::LENGTH {
            return Err("Word is too short for an address").wrapped(ErrorKind::SignatureInvalid);
        }
        Self::from_bytes(&word[word.len() - Self::LENGTH..])
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    pub fn into_inner(self) -> [u8; Self::LENGTH] {
        self.0
    }
}

impl From<[u8; Address::LENGTH]> for Address {
    fn from(inner: [u8; Address::LENGTH]) -> Self {
        Self(inner)
    }
}

impl AsRef<[u8]> for Address {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address(0x{})", hex::encode(self.0))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        let raw = hex::decode(s).wrapped(ErrorKind::SignatureInvalid)?;
        Self::from_bytes(&raw)
    }
}

/// A recoverable signature, laid out as `r ‖ s ‖ v` with `v` the
/// recovery id.
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct Signature([u8; Signature::LENGTH]);

#[cfg(feature = "serialize_serde")]
impl Serialize for Signature {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serde_bytes::Bytes::new(&self.0[..]).serialize(serializer)
    }
}

#[cfg(feature = "serialize_serde")]
impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw: serde_bytes::ByteBuf = Deserialize::deserialize(deserializer)?;
        Signature::from_bytes(&raw).map_err(serde::de::Error::custom)
    }
}

impl Signature {
    pub const LENGTH: usize = 65;

    pub fn from_bytes(raw_bytes: &[u8]) -> Result<Self> {
        if raw_bytes.len() != Self::LENGTH {
            return Err("Signature has an invalid length").wrapped(ErrorKind::SignatureInvalid);
        }
        let mut inner = [0; Self::LENGTH];
        inner.copy_from_slice(raw_bytes);
        Ok(Self(inner))
    }

    pub(super) fn from_parts(rs: &[u8; 64], v: u8) -> Self {
        let mut inner = [0; Self::LENGTH];
        inner[..64].copy_from_slice(rs);
        inner[64] = v;
        Self(inner)
    }

    /// Recovers the public key which produced this signature over
    /// the given digest.
    pub fn recover(&self, digest: &Digest) -> Result<PublicKey> {
        k256_secp256k1::recover(digest, &self.0)
    }

    /// Checks that this signature over `digest` was produced by the
    /// key behind `signer`.
    pub fn verify(&self, digest: &Digest, signer: &Address) -> Result<()> {
        let recovered = self.recover(digest)?.address();
        if recovered == *signer {
            Ok(())
        } else {
            Err("Recovered signer does not match").wrapped(ErrorKind::SignatureInvalid)
        }
    }
}

impl AsRef<[u8]> for Signature {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature(0x{})", hex::encode(&self.0[..]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diode::crypto::hash::keccak256;

    fn test_keypair(fill: u8) -> KeyPair {
        let mut scalar = [fill; 32];
        // keep the scalar comfortably inside the curve order
        scalar[0] = 0x01;
        KeyPair::from_secret(&scalar).expect("valid secret scalar")
    }

    #[test]
    fn test_sign_recover_roundtrip() {
        let keys = test_keypair(0xab);
        let digest = keccak256(b"some signed payload");
        let sig = keys.sign_digest(&digest).expect("signing");
        let recovered = sig.recover(&digest).expect("recovery");
        assert_eq!(recovered.address(), keys.address());
        sig.verify(&digest, &keys.address()).expect("verify");
    }

    #[test]
    fn test_verify_rejects_other_signer() {
        let keys = test_keypair(0xab);
        let other = test_keypair(0x77);
        let digest = keccak256(b"some signed payload");
        let sig = keys.sign_digest(&digest).expect("signing");
        assert!(sig.verify(&digest, &other.address()).is_err());
    }

    #[test]
    fn test_address_hex_roundtrip() {
        let keys = test_keypair(0x33);
        let addr = keys.address();
        let parsed: Address = addr.to_string().parse().expect("hex address");
        assert_eq!(parsed, addr);
    }
}
