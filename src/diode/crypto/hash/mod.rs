//! Hash primitives for block commitments, ticket digests and
//! storage slot derivation.

#[cfg(feature = "crypto_hash_sha3_keccak")]
mod sha3_keccak;

#[cfg(feature = "crypto_hash_sha3_keccak")]
pub use sha3_keccak::keccak256;

use std::fmt;

#[cfg(feature = "serialize_serde")]
use serde::{Deserialize, Serialize};

use crate::diode::error::*;

/// A 32 byte digest.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[repr(transparent)]
pub struct Digest([u8; Digest::LENGTH]);

impl Digest {
    pub const LENGTH: usize = 32;

    pub fn from_bytes(raw_bytes: &[u8]) -> Result<Self> {
        if raw_bytes.len() < Self::LENGTH {
            return Err("Digest has an invalid length").wrapped(ErrorKind::SignatureInvalid);
        }
        let mut inner = [0; Self::LENGTH];
        inner.copy_from_slice(&raw_bytes[..Self::LENGTH]);
        Ok(Self(inner))
    }

    pub fn into_inner(self) -> [u8; Self::LENGTH] {
        self.0
    }
}

impl From<[u8; Digest::LENGTH]> for Digest {
    fn from(inner: [u8; Digest::LENGTH]) -> Self {
        Self(inner)
    }
}

impl AsRef<[u8]> for Digest {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest(0x{})", hex::encode(self.0))
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keccak_well_known() {
        // keccak256 of the empty input
        let d = keccak256(&[]);
        let expect = "c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470";
        assert_eq!(hex::encode(d.as_ref()), expect);
    }

    #[test]
    fn test_digest_length_check() {
        assert!(Digest::from_bytes(&[0; 31][..]).is_err());
        assert!(Digest::from_bytes(&[0; 32][..]).is_ok());
    }
}
