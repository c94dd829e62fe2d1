use k256::ecdsa::{RecoveryId, Signature as EcdsaSignature, SigningKey, VerifyingKey};
use rand_core::OsRng;

use super::{Address, Signature};
use crate::diode::crypto::hash::{keccak256, Digest};
use crate::diode::error::*;

/// A long-lived secp256k1 identity key.
pub struct KeyPair {
    sk: SigningKey,
}

/// An uncompressed secp256k1 public key.
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct PublicKey {
    point: [u8; PublicKey::LENGTH],
}

impl KeyPair {
    /// Generates a fresh random key pair.
    pub fn generate() -> Self {
        let sk = SigningKey::random(&mut OsRng);
        Self { sk }
    }

    /// Loads a key pair from a raw 32 byte secret scalar.
    pub fn from_secret(raw_bytes: &[u8]) -> Result<Self> {
        let sk = SigningKey::from_slice(raw_bytes).wrapped(ErrorKind::SignatureInvalid)?;
        Ok(Self { sk })
    }

    /// Signs the given digest, producing a recoverable signature.
    pub fn sign_digest(&self, digest: &Digest) -> Result<Signature> {
        let (sig, recid) = self
            .sk
            .sign_prehash_recoverable(digest.as_ref())
            .wrapped(ErrorKind::SignatureInvalid)?;
        let mut rs = [0; 64];
        rs.copy_from_slice(&sig.to_bytes());
        Ok(Signature::from_parts(&rs, recid.to_byte()))
    }

    pub fn public_key(&self) -> PublicKey {
        let point = self.sk.verifying_key().to_encoded_point(false);
        let mut inner = [0; PublicKey::LENGTH];
        inner.copy_from_slice(point.as_bytes());
        PublicKey { point: inner }
    }

    pub fn address(&self) -> Address {
        self.public_key().address()
    }
}

impl PublicKey {
    /// Length of the uncompressed SEC1 encoding, tag byte included.
    pub const LENGTH: usize = 65;

    /// Parses an uncompressed SEC1 point, checking it lies on the
    /// curve.
    pub fn from_uncompressed(raw_bytes: &[u8]) -> Result<Self> {
        if raw_bytes.len() != Self::LENGTH || raw_bytes[0] != 0x04 {
            return Err("Expected an uncompressed SEC1 point").wrapped(ErrorKind::SignatureInvalid);
        }
        VerifyingKey::from_sec1_bytes(raw_bytes).wrapped(ErrorKind::SignatureInvalid)?;
        let mut inner = [0; Self::LENGTH];
        inner.copy_from_slice(raw_bytes);
        Ok(Self { point: inner })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.point[..]
    }

    /// The identity derived from this key: the trailing 20 bytes of
    /// the keccak-256 digest of the point body.
    pub fn address(&self) -> Address {
        let digest = keccak256(&self.point[1..]);
        Address::from_word(digest.as_ref()).expect("digest is wider than an address")
    }
}

/// Recovers the public key behind a `r ‖ s ‖ v` signature over a
/// 32 byte digest.
pub(super) fn recover(digest: &Digest, raw_sig: &[u8; Signature::LENGTH]) -> Result<PublicKey> {
    let mut rec_byte = raw_sig[64];

    let mut sig =
        EcdsaSignature::from_slice(&raw_sig[..64]).wrapped(ErrorKind::SignatureInvalid)?;

    // a high-S signature flips the recovery bit once normalized
    if let Some(normalized) = sig.normalize_s() {
        sig = normalized;
        rec_byte ^= 1;
    }

    let recid = RecoveryId::try_from(rec_byte).wrapped(ErrorKind::SignatureInvalid)?;
    let vk = VerifyingKey::recover_from_prehash(digest.as_ref(), &sig, recid)
        .wrapped(ErrorKind::SignatureInvalid)?;

    let point = vk.to_encoded_point(false);
    let mut inner = [0; PublicKey::LENGTH];
    inner.copy_from_slice(point.as_bytes());
    Ok(PublicKey { point: inner })
}
