use sha3::{Digest as _, Keccak256};

use super::Digest;

/// Computes the keccak-256 digest of `data`.
pub fn keccak256(data: &[u8]) -> Digest {
    let mut state = Keccak256::new();
    state.update(data);
    let out: [u8; Digest::LENGTH] = state.finalize().into();
    Digest::from(out)
}
