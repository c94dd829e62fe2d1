//! Verified reads of contract storage, proven against the state
//! roots of the validated chain.
//!
//! The edge server answers `getaccountvalue` with a proof tree: a
//! branch is a two element list hashing to the keccak of its child
//! hashes, a leaf is a `(prefix, modulo, [(key, value)…])` tuple
//! hashing to the keccak of its own encoding. The computed root must
//! match the account root published at the leaf's slot index.

use futures::future::BoxFuture;

use crate::diode::codec::{self, Term};
use crate::diode::crypto::hash::{keccak256, Digest};
use crate::diode::crypto::signature::Address;
use crate::diode::error::*;

/// Chain access used by verified reads. Implemented over the RPC
/// client for real runs, and by canned state in tests.
pub trait ChainReader {
    /// The validated block reads are anchored at.
    fn anchor(&self) -> Result<(u64, Digest)>;

    fn account_value(
        &self,
        block: u64,
        contract: Address,
        key: [u8; 32],
    ) -> BoxFuture<'_, Result<Term>>;

    fn account_roots(&self, block: u64, contract: Address) -> BoxFuture<'_, Result<Vec<Digest>>>;
}

/// Left-pads a storage key to a full 32 byte word.
pub fn pad_key(key: &[u8]) -> [u8; 32] {
    let mut word = [0; 32];
    let len = key.len().min(32);
    word[32 - len..].copy_from_slice(&key[key.len() - len..]);
    word
}

/// Reads one storage slot of `contract` at `block`, checking the
/// merkle proof against the published account roots.
pub async fn get_account_value_raw<C: ChainReader>(
    reader: &C,
    block: u64,
    contract: Address,
    key: &[u8],
) -> Result<Vec<u8>> {
    let key = pad_key(key);
    let proof = reader.account_value(block, contract, key).await?;
    let roots = reader.account_roots(block, contract).await?;

    let walk = walk_proof(&proof, &key)?;
    let (modulo, value) = walk
        .leaf
        .ok_or_else(|| codec::malformed("Proof does not cover the requested key"))?;

    if roots.is_empty() {
        return Err(Error::simple(ErrorKind::BadMerkleProof));
    }
    let expected = roots[modulo as usize % roots.len()];
    if walk.root != expected {
        return Err(Error::simple(ErrorKind::BadMerkleProof));
    }
    Ok(value)
}

struct Walk {
    root: Digest,
    leaf: Option<(u64, Vec<u8>)>,
}

fn walk_proof(node: &Term, key: &[u8; 32]) -> Result<Walk> {
    match node {
        Term::Tuple(fields) if fields.len() == 3 => {
            let modulo = fields[1].as_int()?;
            let mut value = None;
            for pair in fields[2].as_list()? {
                let pair = pair.as_tuple()?;
                if pair.len() != 2 {
                    return Err(codec::malformed("Proof pair has the wrong arity"));
                }
                if pair[0].as_binary()? == key {
                    value = Some(pair[1].as_binary()?.to_vec());
                }
            }
            Ok(Walk {
                root: keccak256(&codec::encode(node)),
                leaf: value.map(|v| (modulo, v)),
            })
        }
        Term::List(children) if children.len() == 2 => {
            let left = walk_proof(&children[0], key)?;
            let right = walk_proof(&children[1], key)?;
            let mut concat = [0; 64];
            concat[..32].copy_from_slice(left.root.as_ref());
            concat[32..].copy_from_slice(right.root.as_ref());
            Ok(Walk {
                root: keccak256(&concat),
                leaf: left.leaf.or(right.leaf),
            })
        }
        _ => Err(codec::malformed("Unrecognized proof node")),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Canned contract state serving every slot from one proof leaf,
    /// the way an honest (or, when asked, a lying) edge would.
    pub(crate) struct MockState {
        pub contract: Address,
        pub slots: Vec<([u8; 32], Vec<u8>)>,
        pub tamper_roots: bool,
    }

    impl MockState {
        pub fn new(contract: Address) -> Self {
            Self {
                contract,
                slots: Vec::new(),
                tamper_roots: false,
            }
        }

        pub fn insert(&mut self, key: [u8; 32], value: Vec<u8>) {
            self.slots.push((key, value));
        }

        fn leaf(&self) -> Term {
            let pairs = self
                .slots
                .iter()
                .map(|(key, value)| {
                    Term::tuple(vec![Term::binary(&key[..]), Term::binary(value.clone())])
                })
                .collect();
            Term::tuple(vec![Term::binary(&b"slot"[..]), Term::int(0), Term::list(pairs)])
        }
    }

    impl ChainReader for MockState {
        fn anchor(&self) -> Result<(u64, Digest)> {
            Ok((777, keccak256(b"anchor")))
        }

        fn account_value(
            &self,
            _block: u64,
            contract: Address,
            _key: [u8; 32],
        ) -> BoxFuture<'_, Result<Term>> {
            Box::pin(async move {
                assert_eq!(contract, self.contract);
                Ok(self.leaf())
            })
        }

        fn account_roots(
            &self,
            _block: u64,
            contract: Address,
        ) -> BoxFuture<'_, Result<Vec<Digest>>> {
            Box::pin(async move {
                assert_eq!(contract, self.contract);
                let root = if self.tamper_roots {
                    keccak256(b"not the root you wanted")
                } else {
                    keccak256(&codec::encode(&self.leaf()))
                };
                Ok(vec![root])
            })
        }
    }

    #[tokio::test]
    async fn test_verified_read() {
        let contract = Address::from([0x42; 20]);
        let mut state = MockState::new(contract);
        let key = pad_key(b"the key");
        state.insert(key, vec![7, 7, 7]);
        let value = get_account_value_raw(&state, 777, contract, b"the key")
            .await
            .expect("verified read");
        assert_eq!(value, vec![7, 7, 7]);
    }

    #[tokio::test]
    async fn test_bad_merkle_proof() {
        let contract = Address::from([0x42; 20]);
        let mut state = MockState::new(contract);
        state.insert(pad_key(&[0]), vec![1]);
        state.tamper_roots = true;
        let err = get_account_value_raw(&state, 777, contract, &[0])
            .await
            .unwrap_err();
        assert!(err.is(&ErrorKind::BadMerkleProof));
    }

    #[test]
    fn test_branch_hashing() {
        let key = pad_key(b"k");
        let leaf = Term::tuple(vec![
            Term::binary(&b"p"[..]),
            Term::int(3),
            Term::list(vec![Term::tuple(vec![
                Term::binary(&key[..]),
                Term::binary(vec![9]),
            ])]),
        ]);
        let sibling = Term::tuple(vec![
            Term::binary(&b"p"[..]),
            Term::int(4),
            Term::list(vec![]),
        ]);
        let branch = Term::list(vec![leaf.clone(), sibling.clone()]);

        let walk = walk_proof(&branch, &key).expect("walk");
        let mut concat = [0; 64];
        concat[..32].copy_from_slice(keccak256(&codec::encode(&leaf)).as_ref());
        concat[32..].copy_from_slice(keccak256(&codec::encode(&sibling)).as_ref());
        assert_eq!(walk.root, keccak256(&concat));
        assert_eq!(walk.leaf, Some((3, vec![9])));
    }
}
