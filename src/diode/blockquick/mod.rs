//! The sliding-window light client proving the honesty of edge
//! servers.
//!
//! Rather than replaying the whole chain, the client keeps a trailing
//! window of headers and weighs each miner by how many of those
//! headers they produced. A new header is trusted once miners holding
//! a majority of the window's weight have built on top of it; the
//! window then slides forward and the newest trusted block is
//! persisted as the anchor for the next run.

use std::collections::{HashMap, VecDeque};

use futures::future::{try_join_all, BoxFuture};
use log::{debug, warn};
#[cfg(feature = "serialize_serde")]
use serde::{Deserialize, Serialize};

use crate::diode::codec::{self, Term};
use crate::diode::crypto::hash::{keccak256, Digest};
use crate::diode::crypto::signature::{Address, Signature};
use crate::diode::error::*;
use crate::diode::store::Store;

/// Number of trusted headers kept in the window.
pub const WINDOW_SIZE: usize = 100;

/// Depth a header must be buried under before it is trusted.
pub const CONFIRMATIONS: usize = 6;

/// The built-in anchor used when the store holds none.
pub const GENESIS_NUMBER: u64 = 360;

/// Hash of the built-in anchor block.
pub const GENESIS_HASH: [u8; 32] = [
    0x6c, 0x92, 0x17, 0x5d, 0x2b, 0xa5, 0x5e, 0x34, 0x96, 0xc3, 0x6b, 0x0a, 0x8c, 0x47, 0x10,
    0xde, 0x83, 0x62, 0xf9, 0xa7, 0x55, 0x21, 0x93, 0xe4, 0x3d, 0xdf, 0x02, 0x9c, 0xa6, 0xff,
    0x08, 0x31,
];

const LAST_VALID_NUMBER_KEY: &[u8] = b"last_valid_block_number";
const LAST_VALID_HASH_KEY: &[u8] = b"last_valid_block_hash";

/// A block header, carrying just enough state to chain, to commit to
/// the world state, and to recover its miner.
#[derive(Clone, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub struct BlockHeader {
    parent_hash: Digest,
    state_root: Digest,
    tx_root: Digest,
    receipt_root: Digest,
    number: u64,
    timestamp: u64,
    nonce: u64,
    miner_signature: Signature,
}

impl BlockHeader {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        parent_hash: Digest,
        state_root: Digest,
        tx_root: Digest,
        receipt_root: Digest,
        number: u64,
        timestamp: u64,
        nonce: u64,
        miner_signature: Signature,
    ) -> Self {
        Self {
            parent_hash,
            state_root,
            tx_root,
            receipt_root,
            number,
            timestamp,
            nonce,
            miner_signature,
        }
    }

    pub fn number(&self) -> u64 {
        self.number
    }

    pub fn parent_hash(&self) -> &Digest {
        &self.parent_hash
    }

    pub fn state_root(&self) -> &Digest {
        &self.state_root
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// The digest the miner signed: every field but the signature.
    pub fn signing_digest(&self) -> Digest {
        let term = Term::tuple(vec![
            Term::binary(self.parent_hash.as_ref()),
            Term::binary(self.state_root.as_ref()),
            Term::binary(self.tx_root.as_ref()),
            Term::binary(self.receipt_root.as_ref()),
            Term::int(self.number),
            Term::int(self.timestamp),
            Term::int(self.nonce),
        ]);
        keccak256(&codec::encode(&term))
    }

    /// The hash committing to the whole header, signature included.
    pub fn hash(&self) -> Digest {
        keccak256(&codec::encode(&self.to_term()))
    }

    /// Recovers the miner identity from the header signature.
    pub fn recover_miner(&self) -> Result<Address> {
        Ok(self.miner_signature.recover(&self.signing_digest())?.address())
    }

    pub fn to_term(&self) -> Term {
        Term::tuple(vec![
            Term::binary(self.parent_hash.as_ref()),
            Term::binary(self.state_root.as_ref()),
            Term::binary(self.tx_root.as_ref()),
            Term::binary(self.receipt_root.as_ref()),
            Term::int(self.number),
            Term::int(self.timestamp),
            Term::int(self.nonce),
            Term::binary(self.miner_signature.as_ref()),
        ])
    }

    pub fn from_term(term: &Term) -> Result<Self> {
        let fields = term.as_tuple()?;
        if fields.len() != 8 {
            return Err(codec::malformed("Header tuple has the wrong arity"));
        }
        Ok(Self {
            parent_hash: Digest::from_bytes(fields[0].as_binary()?)?,
            state_root: Digest::from_bytes(fields[1].as_binary()?)?,
            tx_root: Digest::from_bytes(fields[2].as_binary()?)?,
            receipt_root: Digest::from_bytes(fields[3].as_binary()?)?,
            number: fields[4].as_int()?,
            timestamp: fields[5].as_int()?,
            nonce: fields[6].as_int()?,
            miner_signature: Signature::from_bytes(fields[7].as_binary()?)?,
        })
    }
}

#[derive(Debug)]
struct Entry {
    header: BlockHeader,
    miner: Address,
    hash: Digest,
}

impl Entry {
    fn checked(header: BlockHeader) -> Result<Self> {
        let miner = header.recover_miner()?;
        let hash = header.hash();
        Ok(Self {
            header,
            miner,
            hash,
        })
    }
}

/// The trailing window of trusted headers, plus the tail of headers
/// still gathering confirmations.
#[derive(Debug)]
pub struct Window {
    headers: VecDeque<Entry>,
    pending: VecDeque<Entry>,
    weights: HashMap<Address, u32>,
}

impl Window {
    /// Rebuilds a window from exactly `WINDOW_SIZE` consecutive
    /// headers ending at the trusted anchor, verifying links and
    /// signatures but not quorum.
    pub fn seed(headers: Vec<BlockHeader>) -> Result<Self> {
        if headers.len() != WINDOW_SIZE {
            return Err("Seed is not a full window").wrapped(ErrorKind::SignatureInvalid);
        }
        let mut win = Self {
            headers: VecDeque::with_capacity(WINDOW_SIZE + 1),
            pending: VecDeque::new(),
            weights: HashMap::new(),
        };
        for header in headers {
            win.add_block(header, false)?;
        }
        Ok(win)
    }

    /// Number and hash of the newest trusted header.
    pub fn last(&self) -> (u64, Digest) {
        let tail = self.headers.back().expect("window is never empty");
        (tail.header.number, tail.hash)
    }

    /// Hash of the newest header overall, confirmed or not.
    fn tip_hash(&self) -> Option<Digest> {
        self.pending
            .back()
            .or_else(|| self.headers.back())
            .map(|e| e.hash)
    }

    /// Combined window weight of the distinct miners of the pending
    /// tail.
    fn pending_weight(&self) -> u32 {
        let mut seen = Vec::with_capacity(self.pending.len());
        let mut total = 0;
        for entry in self.pending.iter() {
            if seen.contains(&entry.miner) {
                continue;
            }
            seen.push(entry.miner);
            total += self.weights.get(&entry.miner).copied().unwrap_or(0);
        }
        total
    }

    /// Feeds a candidate header to the window.
    ///
    /// The header must chain onto the current tip and carry a valid
    /// miner signature. With `confirm` set the header joins the
    /// pending tail and trusted headers are promoted by miner quorum;
    /// without it (the anchored seed path) the header joins the
    /// window directly. Returns whether the trusted tail advanced.
    pub fn add_block(&mut self, header: BlockHeader, confirm: bool) -> Result<bool> {
        if let Some(tip) = self.tip_hash() {
            if *header.parent_hash() != tip {
                return Err("Header does not chain onto the tip")
                    .wrapped(ErrorKind::SignatureInvalid);
            }
        }
        let entry = Entry::checked(header)?;
        if !confirm {
            self.push_trusted(entry);
            return Ok(true);
        }

        self.pending.push_back(entry);

        let mut advanced = false;
        while !self.pending.is_empty() && 2 * self.pending_weight() as usize > WINDOW_SIZE {
            let promoted = self.pending.pop_front().expect("pending is non-empty");
            self.push_trusted(promoted);
            advanced = true;
        }
        Ok(advanced)
    }

    fn push_trusted(&mut self, entry: Entry) {
        *self.weights.entry(entry.miner).or_insert(0) += 1;
        self.headers.push_back(entry);
        if self.headers.len() > WINDOW_SIZE {
            let evicted = self.headers.pop_front().expect("window is over capacity");
            if let Some(weight) = self.weights.get_mut(&evicted.miner) {
                *weight -= 1;
                if *weight == 0 {
                    self.weights.remove(&evicted.miner);
                }
            }
        }
    }

    #[cfg(test)]
    fn weight_of(&self, miner: &Address) -> u32 {
        self.weights.get(miner).copied().unwrap_or(0)
    }
}

/// Where validation fetches headers from. Implemented over the RPC
/// client for real runs, and by recorded chains in tests.
pub trait HeaderSource {
    fn block_peak(&self) -> BoxFuture<'_, Result<u64>>;
    fn block_header(&self, number: u64) -> BoxFuture<'_, Result<BlockHeader>>;
    fn block_quick(&self, last_valid: u64, count: u64) -> BoxFuture<'_, Result<Vec<BlockHeader>>>;
}

/// Reads the persisted anchor, falling back to `default` when the
/// records are absent or unreadable.
pub fn restore_last_valid(store: &Store, default: (u64, Digest)) -> (u64, Digest) {
    let number = store
        .get(LAST_VALID_NUMBER_KEY)
        .and_then(|raw| Some(u64::from_be_bytes(raw.try_into().ok()?)));
    let hash = store
        .get(LAST_VALID_HASH_KEY)
        .and_then(|raw| Digest::from_bytes(&raw).ok());
    match (number, hash) {
        (Some(number), Some(hash)) => (number, hash),
        _ => default,
    }
}

/// Persists the anchor.
pub fn store_last_valid(store: &Store, number: u64, hash: &Digest) -> Result<()> {
    store.put(LAST_VALID_NUMBER_KEY, &number.to_be_bytes())?;
    store.put(LAST_VALID_HASH_KEY, hash.as_ref())
}

fn delete_last_valid(store: &Store) -> Result<()> {
    store.delete(LAST_VALID_NUMBER_KEY)?;
    store.delete(LAST_VALID_HASH_KEY)
}

/// Validates the network behind `source` from the persisted anchor,
/// sliding the window up to the confirmed peak and persisting the new
/// anchor.
///
/// On an anchor mismatch the stored anchor is deleted and the call
/// fails with `AnchorLost`; the caller is expected to retry once from
/// `default`.
pub async fn validate_network<S: HeaderSource>(
    source: &S,
    store: &Store,
    default: (u64, Digest),
) -> Result<Window> {
    let (lvbn, lvbh) = restore_last_valid(store, default);
    let first = (lvbn + 1).saturating_sub(WINDOW_SIZE as u64);

    let seed = try_join_all((first..=lvbn).map(|n| source.block_header(n))).await?;
    if seed.len() != WINDOW_SIZE {
        return Err(codec::malformed("Seed window is short"));
    }
    for (offset, header) in seed.iter().enumerate() {
        if header.number() != first + offset as u64 {
            return Err(codec::malformed("Seed header has the wrong number"));
        }
    }

    let anchor = seed.last().expect("seed is a full window").hash();
    if anchor != lvbh {
        warn!(
            "anchor mismatch at block {}: stored {}, served {}",
            lvbn, lvbh, anchor
        );
        delete_last_valid(store)?;
        return Err(Error::simple(ErrorKind::AnchorLost));
    }

    let mut window = Window::seed(seed)?;

    let peak = source.block_peak().await?;
    let horizon = (peak + 1).saturating_sub(CONFIRMATIONS as u64);
    let batch = source
        .block_quick(lvbn, (WINDOW_SIZE + CONFIRMATIONS + 1) as u64)
        .await?;
    for header in batch {
        if header.number() <= window.last().0 {
            continue;
        }
        if header.number() > horizon {
            break;
        }
        window.add_block(header, true)?;
    }

    let (last, last_hash) = window.last();
    if last == lvbn && peak > lvbn + WINDOW_SIZE as u64 {
        return Err(Error::simple(ErrorKind::NoProgress));
    }
    debug!("validated up to block {} ({})", last, last_hash);
    store_last_valid(store, last, &last_hash)?;
    Ok(window)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diode::crypto::signature::KeyPair;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn scratch_dir() -> PathBuf {
        static SEQ: AtomicUsize = AtomicUsize::new(0);
        let n = SEQ.fetch_add(1, Ordering::Relaxed);
        std::env::temp_dir().join(format!("zener-bq-{}-{}", std::process::id(), n))
    }

    fn miner_keys(count: usize) -> Vec<KeyPair> {
        (0..count)
            .map(|i| {
                let mut scalar = [0x11 * (i as u8 + 1); 32];
                scalar[0] = 0x01;
                KeyPair::from_secret(&scalar).expect("valid scalar")
            })
            .collect()
    }

    fn signed_header(parent: Digest, number: u64, keys: &KeyPair) -> BlockHeader {
        let zero_sig = Signature::from_bytes(&[0; Signature::LENGTH]).unwrap();
        let draft = BlockHeader::new(
            parent,
            keccak256(b"state"),
            keccak256(b"tx"),
            keccak256(b"receipt"),
            number,
            1700000000 + number,
            number ^ 0x5a,
            zero_sig,
        );
        let sig = keys.sign_digest(&draft.signing_digest()).expect("sign");
        BlockHeader::new(
            *draft.parent_hash(),
            *draft.state_root(),
            keccak256(b"tx"),
            keccak256(b"receipt"),
            number,
            1700000000 + number,
            number ^ 0x5a,
            sig,
        )
    }

    fn make_chain(keys: &[KeyPair], start: u64, len: usize) -> Vec<BlockHeader> {
        let mut parent = keccak256(b"genesis parent");
        let mut chain = Vec::with_capacity(len);
        for offset in 0..len {
            let number = start + offset as u64;
            let header = signed_header(parent, number, &keys[offset % keys.len()]);
            parent = header.hash();
            chain.push(header);
        }
        chain
    }

    struct MockChain {
        headers: Vec<BlockHeader>,
    }

    impl MockChain {
        fn find(&self, number: u64) -> Option<&BlockHeader> {
            self.headers.iter().find(|h| h.number() == number)
        }
    }

    impl HeaderSource for MockChain {
        fn block_peak(&self) -> BoxFuture<'_, Result<u64>> {
            Box::pin(async move {
                Ok(self.headers.last().expect("non-empty chain").number())
            })
        }

        fn block_header(&self, number: u64) -> BoxFuture<'_, Result<BlockHeader>> {
            Box::pin(async move {
                self.find(number)
                    .cloned()
                    .ok_or_else(|| Error::simple(ErrorKind::NoProgress))
            })
        }

        fn block_quick(
            &self,
            last_valid: u64,
            count: u64,
        ) -> BoxFuture<'_, Result<Vec<BlockHeader>>> {
            Box::pin(async move {
                Ok(self
                    .headers
                    .iter()
                    .filter(|h| h.number() > last_valid)
                    .take(count as usize)
                    .cloned()
                    .collect())
            })
        }
    }

    #[test]
    fn test_header_term_roundtrip() {
        let keys = miner_keys(1);
        let header = signed_header(keccak256(b"p"), 42, &keys[0]);
        let decoded = BlockHeader::from_term(&header.to_term()).expect("decode");
        assert_eq!(decoded, header);
        assert_eq!(decoded.hash(), header.hash());
    }

    #[test]
    fn test_window_links_and_signatures() {
        let keys = miner_keys(4);
        let chain = make_chain(&keys, 1000, WINDOW_SIZE);
        let window = Window::seed(chain.clone()).expect("seed");
        let (number, hash) = window.last();
        assert_eq!(number, chain.last().unwrap().number());
        assert_eq!(hash, chain.last().unwrap().hash());
        // four miners round-robin over one hundred slots
        assert_eq!(window.weight_of(&keys[0].address()), 25);
    }

    #[test]
    fn test_window_rejects_broken_link() {
        let keys = miner_keys(2);
        let mut chain = make_chain(&keys, 1000, WINDOW_SIZE);
        chain[50] = signed_header(keccak256(b"elsewhere"), 1050, &keys[0]);
        assert!(Window::seed(chain).is_err());
    }

    #[test]
    fn test_quorum_promotion_slides_window() {
        // a single miner owns the whole window, so every candidate
        // meets quorum on arrival and promotes immediately
        let keys = miner_keys(1);
        let chain = make_chain(&keys, 1000, WINDOW_SIZE + 2);
        let mut window = Window::seed(chain[..WINDOW_SIZE].to_vec()).expect("seed");
        let before = window.last().0;

        for (extra, header) in chain[WINDOW_SIZE..].iter().enumerate() {
            let advanced = window.add_block(header.clone(), true).expect("add");
            assert!(advanced);
            assert_eq!(window.last().0, before + 1 + extra as u64);
        }
    }

    #[test]
    fn test_quorum_waits_for_second_miner() {
        // two miners split the window evenly; one candidate holds
        // exactly half the weight, which is not a majority
        let keys = miner_keys(2);
        let chain = make_chain(&keys, 1000, WINDOW_SIZE + 2);
        let mut window = Window::seed(chain[..WINDOW_SIZE].to_vec()).expect("seed");
        let before = window.last().0;

        let advanced = window
            .add_block(chain[WINDOW_SIZE].clone(), true)
            .expect("add");
        assert!(!advanced);
        assert_eq!(window.last().0, before);

        // the second candidate brings the other miner in, and both
        // pending headers promote
        let advanced = window
            .add_block(chain[WINDOW_SIZE + 1].clone(), true)
            .expect("add");
        assert!(advanced);
        assert_eq!(window.last().0, before + 2);
    }

    #[tokio::test]
    async fn test_validate_from_recorded_anchor() {
        let keys = miner_keys(3);
        let chain = make_chain(&keys, 500, WINDOW_SIZE + 30);
        let anchored = &chain[WINDOW_SIZE - 1];
        let dir = scratch_dir();
        let store = Store::open(&dir).expect("store");
        store_last_valid(&store, anchored.number(), &anchored.hash()).expect("anchor");

        let mock = MockChain { headers: chain.clone() };
        let default = (GENESIS_NUMBER, Digest::from(GENESIS_HASH));
        let window = validate_network(&mock, &store, default)
            .await
            .expect("validation");

        let (last, _) = window.last();
        assert!(last >= anchored.number());
        // the persisted anchor moved with the window
        let (stored, _) = restore_last_valid(&store, default);
        assert_eq!(stored, last);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_anchor_mismatch_recovers_once() {
        let keys = miner_keys(3);
        let chain = make_chain(&keys, 500, WINDOW_SIZE + 30);
        let anchored = &chain[WINDOW_SIZE - 1];
        let dir = scratch_dir();
        let store = Store::open(&dir).expect("store");
        // a stored hash the served chain never produced
        store_last_valid(&store, anchored.number(), &keccak256(b"stale fork")).expect("anchor");

        let mock = MockChain { headers: chain.clone() };
        // the fallback anchor matches the recorded chain
        let default = (anchored.number(), anchored.hash());

        let err = validate_network(&mock, &store, default).await.unwrap_err();
        assert!(err.is(&ErrorKind::AnchorLost));

        // the bad anchor was deleted; the retry starts from the
        // default and succeeds
        let window = validate_network(&mock, &store, default)
            .await
            .expect("second validation");
        assert!(window.last().0 >= anchored.number());
        std::fs::remove_dir_all(&dir).ok();
    }
}
