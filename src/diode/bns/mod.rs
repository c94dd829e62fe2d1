//! Name resolution against the on-chain registry contract.
//!
//! Entries live in Solidity mappings, so every lookup boils down to
//! a handful of storage slots derived with `keccak256(key ‖ slot)`,
//! each read through a verified account read at the last validated
//! block.

use crate::diode::chain::{get_account_value_raw, pad_key, ChainReader};
use crate::diode::codec;
use crate::diode::crypto::hash::keccak256;
use crate::diode::crypto::signature::Address;
use crate::diode::error::*;

/// The registry contract address.
pub const BNS_CONTRACT: Address = Address::new([
    0xac, 0x0a, 0x3e, 0x5d, 0x91, 0x44, 0x7e, 0x8f, 0x2c, 0x60, 0x5b, 0xd2, 0x1f, 0x07, 0x76,
    0xee, 0xc9, 0x4a, 0x33, 0x58,
]);

/// Longest destination array a single entry may carry.
pub const MAX_DESTINATIONS: u64 = 128;

// storage layout: name entries in the mapping at slot 0 (destination
// word, then owner, then the destination array), reverse names in
// the mapping at slot 1
const ENTRY_SLOT: u64 = 0;
const REVERSE_SLOT: u64 = 1;

/// Slot of the single-destination word of `name`.
pub fn bns_entry_location(name: &str) -> [u8; 32] {
    mapping_slot(name.as_bytes(), ENTRY_SLOT)
}

/// Slot of the owner word of `name`.
pub fn bns_owner_location(name: &str) -> [u8; 32] {
    slot_add(&bns_entry_location(name), 1)
}

/// Slot of the destination array length of `name`; elements start at
/// `keccak256(length slot)`.
pub fn bns_destination_array_location(name: &str) -> [u8; 32] {
    slot_add(&bns_entry_location(name), 2)
}

/// Slot of the reverse entry of `addr`.
pub fn bns_reverse_entry_location(addr: &Address) -> [u8; 32] {
    mapping_slot(&pad_key(addr.as_ref()), REVERSE_SLOT)
}

fn mapping_slot(key: &[u8], slot: u64) -> [u8; 32] {
    let mut preimage = Vec::with_capacity(key.len() + 32);
    preimage.extend_from_slice(key);
    preimage.extend_from_slice(&pad_key(&slot.to_be_bytes()));
    keccak256(&preimage).into_inner()
}

fn slot_add(slot: &[u8; 32], n: u64) -> [u8; 32] {
    let mut out = *slot;
    let mut carry = n;
    for byte in out.iter_mut().rev() {
        if carry == 0 {
            break;
        }
        let sum = *byte as u64 + (carry & 0xff);
        *byte = sum as u8;
        carry = (carry >> 8) + (sum >> 8);
    }
    out
}

fn check_name(name: &str) -> Result<()> {
    let well_formed = !name.is_empty()
        && name.len() <= 32
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-');
    if well_formed {
        Ok(())
    } else {
        Err("Not a registrable name").wrapped(ErrorKind::EmptyBnsResult)
    }
}

fn word_address(raw: &[u8]) -> Result<Address> {
    Address::from_word(&pad_key(raw))
}

/// Resolves `name` to its destination addresses, in registry order.
///
/// Multi-destination entries take precedence over the single
/// destination word; a name with neither yields `EmptyBnsResult`.
pub async fn resolve_bns<C: ChainReader>(reader: &C, name: &str) -> Result<Vec<Address>> {
    check_name(name)?;
    let (block, _) = reader.anchor()?;

    let length_slot = bns_destination_array_location(name);
    let raw_len = get_account_value_raw(reader, block, BNS_CONTRACT, &length_slot).await?;
    let length = word_int(&raw_len);
    if length > MAX_DESTINATIONS {
        return Err(codec::malformed("Destination array length is out of bounds"));
    }

    if length > 0 {
        let base = keccak256(&length_slot).into_inner();
        let mut destinations = Vec::with_capacity(length as usize);
        for i in 0..length {
            let slot = slot_add(&base, i);
            let raw = get_account_value_raw(reader, block, BNS_CONTRACT, &slot).await?;
            let addr = word_address(&raw)?;
            if !addr.is_zero() {
                destinations.push(addr);
            }
        }
        if !destinations.is_empty() {
            return Ok(destinations);
        }
    }

    let raw = get_account_value_raw(reader, block, BNS_CONTRACT, &bns_entry_location(name)).await?;
    let addr = word_address(&raw)?;
    if addr.is_zero() {
        return Err(Error::simple(ErrorKind::EmptyBnsResult));
    }
    Ok(vec![addr])
}

/// Resolves the owner identity of `name`.
pub async fn resolve_owner<C: ChainReader>(reader: &C, name: &str) -> Result<Address> {
    check_name(name)?;
    let (block, _) = reader.anchor()?;
    let raw = get_account_value_raw(reader, block, BNS_CONTRACT, &bns_owner_location(name)).await?;
    let addr = word_address(&raw)?;
    if addr.is_zero() {
        return Err(Error::simple(ErrorKind::EmptyBnsResult));
    }
    Ok(addr)
}

/// Resolves `addr` back to its registered name.
pub async fn resolve_reverse<C: ChainReader>(reader: &C, addr: &Address) -> Result<String> {
    let (block, _) = reader.anchor()?;
    let slot = bns_reverse_entry_location(addr);
    let raw = get_account_value_raw(reader, block, BNS_CONTRACT, &slot).await?;
    let word = pad_key(&raw);

    // Solidity packs short strings into the entry slot with a
    // doubled length tag; an odd tag marks a multi-slot string.
    // TODO: follow the continuation slots at keccak256(slot) instead
    // of truncating long names at 30 bytes
    let tag = word[31] as usize;
    let len = if tag % 2 == 0 {
        (tag / 2).min(31)
    } else {
        (tag / 2).min(30)
    };
    if len == 0 {
        return Err(Error::simple(ErrorKind::EmptyBnsResult));
    }
    String::from_utf8(word[..len].to_vec()).simple(ErrorKind::MalformedFrame)
}

fn word_int(raw: &[u8]) -> u64 {
    let word = pad_key(raw);
    u64::from_be_bytes(word[24..].try_into().expect("eight trailing bytes"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diode::chain::tests::MockState;

    fn registry() -> MockState {
        MockState::new(BNS_CONTRACT)
    }

    fn word_of(addr: &Address) -> Vec<u8> {
        pad_key(addr.as_ref()).to_vec()
    }

    #[tokio::test]
    async fn test_resolve_destination_array() {
        let mut state = registry();
        let length_slot = bns_destination_array_location("pi");
        let mut length_word = [0; 32];
        length_word[31] = 2;
        state.insert(length_slot, length_word.to_vec());

        let first = Address::from([0xaa; 20]);
        let second = Address::from([0xbb; 20]);
        let base = keccak256(&length_slot).into_inner();
        state.insert(slot_add(&base, 0), word_of(&first));
        state.insert(slot_add(&base, 1), word_of(&second));

        let resolved = resolve_bns(&state, "pi").await.expect("resolution");
        assert_eq!(resolved, vec![first, second]);
    }

    #[tokio::test]
    async fn test_resolve_single_entry_fallback() {
        let mut state = registry();
        state.insert(bns_destination_array_location("solo"), vec![0; 32]);
        let only = Address::from([0xcc; 20]);
        state.insert(bns_entry_location("solo"), word_of(&only));

        let resolved = resolve_bns(&state, "solo").await.expect("resolution");
        assert_eq!(resolved, vec![only]);
    }

    #[tokio::test]
    async fn test_resolve_empty_entry() {
        let mut state = registry();
        state.insert(bns_destination_array_location("ghost"), vec![0; 32]);
        state.insert(bns_entry_location("ghost"), vec![0; 32]);

        let err = resolve_bns(&state, "ghost").await.unwrap_err();
        assert!(err.is(&ErrorKind::EmptyBnsResult));
    }

    #[tokio::test]
    async fn test_rejects_oversized_array() {
        let mut state = registry();
        let mut length_word = [0; 32];
        length_word[31] = 200;
        state.insert(bns_destination_array_location("plenty"), length_word.to_vec());

        let err = resolve_bns(&state, "plenty").await.unwrap_err();
        assert!(err.is(&ErrorKind::MalformedFrame));
    }

    #[tokio::test]
    async fn test_reverse_short_string() {
        let mut state = registry();
        let addr = Address::from([0xdd; 20]);
        let mut word = [0; 32];
        word[..2].copy_from_slice(b"pi");
        word[31] = 4; // 2 * len, even tag
        state.insert(bns_reverse_entry_location(&addr), word.to_vec());

        let name = resolve_reverse(&state, &addr).await.expect("reverse");
        assert_eq!(name, "pi");
    }

    #[tokio::test]
    async fn test_reverse_odd_tag_truncates() {
        let mut state = registry();
        let addr = Address::from([0xee; 20]);
        let mut word = [b'x'; 32];
        word[31] = 99; // odd: a 49 byte name stored across slots
        state.insert(bns_reverse_entry_location(&addr), word.to_vec());

        let name = resolve_reverse(&state, &addr).await.expect("reverse");
        assert_eq!(name.len(), 30);
    }

    #[test]
    fn test_name_validation() {
        assert!(check_name("pi").is_ok());
        assert!(check_name("a-2").is_ok());
        assert!(check_name("").is_err());
        assert!(check_name("Big").is_err());
        assert!(check_name("dot.ted").is_err());
    }
}
