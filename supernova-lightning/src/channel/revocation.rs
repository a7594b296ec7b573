// SuperNova Lightning Network - Revocation Secrets
//
// Per-commitment secrets are derived from a single seed with the shachain
// construction, so the counterparty can store every secret we ever reveal
// in at most 49 entries.

use crate::digest::sha256;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::Zeroizing;

/// Index of the first commitment secret; indices count down from here.
pub const START_INDEX: u64 = (1 << 48) - 1;

const MAX_ENTRIES: usize = 49;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RevocationError {
    #[error("Secret for index {index} does not derive the secret stored at index {stored}")]
    Inconsistent { index: u64, stored: u64 },

    #[error("Revocation index {0} out of range")]
    IndexOutOfRange(u64),
}

/// Shachain index used for commitment number `n`.
pub fn commitment_index(commitment_number: u64) -> u64 {
    START_INDEX - commitment_number
}

fn derive(base: [u8; 32], bits: u32, index: u64) -> [u8; 32] {
    let mut value = base;
    for bit in (0..bits).rev() {
        if (index >> bit) & 1 == 1 {
            value[(bit / 8) as usize] ^= 1 << (bit % 8);
            value = sha256(&value).0;
        }
    }
    value
}

/// Secret for `index` generated from our own seed.
pub fn per_commitment_secret(seed: &[u8; 32], index: u64) -> [u8; 32] {
    derive(*seed, 48, index)
}

/// Public commitment point for a secret. Points are opaque here, so a hash
/// commitment to the secret is enough for the counterparty to check a
/// later revocation.
pub fn per_commitment_point(secret: &[u8; 32]) -> [u8; 32] {
    sha256(secret).0
}

/// Our seed, wiped from memory on drop.
#[derive(Clone)]
pub struct RevocationSeed(Zeroizing<[u8; 32]>);

impl RevocationSeed {
    pub fn new(seed: [u8; 32]) -> Self {
        Self(Zeroizing::new(seed))
    }

    pub fn secret(&self, commitment_number: u64) -> [u8; 32] {
        per_commitment_secret(&self.0, commitment_index(commitment_number))
    }

    pub fn point(&self, commitment_number: u64) -> [u8; 32] {
        per_commitment_point(&self.secret(commitment_number))
    }
}

impl std::fmt::Debug for RevocationSeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RevocationSeed(..)")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct Entry {
    secret: [u8; 32],
    index: u64,
}

impl Default for RevocationStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Compact store of the secrets revealed by the counterparty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevocationStore {
    known: Vec<Option<Entry>>,
    /// Index expected next; counts down from `START_INDEX`.
    next_index: Option<u64>,
}

impl RevocationStore {
    pub fn new() -> Self {
        Self {
            known: vec![None; MAX_ENTRIES],
            next_index: Some(START_INDEX),
        }
    }

    /// Number of secrets accepted so far.
    pub fn len(&self) -> u64 {
        match self.next_index {
            Some(next) => START_INDEX - next,
            None => START_INDEX + 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Add the secret for the next index, checking it against everything
    /// already stored.
    pub fn insert(&mut self, secret: [u8; 32]) -> Result<(), RevocationError> {
        let index = self
            .next_index
            .ok_or(RevocationError::IndexOutOfRange(0))?;
        let position = (index.trailing_zeros() as usize).min(48);

        for entry in self.known[..position].iter().flatten() {
            if derive(secret, position as u32, entry.index) != entry.secret {
                return Err(RevocationError::Inconsistent {
                    index,
                    stored: entry.index,
                });
            }
        }

        self.known[position] = Some(Entry { secret, index });
        self.next_index = index.checked_sub(1);
        Ok(())
    }

    /// Recover a previously revealed secret.
    pub fn lookup(&self, index: u64) -> Option<[u8; 32]> {
        for (position, entry) in self.known.iter().enumerate() {
            let Some(entry) = entry else { continue };
            let mask = !((1u64 << position) - 1);
            if index & mask == entry.index {
                return Some(derive(entry.secret, position as u32, index));
            }
        }
        None
    }

    /// Secret the counterparty revealed for commitment `n`.
    pub fn secret_for_commitment(&self, commitment_number: u64) -> Option<[u8; 32]> {
        if commitment_number >= self.len() {
            return None;
        }
        self.lookup(commitment_index(commitment_number))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_hex(s: &str) -> [u8; 32] {
        let mut out = [0u8; 32];
        out.copy_from_slice(&hex::decode(s).unwrap());
        out
    }

    #[test]
    fn test_generation_vectors() {
        // BOLT-3 appendix D generation tests
        let zero = [0u8; 32];
        assert_eq!(
            hex::encode(per_commitment_secret(&zero, 281474976710655)),
            "02a40c85b6f28da08dfdbe0926c53fab2de6d28c10301f8f7c4073d5e42e3148"
        );

        let ones = [0xffu8; 32];
        assert_eq!(
            hex::encode(per_commitment_secret(&ones, 281474976710655)),
            "7cc854b54e3e0dcdb010d7a3fee464a9687be6e8db3be6854c475621e007a5dc"
        );
        assert_eq!(
            hex::encode(per_commitment_secret(&ones, 0xaaaaaaaaaaa)),
            "56f4008fb007ca9acf0e15b054d5c9fd12ee06cea347914ddbaed70d1c13a528"
        );

        let seed = from_hex("0101010101010101010101010101010101010101010101010101010101010101");
        assert_eq!(
            hex::encode(per_commitment_secret(&seed, 1)),
            "915c75942a26bb3a433a8ce2cb0427c29ec6c1775cfc78328b57f6ba7bfeaa9c"
        );
    }

    #[test]
    fn test_store_accepts_consistent_secrets() {
        let seed = RevocationSeed::new([0x5a; 32]);
        let mut store = RevocationStore::new();
        for n in 0..100 {
            store.insert(seed.secret(n)).unwrap();
        }
        assert_eq!(store.len(), 100);
        for n in 0..100 {
            assert_eq!(store.secret_for_commitment(n), Some(seed.secret(n)));
        }
        assert_eq!(store.secret_for_commitment(100), None);
        assert!(store.known.iter().flatten().count() <= MAX_ENTRIES);
    }

    #[test]
    fn test_store_rejects_secret_from_another_chain() {
        let seed = RevocationSeed::new([0x5a; 32]);
        let other = RevocationSeed::new([0x33; 32]);
        let mut store = RevocationStore::new();
        store.insert(seed.secret(0)).unwrap();
        // Index 2^48 - 2 has one trailing zero, so it must derive commitment 0's secret.
        let result = store.insert(other.secret(1));
        assert!(matches!(result, Err(RevocationError::Inconsistent { .. })));
        assert_eq!(store.len(), 1);
    }
}
