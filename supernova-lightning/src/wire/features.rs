// SuperNova Lightning Network - Feature Bits
//
// Feature vectors exchanged in `init` and gossip. Bit pairs follow the
// "even is required, odd is optional" rule.

use serde::{Deserialize, Serialize};
use std::fmt;

pub const OPTION_DATA_LOSS_PROTECT_REQ: usize = 0;
pub const OPTION_DATA_LOSS_PROTECT_OPT: usize = 1;
pub const INITIAL_ROUTING_SYNC: usize = 3;
pub const VAR_ONION_OPTIN_REQ: usize = 8;
pub const VAR_ONION_OPTIN_OPT: usize = 9;

/// Bits this implementation understands.
pub const KNOWN_FEATURE_BITS: &[usize] = &[
    OPTION_DATA_LOSS_PROTECT_REQ,
    OPTION_DATA_LOSS_PROTECT_OPT,
    INITIAL_ROUTING_SYNC,
    VAR_ONION_OPTIN_REQ,
    VAR_ONION_OPTIN_OPT,
];

/// Big-endian bit vector; bit 0 is the least significant bit of the last byte.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Features(Vec<u8>);

impl Features {
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    /// Features advertised by this node in `init`.
    pub fn local_init() -> Self {
        let mut features = Self::empty();
        features.set(OPTION_DATA_LOSS_PROTECT_REQ);
        features.set(VAR_ONION_OPTIN_OPT);
        features
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        // Leading zero bytes carry nothing.
        let first = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
        Self(bytes[first..].to_vec())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn set(&mut self, bit: usize) {
        let needed = bit / 8 + 1;
        if self.0.len() < needed {
            let mut grown = vec![0u8; needed - self.0.len()];
            grown.extend_from_slice(&self.0);
            self.0 = grown;
        }
        let idx = self.0.len() - 1 - bit / 8;
        self.0[idx] |= 1 << (bit % 8);
    }

    pub fn has(&self, bit: usize) -> bool {
        let byte = bit / 8;
        if byte >= self.0.len() {
            return false;
        }
        self.0[self.0.len() - 1 - byte] & (1 << (bit % 8)) != 0
    }

    /// Either bit of a pair.
    pub fn supports(&self, required_bit: usize) -> bool {
        self.has(required_bit) || self.has(required_bit + 1)
    }

    pub fn supports_data_loss_protect(&self) -> bool {
        self.supports(OPTION_DATA_LOSS_PROTECT_REQ)
    }

    /// OR two vectors together (global and local features in `init`).
    pub fn union(&self, other: &Features) -> Features {
        let mut out = self.clone();
        for bit in other.set_bits() {
            out.set(bit);
        }
        out
    }

    pub fn set_bits(&self) -> Vec<usize> {
        (0..self.0.len() * 8).filter(|bit| self.has(*bit)).collect()
    }

    /// Required (even) bits we do not understand.
    pub fn unknown_required_bits(&self) -> Vec<usize> {
        self.set_bits()
            .into_iter()
            .filter(|bit| bit % 2 == 0 && !KNOWN_FEATURE_BITS.contains(bit))
            .collect()
    }
}

impl fmt::Debug for Features {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Features({:?})", self.set_bits())
    }
}
