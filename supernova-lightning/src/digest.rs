// SuperNova Lightning Network - Hash Helpers
//
// SHA-256 wrappers shared by invoices, commitments and gossip signatures.

use secp256k1::{Message, ThirtyTwoByteHash};
use sha2::{Digest, Sha256};

/// A 32-byte digest that can be signed directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hash32(pub [u8; 32]);

impl ThirtyTwoByteHash for Hash32 {
    fn into_32(self) -> [u8; 32] {
        self.0
    }
}

impl Hash32 {
    pub fn to_message(self) -> Message {
        Message::from(self)
    }
}

pub fn sha256(data: &[u8]) -> Hash32 {
    Hash32(Sha256::digest(data).into())
}

pub fn sha256d(data: &[u8]) -> Hash32 {
    Hash32(Sha256::digest(Sha256::digest(data)).into())
}
