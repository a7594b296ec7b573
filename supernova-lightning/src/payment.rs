//! Lightning Network Payment Primitives
//!
//! Payment hashes, preimages and the failure codes that travel back
//! upstream in `update_fail_htlc`.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use subtle::ConstantTimeEq;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PaymentError {
    #[error("Invalid hex encoding: {0}")]
    InvalidHex(String),

    #[error("Expected 32 bytes, got {0}")]
    InvalidLength(usize),
}

/// Payment hash - SHA256 hash of payment preimage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PaymentHash([u8; 32]);

impl fmt::Display for PaymentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl PaymentHash {
    pub fn new(hash: [u8; 32]) -> Self {
        Self(hash)
    }

    pub fn into_inner(self) -> [u8; 32] {
        self.0
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(hex_str: &str) -> Result<Self, PaymentError> {
        decode_32(hex_str).map(Self)
    }
}

/// Payment preimage - 32 bytes of random data
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentPreimage([u8; 32]);

impl fmt::Debug for PaymentPreimage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print the secret itself.
        write!(f, "PaymentPreimage(for {})", self.payment_hash())
    }
}

impl PaymentPreimage {
    pub fn new(preimage: [u8; 32]) -> Self {
        Self(preimage)
    }

    pub fn new_random() -> Self {
        let mut preimage = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut preimage);
        Self(preimage)
    }

    pub fn into_inner(self) -> [u8; 32] {
        self.0
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Generate payment hash from this preimage
    pub fn payment_hash(&self) -> PaymentHash {
        PaymentHash(Sha256::digest(self.0).into())
    }

    /// Constant-time check that this preimage hashes to `hash`.
    pub fn matches(&self, hash: &PaymentHash) -> bool {
        self.payment_hash().0.ct_eq(&hash.0).into()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(hex_str: &str) -> Result<Self, PaymentError> {
        decode_32(hex_str).map(Self)
    }
}

fn decode_32(hex_str: &str) -> Result<[u8; 32], PaymentError> {
    let bytes = hex::decode(hex_str).map_err(|e| PaymentError::InvalidHex(e.to_string()))?;
    if bytes.len() != 32 {
        return Err(PaymentError::InvalidLength(bytes.len()));
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Ok(out)
}

/// Payment status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentStatus {
    /// Payment is pending
    Pending,
    /// Payment completed successfully
    Succeeded,
    /// Payment failed
    Failed(FailureReason),
}

const BADONION: u16 = 0x8000;
const PERM: u16 = 0x4000;
const UPDATE: u16 = 0x1000;

/// Failure codes carried in `update_fail_htlc`.
///
/// Values follow the BOLT-4 numbering so that a reason decoded from the wire
/// can be shown to the payer verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureCode {
    TemporaryNodeFailure,
    PermanentChannelFailure,
    UnknownNextPeer,
    TemporaryChannelFailure,
    AmountBelowMinimum,
    FeeInsufficient,
    IncorrectCltvExpiry,
    ExpiryTooSoon,
    IncorrectOrUnknownPaymentDetails,
    FinalIncorrectCltvExpiry,
    FinalIncorrectHtlcAmount,
    InvalidOnionPayload,
}

impl FailureCode {
    pub fn to_u16(self) -> u16 {
        match self {
            FailureCode::TemporaryNodeFailure => 0x2000 | 2,
            FailureCode::PermanentChannelFailure => PERM | 8,
            FailureCode::UnknownNextPeer => PERM | 10,
            FailureCode::TemporaryChannelFailure => UPDATE | 7,
            FailureCode::AmountBelowMinimum => UPDATE | 11,
            FailureCode::FeeInsufficient => UPDATE | 12,
            FailureCode::IncorrectCltvExpiry => UPDATE | 13,
            FailureCode::ExpiryTooSoon => UPDATE | 14,
            FailureCode::IncorrectOrUnknownPaymentDetails => PERM | 15,
            FailureCode::FinalIncorrectCltvExpiry => 18,
            FailureCode::FinalIncorrectHtlcAmount => 19,
            FailureCode::InvalidOnionPayload => PERM | 22,
        }
    }

    pub fn from_u16(code: u16) -> Option<Self> {
        let all = [
            FailureCode::TemporaryNodeFailure,
            FailureCode::PermanentChannelFailure,
            FailureCode::UnknownNextPeer,
            FailureCode::TemporaryChannelFailure,
            FailureCode::AmountBelowMinimum,
            FailureCode::FeeInsufficient,
            FailureCode::IncorrectCltvExpiry,
            FailureCode::ExpiryTooSoon,
            FailureCode::IncorrectOrUnknownPaymentDetails,
            FailureCode::FinalIncorrectCltvExpiry,
            FailureCode::FinalIncorrectHtlcAmount,
            FailureCode::InvalidOnionPayload,
        ];
        all.into_iter().find(|c| c.to_u16() == code)
    }

    /// Permanent failures should not be retried over the same route.
    pub fn is_permanent(self) -> bool {
        self.to_u16() & PERM != 0 && self.to_u16() & BADONION == 0
    }
}

impl fmt::Display for FailureCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            FailureCode::TemporaryNodeFailure => "temporary node failure",
            FailureCode::PermanentChannelFailure => "permanent channel failure",
            FailureCode::UnknownNextPeer => "unknown next peer",
            FailureCode::TemporaryChannelFailure => "temporary channel failure",
            FailureCode::AmountBelowMinimum => "amount below minimum",
            FailureCode::FeeInsufficient => "fee insufficient",
            FailureCode::IncorrectCltvExpiry => "incorrect cltv expiry",
            FailureCode::ExpiryTooSoon => "expiry too soon",
            FailureCode::IncorrectOrUnknownPaymentDetails => "incorrect or unknown payment details",
            FailureCode::FinalIncorrectCltvExpiry => "final incorrect cltv expiry",
            FailureCode::FinalIncorrectHtlcAmount => "final incorrect htlc amount",
            FailureCode::InvalidOnionPayload => "invalid onion payload",
        };
        f.write_str(text)
    }
}

/// Why a payment failed, as far as the payer can tell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    /// A hop reported a recognised failure code.
    Remote(FailureCode),
    /// The failing hop gave no usable reason.
    Unspecified,
}

impl FailureReason {
    /// Encode as the `reason` field of `update_fail_htlc`.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            FailureReason::Remote(code) => code.to_u16().to_be_bytes().to_vec(),
            FailureReason::Unspecified => Vec::new(),
        }
    }

    pub fn decode(reason: &[u8]) -> Self {
        if reason.len() < 2 {
            return FailureReason::Unspecified;
        }
        FailureCode::from_u16(u16::from_be_bytes([reason[0], reason[1]]))
            .map(FailureReason::Remote)
            .unwrap_or(FailureReason::Unspecified)
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Remote(code) => write!(f, "{}", code),
            FailureReason::Unspecified => f.write_str("payment failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preimage_matches_its_hash() {
        let preimage = PaymentPreimage::new_random();
        let hash = preimage.payment_hash();
        assert!(preimage.matches(&hash));
        assert!(!PaymentPreimage::new([7u8; 32]).matches(&hash));
    }

    #[test]
    fn test_hash_hex_roundtrip() {
        let hash = PaymentPreimage::new([1u8; 32]).payment_hash();
        assert_eq!(PaymentHash::from_hex(&hash.to_hex()).unwrap(), hash);
        assert_eq!(PaymentHash::from_hex("abcd"), Err(PaymentError::InvalidLength(2)));
    }

    #[test]
    fn test_failure_reason_wire_form() {
        let reason = FailureReason::Remote(FailureCode::UnknownNextPeer);
        assert_eq!(FailureReason::decode(&reason.encode()), reason);
        assert_eq!(FailureReason::decode(&[]), FailureReason::Unspecified);
        assert_eq!(FailureReason::decode(&[0xff, 0xff]), FailureReason::Unspecified);
        assert!(FailureCode::IncorrectOrUnknownPaymentDetails.is_permanent());
        assert!(!FailureCode::TemporaryChannelFailure.is_permanent());
    }
}
